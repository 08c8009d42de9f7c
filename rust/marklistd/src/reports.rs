use crate::calc::{CalcError, MeanValue};
use crate::marklist::{ExamInfo, MarkList};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardLine {
    pub code: String,
    pub name: String,
    pub mark: Option<i64>,
    pub level: String,
    pub class_mean: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub exam: ExamInfo,
    pub student_id: i64,
    pub name: String,
    pub class: String,
    pub lines: Vec<CardLine>,
    pub total_marks: i64,
    pub total_level: String,
    pub position: i64,
    pub class_size: usize,
    pub class_total_mean: f64,
    pub class_total_mean_deviation: MeanValue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsMessage {
    pub student_id: i64,
    pub name: String,
    pub text: String,
}

pub fn student_class(conn: &Connection, student_id: i64) -> Result<String, CalcError> {
    conn.query_row(
        "SELECT class FROM students WHERE student_id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(CalcError::query)?
    .ok_or_else(|| {
        CalcError::not_found("student not found").with_details(json!({ "studentId": student_id }))
    })
}

/// Single-student projection of a class mark list.
pub fn student_card(list: &MarkList, student_id: i64) -> Result<ReportCard, CalcError> {
    let Some(row) = list.students.iter().find(|r| r.student_id == student_id) else {
        return Err(
            CalcError::not_found("student is not enrolled in the mark list scope")
                .with_details(json!({ "studentId": student_id, "scope": list.scope.key })),
        );
    };

    let lines = list
        .subjects
        .iter()
        .zip(row.cells.iter())
        .map(|(s, c)| CardLine {
            code: s.code.clone(),
            name: s.name.clone(),
            mark: c.mark,
            level: c.level.clone(),
            class_mean: list
                .mean_scores
                .get(&s.code)
                .and_then(|m| m.as_f64())
                .unwrap_or(0.0),
        })
        .collect();

    Ok(ReportCard {
        exam: list.exam.clone(),
        student_id: row.student_id,
        name: row.name.clone(),
        class: row.class.clone(),
        lines,
        total_marks: row.total_marks,
        total_level: row.total_level.clone(),
        position: row.position,
        class_size: list.students.len(),
        class_total_mean: list.total_mean,
        class_total_mean_deviation: list.total_mean_deviation,
    })
}

/// Plain-text result lines for parents, one per student. Unmarked subjects
/// print as `-`.
pub fn sms_messages(list: &MarkList) -> Vec<SmsMessage> {
    let out_of = list.students.len();
    list.students
        .iter()
        .map(|row| {
            let marks = row
                .cells
                .iter()
                .map(|c| {
                    let mark = c
                        .mark
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    format!("{} {}", c.code.to_ascii_uppercase(), mark)
                })
                .collect::<Vec<_>>()
                .join(", ");
            SmsMessage {
                student_id: row.student_id,
                name: row.name.clone(),
                text: format!(
                    "{}: {} ({}) {}, Total {} ({}), Pos {}/{}",
                    row.name,
                    list.exam.exam_name,
                    list.exam.exam_type,
                    marks,
                    row.total_marks,
                    row.total_level,
                    row.position,
                    out_of
                ),
            }
        })
        .collect()
}
