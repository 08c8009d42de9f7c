use crate::boundaries::{self, BoundaryKind};
use crate::calc::{self, CalcError, Classification, MeanValue, PointBoundary, StudentMarks};
use crate::subjects::Subject;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Which students a mark list covers: one class, or every class of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Class(String),
    Stream { key: String, classes: Vec<String> },
}

impl Scope {
    pub fn class(name: &str) -> Result<Self, CalcError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CalcError::bad_params("class must not be empty"));
        }
        Ok(Scope::Class(name.to_string()))
    }

    /// Stream over an explicit class list; the summary key is the sorted
    /// list so the same set always maps to the same stored means.
    pub fn stream_of(classes: &[String]) -> Result<Self, CalcError> {
        let mut cleaned: Vec<String> = classes
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        cleaned.sort();
        cleaned.dedup();
        if cleaned.is_empty() {
            return Err(CalcError::bad_params("classes must contain at least one class"));
        }
        Ok(Scope::Stream {
            key: format!("stream:{}", cleaned.join("+")),
            classes: cleaned,
        })
    }

    pub fn stream_for_grade(conn: &Connection, grade: i64) -> Result<Self, CalcError> {
        let mut stmt = conn
            .prepare("SELECT name FROM classes WHERE grade = ? ORDER BY name")
            .map_err(CalcError::query)?;
        let classes = stmt
            .query_map([grade], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CalcError::query)?;
        if classes.is_empty() {
            return Err(CalcError::not_found("no classes in grade")
                .with_details(json!({ "grade": grade })));
        }
        Ok(Scope::Stream {
            key: format!("stream:{}", grade),
            classes,
        })
    }

    /// Key under which the class/exam means are stored.
    pub fn key(&self) -> &str {
        match self {
            Scope::Class(name) => name,
            Scope::Stream { key, .. } => key,
        }
    }

    pub fn classes(&self) -> Vec<&str> {
        match self {
            Scope::Class(name) => vec![name.as_str()],
            Scope::Stream { classes, .. } => classes.iter().map(|c| c.as_str()).collect(),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Scope::Stream { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExamInfo {
    pub exam_id: i64,
    pub exam_name: String,
    pub exam_type: String,
    pub term: i64,
    pub date_created: String,
}

pub fn load_exam(conn: &Connection, exam_id: i64) -> Result<ExamInfo, CalcError> {
    conn.query_row(
        "SELECT exam_id, exam_name, exam_type, term, date_created FROM exams WHERE exam_id = ?",
        [exam_id],
        |r| {
            Ok(ExamInfo {
                exam_id: r.get(0)?,
                exam_name: r.get(1)?,
                exam_type: r.get(2)?,
                term: r.get(3)?,
                date_created: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(CalcError::query)?
    .ok_or_else(|| CalcError::not_found("exam not found").with_details(json!({ "examId": exam_id })))
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

/// Active students of the scope with their marks for the exam, highest total
/// first. Students without any recorded marks come back with every subject
/// `None`.
pub fn load_scope_rows(
    conn: &Connection,
    exam_id: i64,
    scope: &Scope,
    subjects: &[Subject],
) -> Result<Vec<StudentMarks>, CalcError> {
    load_exam(conn, exam_id)?;

    let classes = scope.classes();
    let class_ph = placeholders(classes.len());
    let subject_ph = placeholders(subjects.len());

    let sql = format!(
        "SELECT s.student_id, s.name, s.class,
           (SELECT COALESCE(SUM(m.mark), 0)
              FROM exam_marks m
             WHERE m.exam_id = ? AND m.student_id = s.student_id
               AND m.subject IN ({subject_ph})) AS total
         FROM students s
         WHERE s.status = 'Active' AND s.class IN ({class_ph})
         ORDER BY total DESC, s.name ASC, s.student_id ASC"
    );
    let mut bind: Vec<Value> = Vec::with_capacity(1 + subjects.len() + classes.len());
    bind.push(Value::Integer(exam_id));
    for s in subjects {
        bind.push(Value::Text(s.code.clone()));
    }
    for c in &classes {
        bind.push(Value::Text(c.to_string()));
    }

    let mut stmt = conn.prepare(&sql).map_err(CalcError::query)?;
    let students: Vec<(i64, String, String)> = stmt
        .query_map(params_from_iter(bind), |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::query)?;
    if students.is_empty() {
        return Ok(Vec::new());
    }

    let marks_sql = format!(
        "SELECT m.student_id, m.subject, m.mark
         FROM exam_marks m
         JOIN students s ON s.student_id = m.student_id
         WHERE m.exam_id = ? AND s.status = 'Active' AND s.class IN ({class_ph})"
    );
    let mut bind: Vec<Value> = Vec::with_capacity(1 + classes.len());
    bind.push(Value::Integer(exam_id));
    for c in &classes {
        bind.push(Value::Text(c.to_string()));
    }
    let mut stmt = conn.prepare(&marks_sql).map_err(CalcError::query)?;
    let rows = stmt
        .query_map(params_from_iter(bind), |r| {
            let student_id: i64 = r.get(0)?;
            let subject: String = r.get(1)?;
            let mark: Option<i64> = r.get(2)?;
            Ok((student_id, subject, mark))
        })
        .map_err(CalcError::query)?;
    let mut mark_by_pair: HashMap<(i64, String), Option<i64>> = HashMap::new();
    for row in rows {
        let (student_id, subject, mark) = row.map_err(CalcError::query)?;
        mark_by_pair.insert((student_id, subject), mark);
    }

    Ok(students
        .into_iter()
        .map(|(student_id, name, class)| {
            let marks = subjects
                .iter()
                .map(|s| {
                    mark_by_pair
                        .get(&(student_id, s.code.clone()))
                        .copied()
                        .flatten()
                })
                .collect();
            StudentMarks {
                student_id,
                name,
                class,
                marks,
            }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMeans {
    pub exam_id: i64,
    pub class: String,
    pub subject_means: BTreeMap<String, f64>,
    pub total_mean: f64,
    pub updated_at: Option<String>,
}

fn stored_means_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, f64, Option<String>)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn decode_stored_means(
    row: (i64, String, String, f64, Option<String>),
) -> Result<StoredMeans, CalcError> {
    let (exam_id, class, means_json, total_mean, updated_at) = row;
    let subject_means: BTreeMap<String, f64> = serde_json::from_str(&means_json).map_err(|e| {
        CalcError::new("db_query_failed", format!("stored subject means are malformed: {e}"))
            .with_details(json!({ "examId": exam_id, "class": class }))
    })?;
    Ok(StoredMeans {
        exam_id,
        class,
        subject_means,
        total_mean,
        updated_at,
    })
}

pub fn load_means(
    conn: &Connection,
    exam_id: i64,
    class: &str,
) -> Result<Option<StoredMeans>, CalcError> {
    let row = conn
        .query_row(
            "SELECT exam_id, class, subject_means, total_mean, updated_at
             FROM exam_mean_scores
             WHERE exam_id = ? AND class = ?",
            (exam_id, class),
            stored_means_from_row,
        )
        .optional()
        .map_err(CalcError::query)?;
    row.map(decode_stored_means).transpose()
}

/// Most recent stored means for the same class from an earlier exam.
pub fn previous_means(
    conn: &Connection,
    exam_id: i64,
    class: &str,
) -> Result<Option<StoredMeans>, CalcError> {
    let row = conn
        .query_row(
            "SELECT exam_id, class, subject_means, total_mean, updated_at
             FROM exam_mean_scores
             WHERE class = ? AND exam_id < ?
             ORDER BY exam_id DESC
             LIMIT 1",
            (class, exam_id),
            stored_means_from_row,
        )
        .optional()
        .map_err(CalcError::query)?;
    row.map(decode_stored_means).transpose()
}

pub fn upsert_means(
    conn: &Connection,
    exam_id: i64,
    class: &str,
    subject_means: &BTreeMap<String, f64>,
    total_mean: f64,
) -> Result<(), CalcError> {
    let means_json = serde_json::to_string(subject_means).map_err(CalcError::persistence)?;
    conn.execute(
        "INSERT INTO exam_mean_scores(exam_id, class, subject_means, total_mean, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(exam_id, class) DO UPDATE SET
           subject_means = excluded.subject_means,
           total_mean = excluded.total_mean,
           updated_at = excluded.updated_at",
        (exam_id, class, means_json, total_mean, Utc::now().to_rfc3339()),
    )
    .map_err(CalcError::persistence)?;
    Ok(())
}

pub fn delete_means(conn: &Connection, exam_id: i64, class: &str) -> Result<(), CalcError> {
    conn.execute(
        "DELETE FROM exam_mean_scores WHERE exam_id = ? AND class = ?",
        (exam_id, class),
    )
    .map_err(CalcError::persistence)?;
    Ok(())
}

/// Drops the rank of scope members who are no longer active, so a student
/// who left keeps no position from an earlier run.
fn clear_departed_ranks(conn: &Connection, exam_id: i64, scope: &Scope) -> rusqlite::Result<()> {
    let column = if scope.is_stream() {
        "stream_position"
    } else {
        "position"
    };
    let classes = scope.classes();
    let sql = format!(
        "UPDATE exam_results SET {column} = NULL
         WHERE exam_id = ? AND student_id IN (
           SELECT student_id FROM students
            WHERE status <> 'Active' AND class IN ({})
         )",
        placeholders(classes.len())
    );
    let mut bind: Vec<Value> = Vec::with_capacity(1 + classes.len());
    bind.push(Value::Integer(exam_id));
    for c in &classes {
        bind.push(Value::Text(c.to_string()));
    }
    conn.execute(&sql, params_from_iter(bind))?;
    Ok(())
}

fn persist_rank(
    conn: &Connection,
    exam_id: i64,
    row: &calc::RankedRow,
    stream: bool,
    now: &str,
) -> rusqlite::Result<()> {
    let sql = if stream {
        "INSERT INTO exam_results(id, student_id, exam_id, total_marks, stream_position, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, exam_id) DO UPDATE SET
           total_marks = excluded.total_marks,
           stream_position = excluded.stream_position,
           updated_at = excluded.updated_at"
    } else {
        "INSERT INTO exam_results(id, student_id, exam_id, total_marks, position, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, exam_id) DO UPDATE SET
           total_marks = excluded.total_marks,
           position = excluded.position,
           updated_at = excluded.updated_at"
    };
    conn.execute(
        sql,
        (
            Uuid::new_v4().to_string(),
            row.student_id,
            exam_id,
            row.total_marks,
            row.position,
            now,
        ),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SubjectCell {
    pub code: String,
    pub mark: Option<i64>,
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct MarkListRow {
    pub student_id: i64,
    pub name: String,
    pub class: String,
    pub cells: Vec<SubjectCell>,
    pub total_marks: i64,
    pub position: i64,
    pub stream: bool,
    pub total_level: String,
}

impl Serialize for MarkListRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("student_id", &self.student_id)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("class", &self.class)?;
        for c in &self.cells {
            map.serialize_entry(&c.code, &c.mark)?;
        }
        map.serialize_entry("total_marks", &self.total_marks)?;
        if self.stream {
            map.serialize_entry("stream_position", &self.position)?;
        } else {
            map.serialize_entry("position", &self.position)?;
        }
        for c in &self.cells {
            map.serialize_entry(&format!("PL_{}", c.code), &c.level)?;
        }
        map.serialize_entry("PL_total", &self.total_level)?;
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeInfo {
    pub kind: &'static str,
    pub key: String,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkList {
    pub exam: ExamInfo,
    pub scope: ScopeInfo,
    pub subjects: Vec<Subject>,
    pub students: Vec<MarkListRow>,
    /// Per-subject maps are keyed in configured subject order.
    pub mean_scores: Map<String, serde_json::Value>,
    pub total_mean: f64,
    pub mean_levels: Map<String, serde_json::Value>,
    pub total_mean_level: String,
    pub previous_exam_id: Option<i64>,
    pub prev_mean_scores: Map<String, serde_json::Value>,
    pub prev_total_mean: MeanValue,
    pub deviation_scores: Map<String, serde_json::Value>,
    pub total_mean_deviation: MeanValue,
}

fn subject_map<T: Serialize>(
    subjects: &[Subject],
    mut value: impl FnMut(&Subject) -> T,
) -> Map<String, serde_json::Value> {
    subjects
        .iter()
        .map(|s| (s.code.clone(), json!(value(s))))
        .collect()
}

/// Bands used for totals. Without a configured total set, a total is
/// classified by its per-subject average against the subject bands.
struct TotalBands<'a> {
    total: &'a [PointBoundary],
    subject: &'a [PointBoundary],
    subject_count: usize,
}

impl<'a> TotalBands<'a> {
    fn classify_total(&self, total: f64) -> Classification<'a> {
        if !self.total.is_empty() {
            return calc::classify_mean(total, self.total);
        }
        if self.subject_count == 0 {
            return Classification::Unknown;
        }
        calc::classify_mean(total / self.subject_count as f64, self.subject)
    }
}

/// Load, rank, persist and summarise one exam for one scope.
///
/// Rank/total writes and the means upsert share one IMMEDIATE transaction:
/// either every write lands or none does, and a concurrent run for the same
/// workspace waits for the lock instead of interleaving.
pub fn generate(
    conn: &Connection,
    exam_id: i64,
    scope: &Scope,
    subjects: &[Subject],
) -> Result<MarkList, CalcError> {
    if exam_id <= 0 {
        return Err(CalcError::bad_params("examId must be a positive integer")
            .with_details(json!({ "examId": exam_id })));
    }
    if subjects.is_empty() {
        return Err(CalcError::new("config_invalid", "no subjects configured"));
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(CalcError::persistence)?;

    let subject_bands = boundaries::load(&tx, BoundaryKind::Subject)?;
    let total_bands = boundaries::load(&tx, BoundaryKind::Total)?;

    let exam = load_exam(&tx, exam_id)?;
    let rows = load_scope_rows(&tx, exam_id, scope, subjects)?;
    tracing::debug!(
        exam_id,
        scope = scope.key(),
        students = rows.len(),
        "aggregating mark list"
    );
    let agg = calc::aggregate(rows, subjects.len());

    let now = Utc::now().to_rfc3339();
    for row in &agg.rows {
        if let Err(e) = persist_rank(&tx, exam_id, row, scope.is_stream(), &now) {
            tracing::error!(
                exam_id,
                scope = scope.key(),
                student_id = row.student_id,
                error = %e,
                "failed to persist rank"
            );
            return Err(CalcError::persistence(e).with_details(json!({
                "table": "exam_results",
                "studentId": row.student_id,
            })));
        }
    }

    if let Err(e) = clear_departed_ranks(&tx, exam_id, scope) {
        tracing::error!(exam_id, scope = scope.key(), error = %e, "failed to clear stale ranks");
        return Err(CalcError::persistence(e).with_details(json!({ "table": "exam_results" })));
    }

    let mean_scores: BTreeMap<String, f64> = subjects
        .iter()
        .zip(agg.subject_means.iter())
        .map(|(s, m)| (s.code.clone(), *m))
        .collect();

    // Empty scope: the stored summary is removed rather than zeroed.
    let summary = if agg.rows.is_empty() {
        delete_means(&tx, exam_id, scope.key())
    } else {
        upsert_means(&tx, exam_id, scope.key(), &mean_scores, agg.total_mean)
    };
    if let Err(e) = summary {
        tracing::error!(exam_id, scope = scope.key(), error = %e, "failed to write means");
        return Err(e.with_details(json!({ "table": "exam_mean_scores" })));
    }

    let previous = previous_means(&tx, exam_id, scope.key())?;
    tx.commit().map_err(CalcError::persistence)?;

    let bands = TotalBands {
        total: &total_bands,
        subject: &subject_bands,
        subject_count: subjects.len(),
    };

    let students: Vec<MarkListRow> = agg
        .rows
        .into_iter()
        .map(|r| {
            let unmarked = r.marks.iter().all(|m| m.is_none());
            let cells = subjects
                .iter()
                .zip(r.marks.iter())
                .map(|(s, m)| SubjectCell {
                    code: s.code.clone(),
                    mark: *m,
                    level: calc::classify(m.map(|v| v as f64), &subject_bands)
                        .abbreviation()
                        .to_string(),
                })
                .collect();
            let total_level = if unmarked {
                Classification::Unscored
            } else {
                bands.classify_total(r.total_marks as f64)
            };
            MarkListRow {
                student_id: r.student_id,
                name: r.name,
                class: r.class,
                cells,
                total_marks: r.total_marks,
                position: r.position,
                stream: scope.is_stream(),
                total_level: total_level.abbreviation().to_string(),
            }
        })
        .collect();

    let current_subject = |code: &str| mean_scores.get(code).copied().unwrap_or(0.0);
    let mean_levels = subject_map(subjects, |s| {
        calc::classify_mean(current_subject(&s.code), &subject_bands).abbreviation()
    });
    let total_mean_level = bands
        .classify_total(agg.total_mean)
        .abbreviation()
        .to_string();

    let prev_subject = |code: &str| previous.as_ref().and_then(|p| p.subject_means.get(code).copied());
    let prev_mean_scores = subject_map(subjects, |s| MeanValue::from(prev_subject(&s.code)));
    let deviation_scores = subject_map(subjects, |s| {
        calc::deviation(current_subject(&s.code), prev_subject(&s.code))
    });
    let prev_total = previous.as_ref().map(|p| p.total_mean);

    tracing::info!(
        exam_id,
        scope = scope.key(),
        students = students.len(),
        total_mean = agg.total_mean,
        previous_exam_id = ?previous.as_ref().map(|p| p.exam_id),
        "mark list generated"
    );

    Ok(MarkList {
        exam,
        scope: ScopeInfo {
            kind: if scope.is_stream() { "stream" } else { "class" },
            key: scope.key().to_string(),
            classes: scope.classes().into_iter().map(|c| c.to_string()).collect(),
        },
        subjects: subjects.to_vec(),
        students,
        mean_scores: subject_map(subjects, |s| current_subject(&s.code)),
        total_mean: agg.total_mean,
        mean_levels,
        total_mean_level,
        previous_exam_id: previous.as_ref().map(|p| p.exam_id),
        prev_mean_scores,
        prev_total_mean: MeanValue::from(prev_total),
        deviation_scores,
        total_mean_deviation: calc::deviation(agg.total_mean, prev_total),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::subjects;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        conn.execute("INSERT INTO classes(name, grade) VALUES('7_east', 7)", [])
            .expect("class");
        conn.execute("INSERT INTO classes(name, grade) VALUES('7_west', 7)", [])
            .expect("class");
        conn
    }

    fn add_exam(conn: &Connection, name: &str) -> i64 {
        conn.execute(
            "INSERT INTO exams(exam_name, exam_type, term, date_created) VALUES(?, 'End-Term', 1, '2026-03-01')",
            [name],
        )
        .expect("exam");
        conn.last_insert_rowid()
    }

    fn add_student(conn: &Connection, name: &str, class: &str) -> i64 {
        conn.execute(
            "INSERT INTO students(name, class, status) VALUES(?, ?, 'Active')",
            (name, class),
        )
        .expect("student");
        conn.last_insert_rowid()
    }

    fn set_marks(conn: &Connection, exam_id: i64, student_id: i64, subjects: &[Subject], mark: i64) {
        for s in subjects {
            conn.execute(
                "INSERT OR REPLACE INTO exam_marks(exam_id, student_id, subject, mark) VALUES(?, ?, ?, ?)",
                (exam_id, student_id, &s.code, mark),
            )
            .expect("mark");
        }
    }

    fn two_subjects() -> Vec<Subject> {
        vec![
            Subject {
                code: "english".into(),
                name: "English".into(),
            },
            Subject {
                code: "mathematics".into(),
                name: "Mathematics".into(),
            },
        ]
    }

    #[test]
    fn unknown_exam_is_not_found() {
        let conn = setup();
        let err = generate(&conn, 42, &Scope::class("7_east").expect("scope"), &two_subjects())
            .unwrap_err();
        assert_eq!(err.code, "not_found");
    }

    #[test]
    fn nonpositive_exam_id_is_bad_params() {
        let conn = setup();
        let err = generate(&conn, 0, &Scope::class("7_east").expect("scope"), &two_subjects())
            .unwrap_err();
        assert_eq!(err.code, "bad_params");
        assert!(Scope::class("  ").is_err());
        assert!(Scope::stream_of(&[" ".to_string()]).is_err());
    }

    #[test]
    fn loader_includes_students_without_marks() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "Opener");
        let a = add_student(&conn, "Akinyi", "7_east");
        let _b = add_student(&conn, "Baraka", "7_east");
        set_marks(&conn, exam, a, &subjects, 70);

        let rows = load_scope_rows(&conn, exam, &Scope::Class("7_east".into()), &subjects)
            .expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].marks, vec![Some(70), Some(70)]);
        assert_eq!(rows[1].marks, vec![None, None]);
    }

    #[test]
    fn inactive_students_are_out_of_scope() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "Opener");
        add_student(&conn, "Current", "7_east");
        let gone = add_student(&conn, "Alumnus", "7_east");
        conn.execute(
            "UPDATE students SET status = 'Finished' WHERE student_id = ?",
            [gone],
        )
        .expect("status");

        let rows = load_scope_rows(&conn, exam, &Scope::Class("7_east".into()), &subjects)
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Current");
    }

    #[test]
    fn generate_persists_ranks_and_single_summary_row() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "Mid-Term");
        let a = add_student(&conn, "Achieng", "7_east");
        let b = add_student(&conn, "Brian", "7_east");
        set_marks(&conn, exam, a, &subjects, 40);
        set_marks(&conn, exam, b, &subjects, 80);

        let scope = Scope::Class("7_east".into());
        let first = generate(&conn, exam, &scope, &subjects).expect("first");
        let second = generate(&conn, exam, &scope, &subjects).expect("second");
        assert_eq!(first.total_mean, 120.0);
        assert_eq!(first.total_mean, second.total_mean);
        assert_eq!(first.mean_scores, second.mean_scores);

        let position_of = |sid: i64| -> (i64, i64) {
            conn.query_row(
                "SELECT total_marks, position FROM exam_results WHERE exam_id = ? AND student_id = ?",
                (exam, sid),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("result row")
        };
        assert_eq!(position_of(b), (160, 1));
        assert_eq!(position_of(a), (80, 2));

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM exam_mean_scores WHERE exam_id = ? AND class = '7_east'",
                [exam],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn deviation_against_previous_exam() {
        let conn = setup();
        let subjects = two_subjects();
        let first = add_exam(&conn, "Opener");
        let second = add_exam(&conn, "Mid-Term");
        let a = add_student(&conn, "Achieng", "7_east");
        set_marks(&conn, first, a, &subjects, 50);
        set_marks(&conn, second, a, &subjects, 55);
        let scope = Scope::Class("7_east".into());

        let opener = generate(&conn, first, &scope, &subjects).expect("opener");
        assert_eq!(opener.previous_exam_id, None);
        assert!(opener
            .deviation_scores
            .values()
            .all(|d| d == "-"));
        assert_eq!(opener.total_mean_deviation, MeanValue::Missing);

        let mid = generate(&conn, second, &scope, &subjects).expect("mid");
        assert_eq!(mid.previous_exam_id, Some(first));
        assert_eq!(mid.deviation_scores["english"], json!(5.0));
        assert_eq!(mid.total_mean_deviation, MeanValue::Value(10.0));
        assert_eq!(mid.prev_mean_scores["mathematics"], json!(50.0));
    }

    #[test]
    fn subject_missing_from_previous_summary_deviates_as_dash() {
        let conn = setup();
        let subjects = two_subjects();
        let first = add_exam(&conn, "Opener");
        let second = add_exam(&conn, "Mid-Term");
        let a = add_student(&conn, "Achieng", "7_east");
        set_marks(&conn, second, a, &subjects, 60);

        let mut only_english = BTreeMap::new();
        only_english.insert("english".to_string(), 58.0);
        upsert_means(&conn, first, "7_east", &only_english, 58.0).expect("seed previous");

        let mid = generate(&conn, second, &Scope::Class("7_east".into()), &subjects)
            .expect("mid");
        assert_eq!(mid.deviation_scores["english"], json!(2.0));
        assert_eq!(mid.deviation_scores["mathematics"], json!("-"));
    }

    #[test]
    fn stream_ranks_across_classes_into_stream_position() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "End-Term");
        let east = add_student(&conn, "East Kid", "7_east");
        let west = add_student(&conn, "West Kid", "7_west");
        set_marks(&conn, exam, east, &subjects, 30);
        set_marks(&conn, exam, west, &subjects, 90);

        let scope = Scope::stream_for_grade(&conn, 7).expect("stream");
        assert_eq!(scope.key(), "stream:7");
        let list = generate(&conn, exam, &scope, &subjects).expect("stream list");
        assert_eq!(list.students[0].student_id, west);

        let (pos, stream_pos): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT position, stream_position FROM exam_results WHERE exam_id = ? AND student_id = ?",
                (exam, east),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("row");
        assert_eq!(pos, None);
        assert_eq!(stream_pos, Some(2));

        let stored = load_means(&conn, exam, "stream:7").expect("load").expect("row");
        assert_eq!(stored.total_mean, 120.0);
    }

    #[test]
    fn empty_class_yields_empty_list_without_summary() {
        let conn = setup();
        let exam = add_exam(&conn, "Weekly");
        let list = generate(
            &conn,
            exam,
            &Scope::Class("7_east".into()),
            &subjects::lower_preset(),
        )
        .expect("empty list");
        assert!(list.students.is_empty());
        assert_eq!(list.total_mean, 0.0);
        assert!(load_means(&conn, exam, "7_east").expect("load").is_none());
    }

    #[test]
    fn emptied_scope_drops_stale_summary_and_rank() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "Mid-Term");
        let only = add_student(&conn, "Wanjiru", "7_east");
        set_marks(&conn, exam, only, &subjects, 80);
        let scope = Scope::Class("7_east".into());

        generate(&conn, exam, &scope, &subjects).expect("first run");
        assert!(load_means(&conn, exam, "7_east").expect("load").is_some());

        conn.execute(
            "UPDATE students SET status = 'Finished' WHERE student_id = ?",
            [only],
        )
        .expect("deactivate");
        let list = generate(&conn, exam, &scope, &subjects).expect("second run");
        assert!(list.students.is_empty());
        assert!(load_means(&conn, exam, "7_east").expect("load").is_none());

        let position: Option<i64> = conn
            .query_row(
                "SELECT position FROM exam_results WHERE exam_id = ? AND student_id = ?",
                (exam, only),
                |r| r.get(0),
            )
            .expect("result row");
        assert_eq!(position, None);
    }

    #[test]
    fn departed_student_loses_rank_while_others_are_reranked() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "End-Term");
        let top = add_student(&conn, "Akinyi", "7_east");
        let next = add_student(&conn, "Barasa", "7_east");
        set_marks(&conn, exam, top, &subjects, 90);
        set_marks(&conn, exam, next, &subjects, 60);
        let scope = Scope::Class("7_east".into());
        generate(&conn, exam, &scope, &subjects).expect("first run");

        conn.execute(
            "UPDATE students SET status = 'Transferred' WHERE student_id = ?",
            [top],
        )
        .expect("transfer");
        generate(&conn, exam, &scope, &subjects).expect("second run");

        let position = |id: i64| -> Option<i64> {
            conn.query_row(
                "SELECT position FROM exam_results WHERE exam_id = ? AND student_id = ?",
                (exam, id),
                |r| r.get(0),
            )
            .expect("result row")
        };
        assert_eq!(position(top), None);
        assert_eq!(position(next), Some(1));
    }

    #[test]
    fn failed_summary_write_rolls_back_ranks() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "Opener");
        let a = add_student(&conn, "Chebet", "7_east");
        let b = add_student(&conn, "Dalmas", "7_east");
        set_marks(&conn, exam, a, &subjects, 70);
        set_marks(&conn, exam, b, &subjects, 50);
        conn.execute_batch(
            "CREATE TRIGGER reject_means BEFORE INSERT ON exam_mean_scores
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .expect("trigger");

        let err = generate(&conn, exam, &Scope::Class("7_east".into()), &subjects)
            .expect_err("summary write fails");
        assert_eq!(err.code, "persistence_failed");
        assert_eq!(err.details, Some(json!({ "table": "exam_mean_scores" })));

        let results: i64 = conn
            .query_row("SELECT COUNT(*) FROM exam_results", [], |r| r.get(0))
            .expect("count");
        assert_eq!(results, 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn boundary_read_failure_leaves_no_open_transaction() {
        let conn = setup();
        let subjects = two_subjects();
        let exam = add_exam(&conn, "Opener");
        let a = add_student(&conn, "Chebet", "7_east");
        set_marks(&conn, exam, a, &subjects, 70);
        conn.execute_batch("DROP TABLE total_point_boundaries").expect("drop");

        let err = generate(&conn, exam, &Scope::Class("7_east".into()), &subjects)
            .expect_err("boundaries unreadable");
        assert_eq!(err.code, "db_query_failed");
        assert!(conn.is_autocommit());
    }

    #[test]
    fn subject_maps_keep_configured_order() {
        let conn = setup();
        let subjects = vec![
            Subject {
                code: "mathematics".into(),
                name: "Mathematics".into(),
            },
            Subject {
                code: "english".into(),
                name: "English".into(),
            },
            Subject {
                code: "biology".into(),
                name: "Biology".into(),
            },
        ];
        let exam = add_exam(&conn, "Mid-Term");
        let a = add_student(&conn, "Esther", "7_east");
        set_marks(&conn, exam, a, &subjects, 55);

        let list = generate(&conn, exam, &Scope::Class("7_east".into()), &subjects)
            .expect("list");
        let expected = ["mathematics", "english", "biology"];
        for map in [
            &list.mean_scores,
            &list.mean_levels,
            &list.prev_mean_scores,
            &list.deviation_scores,
        ] {
            assert_eq!(map.keys().map(String::as_str).collect::<Vec<_>>(), expected);
        }

        let text = serde_json::to_string(&list).expect("serialize");
        let math = text.find("\"mean_scores\":{\"mathematics\"");
        assert!(math.is_some(), "{text}");
    }

    #[test]
    fn row_serializes_flat_subject_and_level_keys() {
        let row = MarkListRow {
            student_id: 7,
            name: "Achieng".into(),
            class: "7_east".into(),
            cells: vec![SubjectCell {
                code: "english".into(),
                mark: None,
                level: "-".into(),
            }],
            total_marks: 0,
            position: 1,
            stream: false,
            total_level: "-".into(),
        };
        let v = serde_json::to_value(&row).expect("serialize");
        assert_eq!(v["english"], serde_json::Value::Null);
        assert_eq!(v["PL_english"], "-");
        assert_eq!(v["position"], 1);
        assert!(v.get("stream_position").is_none());
    }
}
