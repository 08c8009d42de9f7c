use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_i64, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use crate::marklist;
use chrono::Utc;
use serde_json::json;

const EXAM_TYPES: [&str; 4] = ["Opener", "Mid-Term", "End-Term", "Weekly"];

fn parse_exam_type(raw: &str) -> Option<&'static str> {
    let norm = raw.trim().replace([' ', '_'], "-");
    EXAM_TYPES
        .iter()
        .copied()
        .find(|t| t.eq_ignore_ascii_case(&norm))
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT exam_id, exam_name, exam_type, term, date_created
         FROM exams
         ORDER BY exam_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let exam_id: i64 = r.get(0)?;
            let exam_name: String = r.get(1)?;
            let exam_type: String = r.get(2)?;
            let term: i64 = r.get(3)?;
            let date_created: String = r.get(4)?;
            Ok(json!({
                "examId": exam_id,
                "examName": exam_name,
                "examType": exam_type,
                "term": term,
                "dateCreated": date_created
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_name = match required_str(req, "examName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw_type = match required_str(req, "examType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(exam_type) = parse_exam_type(&raw_type) else {
        return err(
            &req.id,
            "bad_params",
            "examType must be one of: Opener, Mid-Term, End-Term, Weekly",
            Some(json!({ "examType": raw_type })),
        );
    };
    let term = match required_i64(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !(1..=3).contains(&term) {
        return err(
            &req.id,
            "bad_params",
            "term must be 1, 2 or 3",
            Some(json!({ "term": term })),
        );
    }

    let date_created = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(exam_name, exam_type, term, date_created) VALUES(?, ?, ?, ?)",
        (&exam_name, exam_type, term, &date_created),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }
    let exam_id = conn.last_insert_rowid();
    tracing::info!(exam_id, exam_type, term, "exam created");

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "examName": exam_name,
            "examType": exam_type,
            "term": term,
            "dateCreated": date_created
        }),
    )
}

fn handle_exams_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match marklist::load_exam(conn, exam_id) {
        Ok(exam) => ok(
            &req.id,
            json!({
                "examId": exam.exam_id,
                "examName": exam.exam_name,
                "examType": exam.exam_type,
                "term": exam.term,
                "dateCreated": exam.date_created
            }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.get" => Some(handle_exams_get(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_exam_type;

    #[test]
    fn exam_type_accepts_loose_spellings() {
        assert_eq!(parse_exam_type("mid term"), Some("Mid-Term"));
        assert_eq!(parse_exam_type("END_TERM"), Some("End-Term"));
        assert_eq!(parse_exam_type("weekly"), Some("Weekly"));
        assert_eq!(parse_exam_type("Mock"), None);
    }
}
