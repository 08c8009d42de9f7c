use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_id};
use crate::ipc::types::{AppState, Request};
use crate::marklist;
use crate::subjects;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const RESULTS_ENTER_MAX_ENTRIES: usize = 2000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// `null` clears a mark back to "not yet marked".
fn parse_mark(
    student_id: i64,
    code: &str,
    raw: &serde_json::Value,
) -> Result<Option<i64>, HandlerErr> {
    if raw.is_null() {
        return Ok(None);
    }
    let Some(v) = raw.as_i64() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "marks must be whole numbers or null".to_string(),
            details: Some(json!({ "studentId": student_id, "subject": code, "value": raw })),
        });
    };
    if !(0..=100).contains(&v) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "marks must be between 0 and 100".to_string(),
            details: Some(json!({ "studentId": student_id, "subject": code, "value": v })),
        });
    }
    Ok(Some(v))
}

fn ensure_student(conn: &Connection, student_id: i64) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE student_id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    found.map(|_| ()).ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "student not found".to_string(),
        details: Some(json!({ "studentId": student_id })),
    })
}

fn upsert_mark(
    conn: &Connection,
    exam_id: i64,
    student_id: i64,
    code: &str,
    mark: Option<i64>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO exam_marks(exam_id, student_id, subject, mark)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(exam_id, student_id, subject) DO UPDATE SET mark = excluded.mark",
        (exam_id, student_id, code, mark),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_marks" })),
    })?;
    conn.execute(
        "INSERT INTO exam_results(id, student_id, exam_id, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, exam_id) DO UPDATE SET updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            exam_id,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_results" })),
    })?;
    Ok(())
}

fn handle_results_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries", None);
    };
    if entries.len() > RESULTS_ENTER_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            format!("at most {} entries per call", RESULTS_ENTER_MAX_ENTRIES),
            Some(json!({ "count": entries.len() })),
        );
    }

    if let Err(e) = marklist::load_exam(conn, exam_id) {
        return calc_err(&req.id, e);
    }
    let configured = match subjects::load(conn) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let known: HashSet<&str> = configured.iter().map(|s| s.code.as_str()).collect();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut updated = 0_usize;
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_i64()) else {
            return err(&req.id, "bad_params", "entry missing studentId", None);
        };
        let Some(marks) = entry.get("marks").and_then(|v| v.as_object()) else {
            return err(
                &req.id,
                "bad_params",
                "entry missing marks object",
                Some(json!({ "studentId": student_id })),
            );
        };
        if let Err(e) = ensure_student(&tx, student_id) {
            return e.response(&req.id);
        }
        for (code, raw) in marks {
            if !known.contains(code.as_str()) {
                return err(
                    &req.id,
                    "bad_params",
                    "unknown subject",
                    Some(json!({ "subject": code })),
                );
            }
            let mark = match parse_mark(student_id, code, raw) {
                Ok(v) => v,
                Err(e) => return e.response(&req.id),
            };
            if let Err(e) = upsert_mark(&tx, exam_id, student_id, code, mark) {
                return e.response(&req.id);
            }
            updated += 1;
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    tracing::debug!(exam_id, updated, "marks entered");
    ok(&req.id, json!({ "updated": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.enter" => Some(handle_results_enter(state, req)),
        _ => None,
    }
}
