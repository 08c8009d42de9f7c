use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const STATUSES: [&str; 3] = ["Active", "Finished", "Completed"];

fn parse_status(raw: &str) -> Option<&'static str> {
    STATUSES
        .iter()
        .copied()
        .find(|s| s.eq_ignore_ascii_case(raw.trim()))
}

fn class_exists(conn: &Connection, class: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM classes WHERE name = ?", [class], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

/// Academic years follow the calendar year.
fn record_membership(conn: &Connection, student_id: i64, class: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO student_classes(student_id, class, academic_year) VALUES(?, ?, ?)
         ON CONFLICT(student_id, academic_year) DO UPDATE SET class = excluded.class",
        (student_id, class, Utc::now().year() as i64),
    )?;
    Ok(())
}

fn student_json(conn: &Connection, student_id: i64) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT student_id, name, class, status, admission_no FROM students WHERE student_id = ?",
        [student_id],
        |r| {
            let id: i64 = r.get(0)?;
            let name: String = r.get(1)?;
            let class: String = r.get(2)?;
            let status: String = r.get(3)?;
            let admission_no: Option<String> = r.get(4)?;
            Ok(json!({
                "studentId": id,
                "name": name,
                "class": class,
                "status": status,
                "admissionNo": admission_no
            }))
        },
    )
    .optional()
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class = optional_str(req, "class");
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut stmt = match conn.prepare(
        "SELECT student_id, name, class, status, admission_no
         FROM students
         WHERE (?1 IS NULL OR class = ?1)
           AND (?2 = 1 OR status = 'Active')
         ORDER BY class, name, student_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((class.as_deref(), include_inactive as i64), |r| {
            let id: i64 = r.get(0)?;
            let name: String = r.get(1)?;
            let class: String = r.get(2)?;
            let status: String = r.get(3)?;
            let admission_no: Option<String> = r.get(4)?;
            Ok(json!({
                "studentId": id,
                "name": name,
                "class": class,
                "status": status,
                "admissionNo": admission_no
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match required_str(req, "class") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let admission_no = optional_str(req, "admissionNo");

    match class_exists(conn, &class) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_found",
                "class not found",
                Some(json!({ "class": class })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO students(name, class, status, admission_no, updated_at)
         VALUES(?, ?, 'Active', ?, ?)",
        (&name, &class, &admission_no, Utc::now().to_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    let student_id = tx.last_insert_rowid();
    if let Err(e) = record_membership(&tx, student_id, &class) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "student_classes" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "name": name,
            "class": class,
            "status": "Active",
            "admissionNo": admission_no
        }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = req.params.get("patch").unwrap_or(&req.params);

    match student_json(conn, student_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "studentId": student_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let status = match patch.get("status").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match parse_status(raw) {
            Some(s) => Some(s),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: Active, Finished, Completed",
                    Some(json!({ "status": raw })),
                )
            }
        },
    };
    let name = patch
        .get("name")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string());
    if name.as_deref() == Some("") {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let class = patch
        .get("class")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string());
    if let Some(c) = class.as_deref() {
        match class_exists(conn, c) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "class not found",
                    Some(json!({ "class": c })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE students SET
           name = COALESCE(?, name),
           class = COALESCE(?, class),
           status = COALESCE(?, status),
           updated_at = ?
         WHERE student_id = ?",
        (
            name.as_deref(),
            class.as_deref(),
            status,
            Utc::now().to_rfc3339(),
            student_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Some(c) = class.as_deref() {
        if let Err(e) = record_membership(&tx, student_id, c) {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "student_classes" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match student_json(conn, student_id) {
        Ok(Some(v)) => ok(&req.id, v),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        _ => None,
    }
}
