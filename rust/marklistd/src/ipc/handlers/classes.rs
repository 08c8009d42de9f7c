use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_i64, required_str};
use crate::ipc::types::{AppState, Request};
use crate::marklist::Scope;
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           c.name,
           c.grade,
           c.stream_label,
           (SELECT COUNT(*) FROM students s WHERE s.class = c.name AND s.status = 'Active') AS student_count
         FROM classes c
         ORDER BY c.grade, c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let grade: i64 = row.get(1)?;
            let stream_label: Option<String> = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            Ok(json!({
                "name": name,
                "grade": grade,
                "streamLabel": stream_label,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match required_i64(req, "grade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stream_label = optional_str(req, "streamLabel");

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE name = ?", [&name], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "conflict",
            "class already exists",
            Some(json!({ "name": name })),
        );
    }

    if let Err(e) = conn.execute(
        "INSERT INTO classes(name, grade, stream_label) VALUES(?, ?, ?)",
        (&name, grade, &stream_label),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({ "name": name, "grade": grade, "streamLabel": stream_label }),
    )
}

fn handle_classes_stream(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade = match required_i64(req, "grade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match Scope::stream_for_grade(conn, grade) {
        Ok(scope) => ok(
            &req.id,
            json!({ "grade": grade, "key": scope.key(), "classes": scope.classes() }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.stream" => Some(handle_classes_stream(state, req)),
        _ => None,
    }
}
