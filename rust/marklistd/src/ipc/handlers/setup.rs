use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::subjects::{self, Subject};
use serde_json::json;

fn handle_subjects_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match subjects::load(conn) {
        Ok(list) => ok(&req.id, json!({ "subjects": list })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let list: Vec<Subject> = if let Some(name) = req.params.get("preset").and_then(|v| v.as_str())
    {
        match subjects::preset(name) {
            Some(list) => list,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "preset must be one of: lower, jss, upper",
                    Some(json!({ "preset": name })),
                )
            }
        }
    } else {
        let Some(raw) = req.params.get("subjects") else {
            return err(&req.id, "bad_params", "missing subjects or preset", None);
        };
        match serde_json::from_value(raw.clone()) {
            Ok(list) => list,
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("subjects must be an array of {{code, name}}: {e}"),
                    None,
                )
            }
        }
    };

    if let Err(e) = subjects::save(conn, &list) {
        return calc_err(&req.id, e);
    }
    tracing::info!(count = list.len(), "subject list updated");
    ok(&req.id, json!({ "subjects": list }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.get" => Some(handle_subjects_get(state, req)),
        "subjects.set" => Some(handle_subjects_set(state, req)),
        _ => None,
    }
}
