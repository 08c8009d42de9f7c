use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        )),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    let Some(v) = req.params.get(key) else {
        return Err(err(&req.id, "bad_params", format!("missing {}", key), None));
    };
    v.as_i64().ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be an integer", key),
            Some(json!({ key: v })),
        )
    })
}

/// Identifiers (examId, studentId) are positive integers.
pub fn required_id(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    let id = required_i64(req, key)?;
    if id <= 0 {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a positive integer", key),
            Some(json!({ key: id })),
        ));
    }
    Ok(id)
}
