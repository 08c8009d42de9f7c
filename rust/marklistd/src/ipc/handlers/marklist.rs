use crate::calc::CalcError;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use crate::marklist::{self, Scope};
use crate::subjects;
use serde_json::json;

fn to_json<T: serde::Serialize>(req: &Request, v: &T) -> serde_json::Value {
    match serde_json::to_value(v) {
        Ok(result) => ok(&req.id, result),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn run(state: &AppState, req: &Request, scope: Scope) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subjects = match subjects::load(conn) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    match marklist::generate(conn, exam_id, &scope, &subjects) {
        Ok(list) => to_json(req, &list),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_marklist_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let class = match required_str(req, "class") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match Scope::class(&class) {
        Ok(scope) => run(state, req, scope),
        Err(e) => calc_err(&req.id, e),
    }
}

/// Stream scope comes either from an explicit `classes` list or from a
/// `grade`, which expands to every class in that grade.
fn stream_scope(state: &AppState, req: &Request) -> Result<Scope, serde_json::Value> {
    if let Some(raw) = req.params.get("classes") {
        let Some(items) = raw.as_array() else {
            return Err(err(&req.id, "bad_params", "classes must be an array", None));
        };
        let mut classes = Vec::with_capacity(items.len());
        for item in items {
            let Some(s) = item.as_str() else {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "classes must contain strings",
                    Some(json!({ "value": item })),
                ));
            };
            classes.push(s.to_string());
        }
        return Scope::stream_of(&classes).map_err(|e| calc_err(&req.id, e));
    }
    if let Some(grade) = req.params.get("grade") {
        let Some(grade) = grade.as_i64() else {
            return Err(err(&req.id, "bad_params", "grade must be an integer", None));
        };
        let conn = db_conn(state, req)?;
        return Scope::stream_for_grade(conn, grade).map_err(|e| calc_err(&req.id, e));
    }
    Err(calc_err(
        &req.id,
        CalcError::bad_params("missing classes or grade"),
    ))
}

fn handle_marklist_stream(state: &mut AppState, req: &Request) -> serde_json::Value {
    match stream_scope(state, req) {
        Ok(scope) => run(state, req, scope),
        Err(e) => e,
    }
}

fn handle_mean_scores_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match required_str(req, "class") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match marklist::load_means(conn, exam_id, &class) {
        Ok(Some(means)) => to_json(req, &means),
        Ok(None) => err(
            &req.id,
            "not_found",
            "no mean scores stored for exam and class",
            Some(json!({ "examId": exam_id, "class": class })),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marklist.generate" => Some(handle_marklist_generate(state, req)),
        "marklist.stream" => Some(handle_marklist_stream(state, req)),
        "meanScores.get" => Some(handle_mean_scores_get(state, req)),
        _ => None,
    }
}
