use crate::boundaries::{self, BoundaryKind};
use crate::calc::{self, PointBoundary};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn parse_kind(req: &Request) -> Result<BoundaryKind, serde_json::Value> {
    BoundaryKind::parse(req.params.get("kind").and_then(|v| v.as_str()))
        .map_err(|e| calc_err(&req.id, e))
}

fn handle_boundaries_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let kind = match parse_kind(req) {
        Ok(k) => k,
        Err(e) => return e,
    };
    match boundaries::load(conn, kind) {
        Ok(list) => ok(
            &req.id,
            json!({ "kind": kind.as_str(), "boundaries": list }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_boundaries_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let kind = match parse_kind(req) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("boundaries") else {
        return err(&req.id, "bad_params", "missing boundaries", None);
    };
    let list: Vec<PointBoundary> = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("boundaries must be an array of {{minMarks, maxMarks, pl, ab}}: {e}"),
                None,
            )
        }
    };

    match boundaries::replace(conn, kind, &list) {
        Ok(warnings) => ok(
            &req.id,
            json!({
                "kind": kind.as_str(),
                "boundaries": list,
                "warnings": warnings
            }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_boundaries_classify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let kind = match parse_kind(req) {
        Ok(k) => k,
        Err(e) => return e,
    };
    let score = match req.params.get("score") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "score must be a number or null",
                    Some(json!({ "score": v })),
                )
            }
        },
    };
    let list = match boundaries::load(conn, kind) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let c = calc::classify(score, &list);
    ok(
        &req.id,
        json!({ "score": score, "pl": c.label(), "ab": c.abbreviation() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "boundaries.list" => Some(handle_boundaries_list(state, req)),
        "boundaries.replace" => Some(handle_boundaries_replace(state, req)),
        "boundaries.classify" => Some(handle_boundaries_classify(state, req)),
        _ => None,
    }
}
