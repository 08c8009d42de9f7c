use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use crate::marklist::{self, MarkList, Scope};
use crate::reports;
use crate::subjects;
use rusqlite::Connection;
use serde_json::json;

fn class_list(
    conn: &Connection,
    req: &Request,
    exam_id: i64,
    class: &str,
) -> Result<MarkList, serde_json::Value> {
    let scope = Scope::class(class).map_err(|e| calc_err(&req.id, e))?;
    let subjects = subjects::load(conn).map_err(|e| calc_err(&req.id, e))?;
    marklist::generate(conn, exam_id, &scope, &subjects).map_err(|e| calc_err(&req.id, e))
}

fn handle_reports_student_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match reports::student_class(conn, student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let list = match class_list(conn, req, exam_id, &class) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let card = match reports::student_card(&list, student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    match serde_json::to_value(&card) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_reports_sms_messages(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let list = match class_list(conn, req, exam_id, &class) {
        Ok(v) => v,
        Err(e) => return e,
    };
    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "class": class,
            "messages": reports::sms_messages(&list)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentCard" => Some(handle_reports_student_card(state, req)),
        "reports.smsMessages" => Some(handle_reports_sms_messages(state, req)),
        _ => None,
    }
}
