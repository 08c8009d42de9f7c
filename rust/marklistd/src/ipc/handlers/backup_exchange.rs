use crate::backup;
use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use crate::marklist::{self, MarkList, Scope};
use crate::subjects;
use serde_json::json;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// One header row, one row per student in rank order, then a MEAN row.
fn mark_list_csv(list: &MarkList) -> String {
    let rank_col = if list.scope.kind == "stream" {
        "stream_position"
    } else {
        "position"
    };
    let mut header: Vec<String> = vec!["student_id".into(), "name".into(), "class".into()];
    header.extend(list.subjects.iter().map(|s| s.code.clone()));
    header.push("total_marks".into());
    header.push(rank_col.into());
    header.push("PL_total".into());

    let mut out = String::new();
    out.push_str(&header.join(","));
    out.push('\n');

    for row in &list.students {
        let mut cols = vec![
            row.student_id.to_string(),
            csv_quote(&row.name),
            csv_quote(&row.class),
        ];
        cols.extend(
            row.cells
                .iter()
                .map(|c| c.mark.map(|m| m.to_string()).unwrap_or_default()),
        );
        cols.push(row.total_marks.to_string());
        cols.push(row.position.to_string());
        cols.push(csv_quote(&row.total_level));
        out.push_str(&cols.join(","));
        out.push('\n');
    }

    let mut mean_cols = vec![String::new(), "MEAN".to_string(), String::new()];
    mean_cols.extend(list.subjects.iter().map(|s| {
        list.mean_scores
            .get(&s.code)
            .and_then(|m| m.as_f64())
            .map(|m| m.to_string())
            .unwrap_or_default()
    }));
    mean_cols.push(list.total_mean.to_string());
    mean_cols.push(String::new());
    mean_cols.push(csv_quote(&list.total_mean_level));
    out.push_str(&mean_cols.join(","));
    out.push('\n');
    out
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(FULL)") {
            tracing::warn!(error = %e, "wal checkpoint before export failed");
        }
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &state.config.db_file, &out)
    {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(path = %out_path, error = %e, "bundle export failed");
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    };
    tracing::info!(path = %out_path, sha256 = %export.db_sha256, "workspace exported");

    ok(
        &req.id,
        json!({
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match required_str(req, "inPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let imported = backup::import_workspace_bundle(&src, &workspace_path, &state.config.db_file);
    let reopened = db::open_db(&workspace_path, &state.config);
    match reopened {
        Ok(conn) => state.db = Some(conn),
        Err(e) => {
            state.workspace = None;
            tracing::error!(error = %e, "failed to reopen workspace after import");
            return err(&req.id, "db_open_failed", e.to_string(), None);
        }
    }

    match imported {
        Ok(import) => {
            tracing::info!(path = %in_path, sha256 = %import.db_sha256, "workspace imported");
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected,
                    "dbSha256": import.db_sha256
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": src.to_string_lossy() })),
        ),
    }
}

fn handle_exchange_export_mark_list_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let out_path = match required_str(req, "outPath") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let scope = match Scope::class(&class) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let subjects = match subjects::load(conn) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let list = match marklist::generate(conn, exam_id, &scope, &subjects) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let csv = mark_list_csv(&list);
    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, csv) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }

    ok(
        &req.id,
        json!({ "path": out_path, "rowsExported": list.students.len() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        "exchange.exportMarkListCsv" => Some(handle_exchange_export_mark_list_csv(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::csv_quote;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(csv_quote("Achieng"), "Achieng");
        assert_eq!(csv_quote("Otieno, Jr"), "\"Otieno, Jr\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
