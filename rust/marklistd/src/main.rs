mod backup;
mod boundaries;
mod calc;
mod config;
mod db;
mod ipc;
mod marklist;
mod reports;
mod subjects;

use std::io::{self, BufRead, Write};

use tracing_subscriber::EnvFilter;

fn init_tracing(cfg: &config::DaemonConfig) {
    let filter = EnvFilter::try_new(&cfg.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the IPC stream; logs go to stderr.
    if cfg.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_ansi(false)
            .init();
    }
}

fn main() {
    let cfg = match config::DaemonConfig::from_env() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("marklistd: invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };
    init_tracing(&cfg);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        db_file = %cfg.db_file,
        busy_timeout_ms = cfg.busy_timeout_ms,
        "marklistd starting"
    );

    let mut state = ipc::AppState::new(cfg);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "malformed request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("marklistd stopped");
}
