use anyhow::Context;
use std::env;

pub const DEFAULT_DB_FILE: &str = "marklist.sqlite3";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Process-wide settings read from the environment once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub db_file: String,
    pub busy_timeout_ms: u64,
    pub log_filter: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_file: DEFAULT_DB_FILE.to_string(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            log_filter: "info".to_string(),
            log_json: false,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("MARKLIST_DB_FILE").filter(|v| !v.trim().is_empty()) {
            let v = v.trim();
            if v.contains('/') || v.contains('\\') {
                anyhow::bail!("MARKLIST_DB_FILE must be a bare file name, got {v:?}");
            }
            cfg.db_file = v.to_string();
        }
        if let Some(v) = lookup("MARKLIST_BUSY_TIMEOUT_MS") {
            cfg.busy_timeout_ms = v
                .trim()
                .parse()
                .with_context(|| format!("MARKLIST_BUSY_TIMEOUT_MS is not a number: {v:?}"))?;
        }
        if let Some(v) = lookup("MARKLIST_LOG").or_else(|| lookup("RUST_LOG")) {
            if !v.trim().is_empty() {
                cfg.log_filter = v.trim().to_string();
            }
        }
        if let Some(v) = lookup("MARKLIST_LOG_JSON") {
            cfg.log_json = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        Ok(cfg)
    }
}
