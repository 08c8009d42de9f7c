use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use crate::config::DaemonConfig;

pub fn open_db(workspace: &Path, cfg: &DaemonConfig) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(&cfg.db_file);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            name TEXT PRIMARY KEY,
            grade INTEGER NOT NULL,
            stream_label TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_grade ON classes(grade)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            student_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            class TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Active',
            FOREIGN KEY(class) REFERENCES classes(name)
        )",
        [],
    )?;
    ensure_students_admission_no(conn)?;
    ensure_students_updated_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_classes(
            student_id INTEGER NOT NULL,
            class TEXT NOT NULL,
            academic_year INTEGER NOT NULL,
            PRIMARY KEY(student_id, academic_year),
            FOREIGN KEY(student_id) REFERENCES students(student_id),
            FOREIGN KEY(class) REFERENCES classes(name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            exam_id INTEGER PRIMARY KEY AUTOINCREMENT,
            exam_name TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            term INTEGER NOT NULL,
            date_created TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_results(
            id TEXT PRIMARY KEY,
            student_id INTEGER NOT NULL,
            exam_id INTEGER NOT NULL,
            total_marks INTEGER,
            position INTEGER,
            stream_position INTEGER,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(exam_id),
            UNIQUE(student_id, exam_id)
        )",
        [],
    )?;
    ensure_exam_results_stream_position(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_results_exam ON exam_results(exam_id)",
        [],
    )?;

    // Subject marks of an exam result, one row per configured subject.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_marks(
            exam_id INTEGER NOT NULL,
            student_id INTEGER NOT NULL,
            subject TEXT NOT NULL,
            mark INTEGER,
            PRIMARY KEY(exam_id, student_id, subject),
            FOREIGN KEY(student_id) REFERENCES students(student_id),
            FOREIGN KEY(exam_id) REFERENCES exams(exam_id)
        )",
        [],
    )?;

    for table in ["point_boundaries", "total_point_boundaries"] {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}(
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    min_marks REAL NOT NULL,
                    max_marks REAL NOT NULL,
                    pl TEXT NOT NULL,
                    ab TEXT NOT NULL,
                    sort_order INTEGER NOT NULL
                )",
                table
            ),
            [],
        )?;
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_mean_scores(
            exam_id INTEGER NOT NULL,
            class TEXT NOT NULL,
            subject_means TEXT NOT NULL,
            total_mean REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(exam_id, class),
            FOREIGN KEY(exam_id) REFERENCES exams(exam_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_mean_scores_class ON exam_mean_scores(class, exam_id)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let text: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(text) = text else {
        return Ok(None);
    };
    let value = serde_json::from_str(&text)
        .with_context(|| format!("setting {} holds invalid JSON", key))?;
    Ok(Some(value))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_students_admission_no(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "admission_no")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN admission_no TEXT", [])?;
    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

// Workspaces created before stream ranking only stored the class position.
fn ensure_exam_results_stream_position(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exam_results", "stream_position")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE exam_results ADD COLUMN stream_position INTEGER",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
