use crate::calc::CalcError;
use crate::db;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const SETTINGS_KEY: &str = "subjects";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub code: String,
    pub name: String,
}

impl Subject {
    fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
        }
    }
}

/// Lower school / JSS deployment: nine subjects.
pub fn lower_preset() -> Vec<Subject> {
    vec![
        Subject::new("english", "English"),
        Subject::new("kiswahili", "Kiswahili"),
        Subject::new("mathematics", "Mathematics"),
        Subject::new("integrated_science", "Integrated Science"),
        Subject::new("social_studies", "Social Studies"),
        Subject::new("cre", "Religious Education"),
        Subject::new("pretech", "Pre-Technical Studies"),
        Subject::new("agriculture", "Agriculture & Nutrition"),
        Subject::new("creative_arts", "Creative Arts & Sports"),
    ]
}

/// Upper-stream deployment: eight subjects.
pub fn upper_preset() -> Vec<Subject> {
    vec![
        Subject::new("english", "English"),
        Subject::new("kiswahili", "Kiswahili"),
        Subject::new("mathematics", "Mathematics"),
        Subject::new("science", "Science & Technology"),
        Subject::new("social_studies", "Social Studies"),
        Subject::new("cre", "Religious Education"),
        Subject::new("agriculture", "Agriculture"),
        Subject::new("creative_arts", "Creative Arts"),
    ]
}

pub fn preset(name: &str) -> Option<Vec<Subject>> {
    match name.to_ascii_lowercase().as_str() {
        "lower" | "jss" => Some(lower_preset()),
        "upper" => Some(upper_preset()),
        _ => None,
    }
}

/// Subject codes become JSON keys (`<code>`, `PL_<code>`) in mark lists, so
/// they are restricted to lowercase ascii, digits and underscores.
pub fn validate(subjects: &[Subject]) -> Result<(), CalcError> {
    if subjects.is_empty() {
        return Err(CalcError::bad_params("subject list must not be empty"));
    }
    let mut seen = HashSet::new();
    for s in subjects {
        let code_ok = !s.code.is_empty()
            && s.code
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !code_ok {
            return Err(CalcError::bad_params(format!(
                "invalid subject code: {:?}",
                s.code
            )));
        }
        if s.name.trim().is_empty() {
            return Err(CalcError::bad_params(format!(
                "subject {} has an empty name",
                s.code
            )));
        }
        if !seen.insert(s.code.as_str()) {
            return Err(CalcError::bad_params(format!(
                "duplicate subject code: {}",
                s.code
            )));
        }
    }
    Ok(())
}

/// Configured subject list for the workspace; the lower preset until one is saved.
pub fn load(conn: &Connection) -> Result<Vec<Subject>, CalcError> {
    let stored = db::settings_get_json(conn, SETTINGS_KEY).map_err(CalcError::query)?;
    let Some(value) = stored else {
        return Ok(lower_preset());
    };
    serde_json::from_value(value).map_err(|e| {
        CalcError::new(
            "config_invalid",
            format!("stored subject list is malformed: {e}"),
        )
    })
}

pub fn save(conn: &Connection, subjects: &[Subject]) -> Result<(), CalcError> {
    validate(subjects)?;
    let value = serde_json::to_value(subjects).map_err(|e| CalcError::new("internal", e.to_string()))?;
    db::settings_set_json(conn, SETTINGS_KEY, &value).map_err(CalcError::persistence)
}
