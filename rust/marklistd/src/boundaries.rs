use crate::calc::{CalcError, PointBoundary};
use rusqlite::Connection;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    /// Bands for a single subject mark (0..=100).
    Subject,
    /// Bands for a student's total across all subjects.
    Total,
}

impl BoundaryKind {
    pub fn parse(raw: Option<&str>) -> Result<Self, CalcError> {
        match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
            None | Some("subject") => Ok(BoundaryKind::Subject),
            Some("total") => Ok(BoundaryKind::Total),
            Some(other) => Err(CalcError::bad_params("kind must be one of: subject, total")
                .with_details(json!({ "kind": other }))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BoundaryKind::Subject => "subject",
            BoundaryKind::Total => "total",
        }
    }

    fn table(self) -> &'static str {
        match self {
            BoundaryKind::Subject => "point_boundaries",
            BoundaryKind::Total => "total_point_boundaries",
        }
    }
}

pub fn load(conn: &Connection, kind: BoundaryKind) -> Result<Vec<PointBoundary>, CalcError> {
    let sql = format!(
        "SELECT min_marks, max_marks, pl, ab FROM {} ORDER BY sort_order, id",
        kind.table()
    );
    let mut stmt = conn.prepare(&sql).map_err(CalcError::query)?;
    stmt.query_map([], |r| {
        Ok(PointBoundary {
            min_marks: r.get(0)?,
            max_marks: r.get(1)?,
            pl: r.get(2)?,
            ab: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(CalcError::query)
}

/// Rejects inverted or overlapping intervals and blank labels. Uncovered
/// whole marks inside the covered span come back as warnings; those marks
/// classify as `UNKNOWN`.
pub fn validate(boundaries: &[PointBoundary]) -> Result<Vec<String>, CalcError> {
    for (i, b) in boundaries.iter().enumerate() {
        if !b.min_marks.is_finite() || !b.max_marks.is_finite() || b.min_marks < 0.0 {
            return Err(
                CalcError::bad_params("boundary marks must be finite and non-negative")
                    .with_details(json!({ "index": i })),
            );
        }
        if b.min_marks > b.max_marks {
            return Err(CalcError::bad_params("boundary minMarks exceeds maxMarks")
                .with_details(json!({ "index": i, "minMarks": b.min_marks, "maxMarks": b.max_marks })));
        }
        if b.pl.trim().is_empty() || b.ab.trim().is_empty() {
            return Err(CalcError::bad_params("boundary pl and ab must not be empty")
                .with_details(json!({ "index": i })));
        }
    }

    let mut sorted: Vec<(usize, &PointBoundary)> = boundaries.iter().enumerate().collect();
    sorted.sort_by(|(_, a), (_, b)| a.min_marks.total_cmp(&b.min_marks));

    let mut warnings = Vec::new();
    for pair in sorted.windows(2) {
        let (ia, a) = pair[0];
        let (ib, b) = pair[1];
        if b.min_marks <= a.max_marks {
            return Err(CalcError::bad_params("boundaries overlap").with_details(json!({
                "first": ia,
                "second": ib,
                "at": b.min_marks,
            })));
        }
        if b.min_marks - a.max_marks > 1.0 {
            warnings.push(format!(
                "marks between {} and {} match no band",
                a.max_marks, b.min_marks
            ));
        }
    }
    Ok(warnings)
}

pub fn replace(
    conn: &Connection,
    kind: BoundaryKind,
    boundaries: &[PointBoundary],
) -> Result<Vec<String>, CalcError> {
    let warnings = validate(boundaries)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(CalcError::persistence)?;
    tx.execute(&format!("DELETE FROM {}", kind.table()), [])
        .map_err(CalcError::persistence)?;
    let insert = format!(
        "INSERT INTO {}(min_marks, max_marks, pl, ab, sort_order) VALUES(?, ?, ?, ?, ?)",
        kind.table()
    );
    for (i, b) in boundaries.iter().enumerate() {
        tx.execute(
            &insert,
            (b.min_marks, b.max_marks, b.pl.trim(), b.ab.trim(), i as i64),
        )
        .map_err(CalcError::persistence)?;
    }
    tx.commit().map_err(CalcError::persistence)?;

    for w in &warnings {
        tracing::warn!(kind = kind.as_str(), "{}", w);
    }
    Ok(warnings)
}
