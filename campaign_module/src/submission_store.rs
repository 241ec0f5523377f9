//! Sqlite-backed submission log. Upserts keep the latest state per
//! submission id so a late completion overwrites the earlier partial row,
//! and the completion detector reads by rowid high-water mark.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::extract::Submission;
use crate::util::{bool_to_int, format_datetime, parse_datetime};

const SUBMISSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY,
    form_id TEXT NOT NULL,
    variables TEXT NOT NULL,
    phone TEXT,
    email TEXT,
    name TEXT,
    is_complete INTEGER NOT NULL,
    completion_percent INTEGER NOT NULL,
    submitted_at TEXT NOT NULL,
    country TEXT
);

CREATE INDEX IF NOT EXISTS submissions_form_idx ON submissions(form_id, is_complete);

CREATE TABLE IF NOT EXISTS scan_marks (
    name TEXT PRIMARY KEY,
    mark INTEGER NOT NULL
);
"#;

#[derive(Debug)]
pub struct SqliteSubmissionStore {
    path: PathBuf,
}

impl SqliteSubmissionStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SUBMISSION_SCHEMA)?;
        Ok(conn)
    }

    /// Insert or replace the row for this submission id. A resubmission that
    /// completes a previously partial attempt takes over the row, which also
    /// bumps its rowid so the completion detector sees it as new.
    pub fn upsert(&self, submission: &Submission) -> Result<(), EngineError> {
        let conn = self.open()?;
        // OR REPLACE reinserts the row, so the rowid moves past any
        // detector mark taken before the resubmission.
        conn.execute(
            "INSERT OR REPLACE INTO submissions
                 (id, form_id, variables, phone, email, name, is_complete,
                  completion_percent, submitted_at, country)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                submission.id.to_string(),
                submission.form_id,
                serde_json::to_string(&submission.variables)?,
                submission.phone,
                submission.email,
                submission.name,
                bool_to_int(submission.is_complete),
                i64::from(submission.completion_percent),
                format_datetime(submission.submitted_at),
                submission.country,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Submission>, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, form_id, variables, phone, email, name, is_complete,
                    completion_percent, submitted_at, country
             FROM submissions WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_submission(row)?)),
            None => Ok(None),
        }
    }

    /// Completed submissions with rowid greater than `mark`, oldest first.
    /// Each result carries its rowid so the caller can advance the mark.
    pub fn completed_since(
        &self,
        mark: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Submission)>, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, id, form_id, variables, phone, email, name, is_complete,
                    completion_percent, submitted_at, country
             FROM submissions
             WHERE rowid > ?1 AND is_complete = 1
             ORDER BY rowid
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![mark, limit as i64])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            results.push((rowid, offset_row_to_submission(row)?));
        }
        Ok(results)
    }

    /// Load a persisted scan mark. `None` until the first save.
    pub fn load_mark(&self, name: &str) -> Result<Option<i64>, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT mark FROM scan_marks WHERE name = ?1")?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Persist a scan mark so scanners survive restarts without replaying
    /// or skipping the log.
    pub fn save_mark(&self, name: &str, mark: i64) -> Result<(), EngineError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO scan_marks (name, mark) VALUES (?1, ?2)",
            params![name, mark],
        )?;
        Ok(())
    }

    /// Current end of the log; a first-boot scanner starts here.
    pub fn max_rowid(&self) -> Result<i64, EngineError> {
        let conn = self.open()?;
        let mark: i64 = conn.query_row(
            "SELECT COALESCE(MAX(rowid), 0) FROM submissions",
            [],
            |row| row.get(0),
        )?;
        Ok(mark)
    }
}

fn row_to_submission(row: &Row<'_>) -> Result<Submission, EngineError> {
    build_submission(row, 0)
}

fn offset_row_to_submission(row: &Row<'_>) -> Result<Submission, EngineError> {
    build_submission(row, 1)
}

fn build_submission(row: &Row<'_>, base: usize) -> Result<Submission, EngineError> {
    let id_raw: String = row.get(base)?;
    let variables_raw: String = row.get(base + 2)?;
    let is_complete: i64 = row.get(base + 6)?;
    let completion_percent: i64 = row.get(base + 7)?;
    let submitted_at_raw: String = row.get(base + 8)?;

    Ok(Submission {
        id: Uuid::parse_str(&id_raw)?,
        form_id: row.get(base + 1)?,
        variables: serde_json::from_str(&variables_raw)?,
        phone: row.get(base + 3)?,
        email: row.get(base + 4)?,
        name: row.get(base + 5)?,
        is_complete: is_complete != 0,
        completion_percent: completion_percent.clamp(0, 100) as u8,
        submitted_at: parse_datetime(&submitted_at_raw)?,
        country: row.get(base + 9)?,
    })
}
