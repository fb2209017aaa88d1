//! Analysis sessions and issues

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{format_datetime, parse_date, parse_datetime, parse_enum, Database};
use crate::analysis::{
    AnalysisIssue, AnalysisSession, Fix, IssueStatus, IssueType, SessionStatus, Severity,
};
use crate::error::{Error, Result};

const SESSION_COLUMNS: &str = "id, status, start_date, end_date, issues_found, issues_fixed, \
     coherence_score, error, started_at, completed_at, last_activity";

const ISSUE_COLUMNS: &str = "id, session_id, issue_type, severity, description, transaction_ids, \
     current_category, suggested_category, confidence, fix, status, fixed_at, error";

impl Database {
    /// Start a new pending session
    pub fn create_analysis_session(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<AnalysisSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = format_datetime(&Utc::now());
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO analysis_sessions (id, status, start_date, end_date, started_at, last_activity)
            VALUES (?, 'pending', ?, ?, ?, ?)
            "#,
            params![
                id,
                start_date.map(|d| d.to_string()),
                end_date.map(|d| d.to_string()),
                now,
                now
            ],
        )?;
        drop(conn);
        self.get_analysis_session(&id)?
            .ok_or_else(|| Error::NotFound(format!("analysis session {}", id)))
    }

    pub fn get_analysis_session(&self, id: &str) -> Result<Option<AnalysisSession>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM analysis_sessions WHERE id = ?", SESSION_COLUMNS);
        let session = conn
            .query_row(&sql, params![id], row_to_session)
            .optional()?;
        Ok(session)
    }

    /// Sessions, most recent first
    pub fn list_analysis_sessions(&self) -> Result<Vec<AnalysisSession>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM analysis_sessions ORDER BY started_at DESC, id",
            SESSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_session)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_analysis_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE analysis_sessions SET status = ?, error = NULL, last_activity = ? WHERE id = ?",
            params![status.as_str(), format_datetime(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("analysis session {}", id)));
        }
        Ok(())
    }

    pub fn complete_analysis_session(&self, id: &str, coherence_score: Option<f64>) -> Result<()> {
        let now = format_datetime(&Utc::now());
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE analysis_sessions SET
                status = 'completed',
                coherence_score = ?2,
                issues_found = (SELECT COUNT(*) FROM analysis_issues WHERE session_id = ?1),
                error = NULL,
                completed_at = ?3,
                last_activity = ?3
            WHERE id = ?1
            "#,
            params![id, coherence_score, now],
        )?;
        Ok(())
    }

    pub fn fail_analysis_session(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE analysis_sessions SET status = 'failed', error = ?, last_activity = ? WHERE id = ?",
            params![error, format_datetime(&Utc::now()), id],
        )?;
        Ok(())
    }

    /// Drop the session's pending issues and store a fresh set
    ///
    /// Fixed, dismissed and failed issues are kept.
    pub fn replace_pending_issues(&self, session_id: &str, issues: &[AnalysisIssue]) -> Result<()> {
        let mut conn = self.conn()?;
        let db_tx = conn.transaction()?;
        db_tx.execute(
            "DELETE FROM analysis_issues WHERE session_id = ? AND status = 'pending'",
            params![session_id],
        )?;
        for issue in issues {
            insert_issue_with(&db_tx, issue)?;
        }
        db_tx.commit()?;
        Ok(())
    }

    pub fn get_analysis_issue(&self, id: &str) -> Result<Option<AnalysisIssue>> {
        let conn = self.conn()?;
        get_issue_with(&conn, id)
    }

    pub fn list_analysis_issues(&self, session_id: &str) -> Result<Vec<AnalysisIssue>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM analysis_issues WHERE session_id = ? ORDER BY created_at, rowid",
            ISSUE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id], row_to_issue)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Record a terminal non-fixed status (dismissed or failed)
    pub fn set_analysis_issue_status(
        &self,
        id: &str,
        status: IssueStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE analysis_issues SET status = ?, error = ? WHERE id = ?",
            params![status.as_str(), error, id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("analysis issue {}", id)));
        }
        Ok(())
    }
}

pub(crate) fn get_issue_with(conn: &Connection, id: &str) -> Result<Option<AnalysisIssue>> {
    let sql = format!("SELECT {} FROM analysis_issues WHERE id = ?", ISSUE_COLUMNS);
    let issue = conn
        .query_row(&sql, params![id], row_to_issue)
        .optional()?;
    Ok(issue)
}

/// Mark an issue fixed and bump its session's counter
pub(crate) fn mark_issue_fixed_with(conn: &Connection, issue: &AnalysisIssue) -> Result<()> {
    let now = format_datetime(&Utc::now());
    conn.execute(
        "UPDATE analysis_issues SET status = 'fixed', fixed_at = ?, error = NULL WHERE id = ?",
        params![now, issue.id],
    )?;
    conn.execute(
        "UPDATE analysis_sessions SET issues_fixed = issues_fixed + 1, last_activity = ? WHERE id = ?",
        params![now, issue.session_id],
    )?;
    Ok(())
}

fn insert_issue_with(conn: &Connection, issue: &AnalysisIssue) -> Result<()> {
    let fix_json = issue.fix.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO analysis_issues ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ISSUE_COLUMNS
        ),
        params![
            issue.id,
            issue.session_id,
            issue.issue_type.as_str(),
            issue.severity.as_str(),
            issue.description,
            serde_json::to_string(&issue.transaction_ids)?,
            issue.current_category,
            issue.suggested_category,
            issue.confidence,
            fix_json,
            issue.status.as_str(),
            issue.fixed_at.as_ref().map(format_datetime),
            issue.error,
        ],
    )?;
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<AnalysisSession> {
    let status: String = row.get(1)?;
    let start_date: Option<String> = row.get(2)?;
    let end_date: Option<String> = row.get(3)?;
    let started_at: String = row.get(8)?;
    let completed_at: Option<String> = row.get(9)?;
    let last_activity: String = row.get(10)?;
    Ok(AnalysisSession {
        id: row.get(0)?,
        status: parse_enum::<SessionStatus>(1, &status)?,
        start_date: start_date.as_deref().map(parse_date).transpose()?,
        end_date: end_date.as_deref().map(parse_date).transpose()?,
        issues_found: row.get(4)?,
        issues_fixed: row.get(5)?,
        coherence_score: row.get(6)?,
        error: row.get(7)?,
        started_at: parse_datetime(&started_at),
        completed_at: completed_at.as_deref().map(parse_datetime),
        last_activity: parse_datetime(&last_activity),
    })
}

fn row_to_issue(row: &rusqlite::Row) -> rusqlite::Result<AnalysisIssue> {
    let issue_type: String = row.get(2)?;
    let severity: String = row.get(3)?;
    let transaction_ids: String = row.get(5)?;
    let fix: Option<String> = row.get(9)?;
    let status: String = row.get(10)?;
    let fixed_at: Option<String> = row.get(11)?;
    Ok(AnalysisIssue {
        id: row.get(0)?,
        session_id: row.get(1)?,
        issue_type: parse_enum::<IssueType>(2, &issue_type)?,
        severity: parse_enum::<Severity>(3, &severity)?,
        description: row.get(4)?,
        transaction_ids: json_column(5, &transaction_ids)?,
        current_category: row.get(6)?,
        suggested_category: row.get(7)?,
        confidence: row.get(8)?,
        fix: fix.as_deref().map(|f| json_column::<Fix>(9, f)).transpose()?,
        status: parse_enum::<IssueStatus>(10, &status)?,
        fixed_at: fixed_at.as_deref().map(parse_datetime),
        error: row.get(12)?,
    })
}
