//! Applying analysis fixes
//!
//! Each fix runs in one SQLite transaction: the fix operation itself, the issue
//! status and the session counter commit together or not at all.

use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{AnalysisIssue, Fix, IssueStatus};
use crate::db::{
    find_pattern_rule_with, get_issue_with, insert_pattern_rule_with,
    insert_vendor_rule_if_absent_with, mark_issue_fixed_with, upsert_classification_with,
    Database,
};
use crate::error::{Error, Result};
use crate::models::{Classification, ClassificationStatus, VendorRuleSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum FixOutcome {
    Applied,
    /// The issue was fixed earlier; nothing was touched
    AlreadyApplied,
    /// Only produced by [`FixApplier::apply_session`]
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FixResult {
    pub issue_id: String,
    /// `recategorize`, `create_vendor_rule` or `create_pattern_rule`
    pub kind: &'static str,
    pub outcome: FixOutcome,
    /// Rows the fix wrote (0 when everything it asked for already existed)
    pub changed: usize,
}

impl FixResult {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, FixOutcome::Failed(_))
    }
}

/// Applies stored fixes
pub struct FixApplier {
    db: Database,
}

impl FixApplier {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply the fix of one issue
    ///
    /// Applying an already fixed issue is a successful no-op.
    pub fn apply(&self, issue_id: &str) -> Result<FixResult> {
        let mut conn = self.db.conn()?;
        let db_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let issue = get_issue_with(&db_tx, issue_id)?
            .ok_or_else(|| Error::NotFound(format!("analysis issue {}", issue_id)))?;
        let fix = issue
            .fix
            .as_ref()
            .ok_or_else(|| Error::InvalidData(format!("issue {} has no fix", issue_id)))?;

        match issue.status {
            IssueStatus::Fixed => {
                debug!(issue = %issue_id, "Fix already applied");
                return Ok(FixResult {
                    issue_id: issue.id.clone(),
                    kind: fix.kind(),
                    outcome: FixOutcome::AlreadyApplied,
                    changed: 0,
                });
            }
            IssueStatus::Dismissed => {
                return Err(Error::InvalidData(format!(
                    "issue {} was dismissed",
                    issue_id
                )))
            }
            IssueStatus::Pending | IssueStatus::Failed => {}
        }

        let changed = apply_fix_with(&db_tx, &issue, fix)?;
        mark_issue_fixed_with(&db_tx, &issue)?;
        db_tx.commit()?;

        info!(issue = %issue.id, fix = fix.kind(), changed, "Applied fix");
        Ok(FixResult {
            issue_id: issue.id.clone(),
            kind: fix.kind(),
            outcome: FixOutcome::Applied,
            changed,
        })
    }

    /// Apply every pending fixable issue of a session with confidence >= `min_confidence`
    ///
    /// Failures are recorded on the issue and reported; they do not stop the run.
    pub fn apply_session(&self, session_id: &str, min_confidence: f64) -> Result<Vec<FixResult>> {
        if self.db.get_analysis_session(session_id)?.is_none() {
            return Err(Error::NotFound(format!("analysis session {}", session_id)));
        }

        let candidates: Vec<AnalysisIssue> = self
            .db
            .list_analysis_issues(session_id)?
            .into_iter()
            .filter(|i| i.status == IssueStatus::Pending && i.fix.is_some())
            .filter(|i| i.confidence >= min_confidence)
            .collect();

        let mut results = Vec::with_capacity(candidates.len());
        for issue in candidates {
            let kind = issue.fix.as_ref().map(|f| f.kind()).unwrap_or("none");
            match self.apply(&issue.id) {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(issue = %issue.id, error = %e, "Fix failed");
                    let message = e.to_string();
                    if let Err(db_err) =
                        self.db
                            .set_analysis_issue_status(&issue.id, IssueStatus::Failed, Some(&message))
                    {
                        warn!(issue = %issue.id, error = %db_err, "Failed to record fix failure");
                    }
                    results.push(FixResult {
                        issue_id: issue.id.clone(),
                        kind,
                        outcome: FixOutcome::Failed(message),
                        changed: 0,
                    });
                }
            }
        }

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            session = %session_id,
            attempted = results.len(),
            failed,
            "Session fixes applied"
        );
        Ok(results)
    }

    /// Mark an issue as not worth fixing
    pub fn dismiss(&self, issue_id: &str) -> Result<()> {
        let issue = self
            .db
            .get_analysis_issue(issue_id)?
            .ok_or_else(|| Error::NotFound(format!("analysis issue {}", issue_id)))?;
        if issue.status == IssueStatus::Fixed {
            return Err(Error::InvalidData(format!(
                "issue {} is already fixed",
                issue_id
            )));
        }
        self.db
            .set_analysis_issue_status(issue_id, IssueStatus::Dismissed, None)
    }
}

/// Run the fix operation; every branch is safe to repeat
fn apply_fix_with(conn: &Connection, issue: &AnalysisIssue, fix: &Fix) -> Result<usize> {
    ensure_category_with(conn, fix.category())?;
    match fix {
        Fix::Recategorize {
            transaction_ids,
            category,
        } => {
            for id in transaction_ids {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM transactions WHERE id = ?)",
                    params![id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(Error::NotFound(format!("transaction {}", id)));
                }
                let classification = Classification::new(
                    id,
                    category,
                    ClassificationStatus::UserModified,
                    1.0,
                )
                .with_notes(format!("analysis fix {}", issue.id));
                upsert_classification_with(conn, &classification)?;
            }
            Ok(transaction_ids.len())
        }
        Fix::CreateVendorRule {
            merchant,
            category,
            is_regex,
        } => {
            let created = insert_vendor_rule_if_absent_with(
                conn,
                merchant,
                category,
                *is_regex,
                VendorRuleSource::AutoConfirmed,
            )?;
            Ok(usize::from(created))
        }
        Fix::CreatePatternRule { rule } => {
            if find_pattern_rule_with(conn, &rule.name, &rule.category)?.is_some() {
                return Ok(0);
            }
            insert_pattern_rule_with(conn, rule)?;
            Ok(1)
        }
    }
}

fn ensure_category_with(conn: &Connection, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidData("fix category must not be empty".into()));
    }
    let created = conn.execute(
        "INSERT OR IGNORE INTO categories (name) VALUES (?)",
        params![name],
    )?;
    if created > 0 {
        info!(category = %name, "Created category for fix");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{IssueType, Severity};
    use crate::models::{NewPatternRule, Transaction};
    use chrono::NaiveDate;

    fn setup() -> (Database, String) {
        let db = Database::in_memory().unwrap();
        db.seed_default_categories().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        for id in ["1", "2"] {
            db.insert_transaction(&Transaction::new(id, date, "SHELL", 30.0))
                .unwrap();
            db.upsert_classification(&Classification::new(
                id,
                "Groceries",
                ClassificationStatus::ClassifiedByAi,
                0.7,
            ))
            .unwrap();
        }
        let session = db.create_analysis_session(None, None).unwrap();
        (db, session.id)
    }

    fn store(db: &Database, session_id: &str, fix: Fix, confidence: f64) -> String {
        let issue = AnalysisIssue::new(
            session_id,
            IssueType::Misclassified,
            Severity::Medium,
            "test",
            vec!["1".into()],
            confidence,
        )
        .with_fix(fix);
        let id = issue.id.clone();
        let mut issues = db
            .list_analysis_issues(session_id)
            .unwrap()
            .into_iter()
            .filter(|i| i.status == IssueStatus::Pending)
            .collect::<Vec<_>>();
        issues.push(issue);
        db.replace_pending_issues(session_id, &issues).unwrap();
        id
    }

    fn recategorize(category: &str) -> Fix {
        Fix::Recategorize {
            transaction_ids: vec!["1".into(), "2".into()],
            category: category.into(),
        }
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let (db, session_id) = setup();
        let issue_id = store(&db, &session_id, recategorize("Transport"), 0.9);
        let applier = FixApplier::new(db.clone());

        let first = applier.apply(&issue_id).unwrap();
        assert_eq!(first.outcome, FixOutcome::Applied);
        assert_eq!(first.changed, 2);
        let after_first = db.list_classifications().unwrap();

        let second = applier.apply(&issue_id).unwrap();
        assert_eq!(second.outcome, FixOutcome::AlreadyApplied);
        assert!(second.is_success());

        let after_second = db.list_classifications().unwrap();
        assert_eq!(after_first.len(), after_second.len());
        for (a, b) in after_first.iter().zip(&after_second) {
            assert_eq!(a.category, "Transport");
            assert_eq!(a.category, b.category);
            assert_eq!(a.status, ClassificationStatus::UserModified);
            assert_eq!(a.status, b.status);
        }
        let session = db.get_analysis_session(&session_id).unwrap().unwrap();
        assert_eq!(session.issues_fixed, 1);
        let issue = db.get_analysis_issue(&issue_id).unwrap().unwrap();
        assert_eq!(issue.status, IssueStatus::Fixed);
        assert!(issue.fixed_at.is_some());
    }

    #[test]
    fn test_vendor_rule_fix_is_insert_or_ignore() {
        let (db, session_id) = setup();
        db.add_vendor_rule("SHELL", "Transport", false).unwrap();
        let issue_id = store(
            &db,
            &session_id,
            Fix::CreateVendorRule {
                merchant: "shell".into(),
                category: "Fuel".into(),
                is_regex: false,
            },
            0.9,
        );

        let result = FixApplier::new(db.clone()).apply(&issue_id).unwrap();
        assert_eq!(result.outcome, FixOutcome::Applied);
        assert_eq!(result.changed, 0);
        assert_eq!(
            db.get_vendor_rule("SHELL").unwrap().unwrap().category,
            "Transport"
        );
        // The fix category is added to the catalogue
        assert!(db.category_exists("Fuel").unwrap());
    }

    #[test]
    fn test_pattern_rule_fix_not_duplicated() {
        let (db, session_id) = setup();
        let rule = NewPatternRule {
            name: "big fuel".into(),
            merchant: None,
            amount: Default::default(),
            direction: None,
            category: "Transport".into(),
            confidence: 0.8,
            priority: 1,
        };
        let first = store(&db, &session_id, Fix::CreatePatternRule { rule: rule.clone() }, 0.9);
        let second = store(&db, &session_id, Fix::CreatePatternRule { rule }, 0.9);
        let applier = FixApplier::new(db.clone());

        assert_eq!(applier.apply(&first).unwrap().changed, 1);
        assert_eq!(applier.apply(&second).unwrap().changed, 0);
        assert_eq!(db.list_pattern_rules(false).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_fix_rolls_back_and_session_continues() {
        let (db, session_id) = setup();
        let bad = store(
            &db,
            &session_id,
            Fix::Recategorize {
                transaction_ids: vec!["1".into(), "missing".into()],
                category: "Transport".into(),
            },
            0.95,
        );
        let good = store(
            &db,
            &session_id,
            Fix::CreateVendorRule {
                merchant: "SHELL".into(),
                category: "Transport".into(),
                is_regex: false,
            },
            0.9,
        );
        let skipped = store(&db, &session_id, recategorize("Dining"), 0.2);

        let results = FixApplier::new(db.clone())
            .apply_session(&session_id, 0.5)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].outcome, FixOutcome::Failed(_)));
        assert_eq!(results[0].issue_id, bad);
        assert_eq!(results[1].outcome, FixOutcome::Applied);
        assert_eq!(results[1].issue_id, good);

        // Partial recategorization was rolled back
        assert_eq!(
            db.get_classification("1").unwrap().unwrap().category,
            "Groceries"
        );
        let bad_issue = db.get_analysis_issue(&bad).unwrap().unwrap();
        assert_eq!(bad_issue.status, IssueStatus::Failed);
        assert!(bad_issue.error.unwrap().contains("missing"));
        assert_eq!(
            db.get_analysis_issue(&skipped).unwrap().unwrap().status,
            IssueStatus::Pending
        );
    }

    #[test]
    fn test_dismiss() {
        let (db, session_id) = setup();
        let issue_id = store(&db, &session_id, recategorize("Transport"), 0.9);
        let applier = FixApplier::new(db.clone());

        applier.dismiss(&issue_id).unwrap();
        assert_eq!(
            db.get_analysis_issue(&issue_id).unwrap().unwrap().status,
            IssueStatus::Dismissed
        );
        assert!(applier.apply(&issue_id).is_err());
        assert!(matches!(applier.dismiss("nope"), Err(Error::NotFound(_))));
    }
}
