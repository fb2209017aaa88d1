//! Analysis sessions: local consistency checks plus an AI review

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::types::{AnalysisIssue, AnalysisSession, Fix, IssueType, SessionStatus, Severity};
use crate::batch::merchant_signature;
use crate::cancel::CancelToken;
use crate::classifier::{parsing, prompts, Classifier};
use crate::db::{ClassifiedTransaction, Database};
use crate::error::{Error, Result};
use crate::models::{ClassificationStatus, Transaction};
use crate::retry::RetryPolicy;
use crate::rules::{RuleKind, RuleMatcher};

/// AI-classified transactions a merchant needs before a vendor rule is suggested
const MIN_PATTERN_TRANSACTIONS: usize = 3;

/// Most recent classified transactions sent to the classifier for review
const MAX_REVIEW_ROWS: usize = 200;

/// What to analyze
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Resume this session instead of starting a new one
    pub session_id: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Keep only the most severe issues
    pub max_issues: Option<usize>,
}

/// Result of [`AnalysisEngine::analyze`]
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub session: AnalysisSession,
    /// Every issue stored for the session, including ones fixed earlier
    pub issues: Vec<AnalysisIssue>,
    /// Classified transactions looked at
    pub reviewed: usize,
    /// AI issues discarded by validation
    pub dropped: usize,
    /// The session existed before this call
    pub resumed: bool,
}

/// Issue as the classifier reports it
#[derive(Debug, Deserialize)]
struct ReviewedIssue {
    #[serde(rename = "type")]
    issue_type: IssueType,
    #[serde(default = "default_severity")]
    severity: Severity,
    #[serde(default)]
    description: String,
    #[serde(default)]
    transaction_ids: Vec<String>,
    #[serde(default)]
    current_category: Option<String>,
    #[serde(default)]
    suggested_category: Option<String>,
    confidence: f64,
    #[serde(default)]
    fix: Option<Fix>,
}

fn default_severity() -> Severity {
    Severity::Medium
}

/// Envelope of the classifier's review; issues are decoded one by one
#[derive(Debug, Deserialize)]
struct ReviewResponse {
    #[serde(default)]
    coherence_score: Option<f64>,
    #[serde(default)]
    issues: Vec<serde_json::Value>,
}

struct Review {
    coherence_score: Option<f64>,
    issues: Vec<AnalysisIssue>,
    dropped: usize,
}

/// Session-driven reviewer of existing classifications
pub struct AnalysisEngine<C: Classifier> {
    db: Database,
    classifier: Arc<C>,
    retry: RetryPolicy,
}

impl<C: Classifier> AnalysisEngine<C> {
    pub fn new(db: Database, classifier: C) -> Self {
        Self {
            db,
            classifier: Arc::new(classifier),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run (or resume) an analysis session
    ///
    /// A completed session is returned as stored. Cancellation leaves the session
    /// `in_progress` so it can be resumed; any other failure marks it `failed`.
    pub async fn analyze(
        &self,
        cancel: &CancelToken,
        options: &AnalysisOptions,
    ) -> Result<AnalysisReport> {
        let (session, resumed) = match &options.session_id {
            Some(id) => {
                let session = self
                    .db
                    .get_analysis_session(id)?
                    .ok_or_else(|| Error::NotFound(format!("analysis session {}", id)))?;
                if session.status == SessionStatus::Completed {
                    debug!(session = %session.id, "Session already completed");
                    let issues = self.db.list_analysis_issues(&session.id)?;
                    return Ok(AnalysisReport {
                        session,
                        issues,
                        reviewed: 0,
                        dropped: 0,
                        resumed: true,
                    });
                }
                (session, true)
            }
            None => (
                self.db
                    .create_analysis_session(options.start_date, options.end_date)?,
                false,
            ),
        };

        cancel.check()?;
        self.db
            .set_analysis_session_status(&session.id, SessionStatus::InProgress)?;
        info!(
            session = %session.id,
            resumed,
            classifier = self.classifier.name(),
            "Starting analysis"
        );

        match self.run(cancel, &session, options.max_issues).await {
            Ok((reviewed, dropped)) => {
                let session = self
                    .db
                    .get_analysis_session(&session.id)?
                    .ok_or_else(|| Error::NotFound(format!("analysis session {}", session.id)))?;
                let issues = self.db.list_analysis_issues(&session.id)?;
                info!(
                    session = %session.id,
                    reviewed,
                    issues = issues.len(),
                    dropped,
                    coherence = ?session.coherence_score,
                    "Analysis complete"
                );
                Ok(AnalysisReport {
                    session,
                    issues,
                    reviewed,
                    dropped,
                    resumed,
                })
            }
            Err(e) if e.is_canceled() => {
                info!(session = %session.id, "Analysis canceled; session can be resumed");
                Err(e)
            }
            Err(e) => {
                if let Err(db_err) = self.db.fail_analysis_session(&session.id, &e.to_string()) {
                    warn!(session = %session.id, error = %db_err, "Failed to record session failure");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        cancel: &CancelToken,
        session: &AnalysisSession,
        max_issues: Option<usize>,
    ) -> Result<(usize, usize)> {
        let rows: Vec<ClassifiedTransaction> = self
            .db
            .list_classified_transactions(session.start_date, session.end_date)?
            .into_iter()
            .filter(|row| row.category().is_some())
            .collect();
        let matcher = RuleMatcher::load(&self.db)?;

        let mut issues = local_issues(&session.id, &rows, &matcher);
        debug!(session = %session.id, local = issues.len(), "Local checks done");

        let mut coherence = None;
        let mut dropped = 0;
        if !rows.is_empty() {
            let review = self.ai_review(cancel, &session.id, &rows).await?;
            coherence = review.coherence_score;
            dropped = review.dropped;
            issues.extend(review.issues);
        }

        let mut issues = dedupe(issues);
        issues.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
        });
        if let Some(max) = max_issues {
            issues.truncate(max);
        }

        self.db.replace_pending_issues(&session.id, &issues)?;
        self.db.complete_analysis_session(&session.id, coherence)?;
        Ok((rows.len(), dropped))
    }

    async fn ai_review(
        &self,
        cancel: &CancelToken,
        session_id: &str,
        rows: &[ClassifiedTransaction],
    ) -> Result<Review> {
        let recent = &rows[rows.len().saturating_sub(MAX_REVIEW_ROWS)..];
        let pairs: Vec<(&Transaction, &str)> = recent
            .iter()
            .filter_map(|row| row.category().map(|c| (&row.transaction, c)))
            .collect();
        let categories: Vec<String> = self
            .db
            .list_categories()?
            .into_iter()
            .filter(|c| c.active)
            .map(|c| c.name)
            .collect();
        let prompt = prompts::analysis_prompt(&pairs, &categories);

        let classifier = &self.classifier;
        let raw = self
            .retry
            .run(cancel, "analyze_transactions", || {
                classifier.analyze_transactions(&prompt)
            })
            .await?;

        let response: ReviewResponse = parsing::parse_json(&raw)?;
        let known: HashMap<&str, &ClassifiedTransaction> = rows
            .iter()
            .map(|row| (row.transaction.id.as_str(), row))
            .collect();

        let mut issues = Vec::new();
        let mut dropped = 0;
        for value in response.issues {
            let checked = serde_json::from_value::<ReviewedIssue>(value)
                .map_err(|e| e.to_string())
                .and_then(|reviewed| validate_issue(session_id, reviewed, &known));
            match checked {
                Ok(issue) => issues.push(issue),
                Err(reason) => {
                    dropped += 1;
                    warn!(session = %session_id, reason = %reason, "Dropping invalid analysis issue");
                }
            }
        }

        Ok(Review {
            coherence_score: response
                .coherence_score
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(0.0, 1.0)),
            issues,
            dropped,
        })
    }
}

/// Turn a classifier issue into a stored issue, or explain why it is unusable
fn validate_issue(
    session_id: &str,
    reviewed: ReviewedIssue,
    known: &HashMap<&str, &ClassifiedTransaction>,
) -> std::result::Result<AnalysisIssue, String> {
    if reviewed.transaction_ids.is_empty() {
        return Err("no transaction ids".into());
    }
    if let Some(unknown) = reviewed
        .transaction_ids
        .iter()
        .find(|id| !known.contains_key(id.as_str()))
    {
        return Err(format!("unknown transaction id '{}'", unknown));
    }
    if !(0.0..=1.0).contains(&reviewed.confidence) {
        return Err(format!("confidence {} outside [0, 1]", reviewed.confidence));
    }

    let suggested = reviewed
        .suggested_category
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .or_else(|| reviewed.fix.as_ref().map(|f| f.category().trim().to_string()));
    let suggested = match suggested {
        Some(s) if !s.is_empty() => s,
        _ => return Err("missing suggested category".into()),
    };

    let fix = match reviewed.fix {
        Some(fix) => {
            check_fix(&fix, known)?;
            if !fix.category().trim().eq_ignore_ascii_case(&suggested) {
                return Err(format!(
                    "fix category '{}' disagrees with suggestion '{}'",
                    fix.category(),
                    suggested
                ));
            }
            Some(fix)
        }
        None if reviewed.issue_type == IssueType::Misclassified => Some(Fix::Recategorize {
            transaction_ids: reviewed.transaction_ids.clone(),
            category: suggested.clone(),
        }),
        None => None,
    };

    let current = reviewed.current_category.or_else(|| {
        known
            .get(reviewed.transaction_ids[0].as_str())
            .and_then(|row| row.category())
            .map(String::from)
    });
    let description = if reviewed.description.trim().is_empty() {
        format!("{} transaction(s) may belong in {}", reviewed.transaction_ids.len(), suggested)
    } else {
        reviewed.description.trim().to_string()
    };

    let mut issue = AnalysisIssue::new(
        session_id,
        reviewed.issue_type,
        reviewed.severity,
        description,
        reviewed.transaction_ids,
        reviewed.confidence,
    )
    .with_categories(current.as_deref(), Some(&suggested));
    if let Some(fix) = fix {
        issue = issue.with_fix(fix);
    }
    Ok(issue)
}

fn check_fix(
    fix: &Fix,
    known: &HashMap<&str, &ClassifiedTransaction>,
) -> std::result::Result<(), String> {
    if fix.category().trim().is_empty() {
        return Err("fix without a category".into());
    }
    match fix {
        Fix::Recategorize {
            transaction_ids, ..
        } => {
            if transaction_ids.is_empty() {
                return Err("recategorize fix without transactions".into());
            }
            if let Some(unknown) = transaction_ids.iter().find(|id| !known.contains_key(id.as_str())) {
                return Err(format!("fix names unknown transaction '{}'", unknown));
            }
        }
        Fix::CreateVendorRule {
            merchant, is_regex, ..
        } => {
            if merchant.trim().is_empty() {
                return Err("vendor rule fix without a merchant".into());
            }
            if *is_regex {
                regex::Regex::new(merchant).map_err(|e| format!("invalid merchant regex: {}", e))?;
            }
        }
        Fix::CreatePatternRule { rule } => rule.validate()?,
    }
    Ok(())
}

/// Same merchant across categories, and frequent merchants without a vendor rule
fn local_issues(
    session_id: &str,
    rows: &[ClassifiedTransaction],
    matcher: &RuleMatcher,
) -> Vec<AnalysisIssue> {
    let mut groups: Vec<(String, Vec<&ClassifiedTransaction>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows.iter().filter(|r| !r.transaction.is_check()) {
        let signature = merchant_signature(&row.transaction);
        match index.get(&signature) {
            Some(&i) => groups[i].1.push(row),
            None => {
                index.insert(signature.clone(), groups.len());
                groups.push((signature, vec![row]));
            }
        }
    }

    let mut issues = Vec::new();
    for (signature, members) in &groups {
        // Category counts in first-seen order
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for row in members {
            let Some(category) = row.category() else {
                continue;
            };
            match counts.iter_mut().find(|(c, _)| *c == category) {
                Some(entry) => entry.1 += 1,
                None => counts.push((category, 1)),
            }
        }

        if counts.len() > 1 {
            issues.push(inconsistency_issue(session_id, signature, members, &mut counts));
        } else if let Some((category, _)) = counts.first() {
            if let Some(issue) = missing_pattern_issue(session_id, signature, members, category, matcher)
            {
                issues.push(issue);
            }
        }
    }
    issues
}

fn inconsistency_issue(
    session_id: &str,
    signature: &str,
    members: &[&ClassifiedTransaction],
    counts: &mut [(&str, usize)],
) -> AnalysisIssue {
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    let total = members.len();
    let (majority, majority_count) = counts[0];
    let spread = counts
        .iter()
        .map(|(c, n)| format!("{} x{}", c, n))
        .collect::<Vec<_>>()
        .join(", ");
    let all_ids: Vec<String> = members.iter().map(|r| r.transaction.id.clone()).collect();

    // A tie has no majority to move the others into
    if counts[1].1 == majority_count {
        return AnalysisIssue::new(
            session_id,
            IssueType::Inconsistent,
            Severity::Low,
            format!("'{}' is split evenly across categories ({})", signature, spread),
            all_ids,
            0.5,
        );
    }

    let minority: Vec<String> = members
        .iter()
        .filter(|r| r.category() != Some(majority))
        .map(|r| r.transaction.id.clone())
        .collect();
    let current = counts[1].0;
    AnalysisIssue::new(
        session_id,
        IssueType::Inconsistent,
        Severity::Medium,
        format!(
            "'{}' is classified inconsistently ({}); most are {}",
            signature, spread, majority
        ),
        minority.clone(),
        majority_count as f64 / total as f64,
    )
    .with_categories(Some(current), Some(majority))
    .with_fix(Fix::Recategorize {
        transaction_ids: minority,
        category: majority.to_string(),
    })
}

fn missing_pattern_issue(
    session_id: &str,
    signature: &str,
    members: &[&ClassifiedTransaction],
    category: &str,
    matcher: &RuleMatcher,
) -> Option<AnalysisIssue> {
    let ai: Vec<&&ClassifiedTransaction> = members
        .iter()
        .filter(|r| {
            r.classification
                .as_ref()
                .is_some_and(|c| c.status == ClassificationStatus::ClassifiedByAi)
        })
        .collect();
    if ai.len() < MIN_PATTERN_TRANSACTIONS {
        return None;
    }
    let covered = members.iter().all(|r| {
        matcher
            .candidates(&r.transaction)
            .iter()
            .any(|c| c.kind == RuleKind::Vendor)
    });
    if covered {
        return None;
    }

    // One exact rule when every merchant key agrees, an anchored alternation otherwise
    let mut keys: Vec<String> = Vec::new();
    for row in members {
        let key = row.transaction.merchant_key().trim().to_string();
        if !keys.iter().any(|k| k.eq_ignore_ascii_case(&key)) {
            keys.push(key);
        }
    }
    let (merchant, is_regex) = if keys.len() == 1 {
        (keys.remove(0), false)
    } else {
        let alternation = keys
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join("|");
        (format!("^(?:{})$", alternation), true)
    };

    let confidence = ai
        .iter()
        .filter_map(|r| r.classification.as_ref().map(|c| c.confidence))
        .sum::<f64>()
        / ai.len() as f64;

    Some(
        AnalysisIssue::new(
            session_id,
            IssueType::MissingPattern,
            Severity::Low,
            format!(
                "'{}' was classified as {} by AI {} times without a vendor rule",
                signature,
                category,
                ai.len()
            ),
            members.iter().map(|r| r.transaction.id.clone()).collect(),
            confidence,
        )
        .with_categories(Some(category), Some(category))
        .with_fix(Fix::CreateVendorRule {
            merchant,
            category: category.to_string(),
            is_regex,
        }),
    )
}

/// Drop issues that repeat an earlier one's type and transaction set
fn dedupe(issues: Vec<AnalysisIssue>) -> Vec<AnalysisIssue> {
    let mut seen: HashSet<(IssueType, Vec<String>)> = HashSet::new();
    issues
        .into_iter()
        .filter(|issue| {
            let mut ids = issue.transaction_ids.clone();
            ids.sort();
            seen.insert((issue.issue_type, ids))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::IssueStatus;
    use crate::classifier::MockClassifier;
    use crate::models::{Classification, VendorRuleSource};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn classify(db: &Database, id: &str, merchant: &str, category: &str, status: ClassificationStatus) {
        db.insert_transaction(&Transaction::new(id, date(1), merchant, 12.5))
            .unwrap();
        db.upsert_classification(&Classification::new(id, category, status, 0.8))
            .unwrap();
    }

    fn setup() -> Database {
        let db = Database::in_memory().unwrap();
        db.seed_default_categories().unwrap();
        db
    }

    #[test]
    fn test_inconsistent_merchant_suggests_majority() {
        let db = setup();
        classify(&db, "1", "SHELL OIL 1", "Transport", ClassificationStatus::ClassifiedByAi);
        classify(&db, "2", "SHELL OIL 2", "Transport", ClassificationStatus::ClassifiedByAi);
        classify(&db, "3", "SHELL OIL 3", "Groceries", ClassificationStatus::ClassifiedByAi);
        let rows = db.list_classified_transactions(None, None).unwrap();

        let issues = local_issues("s", &rows, &RuleMatcher::default());
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.issue_type, IssueType::Inconsistent);
        assert_eq!(issue.transaction_ids, vec!["3"]);
        assert_eq!(
            issue.fix,
            Some(Fix::Recategorize {
                transaction_ids: vec!["3".into()],
                category: "Transport".into()
            })
        );
    }

    #[test]
    fn test_even_split_has_no_fix() {
        let db = setup();
        classify(&db, "1", "CORNER SHOP", "Groceries", ClassificationStatus::ClassifiedByAi);
        classify(&db, "2", "CORNER SHOP", "Shopping", ClassificationStatus::ClassifiedByAi);
        let rows = db.list_classified_transactions(None, None).unwrap();

        let issues = local_issues("s", &rows, &RuleMatcher::default());
        assert_eq!(issues.len(), 1);
        assert!(issues[0].fix.is_none());
        assert_eq!(issues[0].severity, Severity::Low);
    }

    #[test]
    fn test_missing_pattern_needs_three_ai_rows_and_no_rule() {
        let db = setup();
        for id in ["1", "2"] {
            classify(&db, id, "NETFLIX", "Subscriptions", ClassificationStatus::ClassifiedByAi);
        }
        let rows = db.list_classified_transactions(None, None).unwrap();
        assert!(local_issues("s", &rows, &RuleMatcher::default()).is_empty());

        classify(&db, "3", "NETFLIX", "Subscriptions", ClassificationStatus::ClassifiedByAi);
        let rows = db.list_classified_transactions(None, None).unwrap();
        let issues = local_issues("s", &rows, &RuleMatcher::default());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, IssueType::MissingPattern);
        assert_eq!(
            issues[0].fix,
            Some(Fix::CreateVendorRule {
                merchant: "NETFLIX".into(),
                category: "Subscriptions".into(),
                is_regex: false
            })
        );

        db.learn_vendor_rule("NETFLIX", "Subscriptions", VendorRuleSource::Auto)
            .unwrap();
        let matcher = RuleMatcher::load(&db).unwrap();
        assert!(local_issues("s", &rows, &matcher).is_empty());
    }

    #[test]
    fn test_missing_pattern_regex_covers_variants() {
        let db = setup();
        classify(&db, "1", "UBER TRIP 1", "Transport", ClassificationStatus::ClassifiedByAi);
        classify(&db, "2", "UBER TRIP 2", "Transport", ClassificationStatus::ClassifiedByAi);
        classify(&db, "3", "UBER TRIP 3", "Transport", ClassificationStatus::ClassifiedByAi);
        let rows = db.list_classified_transactions(None, None).unwrap();

        let issues = local_issues("s", &rows, &RuleMatcher::default());
        match &issues[0].fix {
            Some(Fix::CreateVendorRule { merchant, is_regex, .. }) => {
                assert!(*is_regex);
                let re = regex::Regex::new(merchant).unwrap();
                assert!(re.is_match("UBER TRIP 2"));
                assert!(!re.is_match("UBER TRIP 22"));
            }
            other => panic!("unexpected fix {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ai_issues_are_validated() {
        let db = setup();
        classify(&db, "a", "ACME HARDWARE", "Dining", ClassificationStatus::ClassifiedByAi);
        let response = r#"Here you go:
        {"coherence_score": 0.7, "issues": [
            {"type": "misclassified", "severity": "high", "description": "Hardware store",
             "transaction_ids": ["a"], "suggested_category": "Shopping", "confidence": 0.9},
            {"type": "misclassified", "transaction_ids": ["ghost"],
             "suggested_category": "Shopping", "confidence": 0.9},
            {"type": "misclassified", "transaction_ids": ["a"],
             "suggested_category": "Shopping", "confidence": 1.7},
            {"type": "misclassified", "transaction_ids": ["a"], "confidence": 0.5},
            {"type": "nonsense"}
        ]}"#;
        let engine = AnalysisEngine::new(
            db.clone(),
            MockClassifier::new().with_analysis_response(response),
        );

        let report = engine
            .analyze(&CancelToken::new(), &AnalysisOptions::default())
            .await
            .unwrap();
        assert_eq!(report.session.status, SessionStatus::Completed);
        assert_eq!(report.session.coherence_score, Some(0.7));
        assert_eq!(report.dropped, 4);
        assert_eq!(report.issues.len(), 1);

        let issue = &report.issues[0];
        assert_eq!(issue.current_category.as_deref(), Some("Dining"));
        assert_eq!(
            issue.fix,
            Some(Fix::Recategorize {
                transaction_ids: vec!["a".into()],
                category: "Shopping".into()
            })
        );
    }

    #[tokio::test]
    async fn test_unparseable_review_fails_session() {
        let db = setup();
        classify(&db, "a", "ACME", "Shopping", ClassificationStatus::ClassifiedByAi);
        let engine = AnalysisEngine::new(
            db.clone(),
            MockClassifier::new().with_analysis_response("I could not review these."),
        );

        let err = engine
            .analyze(&CancelToken::new(), &AnalysisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));

        let sessions = db.list_analysis_sessions().unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Failed);
        assert!(sessions[0].error.is_some());
    }

    #[tokio::test]
    async fn test_resume_reruns_failed_and_returns_completed() {
        let db = setup();
        classify(&db, "a", "ACME", "Shopping", ClassificationStatus::ClassifiedByAi);
        let failing = AnalysisEngine::new(
            db.clone(),
            MockClassifier::new().with_analysis_response("garbage"),
        );
        assert!(failing
            .analyze(&CancelToken::new(), &AnalysisOptions::default())
            .await
            .is_err());
        let session_id = db.list_analysis_sessions().unwrap()[0].id.clone();

        let mock = MockClassifier::new();
        let engine = AnalysisEngine::new(db.clone(), mock.clone());
        let options = AnalysisOptions {
            session_id: Some(session_id.clone()),
            ..Default::default()
        };
        let report = engine.analyze(&CancelToken::new(), &options).await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.session.status, SessionStatus::Completed);
        assert_eq!(report.session.error, None);
        assert_eq!(report.reviewed, 1);

        // Completed sessions are not analyzed again
        let again = engine.analyze(&CancelToken::new(), &options).await.unwrap();
        assert_eq!(again.reviewed, 0);
        assert_eq!(again.session.id, session_id);
        assert_eq!(db.list_analysis_sessions().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_session_is_run_in_place() {
        let db = setup();
        for id in ["1", "2", "3"] {
            classify(&db, id, "NETFLIX", "Subscriptions", ClassificationStatus::ClassifiedByAi);
        }
        let session = db.create_analysis_session(None, None).unwrap();
        let engine = AnalysisEngine::new(db.clone(), MockClassifier::new());
        let options = AnalysisOptions {
            session_id: Some(session.id.clone()),
            ..Default::default()
        };

        let report = engine.analyze(&CancelToken::new(), &options).await.unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].status, IssueStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let engine = AnalysisEngine::new(setup(), MockClassifier::new());
        let options = AnalysisOptions {
            session_id: Some("nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            engine.analyze(&CancelToken::new(), &options).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_leaves_session_resumable() {
        let db = setup();
        classify(&db, "a", "ACME", "Shopping", ClassificationStatus::ClassifiedByAi);
        let engine = AnalysisEngine::new(
            db.clone(),
            MockClassifier::new().with_delay(std::time::Duration::from_secs(5)),
        );
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = engine
            .analyze(&cancel, &AnalysisOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(
            db.list_analysis_sessions().unwrap()[0].status,
            SessionStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_max_issues_keeps_most_severe() {
        let db = setup();
        classify(&db, "1", "SHELL", "Transport", ClassificationStatus::ClassifiedByAi);
        classify(&db, "2", "SHELL", "Transport", ClassificationStatus::ClassifiedByAi);
        classify(&db, "3", "SHELL", "Dining", ClassificationStatus::ClassifiedByAi);
        for id in ["4", "5", "6"] {
            classify(&db, id, "HULU", "Subscriptions", ClassificationStatus::ClassifiedByAi);
        }
        let engine = AnalysisEngine::new(db.clone(), MockClassifier::new());
        let options = AnalysisOptions {
            max_issues: Some(1),
            ..Default::default()
        };

        let report = engine.analyze(&CancelToken::new(), &options).await.unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].issue_type, IssueType::Inconsistent);
        assert_eq!(report.session.issues_found, 1);
    }
}
