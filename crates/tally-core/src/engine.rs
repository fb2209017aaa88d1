//! Classification engine
//!
//! Sequential mode walks unclassified transactions in date order: rules first, then
//! the classifier, then the user. Batch mode hands the same work to a
//! [`BatchProcessor`]. Both modes write classification rows and teach vendor rules
//! from accepted suggestions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{BatchOptions, BatchProcessor, BatchSummary};
use crate::cancel::CancelToken;
use crate::classifier::{Classifier, Suggestion};
use crate::db::Database;
use crate::error::Result;
use crate::models::{
    Classification, ClassificationStatus, Transaction, VendorRule, VendorRuleSource,
};
use crate::prompter::{PendingClassification, PromptDecision, Prompter};
use crate::retry::RetryPolicy;
use crate::rules::{RuleCandidate, RuleMatcher};

/// Counts for a finished sequential run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub rule_matched: usize,
    pub ai_accepted: usize,
    pub user_edited: usize,
    pub rejected: usize,
    /// Classifier gave up and the user chose to skip
    pub skipped: usize,
    pub duration: Duration,
}

enum Outcome {
    RuleMatched,
    AiAccepted,
    UserEdited,
    Rejected,
    Skipped,
}

impl RunSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::RuleMatched => self.rule_matched += 1,
            Outcome::AiAccepted => self.ai_accepted += 1,
            Outcome::UserEdited => self.user_edited += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Classification engine with injected store, classifier and prompter
pub struct ClassificationEngine<C: Classifier + 'static, P: Prompter> {
    db: Database,
    classifier: Arc<C>,
    prompter: P,
    retry: RetryPolicy,
}

impl<C: Classifier + 'static, P: Prompter> ClassificationEngine<C, P> {
    pub fn new(db: Database, classifier: C, prompter: P) -> Self {
        Self {
            db,
            classifier: Arc::new(classifier),
            prompter,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn prompter(&self) -> &P {
        &self.prompter
    }

    pub fn into_prompter(self) -> P {
        self.prompter
    }

    /// Interactive classification of every unclassified transaction on or after `from_date`
    ///
    /// Cancellation is honoured between transactions. A storage failure stops the run
    /// with [`crate::Error::TransactionFailed`] naming the transaction to resume from.
    pub async fn classify_transactions(
        &mut self,
        cancel: &CancelToken,
        from_date: Option<NaiveDate>,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let transactions = self.db.list_unclassified_transactions(from_date)?;
        let mut matcher = RuleMatcher::load(&self.db)?;

        info!(
            total = transactions.len(),
            classifier = self.classifier.name(),
            "Starting sequential classification"
        );
        self.prompter.start(transactions.len());

        let mut summary = RunSummary {
            total: transactions.len(),
            ..Default::default()
        };

        for tx in &transactions {
            if cancel.is_cancelled() {
                info!(
                    processed = summary.rule_matched
                        + summary.ai_accepted
                        + summary.user_edited
                        + summary.rejected
                        + summary.skipped,
                    resume_from = %tx.date,
                    "Classification canceled"
                );
            }
            cancel.check()?;

            let outcome = self
                .classify_one(&mut matcher, tx)
                .await
                .map_err(|e| e.in_transaction(&tx.id, tx.date))?;
            summary.record(outcome);
        }

        summary.duration = started.elapsed();
        info!(
            total = summary.total,
            rule_matched = summary.rule_matched,
            ai_accepted = summary.ai_accepted,
            user_edited = summary.user_edited,
            rejected = summary.rejected,
            skipped = summary.skipped,
            duration_ms = summary.duration.as_millis() as u64,
            "Sequential classification finished"
        );
        Ok(summary)
    }

    /// Parallel, confidence-gated classification of unclassified transactions
    pub async fn classify_transactions_batch(
        &mut self,
        cancel: &CancelToken,
        from_date: Option<NaiveDate>,
        options: &BatchOptions,
    ) -> Result<BatchSummary> {
        let transactions = self.db.list_unclassified_transactions(from_date)?;
        self.run_batch(cancel, transactions, options).await
    }

    /// Batch-classify exactly these transactions, classified or not
    pub async fn classify_specific_transactions(
        &mut self,
        cancel: &CancelToken,
        transactions: Vec<Transaction>,
        options: &BatchOptions,
    ) -> Result<BatchSummary> {
        self.run_batch(cancel, transactions, options).await
    }

    async fn run_batch(
        &mut self,
        cancel: &CancelToken,
        transactions: Vec<Transaction>,
        options: &BatchOptions,
    ) -> Result<BatchSummary> {
        let processor =
            BatchProcessor::new(self.db.clone(), Arc::clone(&self.classifier), options.clone())?
                .with_retry_policy(self.retry);
        processor.run(cancel, transactions, &mut self.prompter).await
    }

    async fn classify_one(
        &mut self,
        matcher: &mut RuleMatcher,
        tx: &Transaction,
    ) -> Result<Outcome> {
        if let Some(rule_match) = matcher.evaluate(tx) {
            if rule_match.ambiguous {
                debug!(
                    transaction_id = %tx.id,
                    candidates = rule_match.total_candidates,
                    winner = %rule_match.candidate.rule_name,
                    "Several rules of the same kind matched"
                );
            }
            apply_rule(&self.db, tx, &rule_match.candidate)?;
            self.prompter.record_auto(tx, &rule_match.candidate.category);
            return Ok(Outcome::RuleMatched);
        }

        // The in-flight transaction always finishes, so the classifier call is not
        // raced against the run's token
        let uninterrupted = CancelToken::new();
        let classifier = Arc::clone(&self.classifier);
        let classifier: &C = &classifier;

        let suggestion = loop {
            match self
                .retry
                .run(&uninterrupted, "classify", || classifier.classify(tx))
                .await
            {
                Ok(suggestion) => break suggestion,
                Err(e) => {
                    warn!(transaction_id = %tx.id, error = %e, "Classifier failed");
                    if !self.prompter.confirm_retry(tx, &e.to_string()).await? {
                        debug!(transaction_id = %tx.id, "Skipped after classifier failure");
                        return Ok(Outcome::Skipped);
                    }
                }
            }
        };

        let pending = PendingClassification::new(tx.clone(), suggestion.clone());
        let decision = self.prompter.confirm(&pending).await?;
        let learned = apply_decision(
            &self.db,
            classifier,
            std::slice::from_ref(tx),
            &suggestion,
            &decision,
        )
        .await?;
        if let Some(rule) = learned {
            matcher.add_vendor_rule(rule);
        }

        Ok(match decision {
            PromptDecision::Accept => Outcome::AiAccepted,
            PromptDecision::Edit(_) => Outcome::UserEdited,
            PromptDecision::Reject => Outcome::Rejected,
        })
    }
}

/// Write a rule-based classification and bump the rule's use count
pub(crate) fn apply_rule(db: &Database, tx: &Transaction, candidate: &RuleCandidate) -> Result<()> {
    let classification = Classification::new(
        &tx.id,
        &candidate.category,
        ClassificationStatus::ClassifiedByRule,
        candidate.confidence,
    )
    .with_notes(format!("{}: {}", candidate.kind, candidate.rule_name));
    db.upsert_classification(&classification)?;
    candidate.record_use(db)?;
    debug!(
        transaction_id = %tx.id,
        category = %candidate.category,
        rule = %candidate.kind,
        rule_id = candidate.rule_id,
        "Classified by rule"
    );
    Ok(())
}

/// Apply a user decision to every transaction it covers
///
/// Accept writes `classified_by_ai` rows and learns an `auto` vendor rule; Edit
/// writes `user_modified` rows, creates the category when needed and learns an
/// `auto_confirmed` rule. Returns the learned rule, if any.
pub(crate) async fn apply_decision<C: Classifier + ?Sized>(
    db: &Database,
    classifier: &C,
    transactions: &[Transaction],
    suggestion: &Suggestion,
    decision: &PromptDecision,
) -> Result<Option<VendorRule>> {
    let Some(first) = transactions.first() else {
        return Ok(None);
    };

    let (category, status, source) = match decision {
        PromptDecision::Reject => {
            debug!(transaction_id = %first.id, count = transactions.len(), "Suggestion rejected");
            return Ok(None);
        }
        PromptDecision::Accept => (
            suggestion.category.as_str(),
            ClassificationStatus::ClassifiedByAi,
            VendorRuleSource::Auto,
        ),
        PromptDecision::Edit(category) => {
            ensure_category(db, classifier, category).await?;
            (
                category.as_str(),
                ClassificationStatus::UserModified,
                VendorRuleSource::AutoConfirmed,
            )
        }
    };

    for tx in transactions {
        let mut classification =
            Classification::new(&tx.id, category, status, suggestion.confidence);
        if let Some(reasoning) = &suggestion.reasoning {
            classification = classification.with_notes(reasoning.clone());
        }
        db.upsert_classification(&classification)?;
    }

    // A paper check's name says nothing about the payee
    if first.is_check() {
        return Ok(None);
    }
    let rule = db.learn_vendor_rule(first.merchant_key(), category, source)?;
    debug!(
        merchant = %rule.merchant,
        category = %rule.category,
        source = %rule.source,
        "Vendor rule learned"
    );
    Ok(Some(rule))
}

/// Create `name` if missing, asking the classifier for a description
async fn ensure_category<C: Classifier + ?Sized>(
    db: &Database,
    classifier: &C,
    name: &str,
) -> Result<()> {
    if db.category_exists(name)? {
        return Ok(());
    }
    let description = match classifier.generate_category_description(name).await {
        Ok(generated) => Some(generated.description),
        Err(e) => {
            warn!(category = name, error = %e, "Could not generate category description");
            None
        }
    };
    db.create_category(name, description.as_deref())?;
    info!(category = name, "Created category");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::MockClassifier;
    use crate::models::{CheckAmount, DayRange, NewCheckPattern};
    use crate::prompter::{CompletionStats, ScriptedPrompter};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn seeded_db(txs: &[Transaction]) -> Database {
        let db = Database::in_memory().unwrap();
        db.seed_default_categories().unwrap();
        db.insert_transactions(txs).unwrap();
        db
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_accept_learns_rule_for_later_transactions() {
        let db = seeded_db(&[
            Transaction::new("a", date(1), "NETFLIX.COM", 15.49),
            Transaction::new("b", date(2), "NETFLIX.COM", 15.49),
        ]);
        let mock = MockClassifier::new();
        let mut engine = ClassificationEngine::new(db.clone(), mock.clone(), ScriptedPrompter::new());

        let summary = engine
            .classify_transactions(&CancelToken::new(), None)
            .await
            .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.ai_accepted, 1);
        assert_eq!(summary.rule_matched, 1);
        assert_eq!(mock.classify_calls(), 1);

        let first = db.get_classification("a").unwrap().unwrap();
        assert_eq!(first.status, ClassificationStatus::ClassifiedByAi);
        let second = db.get_classification("b").unwrap().unwrap();
        assert_eq!(second.status, ClassificationStatus::ClassifiedByRule);
        assert_eq!(second.category, "Subscriptions");

        let rule = db.get_vendor_rule("NETFLIX.COM").unwrap().unwrap();
        assert_eq!(rule.source, VendorRuleSource::Auto);
        assert_eq!(rule.use_count, 2);
        assert_eq!(engine.prompter().auto.len(), 1);
    }

    #[tokio::test]
    async fn test_edit_creates_category_and_confirms_rule() {
        let db = seeded_db(&[Transaction::new("a", date(1), "PETCO #44", 60.0)]);
        let prompter =
            ScriptedPrompter::new().with_decisions([PromptDecision::Edit("Pet Care".into())]);
        let mut engine = ClassificationEngine::new(db.clone(), MockClassifier::new(), prompter);

        let summary = engine
            .classify_transactions(&CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(summary.user_edited, 1);

        let classification = db.get_classification("a").unwrap().unwrap();
        assert_eq!(classification.category, "Pet Care");
        assert_eq!(classification.status, ClassificationStatus::UserModified);
        assert_eq!(classification.confidence, 1.0);

        let category = db.get_category("Pet Care").unwrap().unwrap();
        assert!(category.description.unwrap().contains("Pet Care"));
        let rule = db.get_vendor_rule("PETCO #44").unwrap().unwrap();
        assert_eq!(rule.source, VendorRuleSource::AutoConfirmed);
    }

    #[tokio::test]
    async fn test_description_failure_still_creates_category() {
        let db = seeded_db(&[Transaction::new("a", date(1), "LOCAL GYM", 30.0)]);
        let mock = MockClassifier::new().with_description(None);
        let prompter =
            ScriptedPrompter::new().with_decisions([PromptDecision::Edit("Fitness".into())]);
        let mut engine = ClassificationEngine::new(db.clone(), mock, prompter);

        engine
            .classify_transactions(&CancelToken::new(), None)
            .await
            .unwrap();
        let category = db.get_category("Fitness").unwrap().unwrap();
        assert!(category.description.is_none());
    }

    #[tokio::test]
    async fn test_reject_leaves_transaction_unclassified() {
        let db = seeded_db(&[Transaction::new("a", date(1), "MYSTERY", 3.0)]);
        let prompter = ScriptedPrompter::new().with_decisions([PromptDecision::Reject]);
        let mut engine = ClassificationEngine::new(db.clone(), MockClassifier::new(), prompter);

        let summary = engine
            .classify_transactions(&CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(summary.rejected, 1);
        assert!(db.get_classification("a").unwrap().is_none());
        assert!(db.get_vendor_rule("MYSTERY").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_classifier_failure_asks_to_retry_then_skips() {
        let db = seeded_db(&[Transaction::new("a", date(1), "BROKEN CO", 3.0)]);
        let mock = MockClassifier::new().failing_for("BROKEN");
        let prompter = ScriptedPrompter::new().with_retries([true, false]);
        let mut engine = ClassificationEngine::new(db.clone(), mock.clone(), prompter)
            .with_retry_policy(fast_retry());

        let summary = engine
            .classify_transactions(&CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        // two rounds of (1 attempt + 1 retry)
        assert_eq!(mock.classify_calls(), 4);
        assert_eq!(engine.prompter().retry_prompts, vec!["a", "a"]);
        assert!(db.get_classification("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_date_filters_and_cancel_stops() {
        let db = seeded_db(&[
            Transaction::new("old", date(1), "NETFLIX", 1.0),
            Transaction::new("new", date(20), "NETFLIX", 1.0),
        ]);
        let mut engine =
            ClassificationEngine::new(db.clone(), MockClassifier::new(), ScriptedPrompter::new());
        let summary = engine
            .classify_transactions(&CancelToken::new(), Some(date(10)))
            .await
            .unwrap();
        assert_eq!(summary.total, 1);
        assert!(db.get_classification("old").unwrap().is_none());

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = engine.classify_transactions(&cancel, None).await.unwrap_err();
        assert!(err.is_canceled());
        assert!(db.get_classification("old").unwrap().is_none());
    }

    /// Accepts every suggestion and requests cancellation while answering the first
    struct CancelOnConfirm {
        inner: ScriptedPrompter,
        cancel: CancelToken,
    }

    #[async_trait::async_trait]
    impl Prompter for CancelOnConfirm {
        fn start(&mut self, total: usize) {
            self.inner.start(total);
        }

        fn record_auto(&mut self, tx: &Transaction, category: &str) {
            self.inner.record_auto(tx, category);
        }

        async fn confirm(&mut self, pending: &PendingClassification) -> Result<PromptDecision> {
            self.cancel.cancel();
            self.inner.confirm(pending).await
        }

        async fn confirm_retry(&mut self, tx: &Transaction, error: &str) -> Result<bool> {
            self.inner.confirm_retry(tx, error).await
        }

        fn completion_stats(&self) -> CompletionStats {
            self.inner.completion_stats()
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_in_flight_transaction() {
        let db = seeded_db(&[
            Transaction::new("a", date(1), "CORNER DELI", 8.0),
            Transaction::new("b", date(2), "HARDWARE HUT", 30.0),
            Transaction::new("c", date(3), "BOOK NOOK", 15.0),
        ]);
        let cancel = CancelToken::new();
        let prompter = CancelOnConfirm {
            inner: ScriptedPrompter::new(),
            cancel: cancel.clone(),
        };
        let mock = MockClassifier::new().with_default("Shopping", 0.7);
        let mut engine = ClassificationEngine::new(db.clone(), mock.clone(), prompter);

        let err = engine.classify_transactions(&cancel, None).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(db.count_classifications().unwrap(), 1);
        let c = db.get_classification("a").unwrap().unwrap();
        assert_eq!(c.status, ClassificationStatus::ClassifiedByAi);
        assert!(db.get_classification("b").unwrap().is_none());
        assert!(db.get_classification("c").unwrap().is_none());
        assert_eq!(mock.classify_calls(), 1);
        assert_eq!(engine.prompter().completion_stats().processed, 1);
    }

    #[tokio::test]
    async fn test_check_uses_pattern_without_learning_vendor_rule() {
        let db = seeded_db(&[
            Transaction::new("c1", date(3), "CHECK 1001", 1500.0),
            Transaction::new("c2", date(20), "CHECK 1002", 1500.0),
        ]);
        db.create_check_pattern(&NewCheckPattern {
            name: "Rent".into(),
            amount: CheckAmount::Exact { amount: 1500.0 },
            day_range: Some(DayRange::new(1, 5).unwrap()),
            category: "Housing".into(),
            confidence_boost: 0.9,
            notes: None,
        })
        .unwrap();

        let mock = MockClassifier::new().with_default("Other", 0.4);
        let mut engine = ClassificationEngine::new(db.clone(), mock.clone(), ScriptedPrompter::new());
        let summary = engine
            .classify_transactions(&CancelToken::new(), None)
            .await
            .unwrap();

        assert_eq!(summary.rule_matched, 1);
        assert_eq!(summary.ai_accepted, 1);
        assert_eq!(mock.seen_transactions(), vec!["c2"]);
        let rent = db.get_classification("c1").unwrap().unwrap();
        assert_eq!(rent.category, "Housing");
        assert_eq!(rent.confidence, 0.9);
        assert!(db.list_vendor_rules().unwrap().is_empty());
    }
}
