//! Parallel, confidence-gated batch classification
//!
//! Transactions are grouped by merchant signature so the classifier sees each
//! merchant once. Groups are chunked into work units and pulled from a bounded
//! queue by a fixed pool of workers; results flow back over an unbounded channel
//! to a single collector that owns the summary and the prompter.
//!
//! ```text
//! dispatcher ──(bounded)──▶ worker 0..N ──(unbounded)──▶ collector ──▶ review
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::classifier::{Classifier, Suggestion};
use crate::config::BatchConfig;
use crate::db::Database;
use crate::engine::{apply_decision, apply_rule};
use crate::error::{Error, Result};
use crate::models::{Classification, ClassificationStatus, Transaction, VendorRuleSource};
use crate::prompter::{PendingClassification, PromptDecision, Prompter};
use crate::retry::RetryPolicy;
use crate::rules::RuleMatcher;

/// Tuning for a batch run
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Suggestions at or above this confidence are written without asking
    pub auto_accept_threshold: f64,
    /// Merchant groups per classifier call
    pub batch_size: usize,
    pub workers: usize,
    /// Leave low-confidence groups unclassified instead of prompting
    pub skip_manual_review: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            auto_accept_threshold: 0.95,
            batch_size: 20,
            workers: 5,
            skip_manual_review: false,
        }
    }
}

impl From<&BatchConfig> for BatchOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            auto_accept_threshold: config.auto_accept_threshold,
            batch_size: config.batch_size,
            workers: config.workers,
            skip_manual_review: false,
        }
    }
}

impl BatchOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.auto_accept_threshold) {
            return Err(Error::InvalidData(format!(
                "auto-accept threshold {} outside [0, 1]",
                self.auto_accept_threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidData("batch size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::InvalidData("worker count must be at least 1".into()));
        }
        Ok(())
    }
}

/// A transaction the run could not classify
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTransaction {
    pub transaction_id: String,
    pub date: NaiveDate,
    pub merchant: String,
    pub reason: String,
}

impl FailedTransaction {
    fn new(tx: &Transaction, reason: &str) -> Self {
        Self {
            transaction_id: tx.id.clone(),
            date: tx.date,
            merchant: tx.merchant_key().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A merchant group whose suggestion fell below the auto-accept threshold
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub signature: String,
    /// Every rule miss in the group; the first one was sent to the classifier
    pub transactions: Vec<Transaction>,
    pub suggestion: Suggestion,
}

/// Counts for a finished (or canceled) batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub rule_matched: usize,
    pub auto_accepted: usize,
    /// Left unclassified awaiting review
    pub needs_review: usize,
    /// Accepted or edited during review
    pub manually_classified: usize,
    pub rejected: usize,
    pub failed: usize,
    pub canceled: bool,
    pub failures: Vec<FailedTransaction>,
    pub duration: Duration,
}

impl BatchSummary {
    /// Transactions that reached a final outcome in this run
    pub fn processed(&self) -> usize {
        self.rule_matched
            + self.auto_accepted
            + self.needs_review
            + self.manually_classified
            + self.rejected
            + self.failed
    }
}

/// Grouping key: ASCII-lowercased merchant with digits, `#` and `*` removed
pub fn merchant_signature(tx: &Transaction) -> String {
    let key = tx.merchant_key().to_ascii_lowercase();
    let cleaned: String = key
        .chars()
        .filter(|c| !c.is_ascii_digit() && *c != '#' && *c != '*')
        .collect();
    let signature = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if signature.is_empty() {
        key
    } else {
        signature
    }
}

#[derive(Debug)]
struct MerchantGroup {
    signature: String,
    transactions: Vec<Transaction>,
}

/// Group in first-seen order; every check is its own group
fn group_by_merchant(transactions: Vec<Transaction>) -> Vec<MerchantGroup> {
    let mut groups: Vec<MerchantGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for tx in transactions {
        let signature = if tx.is_check() {
            format!("check:{}", tx.id)
        } else {
            merchant_signature(&tx)
        };
        match index.get(&signature) {
            Some(&i) => groups[i].transactions.push(tx),
            None => {
                index.insert(signature.clone(), groups.len());
                groups.push(MerchantGroup {
                    signature,
                    transactions: vec![tx],
                });
            }
        }
    }
    groups
}

struct WorkUnit {
    index: usize,
    groups: Vec<MerchantGroup>,
}

enum WorkerEvent {
    RuleMatched {
        transaction: Transaction,
        category: String,
    },
    AutoAccepted {
        transaction: Transaction,
        category: String,
    },
    NeedsReview(ReviewItem),
    Failed(FailedTransaction),
    /// Storage failure; the run must stop
    Fatal(Error),
}

/// Runs one batch classification over a fixed set of transactions
pub struct BatchProcessor<C: Classifier + 'static> {
    db: Database,
    classifier: Arc<C>,
    options: BatchOptions,
    retry: RetryPolicy,
}

impl<C: Classifier + 'static> BatchProcessor<C> {
    pub fn new(db: Database, classifier: Arc<C>, options: BatchOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            db,
            classifier,
            options,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Classify `transactions`, then resolve low-confidence groups through `prompter`
    ///
    /// Returns the partial summary with `canceled = true` when `cancel` fires, and
    /// [`Error::TransactionFailed`] when a worker hits a storage failure.
    pub async fn run<P: Prompter>(
        &self,
        cancel: &CancelToken,
        transactions: Vec<Transaction>,
        prompter: &mut P,
    ) -> Result<BatchSummary> {
        let started = Instant::now();
        let total = transactions.len();
        let matcher = Arc::new(RuleMatcher::load(&self.db)?);

        let groups = group_by_merchant(transactions);
        let group_count = groups.len();
        let mut units = Vec::new();
        let mut groups = groups.into_iter().peekable();
        while groups.peek().is_some() {
            units.push(WorkUnit {
                index: units.len(),
                groups: groups.by_ref().take(self.options.batch_size).collect(),
            });
        }

        info!(
            total,
            groups = group_count,
            units = units.len(),
            workers = self.options.workers,
            classifier = self.classifier.name(),
            "Starting batch classification"
        );
        prompter.start(total);

        // Fired by a worker on storage failure so nothing new is dispatched
        let abort = CancelToken::new();
        let (work_tx, work_rx) = mpsc::channel::<WorkUnit>(self.options.workers);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<WorkerEvent>();

        let dispatcher = {
            let cancel = cancel.clone();
            let abort = abort.clone();
            tokio::spawn(async move {
                for unit in units {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = abort.cancelled() => break,
                        sent = work_tx.send(unit) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut handles = Vec::with_capacity(self.options.workers);
        for worker in 0..self.options.workers {
            let ctx = Worker {
                id: worker,
                db: self.db.clone(),
                classifier: Arc::clone(&self.classifier),
                matcher: Arc::clone(&matcher),
                threshold: self.options.auto_accept_threshold,
                retry: self.retry,
                cancel: cancel.clone(),
                abort: abort.clone(),
                results: result_tx.clone(),
            };
            let queue = Arc::clone(&work_rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let unit = { queue.lock().await.recv().await };
                    let Some(unit) = unit else { break };
                    if ctx.cancel.is_cancelled() || ctx.abort.is_cancelled() {
                        break;
                    }
                    ctx.process(unit).await;
                }
                debug!(worker = ctx.id, "Worker finished");
            }));
        }
        drop(result_tx);

        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        let mut reviews: Vec<ReviewItem> = Vec::new();
        let mut fatal: Option<Error> = None;

        while let Some(event) = result_rx.recv().await {
            match event {
                WorkerEvent::RuleMatched {
                    transaction,
                    category,
                } => {
                    summary.rule_matched += 1;
                    prompter.record_auto(&transaction, &category);
                }
                WorkerEvent::AutoAccepted {
                    transaction,
                    category,
                } => {
                    summary.auto_accepted += 1;
                    prompter.record_auto(&transaction, &category);
                }
                WorkerEvent::NeedsReview(item) => reviews.push(item),
                WorkerEvent::Failed(failure) => {
                    summary.failed += 1;
                    summary.failures.push(failure);
                }
                WorkerEvent::Fatal(e) => {
                    error!(error = %e, "Batch worker hit a storage failure");
                    fatal.get_or_insert(e);
                }
            }
        }

        if let Err(e) = dispatcher.await {
            warn!(error = %e, "Batch dispatcher task failed");
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Batch worker task failed");
                fatal.get_or_insert(Error::InvalidData(format!("batch worker failed: {}", e)));
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        summary.canceled = cancel.is_cancelled();
        // Stable review order regardless of worker interleaving
        reviews.sort_by(|a, b| {
            let (a, b) = (&a.transactions[0], &b.transactions[0]);
            a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id))
        });

        if self.options.skip_manual_review || summary.canceled {
            summary.needs_review += reviews.iter().map(|r| r.transactions.len()).sum::<usize>();
        } else {
            self.review(cancel, reviews, prompter, &mut summary).await?;
        }

        summary.duration = started.elapsed();
        info!(
            total = summary.total,
            rule_matched = summary.rule_matched,
            auto_accepted = summary.auto_accepted,
            needs_review = summary.needs_review,
            manually_classified = summary.manually_classified,
            rejected = summary.rejected,
            failed = summary.failed,
            canceled = summary.canceled,
            duration_ms = summary.duration.as_millis() as u64,
            "Batch classification finished"
        );
        Ok(summary)
    }

    /// Resolve review items one at a time through the prompter
    async fn review<P: Prompter>(
        &self,
        cancel: &CancelToken,
        reviews: Vec<ReviewItem>,
        prompter: &mut P,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        let mut reviews = reviews.into_iter();
        while let Some(item) = reviews.next() {
            if cancel.is_cancelled() {
                summary.canceled = true;
                summary.needs_review += item.transactions.len()
                    + reviews.map(|r| r.transactions.len()).sum::<usize>();
                break;
            }

            let first = &item.transactions[0];
            let pending = PendingClassification::new(first.clone(), item.suggestion.clone())
                .with_group_size(item.transactions.len());
            let decision = prompter
                .confirm(&pending)
                .await
                .map_err(|e| e.in_transaction(&first.id, first.date))?;
            apply_decision(
                &self.db,
                self.classifier.as_ref(),
                &item.transactions,
                &item.suggestion,
                &decision,
            )
            .await
            .map_err(|e| e.in_transaction(&first.id, first.date))?;

            match decision {
                PromptDecision::Reject => summary.rejected += item.transactions.len(),
                PromptDecision::Accept | PromptDecision::Edit(_) => {
                    summary.manually_classified += item.transactions.len()
                }
            }
        }
        Ok(())
    }
}

/// Everything one worker task owns
struct Worker<C: Classifier + 'static> {
    id: usize,
    db: Database,
    classifier: Arc<C>,
    matcher: Arc<RuleMatcher>,
    threshold: f64,
    retry: RetryPolicy,
    cancel: CancelToken,
    abort: CancelToken,
    results: mpsc::UnboundedSender<WorkerEvent>,
}

impl<C: Classifier + 'static> Worker<C> {
    fn send(&self, event: WorkerEvent) {
        // The collector outlives every worker
        let _ = self.results.send(event);
    }

    fn fail_fatal(&self, e: Error, tx: &Transaction) {
        self.abort.cancel();
        self.send(WorkerEvent::Fatal(e.in_transaction(&tx.id, tx.date)));
    }

    async fn process(&self, unit: WorkUnit) {
        debug!(worker = self.id, unit = unit.index, groups = unit.groups.len(), "Processing unit");

        let mut pending: Vec<MerchantGroup> = Vec::new();
        for group in unit.groups {
            let mut misses = Vec::new();
            for tx in group.transactions {
                match self.matcher.best_match(&tx) {
                    Some(candidate) => {
                        if let Err(e) = apply_rule(&self.db, &tx, &candidate) {
                            self.fail_fatal(e, &tx);
                            return;
                        }
                        self.send(WorkerEvent::RuleMatched {
                            transaction: tx,
                            category: candidate.category,
                        });
                    }
                    None => misses.push(tx),
                }
            }
            if !misses.is_empty() {
                pending.push(MerchantGroup {
                    signature: group.signature,
                    transactions: misses,
                });
            }
        }
        if pending.is_empty() {
            return;
        }

        let representatives: Vec<Transaction> = pending
            .iter()
            .map(|g| g.transactions[0].clone())
            .collect();

        let results = match self.classify(&representatives).await {
            Ok(results) => results,
            Err(e) if e.is_canceled() => {
                debug!(worker = self.id, unit = unit.index, "Unit abandoned on cancel");
                return;
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(worker = self.id, unit = unit.index, error = %reason, "Classifier batch failed");
                for group in &pending {
                    for tx in &group.transactions {
                        self.send(WorkerEvent::Failed(FailedTransaction::new(tx, &reason)));
                    }
                }
                return;
            }
        };

        let expected = pending.len();
        let returned = results.len();
        if returned != expected {
            warn!(
                worker = self.id,
                unit = unit.index,
                expected,
                returned,
                "Classifier returned a short batch"
            );
        }
        let mut results = results.into_iter();

        for group in pending {
            let Some(result) = results.next() else {
                let reason = format!(
                    "classifier returned {} results for {} transactions",
                    returned, expected
                );
                for tx in &group.transactions {
                    self.send(WorkerEvent::Failed(FailedTransaction::new(tx, &reason)));
                }
                continue;
            };
            match result {
                Ok(suggestion) if suggestion.confidence >= self.threshold => {
                    if let Err((e, tx)) = self.accept(&group, &suggestion) {
                        self.fail_fatal(e, &tx);
                        return;
                    }
                }
                Ok(suggestion) => {
                    debug!(
                        signature = %group.signature,
                        category = %suggestion.category,
                        confidence = suggestion.confidence,
                        "Below auto-accept threshold"
                    );
                    self.send(WorkerEvent::NeedsReview(ReviewItem {
                        signature: group.signature,
                        transactions: group.transactions,
                        suggestion,
                    }));
                }
                Err(e) => {
                    let reason = e.to_string();
                    for tx in &group.transactions {
                        self.send(WorkerEvent::Failed(FailedTransaction::new(tx, &reason)));
                    }
                }
            }
        }
    }

    /// One classifier call for the unit, retried while every slot failed transiently
    async fn classify(&self, representatives: &[Transaction]) -> Result<Vec<Result<Suggestion>>> {
        let classifier: &C = &self.classifier;
        self.retry
            .run(&self.cancel, "classify_batch", move || async move {
                let results = classifier.classify_batch(representatives).await;
                if results.is_empty() && !representatives.is_empty() {
                    return Err(Error::Classifier(format!(
                        "classifier returned 0 results for {} transactions",
                        representatives.len()
                    )));
                }
                let all_transient = !results.is_empty()
                    && results
                        .iter()
                        .all(|r| r.as_ref().is_err_and(|e| e.is_retryable()));
                if all_transient {
                    return match results.into_iter().next() {
                        Some(Err(e)) => Err(e),
                        _ => Err(Error::Classifier("classifier batch failed".into())),
                    };
                }
                Ok(results)
            })
            .await
    }

    /// Write every miss in the group as AI-classified and learn an `auto` rule
    fn accept(
        &self,
        group: &MerchantGroup,
        suggestion: &Suggestion,
    ) -> std::result::Result<(), (Error, Transaction)> {
        for tx in &group.transactions {
            let mut classification = Classification::new(
                &tx.id,
                &suggestion.category,
                ClassificationStatus::ClassifiedByAi,
                suggestion.confidence,
            );
            if let Some(reasoning) = &suggestion.reasoning {
                classification = classification.with_notes(reasoning.clone());
            }
            self.db
                .upsert_classification(&classification)
                .map_err(|e| (e, tx.clone()))?;
            self.send(WorkerEvent::AutoAccepted {
                transaction: tx.clone(),
                category: suggestion.category.clone(),
            });
        }

        let first = &group.transactions[0];
        if !first.is_check() {
            self.db
                .learn_vendor_rule(first.merchant_key(), &suggestion.category, VendorRuleSource::Auto)
                .map_err(|e| (e, first.clone()))?;
        }
        debug!(
            worker = self.id,
            signature = %group.signature,
            category = %suggestion.category,
            count = group.transactions.len(),
            "Auto-accepted group"
        );
        Ok(())
    }
}
