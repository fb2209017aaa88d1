//! User interaction during classification
//!
//! The engines never talk to a terminal directly. Every decision that needs a human
//! goes through a [`Prompter`], and progress bookkeeping is shared through
//! [`StatsTracker`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::classifier::Suggestion;
use crate::error::Result;
use crate::models::Transaction;

/// An AI suggestion waiting for the user
#[derive(Debug, Clone, Serialize)]
pub struct PendingClassification {
    /// The transaction shown to the user (first of its merchant group in batch mode)
    pub transaction: Transaction,
    pub suggestion: Suggestion,
    /// How many transactions the decision applies to
    pub group_size: usize,
}

impl PendingClassification {
    pub fn new(transaction: Transaction, suggestion: Suggestion) -> Self {
        Self {
            transaction,
            suggestion,
            group_size: 1,
        }
    }

    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = group_size.max(1);
        self
    }
}

/// User answer to a pending classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptDecision {
    Accept,
    /// Use this category instead (created if it does not exist)
    Edit(String),
    Reject,
}

/// Progress counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionStats {
    pub total: usize,
    pub processed: usize,
    pub auto_classified: usize,
    pub user_classified: usize,
    pub rejected: usize,
    pub elapsed: Duration,
}

/// Interface between the engines and whoever answers their questions
#[async_trait]
pub trait Prompter: Send {
    /// A run over `total` transactions is starting
    fn start(&mut self, total: usize);

    /// A transaction was classified without asking (rule match or auto-accept)
    fn record_auto(&mut self, tx: &Transaction, category: &str);

    /// Ask the user to accept, edit or reject a suggestion
    async fn confirm(&mut self, pending: &PendingClassification) -> Result<PromptDecision>;

    /// The classifier gave up on `tx`; return true to try again, false to skip it
    async fn confirm_retry(&mut self, tx: &Transaction, error: &str) -> Result<bool>;

    fn completion_stats(&self) -> CompletionStats;
}

/// Shared bookkeeping for prompter implementations
#[derive(Debug, Default)]
pub struct StatsTracker {
    stats: CompletionStats,
    started: Option<Instant>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, total: usize) {
        self.stats = CompletionStats {
            total,
            ..Default::default()
        };
        self.started = Some(Instant::now());
    }

    pub fn record_auto(&mut self) {
        self.stats.processed += 1;
        self.stats.auto_classified += 1;
    }

    /// Count a user decision covering `count` transactions
    pub fn record_decision(&mut self, decision: &PromptDecision, count: usize) {
        self.stats.processed += count;
        match decision {
            PromptDecision::Accept | PromptDecision::Edit(_) => {
                self.stats.user_classified += count
            }
            PromptDecision::Reject => self.stats.rejected += count,
        }
    }

    /// A transaction was skipped after classifier failures
    pub fn record_skip(&mut self) {
        self.stats.processed += 1;
    }

    pub fn stats(&self) -> CompletionStats {
        CompletionStats {
            elapsed: self.started.map(|s| s.elapsed()).unwrap_or_default(),
            ..self.stats.clone()
        }
    }
}

/// Prompter that replays queued answers (for tests and non-interactive runs)
///
/// With an empty queue every suggestion is accepted and every retry is declined.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    decisions: VecDeque<PromptDecision>,
    retries: VecDeque<bool>,
    tracker: StatsTracker,
    /// Every suggestion that was put to the "user", in order
    pub confirmed: Vec<PendingClassification>,
    /// `(transaction id, category)` for every automatic classification
    pub auto: Vec<(String, String)>,
    /// Transaction ids whose classifier failure was reported
    pub retry_prompts: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decisions(mut self, decisions: impl IntoIterator<Item = PromptDecision>) -> Self {
        self.decisions.extend(decisions);
        self
    }

    pub fn with_retries(mut self, retries: impl IntoIterator<Item = bool>) -> Self {
        self.retries.extend(retries);
        self
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    fn start(&mut self, total: usize) {
        self.tracker.start(total);
    }

    fn record_auto(&mut self, tx: &Transaction, category: &str) {
        self.tracker.record_auto();
        self.auto.push((tx.id.clone(), category.to_string()));
    }

    async fn confirm(&mut self, pending: &PendingClassification) -> Result<PromptDecision> {
        let decision = self.decisions.pop_front().unwrap_or(PromptDecision::Accept);
        self.tracker.record_decision(&decision, pending.group_size);
        self.confirmed.push(pending.clone());
        Ok(decision)
    }

    async fn confirm_retry(&mut self, tx: &Transaction, _error: &str) -> Result<bool> {
        self.retry_prompts.push(tx.id.clone());
        let retry = self.retries.pop_front().unwrap_or(false);
        if !retry {
            self.tracker.record_skip();
        }
        Ok(retry)
    }

    fn completion_stats(&self) -> CompletionStats {
        self.tracker.stats()
    }
}
