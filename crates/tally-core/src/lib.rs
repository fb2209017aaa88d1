//! Tally Core Library
//!
//! Transaction classification for the Tally personal finance tool:
//! - Encrypted SQLite store with connection pooling
//! - Rule matching over vendor rules, check patterns and pattern rules
//! - Pluggable AI classifiers (Ollama, OpenAI-compatible servers)
//! - Interactive sequential and parallel batch classification engines
//! - Checkpoints that make bulk operations reversible
//! - Classification quality analysis with applicable fixes

pub mod analysis;
pub mod batch;
pub mod cancel;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod prompter;
pub mod retry;
pub mod rules;

/// Test utilities including mock Ollama server
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use analysis::{
    AnalysisEngine, AnalysisIssue, AnalysisOptions, AnalysisReport, AnalysisSession, Fix,
    FixApplier, FixOutcome, FixResult, IssueStatus, IssueType, SessionStatus, Severity,
};
pub use batch::{BatchOptions, BatchProcessor, BatchSummary, FailedTransaction, ReviewItem};
pub use cancel::CancelToken;
pub use checkpoint::{CheckpointInfo, CheckpointManager, RestoreGuard, RestoreRefused};
pub use classifier::{
    CategoryDescription, Classifier, ClassifierClient, MockClassifier, OllamaClassifier,
    OpenAICompatibleClassifier, Suggestion,
};
pub use config::Config;
pub use db::Database;
pub use engine::{ClassificationEngine, RunSummary};
pub use error::{Error, Result};
pub use prompter::{
    CompletionStats, PendingClassification, PromptDecision, Prompter, ScriptedPrompter,
    StatsTracker,
};
pub use retry::RetryPolicy;
pub use rules::{RuleCandidate, RuleKind, RuleMatch, RuleMatcher};
