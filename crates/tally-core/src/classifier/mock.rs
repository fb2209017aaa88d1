//! Mock classifier for testing
//!
//! Scripted responses keyed by merchant substring, call counting, injected
//! failures and delays. Useful for engine tests without a running LLM server.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::Transaction;

use super::types::{CategoryDescription, Suggestion};
use super::Classifier;

#[derive(Default)]
struct MockState {
    classify_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    description_calls: AtomicUsize,
    /// Calls that still have to fail before the mock starts answering
    transient_failures: AtomicUsize,
    /// Ids of every transaction the mock was asked about, in call order
    seen: Mutex<Vec<String>>,
}

/// Mock classifier
///
/// Well-known merchants get a fixed category; everything else gets the default.
#[derive(Clone)]
pub struct MockClassifier {
    responses: Arc<Vec<(String, Suggestion)>>,
    default: Suggestion,
    failing: Arc<HashSet<String>>,
    delay: Option<Duration>,
    analysis_response: Arc<String>,
    description: Option<String>,
    state: Arc<MockState>,
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClassifier {
    pub fn new() -> Self {
        let responses = [
            ("NETFLIX", "Subscriptions", 0.97),
            ("SPOTIFY", "Subscriptions", 0.97),
            ("STARBUCKS", "Dining", 0.96),
            ("WHOLE FOODS", "Groceries", 0.96),
            ("UBER", "Transport", 0.9),
            ("AMAZON", "Shopping", 0.85),
        ]
        .into_iter()
        .map(|(m, c, conf)| (m.to_string(), Suggestion::new(c, conf)))
        .collect();

        Self {
            responses: Arc::new(responses),
            default: Suggestion::new("Other", 0.5),
            failing: Arc::new(HashSet::new()),
            delay: None,
            analysis_response: Arc::new(r#"{"coherence_score": 1.0, "issues": []}"#.to_string()),
            description: Some("Mock category description".to_string()),
            state: Arc::new(MockState::default()),
        }
    }

    /// Answer `category`/`confidence` for merchants containing `merchant` (case-insensitive)
    ///
    /// Later registrations take precedence over earlier ones.
    pub fn with_response(mut self, merchant: &str, category: &str, confidence: f64) -> Self {
        let mut responses = (*self.responses).clone();
        responses.insert(0, (merchant.to_uppercase(), Suggestion::new(category, confidence)));
        self.responses = Arc::new(responses);
        self
    }

    pub fn with_default(mut self, category: &str, confidence: f64) -> Self {
        self.default = Suggestion::new(category, confidence);
        self
    }

    /// Permanently fail (retryable) for merchants containing `merchant`
    pub fn failing_for(mut self, merchant: &str) -> Self {
        let mut failing = (*self.failing).clone();
        failing.insert(merchant.to_uppercase());
        self.failing = Arc::new(failing);
        self
    }

    /// Fail the next `n` calls with a retryable error
    pub fn with_transient_failures(self, n: usize) -> Self {
        self.state.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_analysis_response(mut self, response: impl Into<String>) -> Self {
        self.analysis_response = Arc::new(response.into());
        self
    }

    /// `None` makes description generation fail
    pub fn with_description(mut self, description: Option<&str>) -> Self {
        self.description = description.map(String::from);
        self
    }

    pub fn classify_calls(&self) -> usize {
        self.state.classify_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.state.batch_calls.load(Ordering::SeqCst)
    }

    pub fn description_calls(&self) -> usize {
        self.state.description_calls.load(Ordering::SeqCst)
    }

    /// Transaction ids the mock has been asked to classify
    pub fn seen_transactions(&self) -> Vec<String> {
        self.state
            .seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_transient_failure(&self) -> bool {
        self.state
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record(&self, tx: &Transaction) {
        if let Ok(mut seen) = self.state.seen.lock() {
            seen.push(tx.id.clone());
        }
    }

    fn answer(&self, tx: &Transaction) -> Result<Suggestion> {
        let key = format!("{} {}", tx.merchant_key(), tx.name).to_uppercase();
        if self.failing.iter().any(|m| key.contains(m.as_str())) {
            return Err(Error::Classifier(format!(
                "mock classifier refuses '{}'",
                tx.merchant_key()
            )));
        }
        Ok(self
            .responses
            .iter()
            .find(|(m, _)| key.contains(m.as_str()))
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.default.clone()))
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, tx: &Transaction) -> Result<Suggestion> {
        self.state.classify_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.record(tx);
        if self.take_transient_failure() {
            return Err(Error::Classifier("mock transient failure".into()));
        }
        self.answer(tx)
    }

    async fn classify_batch(&self, txs: &[Transaction]) -> Vec<Result<Suggestion>> {
        self.state.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.take_transient_failure() {
            return txs
                .iter()
                .map(|_| Err(Error::Classifier("mock transient failure".into())))
                .collect();
        }
        txs.iter()
            .map(|tx| {
                self.record(tx);
                self.answer(tx)
            })
            .collect()
    }

    async fn generate_category_description(&self, name: &str) -> Result<CategoryDescription> {
        self.state.description_calls.fetch_add(1, Ordering::SeqCst);
        match &self.description {
            Some(d) => Ok(CategoryDescription {
                description: format!("{} ({})", d, name),
                confidence: 0.8,
            }),
            None => Err(Error::Classifier("mock description unavailable".into())),
        }
    }

    async fn analyze_transactions(&self, _prompt: &str) -> Result<String> {
        self.pause().await;
        Ok(self.analysis_response.to_string())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
