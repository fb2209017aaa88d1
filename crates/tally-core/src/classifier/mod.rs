//! Pluggable AI classifier abstraction
//!
//! - `Classifier` trait: the interface the engines call
//! - `ClassifierClient` enum: concrete wrapper providing Clone + compile-time dispatch
//! - Implementations: `OllamaClassifier`, `OpenAICompatibleClassifier`, `MockClassifier`
//!
//! Backend selection comes from [`crate::config::AiConfig`]; see `config/tally.toml`
//! for the environment variables that override it.

mod mock;
mod ollama;
mod openai_compatible;
pub mod parsing;
pub mod prompts;
pub mod types;

pub use mock::MockClassifier;
pub use ollama::OllamaClassifier;
pub use openai_compatible::OpenAICompatibleClassifier;
pub use types::{CategoryDescription, Suggestion};

use async_trait::async_trait;

use crate::config::{AiConfig, BackendKind};
use crate::error::{Error, Result};
use crate::models::Transaction;

/// Interface for all classifiers
///
/// Implementations must be Send + Sync so batch workers can share one instance.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Suggest a category for one transaction
    async fn classify(&self, tx: &Transaction) -> Result<Suggestion>;

    /// Suggest categories for several transactions; one result per input, in order
    async fn classify_batch(&self, txs: &[Transaction]) -> Vec<Result<Suggestion>> {
        let mut results = Vec::with_capacity(txs.len());
        for tx in txs {
            results.push(self.classify(tx).await);
        }
        results
    }

    /// Describe a category the user just created
    async fn generate_category_description(&self, name: &str) -> Result<CategoryDescription>;

    /// Free-form review of a batch of classifications; returns the raw model text
    async fn analyze_transactions(&self, prompt: &str) -> Result<String>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// Concrete classifier wrapper
#[derive(Clone)]
pub enum ClassifierClient {
    Ollama(OllamaClassifier),
    OpenAICompatible(OpenAICompatibleClassifier),
    /// Scripted classifier for tests and dry runs
    Mock(MockClassifier),
}

impl ClassifierClient {
    /// Build the configured backend
    pub fn from_config(config: &AiConfig) -> Result<Self> {
        match config.backend {
            BackendKind::Ollama => {
                let host = config.host.as_deref().ok_or_else(|| {
                    Error::Config("ai.host (or OLLAMA_HOST) is required for ollama".into())
                })?;
                Ok(Self::Ollama(OllamaClassifier::new(
                    host,
                    &config.model,
                    config.timeout,
                )?))
            }
            BackendKind::OpenAICompatible => {
                let host = config.host.as_deref().ok_or_else(|| {
                    Error::Config(
                        "ai.host (or OPENAI_COMPATIBLE_HOST) is required for openai_compatible"
                            .into(),
                    )
                })?;
                Ok(Self::OpenAICompatible(OpenAICompatibleClassifier::new(
                    host,
                    &config.model,
                    config.api_key.clone(),
                    config.timeout,
                )?))
            }
            BackendKind::Mock => Ok(Self::Mock(MockClassifier::new())),
        }
    }

    /// Create a mock classifier
    pub fn mock() -> Self {
        Self::Mock(MockClassifier::new())
    }

    /// Category names offered to the model in prompts
    pub fn with_categories(self, categories: Vec<String>) -> Self {
        match self {
            Self::Ollama(c) => Self::Ollama(c.with_categories(categories)),
            Self::OpenAICompatible(c) => Self::OpenAICompatible(c.with_categories(categories)),
            Self::Mock(c) => Self::Mock(c),
        }
    }
}

// Delegate to the inner backend
#[async_trait]
impl Classifier for ClassifierClient {
    async fn classify(&self, tx: &Transaction) -> Result<Suggestion> {
        match self {
            Self::Ollama(c) => c.classify(tx).await,
            Self::OpenAICompatible(c) => c.classify(tx).await,
            Self::Mock(c) => c.classify(tx).await,
        }
    }

    async fn classify_batch(&self, txs: &[Transaction]) -> Vec<Result<Suggestion>> {
        match self {
            Self::Ollama(c) => c.classify_batch(txs).await,
            Self::OpenAICompatible(c) => c.classify_batch(txs).await,
            Self::Mock(c) => c.classify_batch(txs).await,
        }
    }

    async fn generate_category_description(&self, name: &str) -> Result<CategoryDescription> {
        match self {
            Self::Ollama(c) => c.generate_category_description(name).await,
            Self::OpenAICompatible(c) => c.generate_category_description(name).await,
            Self::Mock(c) => c.generate_category_description(name).await,
        }
    }

    async fn analyze_transactions(&self, prompt: &str) -> Result<String> {
        match self {
            Self::Ollama(c) => c.analyze_transactions(prompt).await,
            Self::OpenAICompatible(c) => c.analyze_transactions(prompt).await,
            Self::Mock(c) => c.analyze_transactions(prompt).await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Ollama(c) => c.name(),
            Self::OpenAICompatible(c) => c.name(),
            Self::Mock(c) => c.name(),
        }
    }
}
