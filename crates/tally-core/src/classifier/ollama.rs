//! Ollama classifier
//!
//! Talks to a local Ollama server through `/api/generate` with streaming disabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::models::Transaction;

use super::parsing::{
    fail_batch, parse_batch_suggestions, parse_category_description, parse_suggestion,
};
use super::prompts::{classify_batch_prompt, classify_prompt, describe_category_prompt};
use super::types::{CategoryDescription, Suggestion};
use super::Classifier;

#[derive(Clone)]
pub struct OllamaClassifier {
    http_client: Client,
    base_url: String,
    model: String,
    categories: Arc<Vec<String>>,
}

/// Request to Ollama API
#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Response from Ollama API
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClassifier {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            categories: Arc::new(Vec::new()),
        })
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = Arc::new(categories);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = self
            .http_client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let ollama_response: OllamaResponse = response.json().await?;
        debug!(model = %self.model, "Ollama response: {}", ollama_response.response);
        Ok(ollama_response.response)
    }
}

#[async_trait]
impl Classifier for OllamaClassifier {
    async fn classify(&self, tx: &Transaction) -> Result<Suggestion> {
        let response = self.generate(&classify_prompt(tx, &self.categories)).await?;
        parse_suggestion(&response)
    }

    async fn classify_batch(&self, txs: &[Transaction]) -> Vec<Result<Suggestion>> {
        if txs.is_empty() {
            return Vec::new();
        }
        match self
            .generate(&classify_batch_prompt(txs, &self.categories))
            .await
        {
            Ok(response) => parse_batch_suggestions(&response, txs.len()),
            Err(e) => fail_batch(e, txs.len()),
        }
    }

    async fn generate_category_description(&self, name: &str) -> Result<CategoryDescription> {
        let response = self.generate(&describe_category_prompt(name)).await?;
        parse_category_description(&response)
    }

    async fn analyze_transactions(&self, prompt: &str) -> Result<String> {
        self.generate(prompt).await
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockOllamaServer;
    use chrono::NaiveDate;

    fn tx(id: &str, name: &str) -> Transaction {
        Transaction::new(id, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(), name, 9.99)
    }

    #[tokio::test]
    async fn test_classify_over_http() {
        let server = MockOllamaServer::start().await;
        let classifier =
            OllamaClassifier::new(&server.url(), "test", Duration::from_secs(5)).unwrap();

        let suggestion = classifier.classify(&tx("1", "NETFLIX.COM")).await.unwrap();
        assert_eq!(suggestion.category, "Subscriptions");
        assert_eq!(suggestion.confidence, 0.96);
        assert_eq!(server.requests(), 1);
    }

    #[tokio::test]
    async fn test_batch_is_one_request() {
        let server = MockOllamaServer::start().await;
        let classifier =
            OllamaClassifier::new(&server.url(), "test", Duration::from_secs(5)).unwrap();

        let results = classifier
            .classify_batch(&[tx("1", "STARBUCKS #1"), tx("2", "MYSTERY SHOP")])
            .await;
        assert_eq!(server.requests(), 1);
        assert_eq!(results[0].as_ref().unwrap().category, "Dining");
        assert_eq!(results[1].as_ref().unwrap().category, "Other");
    }

    #[tokio::test]
    async fn test_category_description() {
        let server = MockOllamaServer::start().await;
        let classifier =
            OllamaClassifier::new(&server.url(), "test", Duration::from_secs(5)).unwrap();
        let description = classifier.generate_category_description("Pets").await.unwrap();
        assert_eq!(description.description, "Mock description");
    }

    #[tokio::test]
    async fn test_http_failure_is_retryable() {
        let classifier =
            OllamaClassifier::new("http://127.0.0.1:1", "test", Duration::from_secs(1)).unwrap();
        let results = classifier
            .classify_batch(&[tx("1", "A"), tx("2", "B")])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.as_ref().unwrap_err().is_retryable()));
    }
}
