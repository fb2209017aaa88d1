//! OpenAI-compatible classifier
//!
//! Works with any server exposing `/v1/chat/completions`: vLLM, LocalAI,
//! llama-server, Docker Model Runner and friends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::Transaction;

use super::parsing::{
    fail_batch, parse_batch_suggestions, parse_category_description, parse_suggestion,
};
use super::prompts::{classify_batch_prompt, classify_prompt, describe_category_prompt};
use super::types::{CategoryDescription, Suggestion};
use super::Classifier;

#[derive(Clone)]
pub struct OpenAICompatibleClassifier {
    http_client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    categories: Arc<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OpenAICompatibleClassifier {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            categories: Arc::new(Vec::new()),
        })
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = Arc::new(categories);
        self
    }

    async fn chat_completion(&self, prompt: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.1,
            stream: false,
        };

        let mut req_builder = self
            .http_client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);

        if let Some(ref api_key) = self.api_key {
            req_builder = req_builder.bearer_auth(api_key);
        }

        let response = req_builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Classifier(format!(
                "OpenAI-compatible API error {}: {}",
                status, body
            )));
        }

        let chat_response: ChatCompletionResponse = response.json().await?;
        let content = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Classifier("No choices in chat completion response".into()))?;
        debug!(model = %self.model, "Chat completion: {}", content);
        Ok(content)
    }
}

#[async_trait]
impl Classifier for OpenAICompatibleClassifier {
    async fn classify(&self, tx: &Transaction) -> Result<Suggestion> {
        let response = self
            .chat_completion(&classify_prompt(tx, &self.categories))
            .await?;
        parse_suggestion(&response)
    }

    async fn classify_batch(&self, txs: &[Transaction]) -> Vec<Result<Suggestion>> {
        if txs.is_empty() {
            return Vec::new();
        }
        match self
            .chat_completion(&classify_batch_prompt(txs, &self.categories))
            .await
        {
            Ok(response) => parse_batch_suggestions(&response, txs.len()),
            Err(e) => fail_batch(e, txs.len()),
        }
    }

    async fn generate_category_description(&self, name: &str) -> Result<CategoryDescription> {
        let response = self.chat_completion(&describe_category_prompt(name)).await?;
        parse_category_description(&response)
    }

    async fn analyze_transactions(&self, prompt: &str) -> Result<String> {
        self.chat_completion(prompt).await
    }

    fn name(&self) -> &str {
        "openai_compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(reply: &'static str) -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<Value>| async move {
                assert_eq!(body["messages"][0]["role"], "user");
                Json(json!({"choices": [{"message": {"role": "assistant", "content": reply}}]}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_chat_completion_classify() {
        let url = serve(r#"{"category": "Groceries", "confidence": 0.88}"#).await;
        let classifier = OpenAICompatibleClassifier::new(
            &url,
            "qwen2.5",
            Some("key".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let tx = Transaction::new(
            "1",
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            "SAFEWAY #12",
            54.2,
        );
        let suggestion = classifier.classify(&tx).await.unwrap();
        assert_eq!(suggestion.category, "Groceries");
        assert_eq!(classifier.name(), "openai_compatible");
    }

    #[tokio::test]
    async fn test_analyze_returns_raw_text() {
        let url = serve("no json here").await;
        let classifier =
            OpenAICompatibleClassifier::new(&url, "m", None, Duration::from_secs(5)).unwrap();
        let text = classifier.analyze_transactions("review").await.unwrap();
        assert_eq!(text, "no json here");
    }
}
