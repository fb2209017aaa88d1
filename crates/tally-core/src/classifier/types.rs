//! Classifier response types
//!
//! These types are backend-agnostic and used across all classifier implementations.

use serde::{Deserialize, Serialize};

/// A category proposed for a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub category: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl Suggestion {
    pub fn new(category: &str, confidence: f64) -> Self {
        Self {
            category: category.to_string(),
            confidence,
            reasoning: None,
        }
    }
}

/// Generated description for a newly created category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDescription {
    pub description: String,
    #[serde(default)]
    pub confidence: f64,
}

/// One entry of a batch classification response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BatchEntry {
    /// 1-based position in the request
    pub index: usize,
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BatchResponse {
    pub results: Vec<BatchEntry>,
}
