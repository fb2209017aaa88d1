//! JSON parsing helpers for classifier responses
//!
//! Models often wrap the JSON payload in extra prose or code fences.

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

use super::types::{BatchResponse, CategoryDescription, Suggestion};

fn truncate(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Slice from the first `{` to the last `}`
pub fn extract_json(response: &str) -> Result<&str> {
    let response = response.trim();
    match (response.find('{'), response.rfind('}')) {
        (Some(s), Some(e)) if s < e => Ok(&response[s..=e]),
        _ => Err(Error::InvalidData(format!(
            "No JSON found in classifier response | Raw: {}",
            truncate(response)
        ))),
    }
}

/// Extract and deserialize the JSON object in a response
pub fn parse_json<T: DeserializeOwned>(response: &str) -> Result<T> {
    let json_str = extract_json(response)?;
    serde_json::from_str(json_str).map_err(|e| {
        Error::InvalidData(format!(
            "Invalid JSON from classifier: {} | Raw: {}",
            e,
            truncate(json_str)
        ))
    })
}

fn check_suggestion(suggestion: Suggestion) -> Result<Suggestion> {
    let category = suggestion.category.trim();
    if category.is_empty() {
        return Err(Error::Classifier("classifier returned an empty category".into()));
    }
    if !suggestion.confidence.is_finite() {
        return Err(Error::Classifier("classifier returned a non-numeric confidence".into()));
    }
    Ok(Suggestion {
        category: category.to_string(),
        confidence: suggestion.confidence.clamp(0.0, 1.0),
        reasoning: suggestion.reasoning,
    })
}

pub fn parse_suggestion(response: &str) -> Result<Suggestion> {
    let suggestion: Suggestion = parse_json(response).map_err(into_classifier_error)?;
    check_suggestion(suggestion)
}

/// Parse a batch response into exactly `expected` results, in request order
pub fn parse_batch_suggestions(response: &str, expected: usize) -> Vec<Result<Suggestion>> {
    let parsed: BatchResponse = match parse_json(response) {
        Ok(p) => p,
        Err(e) => {
            let msg = e.to_string();
            return (0..expected)
                .map(|_| Err(Error::Classifier(msg.clone())))
                .collect();
        }
    };

    let mut slots: Vec<Option<Suggestion>> = vec![None; expected];
    for entry in parsed.results {
        if entry.index == 0 || entry.index > expected {
            continue;
        }
        let slot = &mut slots[entry.index - 1];
        if slot.is_none() {
            *slot = Some(Suggestion {
                category: entry.category,
                confidence: entry.confidence,
                reasoning: entry.reasoning,
            });
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| match slot {
            Some(s) => check_suggestion(s),
            None => Err(Error::Classifier(format!(
                "no result for transaction {} in batch response",
                i + 1
            ))),
        })
        .collect()
}

/// Spread one request-level failure over every slot of a batch
///
/// The first slot keeps the original error; the rest carry its message with the
/// same retryability.
pub(crate) fn fail_batch(e: Error, expected: usize) -> Vec<Result<Suggestion>> {
    let msg = e.to_string();
    let retryable = e.is_retryable();
    let mut results = Vec::with_capacity(expected);
    if expected > 0 {
        results.push(Err(e));
    }
    for _ in 1..expected {
        results.push(Err(if retryable {
            Error::Classifier(msg.clone())
        } else {
            Error::InvalidData(msg.clone())
        }));
    }
    results
}

pub fn parse_category_description(response: &str) -> Result<CategoryDescription> {
    let parsed: CategoryDescription = parse_json(response)?;
    if parsed.description.trim().is_empty() {
        return Err(Error::InvalidData("empty category description".into()));
    }
    Ok(CategoryDescription {
        description: parsed.description.trim().to_string(),
        confidence: parsed.confidence.clamp(0.0, 1.0),
    })
}

/// Malformed model output is worth retrying
fn into_classifier_error(e: Error) -> Error {
    match e {
        Error::InvalidData(msg) => Error::Classifier(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suggestion_with_prose() {
        let response = "Sure! Here you go:\n```json\n{\"category\": \" Dining \", \"confidence\": 0.91}\n```";
        let s = parse_suggestion(response).unwrap();
        assert_eq!(s.category, "Dining");
        assert_eq!(s.confidence, 0.91);
        assert!(s.reasoning.is_none());
    }

    #[test]
    fn test_parse_suggestion_clamps_confidence() {
        let s = parse_suggestion(r#"{"category":"Dining","confidence":1.7}"#).unwrap();
        assert_eq!(s.confidence, 1.0);
    }

    #[test]
    fn test_no_json_is_retryable() {
        let err = parse_suggestion("I am not sure").unwrap_err();
        assert!(err.is_retryable());
        assert!(parse_suggestion(r#"{"category":"","confidence":0.5}"#).is_err());
    }

    #[test]
    fn test_batch_fills_missing_slots_with_errors() {
        let response = r#"{"results":[
            {"index": 2, "category": "Groceries", "confidence": 0.8},
            {"index": 1, "category": "Dining", "confidence": 0.97},
            {"index": 9, "category": "Ignored", "confidence": 0.1}
        ]}"#;
        let results = parse_batch_suggestions(response, 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().category, "Dining");
        assert_eq!(results[1].as_ref().unwrap().category, "Groceries");
        assert!(results[2].is_err());
    }

    #[test]
    fn test_batch_garbage_fails_every_slot() {
        let results = parse_batch_suggestions("nope", 2);
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn test_truncates_long_raw_text() {
        let long = "x".repeat(500);
        let msg = extract_json(&long).unwrap_err().to_string();
        assert!(msg.len() < 300);
    }
}
