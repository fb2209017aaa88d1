//! Prompt templates shared by the HTTP classifiers
//!
//! Templates use `{{var}}` placeholders.

use std::collections::HashMap;

use crate::models::Transaction;

pub const CLASSIFY_TRANSACTION: &str = r#"You categorize personal bank transactions.

Categories: {{categories}}

Transaction:
{{transaction}}

Pick the single best category. Prefer the listed categories; only invent a new one
if none fits. Respond with JSON only:
{"category": "<name>", "confidence": <0.0-1.0>, "reasoning": "<one sentence>"}"#;

pub const CLASSIFY_BATCH: &str = r#"You categorize personal bank transactions.

Categories: {{categories}}

Transactions (one per line, numbered):
{{transactions}}

Pick the single best category for every numbered transaction. Prefer the listed
categories. Respond with JSON only:
{"results": [{"index": 1, "category": "<name>", "confidence": <0.0-1.0>, "reasoning": "<short>"}]}"#;

pub const DESCRIBE_CATEGORY: &str = r#"Write a one-sentence description of the personal
finance spending category "{{name}}" that would help someone decide which transactions
belong in it. Respond with JSON only:
{"description": "<sentence>", "confidence": <0.0-1.0>}"#;

pub const ANALYZE_CLASSIFICATIONS: &str = r#"You review how personal bank transactions were categorized.

Categories: {{categories}}

Classified transactions (id | date | description | amount | category):
{{transactions}}

Look for transactions that are in the wrong category and for merchants that would
benefit from a fixed rule. Only reference ids from the list. Respond with JSON only:
{"coherence_score": <0.0-1.0>,
 "issues": [{"type": "misclassified" | "inconsistent" | "missing_pattern",
             "severity": "low" | "medium" | "high",
             "description": "<one sentence>",
             "transaction_ids": ["<id>"],
             "current_category": "<name>",
             "suggested_category": "<name>",
             "confidence": <0.0-1.0>,
             "fix": {"type": "recategorize", "transaction_ids": ["<id>"], "category": "<name>"}
                  | {"type": "create_vendor_rule", "merchant": "<merchant>", "category": "<name>"}}]}"#;

/// Simple mustache-style replacement: {{var}}
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let pattern = format!("{{{{{}}}}}", key);
        result = result.replace(&pattern, value);
    }
    result
}

fn categories_line(categories: &[String]) -> String {
    if categories.is_empty() {
        "(none defined yet, choose a short common name)".to_string()
    } else {
        categories.join(", ")
    }
}

/// Single-line description of a transaction for prompts
pub fn describe_transaction(tx: &Transaction) -> String {
    let mut line = format!("{} | {} | ${:.2}", tx.date, tx.name, tx.amount);
    if !tx.merchant_name.is_empty() && tx.merchant_name != tx.name {
        line.push_str(&format!(" | merchant: {}", tx.merchant_name));
    }
    if let Some(direction) = tx.direction {
        line.push_str(&format!(" | {}", direction));
    }
    if let Some(category) = &tx.provider_category {
        line.push_str(&format!(" | bank category: {}", category));
    }
    line
}

pub fn classify_prompt(tx: &Transaction, categories: &[String]) -> String {
    let mut vars = HashMap::new();
    vars.insert("categories", categories_line(categories));
    vars.insert("transaction", describe_transaction(tx));
    render(CLASSIFY_TRANSACTION, &vars)
}

pub fn classify_batch_prompt(txs: &[Transaction], categories: &[String]) -> String {
    let lines = txs
        .iter()
        .enumerate()
        .map(|(i, tx)| format!("{}. {}", i + 1, describe_transaction(tx)))
        .collect::<Vec<_>>()
        .join("\n");
    let mut vars = HashMap::new();
    vars.insert("categories", categories_line(categories));
    vars.insert("transactions", lines);
    render(CLASSIFY_BATCH, &vars)
}

pub fn describe_category_prompt(name: &str) -> String {
    let mut vars = HashMap::new();
    vars.insert("name", name.to_string());
    render(DESCRIBE_CATEGORY, &vars)
}

/// `(transaction, category)` pairs rendered for a review prompt
pub fn analysis_prompt(rows: &[(&Transaction, &str)], categories: &[String]) -> String {
    let lines = rows
        .iter()
        .map(|(tx, category)| {
            format!(
                "{} | {} | {} | ${:.2} | {}",
                tx.id,
                tx.date,
                tx.merchant_key(),
                tx.amount,
                category
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let mut vars = HashMap::new();
    vars.insert("categories", categories_line(categories));
    vars.insert("transactions", lines);
    render(ANALYZE_CLASSIFICATIONS, &vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::NaiveDate;

    #[test]
    fn test_batch_prompt_numbers_transactions() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let txs = vec![
            Transaction::new("a", date, "NETFLIX.COM", 15.49),
            Transaction::new("b", date, "PAYROLL ACME", 2500.0).with_direction(Direction::Income),
        ];
        let prompt = classify_batch_prompt(&txs, &["Subscriptions".into(), "Income".into()]);
        assert!(prompt.contains("1. 2024-01-02 | NETFLIX.COM | $15.49"));
        assert!(prompt.contains("2. 2024-01-02 | PAYROLL ACME | $2500.00 | income"));
        assert!(prompt.contains("Subscriptions, Income"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn test_analysis_prompt_lists_ids_and_categories() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let tx = Transaction::new("tx-9", date, "SHELL OIL 123", 40.0);
        let prompt = analysis_prompt(&[(&tx, "Transport")], &["Transport".into()]);
        assert!(prompt.contains("tx-9 | 2024-03-09 | SHELL OIL 123 | $40.00 | Transport"));
        assert!(!prompt.contains("{{"));
    }
}
