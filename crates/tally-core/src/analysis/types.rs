//! Analysis session, issue and fix types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::NewPatternRule;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    _ => Err(format!("Unknown {}: {}", stringify!($name), s)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

string_enum!(SessionStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// Same merchant spread over several categories
    Inconsistent,
    /// Category looks wrong for the transaction
    Misclassified,
    /// Frequent merchant with no vendor rule
    MissingPattern,
}

string_enum!(IssueType {
    Inconsistent => "inconsistent",
    Misclassified => "misclassified",
    MissingPattern => "missing_pattern",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

string_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Pending,
    Fixed,
    Dismissed,
    Failed,
}

string_enum!(IssueStatus {
    Pending => "pending",
    Fixed => "fixed",
    Dismissed => "dismissed",
    Failed => "failed",
});

/// A corrective action attached to an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fix {
    Recategorize {
        transaction_ids: Vec<String>,
        category: String,
    },
    CreateVendorRule {
        merchant: String,
        category: String,
        #[serde(default)]
        is_regex: bool,
    },
    CreatePatternRule {
        rule: NewPatternRule,
    },
}

impl Fix {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Recategorize { .. } => "recategorize",
            Self::CreateVendorRule { .. } => "create_vendor_rule",
            Self::CreatePatternRule { .. } => "create_pattern_rule",
        }
    }

    /// Category the fix moves things into
    pub fn category(&self) -> &str {
        match self {
            Self::Recategorize { category, .. } | Self::CreateVendorRule { category, .. } => {
                category
            }
            Self::CreatePatternRule { rule } => &rule.category,
        }
    }
}

/// A resumable analysis run over a date range
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSession {
    pub id: String,
    pub status: SessionStatus,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub issues_found: i64,
    pub issues_fixed: i64,
    pub coherence_score: Option<f64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisIssue {
    pub id: String,
    pub session_id: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    pub transaction_ids: Vec<String>,
    pub current_category: Option<String>,
    pub suggested_category: Option<String>,
    pub confidence: f64,
    pub fix: Option<Fix>,
    pub status: IssueStatus,
    pub fixed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AnalysisIssue {
    /// A fresh pending issue with a random id
    pub fn new(
        session_id: &str,
        issue_type: IssueType,
        severity: Severity,
        description: impl Into<String>,
        transaction_ids: Vec<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            issue_type,
            severity,
            description: description.into(),
            transaction_ids,
            current_category: None,
            suggested_category: None,
            confidence: confidence.clamp(0.0, 1.0),
            fix: None,
            status: IssueStatus::Pending,
            fixed_at: None,
            error: None,
        }
    }

    pub fn with_categories(mut self, current: Option<&str>, suggested: Option<&str>) -> Self {
        self.current_category = current.map(String::from);
        self.suggested_category = suggested.map(String::from);
        self
    }

    pub fn with_fix(mut self, fix: Fix) -> Self {
        self.fix = Some(fix);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_json_shape() {
        let fix = Fix::CreateVendorRule {
            merchant: "NETFLIX".into(),
            category: "Subscriptions".into(),
            is_regex: false,
        };
        let json = serde_json::to_value(&fix).unwrap();
        assert_eq!(json["type"], "create_vendor_rule");
        assert_eq!(json["merchant"], "NETFLIX");

        let parsed: Fix = serde_json::from_str(
            r#"{"type":"recategorize","transaction_ids":["a","b"],"category":"Dining"}"#,
        )
        .unwrap();
        assert_eq!(parsed.category(), "Dining");
    }

    #[test]
    fn test_status_strings() {
        assert_eq!("in_progress".parse::<SessionStatus>().unwrap(), SessionStatus::InProgress);
        assert_eq!(IssueType::MissingPattern.as_str(), "missing_pattern");
        assert!("bogus".parse::<IssueStatus>().is_err());
    }
}
