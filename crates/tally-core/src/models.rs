//! Domain models for Tally

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Convert a dollar amount to integer cents for exact comparisons
pub(crate) fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Direction of a bank movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Income,
    Expense,
    Transfer,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Transfer => "transfer",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            "transfer" => Ok(Self::Transfer),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single bank movement, as delivered by an import collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Provider identifier
    pub id: String,
    pub date: NaiveDate,
    /// Raw name as it appears on the statement
    pub name: String,
    /// Cleaned merchant name (may be empty)
    pub merchant_name: String,
    /// Always a non-negative magnitude; see `direction`
    pub amount: f64,
    pub direction: Option<Direction>,
    pub account_id: String,
    pub check_number: Option<String>,
    /// Raw category supplied by the bank/aggregator
    pub provider_category: Option<String>,
}

impl Transaction {
    /// Create a transaction with the required fields; the merchant name defaults to `name`
    pub fn new(id: &str, date: NaiveDate, name: &str, amount: f64) -> Self {
        Self {
            id: id.to_string(),
            date,
            name: name.to_string(),
            merchant_name: name.to_string(),
            amount,
            direction: None,
            account_id: String::new(),
            check_number: None,
            provider_category: None,
        }
    }

    pub fn with_merchant(mut self, merchant: &str) -> Self {
        self.merchant_name = merchant.to_string();
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_check_number(mut self, number: &str) -> Self {
        self.check_number = Some(number.to_string());
        self
    }

    pub fn with_account(mut self, account_id: &str) -> Self {
        self.account_id = account_id.to_string();
        self
    }

    /// The string rules are keyed on: cleaned merchant, else raw name
    pub fn merchant_key(&self) -> &str {
        if self.merchant_name.trim().is_empty() {
            self.name.trim()
        } else {
            self.merchant_name.trim()
        }
    }

    /// Whether this looks like a paper check
    pub fn is_check(&self) -> bool {
        if self.check_number.as_deref().is_some_and(|n| !n.trim().is_empty()) {
            return true;
        }
        if self.name.trim_start().to_uppercase().starts_with("CHECK") {
            return true;
        }
        self.provider_category
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("check"))
    }

    pub fn day_of_month(&self) -> u32 {
        self.date.day()
    }
}

/// A spending/income category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStatus {
    Unclassified,
    ClassifiedByRule,
    ClassifiedByAi,
    UserModified,
}

impl ClassificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::ClassifiedByRule => "classified_by_rule",
            Self::ClassifiedByAi => "classified_by_ai",
            Self::UserModified => "user_modified",
        }
    }
}

impl std::str::FromStr for ClassificationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unclassified" => Ok(Self::Unclassified),
            "classified_by_rule" => Ok(Self::ClassifiedByRule),
            "classified_by_ai" => Ok(Self::ClassifiedByAi),
            "user_modified" => Ok(Self::UserModified),
            _ => Err(format!("Unknown classification status: {}", s)),
        }
    }
}

impl std::fmt::Display for ClassificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Categorization outcome for one transaction (one row per transaction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub transaction_id: String,
    pub category: String,
    pub status: ClassificationStatus,
    pub confidence: f64,
    pub classified_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl Classification {
    /// Build a classification, normalizing confidence for the status
    ///
    /// `user_modified` is always 1.0 and `unclassified` always 0.0.
    pub fn new(
        transaction_id: &str,
        category: &str,
        status: ClassificationStatus,
        confidence: f64,
    ) -> Self {
        let confidence = match status {
            ClassificationStatus::UserModified => 1.0,
            ClassificationStatus::Unclassified => 0.0,
            _ => confidence.clamp(0.0, 1.0),
        };
        Self {
            transaction_id: transaction_id.to_string(),
            category: category.to_string(),
            status,
            confidence,
            classified_at: Utc::now(),
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Trust level of a vendor rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorRuleSource {
    /// Created explicitly by the user
    Manual,
    /// Learned from a single accepted AI classification
    Auto,
    /// Learned, then confirmed or edited by the user
    AutoConfirmed,
}

impl VendorRuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::AutoConfirmed => "auto_confirmed",
        }
    }

    /// Confidence reported when a rule of this source matches
    pub fn match_confidence(&self) -> f64 {
        match self {
            Self::Manual | Self::AutoConfirmed => 1.0,
            Self::Auto => 0.95,
        }
    }
}

impl std::str::FromStr for VendorRuleSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "auto_confirmed" => Ok(Self::AutoConfirmed),
            _ => Err(format!("Unknown vendor rule source: {}", s)),
        }
    }
}

impl std::fmt::Display for VendorRuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Learned merchant → category mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorRule {
    pub id: i64,
    pub merchant: String,
    pub is_regex: bool,
    pub category: String,
    pub source: VendorRuleSource,
    pub use_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Soft-delete state shared by check patterns and pattern rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    #[default]
    Active,
    Inactive,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::str::FromStr for RuleState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("Unknown rule state: {}", s)),
        }
    }
}

/// Amounts a check pattern accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckAmount {
    Exact { amount: f64 },
    /// Inclusive on both ends
    Range { min: f64, max: f64 },
    List { amounts: Vec<f64> },
}

impl CheckAmount {
    pub fn matches(&self, amount: f64) -> bool {
        let cents = to_cents(amount);
        match self {
            Self::Exact { amount } => to_cents(*amount) == cents,
            Self::Range { min, max } => to_cents(*min) <= cents && cents <= to_cents(*max),
            Self::List { amounts } => amounts.iter().any(|a| to_cents(*a) == cents),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Exact { amount } if *amount < 0.0 => {
                Err("check amount must be non-negative".into())
            }
            Self::Range { min, max } if min > max => {
                Err(format!("amount range min {} exceeds max {}", min, max))
            }
            Self::Range { min, .. } if *min < 0.0 => {
                Err("check amount range must be non-negative".into())
            }
            Self::List { amounts } if amounts.is_empty() => {
                Err("check amount list must not be empty".into())
            }
            _ => Ok(()),
        }
    }
}

/// Inclusive day-of-month window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub min: u32,
    pub max: u32,
}

impl DayRange {
    pub fn new(min: u32, max: u32) -> std::result::Result<Self, String> {
        if !(1..=31).contains(&min) || !(1..=31).contains(&max) || min > max {
            return Err(format!("invalid day-of-month range {}-{}", min, max));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, day: u32) -> bool {
        self.min <= day && day <= self.max
    }
}

/// Rule specific to paper checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPattern {
    pub id: i64,
    pub name: String,
    pub amount: CheckAmount,
    pub day_range: Option<DayRange>,
    pub category: String,
    pub confidence_boost: f64,
    pub use_count: i64,
    pub state: RuleState,
    pub notes: Option<String>,
}

impl CheckPattern {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.amount.matches(tx.amount)
            && self
                .day_range
                .map(|r| r.contains(tx.day_of_month()))
                .unwrap_or(true)
    }
}

/// A check pattern before insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCheckPattern {
    pub name: String,
    pub amount: CheckAmount,
    pub day_range: Option<DayRange>,
    pub category: String,
    pub confidence_boost: f64,
    pub notes: Option<String>,
}

/// Merchant condition of a pattern rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "lowercase")]
pub enum MerchantMatch {
    /// Case-insensitive equality
    Exact(String),
    Regex(String),
}

impl MerchantMatch {
    pub fn pattern(&self) -> &str {
        match self {
            Self::Exact(p) | Self::Regex(p) => p,
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Self::Regex(_))
    }
}

/// Amount comparator of a pattern rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum AmountCondition {
    #[default]
    Any,
    Lt { value: f64 },
    Le { value: f64 },
    Eq { value: f64 },
    Ge { value: f64 },
    Gt { value: f64 },
    /// An absent bound is unbounded on that side
    Range { min: Option<f64>, max: Option<f64> },
}

impl AmountCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Lt { .. } => "lt",
            Self::Le { .. } => "le",
            Self::Eq { .. } => "eq",
            Self::Ge { .. } => "ge",
            Self::Gt { .. } => "gt",
            Self::Range { .. } => "range",
        }
    }

    /// Rebuild from the stored columns
    pub fn from_parts(
        kind: &str,
        value: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> std::result::Result<Self, String> {
        let need_value = || value.ok_or_else(|| format!("amount condition '{}' needs a value", kind));
        let condition = match kind {
            "any" => Self::Any,
            "lt" => Self::Lt { value: need_value()? },
            "le" => Self::Le { value: need_value()? },
            "eq" => Self::Eq { value: need_value()? },
            "ge" => Self::Ge { value: need_value()? },
            "gt" => Self::Gt { value: need_value()? },
            "range" => Self::Range { min, max },
            other => return Err(format!("Unknown amount condition: {}", other)),
        };
        condition.validate()?;
        Ok(condition)
    }

    /// (value, min, max) as stored
    pub fn parts(&self) -> (Option<f64>, Option<f64>, Option<f64>) {
        match *self {
            Self::Any => (None, None, None),
            Self::Lt { value }
            | Self::Le { value }
            | Self::Eq { value }
            | Self::Ge { value }
            | Self::Gt { value } => (Some(value), None, None),
            Self::Range { min, max } => (None, min, max),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Self::Range { min, max } = self {
            match (min, max) {
                (None, None) => return Err("range condition needs a min or a max".into()),
                (Some(lo), Some(hi)) if lo > hi => {
                    return Err(format!("range min {} exceeds max {}", lo, hi))
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn matches(&self, amount: f64) -> bool {
        let cents = to_cents(amount);
        match *self {
            Self::Any => true,
            Self::Lt { value } => cents < to_cents(value),
            Self::Le { value } => cents <= to_cents(value),
            Self::Eq { value } => cents == to_cents(value),
            Self::Ge { value } => cents >= to_cents(value),
            Self::Gt { value } => cents > to_cents(value),
            Self::Range { min, max } => {
                min.map(|m| cents >= to_cents(m)).unwrap_or(true)
                    && max.map(|m| cents <= to_cents(m)).unwrap_or(true)
            }
        }
    }
}

/// General-purpose conditional rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    pub id: i64,
    pub name: String,
    pub merchant: Option<MerchantMatch>,
    pub amount: AmountCondition,
    pub direction: Option<Direction>,
    pub category: String,
    pub confidence: f64,
    pub priority: i32,
    pub state: RuleState,
    pub use_count: i64,
}

/// A pattern rule before insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPatternRule {
    pub name: String,
    #[serde(default)]
    pub merchant: Option<MerchantMatch>,
    #[serde(default)]
    pub amount: AmountCondition,
    #[serde(default)]
    pub direction: Option<Direction>,
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub priority: i32,
}

impl NewPatternRule {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("pattern rule name must not be empty".into());
        }
        if self.category.trim().is_empty() {
            return Err("pattern rule category must not be empty".into());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if let Some(MerchantMatch::Regex(p)) = &self.merchant {
            regex::Regex::new(p).map_err(|e| format!("invalid merchant regex: {}", e))?;
        }
        self.amount.validate()
    }
}
