//! Rule-based classification: vendor rules, check patterns and pattern rules
//!
//! A [`RuleMatcher`] is a snapshot of every active rule with regexes compiled once.
//! Matching a transaction yields a deterministic, sorted candidate list; the first
//! candidate is the rule-based classification.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::Result;
use crate::models::{CheckPattern, MerchantMatch, PatternRule, Transaction, VendorRule};

/// Kind of rule that produced a candidate, in decreasing order of trust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Vendor,
    CheckPattern,
    PatternRule,
}

impl RuleKind {
    fn rank(&self) -> u8 {
        match self {
            Self::Vendor => 0,
            Self::CheckPattern => 1,
            Self::PatternRule => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vendor => "vendor",
            Self::CheckPattern => "check_pattern",
            Self::PatternRule => "pattern_rule",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One rule that matched a transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleCandidate {
    pub kind: RuleKind,
    pub rule_id: i64,
    /// Merchant for vendor rules, name otherwise
    pub rule_name: String,
    pub category: String,
    pub confidence: f64,
    /// Pattern rules only; 0 for the other kinds
    pub priority: i32,
    pub use_count: i64,
}

impl RuleCandidate {
    /// Bump the use count of the rule behind this candidate
    pub fn record_use(&self, db: &Database) -> Result<()> {
        match self.kind {
            RuleKind::Vendor => db.increment_vendor_rule_use(self.rule_id),
            RuleKind::CheckPattern => db.increment_check_pattern_use(self.rule_id),
            RuleKind::PatternRule => db.increment_pattern_rule_use(self.rule_id),
        }
    }

    fn cmp_rank(&self, other: &Self) -> Ordering {
        self.kind
            .rank()
            .cmp(&other.kind.rank())
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.confidence.total_cmp(&self.confidence))
            .then_with(|| other.use_count.cmp(&self.use_count))
            .then_with(|| self.rule_id.cmp(&other.rule_id))
    }
}

/// Winning candidate plus whether it had to beat others of its own kind
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub candidate: RuleCandidate,
    pub ambiguous: bool,
    pub total_candidates: usize,
}

struct CompiledVendorRegex {
    rule: VendorRule,
    regex: Regex,
}

struct CompiledPatternRule {
    rule: PatternRule,
    merchant_regex: Option<Regex>,
}

/// Compiled, in-memory view of the active rule set
#[derive(Default)]
pub struct RuleMatcher {
    /// Exact vendor rules keyed by lowercased merchant
    vendor_exact: HashMap<String, VendorRule>,
    /// Regex vendor rules in stored id order
    vendor_regex: Vec<CompiledVendorRegex>,
    check_patterns: Vec<CheckPattern>,
    pattern_rules: Vec<CompiledPatternRule>,
}

fn compile(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl RuleMatcher {
    /// Read every active rule from the store and compile regexes
    pub fn load(db: &Database) -> Result<Self> {
        let matcher = Self::from_rules(
            db.list_vendor_rules()?,
            db.list_check_patterns(false)?,
            db.list_pattern_rules(false)?,
        );
        debug!(
            vendor_rules = matcher.vendor_exact.len() + matcher.vendor_regex.len(),
            check_patterns = matcher.check_patterns.len(),
            pattern_rules = matcher.pattern_rules.len(),
            "Loaded rule set"
        );
        Ok(matcher)
    }

    /// Build from in-memory rules; inactive rules and invalid regexes are skipped
    pub fn from_rules(
        vendor_rules: Vec<VendorRule>,
        check_patterns: Vec<CheckPattern>,
        pattern_rules: Vec<PatternRule>,
    ) -> Self {
        let mut matcher = Self::default();

        let mut vendor_rules = vendor_rules;
        vendor_rules.sort_by_key(|r| r.id);
        for rule in vendor_rules {
            matcher.add_vendor_rule(rule);
        }

        matcher.check_patterns = check_patterns
            .into_iter()
            .filter(|p| p.state.is_active())
            .collect();

        matcher.pattern_rules = pattern_rules
            .into_iter()
            .filter(|r| r.state.is_active())
            .filter_map(|rule| {
                let merchant_regex = match &rule.merchant {
                    Some(MerchantMatch::Regex(p)) => match compile(p) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!(rule_id = rule.id, error = %e, "Skipping pattern rule with invalid regex");
                            return None;
                        }
                    },
                    _ => None,
                };
                Some(CompiledPatternRule {
                    rule,
                    merchant_regex,
                })
            })
            .collect();

        matcher
    }

    /// Insert or replace a vendor rule so later lookups in this run see it
    pub fn add_vendor_rule(&mut self, rule: VendorRule) {
        if rule.is_regex {
            let regex = match compile(&rule.merchant) {
                Ok(re) => re,
                Err(e) => {
                    warn!(rule_id = rule.id, error = %e, "Skipping vendor rule with invalid regex");
                    return;
                }
            };
            self.vendor_regex.retain(|c| c.rule.id != rule.id);
            let pos = self
                .vendor_regex
                .iter()
                .position(|c| c.rule.id > rule.id)
                .unwrap_or(self.vendor_regex.len());
            self.vendor_regex.insert(pos, CompiledVendorRegex { rule, regex });
        } else {
            self.vendor_exact.insert(fold_merchant(&rule.merchant), rule);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vendor_exact.is_empty()
            && self.vendor_regex.is_empty()
            && self.check_patterns.is_empty()
            && self.pattern_rules.is_empty()
    }

    /// Every matching rule, best first
    pub fn candidates(&self, tx: &Transaction) -> Vec<RuleCandidate> {
        let mut candidates = Vec::new();

        if let Some(rule) = self.match_vendor(tx) {
            candidates.push(RuleCandidate {
                kind: RuleKind::Vendor,
                rule_id: rule.id,
                rule_name: rule.merchant.clone(),
                category: rule.category.clone(),
                confidence: rule.source.match_confidence(),
                priority: 0,
                use_count: rule.use_count,
            });
        }

        if tx.is_check() {
            candidates.extend(self.check_patterns.iter().filter(|p| p.matches(tx)).map(
                |p| RuleCandidate {
                    kind: RuleKind::CheckPattern,
                    rule_id: p.id,
                    rule_name: p.name.clone(),
                    category: p.category.clone(),
                    confidence: p.confidence_boost,
                    priority: 0,
                    use_count: p.use_count,
                },
            ));
        }

        candidates.extend(
            self.pattern_rules
                .iter()
                .filter(|c| pattern_rule_matches(c, tx))
                .map(|c| RuleCandidate {
                    kind: RuleKind::PatternRule,
                    rule_id: c.rule.id,
                    rule_name: c.rule.name.clone(),
                    category: c.rule.category.clone(),
                    confidence: c.rule.confidence,
                    priority: c.rule.priority,
                    use_count: c.rule.use_count,
                }),
        );

        candidates.sort_by(|a, b| a.cmp_rank(b));
        candidates
    }

    pub fn best_match(&self, tx: &Transaction) -> Option<RuleCandidate> {
        self.candidates(tx).into_iter().next()
    }

    /// Best candidate with ambiguity information
    pub fn evaluate(&self, tx: &Transaction) -> Option<RuleMatch> {
        let candidates = self.candidates(tx);
        let total_candidates = candidates.len();
        let mut iter = candidates.into_iter();
        let candidate = iter.next()?;
        let ambiguous = iter.any(|c| c.kind == candidate.kind);
        Some(RuleMatch {
            candidate,
            ambiguous,
            total_candidates,
        })
    }

    fn match_vendor(&self, tx: &Transaction) -> Option<&VendorRule> {
        let key = tx.merchant_key();
        if let Some(rule) = self.vendor_exact.get(&fold_merchant(key)) {
            return Some(rule);
        }
        self.vendor_regex
            .iter()
            .find(|c| c.regex.is_match(key) || c.regex.is_match(&tx.name))
            .map(|c| &c.rule)
    }
}

/// Merchant comparison key
///
/// Folds ASCII letters only, like the store's `COLLATE NOCASE`, so a rule that
/// matches here is also the rule the unique index considers equal.
pub(crate) fn fold_merchant(merchant: &str) -> String {
    merchant.trim().to_ascii_lowercase()
}

fn pattern_rule_matches(compiled: &CompiledPatternRule, tx: &Transaction) -> bool {
    let rule = &compiled.rule;

    let merchant_ok = match (&rule.merchant, &compiled.merchant_regex) {
        (None, _) => true,
        (Some(MerchantMatch::Exact(m)), _) => fold_merchant(tx.merchant_key()) == fold_merchant(m),
        (Some(MerchantMatch::Regex(_)), Some(re)) => {
            re.is_match(tx.merchant_key()) || re.is_match(&tx.name)
        }
        (Some(MerchantMatch::Regex(_)), None) => false,
    };
    if !merchant_ok || !rule.amount.matches(tx.amount) {
        return false;
    }

    match rule.direction {
        None => true,
        Some(d) => tx.direction == Some(d),
    }
}
