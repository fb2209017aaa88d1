//! Rule management commands (vendor rules, check patterns, pattern rules)

use anyhow::{bail, Context, Result};
use tally_core::models::{
    AmountCondition, CheckAmount, DayRange, Direction, MerchantMatch, NewCheckPattern,
    NewPatternRule, RuleState,
};
use tally_core::Database;

use super::truncate;

// ========== Vendor rules ==========

pub fn cmd_vendor_list(db: &Database) -> Result<()> {
    let rules = db.list_vendor_rules().context("Failed to list vendor rules")?;

    if rules.is_empty() {
        println!("No vendor rules yet. They are learned as you classify.");
        return Ok(());
    }

    println!(
        "{:<5} {:<32} {:<16} {:<15} {:>5}",
        "ID", "MERCHANT", "CATEGORY", "SOURCE", "USES"
    );
    println!("{}", "-".repeat(78));
    for rule in rules {
        let merchant = if rule.is_regex {
            format!("/{}/", rule.merchant)
        } else {
            rule.merchant
        };
        println!(
            "{:<5} {:<32} {:<16} {:<15} {:>5}",
            rule.id,
            truncate(&merchant, 32),
            truncate(&rule.category, 16),
            rule.source.as_str(),
            rule.use_count
        );
    }

    Ok(())
}

pub fn cmd_vendor_add(db: &Database, merchant: &str, category: &str, regex: bool) -> Result<()> {
    require_category(db, category)?;
    let rule = db
        .add_vendor_rule(merchant, category, regex)
        .context("Failed to add vendor rule")?;
    println!(
        "✅ Vendor rule {}: {} → {}",
        rule.id, rule.merchant, rule.category
    );
    Ok(())
}

pub fn cmd_vendor_deactivate(db: &Database, id: i64) -> Result<()> {
    let rule = db
        .get_vendor_rule_by_id(id)?
        .with_context(|| format!("Vendor rule not found: {}", id))?;
    db.delete_vendor_rule(id)
        .context("Failed to remove vendor rule")?;
    println!("✅ Removed vendor rule {} ({})", id, rule.merchant);
    Ok(())
}

// ========== Check patterns ==========

pub fn cmd_check_list(db: &Database, all: bool) -> Result<()> {
    let patterns = db
        .list_check_patterns(all)
        .context("Failed to list check patterns")?;

    if patterns.is_empty() {
        println!("No check patterns. Add one with 'tally rules check add'.");
        return Ok(());
    }

    println!(
        "{:<5} {:<18} {:<22} {:<7} {:<14} {:>5} {:>5}",
        "ID", "NAME", "AMOUNT", "DAYS", "CATEGORY", "CONF", "USES"
    );
    println!("{}", "-".repeat(82));
    for pattern in patterns {
        let days = pattern
            .day_range
            .map(|d| format!("{}-{}", d.min, d.max))
            .unwrap_or_else(|| "any".into());
        let name = if pattern.state.is_active() {
            pattern.name
        } else {
            format!("{} (off)", pattern.name)
        };
        println!(
            "{:<5} {:<18} {:<22} {:<7} {:<14} {:>5.2} {:>5}",
            pattern.id,
            truncate(&name, 18),
            truncate(&describe_check_amount(&pattern.amount), 22),
            days,
            truncate(&pattern.category, 14),
            pattern.confidence_boost,
            pattern.use_count
        );
    }

    Ok(())
}

/// Arguments of `rules check add`
#[derive(Debug, Clone, Default)]
pub struct CheckPatternArgs {
    pub name: String,
    pub category: String,
    pub amount: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub amounts: Vec<f64>,
    pub days: Option<String>,
    pub boost: f64,
    pub notes: Option<String>,
}

impl CheckPatternArgs {
    fn to_pattern(&self) -> Result<NewCheckPattern> {
        let amount = match (self.amount, self.min, self.max, self.amounts.is_empty()) {
            (Some(amount), None, None, true) => CheckAmount::Exact { amount },
            (None, Some(min), Some(max), true) => CheckAmount::Range { min, max },
            (None, None, None, false) => CheckAmount::List {
                amounts: self.amounts.clone(),
            },
            _ => bail!("Give exactly one of --amount, --min/--max or --amounts"),
        };
        let day_range = self.days.as_deref().map(parse_days).transpose()?;

        Ok(NewCheckPattern {
            name: self.name.clone(),
            amount,
            day_range,
            category: self.category.clone(),
            confidence_boost: self.boost,
            notes: self.notes.clone(),
        })
    }
}

pub fn cmd_check_add(db: &Database, args: &CheckPatternArgs) -> Result<()> {
    require_category(db, &args.category)?;
    let pattern = args.to_pattern()?;
    let id = db
        .create_check_pattern(&pattern)
        .context("Failed to add check pattern")?;
    println!(
        "✅ Check pattern {} '{}': {} → {}",
        id,
        pattern.name,
        describe_check_amount(&pattern.amount),
        pattern.category
    );
    Ok(())
}

pub fn cmd_check_deactivate(db: &Database, id: i64) -> Result<()> {
    db.set_check_pattern_state(id, RuleState::Inactive)
        .with_context(|| format!("Failed to deactivate check pattern {}", id))?;
    println!("✅ Deactivated check pattern {}", id);
    Ok(())
}

// ========== Pattern rules ==========

pub fn cmd_pattern_list(db: &Database, all: bool) -> Result<()> {
    let rules = db
        .list_pattern_rules(all)
        .context("Failed to list pattern rules")?;

    if rules.is_empty() {
        println!("No pattern rules. Add one with 'tally rules pattern add'.");
        return Ok(());
    }

    println!(
        "{:<5} {:>4} {:<18} {:<22} {:<14} {:<9} {:<14} {:>5}",
        "ID", "PRI", "NAME", "MERCHANT", "AMOUNT", "DIRECTION", "CATEGORY", "CONF"
    );
    println!("{}", "-".repeat(98));
    for rule in rules {
        let merchant = match &rule.merchant {
            None => "any".to_string(),
            Some(MerchantMatch::Exact(m)) => m.clone(),
            Some(MerchantMatch::Regex(r)) => format!("/{}/", r),
        };
        let name = if rule.state.is_active() {
            rule.name
        } else {
            format!("{} (off)", rule.name)
        };
        println!(
            "{:<5} {:>4} {:<18} {:<22} {:<14} {:<9} {:<14} {:>5.2}",
            rule.id,
            rule.priority,
            truncate(&name, 18),
            truncate(&merchant, 22),
            describe_amount_condition(&rule.amount),
            rule.direction.map(|d| d.as_str()).unwrap_or("any"),
            truncate(&rule.category, 14),
            rule.confidence
        );
    }

    Ok(())
}

/// Arguments of `rules pattern add`
#[derive(Debug, Clone, Default)]
pub struct PatternRuleArgs {
    pub name: String,
    pub category: String,
    pub merchant: Option<String>,
    pub regex: bool,
    pub amount_op: String,
    pub amount: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub direction: Option<String>,
    pub confidence: f64,
    pub priority: i32,
}

impl PatternRuleArgs {
    fn to_rule(&self) -> Result<NewPatternRule> {
        let amount =
            AmountCondition::from_parts(&self.amount_op.to_lowercase(), self.amount, self.min, self.max)
                .map_err(anyhow::Error::msg)?;
        let direction = self
            .direction
            .as_deref()
            .map(str::parse::<Direction>)
            .transpose()
            .map_err(anyhow::Error::msg)?;
        let merchant = self.merchant.clone().map(|m| {
            if self.regex {
                MerchantMatch::Regex(m)
            } else {
                MerchantMatch::Exact(m)
            }
        });

        Ok(NewPatternRule {
            name: self.name.clone(),
            merchant,
            amount,
            direction,
            category: self.category.clone(),
            confidence: self.confidence,
            priority: self.priority,
        })
    }
}

pub fn cmd_pattern_add(db: &Database, args: &PatternRuleArgs) -> Result<()> {
    require_category(db, &args.category)?;
    let rule = args.to_rule()?;
    let id = db
        .create_pattern_rule(&rule)
        .context("Failed to add pattern rule")?;
    println!(
        "✅ Pattern rule {} '{}' (priority {}) → {}",
        id, rule.name, rule.priority, rule.category
    );
    Ok(())
}

pub fn cmd_pattern_deactivate(db: &Database, id: i64) -> Result<()> {
    db.set_pattern_rule_state(id, RuleState::Inactive)
        .with_context(|| format!("Failed to deactivate pattern rule {}", id))?;
    println!("✅ Deactivated pattern rule {}", id);
    Ok(())
}

// ========== Helpers ==========

fn require_category(db: &Database, category: &str) -> Result<()> {
    if !db.category_exists(category)? {
        bail!(
            "Category not found: {}. Run 'tally categories' to see the list.",
            category
        );
    }
    Ok(())
}

/// Parse "D" or "D-D" into a day-of-month window
fn parse_days(days: &str) -> Result<DayRange> {
    let (min, max) = match days.split_once('-') {
        Some((min, max)) => (min.trim(), max.trim()),
        None => (days.trim(), days.trim()),
    };
    let min: u32 = min
        .parse()
        .with_context(|| format!("Invalid day range: {}", days))?;
    let max: u32 = max
        .parse()
        .with_context(|| format!("Invalid day range: {}", days))?;
    DayRange::new(min, max).map_err(anyhow::Error::msg)
}

fn describe_check_amount(amount: &CheckAmount) -> String {
    match amount {
        CheckAmount::Exact { amount } => format!("${:.2}", amount),
        CheckAmount::Range { min, max } => format!("${:.2}-${:.2}", min, max),
        CheckAmount::List { amounts } => amounts
            .iter()
            .map(|a| format!("${:.2}", a))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn describe_amount_condition(condition: &AmountCondition) -> String {
    match *condition {
        AmountCondition::Any => "any".into(),
        AmountCondition::Lt { value } => format!("< {:.2}", value),
        AmountCondition::Le { value } => format!("<= {:.2}", value),
        AmountCondition::Eq { value } => format!("= {:.2}", value),
        AmountCondition::Ge { value } => format!(">= {:.2}", value),
        AmountCondition::Gt { value } => format!("> {:.2}", value),
        AmountCondition::Range { min, max } => format!(
            "{}..{}",
            min.map(|m| format!("{:.2}", m)).unwrap_or_default(),
            max.map(|m| format!("{:.2}", m)).unwrap_or_default()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_days() {
        assert_eq!(parse_days("1-5").unwrap(), DayRange { min: 1, max: 5 });
        assert_eq!(parse_days("15").unwrap(), DayRange { min: 15, max: 15 });
        assert!(parse_days("5-1").is_err());
        assert!(parse_days("first").is_err());
    }

    #[test]
    fn test_check_args_need_one_amount_form() {
        let args = CheckPatternArgs {
            name: "Rent".into(),
            category: "Housing".into(),
            amount: Some(1500.0),
            min: Some(1.0),
            max: Some(2.0),
            boost: 0.9,
            ..Default::default()
        };
        assert!(args.to_pattern().is_err());

        let args = CheckPatternArgs {
            amounts: vec![25.0, 40.0],
            ..args
        };
        let args = CheckPatternArgs {
            amount: None,
            min: None,
            max: None,
            ..args
        };
        assert_eq!(
            args.to_pattern().unwrap().amount,
            CheckAmount::List {
                amounts: vec![25.0, 40.0]
            }
        );
    }

    #[test]
    fn test_describe_amount_condition() {
        assert_eq!(
            describe_amount_condition(&AmountCondition::Range {
                min: Some(10.0),
                max: None
            }),
            "10.00.."
        );
        assert_eq!(
            describe_amount_condition(&AmountCondition::Ge { value: 50.0 }),
            ">= 50.00"
        );
    }
}
