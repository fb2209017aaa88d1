//! Pattern rule storage

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{format_datetime, parse_enum, Database};
use crate::error::{Error, Result};
use crate::models::{AmountCondition, MerchantMatch, NewPatternRule, PatternRule, RuleState};

const PATTERN_COLUMNS: &str = "id, name, merchant_kind, merchant_pattern, amount_op, amount_value, \
     amount_min, amount_max, direction, category, confidence, priority, state, use_count";

impl Database {
    pub fn create_pattern_rule(&self, rule: &NewPatternRule) -> Result<i64> {
        let conn = self.conn()?;
        insert_pattern_rule_with(&conn, rule)
    }

    pub fn get_pattern_rule(&self, id: i64) -> Result<Option<PatternRule>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM pattern_rules WHERE id = ?", PATTERN_COLUMNS);
        let rule = conn
            .query_row(&sql, params![id], row_to_pattern_rule)
            .optional()?;
        Ok(rule)
    }

    /// Pattern rules, highest priority first
    pub fn list_pattern_rules(&self, include_inactive: bool) -> Result<Vec<PatternRule>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM pattern_rules WHERE (?1 OR state = 'active')
             ORDER BY priority DESC, id",
            PATTERN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![include_inactive], row_to_pattern_rule)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_pattern_rule_state(&self, id: i64, state: RuleState) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE pattern_rules SET state = ?, updated_at = ? WHERE id = ?",
            params![state.as_str(), format_datetime(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("pattern rule {}", id)));
        }
        Ok(())
    }

    pub fn increment_pattern_rule_use(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pattern_rules SET use_count = use_count + 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }
}

/// Validate and insert; used directly by fix application inside its transaction
pub(crate) fn insert_pattern_rule_with(conn: &Connection, rule: &NewPatternRule) -> Result<i64> {
    rule.validate().map_err(Error::InvalidData)?;
    let (value, min, max) = rule.amount.parts();
    conn.execute(
        r#"
        INSERT INTO pattern_rules
            (name, merchant_kind, merchant_pattern, amount_op, amount_value, amount_min, amount_max,
             direction, category, confidence, priority)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            rule.name.trim(),
            rule.merchant.as_ref().map(|m| if m.is_regex() { "regex" } else { "exact" }),
            rule.merchant.as_ref().map(|m| m.pattern()),
            rule.amount.kind(),
            value,
            min,
            max,
            rule.direction.map(|d| d.as_str()),
            rule.category,
            rule.confidence,
            rule.priority,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Find an active rule with the same name and category (fix idempotency)
pub(crate) fn find_pattern_rule_with(
    conn: &Connection,
    name: &str,
    category: &str,
) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM pattern_rules WHERE name = ? AND category = ? AND state = 'active'",
            params![name.trim(), category],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn row_to_pattern_rule(row: &rusqlite::Row) -> rusqlite::Result<PatternRule> {
    let merchant_kind: Option<String> = row.get(2)?;
    let merchant_pattern: Option<String> = row.get(3)?;
    let amount_op: String = row.get(4)?;
    let direction: Option<String> = row.get(8)?;
    let state: String = row.get(12)?;

    let merchant = match (merchant_kind.as_deref(), merchant_pattern) {
        (Some("regex"), Some(p)) => Some(MerchantMatch::Regex(p)),
        (Some(_), Some(p)) => Some(MerchantMatch::Exact(p)),
        _ => None,
    };
    let amount = AmountCondition::from_parts(&amount_op, row.get(5)?, row.get(6)?, row.get(7)?)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(Error::InvalidData(e)),
            )
        })?;

    Ok(PatternRule {
        id: row.get(0)?,
        name: row.get(1)?,
        merchant,
        amount,
        direction: direction.map(|d| parse_enum(8, &d)).transpose()?,
        category: row.get(9)?,
        confidence: row.get(10)?,
        priority: row.get(11)?,
        state: parse_enum::<RuleState>(12, &state)?,
        use_count: row.get(13)?,
    })
}
