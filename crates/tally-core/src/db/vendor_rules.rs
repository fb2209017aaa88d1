//! Vendor rule storage and the trust ladder for learned rules

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{format_datetime, parse_datetime, parse_enum, Database};
use crate::error::{Error, Result};
use crate::models::{VendorRule, VendorRuleSource};

const VENDOR_COLUMNS: &str =
    "id, merchant, is_regex, category, source, use_count, created_at, last_updated";

impl Database {
    /// Create or take over a rule as `manual`
    ///
    /// An existing learned rule for the same merchant is replaced.
    pub fn add_vendor_rule(&self, merchant: &str, category: &str, is_regex: bool) -> Result<VendorRule> {
        let merchant = validate_merchant(merchant, is_regex)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO vendor_rules (merchant, is_regex, category, source, use_count, created_at, last_updated)
            VALUES (?1, ?2, ?3, 'manual', 0, ?4, ?4)
            ON CONFLICT(merchant) DO UPDATE SET
                is_regex = excluded.is_regex,
                category = excluded.category,
                source = 'manual',
                last_updated = excluded.last_updated
            "#,
            params![merchant, is_regex, category, format_datetime(&Utc::now())],
        )?;
        find_by_merchant(&conn, &merchant)?
            .ok_or_else(|| Error::NotFound(format!("vendor rule '{}'", merchant)))
    }

    /// Record a classification outcome for a merchant
    ///
    /// - no rule: a new exact rule with `source` is created
    /// - `manual` rule: left untouched
    /// - same category: use count goes up; `AutoConfirmed` promotes an `auto` rule
    /// - different category: only a user decision (`AutoConfirmed`) replaces an
    ///   existing rule; an `auto` suggestion may replace another `auto` rule
    pub fn learn_vendor_rule(
        &self,
        merchant: &str,
        category: &str,
        source: VendorRuleSource,
    ) -> Result<VendorRule> {
        let merchant = validate_merchant(merchant, false)?;
        let mut conn = self.conn()?;
        let db_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = format_datetime(&Utc::now());

        match find_by_merchant(&db_tx, &merchant)? {
            None => {
                db_tx.execute(
                    r#"
                    INSERT INTO vendor_rules (merchant, is_regex, category, source, use_count, created_at, last_updated)
                    VALUES (?1, 0, ?2, ?3, 1, ?4, ?4)
                    "#,
                    params![merchant, category, source.as_str(), now],
                )?;
                debug!(merchant = %merchant, category, source = %source, "Learned vendor rule");
            }
            Some(rule) if rule.source == VendorRuleSource::Manual => {
                debug!(merchant = %merchant, "Manual vendor rule kept");
            }
            Some(rule) if rule.category.eq_ignore_ascii_case(category) => {
                let promoted = if source == VendorRuleSource::AutoConfirmed {
                    VendorRuleSource::AutoConfirmed
                } else {
                    rule.source
                };
                db_tx.execute(
                    "UPDATE vendor_rules SET use_count = use_count + 1, source = ?, last_updated = ?
                     WHERE id = ?",
                    params![promoted.as_str(), now, rule.id],
                )?;
            }
            Some(rule)
                if source == VendorRuleSource::AutoConfirmed
                    || rule.source == VendorRuleSource::Auto =>
            {
                db_tx.execute(
                    "UPDATE vendor_rules SET category = ?, source = ?, use_count = 1, last_updated = ?
                     WHERE id = ?",
                    params![category, source.as_str(), now, rule.id],
                )?;
                debug!(
                    merchant = %merchant,
                    from = %rule.category,
                    to = category,
                    "Vendor rule re-pointed"
                );
            }
            Some(_) => {
                debug!(merchant = %merchant, "Confirmed vendor rule kept over AI suggestion");
            }
        }

        let rule = find_by_merchant(&db_tx, &merchant)?
            .ok_or_else(|| Error::NotFound(format!("vendor rule '{}'", merchant)))?;
        db_tx.commit()?;
        Ok(rule)
    }

    pub fn get_vendor_rule(&self, merchant: &str) -> Result<Option<VendorRule>> {
        let conn = self.conn()?;
        find_by_merchant(&conn, merchant.trim())
    }

    pub fn get_vendor_rule_by_id(&self, id: i64) -> Result<Option<VendorRule>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM vendor_rules WHERE id = ?", VENDOR_COLUMNS);
        let rule = conn
            .query_row(&sql, params![id], row_to_vendor_rule)
            .optional()?;
        Ok(rule)
    }

    /// All vendor rules in stored id order
    pub fn list_vendor_rules(&self) -> Result<Vec<VendorRule>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM vendor_rules ORDER BY id", VENDOR_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_vendor_rule)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn increment_vendor_rule_use(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE vendor_rules SET use_count = use_count + 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    /// User edit of a rule's category; an `auto` rule becomes `auto_confirmed`
    pub fn update_vendor_rule_category(&self, id: i64, category: &str) -> Result<VendorRule> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE vendor_rules SET
                category = ?,
                source = CASE source WHEN 'auto' THEN 'auto_confirmed' ELSE source END,
                last_updated = ?
            WHERE id = ?
            "#,
            params![category, format_datetime(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("vendor rule {}", id)));
        }
        drop(conn);
        self.get_vendor_rule_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("vendor rule {}", id)))
    }

    pub fn delete_vendor_rule(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM vendor_rules WHERE id = ?", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("vendor rule {}", id)));
        }
        Ok(())
    }
}

/// Insert a rule unless one already exists for the merchant; returns whether it was new
pub(crate) fn insert_vendor_rule_if_absent_with(
    conn: &Connection,
    merchant: &str,
    category: &str,
    is_regex: bool,
    source: VendorRuleSource,
) -> Result<bool> {
    let merchant = validate_merchant(merchant, is_regex)?;
    let changed = conn.execute(
        r#"
        INSERT OR IGNORE INTO vendor_rules (merchant, is_regex, category, source, use_count, created_at, last_updated)
        VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
        "#,
        params![
            merchant,
            is_regex,
            category,
            source.as_str(),
            format_datetime(&Utc::now())
        ],
    )?;
    Ok(changed > 0)
}

fn validate_merchant(merchant: &str, is_regex: bool) -> Result<String> {
    let merchant = merchant.trim();
    if merchant.is_empty() {
        return Err(Error::InvalidData("vendor rule merchant must not be empty".into()));
    }
    if is_regex {
        regex::Regex::new(merchant)?;
    }
    Ok(merchant.to_string())
}

fn find_by_merchant(conn: &Connection, merchant: &str) -> Result<Option<VendorRule>> {
    let sql = format!(
        "SELECT {} FROM vendor_rules WHERE merchant = ? COLLATE NOCASE",
        VENDOR_COLUMNS
    );
    let rule = conn
        .query_row(&sql, params![merchant], row_to_vendor_rule)
        .optional()?;
    Ok(rule)
}

fn row_to_vendor_rule(row: &rusqlite::Row) -> rusqlite::Result<VendorRule> {
    let source: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let last_updated: String = row.get(7)?;
    Ok(VendorRule {
        id: row.get(0)?,
        merchant: row.get(1)?,
        is_regex: row.get(2)?,
        category: row.get(3)?,
        source: parse_enum::<VendorRuleSource>(4, &source)?,
        use_count: row.get(5)?,
        created_at: parse_datetime(&created_at),
        last_updated: parse_datetime(&last_updated),
    })
}
