//! Check pattern storage

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{format_datetime, parse_enum, Database};
use crate::error::{Error, Result};
use crate::models::{CheckAmount, CheckPattern, DayRange, NewCheckPattern, RuleState};

const CHECK_COLUMNS: &str =
    "id, name, amount, day_min, day_max, category, confidence_boost, use_count, state, notes";

impl Database {
    pub fn create_check_pattern(&self, pattern: &NewCheckPattern) -> Result<i64> {
        if pattern.name.trim().is_empty() || pattern.category.trim().is_empty() {
            return Err(Error::InvalidData(
                "check pattern needs a name and a category".into(),
            ));
        }
        pattern.amount.validate().map_err(Error::InvalidData)?;
        if !(0.0..=1.0).contains(&pattern.confidence_boost) {
            return Err(Error::InvalidData(format!(
                "confidence boost {} outside [0, 1]",
                pattern.confidence_boost
            )));
        }
        if let Some(range) = pattern.day_range {
            DayRange::new(range.min, range.max).map_err(Error::InvalidData)?;
        }

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO check_patterns (name, amount, day_min, day_max, category, confidence_boost, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                pattern.name.trim(),
                serde_json::to_string(&pattern.amount)?,
                pattern.day_range.map(|r| r.min),
                pattern.day_range.map(|r| r.max),
                pattern.category,
                pattern.confidence_boost,
                pattern.notes,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_check_pattern(&self, id: i64) -> Result<Option<CheckPattern>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM check_patterns WHERE id = ?", CHECK_COLUMNS);
        let pattern = conn
            .query_row(&sql, params![id], row_to_check_pattern)
            .optional()?;
        Ok(pattern)
    }

    /// List check patterns by id; inactive ones only when asked
    pub fn list_check_patterns(&self, include_inactive: bool) -> Result<Vec<CheckPattern>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM check_patterns WHERE (?1 OR state = 'active') ORDER BY id",
            CHECK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![include_inactive], row_to_check_pattern)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Soft delete: patterns are never removed
    pub fn set_check_pattern_state(&self, id: i64, state: RuleState) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE check_patterns SET state = ?, updated_at = ? WHERE id = ?",
            params![state.as_str(), format_datetime(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("check pattern {}", id)));
        }
        Ok(())
    }

    pub fn increment_check_pattern_use(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE check_patterns SET use_count = use_count + 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }
}

fn row_to_check_pattern(row: &rusqlite::Row) -> rusqlite::Result<CheckPattern> {
    let amount_json: String = row.get(2)?;
    let amount: CheckAmount = serde_json::from_str(&amount_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let day_min: Option<u32> = row.get(3)?;
    let day_max: Option<u32> = row.get(4)?;
    let state: String = row.get(8)?;
    Ok(CheckPattern {
        id: row.get(0)?,
        name: row.get(1)?,
        amount,
        day_range: match (day_min, day_max) {
            (Some(min), Some(max)) => Some(DayRange { min, max }),
            _ => None,
        },
        category: row.get(5)?,
        confidence_boost: row.get(6)?,
        use_count: row.get(7)?,
        state: parse_enum::<RuleState>(8, &state)?,
        notes: row.get(9)?,
    })
}
