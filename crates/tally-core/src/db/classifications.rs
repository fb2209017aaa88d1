//! Classification rows (one per transaction)

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::transactions::TRANSACTION_COLUMNS;
use super::{format_datetime, parse_datetime, parse_enum, Database};
use crate::error::Result;
use crate::models::{Classification, ClassificationStatus, Transaction};

/// A transaction together with its current classification, if any
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedTransaction {
    pub transaction: Transaction,
    pub classification: Option<Classification>,
}

impl ClassifiedTransaction {
    /// Category, ignoring `unclassified` rows
    pub fn category(&self) -> Option<&str> {
        self.classification
            .as_ref()
            .filter(|c| c.status != ClassificationStatus::Unclassified)
            .map(|c| c.category.as_str())
    }
}

impl Database {
    /// Insert or replace the classification for a transaction
    pub fn upsert_classification(&self, classification: &Classification) -> Result<()> {
        let conn = self.conn()?;
        upsert_classification_with(&conn, classification)
    }

    pub fn get_classification(&self, transaction_id: &str) -> Result<Option<Classification>> {
        let conn = self.conn()?;
        let classification = conn
            .query_row(
                "SELECT transaction_id, category, status, confidence, classified_at, notes
                 FROM classifications WHERE transaction_id = ?",
                params![transaction_id],
                row_to_classification,
            )
            .optional()?;
        Ok(classification)
    }

    /// All classification rows ordered by transaction id
    pub fn list_classifications(&self) -> Result<Vec<Classification>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT transaction_id, category, status, confidence, classified_at, notes
             FROM classifications ORDER BY transaction_id",
        )?;
        let rows = stmt.query_map([], row_to_classification)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_classifications(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM classifications", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Transactions in a date range joined with their classification
    pub fn list_classified_transactions(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<ClassifiedTransaction>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {}, c.transaction_id, c.category, c.status, c.confidence, c.classified_at, c.notes
             FROM transactions t
             LEFT JOIN classifications c ON c.transaction_id = t.id
             WHERE (?1 IS NULL OR t.date >= ?1) AND (?2 IS NULL OR t.date <= ?2)
             ORDER BY t.date, t.id",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![start.map(|d| d.to_string()), end.map(|d| d.to_string())],
            |row| {
                let transaction = Self::row_to_transaction(row)?;
                let classified: Option<String> = row.get(9)?;
                let classification = match classified {
                    Some(_) => Some(classification_at(row, 9)?),
                    None => None,
                };
                Ok(ClassifiedTransaction {
                    transaction,
                    classification,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

pub(crate) fn upsert_classification_with(
    conn: &Connection,
    classification: &Classification,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO classifications (transaction_id, category, status, confidence, classified_at, notes)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(transaction_id) DO UPDATE SET
            category = excluded.category,
            status = excluded.status,
            confidence = excluded.confidence,
            classified_at = excluded.classified_at,
            notes = excluded.notes
        "#,
        params![
            classification.transaction_id,
            classification.category,
            classification.status.as_str(),
            classification.confidence,
            format_datetime(&classification.classified_at),
            classification.notes,
        ],
    )?;
    Ok(())
}

fn row_to_classification(row: &rusqlite::Row) -> rusqlite::Result<Classification> {
    classification_at(row, 0)
}

fn classification_at(row: &rusqlite::Row, base: usize) -> rusqlite::Result<Classification> {
    let status: String = row.get(base + 2)?;
    let classified_at: String = row.get(base + 4)?;
    Ok(Classification {
        transaction_id: row.get(base)?,
        category: row.get(base + 1)?,
        status: parse_enum::<ClassificationStatus>(base + 2, &status)?,
        confidence: row.get(base + 3)?,
        classified_at: parse_datetime(&classified_at),
        notes: row.get(base + 5)?,
    })
}
