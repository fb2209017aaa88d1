//! Transaction storage

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

use super::{parse_date, Database};
use crate::error::{Error, Result};
use crate::models::Transaction;

pub(crate) const TRANSACTION_COLUMNS: &str = "t.id, t.date, t.name, t.merchant_name, t.amount, \
     t.direction, t.account_id, t.check_number, t.provider_category";

impl Database {
    /// Insert a transaction; returns false when the id already exists
    pub fn insert_transaction(&self, tx: &Transaction) -> Result<bool> {
        validate_transaction(tx)?;
        let conn = self.conn()?;
        let inserted = insert_with(&conn, tx)?;
        Ok(inserted)
    }

    /// Insert many transactions atomically; returns how many were new
    pub fn insert_transactions(&self, txs: &[Transaction]) -> Result<usize> {
        for tx in txs {
            validate_transaction(tx)?;
        }
        let mut conn = self.conn()?;
        let db_tx = conn.transaction()?;
        let mut inserted = 0;
        for tx in txs {
            if insert_with(&db_tx, tx)? {
                inserted += 1;
            }
        }
        db_tx.commit()?;
        Ok(inserted)
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM transactions t WHERE t.id = ?", TRANSACTION_COLUMNS);
        let tx = conn
            .query_row(&sql, params![id], Self::row_to_transaction)
            .optional()?;
        Ok(tx)
    }

    /// List transactions in an inclusive date range, ordered by date then id
    pub fn list_transactions(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM transactions t
             WHERE (?1 IS NULL OR t.date >= ?1) AND (?2 IS NULL OR t.date <= ?2)
             ORDER BY t.date, t.id",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![start.map(|d| d.to_string()), end.map(|d| d.to_string())],
            Self::row_to_transaction,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Transactions with no classification row or an `unclassified` one
    pub fn list_unclassified_transactions(
        &self,
        from_date: Option<NaiveDate>,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM transactions t
             LEFT JOIN classifications c ON c.transaction_id = t.id
             WHERE (c.transaction_id IS NULL OR c.status = 'unclassified')
               AND (?1 IS NULL OR t.date >= ?1)
             ORDER BY t.date, t.id",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![from_date.map(|d| d.to_string())],
            Self::row_to_transaction,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Transactions currently classified into `category`
    pub fn list_transactions_by_category(&self, category: &str) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM transactions t
             JOIN classifications c ON c.transaction_id = t.id
             WHERE c.category = ? COLLATE NOCASE AND c.status != 'unclassified'
             ORDER BY t.date, t.id",
            TRANSACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![category], Self::row_to_transaction)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count total transactions
    pub fn count_transactions(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Helper to convert a row to Transaction (column order: [`TRANSACTION_COLUMNS`])
    pub(crate) fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
        let date_str: String = row.get(1)?;
        let direction_str: Option<String> = row.get(5)?;
        Ok(Transaction {
            id: row.get(0)?,
            date: parse_date(&date_str)?,
            name: row.get(2)?,
            merchant_name: row.get(3)?,
            amount: row.get(4)?,
            direction: direction_str.and_then(|s| s.parse().ok()),
            account_id: row.get(6)?,
            check_number: row.get(7)?,
            provider_category: row.get(8)?,
        })
    }
}

fn validate_transaction(tx: &Transaction) -> Result<()> {
    if tx.id.trim().is_empty() {
        return Err(Error::InvalidData("transaction id must not be empty".into()));
    }
    if tx.amount.is_nan() || tx.amount < 0.0 {
        return Err(Error::InvalidData(format!(
            "transaction {} has negative amount {}",
            tx.id, tx.amount
        )));
    }
    Ok(())
}

fn insert_with(conn: &rusqlite::Connection, tx: &Transaction) -> Result<bool> {
    let changed = conn.execute(
        r#"
        INSERT OR IGNORE INTO transactions
            (id, date, name, merchant_name, amount, direction, account_id, check_number, provider_category)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            tx.id,
            tx.date.to_string(),
            tx.name,
            tx.merchant_name,
            tx.amount,
            tx.direction.map(|d| d.as_str()),
            tx.account_id,
            tx.check_number,
            tx.provider_category,
        ],
    )?;
    Ok(changed > 0)
}
