//! Error types for Tally

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Restore failed before the live store was touched
    #[error("Restore failed, no data was modified: {0}")]
    Restore(String),

    #[error("Store is still in use: {0}")]
    StoreInUse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Cooperative stop requested through a `CancelToken`
    #[error("Operation canceled")]
    Canceled,

    /// A run stopped on a transaction; `date` is the cursor to resume from
    #[error("Failed while processing transaction {transaction_id} ({date}): {source}")]
    TransactionFailed {
        transaction_id: String,
        date: NaiveDate,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether this is a cancellation rather than a failure
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Whether retrying the operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Classifier(_))
    }

    pub(crate) fn in_transaction(self, transaction_id: &str, date: NaiveDate) -> Self {
        match self {
            Error::Canceled | Error::TransactionFailed { .. } => self,
            other => Error::TransactionFailed {
                transaction_id: transaction_id.to_string(),
                date,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_is_not_wrapped() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let err = Error::Canceled.in_transaction("tx-1", date);
        assert!(err.is_canceled());
    }

    #[test]
    fn test_transaction_failed_message() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let err = Error::InvalidData("boom".into()).in_transaction("tx-1", date);
        let msg = err.to_string();
        assert!(msg.contains("tx-1"));
        assert!(msg.contains("2024-03-01"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_restore_message_states_no_modification() {
        let err = Error::Restore("checksum mismatch".into());
        assert!(err.to_string().contains("no data was modified"));
    }
}
