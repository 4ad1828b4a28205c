//! Remote table accessor seam.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// One row as returned by the table API.
pub type Row = Value;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to `{table}` failed: {message}")]
    Request { table: String, message: String },
    #[error("row `{id}` not found in `{table}`")]
    NotFound { table: String, id: String },
    #[error("rejected by the data store: {message}")]
    Rejected { message: String },
}

impl SourceError {
    pub fn request(table: &str, err: impl std::fmt::Display) -> Self {
        Self::Request {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    pub fn not_found(table: &str, id: &str) -> Self {
        Self::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Table-level access to the hosted database.
#[async_trait]
pub trait TableSource: Send + Sync {
    async fn select_all(&self, table: &str) -> Result<Vec<Row>, SourceError>;

    async fn select_one(&self, table: &str, id: &str) -> Result<Row, SourceError>;

    /// Insert `row` and return it as stored.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, SourceError>;

    /// Apply `patch` to the row and return it as stored.
    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, SourceError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), SourceError>;
}
