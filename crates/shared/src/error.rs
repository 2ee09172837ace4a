//! Error types for PlanHub

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanHubError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for PlanHubError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PlanHubError::NotFound("row not found".to_string()),
            other => PlanHubError::Database(other.to_string()),
        }
    }
}

pub type PlanHubResult<T> = Result<T, PlanHubError>;
