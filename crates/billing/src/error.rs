//! Billing error types

use planhub_shared::PlanHubError;
use thiserror::Error;

use crate::lifecycle::PlanChangeDirection;

/// Errors surfaced by plan and subscription operations
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Admin access required")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("New plan must be {} priced than the current plan for {direction} ({new_price_cents} vs {current_price_cents} cents)", .direction.required_comparison())]
    InvalidPriceDirection {
        direction: PlanChangeDirection,
        current_price_cents: i64,
        new_price_cents: i64,
    },

    #[error("User already has an active subscription")]
    AlreadySubscribed,

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable code for callers that map errors to their own surface
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::NotAuthenticated => "NOT_AUTHENTICATED",
            BillingError::Forbidden => "FORBIDDEN",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::InvalidState(_) => "INVALID_STATE",
            BillingError::InvalidPriceDirection { .. } => "INVALID_PRICE_DIRECTION",
            BillingError::AlreadySubscribed => "ALREADY_SUBSCRIBED",
            BillingError::AlreadyExists(_) => "ALREADY_EXISTS",
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Storage hiccups worth retrying for idempotent writes
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::Database(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        // constraint violations fail the same way on every attempt
        if let sqlx::Error::Database(db_err) = &err {
            if !matches!(db_err.kind(), sqlx::error::ErrorKind::Other) {
                return BillingError::Validation(format!(
                    "Constraint violated: {}",
                    db_err.message()
                ));
            }
        }
        BillingError::Database(err.to_string())
    }
}

impl From<PlanHubError> for BillingError {
    fn from(err: PlanHubError) -> Self {
        match err {
            PlanHubError::NotFound(msg) => BillingError::NotFound(msg),
            PlanHubError::Validation(msg) => BillingError::Validation(msg),
            PlanHubError::Database(msg) => BillingError::Database(msg),
            PlanHubError::Internal(msg) => BillingError::Internal(msg),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_direction_message_names_comparison() {
        let err = BillingError::InvalidPriceDirection {
            direction: PlanChangeDirection::Upgrade,
            current_price_cents: 6_000,
            new_price_cents: 4_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("higher"), "got: {}", msg);
        assert!(msg.contains("upgrade"), "got: {}", msg);
        assert_eq!(err.code(), "INVALID_PRICE_DIRECTION");
    }

    #[test]
    fn test_shared_error_conversion() {
        let err: BillingError = PlanHubError::Validation("bad status".to_string()).into();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_only_database_errors_are_transient() {
        assert!(BillingError::Database("timeout".to_string()).is_transient());
        assert!(!BillingError::AlreadySubscribed.is_transient());
        assert!(!BillingError::ConcurrentModification("v1".to_string()).is_transient());
        assert!(!BillingError::Validation("bad".to_string()).is_transient());
        assert!(BillingError::from(sqlx::Error::PoolTimedOut).is_transient());
    }
}
