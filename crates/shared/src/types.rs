//! Common types used across PlanHub

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PlanHubError;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_wrapper!(
    /// User ID wrapper
    UserId
);
id_wrapper!(
    /// Plan ID wrapper
    PlanId
);
id_wrapper!(
    /// Subscription ID wrapper
    SubscriptionId
);

// =============================================================================
// Enums
// =============================================================================

/// Product line a plan belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum ProductType {
    #[serde(rename = "Fibernet")]
    #[sqlx(rename = "Fibernet")]
    Fibernet,
    #[serde(rename = "Broadband Copper")]
    #[sqlx(rename = "Broadband Copper")]
    BroadbandCopper,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fibernet => "Fibernet",
            Self::BroadbandCopper => "Broadband Copper",
        }
    }
}

impl Default for ProductType {
    fn default() -> Self {
        Self::Fibernet
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProductType {
    type Err = PlanHubError;

    /// Accepts the display names as well as the slug forms used by older clients
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', '_'], " ").as_str() {
            "fibernet" => Ok(Self::Fibernet),
            "broadband copper" | "copper" => Ok(Self::BroadbandCopper),
            _ => Err(PlanHubError::Validation(format!(
                "Invalid product type: {}",
                s
            ))),
        }
    }
}

/// Subscription lifecycle status
///
/// `Pending` is accepted from storage but no lifecycle operation produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Whether a renew can bring this subscription back to `Active`
    pub fn is_renewable(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = PlanHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            // both spellings show up in exported data
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(PlanHubError::Validation(format!(
                "Invalid subscription status: {}",
                s
            ))),
        }
    }
}

/// Role of a user profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl Default for UserRole {
    fn default() -> Self {
        Self::User
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserRole {
    type Err = PlanHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(PlanHubError::Validation(format!("Invalid user role: {}", s))),
        }
    }
}

/// Category of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Renewal,
    Upgrade,
    Offer,
    Usage,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Renewal => "renewal",
            Self::Upgrade => "upgrade",
            Self::Offer => "offer",
            Self::Usage => "usage",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who performed an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    /// End user acting on their own subscription
    User,
    /// Administrator
    Admin,
    /// Scheduled worker
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Admin => write!(f, "admin"),
            Self::System => write!(f, "system"),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Purchasable service tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub description: String,
    pub product_type: ProductType,
    /// Monthly price in cents
    pub price_cents: i64,
    /// Data quota in GB
    pub data_quota_gb: i64,
    pub features: Vec<String>,
    pub is_active: bool,
    pub created_by: Option<UserId>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Plan {
    /// Monthly price as a currency amount
    pub fn price(&self) -> f64 {
        self.price_cents as f64 / 100.0
    }
}

/// A user's time-bounded relationship to one plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub start_date: OffsetDateTime,
    /// Only `None` while pending
    pub end_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    /// Cumulative data used in GB
    pub data_used_gb: f64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Optimistic concurrency counter, bumped by every write
    pub version: i64,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// Subscription joined with its plan (plan may have been removed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionWithPlan {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub plan: Option<Plan>,
}

/// User profile with role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub user_id: UserId,
    pub role: UserRole,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub created_at: OffsetDateTime,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Append-only audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor_id: Option<UserId>,
    pub actor_type: ActorType,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: String,
    pub created_at: OffsetDateTime,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub is_read: bool,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_type_parsing() {
        assert_eq!(
            "Fibernet".parse::<ProductType>().unwrap(),
            ProductType::Fibernet
        );
        assert_eq!(
            "broadband-copper".parse::<ProductType>().unwrap(),
            ProductType::BroadbandCopper
        );
        assert_eq!(
            "Broadband Copper".parse::<ProductType>().unwrap(),
            ProductType::BroadbandCopper
        );
        assert!("5G".parse::<ProductType>().is_err());
    }

    #[test]
    fn test_product_type_serde_uses_display_names() {
        let json = serde_json::to_string(&ProductType::BroadbandCopper).unwrap();
        assert_eq!(json, "\"Broadband Copper\"");
        let parsed: ProductType = serde_json::from_str("\"Fibernet\"").unwrap();
        assert_eq!(parsed, ProductType::Fibernet);
    }

    #[test]
    fn test_subscription_status_round_trip() {
        for status in [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Active,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(status.to_string().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert_eq!(
            "canceled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Cancelled
        );
    }

    #[test]
    fn test_renewable_statuses() {
        assert!(SubscriptionStatus::Cancelled.is_renewable());
        assert!(SubscriptionStatus::Expired.is_renewable());
        assert!(!SubscriptionStatus::Active.is_renewable());
        assert!(!SubscriptionStatus::Pending.is_renewable());
    }

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SubscriptionStatus::default(), SubscriptionStatus::Pending);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(UserId::new(), UserId::new());
        let raw = Uuid::new_v4();
        assert_eq!(PlanId::from(raw).to_string(), raw.to_string());
    }
}
