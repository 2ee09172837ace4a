//! Audit and notification side effects
//!
//! Every successful plan or subscription mutation appends one audit record
//! and, for subscription changes, one notification for the affected user.
//! Both are written after the mutation has been stored. A failing sink is
//! retried with exponential backoff while its error is transient, then
//! logged; it never fails the operation that triggered it.
//!
//! Record ids are fixed before the first attempt so a retried insert that
//! already landed is a no-op in the sink.

use std::sync::Arc;
use std::time::Duration;

use planhub_shared::{
    ActorType, AuditRecord, Notification, NotificationType, UserId, UserProfile,
};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::BillingError;
use crate::store::{AuditSink, NotificationSink};

/// Audit action tags
pub mod action {
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const CHANGE_PLAN: &str = "CHANGE_PLAN";
    pub const UPGRADE_SUBSCRIPTION: &str = "UPGRADE_SUBSCRIPTION";
    pub const DOWNGRADE_SUBSCRIPTION: &str = "DOWNGRADE_SUBSCRIPTION";
    pub const CANCEL_SUBSCRIPTION: &str = "CANCEL_SUBSCRIPTION";
    pub const RENEW_SUBSCRIPTION: &str = "RENEW_SUBSCRIPTION";
    pub const AUTO_RENEW: &str = "AUTO_RENEW";
    pub const EXPIRE_SUBSCRIPTION: &str = "EXPIRE_SUBSCRIPTION";
    pub const CREATE_PLAN: &str = "CREATE_PLAN";
    pub const UPDATE_PLAN: &str = "UPDATE_PLAN";
    pub const DELETE_PLAN: &str = "DELETE_PLAN";
    pub const DEACTIVATE_PLAN: &str = "DEACTIVATE_PLAN";
    pub const CREATE_PROFILE: &str = "CREATE_PROFILE";
}

/// Audited entity kinds
pub mod entity {
    pub const SUBSCRIPTION: &str = "subscription";
    pub const PLAN: &str = "plan";
    pub const USER_PROFILE: &str = "userProfile";
}

const RETRY_BASE_DELAY_MS: u64 = 50;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRIES: usize = 3;

/// Who is acting, as recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<UserId>,
    pub actor_type: ActorType,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: None,
            actor_type: ActorType::System,
        }
    }
}

impl From<&UserProfile> for Actor {
    fn from(profile: &UserProfile) -> Self {
        Self {
            id: Some(profile.user_id),
            actor_type: if profile.is_admin() {
                ActorType::Admin
            } else {
                ActorType::User
            },
        }
    }
}

/// Builder for audit records
pub struct AuditEventBuilder {
    action: &'static str,
    entity_type: &'static str,
    entity_id: String,
    actor: Actor,
    details: String,
}

impl AuditEventBuilder {
    pub fn new(action: &'static str, entity_type: &'static str, entity_id: impl ToString) -> Self {
        Self {
            action,
            entity_type,
            entity_id: entity_id.to_string(),
            actor: Actor::system(),
            details: String::new(),
        }
    }

    pub fn actor(mut self, actor: impl Into<Actor>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn build(self) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            actor_id: self.actor.id,
            actor_type: self.actor.actor_type,
            action: self.action.to_string(),
            entity_type: self.entity_type.to_string(),
            entity_id: self.entity_id,
            details: self.details,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Build an unread notification for `user_id`
pub fn notification(
    user_id: UserId,
    title: impl Into<String>,
    message: impl Into<String>,
    notification_type: NotificationType,
) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        user_id,
        title: title.into(),
        message: message.into(),
        notification_type,
        is_read: false,
        created_at: OffsetDateTime::now_utc(),
    }
}

/// Best-effort writer for audit records and notifications
#[derive(Clone)]
pub struct SideEffects {
    audit: Arc<dyn AuditSink>,
    notifications: Arc<dyn NotificationSink>,
}

impl SideEffects {
    pub fn new(audit: Arc<dyn AuditSink>, notifications: Arc<dyn NotificationSink>) -> Self {
        Self {
            audit,
            notifications,
        }
    }

    /// Write the audit record, then the notification if there is one
    pub async fn emit(&self, audit: AuditEventBuilder, notification: Option<Notification>) {
        let record = audit.build();

        let appended = RetryIf::spawn(
            retry_strategy(),
            || self.audit.append_audit(&record),
            BillingError::is_transient,
        )
        .await;
        if let Err(e) = appended {
            tracing::warn!(
                audit_id = %record.id,
                action = %record.action,
                entity_id = %record.entity_id,
                error = %e,
                "Failed to write audit record"
            );
        }

        if let Some(notification) = notification {
            self.notify(notification).await;
        }
    }

    /// Write a notification that has no audit record of its own
    pub async fn notify(&self, notification: Notification) {
        let sent = RetryIf::spawn(
            retry_strategy(),
            || self.notifications.append_notification(&notification),
            BillingError::is_transient,
        )
        .await;
        if let Err(e) = sent {
            tracing::warn!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                title = %notification.title,
                error = %e,
                "Failed to write notification"
            );
        }
    }
}

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
        .max_delay(RETRY_MAX_DELAY)
        .take(MAX_RETRIES)
        .map(jitter)
}
