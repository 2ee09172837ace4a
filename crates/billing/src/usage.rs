//! Data usage metering
//!
//! Usage is reported by the network side against a subscription and reset at
//! the start of every billing cycle. The owner is notified once per cycle,
//! when usage first goes past the plan quota.

use std::sync::Arc;

use planhub_shared::{NotificationType, Subscription, SubscriptionId, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{notification, SideEffects};
use crate::store::{PlanRepository, SubscriptionRepository};
use crate::users::UserService;

/// Usage in the current cycle against the plan quota
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub subscription_id: SubscriptionId,
    pub period_start: OffsetDateTime,
    pub period_end: Option<OffsetDateTime>,
    pub data_used_gb: f64,
    pub data_quota_gb: i64,
    pub percentage_used: f64,
    pub is_over_quota: bool,
}

impl UsageReport {
    fn new(subscription: &Subscription, data_quota_gb: i64) -> Self {
        let percentage_used = if data_quota_gb > 0 {
            subscription.data_used_gb / data_quota_gb as f64 * 100.0
        } else {
            0.0
        };
        Self {
            subscription_id: subscription.id,
            period_start: subscription.start_date,
            period_end: subscription.end_date,
            data_used_gb: subscription.data_used_gb,
            data_quota_gb,
            percentage_used,
            is_over_quota: over_quota(subscription.data_used_gb, data_quota_gb),
        }
    }
}

/// A quota of zero means unmetered
fn over_quota(used_gb: f64, quota_gb: i64) -> bool {
    quota_gb > 0 && used_gb > quota_gb as f64
}

const USAGE_WRITE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct UsageMeter {
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    users: UserService,
    effects: SideEffects,
}

impl UsageMeter {
    pub fn new(
        plans: Arc<dyn PlanRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        users: UserService,
        effects: SideEffects,
    ) -> Self {
        Self {
            plans,
            subscriptions,
            users,
            effects,
        }
    }

    /// Add `data_gb` to the current cycle of an active subscription
    pub async fn record_usage(
        &self,
        subscription_id: SubscriptionId,
        data_gb: f64,
    ) -> BillingResult<UsageReport> {
        if !data_gb.is_finite() || data_gb < 0.0 {
            return Err(BillingError::Validation(format!(
                "Usage must be a non-negative number, got {}",
                data_gb
            )));
        }

        // additive writes are safe to replay on a version conflict
        let mut attempt = 1;
        let (stored, quota, was_over) = loop {
            let subscription = self
                .subscriptions
                .get_subscription(subscription_id)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("Subscription {} not found", subscription_id))
                })?;
            if !subscription.is_active() {
                return Err(BillingError::InvalidState(format!(
                    "Cannot record usage on a subscription that is {}",
                    subscription.status
                )));
            }

            let quota = self
                .plans
                .get_plan(subscription.plan_id)
                .await?
                .map(|p| p.data_quota_gb)
                .unwrap_or(0);

            let was_over = over_quota(subscription.data_used_gb, quota);
            let mut next = subscription;
            next.data_used_gb += data_gb;
            next.updated_at = OffsetDateTime::now_utc();

            match self.subscriptions.update_subscription(&next).await {
                Ok(stored) => break (stored, quota, was_over),
                Err(BillingError::ConcurrentModification(msg)) if attempt < USAGE_WRITE_ATTEMPTS => {
                    tracing::debug!(
                        subscription_id = %subscription_id,
                        attempt,
                        conflict = %msg,
                        "Usage write lost a race, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        tracing::debug!(
            subscription_id = %stored.id,
            added_gb = data_gb,
            total_gb = stored.data_used_gb,
            "Recorded usage"
        );

        let report = UsageReport::new(&stored, quota);
        if report.is_over_quota && !was_over {
            tracing::info!(
                subscription_id = %stored.id,
                user_id = %stored.user_id,
                quota_gb = quota,
                "Data quota exceeded"
            );
            self.effects
                .notify(notification(
                    stored.user_id,
                    "Data Quota Exceeded",
                    format!(
                        "You have used {:.1} GB of your {} GB data quota",
                        stored.data_used_gb, quota
                    ),
                    NotificationType::Usage,
                ))
                .await;
        }

        Ok(report)
    }

    /// Current-cycle usage for the caller's subscription
    pub async fn usage_report(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
    ) -> BillingResult<UsageReport> {
        let profile = self.users.authenticate(caller).await?;
        let subscription = self
            .subscriptions
            .get_subscription(subscription_id)
            .await?
            .filter(|s| s.user_id == profile.user_id || profile.is_admin())
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription_id))
            })?;

        let quota = self
            .plans
            .get_plan(subscription.plan_id)
            .await?
            .map(|p| p.data_quota_gb)
            .unwrap_or(0);

        Ok(UsageReport::new(&subscription, quota))
    }
}
