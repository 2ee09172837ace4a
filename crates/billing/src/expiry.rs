//! End-of-period processing
//!
//! Finds active subscriptions whose period has run out. Auto-renewing ones
//! roll into the next cycle and the rest become expired. Runs as the system
//! actor, usually from the worker's schedule.

use std::sync::Arc;

use planhub_shared::{NotificationType, Subscription};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::events::{action, entity, notification, AuditEventBuilder, SideEffects};
use crate::lifecycle;
use crate::store::{PlanRepository, SubscriptionRepository};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub examined: usize,
    pub renewed: usize,
    pub expired: usize,
    /// Rows changed by someone else mid-sweep or that failed to write
    pub failed: usize,
}

#[derive(Clone)]
pub struct ExpiryService {
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    effects: SideEffects,
}

enum Outcome {
    Renewed,
    Expired,
}

impl ExpiryService {
    pub fn new(
        plans: Arc<dyn PlanRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        effects: SideEffects,
    ) -> Self {
        Self {
            plans,
            subscriptions,
            effects,
        }
    }

    /// Process every subscription due at `as_of`
    ///
    /// A failure on one subscription is logged and counted; the sweep carries on.
    pub async fn expire_due(&self, as_of: OffsetDateTime) -> BillingResult<SweepSummary> {
        let due = self.subscriptions.list_due(as_of).await?;
        let mut summary = SweepSummary {
            examined: due.len(),
            ..Default::default()
        };

        for subscription in due {
            match self.process(&subscription, as_of).await {
                Ok(Outcome::Renewed) => summary.renewed += 1,
                Ok(Outcome::Expired) => summary.expired += 1,
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        user_id = %subscription.user_id,
                        error = %e,
                        "Failed to process subscription during expiry sweep"
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.examined > 0 {
            tracing::info!(
                examined = summary.examined,
                renewed = summary.renewed,
                expired = summary.expired,
                failed = summary.failed,
                "Expiry sweep finished"
            );
        }

        Ok(summary)
    }

    async fn process(
        &self,
        subscription: &Subscription,
        as_of: OffsetDateTime,
    ) -> BillingResult<Outcome> {
        // an auto-renewing subscription on a plan that is no longer offered lapses
        let plan_available = self
            .plans
            .get_plan(subscription.plan_id)
            .await?
            .is_some_and(|p| p.is_active);

        if subscription.auto_renew && plan_available {
            let rolled = lifecycle::roll_forward(subscription, as_of)?;
            let stored = self.subscriptions.update_subscription(&rolled).await?;

            self.effects
                .emit(
                    AuditEventBuilder::new(action::AUTO_RENEW, entity::SUBSCRIPTION, stored.id)
                        .details("Renewed subscription automatically"),
                    Some(notification(
                        stored.user_id,
                        "Subscription Renewed",
                        "Your subscription has been renewed for another month",
                        NotificationType::Renewal,
                    )),
                )
                .await;
            return Ok(Outcome::Renewed);
        }

        let expired = lifecycle::expire(subscription, as_of)?;
        let stored = self.subscriptions.update_subscription(&expired).await?;

        self.effects
            .emit(
                AuditEventBuilder::new(action::EXPIRE_SUBSCRIPTION, entity::SUBSCRIPTION, stored.id)
                    .details("Subscription expired at end of period"),
                Some(notification(
                    stored.user_id,
                    "Subscription Expired",
                    "Your subscription has expired",
                    NotificationType::Renewal,
                )),
            )
            .await;
        Ok(Outcome::Expired)
    }
}
