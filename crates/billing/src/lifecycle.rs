//! Subscription lifecycle transitions
//!
//! Pure functions over [`Subscription`] values. Each transition validates the
//! current status and returns the next state without touching storage, so the
//! services can run the same rules against any repository. Versions are left
//! untouched here; repositories bump them on write.
//!
//! ```text
//!   subscribe        -> active
//!   active   cancel  -> cancelled
//!   active   expire  -> expired
//!   cancelled renew  -> active
//!   expired   renew  -> active
//! ```

use planhub_shared::{Plan, PlanId, Subscription, SubscriptionId, SubscriptionStatus, UserId};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

/// Length of one billing cycle in days
pub const BILLING_CYCLE_DAYS: i64 = 30;

/// Length of one billing cycle
pub fn billing_cycle() -> Duration {
    Duration::days(BILLING_CYCLE_DAYS)
}

/// End of the cycle that starts at `start`
pub fn cycle_end(start: OffsetDateTime) -> OffsetDateTime {
    start + billing_cycle()
}

/// Required price movement when switching plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanChangeDirection {
    Upgrade,
    Downgrade,
}

impl PlanChangeDirection {
    /// Whether moving from `current_price_cents` to `new_price_cents` goes this way
    pub fn permits(&self, current_price_cents: i64, new_price_cents: i64) -> bool {
        match self {
            Self::Upgrade => new_price_cents > current_price_cents,
            Self::Downgrade => new_price_cents < current_price_cents,
        }
    }

    pub fn required_comparison(&self) -> &'static str {
        match self {
            Self::Upgrade => "higher",
            Self::Downgrade => "lower",
        }
    }
}

impl std::fmt::Display for PlanChangeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upgrade => write!(f, "upgrade"),
            Self::Downgrade => write!(f, "downgrade"),
        }
    }
}

/// Start a fresh active subscription on `plan`
///
/// `auto_renew` defaults to `true` when the caller does not say otherwise.
pub fn start(
    user_id: UserId,
    plan: &Plan,
    auto_renew: Option<bool>,
    now: OffsetDateTime,
) -> BillingResult<Subscription> {
    if !plan.is_active {
        return Err(plan_unavailable(plan.id));
    }

    Ok(Subscription {
        id: SubscriptionId::new(),
        user_id,
        plan_id: plan.id,
        status: SubscriptionStatus::Active,
        start_date: now,
        end_date: Some(cycle_end(now)),
        auto_renew: auto_renew.unwrap_or(true),
        data_used_gb: 0.0,
        created_at: now,
        updated_at: now,
        version: 1,
    })
}

/// Move an active subscription onto `new_plan`
///
/// With a direction, the price must move that way against `current_plan`.
/// Without one, any different active plan is accepted. Dates are preserved.
pub fn switch_plan(
    subscription: &Subscription,
    current_plan: Option<&Plan>,
    new_plan: &Plan,
    direction: Option<PlanChangeDirection>,
    now: OffsetDateTime,
) -> BillingResult<Subscription> {
    require_status(subscription, SubscriptionStatus::Active, "change plan")?;

    if !new_plan.is_active {
        return Err(plan_unavailable(new_plan.id));
    }

    match direction {
        Some(direction) => {
            let current = current_plan.ok_or_else(|| {
                BillingError::NotFound(format!("Current plan {} not found", subscription.plan_id))
            })?;
            if !direction.permits(current.price_cents, new_plan.price_cents) {
                return Err(BillingError::InvalidPriceDirection {
                    direction,
                    current_price_cents: current.price_cents,
                    new_price_cents: new_plan.price_cents,
                });
            }
        }
        None => {
            if new_plan.id == subscription.plan_id {
                return Err(BillingError::Validation(
                    "Subscription is already on this plan".to_string(),
                ));
            }
        }
    }

    let mut next = subscription.clone();
    next.plan_id = new_plan.id;
    next.updated_at = now;
    Ok(next)
}

/// Cancel an active subscription; the end date stays as it was and auto-renew is switched off
pub fn cancel(subscription: &Subscription, now: OffsetDateTime) -> BillingResult<Subscription> {
    require_status(subscription, SubscriptionStatus::Active, "cancel")?;

    let mut next = subscription.clone();
    next.status = SubscriptionStatus::Cancelled;
    next.auto_renew = false;
    next.updated_at = now;
    Ok(next)
}

/// Bring a cancelled or expired subscription back for a new cycle
pub fn renew(subscription: &Subscription, now: OffsetDateTime) -> BillingResult<Subscription> {
    if !subscription.status.is_renewable() {
        return Err(BillingError::InvalidState(format!(
            "Cannot renew a subscription that is {}",
            subscription.status
        )));
    }

    let mut next = subscription.clone();
    next.status = SubscriptionStatus::Active;
    next.start_date = now;
    next.end_date = Some(cycle_end(now));
    next.auto_renew = true;
    next.data_used_gb = 0.0;
    next.updated_at = now;
    Ok(next)
}

/// Lapse an active subscription whose period is over
pub fn expire(subscription: &Subscription, now: OffsetDateTime) -> BillingResult<Subscription> {
    require_status(subscription, SubscriptionStatus::Active, "expire")?;

    let mut next = subscription.clone();
    next.status = SubscriptionStatus::Expired;
    next.updated_at = now;
    Ok(next)
}

/// Start the next cycle of an auto-renewing subscription at `now`
pub fn roll_forward(
    subscription: &Subscription,
    now: OffsetDateTime,
) -> BillingResult<Subscription> {
    require_status(subscription, SubscriptionStatus::Active, "auto-renew")?;
    if !subscription.auto_renew {
        return Err(BillingError::InvalidState(
            "Subscription does not auto-renew".to_string(),
        ));
    }

    let mut next = subscription.clone();
    next.start_date = now;
    next.end_date = Some(cycle_end(now));
    next.data_used_gb = 0.0;
    next.updated_at = now;
    Ok(next)
}

/// Whether the period of an active subscription has run out at `as_of`
pub fn is_due(subscription: &Subscription, as_of: OffsetDateTime) -> bool {
    subscription.is_active() && subscription.end_date.is_some_and(|end| end <= as_of)
}

fn require_status(
    subscription: &Subscription,
    expected: SubscriptionStatus,
    operation: &str,
) -> BillingResult<()> {
    if subscription.status != expected {
        return Err(BillingError::InvalidState(format!(
            "Cannot {} a subscription that is {}",
            operation, subscription.status
        )));
    }
    Ok(())
}

pub(crate) fn plan_unavailable(plan_id: PlanId) -> BillingError {
    BillingError::NotFound(format!("Plan {} not found or inactive", plan_id))
}
