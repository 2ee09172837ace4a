//! Subscription invariants
//!
//! Read-only consistency checks over stored plans and subscriptions. The
//! worker runs them on a schedule; they can also be run after a data import
//! or manual fix. Violations carry enough context to find the rows involved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use planhub_shared::{Plan, PlanId, Subscription, SubscriptionStatus, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::{PlanFilter, PlanRepository, SubscriptionRepository};

/// One failed check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected, if any
    pub user_ids: Vec<UserId>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Users may be billed twice
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const SINGLE_ACTIVE_SUBSCRIPTION: &str = "single_active_subscription";
const PERIOD_END_PRESENT: &str = "period_end_present";
const PERIOD_END_AFTER_START: &str = "period_end_after_start";
const ACTIVE_PLAN_EXISTS: &str = "active_plan_exists";
const PLAN_VALUES_NON_NEGATIVE: &str = "plan_values_non_negative";
const NO_OVERDUE_ACTIVE: &str = "no_overdue_active";

/// Snapshot the checks run against
struct Snapshot {
    plans: HashMap<PlanId, Plan>,
    subscriptions: Vec<Subscription>,
    now: OffsetDateTime,
}

pub struct InvariantChecker {
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl InvariantChecker {
    pub fn new(
        plans: Arc<dyn PlanRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
    ) -> Self {
        Self {
            plans,
            subscriptions,
        }
    }

    async fn snapshot(&self) -> BillingResult<Snapshot> {
        let plans = self
            .plans
            .list_plans(PlanFilter::default())
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let subscriptions = self.subscriptions.list_all().await?;
        Ok(Snapshot {
            plans,
            subscriptions,
            now: OffsetDateTime::now_utc(),
        })
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let snapshot = self.snapshot().await?;

        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(check(name, &snapshot));
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: snapshot.now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        if !Self::available_checks().contains(&name) {
            return Ok(vec![]);
        }
        let snapshot = self.snapshot().await?;
        Ok(check(name, &snapshot))
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SINGLE_ACTIVE_SUBSCRIPTION,
            PERIOD_END_PRESENT,
            PERIOD_END_AFTER_START,
            ACTIVE_PLAN_EXISTS,
            PLAN_VALUES_NON_NEGATIVE,
            NO_OVERDUE_ACTIVE,
        ]
    }
}

fn check(name: &str, snapshot: &Snapshot) -> Vec<InvariantViolation> {
    match name {
        SINGLE_ACTIVE_SUBSCRIPTION => check_single_active_subscription(snapshot),
        PERIOD_END_PRESENT => check_period_end_present(snapshot),
        PERIOD_END_AFTER_START => check_period_end_after_start(snapshot),
        ACTIVE_PLAN_EXISTS => check_active_plan_exists(snapshot),
        PLAN_VALUES_NON_NEGATIVE => check_plan_values_non_negative(snapshot),
        NO_OVERDUE_ACTIVE => check_no_overdue_active(snapshot),
        _ => vec![],
    }
}

/// At most one active subscription per user
fn check_single_active_subscription(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    let mut per_user: HashMap<UserId, Vec<String>> = HashMap::new();
    for sub in snapshot.subscriptions.iter().filter(|s| s.is_active()) {
        per_user.entry(sub.user_id).or_default().push(sub.id.to_string());
    }

    per_user
        .into_iter()
        .filter(|(_, subs)| subs.len() > 1)
        .map(|(user_id, subs)| InvariantViolation {
            invariant: SINGLE_ACTIVE_SUBSCRIPTION.to_string(),
            user_ids: vec![user_id],
            description: format!("User has {} active subscriptions (expected 1)", subs.len()),
            context: serde_json::json!({ "subscription_ids": subs }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

/// Only pending subscriptions may lack an end date
fn check_period_end_present(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|s| s.status != SubscriptionStatus::Pending && s.end_date.is_none())
        .map(|s| InvariantViolation {
            invariant: PERIOD_END_PRESENT.to_string(),
            user_ids: vec![s.user_id],
            description: format!("{} subscription has no end date", s.status),
            context: serde_json::json!({
                "subscription_id": s.id,
                "status": s.status,
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

fn check_period_end_after_start(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|s| s.end_date.is_some_and(|end| end <= s.start_date))
        .map(|s| InvariantViolation {
            invariant: PERIOD_END_AFTER_START.to_string(),
            user_ids: vec![s.user_id],
            description: "Subscription ends before it starts".to_string(),
            context: serde_json::json!({
                "subscription_id": s.id,
                "start_date": s.start_date.unix_timestamp(),
                "end_date": s.end_date.map(|d| d.unix_timestamp()),
            }),
            severity: ViolationSeverity::Medium,
        })
        .collect()
}

/// Active subscriptions must point at a stored plan
fn check_active_plan_exists(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|s| s.is_active() && !snapshot.plans.contains_key(&s.plan_id))
        .map(|s| InvariantViolation {
            invariant: ACTIVE_PLAN_EXISTS.to_string(),
            user_ids: vec![s.user_id],
            description: format!("Active subscription references missing plan {}", s.plan_id),
            context: serde_json::json!({
                "subscription_id": s.id,
                "plan_id": s.plan_id,
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

fn check_plan_values_non_negative(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .plans
        .values()
        .filter(|p| p.price_cents < 0 || p.data_quota_gb < 0)
        .map(|p| InvariantViolation {
            invariant: PLAN_VALUES_NON_NEGATIVE.to_string(),
            user_ids: vec![],
            description: format!("Plan {} has a negative price or quota", p.name),
            context: serde_json::json!({
                "plan_id": p.id,
                "price_cents": p.price_cents,
                "data_quota_gb": p.data_quota_gb,
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

/// Active subscriptions past their end date mean the expiry sweep is behind
fn check_no_overdue_active(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .subscriptions
        .iter()
        .filter(|s| crate::lifecycle::is_due(s, snapshot.now))
        .map(|s| InvariantViolation {
            invariant: NO_OVERDUE_ACTIVE.to_string(),
            user_ids: vec![s.user_id],
            description: "Active subscription is past its end date".to_string(),
            context: serde_json::json!({
                "subscription_id": s.id,
                "end_date": s.end_date.map(|d| d.unix_timestamp()),
            }),
            severity: ViolationSeverity::Low,
        })
        .collect()
}
