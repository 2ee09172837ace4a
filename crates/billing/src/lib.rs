// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PlanHub Billing Module
//!
//! Plan catalogue and subscription lifecycle for telecom service plans.
//!
//! ## Features
//!
//! - **Plan Registry**: Admin-managed plans with price, quota and product line
//! - **Subscriptions**: Subscribe, upgrade, downgrade, change, cancel, renew
//! - **Expiry Sweep**: End-of-period auto-renewal or expiry
//! - **Usage Metering**: Per-cycle data usage against the plan quota
//! - **Audit & Notifications**: Best-effort records for every mutation
//! - **Invariants**: Read-only consistency checks
//!
//! Storage is pluggable: [`BillingService::in_memory`] for tests and embedding,
//! [`BillingService::postgres`] for production.

use std::sync::Arc;

use sqlx::PgPool;

pub mod error;
pub mod events;
pub mod expiry;
pub mod invariants;
pub mod lifecycle;
pub mod normalize;
pub mod plans;
pub mod store;
pub mod subscriptions;
pub mod usage;
pub mod users;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{action, entity, Actor, AuditEventBuilder, SideEffects};

// Expiry
pub use expiry::{ExpiryService, SweepSummary};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{PlanChangeDirection, BILLING_CYCLE_DAYS};

// Normalization
pub use normalize::{price_to_cents, PlanPayload};

// Plans
pub use plans::{NewPlan, PlanPatch, PlanRemoval, PlanService};

// Storage
pub use store::memory::InMemoryStore;
pub use store::postgres::PgStore;
pub use store::{
    AuditSink, NotificationSink, PlanFilter, PlanReferences, PlanRepository, Stores,
    SubscriptionRepository, UserDirectory,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Usage
pub use usage::{UsageMeter, UsageReport};

// Users
pub use users::{NewProfile, UserService};

/// Main billing service that combines all functionality
pub struct BillingService {
    pub users: UserService,
    pub plans: PlanService,
    pub subscriptions: SubscriptionService,
    pub usage: UsageMeter,
    pub expiry: ExpiryService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Wire every service onto the given ports
    pub fn new(stores: Stores) -> Self {
        let effects = SideEffects::new(stores.audit.clone(), stores.notifications.clone());
        let users = UserService::new(stores.users.clone(), effects.clone());

        Self {
            plans: PlanService::new(
                stores.plans.clone(),
                stores.subscriptions.clone(),
                users.clone(),
                effects.clone(),
            ),
            subscriptions: SubscriptionService::new(
                stores.plans.clone(),
                stores.subscriptions.clone(),
                users.clone(),
                effects.clone(),
            ),
            usage: UsageMeter::new(
                stores.plans.clone(),
                stores.subscriptions.clone(),
                users.clone(),
                effects.clone(),
            ),
            expiry: ExpiryService::new(stores.plans.clone(), stores.subscriptions.clone(), effects),
            invariants: InvariantChecker::new(stores.plans, stores.subscriptions),
            users,
        }
    }

    /// Service over a fresh in-memory store; the store is returned for inspection
    pub fn in_memory() -> (Self, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (Self::new(Stores::from_backend(store.clone())), store)
    }

    /// Service backed by Postgres
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Stores::from_backend(Arc::new(PgStore::new(pool))))
    }
}
