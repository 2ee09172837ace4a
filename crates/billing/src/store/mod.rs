//! Storage ports for plans, subscriptions, profiles and side-effect sinks
//!
//! Two adapters ship with the crate: [`memory::InMemoryStore`] for tests and
//! embedding, and [`postgres::PgStore`] backed by sqlx.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use planhub_shared::{
    AuditRecord, Notification, Plan, PlanId, ProductType, Subscription, SubscriptionId, UserId,
    UserProfile,
};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Which plans a listing should return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanFilter {
    pub active_only: bool,
    pub product_type: Option<ProductType>,
}

impl PlanFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            product_type: None,
        }
    }

    pub fn matches(&self, plan: &Plan) -> bool {
        (!self.active_only || plan.is_active)
            && self.product_type.map_or(true, |t| plan.product_type == t)
    }
}

/// How many subscriptions point at a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanReferences {
    pub active: i64,
    pub total: i64,
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn get_plan(&self, id: PlanId) -> BillingResult<Option<Plan>>;

    /// Plans matching `filter`, cheapest first
    async fn list_plans(&self, filter: PlanFilter) -> BillingResult<Vec<Plan>>;

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()>;

    /// Overwrite a stored plan; `NotFound` when it does not exist
    async fn update_plan(&self, plan: &Plan) -> BillingResult<()>;

    /// Remove a plan that no subscription references
    ///
    /// The reference check and the delete are atomic with respect to
    /// subscription writes. Returns `false` when the plan is missing or still
    /// referenced.
    async fn delete_unreferenced_plan(&self, id: PlanId) -> BillingResult<bool>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>>;

    async fn find_active_for_user(&self, user_id: UserId) -> BillingResult<Option<Subscription>>;

    /// Every subscription of a user, most recently created first
    async fn list_for_user(&self, user_id: UserId) -> BillingResult<Vec<Subscription>>;

    /// Every subscription, most recently created first
    async fn list_all(&self) -> BillingResult<Vec<Subscription>>;

    /// Active subscriptions whose end date is at or before `as_of`
    async fn list_due(&self, as_of: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    async fn plan_references(&self, plan_id: PlanId) -> BillingResult<PlanReferences>;

    /// Store a new subscription
    ///
    /// Fails with `AlreadySubscribed` when the row is active and the user
    /// already holds an active subscription, and with `NotFound` when the row
    /// is active and its plan is missing or inactive at write time.
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription>;

    /// Write `subscription` if the stored version still equals `subscription.version`
    ///
    /// Returns the stored row with its version bumped. Fails with
    /// `ConcurrentModification` on a version mismatch, `AlreadySubscribed`
    /// when activating would give the user a second active subscription and
    /// `NotFound` when an active row points at a plan that no longer exists.
    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_profile(&self, user_id: UserId) -> BillingResult<Option<UserProfile>>;

    /// `AlreadyExists` when the user already has a profile
    async fn insert_profile(&self, profile: &UserProfile) -> BillingResult<()>;
}

/// Append-only audit log; appending a record id twice keeps the first
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_audit(&self, record: &AuditRecord) -> BillingResult<()>;
}

/// User notification outbox; appending a notification id twice keeps the first
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn append_notification(&self, notification: &Notification) -> BillingResult<()>;
}

/// All ports a [`crate::BillingService`] needs
#[derive(Clone)]
pub struct Stores {
    pub plans: Arc<dyn PlanRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub users: Arc<dyn UserDirectory>,
    pub audit: Arc<dyn AuditSink>,
    pub notifications: Arc<dyn NotificationSink>,
}

impl Stores {
    /// Use one backend for every port
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: PlanRepository
            + SubscriptionRepository
            + UserDirectory
            + AuditSink
            + NotificationSink
            + 'static,
    {
        Self {
            plans: backend.clone(),
            subscriptions: backend.clone(),
            users: backend.clone(),
            audit: backend.clone(),
            notifications: backend,
        }
    }
}
