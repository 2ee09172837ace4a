//! In-memory storage adapter
//!
//! All state sits behind one `RwLock`, so the active-subscription check and
//! the write that depends on it happen under the same guard.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use planhub_shared::{
    AuditRecord, Notification, Plan, PlanId, Subscription, SubscriptionId, UserId, UserProfile,
};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AuditSink, NotificationSink, PlanFilter, PlanReferences, PlanRepository,
    SubscriptionRepository, UserDirectory,
};
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::plan_unavailable;

#[derive(Default)]
struct MemoryState {
    plans: HashMap<PlanId, Plan>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    /// Insertion order, used to break created_at ties
    subscription_order: Vec<SubscriptionId>,
    profiles: HashMap<UserId, UserProfile>,
    audit: Vec<AuditRecord>,
    audit_ids: HashSet<Uuid>,
    notifications: Vec<Notification>,
    notification_ids: HashSet<Uuid>,
}

impl MemoryState {
    fn active_for_user(&self, user_id: UserId) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.is_active())
    }

    fn is_referenced(&self, plan_id: PlanId) -> bool {
        self.subscriptions.values().any(|s| s.plan_id == plan_id)
    }

    /// Subscriptions matching `keep`, newest first
    fn newest_first(&self, keep: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
        let mut out: Vec<Subscription> = self
            .subscription_order
            .iter()
            .rev()
            .filter_map(|id| self.subscriptions.get(id))
            .filter(|s| keep(s))
            .cloned()
            .collect();
        // stable sort keeps reverse insertion order among equal timestamps
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }
}

/// Store holding everything in process memory
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a subscription as an import would, skipping every write check
    #[cfg(test)]
    pub(crate) async fn seed_subscription(&self, subscription: &Subscription) {
        let mut state = self.state.write().await;
        state.subscriptions.insert(subscription.id, subscription.clone());
        state.subscription_order.push(subscription.id);
    }

    /// Audit records in append order
    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.state.read().await.audit.clone()
    }

    /// Audit records for one entity in append order
    pub async fn audit_for_entity(&self, entity_id: &str) -> Vec<AuditRecord> {
        self.state
            .read()
            .await
            .audit
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Notifications for one user in append order
    pub async fn notifications_for(&self, user_id: UserId) -> Vec<Notification> {
        self.state
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PlanRepository for InMemoryStore {
    async fn get_plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        Ok(self.state.read().await.plans.get(&id).cloned())
    }

    async fn list_plans(&self, filter: PlanFilter) -> BillingResult<Vec<Plan>> {
        let state = self.state.read().await;
        let mut plans: Vec<Plan> = state
            .plans
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        plans.sort_by(|a, b| {
            a.price_cents
                .cmp(&b.price_cents)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(plans)
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if state.plans.contains_key(&plan.id) {
            return Err(BillingError::AlreadyExists(format!("Plan {}", plan.id)));
        }
        state.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let mut state = self.state.write().await;
        match state.plans.get_mut(&plan.id) {
            Some(stored) => {
                *stored = plan.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!("Plan {} not found", plan.id))),
        }
    }

    async fn delete_unreferenced_plan(&self, id: PlanId) -> BillingResult<bool> {
        let mut state = self.state.write().await;
        if state.is_referenced(id) {
            return Ok(false);
        }
        Ok(state.plans.remove(&id).is_some())
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        Ok(self.state.read().await.subscriptions.get(&id).cloned())
    }

    async fn find_active_for_user(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        Ok(self.state.read().await.active_for_user(user_id).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .state
            .read()
            .await
            .newest_first(|s| s.user_id == user_id))
    }

    async fn list_all(&self) -> BillingResult<Vec<Subscription>> {
        Ok(self.state.read().await.newest_first(|_| true))
    }

    async fn list_due(&self, as_of: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let mut due = self
            .state
            .read()
            .await
            .newest_first(|s| crate::lifecycle::is_due(s, as_of));
        due.sort_by_key(|s| s.end_date);
        Ok(due)
    }

    async fn plan_references(&self, plan_id: PlanId) -> BillingResult<PlanReferences> {
        let state = self.state.read().await;
        let mut refs = PlanReferences::default();
        for sub in state.subscriptions.values().filter(|s| s.plan_id == plan_id) {
            refs.total += 1;
            if sub.is_active() {
                refs.active += 1;
            }
        }
        Ok(refs)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut state = self.state.write().await;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::AlreadyExists(format!(
                "Subscription {}",
                subscription.id
            )));
        }
        if subscription.is_active() {
            let plan_active = state
                .plans
                .get(&subscription.plan_id)
                .is_some_and(|p| p.is_active);
            if !plan_active {
                return Err(plan_unavailable(subscription.plan_id));
            }
            if state.active_for_user(subscription.user_id).is_some() {
                return Err(BillingError::AlreadySubscribed);
            }
        }

        state.subscriptions.insert(subscription.id, subscription.clone());
        state.subscription_order.push(subscription.id);
        Ok(subscription.clone())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut state = self.state.write().await;

        let stored_version = match state.subscriptions.get(&subscription.id) {
            Some(stored) => stored.version,
            None => {
                return Err(BillingError::NotFound(format!(
                    "Subscription {} not found",
                    subscription.id
                )))
            }
        };
        if stored_version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} is at version {}, expected {}",
                subscription.id, stored_version, subscription.version
            )));
        }

        if subscription.is_active() {
            if !state.plans.contains_key(&subscription.plan_id) {
                return Err(BillingError::NotFound(format!(
                    "Plan {} not found",
                    subscription.plan_id
                )));
            }
            let conflict = state
                .active_for_user(subscription.user_id)
                .is_some_and(|other| other.id != subscription.id);
            if conflict {
                return Err(BillingError::AlreadySubscribed);
            }
        }

        let mut next = subscription.clone();
        next.version += 1;
        state.subscriptions.insert(next.id, next.clone());
        Ok(next)
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn get_profile(&self, user_id: UserId) -> BillingResult<Option<UserProfile>> {
        Ok(self.state.read().await.profiles.get(&user_id).cloned())
    }

    async fn insert_profile(&self, profile: &UserProfile) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if state.profiles.contains_key(&profile.user_id) {
            return Err(BillingError::AlreadyExists("Profile already exists".to_string()));
        }
        state.profiles.insert(profile.user_id, profile.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditSink for InMemoryStore {
    async fn append_audit(&self, record: &AuditRecord) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if state.audit_ids.insert(record.id) {
            state.audit.push(record.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for InMemoryStore {
    async fn append_notification(&self, notification: &Notification) -> BillingResult<()> {
        let mut state = self.state.write().await;
        if state.notification_ids.insert(notification.id) {
            state.notifications.push(notification.clone());
        }
        Ok(())
    }
}
