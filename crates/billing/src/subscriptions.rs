//! Subscription lifecycle service
//!
//! Each operation resolves the caller, loads the subscription, applies a
//! transition from [`crate::lifecycle`], writes it with a version check and
//! then emits the audit record and notification.

use std::sync::Arc;

use planhub_shared::{
    NotificationType, Plan, PlanId, Subscription, SubscriptionId, SubscriptionWithPlan, UserId,
    UserProfile,
};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{action, entity, notification, AuditEventBuilder, SideEffects};
use crate::lifecycle::{self, PlanChangeDirection};
use crate::store::{PlanRepository, SubscriptionRepository};
use crate::users::UserService;

#[derive(Clone)]
pub struct SubscriptionService {
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    users: UserService,
    effects: SideEffects,
}

impl SubscriptionService {
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

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Subscribe the caller to an active plan
    pub async fn subscribe(
        &self,
        caller: Option<UserId>,
        plan_id: PlanId,
        auto_renew: Option<bool>,
    ) -> BillingResult<Subscription> {
        let profile = self.users.authenticate(caller).await?;

        if let Some(existing) = self
            .subscriptions
            .find_active_for_user(profile.user_id)
            .await?
        {
            tracing::debug!(
                user_id = %profile.user_id,
                subscription_id = %existing.id,
                "Subscribe rejected, user already has an active subscription"
            );
            return Err(BillingError::AlreadySubscribed);
        }

        let plan = self.active_plan(plan_id).await?;
        let subscription =
            lifecycle::start(profile.user_id, &plan, auto_renew, OffsetDateTime::now_utc())?;
        let stored = self.subscriptions.insert_subscription(&subscription).await?;

        tracing::info!(
            user_id = %stored.user_id,
            subscription_id = %stored.id,
            plan_id = %plan.id,
            "Subscription created"
        );

        self.effects
            .emit(
                AuditEventBuilder::new(action::SUBSCRIBE, entity::SUBSCRIPTION, stored.id)
                    .actor(&profile)
                    .details(format!("Subscribed to plan: {}", plan.name)),
                Some(notification(
                    stored.user_id,
                    "Subscription Activated",
                    format!("You have successfully subscribed to {}", plan.name),
                    NotificationType::Renewal,
                )),
            )
            .await;

        Ok(stored)
    }

    /// Move an active subscription to any other active plan
    pub async fn change_plan(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
        new_plan_id: PlanId,
    ) -> BillingResult<Subscription> {
        self.switch_plan(caller, subscription_id, new_plan_id, None)
            .await
    }

    /// Move an active subscription to a strictly more expensive plan
    pub async fn upgrade(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
        new_plan_id: PlanId,
    ) -> BillingResult<Subscription> {
        self.switch_plan(
            caller,
            subscription_id,
            new_plan_id,
            Some(PlanChangeDirection::Upgrade),
        )
        .await
    }

    /// Move an active subscription to a strictly cheaper plan
    pub async fn downgrade(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
        new_plan_id: PlanId,
    ) -> BillingResult<Subscription> {
        self.switch_plan(
            caller,
            subscription_id,
            new_plan_id,
            Some(PlanChangeDirection::Downgrade),
        )
        .await
    }

    /// Cancel an active subscription; the paid period end is kept
    pub async fn cancel(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Subscription> {
        let profile = self.users.authenticate(caller).await?;
        let subscription = self.visible_subscription(&profile, subscription_id).await?;

        let cancelled = lifecycle::cancel(&subscription, OffsetDateTime::now_utc())?;
        let stored = self.subscriptions.update_subscription(&cancelled).await?;

        tracing::info!(
            user_id = %stored.user_id,
            subscription_id = %stored.id,
            actor_id = %profile.user_id,
            "Subscription cancelled"
        );

        self.effects
            .emit(
                AuditEventBuilder::new(action::CANCEL_SUBSCRIPTION, entity::SUBSCRIPTION, stored.id)
                    .actor(&profile)
                    .details("Cancelled subscription"),
                Some(notification(
                    stored.user_id,
                    "Subscription Cancelled",
                    "Your subscription has been cancelled",
                    NotificationType::Renewal,
                )),
            )
            .await;

        Ok(stored)
    }

    /// Reactivate a cancelled or expired subscription for a new cycle
    pub async fn renew(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Subscription> {
        let profile = self.users.authenticate(caller).await?;
        let subscription = self.visible_subscription(&profile, subscription_id).await?;

        let renewed = lifecycle::renew(&subscription, OffsetDateTime::now_utc())?;

        if let Some(other) = self
            .subscriptions
            .find_active_for_user(subscription.user_id)
            .await?
        {
            if other.id != subscription.id {
                return Err(BillingError::AlreadySubscribed);
            }
        }
        self.active_plan(subscription.plan_id).await?;

        let stored = self.subscriptions.update_subscription(&renewed).await?;

        tracing::info!(
            user_id = %stored.user_id,
            subscription_id = %stored.id,
            "Subscription renewed"
        );

        self.effects
            .emit(
                AuditEventBuilder::new(action::RENEW_SUBSCRIPTION, entity::SUBSCRIPTION, stored.id)
                    .actor(&profile)
                    .details("Renewed subscription"),
                Some(notification(
                    stored.user_id,
                    "Subscription Renewed",
                    "Your subscription has been renewed for another month",
                    NotificationType::Renewal,
                )),
            )
            .await;

        Ok(stored)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The caller's current subscription with its plan
    ///
    /// Prefers the active subscription and falls back to the most recently
    /// created one. `None` when unauthenticated or never subscribed.
    pub async fn get_user_subscription(
        &self,
        caller: Option<UserId>,
    ) -> BillingResult<Option<SubscriptionWithPlan>> {
        let Some(user_id) = caller else {
            return Ok(None);
        };

        let current = match self.subscriptions.find_active_for_user(user_id).await? {
            Some(active) => Some(active),
            None => self
                .subscriptions
                .list_for_user(user_id)
                .await?
                .into_iter()
                .next(),
        };

        match current {
            Some(subscription) => Ok(Some(self.with_plan(subscription).await?)),
            None => Ok(None),
        }
    }

    /// Every subscription with its plan, newest first
    pub async fn list_subscriptions(
        &self,
        caller: Option<UserId>,
    ) -> BillingResult<Vec<SubscriptionWithPlan>> {
        self.users.require_admin(caller).await?;

        let subscriptions = self.subscriptions.list_all().await?;
        let mut out = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            out.push(self.with_plan(subscription).await?);
        }
        Ok(out)
    }

    /// One subscription, visible to its owner and to admins
    pub async fn get_subscription(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
    ) -> BillingResult<SubscriptionWithPlan> {
        let profile = self.users.authenticate(caller).await?;
        let subscription = self.visible_subscription(&profile, subscription_id).await?;
        self.with_plan(subscription).await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn switch_plan(
        &self,
        caller: Option<UserId>,
        subscription_id: SubscriptionId,
        new_plan_id: PlanId,
        direction: Option<PlanChangeDirection>,
    ) -> BillingResult<Subscription> {
        let profile = self.users.authenticate(caller).await?;
        let subscription = self.visible_subscription(&profile, subscription_id).await?;

        if !subscription.is_active() {
            return Err(BillingError::InvalidState(format!(
                "No active subscription found (subscription is {})",
                subscription.status
            )));
        }

        let new_plan = self.active_plan(new_plan_id).await?;
        let current_plan = self.plans.get_plan(subscription.plan_id).await?;

        let updated = lifecycle::switch_plan(
            &subscription,
            current_plan.as_ref(),
            &new_plan,
            direction,
            OffsetDateTime::now_utc(),
        )?;
        let stored = self.subscriptions.update_subscription(&updated).await?;

        let from = current_plan
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| subscription.plan_id.to_string());

        tracing::info!(
            user_id = %stored.user_id,
            subscription_id = %stored.id,
            from_plan = %subscription.plan_id,
            to_plan = %new_plan.id,
            direction = ?direction,
            "Subscription plan changed"
        );

        let (audit_action, details, title, message) = match direction {
            Some(PlanChangeDirection::Upgrade) => (
                action::UPGRADE_SUBSCRIPTION,
                format!("Upgraded from {} to {}", from, new_plan.name),
                "Subscription Upgraded",
                format!("Your subscription has been upgraded to {}", new_plan.name),
            ),
            Some(PlanChangeDirection::Downgrade) => (
                action::DOWNGRADE_SUBSCRIPTION,
                format!("Downgraded from {} to {}", from, new_plan.name),
                "Subscription Downgraded",
                format!("Your subscription has been downgraded to {}", new_plan.name),
            ),
            None => (
                action::CHANGE_PLAN,
                format!("Changed plan from {} to {}", from, new_plan.name),
                "Subscription Updated",
                format!("Your subscription has been changed to {}", new_plan.name),
            ),
        };

        self.effects
            .emit(
                AuditEventBuilder::new(audit_action, entity::SUBSCRIPTION, stored.id)
                    .actor(&profile)
                    .details(details),
                Some(notification(
                    stored.user_id,
                    title,
                    message,
                    NotificationType::Upgrade,
                )),
            )
            .await;

        Ok(stored)
    }

    /// Load a subscription the caller may act on
    ///
    /// Someone else's subscription reads as missing unless the caller is an admin.
    async fn visible_subscription(
        &self,
        profile: &UserProfile,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Subscription> {
        let not_found =
            || BillingError::NotFound(format!("Subscription {} not found", subscription_id));

        let subscription = self
            .subscriptions
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(not_found)?;

        if subscription.user_id != profile.user_id && !profile.is_admin() {
            return Err(not_found());
        }
        Ok(subscription)
    }

    async fn active_plan(&self, plan_id: PlanId) -> BillingResult<Plan> {
        match self.plans.get_plan(plan_id).await? {
            Some(plan) if plan.is_active => Ok(plan),
            _ => Err(lifecycle::plan_unavailable(plan_id)),
        }
    }

    async fn with_plan(&self, subscription: Subscription) -> BillingResult<SubscriptionWithPlan> {
        let plan = self.plans.get_plan(subscription.plan_id).await?;
        Ok(SubscriptionWithPlan { subscription, plan })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::plan;
    use crate::store::memory::InMemoryStore;
    use crate::users::NewProfile;
    use planhub_shared::{SubscriptionStatus, UserRole};

    struct Fixture {
        service: SubscriptionService,
        store: Arc<InMemoryStore>,
        user: Option<UserId>,
        other: Option<UserId>,
        admin: Option<UserId>,
        basic: Plan,
        pro: Plan,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let effects = SideEffects::new(store.clone(), store.clone());
        let users = UserService::new(store.clone(), effects.clone());
        let service = SubscriptionService::new(store.clone(), store.clone(), users.clone(), effects);

        let user = Some(UserId::new());
        let other = Some(UserId::new());
        let admin = Some(UserId::new());
        for (caller, role) in [
            (user, UserRole::User),
            (other, UserRole::User),
            (admin, UserRole::Admin),
        ] {
            users
                .create_profile(
                    caller,
                    NewProfile {
                        name: "Test".to_string(),
                        email: "test@example.com".to_string(),
                        phone: None,
                        role,
                    },
                )
                .await
                .unwrap();
        }

        let basic = plan("Basic", 4_000);
        let pro = plan("Pro", 6_000);
        store.insert_plan(&basic).await.unwrap();
        store.insert_plan(&pro).await.unwrap();

        Fixture {
            service,
            store,
            user,
            other,
            admin,
            basic,
            pro,
        }
    }

    #[tokio::test]
    async fn test_subscribe_twice_rejected() {
        let f = fixture().await;
        f.service.subscribe(f.user, f.basic.id, None).await.unwrap();

        let err = f
            .service
            .subscribe(f.user, f.pro.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AlreadySubscribed));
    }

    #[tokio::test]
    async fn test_subscribe_emits_audit_and_notification() {
        let f = fixture().await;
        let sub = f.service.subscribe(f.user, f.basic.id, Some(false)).await.unwrap();
        assert!(!sub.auto_renew);

        let audit = f.store.audit_for_entity(&sub.id.to_string()).await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, action::SUBSCRIBE);
        assert_eq!(audit[0].details, "Subscribed to plan: Basic");
        assert_eq!(audit[0].actor_id, f.user);

        let notes = f.store.notifications_for(sub.user_id).await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "Subscription Activated");
        assert_eq!(notes[0].notification_type, NotificationType::Renewal);
        assert!(!notes[0].is_read);
    }

    #[tokio::test]
    async fn test_owner_and_admin_visibility() {
        let f = fixture().await;
        let sub = f.service.subscribe(f.user, f.basic.id, None).await.unwrap();

        let err = f.service.cancel(f.other, sub.id).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(matches!(
            f.service.get_subscription(f.other, sub.id).await,
            Err(BillingError::NotFound(_))
        ));

        let cancelled = f.service.cancel(f.admin, sub.id).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

        let audit = f.store.audit_for_entity(&sub.id.to_string()).await;
        let last = audit.last().unwrap();
        assert_eq!(last.actor_id, f.admin);
        assert_eq!(last.actor_type, planhub_shared::ActorType::Admin);
        // the owner still hears about it
        let notes = f.store.notifications_for(sub.user_id).await;
        assert_eq!(notes.last().unwrap().title, "Subscription Cancelled");
    }

    #[tokio::test]
    async fn test_change_plan_any_direction() {
        let f = fixture().await;
        let sub = f.service.subscribe(f.user, f.pro.id, None).await.unwrap();

        let changed = f.service.change_plan(f.user, sub.id, f.basic.id).await.unwrap();
        assert_eq!(changed.plan_id, f.basic.id);
        assert_eq!(changed.end_date, sub.end_date);

        let audit = f.store.audit_for_entity(&sub.id.to_string()).await;
        assert_eq!(audit.last().unwrap().action, action::CHANGE_PLAN);
        assert_eq!(audit.last().unwrap().details, "Changed plan from Pro to Basic");

        let err = f
            .service
            .change_plan(f.user, sub.id, f.basic.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_change_to_inactive_plan_rejected() {
        let f = fixture().await;
        let mut retired = plan("Retired", 9_000);
        retired.is_active = false;
        f.store.insert_plan(&retired).await.unwrap();

        let sub = f.service.subscribe(f.user, f.basic.id, None).await.unwrap();
        let err = f.service.upgrade(f.user, sub.id, retired.id).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let f = fixture().await;
        let sub = f.service.subscribe(f.user, f.basic.id, None).await.unwrap();

        // a concurrent writer bumps the version underneath us
        let cancelled = lifecycle::cancel(&sub, OffsetDateTime::now_utc()).unwrap();
        f.store.update_subscription(&cancelled).await.unwrap();

        let stale = lifecycle::cancel(&sub, OffsetDateTime::now_utc()).unwrap();
        let err = f.store.update_subscription(&stale).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_get_user_subscription_prefers_active() {
        let f = fixture().await;
        assert!(f.service.get_user_subscription(f.user).await.unwrap().is_none());
        assert!(f.service.get_user_subscription(None).await.unwrap().is_none());

        let first = f.service.subscribe(f.user, f.basic.id, None).await.unwrap();
        f.service.cancel(f.user, first.id).await.unwrap();
        let second = f.service.subscribe(f.user, f.pro.id, None).await.unwrap();

        let current = f.service.get_user_subscription(f.user).await.unwrap().unwrap();
        assert_eq!(current.subscription.id, second.id);
        assert_eq!(current.plan.unwrap().name, "Pro");

        f.service.cancel(f.user, second.id).await.unwrap();
        let latest = f.service.get_user_subscription(f.user).await.unwrap().unwrap();
        assert_eq!(latest.subscription.id, second.id);
        assert_eq!(latest.subscription.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_subscriptions_admin_only() {
        let f = fixture().await;
        f.service.subscribe(f.user, f.basic.id, None).await.unwrap();
        f.service.subscribe(f.other, f.pro.id, None).await.unwrap();

        let all = f.service.list_subscriptions(f.admin).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.plan.is_some()));

        assert!(matches!(
            f.service.list_subscriptions(f.user).await,
            Err(BillingError::Forbidden)
        ));
        assert!(matches!(
            f.service.list_subscriptions(None).await,
            Err(BillingError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_renew_blocked_by_newer_active_subscription() {
        let f = fixture().await;
        let old = f.service.subscribe(f.user, f.basic.id, None).await.unwrap();
        f.service.cancel(f.user, old.id).await.unwrap();
        f.service.subscribe(f.user, f.pro.id, None).await.unwrap();

        let err = f.service.renew(f.user, old.id).await.unwrap_err();
        assert!(matches!(err, BillingError::AlreadySubscribed));
    }

    #[tokio::test]
    async fn test_renew_requires_plan_still_offered() {
        let f = fixture().await;
        let sub = f.service.subscribe(f.user, f.basic.id, None).await.unwrap();
        f.service.cancel(f.user, sub.id).await.unwrap();

        let mut retired = f.basic.clone();
        retired.is_active = false;
        f.store.update_plan(&retired).await.unwrap();

        let err = f.service.renew(f.user, sub.id).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
