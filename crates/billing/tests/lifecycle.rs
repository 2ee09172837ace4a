//! End-to-end subscription lifecycle tests against the in-memory store
//!
//! ## Running Tests
//! ```bash
//! cargo test -p planhub-billing --test lifecycle
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use planhub_billing::{
    action, BillingError, BillingService, InMemoryStore, NewPlan, NewProfile, PlanPayload,
    PlanRemoval,
};
use planhub_shared::{
    ActorType, NotificationType, Plan, ProductType, SubscriptionStatus, UserId, UserRole,
};
use serde_json::json;
use time::{Duration, OffsetDateTime};

// ============================================================================
// Test Utilities
// ============================================================================

struct Harness {
    billing: BillingService,
    store: Arc<InMemoryStore>,
    admin: Option<UserId>,
    alice: Option<UserId>,
    bob: Option<UserId>,
    basic: Plan,
    pro: Plan,
}

async fn register(billing: &BillingService, role: UserRole, name: &str) -> Option<UserId> {
    let caller = Some(UserId::new());
    billing
        .users
        .create_profile(
            caller,
            NewProfile {
                name: name.to_string(),
                email: format!("{}@example.com", name.to_lowercase()),
                phone: None,
                role,
            },
        )
        .await
        .expect("profile");
    caller
}

async fn create_plan(
    billing: &BillingService,
    admin: Option<UserId>,
    payload: serde_json::Value,
) -> Plan {
    let input: NewPlan = PlanPayload::from_json(payload)
        .and_then(PlanPayload::into_new_plan)
        .expect("valid payload");
    billing.plans.create_plan(admin, input).await.expect("plan")
}

async fn setup() -> Harness {
    let (billing, store) = BillingService::in_memory();
    let admin = register(&billing, UserRole::Admin, "Admin").await;
    let alice = register(&billing, UserRole::User, "Alice").await;
    let bob = register(&billing, UserRole::User, "Bob").await;

    let basic = create_plan(
        &billing,
        admin,
        json!({ "Name": "Basic", "Price": 40, "type": "Fibernet", "quota": 100, "Status": "Active" }),
    )
    .await;
    let pro = create_plan(
        &billing,
        admin,
        json!({ "name": "Pro", "price": 60, "productType": "Fibernet", "dataQuota": 500, "isActive": true }),
    )
    .await;

    Harness {
        billing,
        store,
        admin,
        alice,
        bob,
        basic,
        pro,
    }
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_subscribe_opens_thirty_day_period() {
    let h = setup().await;
    let before = OffsetDateTime::now_utc();
    let sub = h
        .billing
        .subscriptions
        .subscribe(h.alice, h.basic.id, None)
        .await
        .unwrap();

    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.start_date >= before);
    assert_eq!(sub.end_date, Some(sub.start_date + Duration::days(30)));
    assert!(sub.auto_renew);

    let audit = h.store.audit_for_entity(&sub.id.to_string()).await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, action::SUBSCRIBE);
    assert_eq!(audit[0].details, "Subscribed to plan: Basic");
}

#[tokio::test]
async fn test_subscribe_to_inactive_plan_leaves_no_trace() {
    let h = setup().await;
    let retired = create_plan(
        &h.billing,
        h.admin,
        json!({ "Name": "Retired", "Price": 10, "Status": "Inactive" }),
    )
    .await;
    let audit_before = h.store.audit_records().await.len();

    let err = h
        .billing
        .subscriptions
        .subscribe(h.alice, retired.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));

    assert_eq!(h.store.audit_records().await.len(), audit_before);
    assert!(h
        .billing
        .subscriptions
        .get_user_subscription(h.alice)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_subscribe_requires_authentication() {
    let h = setup().await;
    let err = h
        .billing
        .subscriptions
        .subscribe(None, h.basic.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotAuthenticated));
}

#[tokio::test]
async fn test_concurrent_subscribes_leave_one_active() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;

    let (a, b) = tokio::join!(
        subs.subscribe(h.alice, h.basic.id, None),
        subs.subscribe(h.alice, h.pro.id, None),
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    for result in [a, b] {
        if let Err(e) = result {
            assert!(matches!(e, BillingError::AlreadySubscribed));
        }
    }
}

// ============================================================================
// Upgrade / Downgrade
// ============================================================================

#[tokio::test]
async fn test_upgrade_then_downgrade() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;
    let sub = subs.subscribe(h.alice, h.basic.id, None).await.unwrap();

    let upgraded = subs.upgrade(h.alice, sub.id, h.pro.id).await.unwrap();
    assert_eq!(upgraded.plan_id, h.pro.id);
    assert_eq!(upgraded.status, SubscriptionStatus::Active);
    assert_eq!(upgraded.start_date, sub.start_date);
    assert_eq!(upgraded.end_date, sub.end_date);

    let audit = h.store.audit_for_entity(&sub.id.to_string()).await;
    let last = audit.last().unwrap();
    assert_eq!(last.action, action::UPGRADE_SUBSCRIPTION);
    assert_eq!(last.details, "Upgraded from Basic to Pro");

    let notes = h.store.notifications_for(sub.user_id).await;
    let note = notes.last().unwrap();
    assert_eq!(note.title, "Subscription Upgraded");
    assert_eq!(note.message, "Your subscription has been upgraded to Pro");
    assert_eq!(note.notification_type, NotificationType::Upgrade);

    let downgraded = subs.downgrade(h.alice, sub.id, h.basic.id).await.unwrap();
    assert_eq!(downgraded.plan_id, h.basic.id);
    let audit = h.store.audit_for_entity(&sub.id.to_string()).await;
    assert_eq!(audit.last().unwrap().details, "Downgraded from Pro to Basic");
}

#[tokio::test]
async fn test_wrong_direction_rejected() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;

    let on_pro = subs.subscribe(h.alice, h.pro.id, None).await.unwrap();
    let err = subs.upgrade(h.alice, on_pro.id, h.basic.id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidPriceDirection { .. }));

    let on_basic = subs.subscribe(h.bob, h.basic.id, None).await.unwrap();
    let err = subs
        .downgrade(h.bob, on_basic.id, h.pro.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidPriceDirection { .. }));

    // nothing moved
    let unchanged = h
        .billing
        .subscriptions
        .get_subscription(h.alice, on_pro.id)
        .await
        .unwrap();
    assert_eq!(unchanged.subscription.plan_id, h.pro.id);
}

#[tokio::test]
async fn test_upgrade_cancelled_subscription_rejected() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;
    let sub = subs.subscribe(h.alice, h.basic.id, None).await.unwrap();
    subs.cancel(h.alice, sub.id).await.unwrap();

    let err = subs.upgrade(h.alice, sub.id, h.pro.id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidState(_)));
}

// ============================================================================
// Cancel / Renew
// ============================================================================

#[tokio::test]
async fn test_cancel_then_renew_round_trip() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;
    let sub = subs.subscribe(h.alice, h.basic.id, Some(false)).await.unwrap();
    assert!(!sub.auto_renew);

    let cancelled = subs.cancel(h.alice, sub.id).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.end_date, sub.end_date);
    assert!(!cancelled.auto_renew);

    let err = subs.cancel(h.alice, sub.id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidState(_)));

    let renewed = subs.renew(h.alice, sub.id).await.unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.end_date, Some(renewed.start_date + Duration::days(30)));
    assert!(renewed.auto_renew);

    let err = subs.renew(h.alice, sub.id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidState(_)));

    let actions: Vec<String> = h
        .store
        .audit_for_entity(&sub.id.to_string())
        .await
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            action::SUBSCRIBE,
            action::CANCEL_SUBSCRIPTION,
            action::RENEW_SUBSCRIPTION
        ]
    );

    let titles: Vec<String> = h
        .store
        .notifications_for(sub.user_id)
        .await
        .into_iter()
        .map(|n| n.title)
        .collect();
    assert_eq!(
        titles,
        vec![
            "Subscription Activated",
            "Subscription Cancelled",
            "Subscription Renewed"
        ]
    );
}

#[tokio::test]
async fn test_other_users_subscription_is_invisible() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;
    let sub = subs.subscribe(h.alice, h.basic.id, None).await.unwrap();

    for result in [
        subs.cancel(h.bob, sub.id).await,
        subs.upgrade(h.bob, sub.id, h.pro.id).await,
    ] {
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }

    // admin may act on anyone's subscription
    let cancelled = subs.cancel(h.admin, sub.id).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    let audit = h.store.audit_for_entity(&sub.id.to_string()).await;
    assert_eq!(audit.last().unwrap().actor_type, ActorType::Admin);
}

// ============================================================================
// Expiry sweep
// ============================================================================

#[tokio::test]
async fn test_expired_subscription_can_be_renewed() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;
    let sub = subs
        .subscribe(h.alice, h.basic.id, Some(false))
        .await
        .unwrap();

    let summary = h
        .billing
        .expiry
        .expire_due(OffsetDateTime::now_utc() + Duration::days(31))
        .await
        .unwrap();
    assert_eq!(summary.expired, 1);

    let current = subs.get_user_subscription(h.alice).await.unwrap().unwrap();
    assert_eq!(current.subscription.status, SubscriptionStatus::Expired);

    let renewed = subs.renew(h.alice, sub.id).await.unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
}

// ============================================================================
// Plan registry
// ============================================================================

#[tokio::test]
async fn test_plan_delete_rules() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;
    let plans = &h.billing.plans;

    let sub = subs.subscribe(h.alice, h.basic.id, None).await.unwrap();
    let err = plans.delete_plan(h.admin, h.basic.id).await.unwrap_err();
    assert!(matches!(err, BillingError::InvalidState(_)));

    subs.cancel(h.alice, sub.id).await.unwrap();
    let removal = plans.delete_plan(h.admin, h.basic.id).await.unwrap();
    assert_eq!(removal, PlanRemoval::Deactivated);

    // history still resolves its plan
    let current = subs.get_user_subscription(h.alice).await.unwrap().unwrap();
    assert_eq!(current.plan.unwrap().name, "Basic");
    assert!(plans
        .list_active_plans()
        .await
        .unwrap()
        .iter()
        .all(|p| p.id != h.basic.id));

    // and a deactivated plan cannot be renewed onto
    let err = subs.renew(h.alice, sub.id).await.unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}

#[tokio::test]
async fn test_plan_admin_operations_require_admin() {
    let h = setup().await;
    let input = NewPlan {
        name: "Copper".to_string(),
        description: "Legacy line".to_string(),
        product_type: ProductType::BroadbandCopper,
        price_cents: 2_500,
        data_quota_gb: 50,
        features: vec![],
        is_active: true,
    };
    assert!(matches!(
        h.billing.plans.create_plan(h.alice, input).await,
        Err(BillingError::Forbidden)
    ));
    assert!(matches!(
        h.billing.plans.delete_plan(h.bob, h.pro.id).await,
        Err(BillingError::Forbidden)
    ));
}

#[tokio::test]
async fn test_invariants_hold_after_lifecycle() {
    let h = setup().await;
    let subs = &h.billing.subscriptions;
    let a = subs.subscribe(h.alice, h.basic.id, None).await.unwrap();
    subs.upgrade(h.alice, a.id, h.pro.id).await.unwrap();
    let b = subs.subscribe(h.bob, h.pro.id, None).await.unwrap();
    subs.cancel(h.bob, b.id).await.unwrap();
    subs.subscribe(h.bob, h.basic.id, None).await.unwrap();

    let summary = h.billing.invariants.run_all_checks().await.unwrap();
    assert!(summary.healthy, "{:?}", summary.violations);
}
