//! PostgreSQL storage adapter

use async_trait::async_trait;
use planhub_shared::{
    AuditRecord, Notification, Plan, PlanId, Subscription, SubscriptionId, UserId, UserProfile,
};
use sqlx::PgPool;
use time::OffsetDateTime;

use super::{
    AuditSink, NotificationSink, PlanFilter, PlanReferences, PlanRepository,
    SubscriptionRepository, UserDirectory,
};
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::plan_unavailable;

/// Partial unique index that keeps one active subscription per user
const ONE_ACTIVE_INDEX: &str = "uq_subscriptions_one_active_per_user";

macro_rules! plan_columns {
    () => {
        "id, name, description, product_type, price_cents, data_quota_gb, features, \
         is_active, created_by, created_at, updated_at"
    };
}

macro_rules! subscription_columns {
    () => {
        "id, user_id, plan_id, status, start_date, end_date, auto_renew, data_used_gb, \
         created_at, updated_at, version"
    };
}

/// Store backed by a Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Lock the plan row for the rest of `tx`, returning its `is_active` flag
async fn lock_plan(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    plan_id: PlanId,
) -> BillingResult<Option<bool>> {
    let is_active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM plans WHERE id = $1 FOR SHARE")
        .bind(plan_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(is_active)
}

fn map_subscription_write(err: sqlx::Error) -> BillingError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.constraint() == Some(ONE_ACTIVE_INDEX) {
            return BillingError::AlreadySubscribed;
        }
    }
    err.into()
}

#[async_trait]
impl PlanRepository for PgStore {
    async fn get_plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(concat!(
            "SELECT ",
            plan_columns!(),
            " FROM plans WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    async fn list_plans(&self, filter: PlanFilter) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(concat!(
            "SELECT ",
            plan_columns!(),
            r#" FROM plans
            WHERE ($1 = FALSE OR is_active = TRUE)
              AND ($2::VARCHAR IS NULL OR product_type = $2)
            ORDER BY price_cents ASC, name ASC"#
        ))
        .bind(filter.active_only)
        .bind(filter.product_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO plans (id, name, description, product_type, price_cents, data_quota_gb,
                               features, is_active, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.product_type)
        .bind(plan.price_cents)
        .bind(plan.data_quota_gb)
        .bind(&plan.features)
        .bind(plan.is_active)
        .bind(plan.created_by)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::AlreadyExists(format!("Plan {}", plan.id)));
        }
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE plans
            SET name = $2, description = $3, product_type = $4, price_cents = $5,
                data_quota_gb = $6, features = $7, is_active = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.product_type)
        .bind(plan.price_cents)
        .bind(plan.data_quota_gb)
        .bind(&plan.features)
        .bind(plan.is_active)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Plan {} not found", plan.id)));
        }
        Ok(())
    }

    async fn delete_unreferenced_plan(&self, id: PlanId) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        // active subscription writes hold FOR SHARE on this row until they commit
        let locked: Option<PlanId> =
            sqlx::query_scalar("SELECT id FROM plans WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            DELETE FROM plans
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM subscriptions WHERE plan_id = $1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SubscriptionRepository for PgStore {
    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    async fn find_active_for_user(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM subscriptions WHERE user_id = $1 AND status = 'active'"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    async fn list_for_user(&self, user_id: UserId) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    async fn list_all(&self) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM subscriptions ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    async fn list_due(&self, as_of: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(concat!(
            "SELECT ",
            subscription_columns!(),
            r#" FROM subscriptions
            WHERE status = 'active' AND end_date <= $1
            ORDER BY end_date ASC"#
        ))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    async fn plan_references(&self, plan_id: PlanId) -> BillingResult<PlanReferences> {
        let (active, total): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'active'), COUNT(*)
            FROM subscriptions
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(PlanReferences { active, total })
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        if subscription.is_active() && lock_plan(&mut tx, subscription.plan_id).await? != Some(true)
        {
            return Err(plan_unavailable(subscription.plan_id));
        }

        let stored = sqlx::query_as::<_, Subscription>(concat!(
            r#"INSERT INTO subscriptions (id, user_id, plan_id, status, start_date, end_date,
                                       auto_renew, data_used_gb, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING "#,
            subscription_columns!()
        ))
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(subscription.plan_id)
        .bind(subscription.status)
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.auto_renew)
        .bind(subscription.data_used_gb)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .bind(subscription.version)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_subscription_write)?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        if subscription.is_active() && lock_plan(&mut tx, subscription.plan_id).await?.is_none() {
            return Err(BillingError::NotFound(format!(
                "Plan {} not found",
                subscription.plan_id
            )));
        }

        let updated = sqlx::query_as::<_, Subscription>(concat!(
            r#"UPDATE subscriptions
            SET plan_id = $3, status = $4, start_date = $5, end_date = $6, auto_renew = $7,
                data_used_gb = $8, updated_at = $9, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING "#,
            subscription_columns!()
        ))
        .bind(subscription.id)
        .bind(subscription.version)
        .bind(subscription.plan_id)
        .bind(subscription.status)
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.auto_renew)
        .bind(subscription.data_used_gb)
        .bind(subscription.updated_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_subscription_write)?;

        if let Some(updated) = updated {
            tx.commit().await?;
            return Ok(updated);
        }

        // no row matched: either gone or someone else wrote first
        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM subscriptions WHERE id = $1")
                .bind(subscription.id)
                .fetch_optional(&mut *tx)
                .await?;

        match current {
            Some(version) => Err(BillingError::ConcurrentModification(format!(
                "Subscription {} is at version {}, expected {}",
                subscription.id, version, subscription.version
            ))),
            None => Err(BillingError::NotFound(format!(
                "Subscription {} not found",
                subscription.id
            ))),
        }
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn get_profile(&self, user_id: UserId) -> BillingResult<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT user_id, role, name, email, phone, created_at
            FROM user_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    async fn insert_profile(&self, profile: &UserProfile) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, role, name, email, phone, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(profile.user_id)
        .bind(profile.role)
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(&profile.phone)
        .bind(profile.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::AlreadyExists("Profile already exists".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn append_audit(&self, record: &AuditRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, actor_id, actor_type, action, entity_type, entity_id,
                                    details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.actor_id)
        .bind(record.actor_type)
        .bind(&record.action)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.details)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl NotificationSink for PgStore {
    async fn append_notification(&self, notification: &Notification) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, title, message, notification_type, is_read,
                                       created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.notification_type)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
