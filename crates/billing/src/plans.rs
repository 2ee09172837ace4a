//! Plan registry
//!
//! Admin-managed catalogue of purchasable plans. Reads are open to everyone;
//! writes require the admin role and are audited.

use std::sync::Arc;

use planhub_shared::{Plan, PlanId, ProductType, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{action, entity, AuditEventBuilder, SideEffects};
use crate::store::{PlanFilter, PlanRepository, SubscriptionRepository};
use crate::users::UserService;

/// Canonical fields for a new plan
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlan {
    pub name: String,
    pub description: String,
    pub product_type: ProductType,
    pub price_cents: i64,
    pub data_quota_gb: i64,
    pub features: Vec<String>,
    pub is_active: bool,
}

/// Partial plan update; `None` leaves the field as it is
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<ProductType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_quota_gb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl PlanPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&self, plan: &mut Plan) {
        if let Some(name) = &self.name {
            plan.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            plan.description = description.clone();
        }
        if let Some(product_type) = self.product_type {
            plan.product_type = product_type;
        }
        if let Some(price_cents) = self.price_cents {
            plan.price_cents = price_cents;
        }
        if let Some(quota) = self.data_quota_gb {
            plan.data_quota_gb = quota;
        }
        if let Some(features) = &self.features {
            plan.features = features.clone();
        }
        if let Some(is_active) = self.is_active {
            plan.is_active = is_active;
        }
    }
}

/// What happened to a plan on delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRemoval {
    /// Row removed
    Deleted,
    /// Still referenced by past subscriptions, so only hidden from listings
    Deactivated,
}

fn validate_plan(plan: &Plan) -> BillingResult<()> {
    if plan.name.trim().is_empty() {
        return Err(BillingError::Validation("Plan name is required".to_string()));
    }
    if plan.price_cents < 0 {
        return Err(BillingError::Validation("Price cannot be negative".to_string()));
    }
    if plan.data_quota_gb < 0 {
        return Err(BillingError::Validation(
            "Data quota cannot be negative".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PlanService {
    plans: Arc<dyn PlanRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    users: UserService,
    effects: SideEffects,
}

impl PlanService {
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

    pub async fn create_plan(&self, caller: Option<UserId>, input: NewPlan) -> BillingResult<Plan> {
        let admin = self.users.require_admin(caller).await?;

        let now = OffsetDateTime::now_utc();
        let plan = Plan {
            id: PlanId::new(),
            name: input.name.trim().to_string(),
            description: input.description,
            product_type: input.product_type,
            price_cents: input.price_cents,
            data_quota_gb: input.data_quota_gb,
            features: input.features,
            is_active: input.is_active,
            created_by: Some(admin.user_id),
            created_at: now,
            updated_at: now,
        };
        validate_plan(&plan)?;

        self.plans.insert_plan(&plan).await?;

        tracing::info!(
            plan_id = %plan.id,
            name = %plan.name,
            price_cents = plan.price_cents,
            product_type = %plan.product_type,
            "Created plan"
        );

        self.effects
            .emit(
                AuditEventBuilder::new(action::CREATE_PLAN, entity::PLAN, plan.id)
                    .actor(&admin)
                    .details(format!("Created plan: {}", plan.name)),
                None,
            )
            .await;

        Ok(plan)
    }

    pub async fn update_plan(
        &self,
        caller: Option<UserId>,
        plan_id: PlanId,
        patch: PlanPatch,
    ) -> BillingResult<Plan> {
        let admin = self.users.require_admin(caller).await?;
        if patch.is_empty() {
            return Err(BillingError::Validation("No changes supplied".to_string()));
        }

        let mut plan = self
            .plans
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))?;

        patch.apply(&mut plan);
        plan.updated_at = OffsetDateTime::now_utc();
        validate_plan(&plan)?;

        self.plans.update_plan(&plan).await?;

        tracing::info!(plan_id = %plan_id, "Updated plan");

        let changes = serde_json::to_string(&patch)
            .map_err(|e| BillingError::Internal(format!("Failed to encode changes: {}", e)))?;
        self.effects
            .emit(
                AuditEventBuilder::new(action::UPDATE_PLAN, entity::PLAN, plan_id)
                    .actor(&admin)
                    .details(format!("Updated plan with changes: {}", changes)),
                None,
            )
            .await;

        Ok(plan)
    }

    /// Remove a plan
    ///
    /// Blocked while any active subscription uses it. A plan only referenced by
    /// cancelled or expired subscriptions is deactivated so their history keeps
    /// resolving; an unreferenced plan is deleted outright.
    pub async fn delete_plan(
        &self,
        caller: Option<UserId>,
        plan_id: PlanId,
    ) -> BillingResult<PlanRemoval> {
        let admin = self.users.require_admin(caller).await?;

        let mut plan = self
            .plans
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))?;

        let refs = self.subscriptions.plan_references(plan_id).await?;
        if refs.active > 0 {
            return Err(BillingError::InvalidState(format!(
                "Cannot delete plan with active subscriptions ({} active)",
                refs.active
            )));
        }

        let (removal, audit_action, details) = if refs.total > 0 {
            plan.is_active = false;
            plan.updated_at = OffsetDateTime::now_utc();
            self.plans.update_plan(&plan).await?;
            (
                PlanRemoval::Deactivated,
                action::DEACTIVATE_PLAN,
                format!(
                    "Deactivated plan {} ({} past subscriptions)",
                    plan.name, refs.total
                ),
            )
        } else {
            if !self.plans.delete_unreferenced_plan(plan_id).await? {
                // someone subscribed or removed it since the reference count
                return Err(match self.plans.get_plan(plan_id).await? {
                    Some(_) => BillingError::ConcurrentModification(format!(
                        "Plan {} gained subscriptions while being removed",
                        plan_id
                    )),
                    None => BillingError::NotFound(format!("Plan {} not found", plan_id)),
                });
            }
            (
                PlanRemoval::Deleted,
                action::DELETE_PLAN,
                "Deleted plan".to_string(),
            )
        };

        tracing::info!(plan_id = %plan_id, removal = ?removal, "Removed plan");

        self.effects
            .emit(
                AuditEventBuilder::new(audit_action, entity::PLAN, plan_id)
                    .actor(&admin)
                    .details(details),
                None,
            )
            .await;

        Ok(removal)
    }

    /// Active plans, cheapest first
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        self.plans.list_plans(PlanFilter::active()).await
    }

    /// Active plans of one product line, cheapest first
    pub async fn list_plans_by_type(&self, product_type: ProductType) -> BillingResult<Vec<Plan>> {
        self.plans
            .list_plans(PlanFilter {
                active_only: true,
                product_type: Some(product_type),
            })
            .await
    }

    /// Every plan including inactive ones
    pub async fn list_all_plans(&self, caller: Option<UserId>) -> BillingResult<Vec<Plan>> {
        self.users.require_admin(caller).await?;
        self.plans.list_plans(PlanFilter::default()).await
    }

    pub async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Option<Plan>> {
        self.plans.get_plan(plan_id).await
    }
}
