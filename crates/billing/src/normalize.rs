//! Plan payload normalization
//!
//! Plans arrive from clients that spell fields differently (`Name`/`name`,
//! `Price`/`price`, `type`/`productType`, `quota`/`dataQuota`,
//! `Status: "Active"`/`isActive`). Everything is folded into one canonical
//! shape here, before any service sees it. Decimal prices become integer
//! cents.

use planhub_shared::ProductType;
use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::plans::{NewPlan, PlanPatch};

/// Loosely-typed plan fields as sent by clients
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanPayload {
    #[serde(default, alias = "Name")]
    pub name: Option<String>,

    #[serde(default, alias = "Description")]
    pub description: Option<String>,

    #[serde(default, rename = "productType", alias = "product_type", alias = "type")]
    pub product_type: Option<String>,

    #[serde(default, alias = "Price")]
    pub price: Option<f64>,

    #[serde(default, rename = "dataQuota", alias = "data_quota", alias = "quota")]
    pub data_quota: Option<i64>,

    #[serde(default, alias = "Features")]
    pub features: Option<Vec<String>>,

    #[serde(default, rename = "isActive", alias = "is_active")]
    pub is_active: Option<bool>,

    #[serde(default, rename = "Status", alias = "status")]
    pub status: Option<String>,
}

impl PlanPayload {
    pub fn from_json(value: serde_json::Value) -> BillingResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| BillingError::Validation(format!("Invalid plan payload: {}", e)))
    }

    /// Canonical fields for a new plan; name and price are required
    pub fn into_new_plan(self) -> BillingResult<NewPlan> {
        let is_active = self.resolve_active()?.unwrap_or(true);
        let name = self
            .name
            .ok_or_else(|| BillingError::Validation("Plan name is required".to_string()))?;
        let price = self
            .price
            .ok_or_else(|| BillingError::Validation("Plan price is required".to_string()))?;

        Ok(NewPlan {
            name,
            description: self.description.unwrap_or_default(),
            product_type: parse_product_type(self.product_type.as_deref())?.unwrap_or_default(),
            price_cents: price_to_cents(price)?,
            data_quota_gb: self.data_quota.unwrap_or(0),
            features: self.features.unwrap_or_default(),
            is_active,
        })
    }

    /// Canonical partial update; absent fields stay untouched
    pub fn into_patch(self) -> BillingResult<PlanPatch> {
        let is_active = self.resolve_active()?;
        Ok(PlanPatch {
            name: self.name,
            description: self.description,
            product_type: parse_product_type(self.product_type.as_deref())?,
            price_cents: self.price.map(price_to_cents).transpose()?,
            data_quota_gb: self.data_quota,
            features: self.features,
            is_active,
        })
    }

    /// `isActive` wins over the legacy `Status` string
    fn resolve_active(&self) -> BillingResult<Option<bool>> {
        if let Some(active) = self.is_active {
            return Ok(Some(active));
        }
        match self.status.as_deref().map(str::trim) {
            None => Ok(None),
            Some(s) if s.eq_ignore_ascii_case("active") => Ok(Some(true)),
            Some(s) if s.eq_ignore_ascii_case("inactive") => Ok(Some(false)),
            Some(other) => Err(BillingError::Validation(format!(
                "Invalid plan status: {}",
                other
            ))),
        }
    }
}

fn parse_product_type(raw: Option<&str>) -> BillingResult<Option<ProductType>> {
    raw.map(|s| s.parse::<ProductType>().map_err(BillingError::from))
        .transpose()
}

/// Convert a decimal price to integer cents
///
/// Rejects negative, non-finite and sub-cent amounts.
pub fn price_to_cents(price: f64) -> BillingResult<i64> {
    if !price.is_finite() {
        return Err(BillingError::Validation("Price must be a finite number".to_string()));
    }
    if price < 0.0 {
        return Err(BillingError::Validation("Price cannot be negative".to_string()));
    }

    let cents = (price * 100.0).round();
    if (cents - price * 100.0).abs() > 1e-6 {
        return Err(BillingError::Validation(format!(
            "Price {} has more precision than one cent",
            price
        )));
    }
    // i64::MAX as f64 rounds up to 2^63, which does not fit
    if cents >= i64::MAX as f64 {
        return Err(BillingError::Validation("Price is too large".to_string()));
    }
    Ok(cents as i64)
}
