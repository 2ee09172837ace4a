//! User profiles and caller resolution
//!
//! Identity comes from outside the crate; every operation receives the caller
//! as `Option<UserId>`. `None` means the request is unauthenticated.

use std::sync::Arc;

use planhub_shared::{UserId, UserProfile, UserRole};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{action, entity, AuditEventBuilder, SideEffects};
use crate::store::UserDirectory;

/// Fields for a new profile
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: UserRole,
}

#[derive(Clone)]
pub struct UserService {
    directory: Arc<dyn UserDirectory>,
    effects: SideEffects,
}

impl UserService {
    pub fn new(directory: Arc<dyn UserDirectory>, effects: SideEffects) -> Self {
        Self { directory, effects }
    }

    /// Create the caller's profile
    pub async fn create_profile(
        &self,
        caller: Option<UserId>,
        input: NewProfile,
    ) -> BillingResult<UserProfile> {
        let user_id = caller.ok_or(BillingError::NotAuthenticated)?;

        let name = input.name.trim();
        if name.is_empty() {
            return Err(BillingError::Validation("Name is required".to_string()));
        }
        let email = input.email.trim();
        if !email.contains('@') {
            return Err(BillingError::Validation(format!("Invalid email: {}", email)));
        }

        let profile = UserProfile {
            user_id,
            role: input.role,
            name: name.to_string(),
            email: email.to_string(),
            phone: input.phone.filter(|p| !p.trim().is_empty()),
            created_at: OffsetDateTime::now_utc(),
        };
        self.directory.insert_profile(&profile).await?;

        tracing::info!(user_id = %user_id, role = %profile.role, "Created user profile");

        self.effects
            .emit(
                AuditEventBuilder::new(action::CREATE_PROFILE, entity::USER_PROFILE, user_id)
                    .actor(&profile)
                    .details(format!("Created profile with role: {}", profile.role)),
                None,
            )
            .await;

        Ok(profile)
    }

    /// The caller's profile, or `None` when unauthenticated or not registered
    pub async fn get_profile(&self, caller: Option<UserId>) -> BillingResult<Option<UserProfile>> {
        match caller {
            Some(user_id) => self.directory.get_profile(user_id).await,
            None => Ok(None),
        }
    }

    pub async fn is_admin(&self, caller: Option<UserId>) -> BillingResult<bool> {
        Ok(self
            .get_profile(caller)
            .await?
            .is_some_and(|profile| profile.is_admin()))
    }

    /// Resolve a caller to a registered profile
    pub async fn authenticate(&self, caller: Option<UserId>) -> BillingResult<UserProfile> {
        let user_id = caller.ok_or(BillingError::NotAuthenticated)?;
        self.directory
            .get_profile(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))
    }

    /// Resolve a caller and require the admin role
    pub async fn require_admin(&self, caller: Option<UserId>) -> BillingResult<UserProfile> {
        let profile = self.authenticate(caller).await?;
        if !profile.is_admin() {
            tracing::debug!(user_id = %profile.user_id, "Admin access denied");
            return Err(BillingError::Forbidden);
        }
        Ok(profile)
    }
}
