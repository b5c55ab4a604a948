//! Profile catalog - admin operations over service profiles
//!
//! Enforces the profile invariants: both router profile names present, a
//! non-negative price, and no deletion while an active customer uses the profile.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::domain::{Profile, ProfileId};
use crate::error::{Classify, ErrorKind};
use crate::repositories::{CustomerRepository, ProfileRepository, RepositoryError};

/// Catalog errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("field {0} is required")]
    MissingField(&'static str),

    #[error("price must not be negative")]
    NegativePrice,

    #[error("profile {0} is used by {1} active customer(s)")]
    InUse(ProfileId, usize),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl Classify for CatalogError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingField(_) | Self::NegativePrice => ErrorKind::Validation,
            Self::InUse(..) => ErrorKind::Conflict,
            Self::Repository(e) => e.kind(),
        }
    }
}

/// Profile fields supplied by the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub name: String,
    pub price_monthly: Decimal,
    #[serde(default)]
    pub speed_label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub router_profile_normal: String,
    pub router_profile_isolation: String,
}

impl ProfileDraft {
    fn into_profile(self, id: ProfileId) -> Result<Profile, CatalogError> {
        let name = required("name", &self.name)?;
        let normal = required("router_profile_normal", &self.router_profile_normal)?;
        let isolation = required("router_profile_isolation", &self.router_profile_isolation)?;
        if self.price_monthly < Decimal::ZERO {
            return Err(CatalogError::NegativePrice);
        }

        Ok(Profile {
            id,
            name,
            price_monthly: self.price_monthly,
            speed_label: self.speed_label,
            description: self.description,
            router_profile_normal: normal,
            router_profile_isolation: isolation,
        })
    }
}

fn required(field: &'static str, value: &str) -> Result<String, CatalogError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CatalogError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

/// Admin-facing profile operations
pub struct ProfileCatalog {
    profiles: Arc<dyn ProfileRepository>,
    customers: Arc<dyn CustomerRepository>,
    next_id: AtomicU64,
}

impl ProfileCatalog {
    pub fn new(profiles: Arc<dyn ProfileRepository>, customers: Arc<dyn CustomerRepository>) -> Self {
        Self {
            profiles,
            customers,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a profile, allocating an id above any existing one
    pub async fn create(&self, draft: ProfileDraft) -> Result<Profile, CatalogError> {
        let max_existing = self
            .profiles
            .list()
            .await?
            .iter()
            .map(|p| p.id.0)
            .max()
            .unwrap_or(0);
        self.next_id.fetch_max(max_existing + 1, Ordering::SeqCst);
        let id = ProfileId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let profile = draft.into_profile(id)?;
        self.profiles.save(&profile).await?;
        info!(profile_id = %id, name = %profile.name, "profile created");
        Ok(profile)
    }

    /// Replace an existing profile's fields
    pub async fn update(&self, id: ProfileId, draft: ProfileDraft) -> Result<Profile, CatalogError> {
        self.profiles.get(id).await?;
        let profile = draft.into_profile(id)?;
        self.profiles.save(&profile).await?;
        info!(profile_id = %id, "profile updated");
        Ok(profile)
    }

    /// Delete a profile no active customer references
    pub async fn delete(&self, id: ProfileId) -> Result<(), CatalogError> {
        let users = self
            .customers
            .list()
            .await?
            .iter()
            .filter(|c| c.active && c.profile_id == id)
            .count();
        if users > 0 {
            return Err(CatalogError::InUse(id, users));
        }
        self.profiles.delete(id).await?;
        info!(profile_id = %id, "profile deleted");
        Ok(())
    }
}
