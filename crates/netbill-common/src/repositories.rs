//! Repositories - Persistence abstraction for customers and profiles
//!
//! The production system keeps these in a relational store; the in-memory
//! implementations back tests and single-node deployments seeded from config.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::domain::{Customer, CustomerId, Profile, ProfileId};
use crate::error::{Classify, ErrorKind};

/// Repository result type
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Repository errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

impl Classify for RepositoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::StorageError(_) => ErrorKind::Internal,
        }
    }
}

/// Customer repository
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn get(&self, id: CustomerId) -> RepoResult<Customer>;
    async fn save(&self, customer: &Customer) -> RepoResult<()>;
    async fn list(&self) -> RepoResult<Vec<Customer>>;
}

/// Profile repository
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn get(&self, id: ProfileId) -> RepoResult<Profile>;
    async fn save(&self, profile: &Profile) -> RepoResult<()>;
    async fn delete(&self, id: ProfileId) -> RepoResult<()>;
    async fn list(&self) -> RepoResult<Vec<Profile>>;
}

/// In-memory customer repository
#[derive(Default)]
pub struct InMemoryCustomerRepository {
    customers: RwLock<HashMap<CustomerId, Customer>>,
}

impl InMemoryCustomerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a repository pre-populated with `customers`
    pub fn with_customers(customers: impl IntoIterator<Item = Customer>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.customers.write();
            for c in customers {
                map.insert(c.id, c);
            }
        }
        repo
    }
}

#[async_trait]
impl CustomerRepository for InMemoryCustomerRepository {
    async fn get(&self, id: CustomerId) -> RepoResult<Customer> {
        self.customers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("customer {}", id)))
    }

    async fn save(&self, customer: &Customer) -> RepoResult<()> {
        self.customers.write().insert(customer.id, customer.clone());
        Ok(())
    }

    async fn list(&self) -> RepoResult<Vec<Customer>> {
        let mut all: Vec<_> = self.customers.read().values().cloned().collect();
        all.sort_by_key(|c| c.id);
        Ok(all)
    }
}

/// In-memory profile repository
#[derive(Default)]
pub struct InMemoryProfileRepository {
    profiles: RwLock<HashMap<ProfileId, Profile>>,
}

impl InMemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a repository pre-populated with `profiles`
    pub fn with_profiles(profiles: impl IntoIterator<Item = Profile>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.profiles.write();
            for p in profiles {
                map.insert(p.id, p);
            }
        }
        repo
    }
}

#[async_trait]
impl ProfileRepository for InMemoryProfileRepository {
    async fn get(&self, id: ProfileId) -> RepoResult<Profile> {
        self.profiles
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("profile {}", id)))
    }

    async fn save(&self, profile: &Profile) -> RepoResult<()> {
        self.profiles.write().insert(profile.id, profile.clone());
        Ok(())
    }

    async fn delete(&self, id: ProfileId) -> RepoResult<()> {
        self.profiles
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(format!("profile {}", id)))
    }

    async fn list(&self) -> RepoResult<Vec<Profile>> {
        let mut all: Vec<_> = self.profiles.read().values().cloned().collect();
        all.sort_by_key(|p| p.id);
        Ok(all)
    }
}
