//! netbill Enforcement - keeps router entitlement in line with billing
//!
//! Consumes [`EntitlementChange`](netbill_common::EntitlementChange) events and,
//! for each, points the customer's PPP secret at the router profile for the
//! desired class, then kicks the customer's active sessions so the new profile
//! takes effect. Failed attempts are retried with exponential backoff; actions
//! that exhaust their attempts land in the [`FailureLog`].

pub mod engine;
pub mod failures;
pub mod retry;

pub use engine::{EnforcementEngine, EnforcementOutcome};
pub use failures::{FailureLog, FailureRecord};
pub use retry::RetryPolicy;

use netbill_common::{Classify, CustomerId, ErrorKind, ProfileId, RepositoryError};
use netbill_routeros::RouterError;
use thiserror::Error;

/// Enforcement errors
#[derive(Debug, Error)]
pub enum EnforcementError {
    #[error("customer {0} not found")]
    CustomerNotFound(CustomerId),

    #[error("profile {0} not found")]
    ProfileNotFound(ProfileId),

    #[error("router error: {0}")]
    Router(#[from] RouterError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl Classify for EnforcementError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::CustomerNotFound(_) | Self::ProfileNotFound(_) => ErrorKind::NotFound,
            Self::Router(e) => e.kind(),
            Self::Repository(e) => e.kind(),
        }
    }
}

impl EnforcementError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }
}

pub type Result<T> = std::result::Result<T, EnforcementError>;
