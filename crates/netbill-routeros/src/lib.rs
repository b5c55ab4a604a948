//! netbill RouterOS session client
//!
//! Drives MikroTik routers over the RouterOS API (TCP 8728) to switch a PPP
//! subscriber between service profiles and kick their active session.
//!
//! ## Features
//!
//! - **Wire format**: length-prefixed words and `!re`/`!done`/`!trap` replies
//! - **Sessions**: lazy connect, login (plain and legacy MD5 challenge), reuse
//! - **Single flight**: one outstanding command per connection
//! - **Credentials**: AES-256-GCM sealed passwords, revealed only at connect time
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐  resolve(name)  ┌──────────────┐  Command  ┌──────────┐
//! │ Enforcement engine │ ──────────────► │  RouterPool  │ ────────► │ Session  │──► TCP
//! └────────────────────┘                 └──────────────┘           └──────────┘
//!                                          │ SessionConfigRepository
//!                                          │ SecretStore
//! ```

pub mod credentials;
pub mod pool;
pub mod protocol;
pub mod session;

pub use credentials::{
    AeadSecretStore, EncryptedSecret, InMemorySessionConfigs, SecretStore, SessionConfig,
    SessionConfigRepository, SessionCredentials,
};
pub use pool::RouterPool;
pub use protocol::{Attributes, Command, Response};
pub use session::{Connector, RouterSession, SessionState, TcpConnector};

use async_trait::async_trait;
use netbill_common::{Classify, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Router client errors
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("router session {0} not configured")]
    UnknownSession(String),

    #[error("incomplete credentials for router session {0}")]
    IncompleteCredentials(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("router trap: {message}")]
    Trap {
        message: String,
        category: Option<u32>,
    },

    #[error("router closed the session: {0}")]
    Fatal(String),

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for RouterError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSession(_) => ErrorKind::NotFound,
            Self::IncompleteCredentials(_) | Self::Credential(_) => ErrorKind::Validation,
            Self::Connect { .. } | Self::Timeout(_) | Self::Fatal(_) | Self::Io(_) => {
                ErrorKind::Connectivity
            }
            Self::LoginRejected(_) | Self::Trap { .. } | Self::Malformed(_) => ErrorKind::Protocol,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// Default RouterOS API port
pub const API_PORT: u16 = 8728;

/// PPP operations enforcement needs from a router
#[async_trait]
pub trait RouterApi: Send + Sync {
    /// Point the PPP secret `secret` at router profile `profile`
    async fn set_secret_profile(&self, secret: &str, profile: &str) -> Result<()>;

    /// Remove every active PPP session of `secret`; returns how many were removed.
    ///
    /// A failed remove does not stop the rest; the call fails only when
    /// sessions were listed and none could be removed.
    async fn remove_active_sessions(&self, secret: &str) -> Result<usize>;
}

/// Maps a router session name to a live client
#[async_trait]
pub trait RouterResolver: Send + Sync {
    async fn resolve(&self, router: &str) -> Result<Arc<dyn RouterApi>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(RouterError::UnknownSession("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            RouterError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(
            RouterError::Trap { message: "no such item".into(), category: None }.kind(),
            ErrorKind::Protocol
        );
    }
}
