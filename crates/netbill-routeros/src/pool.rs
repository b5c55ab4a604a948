//! Named router sessions
//!
//! Sessions are created on first use from the configuration repository and
//! live for the life of the process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::credentials::{SecretStore, SessionConfigRepository};
use crate::session::{Connector, RouterSession, TcpConnector};
use crate::{Result, RouterApi, RouterError, RouterResolver};

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool of sessions keyed by router session name
pub struct RouterPool<C: Connector = TcpConnector> {
    configs: Arc<dyn SessionConfigRepository>,
    secrets: Arc<dyn SecretStore>,
    connector: Arc<C>,
    command_timeout: Duration,
    sessions: DashMap<String, Arc<RouterSession<C>>>,
}

impl<C: Connector> RouterPool<C> {
    pub fn new(
        configs: Arc<dyn SessionConfigRepository>,
        secrets: Arc<dyn SecretStore>,
        connector: C,
        command_timeout: Duration,
    ) -> Self {
        Self {
            configs,
            secrets,
            connector: Arc::new(connector),
            command_timeout,
            sessions: DashMap::new(),
        }
    }

    /// Session for `name`, created if this is the first request
    pub fn session(&self, name: &str) -> Result<Arc<RouterSession<C>>> {
        if let Some(session) = self.sessions.get(name) {
            return Ok(session.value().clone());
        }

        let config = self
            .configs
            .get(name)
            .ok_or_else(|| RouterError::UnknownSession(name.to_string()))?;
        config.validate()?;

        let session = self
            .sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(session = %name, "creating router session");
                Arc::new(RouterSession::new(
                    config,
                    self.secrets.clone(),
                    self.connector.clone(),
                    self.command_timeout,
                ))
            })
            .value()
            .clone();
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every open connection (shutdown)
    pub async fn disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            session.disconnect().await;
        }
    }
}

#[async_trait]
impl<C: Connector> RouterResolver for RouterPool<C> {
    async fn resolve(&self, router: &str) -> Result<Arc<dyn RouterApi>> {
        let session: Arc<dyn RouterApi> = self.session(router)?;
        Ok(session)
    }
}
