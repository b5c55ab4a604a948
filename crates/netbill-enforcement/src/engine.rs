//! Enforcement engine
//!
//! Changes for one customer run strictly in emission order: each action waits
//! on the completion signal of the one submitted before it. Different customers
//! run concurrently.

use chrono::Utc;
use dashmap::DashMap;
use netbill_common::{
    dispatch, Classify, CustomerId, CustomerRepository, EntitlementChange, ErrorKind, Notifier,
    NoopNotifier, ProfileRepository, RepositoryError,
};
use netbill_routeros::RouterResolver;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::failures::{FailureLog, FailureRecord};
use crate::retry::RetryPolicy;
use crate::{EnforcementError, Result};

/// Terminal result of one enforcement action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementOutcome {
    Applied {
        attempts: u32,
        /// Active sessions kicked (best effort)
        sessions_removed: usize,
    },
    Failed {
        attempts: u32,
        kind: ErrorKind,
        error: String,
    },
}

impl EnforcementOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Applied { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Enforcement engine
pub struct EnforcementEngine {
    customers: Arc<dyn CustomerRepository>,
    profiles: Arc<dyn ProfileRepository>,
    routers: Arc<dyn RouterResolver>,
    policy: RetryPolicy,
    failures: Arc<FailureLog>,
    notifier: Arc<dyn Notifier>,
    /// Completion signal of the last action submitted per customer
    chains: DashMap<CustomerId, (u64, oneshot::Receiver<()>)>,
    sequence: AtomicU64,
}

impl EnforcementEngine {
    pub fn new(
        customers: Arc<dyn CustomerRepository>,
        profiles: Arc<dyn ProfileRepository>,
        routers: Arc<dyn RouterResolver>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            customers,
            profiles,
            routers,
            policy,
            failures: Arc::new(FailureLog::default()),
            notifier: Arc::new(NoopNotifier),
            chains: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_failure_log(mut self, failures: Arc<FailureLog>) -> Self {
        self.failures = failures;
        self
    }

    pub fn failures(&self) -> Arc<FailureLog> {
        self.failures.clone()
    }

    /// Consume changes until the channel closes, then wait for in-flight actions
    pub async fn run(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<EntitlementChange>) {
        info!(max_attempts = self.policy.max_attempts, "enforcement engine started");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Some(change) => {
                        tasks.spawn(self.sequenced(change));
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "enforcement task aborted");
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("enforcement engine stopped");
    }

    /// Run one change in the background, after earlier changes for the same customer
    pub fn submit(self: &Arc<Self>, change: EntitlementChange) -> JoinHandle<EnforcementOutcome> {
        tokio::spawn(self.sequenced(change))
    }

    fn sequenced(
        self: &Arc<Self>,
        change: EntitlementChange,
    ) -> impl Future<Output = EnforcementOutcome> + Send + 'static {
        let (done_tx, done_rx) = oneshot::channel();
        let generation = self.sequence.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .chains
            .insert(change.customer_id, (generation, done_rx))
            .map(|(_, rx)| rx);
        let engine = Arc::clone(self);

        async move {
            if let Some(previous) = previous {
                // a dropped sender means the earlier action is gone either way
                let _ = previous.await;
            }
            let outcome = engine.apply(&change).await;
            let _ = done_tx.send(());
            engine
                .chains
                .remove_if(&change.customer_id, |_, (g, _)| *g == generation);
            outcome
        }
    }

    /// Apply one change with retries; does not wait for other actions
    pub async fn apply(&self, change: &EntitlementChange) -> EnforcementOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(change).await {
                Ok(sessions_removed) => {
                    metrics::counter!("netbill_enforcement_total", "outcome" => "applied").increment(1);
                    info!(
                        customer_id = %change.customer_id,
                        class = %change.class,
                        attempts = attempt,
                        sessions_removed,
                        "entitlement applied"
                    );
                    return EnforcementOutcome::Applied {
                        attempts: attempt,
                        sessions_removed,
                    };
                }
                Err(e) if e.is_retryable() && self.policy.allows_retry_after(attempt) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        customer_id = %change.customer_id,
                        class = %change.class,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "enforcement attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return self.give_up(change, attempt, e),
            }
        }
    }

    fn give_up(&self, change: &EntitlementChange, attempts: u32, e: EnforcementError) -> EnforcementOutcome {
        let kind = e.kind();
        let message = e.to_string();
        metrics::counter!("netbill_enforcement_total", "outcome" => "failed").increment(1);
        error!(
            customer_id = %change.customer_id,
            class = %change.class,
            attempts,
            kind = %kind,
            error = %message,
            "enforcement failed"
        );

        self.failures.record(FailureRecord {
            customer_id: change.customer_id,
            invoice_id: change.invoice_id,
            class: change.class,
            attempts,
            last_error: message.clone(),
            error_kind: kind,
            failed_at: Utc::now(),
        });
        dispatch(
            self.notifier.clone(),
            format!(
                "Enforcement failed\nCustomer: #{}\nTarget: {}\nAttempts: {}\nError: {}",
                change.customer_id, change.class, attempts, message
            ),
        );

        EnforcementOutcome::Failed {
            attempts,
            kind,
            error: message,
        }
    }

    async fn attempt(&self, change: &EntitlementChange) -> Result<usize> {
        let customer = self.customers.get(change.customer_id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => EnforcementError::CustomerNotFound(change.customer_id),
            other => EnforcementError::Repository(other),
        })?;
        let profile = self.profiles.get(customer.profile_id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => EnforcementError::ProfileNotFound(customer.profile_id),
            other => EnforcementError::Repository(other),
        })?;
        let target = profile.router_profile(change.class);

        let router = self.routers.resolve(&customer.router).await?;
        router.set_secret_profile(&customer.secret_name, target).await?;
        debug!(
            customer_id = %customer.id,
            secret = %customer.secret_name,
            profile = %target,
            "secret profile set"
        );

        match router.remove_active_sessions(&customer.secret_name).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                warn!(
                    customer_id = %customer.id,
                    secret = %customer.secret_name,
                    error = %e,
                    "could not remove active sessions"
                );
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use netbill_common::{
        ChangeReason, Customer, InMemoryCustomerRepository, InMemoryProfileRepository, InvoiceId,
        NetworkClass, NotifyError, Profile, ProfileId,
    };
    use netbill_routeros::{RouterApi, RouterError};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    /// Router that fails `set` a configured number of times
    #[derive(Default)]
    struct MockRouter {
        set_failures: AtomicU32,
        remove_fails: AtomicBool,
        /// Delay applied to `set` for the isolation profile
        slow_isolation: AtomicBool,
        sets: Mutex<Vec<(String, String)>>,
        set_calls: AtomicU32,
    }

    #[async_trait]
    impl RouterApi for MockRouter {
        async fn set_secret_profile(&self, secret: &str, profile: &str) -> netbill_routeros::Result<()> {
            self.set_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .set_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RouterError::Timeout(Duration::from_secs(10)));
            }
            if profile == "isolir" && self.slow_isolation.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            self.sets.lock().push((secret.to_string(), profile.to_string()));
            Ok(())
        }

        async fn remove_active_sessions(&self, _secret: &str) -> netbill_routeros::Result<usize> {
            if self.remove_fails.load(Ordering::SeqCst) {
                return Err(RouterError::Trap {
                    message: "no such item".into(),
                    category: None,
                });
            }
            Ok(1)
        }
    }

    struct MockResolver(Arc<MockRouter>);

    #[async_trait]
    impl RouterResolver for MockResolver {
        async fn resolve(&self, router: &str) -> netbill_routeros::Result<Arc<dyn RouterApi>> {
            if router == "core-1" {
                Ok(self.0.clone())
            } else {
                Err(RouterError::UnknownSession(router.to_string()))
            }
        }
    }

    struct ChannelNotifier(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn send(&self, message: &str) -> std::result::Result<(), NotifyError> {
            let _ = self.0.send(message.to_string());
            Ok(())
        }
    }

    fn customer(id: u64, router: &str, profile: u64) -> Customer {
        Customer {
            id: CustomerId(id),
            name: format!("cust-{}", id),
            phone: None,
            email: None,
            profile_id: ProfileId(profile),
            service_number: format!("SN-{:03}", id),
            router: router.into(),
            secret_name: format!("pppoe-{}", id),
            active: true,
        }
    }

    fn engine(router: Arc<MockRouter>) -> (Arc<EnforcementEngine>, mpsc::UnboundedReceiver<String>) {
        let customers = InMemoryCustomerRepository::with_customers([
            customer(1, "core-1", 1),
            customer(2, "edge-9", 1),
            customer(3, "core-1", 42),
        ]);
        let profiles = InMemoryProfileRepository::with_profiles([Profile {
            id: ProfileId(1),
            name: "Home 20M".into(),
            price_monthly: dec!(150000),
            speed_label: None,
            description: None,
            router_profile_normal: "home-20m".into(),
            router_profile_isolation: "isolir".into(),
        }]);
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = EnforcementEngine::new(
            Arc::new(customers),
            Arc::new(profiles),
            Arc::new(MockResolver(router)),
            RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            },
        )
        .with_notifier(Arc::new(ChannelNotifier(tx)));
        (Arc::new(engine), rx)
    }

    fn change(customer: u64, class: NetworkClass) -> EntitlementChange {
        let reason = match class {
            NetworkClass::Isolation => ChangeReason::InvoiceOverdue,
            NetworkClass::Normal => ChangeReason::InvoicePaid,
        };
        EntitlementChange::new(CustomerId(customer), InvoiceId(customer * 10), class, reason)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_twice_then_applied() {
        let router = Arc::new(MockRouter::default());
        router.set_failures.store(2, Ordering::SeqCst);
        let (engine, _) = engine(router.clone());

        let outcome = engine.apply(&change(1, NetworkClass::Isolation)).await;
        assert_eq!(
            outcome,
            EnforcementOutcome::Applied {
                attempts: 3,
                sessions_removed: 1
            }
        );
        assert_eq!(
            *router.sets.lock(),
            vec![("pppoe-1".to_string(), "isolir".to_string())]
        );
        assert!(engine.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_reached_is_failed_and_reported() {
        let router = Arc::new(MockRouter::default());
        router.set_failures.store(100, Ordering::SeqCst);
        let (engine, mut notes) = engine(router.clone());

        let outcome = engine.apply(&change(1, NetworkClass::Normal)).await;
        assert!(matches!(
            outcome,
            EnforcementOutcome::Failed { attempts: 5, kind: ErrorKind::Connectivity, .. }
        ));
        assert_eq!(router.set_calls.load(Ordering::SeqCst), 5);

        let failures = engine.failures().for_customer(CustomerId(1));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 5);
        assert_eq!(failures[0].class, NetworkClass::Normal);
        assert!(failures[0].last_error.contains("timed out"));

        let note = notes.recv().await.unwrap();
        assert!(note.contains("Enforcement failed"));
    }

    #[tokio::test]
    async fn test_session_removal_is_best_effort() {
        let router = Arc::new(MockRouter::default());
        router.remove_fails.store(true, Ordering::SeqCst);
        let (engine, _) = engine(router.clone());

        let outcome = engine.apply(&change(1, NetworkClass::Normal)).await;
        assert_eq!(
            outcome,
            EnforcementOutcome::Applied {
                attempts: 1,
                sessions_removed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let router = Arc::new(MockRouter::default());
        let (engine, _) = engine(router.clone());

        // unknown customer
        let outcome = engine.apply(&change(9, NetworkClass::Isolation)).await;
        assert!(matches!(
            outcome,
            EnforcementOutcome::Failed { attempts: 1, kind: ErrorKind::NotFound, .. }
        ));
        // unknown profile
        let outcome = engine.apply(&change(3, NetworkClass::Isolation)).await;
        assert_eq!(outcome.attempts(), 1);
        // unknown router session
        let outcome = engine.apply(&change(2, NetworkClass::Isolation)).await;
        assert!(matches!(
            outcome,
            EnforcementOutcome::Failed { attempts: 1, kind: ErrorKind::NotFound, .. }
        ));

        assert_eq!(router.set_calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.failures().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_customer_runs_in_order() {
        let router = Arc::new(MockRouter::default());
        router.slow_isolation.store(true, Ordering::SeqCst);
        let (engine, _) = engine(router.clone());

        let first = engine.submit(change(1, NetworkClass::Isolation));
        let second = engine.submit(change(1, NetworkClass::Normal));
        assert!(first.await.unwrap().is_applied());
        assert!(second.await.unwrap().is_applied());

        let profiles: Vec<_> = router.sets.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(profiles, vec!["isolir", "home-20m"]);
        assert!(engine.chains.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let router = Arc::new(MockRouter::default());
        let (engine, _) = engine(router.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(change(1, NetworkClass::Isolation)).unwrap();
        tx.send(change(1, NetworkClass::Normal)).unwrap();
        drop(tx);
        engine.clone().run(rx).await;

        let profiles: Vec<_> = router.sets.lock().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(profiles, vec!["isolir", "home-20m"]);
    }
}
