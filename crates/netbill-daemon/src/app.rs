//! Service wiring

use chrono::FixedOffset;
use netbill_billing::{
    BillingError, CallbackUrls, InMemoryInvoiceRepository, InMemoryPaymentRepository, InvoiceLedger,
    MethodCatalog, OverdueSweeper, ReconciliationAdapter, TripayGateway,
};
use netbill_common::{
    entitlement_channel, CustomerRepository, EntitlementChange,
    InMemoryCustomerRepository, InMemoryProfileRepository, Notifier, NoopNotifier, ProfileCatalog,
    ProfileRepository, TelegramNotifier,
};
use netbill_enforcement::{EnforcementEngine, FailureLog};
use netbill_routeros::{
    AeadSecretStore, EncryptedSecret, InMemorySessionConfigs, RouterError, RouterPool, SecretStore,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, DaemonConfig};
use crate::routes::AppState;

/// Startup errors
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("credential store: {0}")]
    Credentials(#[from] RouterError),

    #[error("seeding invoices: {0}")]
    Seed(#[from] BillingError),
}

/// Secret store used when no sealing key is configured
struct LockedSecretStore;

impl SecretStore for LockedSecretStore {
    fn reveal(&self, _secret: &EncryptedSecret) -> netbill_routeros::Result<String> {
        Err(RouterError::Credential("no credential key configured".into()))
    }
}

/// The assembled service
pub struct Netbill {
    pub ledger: Arc<InvoiceLedger>,
    pub adapter: Arc<ReconciliationAdapter>,
    pub catalog: Arc<ProfileCatalog>,
    pub profiles: Arc<dyn ProfileRepository>,
    pub customers: Arc<dyn CustomerRepository>,
    pub engine: Arc<EnforcementEngine>,
    pub sweeper: Arc<OverdueSweeper>,
    pub routers: Arc<RouterPool>,
    pub failures: Arc<FailureLog>,
    changes: Option<mpsc::UnboundedReceiver<EntitlementChange>>,
}

impl Netbill {
    /// Build every component from configuration and load seed data
    pub async fn build(config: &DaemonConfig) -> Result<Self, StartupError> {
        config.validate()?;

        let notifier: Arc<dyn Notifier> = if config.telegram.enabled {
            Arc::new(TelegramNotifier::new(config.telegram.clone()))
        } else {
            Arc::new(NoopNotifier)
        };

        let profiles: Arc<dyn ProfileRepository> =
            Arc::new(InMemoryProfileRepository::with_profiles(config.seed.profiles.clone()));
        let customers: Arc<dyn CustomerRepository> =
            Arc::new(InMemoryCustomerRepository::with_customers(config.seed.customers.clone()));

        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600).ok_or_else(|| {
            ConfigError::Invalid(format!("utc_offset_hours {}", config.utc_offset_hours))
        })?;
        let (sink, changes) = entitlement_channel();
        let ledger = Arc::new(
            InvoiceLedger::new(Arc::new(InMemoryInvoiceRepository::new()), Arc::new(sink))
                .with_utc_offset(offset),
        );
        for seed in &config.seed.invoices {
            ledger
                .open_invoice(seed.customer_id, seed.amount, seed.due_date, &seed.period)
                .await?;
        }

        let secrets: Arc<dyn SecretStore> = match config.credential_key() {
            Some(key) => Arc::new(AeadSecretStore::from_hex(&key)?),
            None => {
                if !config.routers.is_empty() {
                    warn!("no credential key configured, router logins will fail");
                }
                Arc::new(LockedSecretStore)
            }
        };
        let routers = Arc::new(RouterPool::new(
            Arc::new(InMemorySessionConfigs::new(config.routers.clone())),
            secrets,
            netbill_routeros::TcpConnector,
            config.command_timeout(),
        ));

        let failures = Arc::new(FailureLog::default());
        let engine = Arc::new(
            EnforcementEngine::new(customers.clone(), profiles.clone(), routers.clone(), config.retry)
                .with_notifier(notifier.clone())
                .with_failure_log(failures.clone()),
        );

        let mut adapter = ReconciliationAdapter::new(
            ledger.clone(),
            Arc::new(InMemoryPaymentRepository::new()),
            customers.clone(),
            Arc::new(MethodCatalog::new(config.payment_methods.clone())),
            CallbackUrls {
                callback_url: config.callback_url(),
                return_url: config.return_url(),
            },
        )
        .with_notifier(notifier);
        if config.gateway.enabled {
            match TripayGateway::new(config.gateway.clone()) {
                Ok(gateway) => adapter = adapter.with_gateway(Arc::new(gateway)),
                Err(e) => warn!(error = %e, "payment gateway disabled"),
            }
        }

        info!(
            routers = config.routers.len(),
            customers = config.seed.customers.len(),
            invoices = config.seed.invoices.len(),
            methods = config.payment_methods.len(),
            "netbill assembled"
        );

        Ok(Self {
            sweeper: Arc::new(OverdueSweeper::new(ledger.clone(), config.sweep_interval())),
            catalog: Arc::new(ProfileCatalog::new(profiles.clone(), customers.clone())),
            adapter: Arc::new(adapter),
            ledger,
            profiles,
            customers,
            engine,
            routers,
            failures,
            changes: Some(changes),
        })
    }

    /// Handles the HTTP layer needs
    pub fn state(&self) -> AppState {
        AppState {
            ledger: self.ledger.clone(),
            adapter: self.adapter.clone(),
            catalog: self.catalog.clone(),
            profiles: self.profiles.clone(),
            failures: self.failures.clone(),
        }
    }

    /// Spawn the enforcement engine and the overdue sweeper
    pub fn start(&mut self) -> Option<Background> {
        let changes = self.changes.take()?;
        let (shutdown, stop) = watch::channel(false);
        Some(Background {
            engine: tokio::spawn(self.engine.clone().run(changes)),
            sweeper: tokio::spawn(self.sweeper.clone().run(stop)),
            shutdown,
        })
    }
}

/// Running background tasks
pub struct Background {
    engine: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Background {
    /// Stop the sweeper, let enforcement drain, then close router connections.
    ///
    /// Dropping `netbill` releases the last entitlement sender, which is what
    /// ends the engine loop.
    pub async fn stop(self, netbill: Netbill) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "sweeper task failed");
        }

        let routers = netbill.routers.clone();
        drop(netbill);
        if let Err(e) = self.engine.await {
            warn!(error = %e, "enforcement task failed");
        }
        routers.disconnect_all().await;
        info!("background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SeedData, SeedInvoice};
    use chrono::{Duration as ChronoDuration, Utc};
    use netbill_billing::InvoiceStatus;
    use netbill_common::{Customer, CustomerId, Profile, ProfileId};
    use rust_decimal_macros::dec;

    fn config(due_in_days: i64) -> DaemonConfig {
        DaemonConfig {
            seed: SeedData {
                profiles: vec![Profile {
                    id: ProfileId(1),
                    name: "Home 20M".into(),
                    price_monthly: dec!(150000),
                    speed_label: None,
                    description: None,
                    router_profile_normal: "home-20m".into(),
                    router_profile_isolation: "isolir".into(),
                }],
                customers: Vec::new(),
                invoices: vec![SeedInvoice {
                    customer_id: CustomerId(7),
                    amount: dec!(150000),
                    due_date: (Utc::now() + ChronoDuration::days(due_in_days)).date_naive(),
                    period: "2026-01".into(),
                }],
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_seeds_invoices() {
        let netbill = Netbill::build(&config(10)).await.unwrap();
        let invoices = netbill.ledger.list_for_customer(CustomerId(7)).await.unwrap();

        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].status, InvoiceStatus::Unpaid);
        assert!(netbill.routers.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_seed_period_fails_startup() {
        let mut config = config(10);
        config.seed.invoices[0].period = "January".into();
        let err = Netbill::build(&config).await.err().unwrap();
        assert!(matches!(err, StartupError::Seed(_)));
    }

    #[tokio::test]
    async fn test_start_once_then_stop() {
        let mut netbill = Netbill::build(&config(-3)).await.unwrap();
        let background = netbill.start().unwrap();
        assert!(netbill.start().is_none());

        // the first sweep runs immediately
        let mut overdue = false;
        for _ in 0..50 {
            let invoices = netbill.ledger.list_for_customer(CustomerId(7)).await.unwrap();
            if invoices[0].status == InvoiceStatus::Overdue {
                overdue = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(overdue);

        background.stop(netbill).await;
    }

    #[tokio::test]
    async fn test_customer_seed_requires_router() {
        let mut config = config(10);
        config.seed.customers.push(Customer {
            id: CustomerId(7),
            name: "Budi".into(),
            phone: None,
            email: None,
            profile_id: ProfileId(1),
            service_number: "SN-0007".into(),
            router: "core-1".into(),
            secret_name: "budi".into(),
            active: true,
        });
        let err = Netbill::build(&config).await.err().unwrap();
        assert!(matches!(err, StartupError::Config(ConfigError::Invalid(_))));
    }
}
