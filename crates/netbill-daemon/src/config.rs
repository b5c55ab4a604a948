//! Daemon configuration

use chrono::NaiveDate;
use netbill_billing::{GatewayConfig, PaymentMethodConfig};
use netbill_common::{Customer, CustomerId, Profile, TelegramSettings};
use netbill_enforcement::RetryPolicy;
use netbill_routeros::SessionConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Environment variable overriding `credential_key`
pub const CREDENTIAL_KEY_ENV: &str = "NETBILL_CREDENTIAL_KEY";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP listen address
    pub listen_addr: String,
    /// Externally reachable base URL of this daemon
    pub public_base_url: String,
    /// Offset of the billing timezone; due dates end at local midnight
    pub utc_offset_hours: i32,
    /// Hex AES-256 key sealing router passwords
    pub credential_key: Option<String>,
    /// Router sessions
    pub routers: Vec<SessionConfig>,
    pub command_timeout_secs: u64,
    pub gateway: GatewayConfig,
    pub payment_methods: Vec<PaymentMethodConfig>,
    pub telegram: TelegramSettings,
    pub retry: RetryPolicy,
    pub sweep_interval_secs: u64,
    /// Prometheus exporter listen address; disabled when unset
    pub metrics_addr: Option<String>,
    /// Records loaded into the in-memory stores at start
    pub seed: SeedData,
}

/// Initial customers, profiles and invoices
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedData {
    pub profiles: Vec<Profile>,
    pub customers: Vec<Customer>,
    pub invoices: Vec<SeedInvoice>,
}

/// Invoice opened at start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedInvoice {
    pub customer_id: CustomerId,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    /// Billing period, `YYYY-MM`
    pub period: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            public_base_url: "http://localhost:8080".into(),
            utc_offset_hours: 7,
            credential_key: None,
            routers: Vec::new(),
            command_timeout_secs: 10,
            gateway: GatewayConfig::default(),
            payment_methods: Vec::new(),
            telegram: TelegramSettings::default(),
            retry: RetryPolicy::default(),
            sweep_interval_secs: 300,
            metrics_addr: None,
            seed: SeedData::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(ConfigError::Invalid(format!(
                "utc_offset_hours {} is out of range",
                self.utc_offset_hours
            )));
        }
        if self.sweep_interval_secs == 0 || self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }

        let mut routers = HashSet::new();
        for router in &self.routers {
            if !routers.insert(router.name.as_str()) {
                return Err(ConfigError::Invalid(format!("router {} defined twice", router.name)));
            }
        }

        let profiles: HashSet<_> = self.seed.profiles.iter().map(|p| p.id).collect();
        for customer in &self.seed.customers {
            if !profiles.contains(&customer.profile_id) {
                return Err(ConfigError::Invalid(format!(
                    "customer {} references unknown profile {}",
                    customer.id, customer.profile_id
                )));
            }
            if !routers.contains(customer.router.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "customer {} references unknown router {}",
                    customer.id, customer.router
                )));
            }
        }
        Ok(())
    }

    /// Sealing key, preferring the environment
    pub fn credential_key(&self) -> Option<String> {
        std::env::var(CREDENTIAL_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.credential_key.clone())
    }

    pub fn callback_url(&self) -> String {
        format!("{}/api/payments/callback", self.public_base_url.trim_end_matches('/'))
    }

    pub fn return_url(&self) -> String {
        format!("{}/portal", self.public_base_url.trim_end_matches('/'))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
