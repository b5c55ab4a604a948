//! Payment methods and admin fee pricing

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Admin fee charged on top of the invoice amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AdminFee {
    /// Percent of the invoice amount, rounded up to a whole unit
    #[serde(alias = "percent")]
    Percentage(Decimal),
    /// Flat amount regardless of invoice amount
    Fixed(Decimal),
}

impl AdminFee {
    /// Fee for `amount`
    pub fn fee_for(&self, amount: Decimal) -> Decimal {
        match *self {
            Self::Percentage(rate) => (amount * rate / dec!(100)).ceil(),
            Self::Fixed(value) => value,
        }
    }
}

impl Default for AdminFee {
    fn default() -> Self {
        Self::Fixed(Decimal::ZERO)
    }
}

/// Payment channel family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Qris,
    /// Bank virtual account
    Va,
    Ewallet,
    /// Convenience store counter
    Retail,
}

/// A payment method offered at checkout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodConfig {
    /// Gateway method code, e.g. `BRIVA` or `QRIS`
    pub code: String,
    pub name: String,
    pub kind: MethodKind,
    #[serde(default)]
    pub admin_fee: AdminFee,
    #[serde(default)]
    pub min_amount: Decimal,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl PaymentMethodConfig {
    /// Whether this method can pay an invoice of `amount`
    pub fn offers(&self, amount: Decimal) -> bool {
        self.active
            && amount >= self.min_amount
            && self.max_amount.map_or(true, |max| amount <= max)
    }

    /// Price an invoice of `amount` through this method
    pub fn quote(&self, amount: Decimal) -> Quote {
        let admin_fee = self.admin_fee.fee_for(amount);
        Quote {
            amount,
            admin_fee,
            total: amount + admin_fee,
        }
    }
}

/// Amounts charged for one checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub amount: Decimal,
    pub admin_fee: Decimal,
    pub total: Decimal,
}

/// The configured set of payment methods
#[derive(Default)]
pub struct MethodCatalog {
    methods: RwLock<Vec<PaymentMethodConfig>>,
}

impl MethodCatalog {
    pub fn new(methods: Vec<PaymentMethodConfig>) -> Self {
        Self {
            methods: RwLock::new(methods),
        }
    }

    /// Methods offered for an invoice of `amount`, in configured order
    pub fn offered(&self, amount: Decimal) -> Vec<PaymentMethodConfig> {
        self.methods
            .read()
            .iter()
            .filter(|m| m.offers(amount))
            .cloned()
            .collect()
    }

    /// Look up `code` among the methods offered for `amount`
    pub fn offered_method(&self, code: &str, amount: Decimal) -> Option<PaymentMethodConfig> {
        self.methods
            .read()
            .iter()
            .find(|m| m.code == code && m.offers(amount))
            .cloned()
    }

    /// Replace the catalog (configuration reload)
    pub fn replace(&self, methods: Vec<PaymentMethodConfig>) {
        *self.methods.write() = methods;
    }
}
