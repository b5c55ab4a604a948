//! Payment transactions

use chrono::{DateTime, Utc};
use netbill_common::InvoiceId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Expired => write!(f, "expired"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One checkout attempt against the gateway.
///
/// `reference` is the gateway's id for the payment and the idempotency key for
/// callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: u64,
    pub invoice_id: InvoiceId,
    pub reference: String,
    pub merchant_ref: String,
    pub method_code: String,
    pub amount: Decimal,
    pub admin_fee: Decimal,
    pub total: Decimal,
    pub status: PaymentStatus,
    pub payment_url: Option<String>,
    pub virtual_account: Option<String>,
    pub qr_url: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    /// Pending and not yet past its expiry
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && self.expires_at > now
    }
}

/// What the customer needs to complete a checkout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSummary {
    pub reference: String,
    pub invoice_id: InvoiceId,
    pub method_name: String,
    pub payment_url: Option<String>,
    pub virtual_account: Option<String>,
    pub qr_url: Option<String>,
    pub amount: Decimal,
    pub admin_fee: Decimal,
    pub total: Decimal,
    pub expires_at: DateTime<Utc>,
}
