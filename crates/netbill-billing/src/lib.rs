//! netbill Billing - invoices, admin fees and payment reconciliation
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐ create_payment ┌───────────────────────┐  mark_paid  ┌───────────────┐
//! │ Portal / HTTP │ ─────────────► │ ReconciliationAdapter │ ──────────► │ InvoiceLedger │
//! └───────────────┘                │  (per-reference lock) │             │ (state machine)│
//! ┌───────────────┐  callback      │                       │             └───────┬───────┘
//! │ Payment gw    │ ─────────────► │                       │                     │ EntitlementChange
//! └───────────────┘                └───────────────────────┘                     ▼
//!                                                                         EntitlementSink
//! ┌───────────────┐  mark_overdue_due(now)
//! │ OverdueSweeper│ ───────────────────────► InvoiceLedger
//! └───────────────┘
//! ```

#![warn(clippy::all)]

pub mod gateway;
pub mod invoice;
pub mod payment;
pub mod pricing;
pub mod reconcile;
pub mod store;
pub mod sweep;

pub use gateway::{
    GatewayConfig, GatewayError, GatewayNotification, GatewayPayment, PaymentGateway,
    PaymentRequest, TripayGateway, CALLBACK_SIGNATURE_HEADER,
};
pub use invoice::{Invoice, InvoiceLedger, InvoiceStatus, Transition};
pub use payment::{CheckoutSummary, PaymentStatus, PaymentTransaction};
pub use pricing::{AdminFee, MethodCatalog, MethodKind, PaymentMethodConfig, Quote};
pub use reconcile::{CallbackUrls, ReconcileOutcome, ReconciliationAdapter};
pub use store::{
    InMemoryInvoiceRepository, InMemoryPaymentRepository, InvoiceRepository, PaymentRepository,
};
pub use sweep::{OverdueSweeper, DEFAULT_SWEEP_INTERVAL};

use netbill_common::{Classify, ErrorKind, RepositoryError};
use thiserror::Error;

/// Billing errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("no payment gateway is configured")]
    GatewayUnavailable,

    #[error("payment method {0} is not offered for this invoice")]
    InvalidMethod(String),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("unknown payment reference {0}")]
    UnknownTransaction(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl From<RepositoryError> for BillingError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(what) => Self::NotFound(what),
            RepositoryError::Conflict(what) => Self::Conflict(what),
            other => Self::Repository(other),
        }
    }
}

impl Classify for BillingError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::GatewayUnavailable | Self::Gateway(_) => ErrorKind::Gateway,
            Self::InvalidMethod(_) | Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownTransaction(_) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Repository(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_errors_keep_their_kind() {
        let e: BillingError = RepositoryError::NotFound("invoice 4".into()).into();
        assert!(matches!(e, BillingError::NotFound(_)));
        assert_eq!(e.kind(), ErrorKind::NotFound);

        let e: BillingError = RepositoryError::StorageError("disk".into()).into();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(BillingError::GatewayUnavailable.kind(), ErrorKind::Gateway);
        assert_eq!(BillingError::InvalidMethod("QRIS".into()).kind(), ErrorKind::Validation);
        assert_eq!(BillingError::UnknownTransaction("T1".into()).kind(), ErrorKind::NotFound);
    }
}
