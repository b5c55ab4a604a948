//! Request and response bodies

use netbill_billing::{InvoiceStatus, MethodKind, PaymentMethodConfig, PaymentStatus, Quote, ReconcileOutcome};
use netbill_common::InvoiceId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Standard API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Checkout request from the portal
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// Payment method code
    pub method: String,
}

/// Administrative status change
#[derive(Debug, Deserialize)]
pub struct StatusOverride {
    pub status: InvoiceStatus,
}

/// A payment method priced for one invoice
#[derive(Debug, Serialize, Deserialize)]
pub struct MethodOffer {
    pub code: String,
    pub name: String,
    pub kind: MethodKind,
    pub amount: Decimal,
    pub admin_fee: Decimal,
    pub total: Decimal,
}

impl From<(PaymentMethodConfig, Quote)> for MethodOffer {
    fn from((method, quote): (PaymentMethodConfig, Quote)) -> Self {
        Self {
            code: method.code,
            name: method.name,
            kind: method.kind,
            amount: quote.amount,
            admin_fee: quote.admin_fee,
            total: quote.total,
        }
    }
}

/// Acknowledgement returned to the gateway
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackAck {
    pub reference: String,
    pub invoice_id: InvoiceId,
    pub status: PaymentStatus,
    pub replayed: bool,
}

impl From<ReconcileOutcome> for CallbackAck {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            reference: outcome.reference,
            invoice_id: outcome.invoice_id,
            status: outcome.status,
            replayed: outcome.replayed,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FailureQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}
