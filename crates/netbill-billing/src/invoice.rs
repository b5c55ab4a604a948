//! Invoice lifecycle
//!
//! ```text
//!            due date passed            payment
//!  unpaid ───────────────────► overdue ─────────► paid
//!    │  └──────────────── payment ────────────────►│
//!    └──► cancelled ◄──── (admin) ─── overdue
//! ```
//!
//! Only the customer's current invoice drives entitlement: entering `overdue`
//! emits isolation, entering `paid` emits normal. Every transition runs under
//! one ledger-wide lock so a sweep and a payment on the same invoice cannot both
//! emit.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use netbill_common::{
    ChangeReason, CustomerId, EntitlementChange, EntitlementSink, InvoiceId, NetworkClass,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::store::InvoiceRepository;
use crate::{BillingError, Result};

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    /// Whether a payment may still be taken
    pub fn is_payable(&self) -> bool {
        matches!(self, Self::Unpaid | Self::Overdue)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpaid => write!(f, "unpaid"),
            Self::Paid => write!(f, "paid"),
            Self::Overdue => write!(f, "overdue"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Monthly invoice for one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub customer_id: CustomerId,
    pub amount: Decimal,
    /// Last day payment is on time (inclusive)
    pub due_date: NaiveDate,
    /// Billing period, `YYYY-MM`
    pub period: String,
    pub status: InvoiceStatus,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    /// Exactly one invoice per customer is current
    #[serde(default)]
    pub current: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of a ledger operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub invoice_id: InvoiceId,
    pub from: InvoiceStatus,
    pub to: InvoiceStatus,
    /// Entitlement change emitted, if any
    pub emitted: Option<NetworkClass>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Invoice state machine
pub struct InvoiceLedger {
    invoices: Arc<dyn InvoiceRepository>,
    sink: Arc<dyn EntitlementSink>,
    offset: FixedOffset,
    guard: Mutex<()>,
}

impl InvoiceLedger {
    /// Ledger evaluating due dates in UTC
    pub fn new(invoices: Arc<dyn InvoiceRepository>, sink: Arc<dyn EntitlementSink>) -> Self {
        Self {
            invoices,
            sink,
            offset: Utc.fix(),
            guard: Mutex::new(()),
        }
    }

    /// Evaluate due dates in a local UTC offset
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// `now` is past the due date in the ledger's timezone
    pub fn is_past_due(&self, invoice: &Invoice, now: DateTime<Utc>) -> bool {
        now.with_timezone(&self.offset).date_naive() > invoice.due_date
    }

    /// Create the customer's new current invoice
    pub async fn open_invoice(
        &self,
        customer_id: CustomerId,
        amount: Decimal,
        due_date: NaiveDate,
        period: &str,
    ) -> Result<Invoice> {
        if amount < Decimal::ZERO {
            return Err(BillingError::Validation("invoice amount must not be negative".into()));
        }
        if !amount.fract().is_zero() {
            return Err(BillingError::Validation(format!(
                "invoice amount {} is not a whole currency unit",
                amount
            )));
        }
        if NaiveDate::parse_from_str(&format!("{}-01", period), "%Y-%m-%d").is_err() {
            return Err(BillingError::Validation(format!(
                "billing period {:?} is not YYYY-MM",
                period
            )));
        }

        let _guard = self.guard.lock().await;
        for mut previous in self.invoices.list_by_customer(customer_id).await? {
            if previous.current {
                previous.current = false;
                self.invoices.save(&previous).await?;
            }
        }

        let invoice = Invoice {
            id: self.invoices.next_id().await?,
            customer_id,
            amount,
            due_date,
            period: period.to_string(),
            status: InvoiceStatus::Unpaid,
            paid_at: None,
            current: true,
            created_at: Utc::now(),
        };
        self.invoices.save(&invoice).await?;

        info!(
            invoice_id = %invoice.id,
            customer_id = %customer_id,
            period = %period,
            amount = %amount,
            "invoice opened"
        );
        Ok(invoice)
    }

    /// Read an invoice, applying an overdue transition that is due
    pub async fn get(&self, id: InvoiceId, now: DateTime<Utc>) -> Result<Invoice> {
        let _guard = self.guard.lock().await;
        let mut invoice = self.invoices.get(id).await?;
        if invoice.status == InvoiceStatus::Unpaid && self.is_past_due(&invoice, now) {
            self.apply(&mut invoice, InvoiceStatus::Overdue, ChangeReason::InvoiceOverdue)
                .await?;
        }
        Ok(invoice)
    }

    /// All invoices of a customer, oldest first
    pub async fn list_for_customer(&self, customer_id: CustomerId) -> Result<Vec<Invoice>> {
        Ok(self.invoices.list_by_customer(customer_id).await?)
    }

    /// Move every past-due unpaid invoice to overdue
    pub async fn mark_overdue_due(&self, now: DateTime<Utc>) -> Result<Vec<Transition>> {
        let _guard = self.guard.lock().await;
        let mut transitions = Vec::new();
        for mut invoice in self.invoices.list().await? {
            if invoice.status == InvoiceStatus::Unpaid && self.is_past_due(&invoice, now) {
                transitions.push(
                    self.apply(&mut invoice, InvoiceStatus::Overdue, ChangeReason::InvoiceOverdue)
                        .await?,
                );
            }
        }
        Ok(transitions)
    }

    /// Record payment of an invoice. Paying a paid invoice is a no-op.
    pub async fn mark_paid(&self, id: InvoiceId, at: DateTime<Utc>) -> Result<Transition> {
        let _guard = self.guard.lock().await;
        let mut invoice = self.invoices.get(id).await?;
        match invoice.status {
            InvoiceStatus::Unpaid | InvoiceStatus::Overdue => {
                invoice.paid_at = Some(at);
                self.apply(&mut invoice, InvoiceStatus::Paid, ChangeReason::InvoicePaid)
                    .await
            }
            InvoiceStatus::Paid => Ok(unchanged(&invoice)),
            InvoiceStatus::Cancelled => Err(BillingError::Validation(format!(
                "invoice {} is cancelled",
                id
            ))),
        }
    }

    /// Administrative cancel of an unpaid or overdue invoice
    pub async fn cancel(&self, id: InvoiceId) -> Result<Transition> {
        let _guard = self.guard.lock().await;
        let mut invoice = self.invoices.get(id).await?;
        if !invoice.status.is_payable() {
            return Err(BillingError::Validation(format!(
                "invoice {} is {} and cannot be cancelled",
                id, invoice.status
            )));
        }
        self.apply(&mut invoice, InvoiceStatus::Cancelled, ChangeReason::AdminOverride)
            .await
    }

    /// Administrative override to any status
    pub async fn override_status(
        &self,
        id: InvoiceId,
        status: InvoiceStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let _guard = self.guard.lock().await;
        let mut invoice = self.invoices.get(id).await?;
        if invoice.status == status {
            return Ok(unchanged(&invoice));
        }
        invoice.paid_at = match status {
            InvoiceStatus::Paid => invoice.paid_at.or(Some(at)),
            _ => None,
        };
        info!(invoice_id = %id, from = %invoice.status, to = %status, "invoice status overridden");
        self.apply(&mut invoice, status, ChangeReason::AdminOverride)
            .await
    }

    async fn apply(
        &self,
        invoice: &mut Invoice,
        to: InvoiceStatus,
        reason: ChangeReason,
    ) -> Result<Transition> {
        let from = invoice.status;
        invoice.status = to;
        self.invoices.save(invoice).await?;

        if to == InvoiceStatus::Overdue {
            metrics::counter!("netbill_overdue_transitions_total").increment(1);
        }

        let class = match to {
            InvoiceStatus::Overdue => Some(NetworkClass::Isolation),
            InvoiceStatus::Paid => Some(NetworkClass::Normal),
            _ => None,
        };
        let emitted = class.filter(|_| invoice.current);
        if let Some(class) = emitted {
            self.sink.emit(EntitlementChange::new(
                invoice.customer_id,
                invoice.id,
                class,
                reason,
            ));
        }

        debug!(
            invoice_id = %invoice.id,
            customer_id = %invoice.customer_id,
            from = %from,
            to = %to,
            emitted = ?emitted,
            "invoice transition"
        );
        Ok(Transition {
            invoice_id: invoice.id,
            from,
            to,
            emitted,
        })
    }
}

fn unchanged(invoice: &Invoice) -> Transition {
    Transition {
        invoice_id: invoice.id,
        from: invoice.status,
        to: invoice.status,
        emitted: None,
    }
}
