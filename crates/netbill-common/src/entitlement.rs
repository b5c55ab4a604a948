//! Desired-entitlement events
//!
//! Billing emits an [`EntitlementChange`] whenever a customer's current invoice
//! moves into or out of good standing. Enforcement consumes them; neither side
//! knows about the other beyond this type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::domain::{CustomerId, InvoiceId};

/// Network class a subscriber should be on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    /// Paid up
    Normal,
    /// Overdue, restricted
    Isolation,
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Isolation => write!(f, "isolation"),
        }
    }
}

/// Why the change was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    InvoiceOverdue,
    InvoicePaid,
    AdminOverride,
}

/// A desired-entitlement change for one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementChange {
    pub customer_id: CustomerId,
    pub invoice_id: InvoiceId,
    pub class: NetworkClass,
    pub reason: ChangeReason,
    pub emitted_at: DateTime<Utc>,
}

impl EntitlementChange {
    pub fn new(
        customer_id: CustomerId,
        invoice_id: InvoiceId,
        class: NetworkClass,
        reason: ChangeReason,
    ) -> Self {
        Self {
            customer_id,
            invoice_id,
            class,
            reason,
            emitted_at: Utc::now(),
        }
    }
}

/// Destination for entitlement changes
pub trait EntitlementSink: Send + Sync {
    /// Hand a change over; must not block
    fn emit(&self, change: EntitlementChange);
}

/// Sink backed by an unbounded tokio channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EntitlementChange>,
}

impl EntitlementSink for ChannelSink {
    fn emit(&self, change: EntitlementChange) {
        if self.tx.send(change).is_err() {
            tracing::error!("entitlement receiver dropped, change lost");
        }
    }
}

/// Create a connected sink/receiver pair
pub fn entitlement_channel() -> (ChannelSink, mpsc::UnboundedReceiver<EntitlementChange>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, rx)
}
