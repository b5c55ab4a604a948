//! Payment reconciliation
//!
//! Opens checkouts at the gateway and applies gateway status reports to
//! transactions and invoices. Callbacks are delivered at least once, so every
//! report for a reference runs inside that reference's critical section and a
//! report for an already settled transaction is a replay.

use chrono::Utc;
use dashmap::DashMap;
use netbill_common::{dispatch, Customer, CustomerRepository, InvoiceId, Notifier, NoopNotifier};
use rust_decimal::Decimal;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gateway::{PaymentGateway, PaymentRequest};
use crate::invoice::{Invoice, InvoiceLedger, Transition};
use crate::payment::{CheckoutSummary, PaymentStatus, PaymentTransaction};
use crate::pricing::{MethodCatalog, PaymentMethodConfig, Quote};
use crate::store::PaymentRepository;
use crate::{BillingError, Result};

/// Where the gateway sends callbacks and customers
#[derive(Debug, Clone, Default)]
pub struct CallbackUrls {
    pub callback_url: String,
    pub return_url: String,
}

/// Result of applying a gateway report
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub reference: String,
    pub invoice_id: InvoiceId,
    /// Transaction status after the report
    pub status: PaymentStatus,
    /// The transaction was already settled; nothing changed
    pub replayed: bool,
    /// Invoice transition driven by this report
    pub transition: Option<Transition>,
}

impl ReconcileOutcome {
    fn of(tx: &PaymentTransaction, replayed: bool, transition: Option<Transition>) -> Self {
        Self {
            reference: tx.reference.clone(),
            invoice_id: tx.invoice_id,
            status: tx.status,
            replayed,
            transition,
        }
    }
}

/// Payment reconciliation adapter
pub struct ReconciliationAdapter {
    gateway: Option<Arc<dyn PaymentGateway>>,
    methods: Arc<MethodCatalog>,
    ledger: Arc<InvoiceLedger>,
    payments: Arc<dyn PaymentRepository>,
    customers: Arc<dyn CustomerRepository>,
    notifier: Arc<dyn Notifier>,
    urls: CallbackUrls,
    references: DashMap<String, Arc<Mutex<()>>>,
    checkouts: DashMap<InvoiceId, Arc<Mutex<()>>>,
}

fn lock_for<K: Eq + Hash + Clone>(locks: &DashMap<K, Arc<Mutex<()>>>, key: &K) -> Arc<Mutex<()>> {
    locks.entry(key.clone()).or_default().value().clone()
}

fn count(result: &'static str) {
    metrics::counter!("netbill_reconcile_total", "result" => result).increment(1);
}

impl ReconciliationAdapter {
    pub fn new(
        ledger: Arc<InvoiceLedger>,
        payments: Arc<dyn PaymentRepository>,
        customers: Arc<dyn CustomerRepository>,
        methods: Arc<MethodCatalog>,
        urls: CallbackUrls,
    ) -> Self {
        Self {
            gateway: None,
            methods,
            ledger,
            payments,
            customers,
            notifier: Arc::new(NoopNotifier),
            urls,
            references: DashMap::new(),
            checkouts: DashMap::new(),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Methods offered for an invoice, each with its price
    pub async fn offered_methods(&self, invoice_id: InvoiceId) -> Result<Vec<(PaymentMethodConfig, Quote)>> {
        let invoice = self.ledger.get(invoice_id, Utc::now()).await?;
        Ok(self
            .methods
            .offered(invoice.amount)
            .into_iter()
            .map(|m| {
                let quote = m.quote(invoice.amount);
                (m, quote)
            })
            .collect())
    }

    /// Open a gateway checkout for an invoice
    pub async fn create_payment(&self, invoice_id: InvoiceId, method_code: &str) -> Result<CheckoutSummary> {
        let gateway = self.gateway.clone().ok_or(BillingError::GatewayUnavailable)?;
        let now = Utc::now();

        let lock = lock_for(&self.checkouts, &invoice_id);
        let _guard = lock.lock().await;

        let invoice = self.ledger.get(invoice_id, now).await?;
        if !invoice.status.is_payable() {
            return Err(BillingError::Validation(format!(
                "invoice {} is {}",
                invoice.id, invoice.status
            )));
        }
        let method = self
            .methods
            .offered_method(method_code, invoice.amount)
            .ok_or_else(|| BillingError::InvalidMethod(method_code.to_string()))?;
        let quote = method.quote(invoice.amount);

        for listed in self.payments.pending_for_invoice(invoice.id).await? {
            // a callback for this reference may have settled it since the listing
            let reference_lock = lock_for(&self.references, &listed.reference);
            let _reference_guard = reference_lock.lock().await;
            let Some(mut pending) = self.payments.get_by_reference(&listed.reference).await? else {
                continue;
            };
            if pending.status != PaymentStatus::Pending {
                continue;
            }
            if pending.is_open(now) {
                return Err(BillingError::Conflict(format!(
                    "payment {} for invoice {} is still pending",
                    pending.reference, invoice.id
                )));
            }
            pending.status = PaymentStatus::Expired;
            self.payments.update(&pending).await?;
            info!(reference = %pending.reference, invoice_id = %invoice.id, "stale pending payment expired");
        }

        let invoice = self.ledger.get(invoice_id, now).await?;
        if !invoice.status.is_payable() {
            return Err(BillingError::Validation(format!(
                "invoice {} is {}",
                invoice.id, invoice.status
            )));
        }

        let customer = self.customers.get(invoice.customer_id).await?;
        let merchant_ref = format!("INV{}-{}", invoice.id, now.timestamp_millis());
        let request = PaymentRequest {
            method: method.code.clone(),
            merchant_ref: merchant_ref.clone(),
            amount: quote.total,
            customer_name: customer.name.clone(),
            customer_email: customer.email.clone(),
            customer_phone: customer.phone.clone(),
            item_name: format!("Internet {} ({})", invoice.period, customer.service_number),
            callback_url: self.urls.callback_url.clone(),
            return_url: self.urls.return_url.clone(),
        };

        let created = gateway.create_payment(&request).await.map_err(|e| {
            warn!(invoice_id = %invoice.id, gateway = gateway.name(), error = %e, "gateway checkout failed");
            BillingError::Gateway(e)
        })?;

        let tx = self
            .payments
            .insert(PaymentTransaction {
                id: 0,
                invoice_id: invoice.id,
                reference: created.reference,
                merchant_ref,
                method_code: method.code.clone(),
                amount: quote.amount,
                admin_fee: quote.admin_fee,
                total: quote.total,
                status: PaymentStatus::Pending,
                payment_url: created.payment_url,
                virtual_account: created.virtual_account,
                qr_url: created.qr_url,
                expires_at: created.expires_at,
                created_at: now,
                settled_at: None,
            })
            .await?;

        info!(
            reference = %tx.reference,
            invoice_id = %invoice.id,
            method = %method.code,
            total = %tx.total,
            "checkout created"
        );
        Ok(CheckoutSummary {
            reference: tx.reference,
            invoice_id: invoice.id,
            method_name: method.name,
            payment_url: tx.payment_url,
            virtual_account: tx.virtual_account,
            qr_url: tx.qr_url,
            amount: tx.amount,
            admin_fee: tx.admin_fee,
            total: tx.total,
            expires_at: tx.expires_at,
        })
    }

    /// Verify and apply a raw gateway callback
    pub async fn handle_callback(&self, body: &[u8], signature: &str) -> Result<ReconcileOutcome> {
        let gateway = self.gateway.clone().ok_or(BillingError::GatewayUnavailable)?;
        if !gateway.verify_callback(body, signature) {
            count("rejected");
            warn!(gateway = gateway.name(), "callback signature mismatch");
            return Err(BillingError::Validation("invalid callback signature".into()));
        }
        let notification = gateway
            .parse_callback(body)
            .map_err(|e| BillingError::Validation(e.to_string()))?;
        self.apply_gateway_notification(&notification.reference, notification.status, notification.amount)
            .await
    }

    /// Apply one gateway status report
    pub async fn apply_gateway_notification(
        &self,
        reference: &str,
        status: PaymentStatus,
        amount: Decimal,
    ) -> Result<ReconcileOutcome> {
        let lock = lock_for(&self.references, &reference.to_string());
        let _guard = lock.lock().await;

        let Some(mut tx) = self.payments.get_by_reference(reference).await? else {
            count("unknown");
            warn!(reference = %reference, "notification for unknown payment");
            return Err(BillingError::UnknownTransaction(reference.to_string()));
        };

        if tx.status.is_terminal() {
            count("replayed");
            debug!(reference = %reference, status = %tx.status, "replayed notification");
            return Ok(ReconcileOutcome::of(&tx, true, None));
        }

        match status {
            PaymentStatus::Pending => {
                count("pending");
                Ok(ReconcileOutcome::of(&tx, false, None))
            }
            PaymentStatus::Paid => {
                if amount != tx.total {
                    count("rejected");
                    warn!(reference = %reference, reported = %amount, expected = %tx.total, "paid amount mismatch");
                    return Err(BillingError::Validation(format!(
                        "paid amount {} does not match total {}",
                        amount, tx.total
                    )));
                }

                // invoice first: a failure leaves the transaction pending so
                // redelivery retries, and a repeated mark_paid is a no-op
                let now = Utc::now();
                let transition = match self.ledger.mark_paid(tx.invoice_id, now).await {
                    Ok(t) => Some(t),
                    Err(BillingError::Validation(reason)) => {
                        warn!(reference = %reference, invoice_id = %tx.invoice_id, reason = %reason, "payment settled for an invoice that cannot be paid");
                        None
                    }
                    Err(e) => return Err(e),
                };

                tx.status = PaymentStatus::Paid;
                tx.settled_at = Some(now);
                self.payments.update(&tx).await?;

                count("paid");
                info!(reference = %reference, invoice_id = %tx.invoice_id, total = %tx.total, "payment settled");
                self.notify_paid(&tx).await;
                Ok(ReconcileOutcome::of(&tx, false, transition))
            }
            PaymentStatus::Expired | PaymentStatus::Failed => {
                tx.status = status;
                self.payments.update(&tx).await?;
                count(if status == PaymentStatus::Expired { "expired" } else { "failed" });
                info!(reference = %reference, status = %status, "payment closed without settlement");
                Ok(ReconcileOutcome::of(&tx, false, None))
            }
        }
    }

    async fn notify_paid(&self, tx: &PaymentTransaction) {
        let invoice = self.ledger.get(tx.invoice_id, Utc::now()).await.ok();
        let customer = match &invoice {
            Some(inv) => self.customers.get(inv.customer_id).await.ok(),
            None => None,
        };
        dispatch(self.notifier.clone(), payment_message(tx, invoice.as_ref(), customer.as_ref()));
    }
}

fn payment_message(tx: &PaymentTransaction, invoice: Option<&Invoice>, customer: Option<&Customer>) -> String {
    let who = customer
        .map(|c| format!("{} ({})", c.name, c.service_number))
        .unwrap_or_else(|| "unknown customer".into());
    let period = invoice.map(|i| i.period.as_str()).unwrap_or("-");
    format!(
        "Payment received\nCustomer: {}\nInvoice: #{} period {}\nMethod: {}\nTotal: Rp {}\nRef: {}",
        who, tx.invoice_id, period, tx.method_code, tx.total, tx.reference
    )
}
