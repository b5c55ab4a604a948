//! Invoice and payment persistence

use async_trait::async_trait;
use netbill_common::{CustomerId, InvoiceId, RepoResult, RepositoryError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::invoice::Invoice;
use crate::payment::{PaymentStatus, PaymentTransaction};

/// Invoice repository
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Allocate an id for a new invoice
    async fn next_id(&self) -> RepoResult<InvoiceId>;
    async fn get(&self, id: InvoiceId) -> RepoResult<Invoice>;
    async fn save(&self, invoice: &Invoice) -> RepoResult<()>;
    async fn list(&self) -> RepoResult<Vec<Invoice>>;
    async fn list_by_customer(&self, customer_id: CustomerId) -> RepoResult<Vec<Invoice>>;
}

/// Payment transaction repository
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Record a new transaction; fails with `Conflict` on a duplicate reference
    async fn insert(&self, tx: PaymentTransaction) -> RepoResult<PaymentTransaction>;
    async fn update(&self, tx: &PaymentTransaction) -> RepoResult<()>;
    async fn get_by_reference(&self, reference: &str) -> RepoResult<Option<PaymentTransaction>>;
    async fn pending_for_invoice(&self, invoice_id: InvoiceId) -> RepoResult<Vec<PaymentTransaction>>;
    async fn list_for_invoice(&self, invoice_id: InvoiceId) -> RepoResult<Vec<PaymentTransaction>>;
}

/// In-memory invoice repository
pub struct InMemoryInvoiceRepository {
    invoices: RwLock<HashMap<InvoiceId, Invoice>>,
    sequence: AtomicU64,
}

impl InMemoryInvoiceRepository {
    pub fn new() -> Self {
        Self {
            invoices: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        }
    }

    /// Pre-populate; new ids continue after the largest seeded id
    pub fn with_invoices(invoices: impl IntoIterator<Item = Invoice>) -> Self {
        let map: HashMap<_, _> = invoices.into_iter().map(|i| (i.id, i)).collect();
        let next = map.keys().map(|id| id.0).max().unwrap_or(0) + 1;
        Self {
            invoices: RwLock::new(map),
            sequence: AtomicU64::new(next),
        }
    }
}

impl Default for InMemoryInvoiceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn next_id(&self) -> RepoResult<InvoiceId> {
        Ok(InvoiceId(self.sequence.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get(&self, id: InvoiceId) -> RepoResult<Invoice> {
        self.invoices
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("invoice {}", id)))
    }

    async fn save(&self, invoice: &Invoice) -> RepoResult<()> {
        self.invoices.write().insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn list(&self) -> RepoResult<Vec<Invoice>> {
        let mut all: Vec<_> = self.invoices.read().values().cloned().collect();
        all.sort_by_key(|i| i.id);
        Ok(all)
    }

    async fn list_by_customer(&self, customer_id: CustomerId) -> RepoResult<Vec<Invoice>> {
        let mut all: Vec<_> = self
            .invoices
            .read()
            .values()
            .filter(|i| i.customer_id == customer_id)
            .cloned()
            .collect();
        all.sort_by_key(|i| i.id);
        Ok(all)
    }
}

/// In-memory payment repository keyed by gateway reference
pub struct InMemoryPaymentRepository {
    transactions: RwLock<HashMap<String, PaymentTransaction>>,
    sequence: AtomicU64,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryPaymentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn insert(&self, mut tx: PaymentTransaction) -> RepoResult<PaymentTransaction> {
        let mut map = self.transactions.write();
        if map.contains_key(&tx.reference) {
            return Err(RepositoryError::Conflict(format!(
                "payment reference {} already recorded",
                tx.reference
            )));
        }
        tx.id = self.sequence.fetch_add(1, Ordering::SeqCst);
        map.insert(tx.reference.clone(), tx.clone());
        Ok(tx)
    }

    async fn update(&self, tx: &PaymentTransaction) -> RepoResult<()> {
        match self.transactions.write().get_mut(&tx.reference) {
            Some(existing) => {
                *existing = tx.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("payment {}", tx.reference))),
        }
    }

    async fn get_by_reference(&self, reference: &str) -> RepoResult<Option<PaymentTransaction>> {
        Ok(self.transactions.read().get(reference).cloned())
    }

    async fn pending_for_invoice(&self, invoice_id: InvoiceId) -> RepoResult<Vec<PaymentTransaction>> {
        Ok(self
            .list_for_invoice(invoice_id)
            .await?
            .into_iter()
            .filter(|t| t.status == PaymentStatus::Pending)
            .collect())
    }

    async fn list_for_invoice(&self, invoice_id: InvoiceId) -> RepoResult<Vec<PaymentTransaction>> {
        let mut all: Vec<_> = self
            .transactions
            .read()
            .values()
            .filter(|t| t.invoice_id == invoice_id)
            .cloned()
            .collect();
        all.sort_by_key(|t| t.id);
        Ok(all)
    }
}
