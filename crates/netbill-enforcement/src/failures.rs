//! Operator-visible log of enforcement actions that gave up

use chrono::{DateTime, Utc};
use netbill_common::{CustomerId, ErrorKind, InvoiceId, NetworkClass};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of records kept
pub const DEFAULT_CAPACITY: usize = 1_000;

/// One failed enforcement action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub customer_id: CustomerId,
    pub invoice_id: InvoiceId,
    pub class: NetworkClass,
    pub attempts: u32,
    pub last_error: String,
    pub error_kind: ErrorKind,
    pub failed_at: DateTime<Utc>,
}

/// Bounded in-memory failure log; oldest records are dropped first
pub struct FailureLog {
    records: RwLock<VecDeque<FailureRecord>>,
    capacity: usize,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, record: FailureRecord) {
        let mut records = self.records.write();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<FailureRecord> {
        self.records.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn for_customer(&self, customer_id: CustomerId) -> Vec<FailureRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.customer_id == customer_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for FailureLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(customer: u64) -> FailureRecord {
        FailureRecord {
            customer_id: CustomerId(customer),
            invoice_id: InvoiceId(customer * 10),
            class: NetworkClass::Isolation,
            attempts: 5,
            last_error: "connection refused".into(),
            error_kind: ErrorKind::Connectivity,
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = FailureLog::new(2);
        log.record(record(1));
        log.record(record(2));
        log.record(record(3));

        assert_eq!(log.len(), 2);
        let ids: Vec<_> = log.recent(10).iter().map(|r| r.customer_id.0).collect();
        assert_eq!(ids, vec![3, 2]);
        assert!(log.for_customer(CustomerId(1)).is_empty());
    }
}
