//! Customer and profile records

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entitlement::NetworkClass;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Customer identifier
    CustomerId
);
id_type!(
    /// Profile identifier
    ProfileId
);
id_type!(
    /// Invoice identifier
    InvoiceId
);

/// Billing customer.
///
/// Enforcement only ever references a customer by id; the billing side owns the
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub profile_id: ProfileId,
    /// Human-facing service number printed on invoices
    pub service_number: String,
    /// Router session this subscriber's PPP secret lives on
    pub router: String,
    /// PPP secret name on the router
    pub secret_name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Network service class sold to customers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    pub price_monthly: Decimal,
    #[serde(default)]
    pub speed_label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Router profile applied while the customer is in good standing
    pub router_profile_normal: String,
    /// Router profile applied while the customer is overdue
    pub router_profile_isolation: String,
}

impl Profile {
    /// Router profile name for the given class
    pub fn router_profile(&self, class: NetworkClass) -> &str {
        match class {
            NetworkClass::Normal => &self.router_profile_normal,
            NetworkClass::Isolation => &self.router_profile_isolation,
        }
    }
}
