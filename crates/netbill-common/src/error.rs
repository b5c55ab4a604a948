//! Error kinds shared by every netbill crate

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable classification attached to every externally visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; reported to the caller, never retried
    Validation,
    /// Unknown customer, invoice, transaction or router
    NotFound,
    /// Payment provider failure
    Gateway,
    /// Router unreachable or timed out
    Connectivity,
    /// Router replied with a trap/fatal sentence
    Protocol,
    /// Competing state (e.g. a payment already pending)
    Conflict,
    /// Anything else (storage, serialization)
    Internal,
}

impl ErrorKind {
    /// Stable string form used in logs, metrics labels and HTTP bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Gateway => "gateway",
            Self::Connectivity => "connectivity",
            Self::Protocol => "protocol",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }

    /// Whether enforcement should retry a failure of this kind
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity | Self::Protocol)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every crate error so callers can classify failures uniformly.
pub trait Classify {
    /// Stable kind of this error
    fn kind(&self) -> ErrorKind;
}
