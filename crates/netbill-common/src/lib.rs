//! netbill Common - Shared types for subscriber billing and enforcement
//!
//! This crate provides the pieces every other netbill crate agrees on:
//! - Customer and profile records
//! - Entitlement change events (billing → enforcement)
//! - Repository abstractions with in-memory implementations
//! - Operator notification channel
//! - Stable error kinds
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  EntitlementChange  ┌──────────────────┐  commands  ┌────────────┐
//! │    Billing    │ ──────────────────► │   Enforcement    │ ─────────► │  RouterOS  │
//! │ (invoices,    │                     │ (retry/backoff)  │            │  session   │
//! │  payments)    │                     └──────────────────┘            └────────────┘
//! └───────────────┘
//! ```

#![warn(clippy::all)]

pub mod catalog;
pub mod domain;
pub mod entitlement;
pub mod error;
pub mod notify;
pub mod repositories;

pub use catalog::{CatalogError, ProfileCatalog, ProfileDraft};
pub use domain::*;
pub use entitlement::*;
pub use error::*;
pub use notify::{dispatch, Notifier, NotifyError, NoopNotifier, TelegramNotifier, TelegramSettings};
pub use repositories::*;
