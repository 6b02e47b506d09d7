//! Propdesk storage abstractions.
//!
//! This crate defines the persistence contract for the request desk:
//! - banks, branches and user accounts
//! - form templates
//! - requests and their compare-and-set lifecycle
//! - the wallet ledger with its cached balance
//!
//! Every check-then-write the domain relies on (status changes, guarded
//! deletes, wallet debits) is a single store call so that each backend can
//! make it atomic.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryPropdeskStorage;
pub use model::{
    max_wallet_balance, FormScope, RequestFilter, RequestScope, StatusChange, UserFilter,
    WalletEntry, WalletOutcome,
};
pub use traits::{BankStore, FormStore, PropdeskStorage, RequestStore, UserStore, WalletStore};
