//! Propdesk Types - the shared vocabulary of the request desk
//!
//! Banks submit valuation and legal-verification requests, administrators
//! assign them to valuators and advocates, and professionals work them to a
//! terminal state. Every other crate in the workspace speaks in these types.

#![deny(unsafe_code)]

mod directory;
mod form;
mod ids;
mod identity;
mod page;
mod request;
mod wallet;

pub use directory::{Bank, BankBranch, User};
pub use form::{FieldDef, FieldInput, FieldType, FieldValidation, FieldValue, Form};
pub use ids::{BankId, BranchId, FormId, RequestId, TransactionId, UserId};
pub use identity::{ParseEnumError, Permission, PermissionSet, Principal};
pub use page::{Page, PageRequest};
pub use request::{ForWhom, Priority, Request, RequestStats, RequestStatus};
pub use wallet::{TransactionStatus, TransactionType, WalletTransaction};

pub use rust_decimal::Decimal;
