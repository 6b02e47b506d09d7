//! Propdesk core: the request desk's domain rules over a pluggable store.
//!
//! The crate enforces:
//! - role-scoped authorization, routed through the [`access`] guard
//! - a closed request status machine with compare-and-set transitions
//! - form schemas whose values are validated and snapshotted per request
//! - a wallet ledger whose balance never goes negative
//!
//! [`Propdesk`] wires every component over one [`PropdeskStorage`] backend.

#![deny(unsafe_code)]

pub mod access;
pub mod directory;
pub mod error;
pub mod forms;
pub mod identity;
pub mod lifecycle;
pub mod session;
pub mod validation;
pub mod wallet;

pub use access::Transition;
pub use directory::{
    BankDraft, BankPatch, BranchDraft, BranchPatch, Directory, NewUser, UserPatch,
};
pub use error::{PropdeskError, PropdeskResult};
pub use forms::{FormDraft, FormPatch, FormSchemaStore};
pub use identity::{IdentityService, LoginOutcome};
pub use lifecycle::{Assignment, NewRequest, RequestLifecycle, StatusUpdate};
pub use session::{JwtTokenIssuer, SessionToken, TokenConfig, TokenIssuer};
pub use wallet::{WalletLedger, WalletReceipt};

use propdesk_storage::{InMemoryPropdeskStorage, PropdeskStorage};
use std::sync::Arc;

/// Persistence backend selection.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Process memory only; everything is lost on exit.
    #[default]
    Memory,
    /// PostgreSQL, schema created at connect. Needs the `postgres` feature.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PropdeskConfig {
    pub storage: StorageConfig,
    pub tokens: TokenConfig,
}

/// The request desk: every component sharing one store and one token issuer.
pub struct Propdesk {
    storage: Arc<dyn PropdeskStorage>,
    storage_label: &'static str,
    identity: IdentityService,
    directory: Directory,
    forms: FormSchemaStore,
    requests: RequestLifecycle,
    wallet: WalletLedger,
}

impl Propdesk {
    /// Connect the configured backend and wire the components over it.
    pub async fn bootstrap(config: PropdeskConfig) -> PropdeskResult<Self> {
        let label = config.storage.label();
        let storage: Arc<dyn PropdeskStorage> = match config.storage {
            StorageConfig::Memory => Arc::new(InMemoryPropdeskStorage::new()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => connect_postgres(&database_url, max_connections).await?,
        };
        let tokens: Arc<dyn TokenIssuer> = Arc::new(JwtTokenIssuer::new(config.tokens));
        let mut desk = Self::with_storage(storage, tokens);
        desk.storage_label = label;
        Ok(desk)
    }

    /// Wire the components over an existing store and token issuer.
    pub fn with_storage(storage: Arc<dyn PropdeskStorage>, tokens: Arc<dyn TokenIssuer>) -> Self {
        Self {
            identity: IdentityService::new(storage.clone(), tokens),
            directory: Directory::new(storage.clone()),
            forms: FormSchemaStore::new(storage.clone()),
            requests: RequestLifecycle::new(storage.clone()),
            wallet: WalletLedger::new(storage.clone()),
            storage_label: "custom",
            storage,
        }
    }

    /// An in-memory desk with default token settings.
    pub fn in_memory() -> Self {
        Self::with_storage(
            Arc::new(InMemoryPropdeskStorage::new()),
            Arc::new(JwtTokenIssuer::new(TokenConfig::default())),
        )
    }

    pub fn storage(&self) -> Arc<dyn PropdeskStorage> {
        self.storage.clone()
    }

    pub fn storage_label(&self) -> &'static str {
        self.storage_label
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn forms(&self) -> &FormSchemaStore {
        &self.forms
    }

    pub fn requests(&self) -> &RequestLifecycle {
        &self.requests
    }

    pub fn wallet(&self) -> &WalletLedger {
        &self.wallet
    }

    /// Create the first administrator when the user table is empty.
    pub async fn bootstrap_admin(
        &self,
        email: &str,
        password: &str,
    ) -> PropdeskResult<Option<propdesk_types::User>> {
        self.directory.bootstrap_admin(email, password).await
    }
}

#[cfg(feature = "postgres")]
async fn connect_postgres(
    database_url: &str,
    max_connections: u32,
) -> PropdeskResult<Arc<dyn PropdeskStorage>> {
    let store = propdesk_storage::postgres::PostgresPropdeskStorage::connect_with_options(
        database_url,
        max_connections,
        5,
    )
    .await
    .map_err(error::internal)?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_postgres(
    _database_url: &str,
    _max_connections: u32,
) -> PropdeskResult<Arc<dyn PropdeskStorage>> {
    Err(PropdeskError::Internal(
        "built without the `postgres` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_bootstrap_logs_in_the_seeded_admin() {
        let desk = Propdesk::bootstrap(PropdeskConfig::default()).await.unwrap();
        assert_eq!(desk.storage_label(), "memory");

        desk.bootstrap_admin("root@desk.test", "initial-pass")
            .await
            .unwrap()
            .unwrap();
        let outcome = desk
            .identity()
            .login("root@desk.test", "initial-pass")
            .await
            .unwrap();
        assert!(access::is_admin(&outcome.principal));

        let verified = desk.identity().verify_token(&outcome.session.token).unwrap();
        assert_eq!(verified, outcome.principal);

        assert_eq!(
            desk.identity().login("root@desk.test", "wrong-pass").await.unwrap_err(),
            PropdeskError::InvalidCredentials
        );
        assert_eq!(
            desk.identity().login("nobody@desk.test", "initial-pass").await.unwrap_err(),
            PropdeskError::InvalidCredentials
        );
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn postgres_config_needs_the_feature() {
        let config = PropdeskConfig {
            storage: StorageConfig::postgres("postgres://localhost/propdesk", 2),
            ..PropdeskConfig::default()
        };
        assert!(Propdesk::bootstrap(config).await.is_err());
    }
}
