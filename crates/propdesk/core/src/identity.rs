//! Credential checks.

use crate::error::{PropdeskError, PropdeskResult, StorageResultExt};
use crate::session::{SessionToken, TokenIssuer};
use chrono::Utc;
use propdesk_storage::{PropdeskStorage, UserStore};
use propdesk_types::{Principal, User};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Verified against when an email is unknown so both failure paths hash.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$0sUvhMwu4NMp7nGJTS4sNK0aS7DptGDD2UXtRdOkD0o";

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Hash a plain password with argon2id.
pub fn hash_password(password: &str) -> PropdeskResult<String> {
    use argon2::Argon2;
    use password_hash::rand_core::OsRng;
    use password_hash::{PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!(error = %e, "password hashing failed");
            PropdeskError::Internal("password hashing failed".to_string())
        })
}

/// Verify a password against an argon2id hash. Any parse or verification
/// error is a mismatch.
pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::Argon2;
    use password_hash::{PasswordHash, PasswordVerifier};

    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// [`hash_password`] on the blocking pool, keeping argon2 off the async workers.
pub async fn hash_password_async(password: &str) -> PropdeskResult<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "password hashing task failed");
            PropdeskError::Internal("password hashing failed".to_string())
        })?
}

/// [`verify_password`] on the blocking pool. A failed task is a mismatch.
pub async fn verify_password_async(password: &str, hash: &str) -> bool {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .unwrap_or(false)
}

pub fn check_password_policy(password: &str) -> PropdeskResult<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(PropdeskError::validation(
            "password",
            format!("must be at least {MIN_PASSWORD_LENGTH} characters"),
        ));
    }
    Ok(())
}

pub fn principal_of(user: &User) -> Principal {
    Principal::new(user.id.clone(), user.permissions.clone(), user.bank_id.clone())
}

/// Exchanges credentials for a [`Principal`] and a session token.
pub struct IdentityService {
    storage: Arc<dyn PropdeskStorage>,
    tokens: Arc<dyn TokenIssuer>,
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub principal: Principal,
    pub session: SessionToken,
}

impl IdentityService {
    pub fn new(storage: Arc<dyn PropdeskStorage>, tokens: Arc<dyn TokenIssuer>) -> Self {
        Self { storage, tokens }
    }

    /// Look up the user by exact email, verify the password, reject inactive
    /// accounts, then record the login time.
    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, email: &str, password: &str) -> PropdeskResult<Principal> {
        let user = match self.storage.find_user_by_email(email).await? {
            Some(user) => user,
            None => {
                let _ = verify_password_async(password, DUMMY_HASH).await;
                warn!("login refused: unknown email");
                return Err(PropdeskError::InvalidCredentials);
            }
        };

        if !verify_password_async(password, &user.password_hash).await {
            warn!(user_id = %user.id, "login refused: password mismatch");
            return Err(PropdeskError::InvalidCredentials);
        }
        if !user.is_active {
            warn!(user_id = %user.id, "login refused: account inactive");
            return Err(PropdeskError::AccountInactive);
        }

        self.storage
            .record_login(&user.id, Utc::now())
            .await
            .for_entity("user", &user.id)?;
        info!(user_id = %user.id, "user authenticated");
        Ok(principal_of(&user))
    }

    pub async fn login(&self, email: &str, password: &str) -> PropdeskResult<LoginOutcome> {
        let principal = self.authenticate(email, password).await?;
        let session = self.tokens.issue(&principal)?;
        Ok(LoginOutcome { principal, session })
    }

    pub fn verify_token(&self, token: &str) -> PropdeskResult<Principal> {
        self.tokens.verify(token)
    }
}
