//! Session tokens.
//!
//! A [`Principal`] is embedded in a signed HS256 token at login and rebuilt
//! from it on every later call without touching the user store. Permission
//! changes therefore take effect only once the caller's token expires.

use crate::error::{PropdeskError, PropdeskResult};
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use propdesk_types::{BankId, PermissionSet, Principal, UserId};
use serde::{Deserialize, Serialize};

/// Token issuance settings.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub ttl: Duration,
}

impl TokenConfig {
    pub const MIN_SECRET_LENGTH: usize = 32;
    /// Longest accepted token lifetime: 90 days.
    pub const MAX_TTL_HOURS: u32 = 24 * 90;

    /// Build a config, rejecting secrets shorter than [`Self::MIN_SECRET_LENGTH`] bytes.
    pub fn try_new(secret: impl Into<String>) -> PropdeskResult<Self> {
        let secret = secret.into();
        if secret.len() < Self::MIN_SECRET_LENGTH {
            return Err(PropdeskError::validation(
                "token_secret",
                format!(
                    "must be at least {} bytes, got {}",
                    Self::MIN_SECRET_LENGTH,
                    secret.len()
                ),
            ));
        }
        Ok(Self {
            secret,
            ..Self::default()
        })
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the lifetime in whole hours, within `1..=MAX_TTL_HOURS`.
    pub fn with_ttl_hours(self, hours: u32) -> PropdeskResult<Self> {
        if !(1..=Self::MAX_TTL_HOURS).contains(&hours) {
            return Err(PropdeskError::validation(
                "token_ttl_hours",
                format!("must be between 1 and {}, got {hours}", Self::MAX_TTL_HOURS),
            ));
        }
        Ok(self.with_ttl(Duration::hours(i64::from(hours))))
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "propdesk-local-dev-secret-change-me!!".to_string(),
            issuer: "propdesk".to_string(),
            ttl: Duration::hours(24),
        }
    }
}

/// An issued bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
}

/// Produces opaque bearer tokens for principals and recovers them.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, principal: &Principal) -> PropdeskResult<SessionToken>;
    fn verify(&self, token: &str) -> PropdeskResult<Principal>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    perms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bank: Option<String>,
    iat: i64,
    exp: i64,
    iss: String,
}

/// HS256 JWT implementation of [`TokenIssuer`].
pub struct JwtTokenIssuer {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtTokenIssuer {
    pub fn new(config: TokenConfig) -> Self {
        let encoding = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding,
            decoding,
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;
        validation
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(&self, principal: &Principal) -> PropdeskResult<SessionToken> {
        let now = Utc::now();
        let expires_at = now + self.config.ttl;
        let claims = Claims {
            sub: principal.id.to_string(),
            perms: principal.permissions.to_strings(),
            bank: principal.bank_id.as_ref().map(ToString::to_string),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.config.issuer.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            tracing::error!(error = %e, "token encoding failed");
            PropdeskError::Internal("token encoding failed".to_string())
        })?;
        Ok(SessionToken { token, expires_at })
    }

    fn verify(&self, token: &str) -> PropdeskResult<Principal> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation()).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => PropdeskError::ExpiredToken,
                _ => PropdeskError::InvalidToken,
            }
        })?;
        let claims = data.claims;
        let permissions =
            PermissionSet::parse_all(&claims.perms).map_err(|_| PropdeskError::InvalidToken)?;
        if permissions.is_empty() {
            return Err(PropdeskError::InvalidToken);
        }
        Ok(Principal::new(
            UserId::new(claims.sub),
            permissions,
            claims.bank.map(BankId::new),
        ))
    }
}
