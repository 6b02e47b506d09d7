use propdesk_storage::StorageError;
use propdesk_types::{Decimal, RequestId, RequestStatus, UserId};
use thiserror::Error;

pub type PropdeskResult<T> = Result<T, PropdeskError>;

/// Typed failures of the request desk.
///
/// Every variant except `Internal` is an expected outcome the caller can act
/// on. `Internal` deliberately carries no detail beyond a short message; the
/// full context is logged where it is raised.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropdeskError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account is inactive")]
    AccountInactive,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid value for `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("request {request_id} cannot move from {from} to {to}")]
    InvalidTransition {
        request_id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("{kind} {id} conflict: {reason}")]
    Conflict {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("insufficient balance for {user_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        user_id: UserId,
        available: Decimal,
        requested: Decimal,
    },

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PropdeskError {
    pub fn forbidden(action: impl Into<String>) -> Self {
        Self::Forbidden(action.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for the variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountInactive => "account_inactive",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::Validation { .. } => "validation_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Conflict { .. } => "conflict",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::InvalidToken => "invalid_token",
            Self::ExpiredToken => "expired_token",
            Self::Internal(_) => "internal",
        }
    }
}

/// Attach entity context to storage failures.
pub(crate) trait StorageResultExt<T> {
    fn for_entity(self, kind: &'static str, id: impl ToString) -> PropdeskResult<T>;
}

impl<T> StorageResultExt<T> for Result<T, StorageError> {
    fn for_entity(self, kind: &'static str, id: impl ToString) -> PropdeskResult<T> {
        self.map_err(|err| match err {
            StorageError::NotFound(_) => PropdeskError::not_found(kind, id.to_string()),
            StorageError::Conflict(reason) => PropdeskError::Conflict {
                kind,
                id: id.to_string(),
                reason,
            },
            other => internal(other),
        })
    }
}

impl From<StorageError> for PropdeskError {
    fn from(err: StorageError) -> Self {
        internal(err)
    }
}

pub(crate) fn internal(err: impl std::fmt::Display) -> PropdeskError {
    tracing::error!(error = %err, "unexpected storage failure");
    PropdeskError::Internal("storage failure".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_gain_entity_context() {
        let err: PropdeskResult<()> =
            Err(StorageError::NotFound("row".to_string())).for_entity("form", "f-1");
        assert_eq!(err.unwrap_err(), PropdeskError::not_found("form", "f-1"));

        let err: PropdeskResult<()> =
            Err(StorageError::Backend("socket closed".to_string())).for_entity("form", "f-1");
        let err = err.unwrap_err();
        assert_eq!(err.code(), "internal");
        assert!(!err.to_string().contains("socket"));
    }
}
