use crate::identity::ParseEnumError;
use crate::ids::{TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Credit,
    Debit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
        }
    }
}

impl FromStr for TransactionType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(TransactionType::Credit),
            "debit" => Ok(TransactionType::Debit),
            other => Err(ParseEnumError::new("transaction type", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(ParseEnumError::new("transaction status", other)),
        }
    }
}

/// Append-only wallet ledger entry. `amount` is always positive; the
/// direction lives in `transaction_type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub description: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    /// Balance contribution of this entry. Only completed entries count.
    pub fn signed_amount(&self) -> Decimal {
        if self.status != TransactionStatus::Completed {
            return Decimal::ZERO;
        }
        match self.transaction_type {
            TransactionType::Credit => self.amount,
            TransactionType::Debit => -self.amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: TransactionType, status: TransactionStatus) -> WalletTransaction {
        WalletTransaction {
            id: TransactionId::generate(),
            user_id: UserId::new("u-1"),
            amount: Decimal::new(2550, 2),
            transaction_type: kind,
            description: "test".to_string(),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn signed_amount_follows_direction_and_status() {
        assert_eq!(
            entry(TransactionType::Credit, TransactionStatus::Completed).signed_amount(),
            Decimal::new(2550, 2)
        );
        assert_eq!(
            entry(TransactionType::Debit, TransactionStatus::Completed).signed_amount(),
            Decimal::new(-2550, 2)
        );
        assert_eq!(
            entry(TransactionType::Debit, TransactionStatus::Failed).signed_amount(),
            Decimal::ZERO
        );
    }
}
