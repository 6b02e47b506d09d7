//! Wallet Ledger: per-user balances that never go negative.

use crate::access;
use crate::error::{PropdeskError, PropdeskResult, StorageResultExt};
use chrono::Utc;
use propdesk_storage::{
    max_wallet_balance, PropdeskStorage, UserStore, WalletEntry, WalletOutcome, WalletStore,
};
use propdesk_types::{
    Decimal, Page, PageRequest, Principal, TransactionType, UserId, WalletTransaction,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Money carries at most this many fractional digits.
pub const AMOUNT_SCALE: u32 = 2;

/// A committed ledger entry and the balance it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletReceipt {
    pub transaction: WalletTransaction,
    pub balance: Decimal,
}

pub struct WalletLedger {
    storage: Arc<dyn PropdeskStorage>,
}

impl WalletLedger {
    pub fn new(storage: Arc<dyn PropdeskStorage>) -> Self {
        Self { storage }
    }

    /// Credit or debit a user. The balance check and the write are one store
    /// call, so concurrent debits against the same user are serialized.
    #[instrument(skip(self, principal, description), fields(principal = %principal.id, kind = transaction_type.as_str()))]
    pub async fn apply_transaction(
        &self,
        principal: &Principal,
        user_id: &UserId,
        amount: Decimal,
        transaction_type: TransactionType,
        description: Option<String>,
    ) -> PropdeskResult<WalletReceipt> {
        if !access::is_admin(principal) {
            warn!("wallet transaction refused");
            return Err(PropdeskError::forbidden("apply wallet transaction"));
        }
        check_amount(amount)?;

        let description = description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| match transaction_type {
                TransactionType::Credit => "Wallet credit".to_string(),
                TransactionType::Debit => "Wallet debit".to_string(),
            });
        let entry = WalletEntry {
            user_id: user_id.clone(),
            amount,
            transaction_type,
            description,
            created_at: Utc::now(),
        };

        match self
            .storage
            .apply_wallet_entry(entry)
            .await
            .for_entity("user", user_id)?
        {
            WalletOutcome::Applied {
                transaction,
                balance,
            } => {
                info!(user_id = %user_id, %amount, %balance, "wallet transaction applied");
                Ok(WalletReceipt {
                    transaction,
                    balance,
                })
            }
            WalletOutcome::Insufficient { balance } => {
                warn!(user_id = %user_id, %amount, %balance, "wallet debit refused");
                Err(PropdeskError::InsufficientBalance {
                    user_id: user_id.clone(),
                    available: balance,
                    requested: amount,
                })
            }
            WalletOutcome::Overflow { balance } => {
                warn!(user_id = %user_id, %amount, %balance, "wallet credit refused");
                Err(PropdeskError::validation(
                    "amount",
                    format!("balance would exceed {}", max_wallet_balance()),
                ))
            }
        }
    }

    /// The cached balance. Admin or the account holder.
    pub async fn get_balance(&self, principal: &Principal, user_id: &UserId) -> PropdeskResult<Decimal> {
        self.authorize_read(principal, user_id)?;
        let user = self
            .storage
            .get_user(user_id)
            .await?
            .ok_or_else(|| PropdeskError::not_found("user", user_id))?;
        Ok(user.wallet_balance)
    }

    /// The balance recomputed from the ledger: completed credits minus
    /// completed debits. Always equal to [`Self::get_balance`].
    pub async fn replayed_balance(
        &self,
        principal: &Principal,
        user_id: &UserId,
    ) -> PropdeskResult<Decimal> {
        self.authorize_read(principal, user_id)?;
        let log = self.storage.wallet_log(user_id).await?;
        Ok(log.iter().map(WalletTransaction::signed_amount).sum())
    }

    /// Newest-first ledger page. Admin or the account holder.
    pub async fn history(
        &self,
        principal: &Principal,
        user_id: &UserId,
        page: PageRequest,
    ) -> PropdeskResult<Page<WalletTransaction>> {
        self.authorize_read(principal, user_id)?;
        Ok(self.storage.list_wallet_transactions(user_id, page).await?)
    }

    fn authorize_read(&self, principal: &Principal, user_id: &UserId) -> PropdeskResult<()> {
        if access::can_manage_user(principal, user_id) {
            Ok(())
        } else {
            Err(PropdeskError::forbidden("read another user's wallet"))
        }
    }
}

fn check_amount(amount: Decimal) -> PropdeskResult<()> {
    if amount <= Decimal::ZERO {
        return Err(PropdeskError::validation("amount", "must be greater than zero"));
    }
    if amount > max_wallet_balance() {
        return Err(PropdeskError::validation(
            "amount",
            format!("must not exceed {}", max_wallet_balance()),
        ));
    }
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(PropdeskError::validation(
            "amount",
            format!("at most {AMOUNT_SCALE} decimal places"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use propdesk_storage::InMemoryPropdeskStorage;
    use propdesk_types::{Permission, PermissionSet, User};

    fn admin() -> Principal {
        Principal::new(
            UserId::new("admin"),
            PermissionSet::of(&[Permission::Admin]),
            None,
        )
    }

    async fn ledger_with_user(id: &str) -> WalletLedger {
        let storage = Arc::new(InMemoryPropdeskStorage::new());
        storage
            .insert_user(User {
                id: UserId::new(id),
                email: format!("{id}@desk.test"),
                password_hash: String::new(),
                first_name: "Wallet".to_string(),
                last_name: "Holder".to_string(),
                phone_no: None,
                permissions: PermissionSet::of(&[Permission::Valuator]),
                bank_id: None,
                wallet_balance: Decimal::ZERO,
                is_active: true,
                created_at: Utc::now(),
                last_login_at: None,
            })
            .await
            .unwrap();
        WalletLedger::new(storage)
    }

    #[tokio::test]
    async fn amounts_are_positive_with_two_decimals() {
        let ledger = ledger_with_user("u-1").await;
        let user = UserId::new("u-1");
        for bad in [Decimal::ZERO, Decimal::new(-5, 0), Decimal::new(1005, 3)] {
            let err = ledger
                .apply_transaction(&admin(), &user, bad, TransactionType::Credit, None)
                .await
                .unwrap_err();
            assert_eq!(err.code(), "validation_error");
        }
        let ok = ledger
            .apply_transaction(&admin(), &user, Decimal::new(1050, 3), TransactionType::Credit, None)
            .await
            .unwrap();
        assert_eq!(ok.balance, Decimal::new(105, 2));
        assert_eq!(ok.transaction.description, "Wallet credit");
    }

    #[tokio::test]
    async fn only_admins_move_money_and_holders_read_their_own() {
        let ledger = ledger_with_user("u-1").await;
        let holder = Principal::new(
            UserId::new("u-1"),
            PermissionSet::of(&[Permission::Valuator]),
            None,
        );
        let stranger = Principal::new(
            UserId::new("u-2"),
            PermissionSet::of(&[Permission::Valuator]),
            None,
        );
        let user = UserId::new("u-1");

        assert!(matches!(
            ledger
                .apply_transaction(&holder, &user, Decimal::ONE, TransactionType::Credit, None)
                .await,
            Err(PropdeskError::Forbidden(_))
        ));
        assert_eq!(ledger.get_balance(&holder, &user).await.unwrap(), Decimal::ZERO);
        assert!(ledger.get_balance(&stranger, &user).await.is_err());
    }

    #[tokio::test]
    async fn unknown_users_are_not_found() {
        let ledger = ledger_with_user("u-1").await;
        let err = ledger
            .apply_transaction(
                &admin(),
                &UserId::new("ghost"),
                Decimal::ONE,
                TransactionType::Credit,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn credits_past_the_ceiling_are_refused_and_the_store_stays_usable() {
        let ledger = ledger_with_user("u-1").await;
        let user = UserId::new("u-1");

        let err = ledger
            .apply_transaction(&admin(), &user, Decimal::MAX, TransactionType::Credit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PropdeskError::Validation { ref field, .. } if field == "amount"));

        ledger
            .apply_transaction(&admin(), &user, max_wallet_balance(), TransactionType::Credit, None)
            .await
            .unwrap();
        let err = ledger
            .apply_transaction(&admin(), &user, Decimal::new(1, 2), TransactionType::Credit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PropdeskError::Validation { ref field, .. } if field == "amount"));

        assert_eq!(
            ledger.get_balance(&admin(), &user).await.unwrap(),
            max_wallet_balance()
        );
        let receipt = ledger
            .apply_transaction(&admin(), &user, Decimal::ONE, TransactionType::Debit, None)
            .await
            .unwrap();
        assert_eq!(receipt.balance, max_wallet_balance() - Decimal::ONE);
        assert_eq!(
            ledger.replayed_balance(&admin(), &user).await.unwrap(),
            receipt.balance
        );
    }

    fn arb_op() -> impl Strategy<Value = (TransactionType, Decimal)> {
        (
            prop_oneof![Just(TransactionType::Credit), Just(TransactionType::Debit)],
            1i64..50_000,
        )
            .prop_map(|(kind, cents)| (kind, Decimal::new(cents, 2)))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn balance_is_never_negative_and_matches_replay(ops in proptest::collection::vec(arb_op(), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = ledger_with_user("u-1").await;
                let user = UserId::new("u-1");
                let mut expected = Decimal::ZERO;

                for (kind, amount) in ops {
                    let result = ledger
                        .apply_transaction(&admin(), &user, amount, kind, None)
                        .await;
                    match (kind, result) {
                        (TransactionType::Credit, Ok(receipt)) => {
                            expected += amount;
                            assert_eq!(receipt.balance, expected);
                        }
                        (TransactionType::Debit, Ok(receipt)) => {
                            assert!(expected >= amount);
                            expected -= amount;
                            assert_eq!(receipt.balance, expected);
                        }
                        (TransactionType::Debit, Err(PropdeskError::InsufficientBalance { available, .. })) => {
                            assert!(expected < amount);
                            assert_eq!(available, expected);
                        }
                        (_, other) => panic!("unexpected outcome {other:?}"),
                    }
                    assert!(expected >= Decimal::ZERO);
                }

                let cached = ledger.get_balance(&admin(), &user).await.unwrap();
                let replayed = ledger.replayed_balance(&admin(), &user).await.unwrap();
                assert_eq!(cached, expected);
                assert_eq!(replayed, expected);
            });
        }
    }
}
