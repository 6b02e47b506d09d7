use crate::model::{
    FormScope, RequestFilter, RequestScope, StatusChange, UserFilter, WalletEntry, WalletOutcome,
};
use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use propdesk_types::{
    Bank, BankBranch, BankId, BranchId, Form, FormId, Page, PageRequest, Request, RequestId,
    RequestStats, RequestStatus, User, UserId, WalletTransaction,
};

/// Storage interface for tenant banks and their branches.
#[async_trait]
pub trait BankStore: Send + Sync {
    /// Insert a bank. A duplicate `code` is a conflict.
    async fn insert_bank(&self, bank: Bank) -> StorageResult<()>;
    async fn update_bank(&self, bank: Bank) -> StorageResult<()>;
    async fn get_bank(&self, bank_id: &BankId) -> StorageResult<Option<Bank>>;
    /// List banks newest-first, optionally matching `search` against name or code.
    async fn list_banks(&self, search: Option<&str>, page: PageRequest)
        -> StorageResult<Page<Bank>>;
    /// Delete a bank unless a user or request still references it.
    async fn delete_bank_if_unreferenced(&self, bank_id: &BankId) -> StorageResult<()>;

    /// Insert a branch. The parent bank must exist.
    async fn insert_branch(&self, branch: BankBranch) -> StorageResult<()>;
    async fn update_branch(&self, branch: BankBranch) -> StorageResult<()>;
    async fn get_branch(&self, branch_id: &BranchId) -> StorageResult<Option<BankBranch>>;
    async fn list_branches(
        &self,
        bank_id: &BankId,
        search: Option<&str>,
        page: PageRequest,
    ) -> StorageResult<Page<BankBranch>>;
    /// Delete a branch unless a request still references it.
    async fn delete_branch_if_unreferenced(&self, branch_id: &BranchId) -> StorageResult<()>;
}

/// Storage interface for user accounts.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user. A duplicate email is a conflict.
    async fn insert_user(&self, user: User) -> StorageResult<()>;
    /// Replace profile, permission and status columns. The wallet balance is
    /// owned by [`WalletStore`] and is never written here.
    async fn update_user(&self, user: User) -> StorageResult<()>;
    async fn get_user(&self, user_id: &UserId) -> StorageResult<Option<User>>;
    /// Exact, case-sensitive lookup.
    async fn find_user_by_email(&self, email: &str) -> StorageResult<Option<User>>;
    async fn list_users(&self, filter: &UserFilter, page: PageRequest)
        -> StorageResult<Page<User>>;
    async fn count_users(&self) -> StorageResult<usize>;
    async fn record_login(&self, user_id: &UserId, at: DateTime<Utc>) -> StorageResult<()>;
    /// Delete a user unless they created or are assigned to a request, or own
    /// wallet transactions.
    async fn delete_user_if_unreferenced(&self, user_id: &UserId) -> StorageResult<()>;
}

/// Storage interface for form templates.
#[async_trait]
pub trait FormStore: Send + Sync {
    async fn insert_form(&self, form: Form) -> StorageResult<()>;
    async fn update_form(&self, form: Form) -> StorageResult<()>;
    async fn get_form(&self, form_id: &FormId) -> StorageResult<Option<Form>>;
    /// Defaults first, then newest-first.
    async fn list_forms(&self, scope: &FormScope) -> StorageResult<Vec<Form>>;
    /// Delete a form unless a request still references it.
    async fn delete_form_if_unreferenced(&self, form_id: &FormId) -> StorageResult<()>;
}

/// Storage interface for requests and their lifecycle.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a request. Its form, bank and branch must still exist at commit.
    async fn insert_request(&self, request: Request) -> StorageResult<()>;
    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<Request>>;
    /// Newest-first listing: scope, then filter, then count and page.
    async fn list_requests(
        &self,
        scope: &RequestScope,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> StorageResult<Page<Request>>;
    async fn request_stats(&self, scope: &RequestScope) -> StorageResult<RequestStats>;
    /// Compare-and-set status change. Fails with `InvariantViolation` when the
    /// stored status is no longer `expected_from`.
    async fn transition_request(
        &self,
        request_id: &RequestId,
        expected_from: RequestStatus,
        change: StatusChange,
    ) -> StorageResult<Request>;
    /// Delete a request whose status is one of `allowed`.
    async fn delete_request_in_status(
        &self,
        request_id: &RequestId,
        allowed: &[RequestStatus],
    ) -> StorageResult<()>;
}

/// Storage interface for the wallet ledger.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Check the balance and, when it stays non-negative, append the entry and
    /// update the cached balance in one atomic step.
    async fn apply_wallet_entry(&self, entry: WalletEntry) -> StorageResult<WalletOutcome>;
    /// Newest-first page of a user's ledger.
    async fn list_wallet_transactions(
        &self,
        user_id: &UserId,
        page: PageRequest,
    ) -> StorageResult<Page<WalletTransaction>>;
    /// The whole ledger for one user in commit order.
    async fn wallet_log(&self, user_id: &UserId) -> StorageResult<Vec<WalletTransaction>>;
}

/// Unified storage bundle used by the request desk.
pub trait PropdeskStorage:
    BankStore + UserStore + FormStore + RequestStore + WalletStore + Send + Sync
{
}

impl<T> PropdeskStorage for T where
    T: BankStore + UserStore + FormStore + RequestStore + WalletStore + Send + Sync
{
}
