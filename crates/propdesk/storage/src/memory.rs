//! In-memory reference implementation of the Propdesk storage traits.
//!
//! All collections live behind a single lock so that every check-then-write
//! runs under one write guard. Deterministic and test-friendly; production
//! deployments should use the PostgreSQL backend.

use crate::model::{
    matches_search, FormScope, RequestFilter, RequestScope, StatusChange, UserFilter, WalletEntry,
    WalletOutcome,
};
use crate::traits::{BankStore, FormStore, RequestStore, UserStore, WalletStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use propdesk_types::{
    Bank, BankBranch, BankId, BranchId, Decimal, Form, FormId, Page, PageRequest, Request,
    RequestId, RequestStats, RequestStatus, TransactionId, TransactionStatus, User, UserId,
    WalletTransaction,
};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct State {
    banks: Vec<Bank>,
    branches: Vec<BankBranch>,
    users: Vec<User>,
    forms: Vec<Form>,
    requests: Vec<Request>,
    transactions: Vec<WalletTransaction>,
}

/// In-memory Propdesk storage adapter.
#[derive(Default)]
pub struct InMemoryPropdeskStorage {
    state: RwLock<State>,
}

impl InMemoryPropdeskStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
    }
}

#[async_trait]
impl BankStore for InMemoryPropdeskStorage {
    async fn insert_bank(&self, bank: Bank) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard.banks.iter().any(|b| b.id == bank.id) {
            return Err(StorageError::Conflict(format!("bank {} already exists", bank.id)));
        }
        if guard.banks.iter().any(|b| b.code == bank.code) {
            return Err(StorageError::Conflict(format!(
                "bank code {} already in use",
                bank.code
            )));
        }
        guard.banks.push(bank);
        Ok(())
    }

    async fn update_bank(&self, bank: Bank) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard
            .banks
            .iter()
            .any(|b| b.code == bank.code && b.id != bank.id)
        {
            return Err(StorageError::Conflict(format!(
                "bank code {} already in use",
                bank.code
            )));
        }
        let slot = guard
            .banks
            .iter_mut()
            .find(|b| b.id == bank.id)
            .ok_or_else(|| StorageError::NotFound(format!("bank {} not found", bank.id)))?;
        *slot = bank;
        Ok(())
    }

    async fn get_bank(&self, bank_id: &BankId) -> StorageResult<Option<Bank>> {
        let guard = self.read()?;
        Ok(guard.banks.iter().find(|b| &b.id == bank_id).cloned())
    }

    async fn list_banks(
        &self,
        search: Option<&str>,
        page: PageRequest,
    ) -> StorageResult<Page<Bank>> {
        let guard = self.read()?;
        let mut values = guard
            .banks
            .iter()
            .rev()
            .filter(|b| {
                search.map_or(true, |s| {
                    matches_search(s, &[Some(b.name.as_str()), Some(b.code.as_str())])
                })
            })
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(values, page))
    }

    async fn delete_bank_if_unreferenced(&self, bank_id: &BankId) -> StorageResult<()> {
        let mut guard = self.write()?;
        let position = guard
            .banks
            .iter()
            .position(|b| &b.id == bank_id)
            .ok_or_else(|| StorageError::NotFound(format!("bank {} not found", bank_id)))?;

        let users = guard
            .users
            .iter()
            .filter(|u| u.bank_id.as_ref() == Some(bank_id))
            .count();
        let requests = guard
            .requests
            .iter()
            .filter(|r| &r.bank_id == bank_id)
            .count();
        if users > 0 || requests > 0 {
            return Err(StorageError::Conflict(format!(
                "bank {} is referenced by {} user(s) and {} request(s)",
                bank_id, users, requests
            )));
        }

        guard.banks.remove(position);
        guard.branches.retain(|b| &b.bank_id != bank_id);
        Ok(())
    }

    async fn insert_branch(&self, branch: BankBranch) -> StorageResult<()> {
        let mut guard = self.write()?;
        if !guard.banks.iter().any(|b| b.id == branch.bank_id) {
            return Err(StorageError::NotFound(format!(
                "bank {} not found",
                branch.bank_id
            )));
        }
        if guard.branches.iter().any(|b| b.id == branch.id) {
            return Err(StorageError::Conflict(format!(
                "branch {} already exists",
                branch.id
            )));
        }
        guard.branches.push(branch);
        Ok(())
    }

    async fn update_branch(&self, branch: BankBranch) -> StorageResult<()> {
        let mut guard = self.write()?;
        let slot = guard
            .branches
            .iter_mut()
            .find(|b| b.id == branch.id)
            .ok_or_else(|| StorageError::NotFound(format!("branch {} not found", branch.id)))?;
        *slot = branch;
        Ok(())
    }

    async fn get_branch(&self, branch_id: &BranchId) -> StorageResult<Option<BankBranch>> {
        let guard = self.read()?;
        Ok(guard.branches.iter().find(|b| &b.id == branch_id).cloned())
    }

    async fn list_branches(
        &self,
        bank_id: &BankId,
        search: Option<&str>,
        page: PageRequest,
    ) -> StorageResult<Page<BankBranch>> {
        let guard = self.read()?;
        let mut values = guard
            .branches
            .iter()
            .rev()
            .filter(|b| &b.bank_id == bank_id)
            .filter(|b| {
                search.map_or(true, |s| {
                    matches_search(
                        s,
                        &[Some(b.name.as_str()), b.city.as_deref(), b.state.as_deref()],
                    )
                })
            })
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(values, page))
    }

    async fn delete_branch_if_unreferenced(&self, branch_id: &BranchId) -> StorageResult<()> {
        let mut guard = self.write()?;
        let position = guard
            .branches
            .iter()
            .position(|b| &b.id == branch_id)
            .ok_or_else(|| StorageError::NotFound(format!("branch {} not found", branch_id)))?;
        let requests = guard
            .requests
            .iter()
            .filter(|r| r.bank_branch_id.as_ref() == Some(branch_id))
            .count();
        if requests > 0 {
            return Err(StorageError::Conflict(format!(
                "branch {} is referenced by {} request(s)",
                branch_id, requests
            )));
        }
        guard.branches.remove(position);
        Ok(())
    }
}

#[async_trait]
impl UserStore for InMemoryPropdeskStorage {
    async fn insert_user(&self, user: User) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard.users.iter().any(|u| u.id == user.id) {
            return Err(StorageError::Conflict(format!("user {} already exists", user.id)));
        }
        if guard.users.iter().any(|u| u.email == user.email) {
            return Err(StorageError::Conflict(format!(
                "email {} already registered",
                user.email
            )));
        }
        if let Some(bank_id) = &user.bank_id {
            if !guard.banks.iter().any(|b| &b.id == bank_id) {
                return Err(StorageError::NotFound(format!("bank {} not found", bank_id)));
            }
        }
        guard.users.push(user);
        Ok(())
    }

    async fn update_user(&self, user: User) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard
            .users
            .iter()
            .any(|u| u.email == user.email && u.id != user.id)
        {
            return Err(StorageError::Conflict(format!(
                "email {} already registered",
                user.email
            )));
        }
        if let Some(bank_id) = &user.bank_id {
            if !guard.banks.iter().any(|b| &b.id == bank_id) {
                return Err(StorageError::NotFound(format!("bank {} not found", bank_id)));
            }
        }
        let slot = guard
            .users
            .iter_mut()
            .find(|u| u.id == user.id)
            .ok_or_else(|| StorageError::NotFound(format!("user {} not found", user.id)))?;
        let wallet_balance = slot.wallet_balance;
        let created_at = slot.created_at;
        *slot = User {
            wallet_balance,
            created_at,
            ..user
        };
        Ok(())
    }

    async fn get_user(&self, user_id: &UserId) -> StorageResult<Option<User>> {
        let guard = self.read()?;
        Ok(guard.users.iter().find(|u| &u.id == user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        let guard = self.read()?;
        Ok(guard.users.iter().find(|u| u.email == email).cloned())
    }

    async fn list_users(
        &self,
        filter: &UserFilter,
        page: PageRequest,
    ) -> StorageResult<Page<User>> {
        let guard = self.read()?;
        let mut values = guard
            .users
            .iter()
            .rev()
            .filter(|u| {
                filter.search.as_deref().map_or(true, |s| {
                    matches_search(
                        s,
                        &[
                            Some(u.first_name.as_str()),
                            Some(u.last_name.as_str()),
                            Some(u.email.as_str()),
                            u.phone_no.as_deref(),
                        ],
                    )
                })
            })
            .filter(|u| filter.permissions.is_empty() || u.permissions.intersects(&filter.permissions))
            .filter(|u| {
                filter
                    .bank_id
                    .as_ref()
                    .map_or(true, |b| u.bank_id.as_ref() == Some(b))
            })
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(values, page))
    }

    async fn count_users(&self) -> StorageResult<usize> {
        Ok(self.read()?.users.len())
    }

    async fn record_login(&self, user_id: &UserId, at: DateTime<Utc>) -> StorageResult<()> {
        let mut guard = self.write()?;
        let user = guard
            .users
            .iter_mut()
            .find(|u| &u.id == user_id)
            .ok_or_else(|| StorageError::NotFound(format!("user {} not found", user_id)))?;
        user.last_login_at = Some(at);
        Ok(())
    }

    async fn delete_user_if_unreferenced(&self, user_id: &UserId) -> StorageResult<()> {
        let mut guard = self.write()?;
        let position = guard
            .users
            .iter()
            .position(|u| &u.id == user_id)
            .ok_or_else(|| StorageError::NotFound(format!("user {} not found", user_id)))?;
        let requests = guard
            .requests
            .iter()
            .filter(|r| &r.created_by_user_id == user_id || r.is_assignee(user_id))
            .count();
        let transactions = guard
            .transactions
            .iter()
            .filter(|t| &t.user_id == user_id)
            .count();
        if requests > 0 || transactions > 0 {
            return Err(StorageError::Conflict(format!(
                "user {} is referenced by {} request(s) and {} wallet transaction(s)",
                user_id, requests, transactions
            )));
        }
        guard.users.remove(position);
        Ok(())
    }
}

#[async_trait]
impl FormStore for InMemoryPropdeskStorage {
    async fn insert_form(&self, form: Form) -> StorageResult<()> {
        let mut guard = self.write()?;
        if guard.forms.iter().any(|f| f.id == form.id) {
            return Err(StorageError::Conflict(format!("form {} already exists", form.id)));
        }
        guard.forms.push(form);
        Ok(())
    }

    async fn update_form(&self, form: Form) -> StorageResult<()> {
        let mut guard = self.write()?;
        let slot = guard
            .forms
            .iter_mut()
            .find(|f| f.id == form.id)
            .ok_or_else(|| StorageError::NotFound(format!("form {} not found", form.id)))?;
        *slot = form;
        Ok(())
    }

    async fn get_form(&self, form_id: &FormId) -> StorageResult<Option<Form>> {
        let guard = self.read()?;
        Ok(guard.forms.iter().find(|f| &f.id == form_id).cloned())
    }

    async fn list_forms(&self, scope: &FormScope) -> StorageResult<Vec<Form>> {
        let guard = self.read()?;
        let mut values = guard
            .forms
            .iter()
            .rev()
            .filter(|f| scope.matches(f))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| {
            b.is_default_form
                .cmp(&a.is_default_form)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(values)
    }

    async fn delete_form_if_unreferenced(&self, form_id: &FormId) -> StorageResult<()> {
        let mut guard = self.write()?;
        let position = guard
            .forms
            .iter()
            .position(|f| &f.id == form_id)
            .ok_or_else(|| StorageError::NotFound(format!("form {} not found", form_id)))?;
        let requests = guard
            .requests
            .iter()
            .filter(|r| &r.form_id == form_id)
            .count();
        if requests > 0 {
            return Err(StorageError::Conflict(format!(
                "form {} is referenced by {} request(s)",
                form_id, requests
            )));
        }
        guard.forms.remove(position);
        Ok(())
    }
}

#[async_trait]
impl RequestStore for InMemoryPropdeskStorage {
    async fn insert_request(&self, request: Request) -> StorageResult<()> {
        let mut guard = self.write()?;
        if !guard.forms.iter().any(|f| f.id == request.form_id) {
            return Err(StorageError::NotFound(format!(
                "form {} not found",
                request.form_id
            )));
        }
        if !guard.banks.iter().any(|b| b.id == request.bank_id) {
            return Err(StorageError::NotFound(format!(
                "bank {} not found",
                request.bank_id
            )));
        }
        if let Some(branch_id) = &request.bank_branch_id {
            if !guard.branches.iter().any(|b| &b.id == branch_id) {
                return Err(StorageError::NotFound(format!(
                    "branch {} not found",
                    branch_id
                )));
            }
        }
        if guard.requests.iter().any(|r| r.id == request.id) {
            return Err(StorageError::Conflict(format!(
                "request {} already exists",
                request.id
            )));
        }
        guard.requests.push(request);
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<Request>> {
        let guard = self.read()?;
        Ok(guard.requests.iter().find(|r| &r.id == request_id).cloned())
    }

    async fn list_requests(
        &self,
        scope: &RequestScope,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> StorageResult<Page<Request>> {
        let guard = self.read()?;
        let mut values = guard
            .requests
            .iter()
            .rev()
            .filter(|r| scope.matches(r))
            .filter(|r| filter.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(values, page))
    }

    async fn request_stats(&self, scope: &RequestScope) -> StorageResult<RequestStats> {
        let guard = self.read()?;
        let mut stats = RequestStats::default();
        for request in guard.requests.iter().filter(|r| scope.matches(r)) {
            stats.record(request.status);
        }
        Ok(stats)
    }

    async fn transition_request(
        &self,
        request_id: &RequestId,
        expected_from: RequestStatus,
        change: StatusChange,
    ) -> StorageResult<Request> {
        let mut guard = self.write()?;
        let request = guard
            .requests
            .iter_mut()
            .find(|r| &r.id == request_id)
            .ok_or_else(|| StorageError::NotFound(format!("request {} not found", request_id)))?;

        if request.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "request {} expected {}, found {}",
                request_id, expected_from, request.status
            )));
        }

        change.apply(request);
        Ok(request.clone())
    }

    async fn delete_request_in_status(
        &self,
        request_id: &RequestId,
        allowed: &[RequestStatus],
    ) -> StorageResult<()> {
        let mut guard = self.write()?;
        let position = guard
            .requests
            .iter()
            .position(|r| &r.id == request_id)
            .ok_or_else(|| StorageError::NotFound(format!("request {} not found", request_id)))?;
        let status = guard.requests[position].status;
        if !allowed.contains(&status) {
            return Err(StorageError::InvariantViolation(format!(
                "request {} cannot be deleted while {}",
                request_id, status
            )));
        }
        guard.requests.remove(position);
        Ok(())
    }
}

#[async_trait]
impl WalletStore for InMemoryPropdeskStorage {
    async fn apply_wallet_entry(&self, entry: WalletEntry) -> StorageResult<WalletOutcome> {
        let mut guard = self.write()?;
        let user = guard
            .users
            .iter_mut()
            .find(|u| u.id == entry.user_id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("user {} not found", entry.user_id))
            })?;

        let balance = match entry.settle(user.wallet_balance) {
            Ok(balance) => balance,
            Err(refusal) => return Ok(refusal),
        };
        user.wallet_balance = balance;

        let transaction = WalletTransaction {
            id: TransactionId::generate(),
            user_id: entry.user_id,
            amount: entry.amount,
            transaction_type: entry.transaction_type,
            description: entry.description,
            status: TransactionStatus::Completed,
            created_at: entry.created_at,
        };
        guard.transactions.push(transaction.clone());
        Ok(WalletOutcome::Applied {
            transaction,
            balance,
        })
    }

    async fn list_wallet_transactions(
        &self,
        user_id: &UserId,
        page: PageRequest,
    ) -> StorageResult<Page<WalletTransaction>> {
        let guard = self.read()?;
        let mut values = guard
            .transactions
            .iter()
            .rev()
            .filter(|t| &t.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(values, page))
    }

    async fn wallet_log(&self, user_id: &UserId) -> StorageResult<Vec<WalletTransaction>> {
        let guard = self.read()?;
        Ok(guard
            .transactions
            .iter()
            .filter(|t| &t.user_id == user_id)
            .cloned()
            .collect())
    }
}

fn paginate<T>(items: Vec<T>, page: PageRequest) -> Page<T> {
    let total = items.len();
    let items = items
        .into_iter()
        .skip(page.offset())
        .take(page.limit)
        .collect();
    Page::new(items, total, page)
}
