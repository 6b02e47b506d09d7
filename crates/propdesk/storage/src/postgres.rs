//! PostgreSQL adapter for Propdesk storage.
//!
//! The transactional source-of-truth backend. Status changes are single
//! conditional updates; guarded deletes and wallet entries lock the parent
//! row with `SELECT ... FOR UPDATE` and re-check references inside the same
//! transaction.

use crate::model::{
    FormScope, RequestFilter, RequestScope, StatusChange, UserFilter, WalletEntry, WalletOutcome,
};
use crate::traits::{BankStore, FormStore, RequestStore, UserStore, WalletStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use propdesk_types::{
    Bank, BankBranch, BankId, BranchId, Decimal, FieldDef, FieldValue, Form, FormId, Page,
    PageRequest, PermissionSet, Request, RequestId, RequestStats, RequestStatus, TransactionId,
    TransactionStatus, User, UserId, WalletTransaction,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

const BANK_COLUMNS: &str =
    "id, name, code, address, contact_email, contact_phone, is_active, created_at, updated_at";
const BRANCH_COLUMNS: &str =
    "id, bank_id, name, address, city, state, zip_code, created_at, updated_at";
const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, phone_no, permissions, \
     bank_id, wallet_balance, is_active, created_at, last_login_at";
const FORM_COLUMNS: &str = "id, form_name, description, fields, is_default_form, bank_id, \
     owner_user_id, created_at, updated_at";
const REQUEST_COLUMNS: &str = "id, form_id, bank_id, bank_branch_id, created_by_user_id, for_whom, \
     fields, status, priority, assigned_valuator_id, assigned_advocate_id, return_reason, \
     completion_note, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, user_id, amount, transaction_type, description, status, created_at";

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresPropdeskStorage {
    pool: PgPool,
}

impl PostgresPropdeskStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS propdesk_banks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                code TEXT NOT NULL UNIQUE,
                address TEXT,
                contact_email TEXT,
                contact_phone TEXT,
                is_active BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS propdesk_bank_branches (
                id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL REFERENCES propdesk_banks(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                address TEXT,
                city TEXT,
                state TEXT,
                zip_code TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS propdesk_users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                phone_no TEXT,
                permissions TEXT[] NOT NULL,
                bank_id TEXT REFERENCES propdesk_banks(id),
                wallet_balance NUMERIC(14, 2) NOT NULL DEFAULT 0 CHECK (wallet_balance >= 0),
                is_active BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                last_login_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS propdesk_forms (
                id TEXT PRIMARY KEY,
                form_name TEXT NOT NULL,
                description TEXT,
                fields JSONB NOT NULL,
                is_default_form BOOLEAN NOT NULL,
                bank_id TEXT,
                owner_user_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS propdesk_requests (
                id TEXT PRIMARY KEY,
                form_id TEXT NOT NULL REFERENCES propdesk_forms(id),
                bank_id TEXT NOT NULL REFERENCES propdesk_banks(id),
                bank_branch_id TEXT REFERENCES propdesk_bank_branches(id),
                created_by_user_id TEXT NOT NULL,
                for_whom TEXT NOT NULL,
                fields JSONB NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                assigned_valuator_id TEXT,
                assigned_advocate_id TEXT,
                return_reason TEXT,
                completion_note TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS propdesk_wallet_transactions (
                seq BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL REFERENCES propdesk_users(id),
                amount NUMERIC(14, 2) NOT NULL CHECK (amount > 0),
                transaction_type TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS propdesk_requests_created_idx ON propdesk_requests (created_at DESC)",
            "CREATE INDEX IF NOT EXISTS propdesk_requests_bank_idx ON propdesk_requests (bank_id)",
            "CREATE INDEX IF NOT EXISTS propdesk_wallet_user_idx ON propdesk_wallet_transactions (user_id, seq)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl BankStore for PostgresPropdeskStorage {
    async fn insert_bank(&self, bank: Bank) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO propdesk_banks
                (id, name, code, address, contact_email, contact_phone, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(bank.id.0)
        .bind(bank.name)
        .bind(bank.code)
        .bind(bank.address)
        .bind(bank.contact_email)
        .bind(bank.contact_phone)
        .bind(bank.is_active)
        .bind(bank.created_at)
        .bind(bank.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn update_bank(&self, bank: Bank) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE propdesk_banks
               SET name = $1, code = $2, address = $3, contact_email = $4,
                   contact_phone = $5, is_active = $6, updated_at = $7
             WHERE id = $8
            "#,
        )
        .bind(bank.name)
        .bind(bank.code)
        .bind(bank.address)
        .bind(bank.contact_email)
        .bind(bank.contact_phone)
        .bind(bank.is_active)
        .bind(bank.updated_at)
        .bind(bank.id.0.clone())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("bank {} not found", bank.id)));
        }
        Ok(())
    }

    async fn get_bank(&self, bank_id: &BankId) -> StorageResult<Option<Bank>> {
        let row = sqlx::query(&format!(
            "SELECT {BANK_COLUMNS} FROM propdesk_banks WHERE id = $1"
        ))
        .bind(bank_id.0.clone())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(bank_row_to_record).transpose()
    }

    async fn list_banks(
        &self,
        search: Option<&str>,
        page: PageRequest,
    ) -> StorageResult<Page<Bank>> {
        let pattern = search.map(like_pattern);

        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS total FROM propdesk_banks WHERE TRUE",
        );
        push_bank_search(&mut count, pattern.clone());
        let total = fetch_total(count, &self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {BANK_COLUMNS} FROM propdesk_banks WHERE TRUE"
        ));
        push_bank_search(&mut select, pattern);
        push_page(&mut select, "created_at DESC", page)?;
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let items = rows
            .into_iter()
            .map(bank_row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    async fn delete_bank_if_unreferenced(&self, bank_id: &BankId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        lock_row(&mut tx, "propdesk_banks", &bank_id.0, "bank").await?;
        let users = count_where(&mut tx, "propdesk_users", "bank_id", &bank_id.0).await?;
        let requests = count_where(&mut tx, "propdesk_requests", "bank_id", &bank_id.0).await?;
        if users > 0 || requests > 0 {
            return Err(StorageError::Conflict(format!(
                "bank {} is referenced by {} user(s) and {} request(s)",
                bank_id, users, requests
            )));
        }

        sqlx::query("DELETE FROM propdesk_banks WHERE id = $1")
            .bind(bank_id.0.clone())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn insert_branch(&self, branch: BankBranch) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO propdesk_bank_branches
                (id, bank_id, name, address, city, state, zip_code, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(branch.id.0)
        .bind(branch.bank_id.0)
        .bind(branch.name)
        .bind(branch.address)
        .bind(branch.city)
        .bind(branch.state)
        .bind(branch.zip_code)
        .bind(branch.created_at)
        .bind(branch.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn update_branch(&self, branch: BankBranch) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE propdesk_bank_branches
               SET name = $1, address = $2, city = $3, state = $4, zip_code = $5, updated_at = $6
             WHERE id = $7
            "#,
        )
        .bind(branch.name)
        .bind(branch.address)
        .bind(branch.city)
        .bind(branch.state)
        .bind(branch.zip_code)
        .bind(branch.updated_at)
        .bind(branch.id.0.clone())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "branch {} not found",
                branch.id
            )));
        }
        Ok(())
    }

    async fn get_branch(&self, branch_id: &BranchId) -> StorageResult<Option<BankBranch>> {
        let row = sqlx::query(&format!(
            "SELECT {BRANCH_COLUMNS} FROM propdesk_bank_branches WHERE id = $1"
        ))
        .bind(branch_id.0.clone())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(branch_row_to_record).transpose()
    }

    async fn list_branches(
        &self,
        bank_id: &BankId,
        search: Option<&str>,
        page: PageRequest,
    ) -> StorageResult<Page<BankBranch>> {
        let pattern = search.map(like_pattern);

        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS total FROM propdesk_bank_branches WHERE bank_id = ",
        );
        count.push_bind(bank_id.0.clone());
        push_branch_search(&mut count, pattern.clone());
        let total = fetch_total(count, &self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {BRANCH_COLUMNS} FROM propdesk_bank_branches WHERE bank_id = "
        ));
        select.push_bind(bank_id.0.clone());
        push_branch_search(&mut select, pattern);
        push_page(&mut select, "created_at DESC", page)?;
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let items = rows
            .into_iter()
            .map(branch_row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    async fn delete_branch_if_unreferenced(&self, branch_id: &BranchId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        lock_row(&mut tx, "propdesk_bank_branches", &branch_id.0, "branch").await?;
        let requests =
            count_where(&mut tx, "propdesk_requests", "bank_branch_id", &branch_id.0).await?;
        if requests > 0 {
            return Err(StorageError::Conflict(format!(
                "branch {} is referenced by {} request(s)",
                branch_id, requests
            )));
        }

        sqlx::query("DELETE FROM propdesk_bank_branches WHERE id = $1")
            .bind(branch_id.0.clone())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PostgresPropdeskStorage {
    async fn insert_user(&self, user: User) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO propdesk_users
                (id, email, password_hash, first_name, last_name, phone_no, permissions,
                 bank_id, wallet_balance, is_active, created_at, last_login_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(user.id.0)
        .bind(user.email)
        .bind(user.password_hash)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(user.phone_no)
        .bind(user.permissions.to_strings())
        .bind(user.bank_id.map(|b| b.0))
        .bind(user.wallet_balance)
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.last_login_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn update_user(&self, user: User) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE propdesk_users
               SET email = $1, password_hash = $2, first_name = $3, last_name = $4,
                   phone_no = $5, permissions = $6, bank_id = $7, is_active = $8,
                   last_login_at = $9
             WHERE id = $10
            "#,
        )
        .bind(user.email)
        .bind(user.password_hash)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(user.phone_no)
        .bind(user.permissions.to_strings())
        .bind(user.bank_id.map(|b| b.0))
        .bind(user.is_active)
        .bind(user.last_login_at)
        .bind(user.id.0.clone())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("user {} not found", user.id)));
        }
        Ok(())
    }

    async fn get_user(&self, user_id: &UserId) -> StorageResult<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM propdesk_users WHERE id = $1"
        ))
        .bind(user_id.0.clone())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(user_row_to_record).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM propdesk_users WHERE email = $1"
        ))
        .bind(email.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(user_row_to_record).transpose()
    }

    async fn list_users(
        &self,
        filter: &UserFilter,
        page: PageRequest,
    ) -> StorageResult<Page<User>> {
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS total FROM propdesk_users WHERE TRUE",
        );
        push_user_filter(&mut count, filter);
        let total = fetch_total(count, &self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {USER_COLUMNS} FROM propdesk_users WHERE TRUE"
        ));
        push_user_filter(&mut select, filter);
        push_page(&mut select, "created_at DESC", page)?;
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let items = rows
            .into_iter()
            .map(user_row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    async fn count_users(&self) -> StorageResult<usize> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM propdesk_users")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?
            .try_get("total")
            .map_err(backend)?;
        to_usize(total)
    }

    async fn record_login(&self, user_id: &UserId, at: DateTime<Utc>) -> StorageResult<()> {
        let result = sqlx::query("UPDATE propdesk_users SET last_login_at = $1 WHERE id = $2")
            .bind(at)
            .bind(user_id.0.clone())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("user {} not found", user_id)));
        }
        Ok(())
    }

    async fn delete_user_if_unreferenced(&self, user_id: &UserId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        lock_row(&mut tx, "propdesk_users", &user_id.0, "user").await?;
        let requests: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total FROM propdesk_requests
             WHERE created_by_user_id = $1
                OR assigned_valuator_id = $1
                OR assigned_advocate_id = $1
            "#,
        )
        .bind(user_id.0.clone())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?
        .try_get("total")
        .map_err(backend)?;
        let transactions = count_where(
            &mut tx,
            "propdesk_wallet_transactions",
            "user_id",
            &user_id.0,
        )
        .await?;
        if requests > 0 || transactions > 0 {
            return Err(StorageError::Conflict(format!(
                "user {} is referenced by {} request(s) and {} wallet transaction(s)",
                user_id, requests, transactions
            )));
        }

        sqlx::query("DELETE FROM propdesk_users WHERE id = $1")
            .bind(user_id.0.clone())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl FormStore for PostgresPropdeskStorage {
    async fn insert_form(&self, form: Form) -> StorageResult<()> {
        let fields = serde_json::to_value(&form.fields)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO propdesk_forms
                (id, form_name, description, fields, is_default_form, bank_id, owner_user_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(form.id.0)
        .bind(form.form_name)
        .bind(form.description)
        .bind(fields)
        .bind(form.is_default_form)
        .bind(form.bank_id.map(|b| b.0))
        .bind(form.owner_user_id.0)
        .bind(form.created_at)
        .bind(form.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn update_form(&self, form: Form) -> StorageResult<()> {
        let fields = serde_json::to_value(&form.fields)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE propdesk_forms
               SET form_name = $1, description = $2, fields = $3, is_default_form = $4,
                   bank_id = $5, updated_at = $6
             WHERE id = $7
            "#,
        )
        .bind(form.form_name)
        .bind(form.description)
        .bind(fields)
        .bind(form.is_default_form)
        .bind(form.bank_id.map(|b| b.0))
        .bind(form.updated_at)
        .bind(form.id.0.clone())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("form {} not found", form.id)));
        }
        Ok(())
    }

    async fn get_form(&self, form_id: &FormId) -> StorageResult<Option<Form>> {
        let row = sqlx::query(&format!(
            "SELECT {FORM_COLUMNS} FROM propdesk_forms WHERE id = $1"
        ))
        .bind(form_id.0.clone())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(form_row_to_record).transpose()
    }

    async fn list_forms(&self, scope: &FormScope) -> StorageResult<Vec<Form>> {
        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {FORM_COLUMNS} FROM propdesk_forms WHERE TRUE"
        ));
        if let FormScope::DefaultsAnd(bank_id) = scope {
            select.push(" AND (is_default_form");
            if let Some(bank_id) = bank_id {
                select.push(" OR bank_id = ").push_bind(bank_id.0.clone());
            }
            select.push(")");
        }
        select.push(" ORDER BY is_default_form DESC, created_at DESC");

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(form_row_to_record).collect()
    }

    async fn delete_form_if_unreferenced(&self, form_id: &FormId) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        lock_row(&mut tx, "propdesk_forms", &form_id.0, "form").await?;
        let requests = count_where(&mut tx, "propdesk_requests", "form_id", &form_id.0).await?;
        if requests > 0 {
            return Err(StorageError::Conflict(format!(
                "form {} is referenced by {} request(s)",
                form_id, requests
            )));
        }

        sqlx::query("DELETE FROM propdesk_forms WHERE id = $1")
            .bind(form_id.0.clone())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl RequestStore for PostgresPropdeskStorage {
    async fn insert_request(&self, request: Request) -> StorageResult<()> {
        let fields = serde_json::to_value(&request.fields)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Share locks serialize against a concurrent guarded delete of any parent.
        share_row(&mut tx, "propdesk_forms", &request.form_id.0, "form").await?;
        share_row(&mut tx, "propdesk_banks", &request.bank_id.0, "bank").await?;
        if let Some(branch_id) = &request.bank_branch_id {
            share_row(&mut tx, "propdesk_bank_branches", &branch_id.0, "branch").await?;
        }

        sqlx::query(
            r#"
            INSERT INTO propdesk_requests
                (id, form_id, bank_id, bank_branch_id, created_by_user_id, for_whom, fields,
                 status, priority, assigned_valuator_id, assigned_advocate_id, return_reason,
                 completion_note, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(request.id.0)
        .bind(request.form_id.0)
        .bind(request.bank_id.0)
        .bind(request.bank_branch_id.map(|b| b.0))
        .bind(request.created_by_user_id.0)
        .bind(request.for_whom.as_str())
        .bind(fields)
        .bind(request.status.as_str())
        .bind(request.priority.as_str())
        .bind(request.assigned_valuator_id.map(|u| u.0))
        .bind(request.assigned_advocate_id.map(|u| u.0))
        .bind(request.return_reason)
        .bind(request.completion_note)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<Request>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM propdesk_requests WHERE id = $1"
        ))
        .bind(request_id.0.clone())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(request_row_to_record).transpose()
    }

    async fn list_requests(
        &self,
        scope: &RequestScope,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> StorageResult<Page<Request>> {
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS total FROM propdesk_requests WHERE TRUE",
        );
        push_request_scope(&mut count, scope);
        push_request_filter(&mut count, filter);
        let total = fetch_total(count, &self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {REQUEST_COLUMNS} FROM propdesk_requests WHERE TRUE"
        ));
        push_request_scope(&mut select, scope);
        push_request_filter(&mut select, filter);
        push_page(&mut select, "created_at DESC", page)?;
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let items = rows
            .into_iter()
            .map(request_row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    async fn request_stats(&self, scope: &RequestScope) -> StorageResult<RequestStats> {
        let mut select = QueryBuilder::<Postgres>::new(
            "SELECT status, COUNT(*) AS total FROM propdesk_requests WHERE TRUE",
        );
        push_request_scope(&mut select, scope);
        select.push(" GROUP BY status");

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let mut stats = RequestStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(backend)?;
            let total: i64 = row.try_get("total").map_err(backend)?;
            stats.add(parse_enum(&status)?, to_usize(total)?);
        }
        Ok(stats)
    }

    async fn transition_request(
        &self,
        request_id: &RequestId,
        expected_from: RequestStatus,
        change: StatusChange,
    ) -> StorageResult<Request> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE propdesk_requests
               SET status = $1,
                   assigned_valuator_id = COALESCE($2, assigned_valuator_id),
                   assigned_advocate_id = COALESCE($3, assigned_advocate_id),
                   return_reason = COALESCE($4, return_reason),
                   completion_note = COALESCE($5, completion_note),
                   updated_at = $6
             WHERE id = $7
               AND status = $8
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(change.to.as_str())
        .bind(change.assigned_valuator_id.map(|u| u.0))
        .bind(change.assigned_advocate_id.map(|u| u.0))
        .bind(change.return_reason)
        .bind(change.completion_note)
        .bind(change.updated_at)
        .bind(request_id.0.clone())
        .bind(expected_from.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => request_row_to_record(row),
            None => match self.get_request(request_id).await? {
                Some(current) => Err(StorageError::InvariantViolation(format!(
                    "request {} expected {}, found {}",
                    request_id, expected_from, current.status
                ))),
                None => Err(StorageError::NotFound(format!(
                    "request {} not found",
                    request_id
                ))),
            },
        }
    }

    async fn delete_request_in_status(
        &self,
        request_id: &RequestId,
        allowed: &[RequestStatus],
    ) -> StorageResult<()> {
        let allowed = allowed
            .iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();
        let result = sqlx::query("DELETE FROM propdesk_requests WHERE id = $1 AND status = ANY($2)")
            .bind(request_id.0.clone())
            .bind(allowed)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return match self.get_request(request_id).await? {
                Some(current) => Err(StorageError::InvariantViolation(format!(
                    "request {} cannot be deleted while {}",
                    request_id, current.status
                ))),
                None => Err(StorageError::NotFound(format!(
                    "request {} not found",
                    request_id
                ))),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl WalletStore for PostgresPropdeskStorage {
    async fn apply_wallet_entry(&self, entry: WalletEntry) -> StorageResult<WalletOutcome> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let row = sqlx::query("SELECT wallet_balance FROM propdesk_users WHERE id = $1 FOR UPDATE")
            .bind(entry.user_id.0.clone())
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("user {} not found", entry.user_id)))?;
        let current: Decimal = row.try_get("wallet_balance").map_err(backend)?;

        let balance = match entry.settle(current) {
            Ok(balance) => balance,
            Err(refusal) => {
                tx.rollback().await.map_err(backend)?;
                return Ok(refusal);
            }
        };

        let transaction = WalletTransaction {
            id: TransactionId::generate(),
            user_id: entry.user_id,
            amount: entry.amount,
            transaction_type: entry.transaction_type,
            description: entry.description,
            status: TransactionStatus::Completed,
            created_at: entry.created_at,
        };

        sqlx::query(
            r#"
            INSERT INTO propdesk_wallet_transactions
                (id, user_id, amount, transaction_type, description, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transaction.id.0.clone())
        .bind(transaction.user_id.0.clone())
        .bind(transaction.amount)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.description.clone())
        .bind(transaction.status.as_str())
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        sqlx::query("UPDATE propdesk_users SET wallet_balance = $1 WHERE id = $2")
            .bind(balance)
            .bind(transaction.user_id.0.clone())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
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
        let mut count = QueryBuilder::<Postgres>::new(
            "SELECT COUNT(*) AS total FROM propdesk_wallet_transactions WHERE user_id = ",
        );
        count.push_bind(user_id.0.clone());
        let total = fetch_total(count, &self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TRANSACTION_COLUMNS} FROM propdesk_wallet_transactions WHERE user_id = "
        ));
        select.push_bind(user_id.0.clone());
        push_page(&mut select, "seq DESC", page)?;
        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let items = rows
            .into_iter()
            .map(transaction_row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    async fn wallet_log(&self, user_id: &UserId) -> StorageResult<Vec<WalletTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM propdesk_wallet_transactions WHERE user_id = $1 ORDER BY seq ASC"
        ))
        .bind(user_id.0.clone())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(transaction_row_to_record).collect()
    }
}

fn push_bank_search(qb: &mut QueryBuilder<'_, Postgres>, pattern: Option<String>) {
    if let Some(pattern) = pattern {
        qb.push(" AND (name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR code ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

fn push_branch_search(qb: &mut QueryBuilder<'_, Postgres>, pattern: Option<String>) {
    if let Some(pattern) = pattern {
        qb.push(" AND (name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR city ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR state ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

fn push_user_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &UserFilter) {
    if let Some(search) = filter.search.as_deref() {
        let pattern = like_pattern(search);
        qb.push(" AND (first_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR last_name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR email ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR phone_no ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if !filter.permissions.is_empty() {
        qb.push(" AND permissions && ")
            .push_bind(filter.permissions.to_strings());
    }
    if let Some(bank_id) = &filter.bank_id {
        qb.push(" AND bank_id = ").push_bind(bank_id.0.clone());
    }
}

fn push_request_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: &RequestScope) {
    match scope {
        RequestScope::All => {}
        RequestScope::Professional {
            user_id,
            valuator,
            advocate,
        } => {
            let audience = RequestScope::professional_audience(*valuator, *advocate)
                .iter()
                .map(|f| f.as_str().to_string())
                .collect::<Vec<_>>();
            qb.push(" AND (assigned_valuator_id = ")
                .push_bind(user_id.0.clone())
                .push(" OR assigned_advocate_id = ")
                .push_bind(user_id.0.clone())
                .push(" OR for_whom = ANY(")
                .push_bind(audience)
                .push("))");
        }
        RequestScope::Bank(bank_id) => {
            qb.push(" AND bank_id = ").push_bind(bank_id.0.clone());
        }
        RequestScope::Creator(user_id) => {
            qb.push(" AND created_by_user_id = ")
                .push_bind(user_id.0.clone());
        }
    }
}

fn push_request_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &RequestFilter) {
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(for_whom) = filter.for_whom {
        qb.push(" AND for_whom = ").push_bind(for_whom.as_str());
    }
    if let Some(bank_id) = &filter.bank_id {
        qb.push(" AND bank_id = ").push_bind(bank_id.0.clone());
    }
    if let Some(user_id) = &filter.assigned_to {
        qb.push(" AND (assigned_valuator_id = ")
            .push_bind(user_id.0.clone())
            .push(" OR assigned_advocate_id = ")
            .push_bind(user_id.0.clone())
            .push(")");
    }
    if let Some(priority) = filter.priority {
        qb.push(" AND priority = ").push_bind(priority.as_str());
    }
}

fn push_page(
    qb: &mut QueryBuilder<'_, Postgres>,
    order_by: &str,
    page: PageRequest,
) -> StorageResult<()> {
    qb.push(" ORDER BY ")
        .push(order_by)
        .push(" LIMIT ")
        .push_bind(to_i64(page.limit)?)
        .push(" OFFSET ")
        .push_bind(to_i64(page.offset())?);
    Ok(())
}

async fn fetch_total(mut qb: QueryBuilder<'_, Postgres>, pool: &PgPool) -> StorageResult<usize> {
    let total: i64 = qb
        .build()
        .fetch_one(pool)
        .await
        .map_err(backend)?
        .try_get("total")
        .map_err(backend)?;
    to_usize(total)
}

async fn lock_row(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    table: &str,
    id: &str,
    kind: &str,
) -> StorageResult<()> {
    sqlx::query(&format!("SELECT id FROM {table} WHERE id = $1 FOR UPDATE"))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend)?
        .ok_or_else(|| StorageError::NotFound(format!("{kind} {id} not found")))?;
    Ok(())
}

async fn share_row(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    table: &str,
    id: &str,
    kind: &str,
) -> StorageResult<()> {
    sqlx::query(&format!("SELECT id FROM {table} WHERE id = $1 FOR SHARE"))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend)?
        .ok_or_else(|| StorageError::NotFound(format!("{kind} {id} not found")))?;
    Ok(())
}

async fn count_where(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    table: &str,
    column: &str,
    value: &str,
) -> StorageResult<i64> {
    sqlx::query(&format!(
        "SELECT COUNT(*) AS total FROM {table} WHERE {column} = $1"
    ))
    .bind(value.to_string())
    .fetch_one(&mut **tx)
    .await
    .map_err(backend)?
    .try_get("total")
    .map_err(backend)
}

fn bank_row_to_record(row: PgRow) -> StorageResult<Bank> {
    Ok(Bank {
        id: BankId(row.try_get("id").map_err(backend)?),
        name: row.try_get("name").map_err(backend)?,
        code: row.try_get("code").map_err(backend)?,
        address: row.try_get("address").map_err(backend)?,
        contact_email: row.try_get("contact_email").map_err(backend)?,
        contact_phone: row.try_get("contact_phone").map_err(backend)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn branch_row_to_record(row: PgRow) -> StorageResult<BankBranch> {
    Ok(BankBranch {
        id: BranchId(row.try_get("id").map_err(backend)?),
        bank_id: BankId(row.try_get("bank_id").map_err(backend)?),
        name: row.try_get("name").map_err(backend)?,
        address: row.try_get("address").map_err(backend)?,
        city: row.try_get("city").map_err(backend)?,
        state: row.try_get("state").map_err(backend)?,
        zip_code: row.try_get("zip_code").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn user_row_to_record(row: PgRow) -> StorageResult<User> {
    let permissions: Vec<String> = row.try_get("permissions").map_err(backend)?;
    Ok(User {
        id: UserId(row.try_get("id").map_err(backend)?),
        email: row.try_get("email").map_err(backend)?,
        password_hash: row.try_get("password_hash").map_err(backend)?,
        first_name: row.try_get("first_name").map_err(backend)?,
        last_name: row.try_get("last_name").map_err(backend)?,
        phone_no: row.try_get("phone_no").map_err(backend)?,
        permissions: PermissionSet::parse_all(permissions)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        bank_id: row
            .try_get::<Option<String>, _>("bank_id")
            .map_err(backend)?
            .map(BankId),
        wallet_balance: row.try_get("wallet_balance").map_err(backend)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        last_login_at: row.try_get("last_login_at").map_err(backend)?,
    })
}

fn form_row_to_record(row: PgRow) -> StorageResult<Form> {
    let fields: serde_json::Value = row.try_get("fields").map_err(backend)?;
    let fields: Vec<FieldDef> =
        serde_json::from_value(fields).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(Form {
        id: FormId(row.try_get("id").map_err(backend)?),
        form_name: row.try_get("form_name").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        fields,
        is_default_form: row.try_get("is_default_form").map_err(backend)?,
        bank_id: row
            .try_get::<Option<String>, _>("bank_id")
            .map_err(backend)?
            .map(BankId),
        owner_user_id: UserId(row.try_get("owner_user_id").map_err(backend)?),
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn request_row_to_record(row: PgRow) -> StorageResult<Request> {
    let fields: serde_json::Value = row.try_get("fields").map_err(backend)?;
    let fields: Vec<FieldValue> =
        serde_json::from_value(fields).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let for_whom: String = row.try_get("for_whom").map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;
    let priority: String = row.try_get("priority").map_err(backend)?;
    Ok(Request {
        id: RequestId(row.try_get("id").map_err(backend)?),
        form_id: FormId(row.try_get("form_id").map_err(backend)?),
        bank_id: BankId(row.try_get("bank_id").map_err(backend)?),
        bank_branch_id: row
            .try_get::<Option<String>, _>("bank_branch_id")
            .map_err(backend)?
            .map(BranchId),
        created_by_user_id: UserId(row.try_get("created_by_user_id").map_err(backend)?),
        for_whom: parse_enum(&for_whom)?,
        fields,
        status: parse_enum(&status)?,
        priority: parse_enum(&priority)?,
        assigned_valuator_id: row
            .try_get::<Option<String>, _>("assigned_valuator_id")
            .map_err(backend)?
            .map(UserId),
        assigned_advocate_id: row
            .try_get::<Option<String>, _>("assigned_advocate_id")
            .map_err(backend)?
            .map(UserId),
        return_reason: row.try_get("return_reason").map_err(backend)?,
        completion_note: row.try_get("completion_note").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn transaction_row_to_record(row: PgRow) -> StorageResult<WalletTransaction> {
    let transaction_type: String = row.try_get("transaction_type").map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(WalletTransaction {
        id: TransactionId(row.try_get("id").map_err(backend)?),
        user_id: UserId(row.try_get("user_id").map_err(backend)?),
        amount: row.try_get("amount").map_err(backend)?,
        transaction_type: parse_enum(&transaction_type)?,
        description: row.try_get("description").map_err(backend)?,
        status: parse_enum(&status)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn parse_enum<T>(value: &str) -> StorageResult<T>
where
    T: std::str::FromStr<Err = propdesk_types::ParseEnumError>,
{
    value
        .parse::<T>()
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn like_pattern(search: &str) -> String {
    let escaped = search
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => return StorageError::Conflict(db_err.message().to_string()),
            Some("23503") => return StorageError::NotFound(db_err.message().to_string()),
            _ => {}
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}

fn to_usize(value: i64) -> StorageResult<usize> {
    usize::try_from(value)
        .map_err(|_| StorageError::Backend(format!("negative count {value} from backend")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("hill"), "%hill%");
    }
}
