//! Banks, branches and user accounts.

use crate::access;
use crate::error::{PropdeskError, PropdeskResult, StorageResultExt};
use crate::identity::{check_password_policy, hash_password_async};
use crate::validation::looks_like_email;
use chrono::Utc;
use propdesk_storage::{BankStore, PropdeskStorage, UserFilter, UserStore};
use propdesk_types::{
    Bank, BankBranch, BankId, BranchId, Decimal, Page, PageRequest, PermissionSet, Principal,
    User, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankDraft {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankPatch {
    pub name: Option<String>,
    pub code: Option<String>,
    pub address: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDraft {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchPatch {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
}

/// Input for a new account. `password` is plain text and hashed on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone_no: Option<String>,
    pub permissions: PermissionSet,
    #[serde(default)]
    pub bank_id: Option<BankId>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Partial account update. The last three fields are admin-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    pub email: Option<String>,
    pub password: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_no: Option<String>,
    pub permissions: Option<PermissionSet>,
    pub bank_id: Option<BankId>,
    pub is_active: Option<bool>,
}

impl UserPatch {
    fn touches_admin_fields(&self) -> bool {
        self.permissions.is_some() || self.bank_id.is_some() || self.is_active.is_some()
    }
}

pub struct Directory {
    storage: Arc<dyn PropdeskStorage>,
}

impl Directory {
    pub fn new(storage: Arc<dyn PropdeskStorage>) -> Self {
        Self { storage }
    }

    // -- banks ---------------------------------------------------------------

    #[instrument(skip(self, principal, draft), fields(principal = %principal.id, code = %draft.code))]
    pub async fn create_bank(&self, principal: &Principal, draft: BankDraft) -> PropdeskResult<Bank> {
        require_bank_manager(principal, "create bank")?;
        let name = non_empty("name", &draft.name)?;
        let code = non_empty("code", &draft.code)?;
        let now = Utc::now();
        let bank = Bank {
            id: BankId::generate(),
            name,
            code,
            address: draft.address,
            contact_email: draft.contact_email,
            contact_phone: draft.contact_phone,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.storage
            .insert_bank(bank.clone())
            .await
            .for_entity("bank", &bank.code)?;
        info!(bank_id = %bank.id, "bank created");
        Ok(bank)
    }

    #[instrument(skip(self, principal, patch), fields(principal = %principal.id))]
    pub async fn update_bank(
        &self,
        principal: &Principal,
        bank_id: &BankId,
        patch: BankPatch,
    ) -> PropdeskResult<Bank> {
        require_bank_manager(principal, "update bank")?;
        let mut bank = self.load_bank(bank_id).await?;
        if let Some(name) = patch.name {
            bank.name = non_empty("name", &name)?;
        }
        if let Some(code) = patch.code {
            bank.code = non_empty("code", &code)?;
        }
        if patch.address.is_some() {
            bank.address = patch.address;
        }
        if patch.contact_email.is_some() {
            bank.contact_email = patch.contact_email;
        }
        if patch.contact_phone.is_some() {
            bank.contact_phone = patch.contact_phone;
        }
        if let Some(active) = patch.is_active {
            bank.is_active = active;
        }
        bank.updated_at = Utc::now();
        self.storage
            .update_bank(bank.clone())
            .await
            .for_entity("bank", bank_id)?;
        info!(bank_id = %bank_id, "bank updated");
        Ok(bank)
    }

    /// Admins see every bank; members see their own. Anything else is `NotFound`.
    pub async fn get_bank(&self, principal: &Principal, bank_id: &BankId) -> PropdeskResult<Bank> {
        if !access::is_admin(principal) && principal.bank_id.as_ref() != Some(bank_id) {
            return Err(PropdeskError::not_found("bank", bank_id));
        }
        self.load_bank(bank_id).await
    }

    pub async fn list_banks(
        &self,
        principal: &Principal,
        search: Option<&str>,
        page: PageRequest,
    ) -> PropdeskResult<Page<Bank>> {
        require_admin(principal, "list banks")?;
        Ok(self.storage.list_banks(search, page).await?)
    }

    /// Refused with `Conflict` while a user or request references the bank.
    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub async fn delete_bank(&self, principal: &Principal, bank_id: &BankId) -> PropdeskResult<()> {
        require_bank_manager(principal, "delete bank")?;
        self.storage
            .delete_bank_if_unreferenced(bank_id)
            .await
            .for_entity("bank", bank_id)?;
        info!(bank_id = %bank_id, "bank deleted");
        Ok(())
    }

    // -- branches ------------------------------------------------------------

    #[instrument(skip(self, principal, draft), fields(principal = %principal.id))]
    pub async fn create_branch(
        &self,
        principal: &Principal,
        bank_id: &BankId,
        draft: BranchDraft,
    ) -> PropdeskResult<BankBranch> {
        require_bank_manager(principal, "create branch")?;
        let name = non_empty("name", &draft.name)?;
        let now = Utc::now();
        let branch = BankBranch {
            id: BranchId::generate(),
            bank_id: bank_id.clone(),
            name,
            address: draft.address,
            city: draft.city,
            state: draft.state,
            zip_code: draft.zip_code,
            created_at: now,
            updated_at: now,
        };
        self.storage
            .insert_branch(branch.clone())
            .await
            .for_entity("bank", bank_id)?;
        info!(bank_id = %bank_id, branch_id = %branch.id, "branch created");
        Ok(branch)
    }

    #[instrument(skip(self, principal, patch), fields(principal = %principal.id))]
    pub async fn update_branch(
        &self,
        principal: &Principal,
        branch_id: &BranchId,
        patch: BranchPatch,
    ) -> PropdeskResult<BankBranch> {
        require_bank_manager(principal, "update branch")?;
        let mut branch = self
            .storage
            .get_branch(branch_id)
            .await?
            .ok_or_else(|| PropdeskError::not_found("branch", branch_id))?;
        if let Some(name) = patch.name {
            branch.name = non_empty("name", &name)?;
        }
        if patch.address.is_some() {
            branch.address = patch.address;
        }
        if patch.city.is_some() {
            branch.city = patch.city;
        }
        if patch.state.is_some() {
            branch.state = patch.state;
        }
        if patch.zip_code.is_some() {
            branch.zip_code = patch.zip_code;
        }
        branch.updated_at = Utc::now();
        self.storage
            .update_branch(branch.clone())
            .await
            .for_entity("branch", branch_id)?;
        info!(branch_id = %branch_id, "branch updated");
        Ok(branch)
    }

    /// Branches of one bank. Admin or a member of that bank.
    pub async fn list_branches(
        &self,
        principal: &Principal,
        bank_id: &BankId,
        search: Option<&str>,
        page: PageRequest,
    ) -> PropdeskResult<Page<BankBranch>> {
        self.get_bank(principal, bank_id).await?;
        Ok(self.storage.list_branches(bank_id, search, page).await?)
    }

    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub async fn delete_branch(
        &self,
        principal: &Principal,
        branch_id: &BranchId,
    ) -> PropdeskResult<()> {
        require_bank_manager(principal, "delete branch")?;
        self.storage
            .delete_branch_if_unreferenced(branch_id)
            .await
            .for_entity("branch", branch_id)?;
        info!(branch_id = %branch_id, "branch deleted");
        Ok(())
    }

    // -- users ---------------------------------------------------------------

    #[instrument(skip(self, principal, input), fields(principal = %principal.id, email = %input.email))]
    pub async fn create_user(&self, principal: &Principal, input: NewUser) -> PropdeskResult<User> {
        require_admin(principal, "create user")?;
        let user = self.new_account(input).await?;
        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    /// Seed the first administrator. Only succeeds on an empty user table.
    #[instrument(skip(self, password))]
    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> PropdeskResult<Option<User>> {
        if self.storage.count_users().await? > 0 {
            return Ok(None);
        }
        let user = self
            .new_account(NewUser {
                email: email.to_string(),
                password: password.to_string(),
                first_name: "System".to_string(),
                last_name: "Administrator".to_string(),
                phone_no: None,
                permissions: PermissionSet::of(&[propdesk_types::Permission::Admin]),
                bank_id: None,
                is_active: true,
            })
            .await?;
        info!(user_id = %user.id, "bootstrap administrator created");
        Ok(Some(user))
    }

    /// Admins update anything; a user may edit their own profile fields.
    #[instrument(skip(self, principal, patch), fields(principal = %principal.id))]
    pub async fn update_user(
        &self,
        principal: &Principal,
        user_id: &UserId,
        patch: UserPatch,
    ) -> PropdeskResult<User> {
        let mut user = self.get_user(principal, user_id).await?;
        if patch.touches_admin_fields() && !access::is_admin(principal) {
            warn!("account role change refused");
            return Err(PropdeskError::forbidden("change permissions, bank or status"));
        }

        if let Some(email) = patch.email {
            user.email = check_email(&email)?;
        }
        if let Some(password) = patch.password {
            check_password_policy(&password)?;
            user.password_hash = hash_password_async(&password).await?;
        }
        if let Some(first) = patch.first_name {
            user.first_name = non_empty("firstName", &first)?;
        }
        if let Some(last) = patch.last_name {
            user.last_name = non_empty("lastName", &last)?;
        }
        if patch.phone_no.is_some() {
            user.phone_no = patch.phone_no;
        }
        if let Some(permissions) = patch.permissions {
            check_permissions(&permissions)?;
            user.permissions = permissions;
        }
        if let Some(bank_id) = patch.bank_id {
            self.load_bank(&bank_id).await?;
            user.bank_id = Some(bank_id);
        }
        if let Some(active) = patch.is_active {
            user.is_active = active;
        }

        self.storage
            .update_user(user.clone())
            .await
            .for_entity("user", user_id)?;
        info!(user_id = %user_id, "user updated");
        Ok(user)
    }

    /// Admin or the user themself; anyone else gets `NotFound`.
    pub async fn get_user(&self, principal: &Principal, user_id: &UserId) -> PropdeskResult<User> {
        if !access::can_manage_user(principal, user_id) {
            return Err(PropdeskError::not_found("user", user_id));
        }
        self.storage
            .get_user(user_id)
            .await?
            .ok_or_else(|| PropdeskError::not_found("user", user_id))
    }

    pub async fn list_users(
        &self,
        principal: &Principal,
        filter: &UserFilter,
        page: PageRequest,
    ) -> PropdeskResult<Page<User>> {
        require_admin(principal, "list users")?;
        Ok(self.storage.list_users(filter, page).await?)
    }

    /// Refused with `Conflict` while the user created or works a request, or
    /// holds wallet history.
    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub async fn delete_user(&self, principal: &Principal, user_id: &UserId) -> PropdeskResult<()> {
        require_admin(principal, "delete user")?;
        if &principal.id == user_id {
            return Err(PropdeskError::validation("userId", "cannot delete your own account"));
        }
        self.storage
            .delete_user_if_unreferenced(user_id)
            .await
            .for_entity("user", user_id)?;
        info!(user_id = %user_id, "user deleted");
        Ok(())
    }

    async fn new_account(&self, input: NewUser) -> PropdeskResult<User> {
        let email = check_email(&input.email)?;
        check_password_policy(&input.password)?;
        check_permissions(&input.permissions)?;
        let first_name = non_empty("firstName", &input.first_name)?;
        let last_name = non_empty("lastName", &input.last_name)?;
        if let Some(bank_id) = &input.bank_id {
            self.load_bank(bank_id).await?;
        }

        let user = User {
            id: UserId::generate(),
            email,
            password_hash: hash_password_async(&input.password).await?,
            first_name,
            last_name,
            phone_no: input.phone_no,
            permissions: input.permissions,
            bank_id: input.bank_id,
            wallet_balance: Decimal::ZERO,
            is_active: input.is_active,
            created_at: Utc::now(),
            last_login_at: None,
        };
        self.storage
            .insert_user(user.clone())
            .await
            .for_entity("user", &user.email)?;
        Ok(user)
    }

    async fn load_bank(&self, bank_id: &BankId) -> PropdeskResult<Bank> {
        self.storage
            .get_bank(bank_id)
            .await?
            .ok_or_else(|| PropdeskError::not_found("bank", bank_id))
    }
}

fn require_bank_manager(principal: &Principal, action: &str) -> PropdeskResult<()> {
    if access::can_manage_bank(principal) {
        Ok(())
    } else {
        warn!(principal = %principal.id, action, "bank management refused");
        Err(PropdeskError::forbidden(action))
    }
}

fn require_admin(principal: &Principal, action: &str) -> PropdeskResult<()> {
    if access::is_admin(principal) {
        Ok(())
    } else {
        warn!(principal = %principal.id, action, "admin-only operation refused");
        Err(PropdeskError::forbidden(action))
    }
}

fn non_empty(field: &str, value: &str) -> PropdeskResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PropdeskError::validation(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn check_email(email: &str) -> PropdeskResult<String> {
    let email = email.trim();
    if !looks_like_email(email) {
        return Err(PropdeskError::validation("email", "not an email address"));
    }
    Ok(email.to_string())
}

fn check_permissions(permissions: &PermissionSet) -> PropdeskResult<()> {
    if permissions.is_empty() {
        return Err(PropdeskError::validation(
            "permissions",
            "at least one permission is required",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use propdesk_storage::InMemoryPropdeskStorage;
    use propdesk_types::Permission;

    fn admin() -> Principal {
        Principal::new(
            UserId::new("root"),
            PermissionSet::of(&[Permission::Admin]),
            None,
        )
    }

    fn directory() -> Directory {
        Directory::new(Arc::new(InMemoryPropdeskStorage::new()))
    }

    fn bank_draft(code: &str) -> BankDraft {
        BankDraft {
            name: format!("Bank {code}"),
            code: code.to_string(),
            address: None,
            contact_email: None,
            contact_phone: None,
        }
    }

    fn new_user(email: &str, perms: &[Permission], bank: Option<BankId>) -> NewUser {
        NewUser {
            email: email.to_string(),
            password: "s3cret-pass".to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            phone_no: None,
            permissions: PermissionSet::of(perms),
            bank_id: bank,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn bank_codes_are_unique() {
        let dir = directory();
        dir.create_bank(&admin(), bank_draft("HDFC")).await.unwrap();
        let err = dir.create_bank(&admin(), bank_draft("HDFC")).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn banks_with_members_cannot_be_deleted() {
        let dir = directory();
        let bank = dir.create_bank(&admin(), bank_draft("SBI")).await.unwrap();
        let member = dir
            .create_user(
                &admin(),
                new_user("clerk@sbi.test", &[Permission::BankUser], Some(bank.id.clone())),
            )
            .await
            .unwrap();

        let err = dir.delete_bank(&admin(), &bank.id).await.unwrap_err();
        assert_eq!(err.code(), "conflict");

        dir.delete_user(&admin(), &member.id).await.unwrap();
        dir.delete_bank(&admin(), &bank.id).await.unwrap();
    }

    #[tokio::test]
    async fn branches_need_a_bank() {
        let dir = directory();
        let draft = BranchDraft {
            name: "MG Road".to_string(),
            address: None,
            city: Some("Bengaluru".to_string()),
            state: None,
            zip_code: None,
        };
        let err = dir
            .create_branch(&admin(), &BankId::new("nope"), draft)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn accounts_are_validated() {
        let dir = directory();
        let empty = new_user("a@desk.test", &[], None);
        assert!(matches!(
            dir.create_user(&admin(), empty).await,
            Err(PropdeskError::Validation { field, .. }) if field == "permissions"
        ));

        let mut short = new_user("b@desk.test", &[Permission::Valuator], None);
        short.password = "short".to_string();
        assert!(dir.create_user(&admin(), short).await.is_err());

        dir.create_user(&admin(), new_user("c@desk.test", &[Permission::Valuator], None))
            .await
            .unwrap();
        let dup = dir
            .create_user(&admin(), new_user("c@desk.test", &[Permission::Advocate], None))
            .await
            .unwrap_err();
        assert_eq!(dup.code(), "conflict");
    }

    #[tokio::test]
    async fn users_edit_their_profile_but_not_their_roles() {
        let dir = directory();
        let user = dir
            .create_user(&admin(), new_user("v@desk.test", &[Permission::Valuator], None))
            .await
            .unwrap();
        let me = Principal::new(user.id.clone(), user.permissions.clone(), None);

        let renamed = dir
            .update_user(
                &me,
                &user.id,
                UserPatch {
                    first_name: Some("Vidya".to_string()),
                    ..UserPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.first_name, "Vidya");

        let escalate = UserPatch {
            permissions: Some(PermissionSet::of(&[Permission::Admin])),
            ..UserPatch::default()
        };
        assert!(matches!(
            dir.update_user(&me, &user.id, escalate).await,
            Err(PropdeskError::Forbidden(_))
        ));

        let other = Principal::new(UserId::new("x"), PermissionSet::of(&[Permission::Valuator]), None);
        assert!(matches!(
            dir.get_user(&other, &user.id).await,
            Err(PropdeskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn bootstrap_only_seeds_an_empty_directory() {
        let dir = directory();
        let first = dir.bootstrap_admin("root@desk.test", "initial-pass").await.unwrap();
        assert!(first.unwrap().permissions.contains(Permission::Admin));
        assert!(dir
            .bootstrap_admin("again@desk.test", "initial-pass")
            .await
            .unwrap()
            .is_none());
    }
}
