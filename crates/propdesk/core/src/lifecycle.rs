//! Request Lifecycle Engine.
//!
//! Creates requests against a form, assigns professionals and drives the
//! status machine. Every status write is a compare-and-set against the
//! status the guard inspected, so two racing transitions on the same request
//! never both commit; the loser reports the status that actually won.

use crate::access::{self, Transition};
use crate::error::{PropdeskError, PropdeskResult, StorageResultExt};
use crate::validation::snapshot_fields;
use chrono::Utc;
use propdesk_storage::{
    BankStore, FormStore, PropdeskStorage, RequestFilter, RequestStore, StatusChange,
    StorageError, UserStore,
};
use propdesk_types::{
    BankId, BranchId, FieldInput, ForWhom, FormId, Page, PageRequest, Permission, Principal,
    Priority, Request, RequestId, RequestStats, RequestStatus, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Statuses from which a request may be deleted.
const DELETABLE: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::Cancelled];

/// Input for a new request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRequest {
    pub form_id: FormId,
    pub bank_id: BankId,
    #[serde(default)]
    pub bank_branch_id: Option<BranchId>,
    pub for_whom: ForWhom,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub fields: Vec<FieldInput>,
}

/// Professionals to put on a pending request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub assigned_valuator_id: Option<UserId>,
    pub assigned_advocate_id: Option<UserId>,
}

/// A requested status change with its optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: RequestStatus,
    /// Required when returning a request.
    #[serde(default)]
    pub reason: Option<String>,
    /// Attached to a completion.
    #[serde(default)]
    pub note: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: RequestStatus) -> Self {
        Self {
            status,
            reason: None,
            note: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

pub struct RequestLifecycle {
    storage: Arc<dyn PropdeskStorage>,
}

impl RequestLifecycle {
    pub fn new(storage: Arc<dyn PropdeskStorage>) -> Self {
        Self { storage }
    }

    /// Validate the submitted values against the form and store a pending
    /// request holding a snapshot of them.
    #[instrument(skip(self, principal, input), fields(principal = %principal.id, form_id = %input.form_id, bank_id = %input.bank_id))]
    pub async fn create(&self, principal: &Principal, input: NewRequest) -> PropdeskResult<Request> {
        if !access::can_create_request(principal, &input.bank_id) {
            warn!("request creation refused");
            return Err(PropdeskError::forbidden("create request for this bank"));
        }

        let bank = self
            .storage
            .get_bank(&input.bank_id)
            .await?
            .ok_or_else(|| PropdeskError::not_found("bank", &input.bank_id))?;
        if !bank.is_active {
            return Err(PropdeskError::validation("bankId", "bank is inactive"));
        }
        if let Some(branch_id) = &input.bank_branch_id {
            let branch = self
                .storage
                .get_branch(branch_id)
                .await?
                .ok_or_else(|| PropdeskError::not_found("branch", branch_id))?;
            if branch.bank_id != input.bank_id {
                return Err(PropdeskError::validation(
                    "bankBranchId",
                    "branch belongs to another bank",
                ));
            }
        }

        let form = match self.storage.get_form(&input.form_id).await? {
            Some(form) if access::can_view_form(principal, &form) => form,
            _ => return Err(PropdeskError::not_found("form", &input.form_id)),
        };
        if !form.is_default_form && form.bank_id.as_ref() != Some(&input.bank_id) {
            return Err(PropdeskError::validation(
                "formId",
                "form is not available to this bank",
            ));
        }
        let fields = snapshot_fields(&form, &input.fields)?;

        let now = Utc::now();
        let request = Request {
            id: RequestId::generate(),
            form_id: form.id.clone(),
            bank_id: input.bank_id,
            bank_branch_id: input.bank_branch_id,
            created_by_user_id: principal.id.clone(),
            for_whom: input.for_whom,
            fields,
            status: RequestStatus::Pending,
            priority: input.priority.unwrap_or_default(),
            assigned_valuator_id: None,
            assigned_advocate_id: None,
            return_reason: None,
            completion_note: None,
            created_at: now,
            updated_at: now,
        };
        // A form or branch deleted since the reads above surfaces as NotFound.
        self.storage
            .insert_request(request.clone())
            .await
            .for_entity("form", &form.id)?;
        info!(request_id = %request.id, "request created");
        Ok(request)
    }

    /// Put professionals on a pending request and move it to `assigned`.
    #[instrument(skip(self, principal, assignment), fields(principal = %principal.id))]
    pub async fn assign(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        assignment: Assignment,
    ) -> PropdeskResult<Request> {
        if !access::is_admin(principal) {
            warn!("assignment refused");
            return Err(PropdeskError::forbidden("assign request"));
        }
        let request = self.load(request_id).await?;
        if request.status != RequestStatus::Pending {
            return Err(PropdeskError::InvalidTransition {
                request_id: request_id.clone(),
                from: request.status,
                to: RequestStatus::Assigned,
            });
        }
        if assignment.assigned_valuator_id.is_none() && assignment.assigned_advocate_id.is_none() {
            return Err(PropdeskError::validation(
                "assignedValuatorId",
                "at least one assignee is required",
            ));
        }
        if let Some(user_id) = &assignment.assigned_valuator_id {
            self.check_assignee(&request, user_id, Permission::Valuator, "assignedValuatorId")
                .await?;
        }
        if let Some(user_id) = &assignment.assigned_advocate_id {
            self.check_assignee(&request, user_id, Permission::Advocate, "assignedAdvocateId")
                .await?;
        }

        let mut change = StatusChange::to(RequestStatus::Assigned);
        change.assigned_valuator_id = assignment.assigned_valuator_id;
        change.assigned_advocate_id = assignment.assigned_advocate_id;
        let updated = self.commit(&request, change).await?;
        info!(
            request_id = %request_id,
            valuator = ?updated.assigned_valuator_id,
            advocate = ?updated.assigned_advocate_id,
            "request assigned"
        );
        Ok(updated)
    }

    /// Move a request along the status table.
    ///
    /// Checks run in order: visibility (`NotFound`), the table
    /// (`InvalidTransition`), the caller guard (`Forbidden`), then metadata.
    #[instrument(skip(self, principal, update), fields(principal = %principal.id, to = %update.status))]
    pub async fn update_status(
        &self,
        principal: &Principal,
        request_id: &RequestId,
        update: StatusUpdate,
    ) -> PropdeskResult<Request> {
        let request = self.load_visible(principal, request_id).await?;
        let Some(transition) = Transition::between(request.status, update.status) else {
            debug!(from = %request.status, "transition not in table");
            return Err(PropdeskError::InvalidTransition {
                request_id: request_id.clone(),
                from: request.status,
                to: update.status,
            });
        };
        if !access::can_mutate_request_status(principal, &request, transition) {
            warn!(transition = transition.as_str(), "status change refused");
            return Err(PropdeskError::forbidden(format!(
                "{} request",
                transition.as_str()
            )));
        }

        let mut change = StatusChange::to(update.status);
        match transition {
            Transition::Assign => {
                return Err(PropdeskError::validation(
                    "status",
                    "use the assign operation to assign a request",
                ));
            }
            Transition::Return => {
                let reason = update
                    .reason
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| PropdeskError::validation("reason", "a return reason is required"))?;
                change.return_reason = Some(reason);
            }
            Transition::Complete => {
                change.completion_note = update.note.filter(|n| !n.trim().is_empty());
            }
            Transition::Start | Transition::Cancel => {}
        }

        let updated = self.commit(&request, change).await?;
        info!(
            request_id = %request_id,
            from = %request.status,
            to = %updated.status,
            "request status changed"
        );
        Ok(updated)
    }

    pub async fn get(&self, principal: &Principal, request_id: &RequestId) -> PropdeskResult<Request> {
        self.load_visible(principal, request_id).await
    }

    /// Page through the caller's visible requests, newest first. The store
    /// narrows to the caller's scope before filtering and counting.
    pub async fn query(
        &self,
        principal: &Principal,
        filter: &RequestFilter,
        page: PageRequest,
    ) -> PropdeskResult<Page<Request>> {
        let scope = access::request_scope(principal);
        Ok(self.storage.list_requests(&scope, filter, page).await?)
    }

    /// Per-status counts within the caller's visibility.
    pub async fn stats(&self, principal: &Principal) -> PropdeskResult<RequestStats> {
        let scope = access::request_scope(principal);
        Ok(self.storage.request_stats(&scope).await?)
    }

    /// Delete a pending or cancelled request. Admin or creator only.
    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub async fn delete(&self, principal: &Principal, request_id: &RequestId) -> PropdeskResult<()> {
        let request = self.load_visible(principal, request_id).await?;
        if !access::can_delete_request(principal, &request) {
            warn!("request deletion refused");
            return Err(PropdeskError::forbidden("delete request"));
        }
        if !DELETABLE.contains(&request.status) {
            return Err(PropdeskError::InvalidTransition {
                request_id: request_id.clone(),
                from: request.status,
                to: RequestStatus::Cancelled,
            });
        }
        match self
            .storage
            .delete_request_in_status(request_id, &DELETABLE)
            .await
        {
            Ok(()) => {
                info!(request_id = %request_id, "request deleted");
                Ok(())
            }
            Err(StorageError::InvariantViolation(_)) => {
                Err(self.lost_race(request_id, RequestStatus::Cancelled).await)
            }
            Err(err) => Err::<(), _>(err).for_entity("request", request_id),
        }
    }

    async fn check_assignee(
        &self,
        request: &Request,
        user_id: &UserId,
        role: Permission,
        field: &'static str,
    ) -> PropdeskResult<()> {
        let user = self
            .storage
            .get_user(user_id)
            .await?
            .ok_or_else(|| PropdeskError::validation(field, format!("user {user_id} does not exist")))?;
        if !user.is_active {
            return Err(PropdeskError::validation(field, format!("user {user_id} is inactive")));
        }
        if !user.permissions.contains(role) {
            return Err(PropdeskError::validation(
                field,
                format!("user {user_id} does not hold the {role} permission"),
            ));
        }
        if !request.for_whom.includes(role) {
            return Err(PropdeskError::validation(
                field,
                format!("request is for {}, not {role}", request.for_whom.as_str()),
            ));
        }
        Ok(())
    }

    /// Compare-and-set against the status the caller's checks saw.
    async fn commit(&self, seen: &Request, change: StatusChange) -> PropdeskResult<Request> {
        let to = change.to;
        match self
            .storage
            .transition_request(&seen.id, seen.status, change)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(StorageError::InvariantViolation(_)) => Err(self.lost_race(&seen.id, to).await),
            Err(err) => Err::<Request, _>(err).for_entity("request", &seen.id),
        }
    }

    /// Build the error for a compare-and-set that lost to a concurrent write.
    async fn lost_race(&self, request_id: &RequestId, to: RequestStatus) -> PropdeskError {
        match self.storage.get_request(request_id).await {
            Ok(Some(current)) => {
                warn!(request_id = %request_id, current = %current.status, "lost status race");
                PropdeskError::InvalidTransition {
                    request_id: request_id.clone(),
                    from: current.status,
                    to,
                }
            }
            Ok(None) => PropdeskError::not_found("request", request_id),
            Err(err) => err.into(),
        }
    }

    async fn load(&self, request_id: &RequestId) -> PropdeskResult<Request> {
        self.storage
            .get_request(request_id)
            .await?
            .ok_or_else(|| PropdeskError::not_found("request", request_id))
    }

    async fn load_visible(
        &self,
        principal: &Principal,
        request_id: &RequestId,
    ) -> PropdeskResult<Request> {
        let request = self.load(request_id).await?;
        if !access::can_view_request(principal, &request) {
            return Err(PropdeskError::not_found("request", request_id));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propdesk_storage::InMemoryPropdeskStorage;
    use propdesk_types::{Bank, Decimal, FieldDef, FieldType, Form, PermissionSet, User};

    struct Fixture {
        lifecycle: RequestLifecycle,
        admin: Principal,
        banker: Principal,
        valuator: Principal,
        form_id: FormId,
    }

    fn principal(id: &str, perms: &[Permission], bank: Option<&str>) -> Principal {
        Principal::new(UserId::new(id), PermissionSet::of(perms), bank.map(BankId::new))
    }

    fn user(p: &Principal) -> User {
        User {
            id: p.id.clone(),
            email: format!("{}@desk.test", p.id),
            password_hash: String::new(),
            first_name: p.id.to_string(),
            last_name: "Test".to_string(),
            phone_no: None,
            permissions: p.permissions.clone(),
            bank_id: p.bank_id.clone(),
            wallet_balance: Decimal::ZERO,
            is_active: true,
            created_at: Utc::now(),
            last_login_at: None,
        }
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryPropdeskStorage::new());
        let now = Utc::now();
        storage
            .insert_bank(Bank {
                id: BankId::new("b-1"),
                name: "First Bank".to_string(),
                code: "B1".to_string(),
                address: None,
                contact_email: None,
                contact_phone: None,
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let admin = principal("admin", &[Permission::Admin], None);
        let banker = principal("banker", &[Permission::BankUser], Some("b-1"));
        let valuator = principal("v-1", &[Permission::Valuator], None);
        for p in [&admin, &banker, &valuator] {
            storage.insert_user(user(p)).await.unwrap();
        }

        let form = Form {
            id: FormId::new("f-1"),
            form_name: "Valuation".to_string(),
            description: None,
            fields: vec![FieldDef::new("type", "Property Type", FieldType::Select)
                .required()
                .with_options(["residential", "commercial"])],
            is_default_form: true,
            bank_id: None,
            owner_user_id: admin.id.clone(),
            created_at: now,
            updated_at: now,
        };
        storage.insert_form(form).await.unwrap();

        Fixture {
            lifecycle: RequestLifecycle::new(storage),
            admin,
            banker,
            valuator,
            form_id: FormId::new("f-1"),
        }
    }

    fn new_request(form_id: &FormId, value: &str) -> NewRequest {
        NewRequest {
            form_id: form_id.clone(),
            bank_id: BankId::new("b-1"),
            bank_branch_id: None,
            for_whom: ForWhom::Valuator,
            priority: None,
            fields: vec![FieldInput::new("type", value)],
        }
    }

    #[tokio::test]
    async fn created_requests_start_pending_with_a_snapshot() {
        let fx = fixture().await;
        let request = fx
            .lifecycle
            .create(&fx.banker, new_request(&fx.form_id, "residential"))
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.priority, Priority::Medium);
        assert_eq!(request.fields[0].value, "residential");
    }

    #[tokio::test]
    async fn outsiders_cannot_create_for_a_bank() {
        let fx = fixture().await;
        let other = principal("x", &[Permission::BankUser], Some("b-9"));
        assert!(matches!(
            fx.lifecycle.create(&other, new_request(&fx.form_id, "residential")).await,
            Err(PropdeskError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn assignment_checks_role_and_audience() {
        let fx = fixture().await;
        let request = fx
            .lifecycle
            .create(&fx.banker, new_request(&fx.form_id, "commercial"))
            .await
            .unwrap();

        let wrong_role = Assignment {
            assigned_valuator_id: Some(fx.banker.id.clone()),
            assigned_advocate_id: None,
        };
        assert!(matches!(
            fx.lifecycle.assign(&fx.admin, &request.id, wrong_role).await,
            Err(PropdeskError::Validation { .. })
        ));
        assert!(matches!(
            fx.lifecycle
                .assign(&fx.admin, &request.id, Assignment::default())
                .await,
            Err(PropdeskError::Validation { .. })
        ));

        let ok = Assignment {
            assigned_valuator_id: Some(fx.valuator.id.clone()),
            assigned_advocate_id: None,
        };
        let assigned = fx.lifecycle.assign(&fx.admin, &request.id, ok.clone()).await.unwrap();
        assert_eq!(assigned.status, RequestStatus::Assigned);

        assert!(matches!(
            fx.lifecycle.assign(&fx.admin, &request.id, ok).await,
            Err(PropdeskError::InvalidTransition { from: RequestStatus::Assigned, .. })
        ));
    }

    #[tokio::test]
    async fn return_requires_a_reason_and_terminal_states_are_final() {
        let fx = fixture().await;
        let request = fx
            .lifecycle
            .create(&fx.banker, new_request(&fx.form_id, "residential"))
            .await
            .unwrap();
        fx.lifecycle
            .assign(
                &fx.admin,
                &request.id,
                Assignment {
                    assigned_valuator_id: Some(fx.valuator.id.clone()),
                    assigned_advocate_id: None,
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            fx.lifecycle
                .update_status(&fx.valuator, &request.id, StatusUpdate::to(RequestStatus::Returned))
                .await,
            Err(PropdeskError::Validation { .. })
        ));
        let returned = fx
            .lifecycle
            .update_status(
                &fx.valuator,
                &request.id,
                StatusUpdate::to(RequestStatus::Returned).with_reason("title deed missing"),
            )
            .await
            .unwrap();
        assert_eq!(returned.return_reason.as_deref(), Some("title deed missing"));

        for to in RequestStatus::ALL {
            assert!(matches!(
                fx.lifecycle
                    .update_status(&fx.admin, &request.id, StatusUpdate::to(to))
                    .await,
                Err(PropdeskError::InvalidTransition { .. })
            ));
        }
    }

    #[tokio::test]
    async fn only_pending_or_cancelled_requests_are_deleted() {
        let fx = fixture().await;
        let request = fx
            .lifecycle
            .create(&fx.banker, new_request(&fx.form_id, "residential"))
            .await
            .unwrap();
        fx.lifecycle
            .assign(
                &fx.admin,
                &request.id,
                Assignment {
                    assigned_valuator_id: Some(fx.valuator.id.clone()),
                    assigned_advocate_id: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            fx.lifecycle.delete(&fx.banker, &request.id).await,
            Err(PropdeskError::InvalidTransition { .. })
        ));

        fx.lifecycle
            .update_status(&fx.banker, &request.id, StatusUpdate::to(RequestStatus::Cancelled))
            .await
            .unwrap();
        fx.lifecycle.delete(&fx.banker, &request.id).await.unwrap();
        assert!(matches!(
            fx.lifecycle.get(&fx.admin, &request.id).await,
            Err(PropdeskError::NotFound { .. })
        ));
    }
}
