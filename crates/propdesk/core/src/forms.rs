//! Form Schema Store: reusable field-schema templates and their visibility.

use crate::access;
use crate::error::{PropdeskError, PropdeskResult, StorageResultExt};
use crate::validation::validate_form_definition;
use chrono::Utc;
use propdesk_storage::{BankStore, FormStore, PropdeskStorage};
use propdesk_types::{BankId, FieldDef, Form, FormId, Principal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Input for a new form template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormDraft {
    pub form_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub is_default_form: bool,
    #[serde(default)]
    pub bank_id: Option<BankId>,
}

/// Partial update of a form template. `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormPatch {
    pub form_name: Option<String>,
    pub description: Option<String>,
    pub fields: Option<Vec<FieldDef>>,
    pub is_default_form: Option<bool>,
}

pub struct FormSchemaStore {
    storage: Arc<dyn PropdeskStorage>,
}

impl FormSchemaStore {
    pub fn new(storage: Arc<dyn PropdeskStorage>) -> Self {
        Self { storage }
    }

    /// Create a template. Admins may create default or bank forms; anyone
    /// else only non-default forms for their own bank.
    #[instrument(skip(self, principal, draft), fields(principal = %principal.id, form_name = %draft.form_name))]
    pub async fn create(&self, principal: &Principal, draft: FormDraft) -> PropdeskResult<Form> {
        if !access::can_create_form(principal, draft.bank_id.as_ref()) {
            warn!("form creation refused");
            return Err(PropdeskError::forbidden("create form"));
        }
        if draft.is_default_form && !access::is_admin(principal) {
            warn!("default form creation refused");
            return Err(PropdeskError::forbidden("create default form"));
        }
        if let Some(bank_id) = &draft.bank_id {
            self.require_bank(bank_id).await?;
        }
        validate_form_definition(&draft.form_name, &draft.fields)?;

        let now = Utc::now();
        let form = Form {
            id: FormId::generate(),
            form_name: draft.form_name.trim().to_string(),
            description: draft.description,
            fields: draft.fields,
            is_default_form: draft.is_default_form,
            bank_id: draft.bank_id,
            owner_user_id: principal.id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.storage
            .insert_form(form.clone())
            .await
            .for_entity("form", &form.id)?;
        info!(form_id = %form.id, fields = form.fields.len(), "form created");
        Ok(form)
    }

    #[instrument(skip(self, principal, patch), fields(principal = %principal.id))]
    pub async fn update(
        &self,
        principal: &Principal,
        form_id: &FormId,
        patch: FormPatch,
    ) -> PropdeskResult<Form> {
        let mut form = self.load(form_id).await?;
        if !access::can_edit_form(principal, &form) {
            warn!("form update refused");
            return Err(PropdeskError::forbidden("update form"));
        }
        if let Some(is_default) = patch.is_default_form {
            if is_default != form.is_default_form && !access::is_admin(principal) {
                return Err(PropdeskError::forbidden("change default flag"));
            }
            form.is_default_form = is_default;
        }
        if let Some(name) = patch.form_name {
            form.form_name = name;
        }
        if patch.description.is_some() {
            form.description = patch.description;
        }
        if let Some(fields) = patch.fields {
            form.fields = fields;
        }
        validate_form_definition(&form.form_name, &form.fields)?;
        form.form_name = form.form_name.trim().to_string();
        form.updated_at = Utc::now();

        self.storage
            .update_form(form.clone())
            .await
            .for_entity("form", form_id)?;
        info!(form_id = %form_id, "form updated");
        Ok(form)
    }

    /// Delete a template. The reference check runs inside the store's
    /// delete so a concurrent request creation cannot slip between them.
    #[instrument(skip(self, principal), fields(principal = %principal.id))]
    pub async fn delete(&self, principal: &Principal, form_id: &FormId) -> PropdeskResult<()> {
        let form = self.load(form_id).await?;
        if !access::can_delete_form(principal, &form) {
            warn!("form deletion refused");
            return Err(PropdeskError::forbidden("delete form"));
        }
        self.storage
            .delete_form_if_unreferenced(form_id)
            .await
            .for_entity("form", form_id)?;
        info!(form_id = %form_id, "form deleted");
        Ok(())
    }

    /// A form the caller can see; anything else is `NotFound`.
    pub async fn get(&self, principal: &Principal, form_id: &FormId) -> PropdeskResult<Form> {
        let form = self.load(form_id).await?;
        if !access::can_view_form(principal, &form) {
            return Err(PropdeskError::not_found("form", form_id));
        }
        Ok(form)
    }

    /// Forms visible to the caller, defaults first then newest first.
    pub async fn list_visible(
        &self,
        principal: &Principal,
        bank_id: Option<&BankId>,
    ) -> PropdeskResult<Vec<Form>> {
        let scope = access::form_scope(principal, bank_id)
            .ok_or_else(|| PropdeskError::forbidden("list another bank's forms"))?;
        Ok(self.storage.list_forms(&scope).await?)
    }

    /// Copy a visible form's fields into a new non-default form owned by the caller.
    #[instrument(skip(self, principal, new_name), fields(principal = %principal.id))]
    pub async fn duplicate(
        &self,
        principal: &Principal,
        form_id: &FormId,
        new_name: &str,
        bank_id: Option<BankId>,
    ) -> PropdeskResult<Form> {
        let source = self.get(principal, form_id).await?;
        let bank_id = bank_id.or_else(|| principal.bank_id.clone());
        self.create(
            principal,
            FormDraft {
                form_name: new_name.to_string(),
                description: source.description,
                fields: source.fields,
                is_default_form: false,
                bank_id,
            },
        )
        .await
    }

    async fn load(&self, form_id: &FormId) -> PropdeskResult<Form> {
        self.storage
            .get_form(form_id)
            .await?
            .ok_or_else(|| PropdeskError::not_found("form", form_id))
    }

    async fn require_bank(&self, bank_id: &BankId) -> PropdeskResult<()> {
        match self.storage.get_bank(bank_id).await? {
            Some(_) => Ok(()),
            None => Err(PropdeskError::not_found("bank", bank_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propdesk_storage::InMemoryPropdeskStorage;
    use propdesk_types::{Bank, FieldType, Permission, PermissionSet, UserId};

    fn principal(id: &str, perms: &[Permission], bank: Option<&str>) -> Principal {
        Principal::new(UserId::new(id), PermissionSet::of(perms), bank.map(BankId::new))
    }

    async fn store_with_banks() -> (Arc<InMemoryPropdeskStorage>, FormSchemaStore) {
        let storage = Arc::new(InMemoryPropdeskStorage::new());
        for (id, code) in [("b-1", "B1"), ("b-2", "B2")] {
            let now = Utc::now();
            storage
                .insert_bank(Bank {
                    id: BankId::new(id),
                    name: format!("Bank {code}"),
                    code: code.to_string(),
                    address: None,
                    contact_email: None,
                    contact_phone: None,
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let forms = FormSchemaStore::new(storage.clone());
        (storage, forms)
    }

    fn draft(name: &str, default: bool, bank: Option<&str>) -> FormDraft {
        FormDraft {
            form_name: name.to_string(),
            description: None,
            fields: vec![FieldDef::new("owner", "Owner", FieldType::Text).required()],
            is_default_form: default,
            bank_id: bank.map(BankId::new),
        }
    }

    #[tokio::test]
    async fn bank_users_create_only_for_their_bank() {
        let (_, forms) = store_with_banks().await;
        let banker = principal("u-1", &[Permission::BankUser], Some("b-1"));

        assert!(forms.create(&banker, draft("Mine", false, Some("b-1"))).await.is_ok());
        assert!(matches!(
            forms.create(&banker, draft("Theirs", false, Some("b-2"))).await,
            Err(PropdeskError::Forbidden(_))
        ));
        assert!(matches!(
            forms.create(&banker, draft("Global", true, Some("b-1"))).await,
            Err(PropdeskError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn listing_puts_defaults_first_and_hides_other_banks() {
        let (_, forms) = store_with_banks().await;
        let admin = principal("admin", &[Permission::Admin], None);
        forms.create(&admin, draft("Default", true, None)).await.unwrap();
        forms.create(&admin, draft("B2 only", false, Some("b-2"))).await.unwrap();
        forms.create(&admin, draft("B1 only", false, Some("b-1"))).await.unwrap();

        let banker = principal("u-1", &[Permission::BankUser], Some("b-1"));
        let visible = forms.list_visible(&banker, None).await.unwrap();
        let names: Vec<_> = visible.iter().map(|f| f.form_name.as_str()).collect();
        assert_eq!(names, vec!["Default", "B1 only"]);

        assert_eq!(forms.list_visible(&admin, None).await.unwrap().len(), 3);
        assert!(forms
            .list_visible(&banker, Some(&BankId::new("b-2")))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn invisible_forms_read_as_not_found() {
        let (_, forms) = store_with_banks().await;
        let admin = principal("admin", &[Permission::Admin], None);
        let private = forms
            .create(&admin, draft("B2 only", false, Some("b-2")))
            .await
            .unwrap();

        let banker = principal("u-1", &[Permission::BankUser], Some("b-1"));
        assert!(matches!(
            forms.get(&banker, &private.id).await,
            Err(PropdeskError::NotFound { kind: "form", .. })
        ));
    }

    #[tokio::test]
    async fn same_bank_users_edit_but_only_owner_deletes() {
        let (_, forms) = store_with_banks().await;
        let owner = principal("u-1", &[Permission::BankUser], Some("b-1"));
        let colleague = principal("u-2", &[Permission::BankUser], Some("b-1"));
        let form = forms.create(&owner, draft("Mine", false, Some("b-1"))).await.unwrap();

        let patched = forms
            .update(
                &colleague,
                &form.id,
                FormPatch {
                    form_name: Some("Renamed".to_string()),
                    ..FormPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.form_name, "Renamed");

        assert!(matches!(
            forms.delete(&colleague, &form.id).await,
            Err(PropdeskError::Forbidden(_))
        ));
        forms.delete(&owner, &form.id).await.unwrap();
        assert!(matches!(
            forms.delete(&owner, &form.id).await,
            Err(PropdeskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_copies_fields_into_a_private_form() {
        let (_, forms) = store_with_banks().await;
        let admin = principal("admin", &[Permission::Admin], None);
        let source = forms.create(&admin, draft("Default", true, None)).await.unwrap();

        let banker = principal("u-1", &[Permission::BankUser], Some("b-1"));
        let copy = forms
            .duplicate(&banker, &source.id, "My copy", None)
            .await
            .unwrap();
        assert_ne!(copy.id, source.id);
        assert!(!copy.is_default_form);
        assert_eq!(copy.bank_id, Some(BankId::new("b-1")));
        assert_eq!(copy.owner_user_id, UserId::new("u-1"));
        assert_eq!(copy.fields, source.fields);
    }
}
