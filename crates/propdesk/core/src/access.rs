//! Access control guard.
//!
//! Pure predicates over a [`Principal`] and a target record. Every mutating
//! operation in this crate routes its authorization decision through here.

use propdesk_storage::{FormScope, RequestScope};
use propdesk_types::{BankId, Form, Permission, Principal, Request, RequestStatus, UserId};

/// A permitted edge of the request state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    Assign,
    Start,
    Complete,
    Return,
    Cancel,
}

impl Transition {
    /// Look up the edge for a `(from, to)` pair; `None` if the table has no such edge.
    pub fn between(from: RequestStatus, to: RequestStatus) -> Option<Self> {
        use RequestStatus::*;
        match (from, to) {
            (Pending, Assigned) => Some(Transition::Assign),
            (Assigned, InProgress) => Some(Transition::Start),
            (InProgress, Completed) => Some(Transition::Complete),
            (Assigned | InProgress, Returned) => Some(Transition::Return),
            (Pending | Assigned, Cancelled) => Some(Transition::Cancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Assign => "assign",
            Transition::Start => "start",
            Transition::Complete => "complete",
            Transition::Return => "return",
            Transition::Cancel => "cancel",
        }
    }
}

pub fn is_admin(p: &Principal) -> bool {
    p.has(Permission::Admin)
}

pub fn can_manage_bank(p: &Principal) -> bool {
    is_admin(p)
}

/// Admin, or the caller acting on their own account.
pub fn can_manage_user(p: &Principal, user_id: &UserId) -> bool {
    is_admin(p) || &p.id == user_id
}

pub fn can_access_request(p: &Principal, request: &Request) -> bool {
    is_admin(p)
        || request.created_by_user_id == p.id
        || request.is_assignee(&p.id)
        || p.bank_id.as_ref() == Some(&request.bank_id)
}

/// The listing scope for a caller: admin sees everything, professionals see
/// their assignments and their audience, bank-scoped users see their bank,
/// anyone else only what they created.
pub fn request_scope(p: &Principal) -> RequestScope {
    if is_admin(p) {
        return RequestScope::All;
    }
    let valuator = p.has(Permission::Valuator);
    let advocate = p.has(Permission::Advocate);
    if valuator || advocate {
        return RequestScope::Professional {
            user_id: p.id.clone(),
            valuator,
            advocate,
        };
    }
    match &p.bank_id {
        Some(bank_id) => RequestScope::Bank(bank_id.clone()),
        None => RequestScope::Creator(p.id.clone()),
    }
}

/// Whether a single request may be read: direct access, or it would appear in
/// the caller's listing.
pub fn can_view_request(p: &Principal, request: &Request) -> bool {
    can_access_request(p, request) || request_scope(p).matches(request)
}

pub fn can_create_request(p: &Principal, bank_id: &BankId) -> bool {
    is_admin(p) || p.bank_id.as_ref() == Some(bank_id)
}

pub fn can_mutate_request_status(p: &Principal, request: &Request, transition: Transition) -> bool {
    let assignee = request.is_assignee(&p.id);
    match transition {
        Transition::Assign => is_admin(p),
        Transition::Start => assignee,
        Transition::Complete | Transition::Return => assignee || is_admin(p),
        Transition::Cancel => is_admin(p) || request.created_by_user_id == p.id,
    }
}

pub fn can_delete_request(p: &Principal, request: &Request) -> bool {
    is_admin(p) || request.created_by_user_id == p.id
}

pub fn can_create_form(p: &Principal, bank_id: Option<&BankId>) -> bool {
    is_admin(p) || (bank_id.is_some() && bank_id == p.bank_id.as_ref())
}

pub fn can_view_form(p: &Principal, form: &Form) -> bool {
    is_admin(p)
        || form.is_default_form
        || form.owner_user_id == p.id
        || (p.bank_id.is_some() && form.bank_id == p.bank_id)
}

pub fn can_edit_form(p: &Principal, form: &Form) -> bool {
    is_admin(p) || form.owner_user_id == p.id || (p.bank_id.is_some() && form.bank_id == p.bank_id)
}

pub fn can_delete_form(p: &Principal, form: &Form) -> bool {
    can_edit_form(p, form) && (is_admin(p) || form.owner_user_id == p.id)
}

/// Listing scope for forms. Non-admins are pinned to their own bank.
pub fn form_scope(p: &Principal, bank_id: Option<&BankId>) -> Option<FormScope> {
    if is_admin(p) {
        return Some(match bank_id {
            Some(bank_id) => FormScope::DefaultsAnd(Some(bank_id.clone())),
            None => FormScope::All,
        });
    }
    match bank_id {
        Some(requested) if p.bank_id.as_ref() != Some(requested) => None,
        _ => Some(FormScope::DefaultsAnd(p.bank_id.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use propdesk_types::{ForWhom, FormId, PermissionSet, Priority, RequestId};

    const USERS: [&str; 4] = ["u-0", "u-1", "u-2", "u-3"];
    const BANKS: [&str; 3] = ["b-0", "b-1", "b-2"];

    fn principal(id: &str, perms: &[Permission], bank: Option<&str>) -> Principal {
        Principal::new(UserId::new(id), PermissionSet::of(perms), bank.map(BankId::new))
    }

    fn request(creator: &str, bank: &str, for_whom: ForWhom) -> Request {
        let now = Utc::now();
        Request {
            id: RequestId::new("r-1"),
            form_id: FormId::new("f-1"),
            bank_id: BankId::new(bank),
            bank_branch_id: None,
            created_by_user_id: UserId::new(creator),
            for_whom,
            fields: Vec::new(),
            status: RequestStatus::Pending,
            priority: Priority::Medium,
            assigned_valuator_id: None,
            assigned_advocate_id: None,
            return_reason: None,
            completion_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn arb_permissions() -> impl Strategy<Value = PermissionSet> {
        proptest::sample::subsequence(Permission::ALL.to_vec(), 0..=4)
            .prop_map(|perms| perms.into_iter().collect())
    }

    fn arb_user() -> impl Strategy<Value = UserId> {
        proptest::sample::select(USERS.to_vec()).prop_map(UserId::new)
    }

    fn arb_bank() -> impl Strategy<Value = BankId> {
        proptest::sample::select(BANKS.to_vec()).prop_map(BankId::new)
    }

    fn arb_for_whom() -> impl Strategy<Value = ForWhom> {
        prop_oneof![
            Just(ForWhom::Valuator),
            Just(ForWhom::Advocate),
            Just(ForWhom::Both)
        ]
    }

    fn arb_principal() -> impl Strategy<Value = Principal> {
        (arb_user(), arb_permissions(), proptest::option::of(arb_bank()))
            .prop_map(|(id, perms, bank)| Principal::new(id, perms, bank))
    }

    fn arb_request() -> impl Strategy<Value = Request> {
        (
            arb_user(),
            arb_bank(),
            arb_for_whom(),
            proptest::option::of(arb_user()),
            proptest::option::of(arb_user()),
        )
            .prop_map(|(creator, bank, for_whom, valuator, advocate)| {
                let mut r = request(creator.as_str(), bank.as_str(), for_whom);
                r.assigned_valuator_id = valuator;
                r.assigned_advocate_id = advocate;
                r
            })
    }

    proptest! {
        #[test]
        fn access_matches_membership_definition(p in arb_principal(), r in arb_request()) {
            let expected = p.permissions.contains(Permission::Admin)
                || r.created_by_user_id == p.id
                || r.assigned_valuator_id.as_ref() == Some(&p.id)
                || r.assigned_advocate_id.as_ref() == Some(&p.id)
                || p.bank_id.as_ref() == Some(&r.bank_id);
            prop_assert_eq!(can_access_request(&p, &r), expected);
        }

        #[test]
        fn listing_scope_never_hides_a_created_or_assigned_request(p in arb_principal(), r in arb_request()) {
            if r.is_assignee(&p.id) || p.permissions.contains(Permission::Admin) {
                prop_assert!(can_view_request(&p, &r));
            }
            if request_scope(&p).matches(&r) {
                prop_assert!(can_view_request(&p, &r));
            }
        }
    }

    #[test]
    fn transition_table_is_closed() {
        let mut allowed = 0;
        for from in RequestStatus::ALL {
            for to in RequestStatus::ALL {
                if Transition::between(from, to).is_some() {
                    allowed += 1;
                    assert!(!from.is_terminal(), "{from} is terminal");
                }
            }
        }
        assert_eq!(allowed, 7);
    }

    #[test]
    fn status_guards_follow_transition_table() {
        let mut r = request("bank-user", "b-0", ForWhom::Valuator);
        r.assigned_valuator_id = Some(UserId::new("v-1"));

        let admin = principal("admin", &[Permission::Admin], None);
        let v1 = principal("v-1", &[Permission::Valuator], None);
        let v2 = principal("v-2", &[Permission::Valuator], None);
        let creator = principal("bank-user", &[Permission::BankUser], Some("b-0"));

        assert!(can_mutate_request_status(&admin, &r, Transition::Assign));
        assert!(!can_mutate_request_status(&v1, &r, Transition::Assign));
        assert!(can_mutate_request_status(&v1, &r, Transition::Start));
        assert!(!can_mutate_request_status(&admin, &r, Transition::Start));
        assert!(!can_mutate_request_status(&v2, &r, Transition::Complete));
        assert!(can_mutate_request_status(&admin, &r, Transition::Return));
        assert!(can_mutate_request_status(&creator, &r, Transition::Cancel));
        assert!(!can_mutate_request_status(&v1, &r, Transition::Cancel));
    }

    #[test]
    fn scopes_follow_role_precedence() {
        let admin = principal("a", &[Permission::Admin, Permission::Valuator], None);
        assert_eq!(request_scope(&admin), RequestScope::All);

        let both = principal("p", &[Permission::Valuator, Permission::Advocate], Some("b-0"));
        assert!(matches!(
            request_scope(&both),
            RequestScope::Professional { valuator: true, advocate: true, .. }
        ));

        let banker = principal("b", &[Permission::BankUser], Some("b-0"));
        assert_eq!(request_scope(&banker), RequestScope::Bank(BankId::new("b-0")));

        let loner = principal("l", &[Permission::BankUser], None);
        assert_eq!(request_scope(&loner), RequestScope::Creator(UserId::new("l")));
    }

    #[test]
    fn non_admins_cannot_list_another_banks_forms() {
        let banker = principal("b", &[Permission::BankUser], Some("b-0"));
        assert!(form_scope(&banker, Some(&BankId::new("b-1"))).is_none());
        assert_eq!(
            form_scope(&banker, None),
            Some(FormScope::DefaultsAnd(Some(BankId::new("b-0"))))
        );
        let admin = principal("a", &[Permission::Admin], None);
        assert_eq!(form_scope(&admin, None), Some(FormScope::All));
    }
}
