use chrono::{DateTime, Utc};
use propdesk_types::{
    BankId, Decimal, ForWhom, Form, PermissionSet, Priority, Request, RequestStatus,
    TransactionType, UserId, WalletTransaction,
};
use serde::{Deserialize, Serialize};

/// Which requests a caller is allowed to see.
///
/// Stores apply the scope before any filter, count or page window so that
/// totals never leak the existence of invisible requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestScope {
    All,
    /// Assigned to the user, or targeted at one of their professional roles.
    Professional {
        user_id: UserId,
        valuator: bool,
        advocate: bool,
    },
    Bank(BankId),
    Creator(UserId),
}

impl RequestScope {
    pub fn matches(&self, request: &Request) -> bool {
        match self {
            RequestScope::All => true,
            RequestScope::Professional {
                user_id,
                valuator,
                advocate,
            } => {
                request.is_assignee(user_id)
                    || (*valuator && request.for_whom.wants_valuator())
                    || (*advocate && request.for_whom.wants_advocate())
            }
            RequestScope::Bank(bank_id) => &request.bank_id == bank_id,
            RequestScope::Creator(user_id) => &request.created_by_user_id == user_id,
        }
    }

    /// `for_whom` values a professional scope admits.
    pub fn professional_audience(valuator: bool, advocate: bool) -> Vec<ForWhom> {
        let mut audience = Vec::new();
        if valuator {
            audience.push(ForWhom::Valuator);
        }
        if advocate {
            audience.push(ForWhom::Advocate);
        }
        if valuator || advocate {
            audience.push(ForWhom::Both);
        }
        audience
    }
}

/// Optional narrowing applied after the visibility scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub for_whom: Option<ForWhom>,
    pub bank_id: Option<BankId>,
    /// Matches either assignee slot.
    pub assigned_to: Option<UserId>,
    pub priority: Option<Priority>,
}

impl RequestFilter {
    pub fn matches(&self, request: &Request) -> bool {
        self.status.map_or(true, |s| request.status == s)
            && self.for_whom.map_or(true, |f| request.for_whom == f)
            && self
                .bank_id
                .as_ref()
                .map_or(true, |b| &request.bank_id == b)
            && self
                .assigned_to
                .as_ref()
                .map_or(true, |u| request.is_assignee(u))
            && self.priority.map_or(true, |p| request.priority == p)
    }
}

/// Fields written together with a status change. `None` leaves a column as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub to: RequestStatus,
    pub assigned_valuator_id: Option<UserId>,
    pub assigned_advocate_id: Option<UserId>,
    pub return_reason: Option<String>,
    pub completion_note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusChange {
    pub fn to(status: RequestStatus) -> Self {
        Self {
            to: status,
            assigned_valuator_id: None,
            assigned_advocate_id: None,
            return_reason: None,
            completion_note: None,
            updated_at: Utc::now(),
        }
    }

    pub fn apply(&self, request: &mut Request) {
        request.status = self.to;
        if let Some(id) = &self.assigned_valuator_id {
            request.assigned_valuator_id = Some(id.clone());
        }
        if let Some(id) = &self.assigned_advocate_id {
            request.assigned_advocate_id = Some(id.clone());
        }
        if let Some(reason) = &self.return_reason {
            request.return_reason = Some(reason.clone());
        }
        if let Some(note) = &self.completion_note {
            request.completion_note = Some(note.clone());
        }
        request.updated_at = self.updated_at;
    }
}

/// Which forms a listing returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormScope {
    All,
    /// Default forms plus, when set, the forms owned by this bank.
    DefaultsAnd(Option<BankId>),
}

impl FormScope {
    pub fn matches(&self, form: &Form) -> bool {
        match self {
            FormScope::All => true,
            FormScope::DefaultsAnd(bank_id) => {
                form.is_default_form || (bank_id.is_some() && form.bank_id == *bank_id)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    /// Case-insensitive match on first name, last name, email or phone.
    pub search: Option<String>,
    /// Any-of match; empty means no permission filter.
    pub permissions: PermissionSet,
    pub bank_id: Option<BankId>,
}

/// A wallet movement to apply atomically against a user's cached balance.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletEntry {
    pub user_id: UserId,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Largest balance a wallet may hold, the top of a `NUMERIC(14, 2)` column.
pub fn max_wallet_balance() -> Decimal {
    Decimal::new(99_999_999_999_999, 2)
}

impl WalletEntry {
    /// The balance after applying this entry to `current`, or the refusal
    /// to report when it cannot apply. Never panics on overflow.
    pub fn settle(&self, current: Decimal) -> Result<Decimal, WalletOutcome> {
        let next = match self.transaction_type {
            TransactionType::Credit => current.checked_add(self.amount),
            TransactionType::Debit => current.checked_sub(self.amount),
        };
        match next {
            Some(balance) if balance < Decimal::ZERO => {
                Err(WalletOutcome::Insufficient { balance: current })
            }
            Some(balance) if balance <= max_wallet_balance() => Ok(balance),
            _ => Err(WalletOutcome::Overflow { balance: current }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalletOutcome {
    Applied {
        transaction: WalletTransaction,
        balance: Decimal,
    },
    /// Nothing was written; the balance would have gone negative.
    Insufficient { balance: Decimal },
    /// Nothing was written; the balance would pass [`max_wallet_balance`].
    Overflow { balance: Decimal },
}

pub(crate) fn matches_search(needle: &str, haystacks: &[Option<&str>]) -> bool {
    let needle = needle.to_lowercase();
    haystacks
        .iter()
        .flatten()
        .any(|h| h.to_lowercase().contains(&needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use propdesk_types::{FormId, RequestId};

    fn request(for_whom: ForWhom) -> Request {
        let now = Utc::now();
        Request {
            id: RequestId::new("r-1"),
            form_id: FormId::new("f-1"),
            bank_id: BankId::new("b-1"),
            bank_branch_id: None,
            created_by_user_id: UserId::new("creator"),
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

    #[test]
    fn professional_scope_follows_audience_and_assignment() {
        let scope = RequestScope::Professional {
            user_id: UserId::new("v-1"),
            valuator: true,
            advocate: false,
        };
        assert!(scope.matches(&request(ForWhom::Valuator)));
        assert!(scope.matches(&request(ForWhom::Both)));

        let mut legal = request(ForWhom::Advocate);
        assert!(!scope.matches(&legal));
        legal.assigned_valuator_id = Some(UserId::new("v-1"));
        assert!(scope.matches(&legal));
    }

    #[test]
    fn status_change_leaves_unset_columns_alone() {
        let mut r = request(ForWhom::Valuator);
        r.assigned_valuator_id = Some(UserId::new("v-1"));

        let mut change = StatusChange::to(RequestStatus::Returned);
        change.return_reason = Some("missing deed".to_string());
        change.apply(&mut r);

        assert_eq!(r.status, RequestStatus::Returned);
        assert_eq!(r.assigned_valuator_id, Some(UserId::new("v-1")));
        assert_eq!(r.return_reason.as_deref(), Some("missing deed"));
    }

    #[test]
    fn settle_refuses_overdraft_and_overflow_without_panicking() {
        let entry = |transaction_type, amount| WalletEntry {
            user_id: UserId::new("u-1"),
            amount,
            transaction_type,
            description: String::new(),
            created_at: Utc::now(),
        };
        let ten = Decimal::new(10, 0);

        assert_eq!(
            entry(TransactionType::Credit, ten).settle(ten),
            Ok(Decimal::new(20, 0))
        );
        assert_eq!(
            entry(TransactionType::Debit, Decimal::new(11, 0)).settle(ten),
            Err(WalletOutcome::Insufficient { balance: ten })
        );
        assert_eq!(
            entry(TransactionType::Credit, Decimal::new(1, 2)).settle(max_wallet_balance()),
            Err(WalletOutcome::Overflow {
                balance: max_wallet_balance()
            })
        );
        assert_eq!(
            entry(TransactionType::Credit, Decimal::ONE).settle(Decimal::MAX),
            Err(WalletOutcome::Overflow {
                balance: Decimal::MAX
            })
        );
    }
}
