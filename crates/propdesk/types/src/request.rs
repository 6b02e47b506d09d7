use crate::form::FieldValue;
use crate::identity::{ParseEnumError, Permission};
use crate::ids::{BankId, BranchId, FormId, RequestId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which professional category a request targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForWhom {
    Advocate,
    Valuator,
    Both,
}

impl ForWhom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForWhom::Advocate => "advocate",
            ForWhom::Valuator => "valuator",
            ForWhom::Both => "both",
        }
    }

    pub fn wants_valuator(&self) -> bool {
        matches!(self, ForWhom::Valuator | ForWhom::Both)
    }

    pub fn wants_advocate(&self) -> bool {
        matches!(self, ForWhom::Advocate | ForWhom::Both)
    }

    /// Whether a holder of `permission` is in this request's target audience.
    pub fn includes(&self, permission: Permission) -> bool {
        match permission {
            Permission::Valuator => self.wants_valuator(),
            Permission::Advocate => self.wants_advocate(),
            Permission::Admin | Permission::BankUser => false,
        }
    }
}

impl FromStr for ForWhom {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advocate" => Ok(ForWhom::Advocate),
            "valuator" => Ok(ForWhom::Valuator),
            "both" => Ok(ForWhom::Both),
            other => Err(ParseEnumError::new("for_whom", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

/// Lifecycle state of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Returned,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::Pending,
        RequestStatus::Assigned,
        RequestStatus::InProgress,
        RequestStatus::Completed,
        RequestStatus::Returned,
        RequestStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Assigned => "assigned",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Returned => "returned",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Returned | RequestStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "assigned" => Ok(RequestStatus::Assigned),
            "in_progress" => Ok(RequestStatus::InProgress),
            "completed" => Ok(RequestStatus::Completed),
            "returned" => Ok(RequestStatus::Returned),
            "cancelled" => Ok(RequestStatus::Cancelled),
            other => Err(ParseEnumError::new("request status", other)),
        }
    }
}

/// A valuation / legal-verification request.
///
/// `fields` is a snapshot owned by the request; later edits to the form it
/// was submitted against never reach it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub form_id: FormId,
    pub bank_id: BankId,
    pub bank_branch_id: Option<BranchId>,
    pub created_by_user_id: UserId,
    pub for_whom: ForWhom,
    pub fields: Vec<FieldValue>,
    pub status: RequestStatus,
    pub priority: Priority,
    pub assigned_valuator_id: Option<UserId>,
    pub assigned_advocate_id: Option<UserId>,
    pub return_reason: Option<String>,
    pub completion_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn is_assignee(&self, user_id: &UserId) -> bool {
        self.assigned_valuator_id.as_ref() == Some(user_id)
            || self.assigned_advocate_id.as_ref() == Some(user_id)
    }
}

/// Per-status request counts within one caller's visibility scope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub returned: usize,
    pub cancelled: usize,
}

impl RequestStats {
    pub fn record(&mut self, status: RequestStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: RequestStatus, count: usize) {
        self.total += count;
        let slot = match status {
            RequestStatus::Pending => &mut self.pending,
            RequestStatus::Assigned => &mut self.assigned,
            RequestStatus::InProgress => &mut self.in_progress,
            RequestStatus::Completed => &mut self.completed,
            RequestStatus::Returned => &mut self.returned,
            RequestStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn count(&self, status: RequestStatus) -> usize {
        match status {
            RequestStatus::Pending => self.pending,
            RequestStatus::Assigned => self.assigned,
            RequestStatus::InProgress => self.in_progress,
            RequestStatus::Completed => self.completed,
            RequestStatus::Returned => self.returned,
            RequestStatus::Cancelled => self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_final_states_are_terminal() {
        let terminal: Vec<_> = RequestStatus::ALL
            .into_iter()
            .filter(RequestStatus::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![
                RequestStatus::Completed,
                RequestStatus::Returned,
                RequestStatus::Cancelled
            ]
        );
    }

    #[test]
    fn for_whom_audience() {
        assert!(ForWhom::Both.includes(Permission::Valuator));
        assert!(ForWhom::Both.includes(Permission::Advocate));
        assert!(!ForWhom::Valuator.includes(Permission::Advocate));
        assert!(!ForWhom::Advocate.includes(Permission::Admin));
    }

    #[test]
    fn status_wire_names_round_trip() {
        for status in RequestStatus::ALL {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_value(RequestStatus::InProgress).unwrap(),
            "in_progress"
        );
    }
}
