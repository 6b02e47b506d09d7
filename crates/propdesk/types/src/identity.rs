use crate::ids::{BankId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a wire string does not name a known enum member.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// The closed set of roles a user can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Admin,
    BankUser,
    Valuator,
    Advocate,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::Admin,
        Permission::BankUser,
        Permission::Valuator,
        Permission::Advocate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Admin => "admin",
            Permission::BankUser => "bank_user",
            Permission::Valuator => "valuator",
            Permission::Advocate => "advocate",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Permission::Admin),
            "bank_user" => Ok(Permission::BankUser),
            "valuator" => Ok(Permission::Valuator),
            "advocate" => Ok(Permission::Advocate),
            other => Err(ParseEnumError::new("permission", other)),
        }
    }
}

/// Ordered, duplicate-free set of permissions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn of(permissions: &[Permission]) -> Self {
        permissions.iter().copied().collect()
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    /// True when the two sets share at least one permission.
    pub fn intersects(&self, other: &PermissionSet) -> bool {
        self.0.iter().any(|p| other.0.contains(p))
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|p| p.as_str().to_string()).collect()
    }

    pub fn parse_all<I, S>(values: I) -> Result<Self, ParseEnumError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        values
            .into_iter()
            .map(|v| v.as_ref().parse::<Permission>())
            .collect()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The resolved identity of a caller for the duration of one operation.
///
/// Built either from a fresh authentication or from a verified session token;
/// it is never mutated once constructed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub permissions: PermissionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_id: Option<BankId>,
}

impl Principal {
    pub fn new(id: UserId, permissions: PermissionSet, bank_id: Option<BankId>) -> Self {
        Self {
            id,
            permissions,
            bank_id,
        }
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_wire_names_round_trip() {
        for permission in Permission::ALL {
            assert_eq!(permission.as_str().parse::<Permission>().unwrap(), permission);
        }
        assert!("superuser".parse::<Permission>().is_err());
    }

    #[test]
    fn permission_set_deduplicates_and_serializes_as_array() {
        let set = PermissionSet::of(&[Permission::Valuator, Permission::Admin, Permission::Valuator]);
        assert_eq!(set.len(), 2);
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            serde_json::json!(["admin", "valuator"])
        );
    }

    #[test]
    fn parse_all_rejects_unknown_roles() {
        let err = PermissionSet::parse_all(["admin", "auditor"]).unwrap_err();
        assert_eq!(err.value, "auditor");
    }
}
