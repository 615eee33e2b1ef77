use super::ids::OperatorId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Operator role as held by the identity store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Provider,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Provider => "provider",
            Role::Staff => "staff",
        }
    }
}

/// Prescribing authority attached to an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrescriberAuthority {
    pub dea_number: Option<String>,
    /// Last day the authority is valid, inclusive; `None` means no expiry on file
    pub valid_through: Option<NaiveDate>,
    pub schedule_ii: bool,
}

/// Snapshot of one operator account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: OperatorId,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub is_active: bool,
    pub prescriber: Option<PrescriberAuthority>,
}

impl Operator {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Checks that this operator may prescribe a medication of `schedule` on `on`.
    ///
    /// Returns the reason text when the operator cannot.
    pub fn prescribing_refusal(&self, schedule: super::Schedule, on: NaiveDate) -> Option<String> {
        if !self.is_active {
            return Some("account is deactivated".to_string());
        }
        if !matches!(self.role, Role::Admin | Role::Provider) {
            return Some("operator is not a provider".to_string());
        }
        let Some(authority) = &self.prescriber else {
            return Some("no prescribing authority on file".to_string());
        };
        if let Some(valid_through) = authority.valid_through {
            if valid_through < on {
                return Some(format!("authority expired {valid_through}"));
            }
        }
        if schedule == super::Schedule::II && !authority.schedule_ii {
            return Some("no Schedule II authority".to_string());
        }
        None
    }
}
