use super::ids::{CountId, LotId, MedicationId, OperatorId, PatientStockId, PatientStockLogId, SessionId, TransactionId};
use crate::quantity::Quantity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Daily,
    Full,
    ScheduleII,
    SpotCheck,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Daily => "daily",
            SessionKind::Full => "full",
            SessionKind::ScheduleII => "schedule_ii",
            SessionKind::SpotCheck => "spot_check",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(SessionKind::Daily),
            "full" => Some(SessionKind::Full),
            "schedule_ii" => Some(SessionKind::ScheduleII),
            "spot_check" => Some(SessionKind::SpotCheck),
            _ => None,
        }
    }
}

/// `InProgress -> Completed -> Reviewed`; no state is skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Reviewed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Reviewed => "reviewed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            "reviewed" => Some(SessionStatus::Reviewed),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            SessionStatus::InProgress => Some(SessionStatus::Completed),
            SessionStatus::Completed => Some(SessionStatus::Reviewed),
            SessionStatus::Reviewed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSession {
    pub id: SessionId,
    pub kind: SessionKind,
    pub session_date: NaiveDate,
    pub status: SessionStatus,
    pub started_by: OperatorId,
    pub started_at: DateTime<Utc>,
    pub completed_by: Option<OperatorId>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<OperatorId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub kind: SessionKind,
    pub session_date: NaiveDate,
    pub started_by: OperatorId,
    pub started_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl NewSession {
    pub fn into_session(self, id: SessionId) -> CountSession {
        CountSession {
            id,
            kind: self.kind,
            session_date: self.session_date,
            status: SessionStatus::InProgress,
            started_by: self.started_by,
            started_at: self.started_at,
            completed_by: None,
            completed_at: None,
            reviewed_by: None,
            reviewed_at: None,
            notes: self.notes,
        }
    }
}

/// What a count row verifies: a lot, or a patient's prepared stock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CountTarget {
    Lot(LotId),
    PatientStock(PatientStockId),
}

/// Ledger entry written when a resolution adjusted stock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AdjustmentRef {
    Transaction(TransactionId),
    PatientStockLog(PatientStockLogId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolution_type: String,
    /// Stored as `[TYPE] notes`
    pub notes: String,
    pub resolved_by: OperatorId,
    pub resolved_at: DateTime<Utc>,
    pub adjustment: Option<AdjustmentRef>,
}

/// One expected-vs-actual verification inside a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Count {
    pub id: CountId,
    pub session_id: SessionId,
    pub target: CountTarget,
    pub medication_id: MedicationId,
    /// Copied from the target when the session started
    pub expected_quantity: Quantity,
    pub actual_quantity: Option<Quantity>,
    pub counted_by: Option<OperatorId>,
    pub counted_at: Option<DateTime<Utc>>,
    pub verified_by: Option<OperatorId>,
    pub verified_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub resolution: Option<Resolution>,
}

impl Count {
    /// `actual - expected`, recomputed on every read
    pub fn discrepancy(&self) -> Option<Quantity> {
        self.actual_quantity.map(|actual| actual - self.expected_quantity)
    }

    pub fn has_discrepancy(&self) -> bool {
        self.discrepancy().is_some_and(|d| !d.is_zero())
    }

    /// Zero discrepancies resolve themselves; anything else needs a resolution on file
    pub fn discrepancy_resolved(&self) -> bool {
        match self.discrepancy() {
            Some(d) if d.is_zero() => true,
            Some(_) => self.resolution.is_some(),
            None => false,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified_by.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCount {
    pub session_id: SessionId,
    pub target: CountTarget,
    pub medication_id: MedicationId,
    pub expected_quantity: Quantity,
}

impl NewCount {
    pub fn into_count(self, id: CountId) -> Count {
        Count {
            id,
            session_id: self.session_id,
            target: self.target,
            medication_id: self.medication_id,
            expected_quantity: self.expected_quantity,
            actual_quantity: None,
            counted_by: None,
            counted_at: None,
            verified_by: None,
            verified_at: None,
            notes: None,
            resolution: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilter {
    pub kind: Option<SessionKind>,
    pub status: Option<SessionStatus>,
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl SessionFilter {
    pub fn matches(&self, session: &CountSession) -> bool {
        self.kind.map_or(true, |k| session.kind == k)
            && self.status.map_or(true, |s| session.status == s)
            && self.from.map_or(true, |from| session.session_date >= from)
            && self.until.map_or(true, |until| session.session_date <= until)
    }
}

/// One line of the discrepancy report
#[derive(Debug, Clone, PartialEq)]
pub struct DiscrepancyLine {
    pub session: CountSession,
    pub count: Count,
    pub discrepancy: Quantity,
}
