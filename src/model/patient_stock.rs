use super::ids::{LotId, MedicationId, OperatorId, PatientId, PatientStockId, PatientStockLogId};
use super::transaction::PatientLink;
use crate::quantity::Quantity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientStockStatus {
    Active,
    Completed,
    Expired,
    Destroyed,
}

impl PatientStockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatientStockStatus::Active => "active",
            PatientStockStatus::Completed => "completed",
            PatientStockStatus::Expired => "expired",
            PatientStockStatus::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PatientStockStatus::Active),
            "completed" => Some(PatientStockStatus::Completed),
            "expired" => Some(PatientStockStatus::Expired),
            "destroyed" => Some(PatientStockStatus::Destroyed),
            _ => None,
        }
    }
}

/// Medication prepared for and held on behalf of one patient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientStock {
    pub id: PatientStockId,
    pub patient: PatientLink,
    pub medication_id: MedicationId,
    pub source_lot: Option<LotId>,
    pub preparation_date: NaiveDate,
    pub prepared_by: OperatorId,
    pub prescriber: OperatorId,
    pub lot_number: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub quantity_prepared: Quantity,
    pub quantity_remaining: Quantity,
    pub unit: String,
    pub status: PatientStockStatus,
    pub storage_location: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PatientStock {
    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient.patient_id
    }

    pub fn is_active(&self) -> bool {
        self.status == PatientStockStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPatientStock {
    pub patient: PatientLink,
    pub medication_id: MedicationId,
    pub source_lot: Option<LotId>,
    pub preparation_date: NaiveDate,
    pub prepared_by: OperatorId,
    pub prescriber: OperatorId,
    pub lot_number: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub quantity_prepared: Quantity,
    pub unit: String,
    pub storage_location: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewPatientStock {
    pub fn into_stock(self, id: PatientStockId) -> PatientStock {
        PatientStock {
            id,
            patient: self.patient,
            medication_id: self.medication_id,
            source_lot: self.source_lot,
            preparation_date: self.preparation_date,
            prepared_by: self.prepared_by,
            prescriber: self.prescriber,
            lot_number: self.lot_number,
            expiration_date: self.expiration_date,
            quantity_remaining: self.quantity_prepared,
            quantity_prepared: self.quantity_prepared,
            unit: self.unit,
            status: PatientStockStatus::Active,
            storage_location: self.storage_location,
            notes: self.notes,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientStockLogKind {
    Prepared,
    Added,
    Administered,
    Wasted,
    Destroyed,
    Adjusted,
}

impl PatientStockLogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatientStockLogKind::Prepared => "prepared",
            PatientStockLogKind::Added => "added",
            PatientStockLogKind::Administered => "administered",
            PatientStockLogKind::Wasted => "wasted",
            PatientStockLogKind::Destroyed => "destroyed",
            PatientStockLogKind::Adjusted => "adjusted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepared" => Some(PatientStockLogKind::Prepared),
            "added" => Some(PatientStockLogKind::Added),
            "administered" => Some(PatientStockLogKind::Administered),
            "wasted" => Some(PatientStockLogKind::Wasted),
            "destroyed" => Some(PatientStockLogKind::Destroyed),
            "adjusted" => Some(PatientStockLogKind::Adjusted),
            _ => None,
        }
    }

    /// Prepared and added entries grow `quantity_prepared` rather than consume it
    pub fn is_intake(&self) -> bool {
        matches!(self, PatientStockLogKind::Prepared | PatientStockLogKind::Added)
    }
}

/// Before/after record of one patient-stock balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientStockLog {
    pub id: PatientStockLogId,
    pub stock_id: PatientStockId,
    pub kind: PatientStockLogKind,
    /// Signed change applied to `quantity_remaining`
    pub quantity: Quantity,
    pub quantity_before: Quantity,
    pub quantity_after: Quantity,
    pub actor: OperatorId,
    pub witness: Option<OperatorId>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPatientStockLog {
    pub stock_id: PatientStockId,
    pub kind: PatientStockLogKind,
    pub quantity: Quantity,
    pub quantity_before: Quantity,
    pub quantity_after: Quantity,
    pub actor: OperatorId,
    pub witness: Option<OperatorId>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl NewPatientStockLog {
    pub fn into_log(self, id: PatientStockLogId) -> PatientStockLog {
        PatientStockLog {
            id,
            stock_id: self.stock_id,
            kind: self.kind,
            quantity: self.quantity,
            quantity_before: self.quantity_before,
            quantity_after: self.quantity_after,
            actor: self.actor,
            witness: self.witness,
            reason: self.reason,
            notes: self.notes,
            occurred_at: self.occurred_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientStockFilter {
    pub patient_id: Option<PatientId>,
    pub medication_id: Option<MedicationId>,
    pub status: Option<PatientStockStatus>,
    pub with_stock_only: bool,
}

impl PatientStockFilter {
    pub fn matches(&self, stock: &PatientStock) -> bool {
        self.patient_id.map_or(true, |p| stock.patient_id() == Some(p))
            && self.medication_id.map_or(true, |m| stock.medication_id == m)
            && self.status.map_or(true, |s| stock.status == s)
            && (!self.with_stock_only || stock.quantity_remaining > Quantity::ZERO)
    }
}
