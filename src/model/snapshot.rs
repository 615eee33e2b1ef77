use super::ids::{LotId, MedicationId, OperatorId, SnapshotId, SnapshotLineId};
use super::medication::Schedule;
use crate::quantity::Quantity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// When during the business day the inventory was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryTiming {
    OpeningOfBusiness,
    CloseOfBusiness,
}

impl InventoryTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryTiming::OpeningOfBusiness => "opening_of_business",
            InventoryTiming::CloseOfBusiness => "close_of_business",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opening_of_business" => Some(InventoryTiming::OpeningOfBusiness),
            "close_of_business" => Some(InventoryTiming::CloseOfBusiness),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMethod {
    Exact,
    Estimated,
}

impl CountMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountMethod::Exact => "exact",
            CountMethod::Estimated => "estimated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(CountMethod::Exact),
            "estimated" => Some(CountMethod::Estimated),
            _ => None,
        }
    }
}

/// Point-in-time regulatory inventory header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub id: SnapshotId,
    pub inventory_date: NaiveDate,
    pub timing: InventoryTiming,
    pub dea_registration: Option<String>,
    pub state_registration: Option<String>,
    pub conducted_by: OperatorId,
    pub witnessed_by: Option<OperatorId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl InventorySnapshot {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub inventory_date: NaiveDate,
    pub timing: InventoryTiming,
    pub dea_registration: Option<String>,
    pub state_registration: Option<String>,
    pub conducted_by: OperatorId,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl NewSnapshot {
    pub fn into_snapshot(self, id: SnapshotId) -> InventorySnapshot {
        InventorySnapshot {
            id,
            inventory_date: self.inventory_date,
            timing: self.timing,
            dea_registration: self.dea_registration,
            state_registration: self.state_registration,
            conducted_by: self.conducted_by,
            witnessed_by: None,
            created_at: self.created_at,
            completed_at: None,
            notes: self.notes,
        }
    }
}

/// Frozen copy of one lot as it stood when the snapshot was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLine {
    pub id: SnapshotLineId,
    pub snapshot_id: SnapshotId,
    pub medication_id: MedicationId,
    pub lot_id: Option<LotId>,
    pub drug_name: String,
    pub schedule: Schedule,
    pub ndc: Option<String>,
    pub form: Option<String>,
    pub strength: Option<String>,
    pub lot_number: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub container_opened: bool,
    pub quantity_counted: Quantity,
    pub unit: String,
    pub method: CountMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshotLine {
    pub snapshot_id: SnapshotId,
    pub medication_id: MedicationId,
    pub lot_id: Option<LotId>,
    pub drug_name: String,
    pub schedule: Schedule,
    pub ndc: Option<String>,
    pub form: Option<String>,
    pub strength: Option<String>,
    pub lot_number: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub container_opened: bool,
    pub quantity_counted: Quantity,
    pub unit: String,
    pub method: CountMethod,
}

impl NewSnapshotLine {
    pub fn into_line(self, id: SnapshotLineId) -> SnapshotLine {
        SnapshotLine {
            id,
            snapshot_id: self.snapshot_id,
            medication_id: self.medication_id,
            lot_id: self.lot_id,
            drug_name: self.drug_name,
            schedule: self.schedule,
            ndc: self.ndc,
            form: self.form,
            strength: self.strength,
            lot_number: self.lot_number,
            expiration_date: self.expiration_date,
            container_opened: self.container_opened,
            quantity_counted: self.quantity_counted,
            unit: self.unit,
            method: self.method,
        }
    }
}

/// Snapshot lines split the way the regulatory report lists them
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotReport {
    pub snapshot: InventorySnapshot,
    pub schedule_ii: Vec<SnapshotLine>,
    pub schedules_iii_to_v: Vec<SnapshotLine>,
}
