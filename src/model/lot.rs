use super::ids::{LotId, MedicationId, OperatorId};
use crate::quantity::Quantity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One received batch of one medication.
///
/// `current_quantity` is the running balance and is only written by the ledger inside
/// the atomic unit that also records the transaction explaining the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    pub medication_id: MedicationId,
    pub lot_number: String,
    pub expiration_date: NaiveDate,
    pub quantity_received: Quantity,
    pub current_quantity: Quantity,
    pub unit: String,
    pub source: Option<String>,
    pub invoice_number: Option<String>,
    pub storage_location: Option<String>,
    pub received_by: OperatorId,
    pub received_at: DateTime<Utc>,
    pub is_active: bool,
    pub quarantine: Option<Quarantine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quarantine {
    pub reason: String,
    pub by: OperatorId,
    pub at: DateTime<Utc>,
}

impl Lot {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiration_date < today
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }

    /// Part of the container has left the shelf
    pub fn is_opened(&self) -> bool {
        self.current_quantity < self.quantity_received
    }
}

/// Lot about to be inserted; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewLot {
    pub medication_id: MedicationId,
    pub lot_number: String,
    pub expiration_date: NaiveDate,
    pub quantity_received: Quantity,
    pub unit: String,
    pub source: Option<String>,
    pub invoice_number: Option<String>,
    pub storage_location: Option<String>,
    pub received_by: OperatorId,
    pub received_at: DateTime<Utc>,
}

impl NewLot {
    pub fn into_lot(self, id: LotId) -> Lot {
        Lot {
            id,
            medication_id: self.medication_id,
            lot_number: self.lot_number,
            expiration_date: self.expiration_date,
            current_quantity: self.quantity_received,
            quantity_received: self.quantity_received,
            unit: self.unit,
            source: self.source,
            invoice_number: self.invoice_number,
            storage_location: self.storage_location,
            received_by: self.received_by,
            received_at: self.received_at,
            is_active: true,
            quarantine: None,
        }
    }
}

/// Receiving request as entered by an operator
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveLot {
    pub medication_id: MedicationId,
    pub lot_number: String,
    pub expiration_date: NaiveDate,
    pub quantity: Quantity,
    /// Falls back to the catalog's default unit
    pub unit: Option<String>,
    pub source: Option<String>,
    pub invoice_number: Option<String>,
    pub storage_location: Option<String>,
}

/// Filter for lot reads. Empty filter means every lot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LotFilter {
    pub medication_id: Option<MedicationId>,
    pub active_only: bool,
    pub with_stock_only: bool,
}

impl LotFilter {
    pub fn medication(medication_id: MedicationId) -> Self {
        Self {
            medication_id: Some(medication_id),
            ..Self::default()
        }
    }

    pub fn on_hand() -> Self {
        Self {
            medication_id: None,
            active_only: true,
            with_stock_only: true,
        }
    }

    pub fn matches(&self, lot: &Lot) -> bool {
        self.medication_id.map_or(true, |m| lot.medication_id == m)
            && (!self.active_only || lot.is_active)
            && (!self.with_stock_only || lot.current_quantity > Quantity::ZERO)
    }
}

/// Outcome of retiring a lot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retirement {
    /// No history referenced the lot; the row is gone
    HardDeleted,
    /// History exists; the lot stays on file deactivated
    SoftDeleted { reason: String },
}
