use super::ids::{LotId, MedicationId, OperatorId, PatientId, TransactionId};
use crate::quantity::Quantity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Dispense,
    Waste,
    Adjust,
    Return,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Dispense => "dispense",
            TransactionKind::Waste => "waste",
            TransactionKind::Adjust => "adjust",
            TransactionKind::Return => "return",
            TransactionKind::Transfer => "transfer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispense" => Some(TransactionKind::Dispense),
            "waste" => Some(TransactionKind::Waste),
            "adjust" => Some(TransactionKind::Adjust),
            "return" => Some(TransactionKind::Return),
            "transfer" => Some(TransactionKind::Transfer),
            _ => None,
        }
    }

    /// Effect of a recorded `quantity` on the lot balance.
    ///
    /// Dispense, waste and transfer record the amount removed, return the amount added,
    /// and adjust records the signed delta itself.
    pub fn signed(&self, quantity: Quantity) -> Quantity {
        match self {
            TransactionKind::Dispense | TransactionKind::Waste | TransactionKind::Transfer => -quantity,
            TransactionKind::Return | TransactionKind::Adjust => quantity,
        }
    }

    pub fn is_voidable(&self) -> bool {
        matches!(
            self,
            TransactionKind::Dispense | TransactionKind::Waste | TransactionKind::Adjust
        )
    }

    /// Refused on expired or quarantined lots
    pub fn removes_for_use(&self) -> bool {
        matches!(self, TransactionKind::Dispense | TransactionKind::Transfer)
    }
}

/// Patient details captured on a dispense
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientLink {
    pub patient_id: Option<PatientId>,
    pub name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub mrn: Option<String>,
    pub prescription_number: Option<String>,
}

impl PatientLink {
    pub fn is_empty(&self) -> bool {
        self.patient_id.is_none()
            && self.name.is_none()
            && self.date_of_birth.is_none()
            && self.mrn.is_none()
            && self.prescription_number.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidRecord {
    pub voided_by: OperatorId,
    pub voided_at: DateTime<Utc>,
    pub reason: String,
    pub reversal_id: TransactionId,
}

/// Immutable balance-affecting event against one lot.
///
/// Only `void` is ever written after insert, and only once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    pub id: TransactionId,
    pub lot_id: LotId,
    pub medication_id: MedicationId,
    pub kind: TransactionKind,
    pub quantity: Quantity,
    pub balance_before: Quantity,
    pub balance_after: Quantity,
    pub actor: OperatorId,
    pub witness: Option<OperatorId>,
    pub witnessed_at: Option<DateTime<Utc>>,
    pub prescriber: Option<OperatorId>,
    pub patient: Option<PatientLink>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub destination: Option<String>,
    /// Set on the compensating entry written by a void
    pub reverses: Option<TransactionId>,
    pub occurred_at: DateTime<Utc>,
    pub void: Option<VoidRecord>,
}

impl InventoryTransaction {
    pub fn signed_quantity(&self) -> Quantity {
        self.kind.signed(self.quantity)
    }

    pub fn is_voided(&self) -> bool {
        self.void.is_some()
    }

    pub fn is_reversal(&self) -> bool {
        self.reverses.is_some()
    }
}

/// Transaction about to be inserted; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub lot_id: LotId,
    pub medication_id: MedicationId,
    pub kind: TransactionKind,
    pub quantity: Quantity,
    pub balance_before: Quantity,
    pub balance_after: Quantity,
    pub actor: OperatorId,
    pub witness: Option<OperatorId>,
    pub witnessed_at: Option<DateTime<Utc>>,
    pub prescriber: Option<OperatorId>,
    pub patient: Option<PatientLink>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub destination: Option<String>,
    pub reverses: Option<TransactionId>,
    pub occurred_at: DateTime<Utc>,
}

impl NewTransaction {
    pub fn into_transaction(self, id: TransactionId) -> InventoryTransaction {
        InventoryTransaction {
            id,
            lot_id: self.lot_id,
            medication_id: self.medication_id,
            kind: self.kind,
            quantity: self.quantity,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            actor: self.actor,
            witness: self.witness,
            witnessed_at: self.witnessed_at,
            prescriber: self.prescriber,
            patient: self.patient,
            reason: self.reason,
            notes: self.notes,
            destination: self.destination,
            reverses: self.reverses,
            occurred_at: self.occurred_at,
            void: None,
        }
    }
}

/// Filter for transaction history reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    pub lot_id: Option<LotId>,
    pub medication_id: Option<MedicationId>,
    pub patient_id: Option<PatientId>,
    pub kind: Option<TransactionKind>,
    /// Inclusive lower bound on `occurred_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`
    pub until: Option<DateTime<Utc>>,
    pub include_voided: bool,
}

impl TransactionFilter {
    pub fn lot(lot_id: LotId) -> Self {
        Self {
            lot_id: Some(lot_id),
            include_voided: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, tx: &InventoryTransaction) -> bool {
        self.lot_id.map_or(true, |l| tx.lot_id == l)
            && self.medication_id.map_or(true, |m| tx.medication_id == m)
            && self.patient_id.map_or(true, |p| {
                tx.patient.as_ref().and_then(|link| link.patient_id) == Some(p)
            })
            && self.kind.map_or(true, |k| tx.kind == k)
            && self.from.map_or(true, |from| tx.occurred_at >= from)
            && self.until.map_or(true, |until| tx.occurred_at < until)
            && (self.include_voided || !tx.is_voided())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(v: i64) -> Quantity {
        Quantity::from(v)
    }

    #[test]
    fn test_signed_quantity_by_kind() {
        assert_eq!(TransactionKind::Dispense.signed(q(30)), q(-30));
        assert_eq!(TransactionKind::Waste.signed(q(10)), q(-10));
        assert_eq!(TransactionKind::Transfer.signed(q(5)), q(-5));
        assert_eq!(TransactionKind::Return.signed(q(5)), q(5));
        assert_eq!(TransactionKind::Adjust.signed(q(-5)), q(-5));
    }

    #[test]
    fn test_patient_link_is_empty() {
        assert!(PatientLink::default().is_empty());
        let link = PatientLink {
            mrn: Some("MRN-1".to_string()),
            ..PatientLink::default()
        };
        assert!(!link.is_empty());
    }

    #[test]
    fn test_voidable_kinds() {
        assert!(TransactionKind::Dispense.is_voidable());
        assert!(TransactionKind::Waste.is_voidable());
        assert!(TransactionKind::Adjust.is_voidable());
        assert!(!TransactionKind::Return.is_voidable());
        assert!(!TransactionKind::Transfer.is_voidable());
    }

    #[test]
    fn test_kind_parse_round_trip() {
        for kind in [
            TransactionKind::Dispense,
            TransactionKind::Waste,
            TransactionKind::Adjust,
            TransactionKind::Return,
            TransactionKind::Transfer,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("receive"), None);
    }
}
