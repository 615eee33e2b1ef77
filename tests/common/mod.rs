//! Ledger fixture assembled from the public API only.
#![allow(dead_code)]

use chrono::{NaiveDate, TimeZone, Utc};
use countersign::model::{
    Lot, MedicationId, MedicationInfo, Operator, OperatorId, PatientId, PatientLink,
    PrescriberAuthority, ReceiveLot, Role, Schedule,
};
use countersign::{Countersign, FixedClock, LedgerSettings, MemoryStore, Quantity, StaticDirectory, WitnessCredential};
use std::sync::Arc;

pub const ADMIN: OperatorId = OperatorId(1);
pub const NURSE: OperatorId = OperatorId(2);
pub const TECH: OperatorId = OperatorId(3);
pub const DOCTOR: OperatorId = OperatorId(4);

pub const MORPHINE: MedicationId = MedicationId(20);
pub const DIAZEPAM: MedicationId = MedicationId(21);

pub fn q(value: i64) -> Quantity {
    Quantity::from(value)
}

pub fn credential(id: OperatorId) -> WitnessCredential {
    WitnessCredential::new(id, format!("secret-{}", id.get()))
}

pub fn patient() -> PatientLink {
    PatientLink {
        patient_id: Some(PatientId(501)),
        name: Some("Roe, Richard".to_string()),
        ..PatientLink::default()
    }
}

fn staff(id: OperatorId, role: Role) -> Operator {
    let prescriber = (role == Role::Provider).then(|| PrescriberAuthority {
        dea_number: Some("BD1234563".to_string()),
        valid_through: None,
        schedule_ii: true,
    });
    Operator {
        id,
        username: format!("op{}", id.get()),
        full_name: format!("Operator {}", id.get()),
        role,
        is_active: true,
        prescriber,
    }
}

fn drug(id: MedicationId, name: &str, schedule: Schedule) -> MedicationInfo {
    MedicationInfo {
        id,
        name: name.to_string(),
        schedule,
        default_unit: Some("mg".to_string()),
        ndc: None,
        form: Some("injection".to_string()),
        strength: None,
        patient_inventory_only: false,
        is_active: true,
    }
}

pub struct Clinic {
    pub ledger: Countersign<MemoryStore>,
    pub directory: Arc<StaticDirectory>,
    pub clock: Arc<FixedClock>,
}

pub fn clinic() -> Clinic {
    clinic_with(LedgerSettings::default())
}

pub fn clinic_with(settings: LedgerSettings) -> Clinic {
    let directory = Arc::new(StaticDirectory::new());
    for (id, role) in [(ADMIN, Role::Admin), (NURSE, Role::Staff), (TECH, Role::Staff), (DOCTOR, Role::Provider)] {
        directory.add_operator(staff(id, role), &format!("secret-{}", id.get()));
    }
    directory.add_medication(drug(MORPHINE, "Morphine 10 mg/mL", Schedule::II));
    directory.add_medication(drug(DIAZEPAM, "Diazepam 5 mg/mL", Schedule::IV));

    let clock = Arc::new(
        FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0)
                .single()
                .expect("valid date"),
        ),
    );
    let ledger = Countersign::new(MemoryStore::new(), directory.clone(), directory.clone(), settings)
        .with_clock(clock.clone());
    Clinic {
        ledger,
        directory,
        clock,
    }
}

impl Clinic {
    pub fn receive(&self, medication_id: MedicationId, quantity: i64) -> Lot {
        self.ledger
            .lots()
            .receive_lot(
                ReceiveLot {
                    medication_id,
                    lot_number: format!("LOT-{}", medication_id.get()),
                    expiration_date: NaiveDate::from_ymd_opt(2027, 1, 31).expect("valid date"),
                    quantity: q(quantity),
                    unit: None,
                    source: Some("Cardinal".to_string()),
                    invoice_number: Some("INV-1".to_string()),
                    storage_location: Some("Vault".to_string()),
                },
                NURSE,
            )
            .expect("receive lot")
    }
}
