//! Shared fixtures for unit tests.

use crate::clock::FixedClock;
use crate::config::LedgerSettings;
use crate::context::Countersign;
use crate::directory::StaticDirectory;
use crate::identity::WitnessCredential;
use crate::model::{
    Lot, MedicationId, MedicationInfo, Operator, OperatorId, PatientId, PatientLink,
    PrescriberAuthority, ReceiveLot, Role, Schedule,
};
use crate::patient_stock::PrepareStock;
use crate::quantity::Quantity;
use crate::store::MemoryStore;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;

pub const ADMIN: OperatorId = OperatorId(1);
pub const NURSE: OperatorId = OperatorId(2);
pub const TECH: OperatorId = OperatorId(3);
pub const DOCTOR: OperatorId = OperatorId(4);

pub const LORAZEPAM: MedicationId = MedicationId(10);
pub const FENTANYL: MedicationId = MedicationId(11);
/// Stocked per patient only
pub const TESTOSTERONE: MedicationId = MedicationId(12);

/// Noon UTC on the given day
pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
        .single()
        .expect("valid test date")
}

pub fn q(value: i64) -> Quantity {
    Quantity::from(value)
}

pub fn operator(id: i64, role: Role) -> Operator {
    let prescriber = matches!(role, Role::Admin | Role::Provider).then(|| PrescriberAuthority {
        dea_number: Some(format!("AB{id:07}")),
        valid_through: None,
        schedule_ii: true,
    });
    Operator {
        id: OperatorId(id),
        username: format!("user{id}"),
        full_name: format!("User {id}"),
        role,
        is_active: true,
        prescriber,
    }
}

pub fn medication(id: i64, schedule: Schedule) -> MedicationInfo {
    MedicationInfo {
        id: MedicationId(id),
        name: format!("Medication {id}"),
        schedule,
        default_unit: None,
        ndc: None,
        form: None,
        strength: None,
        patient_inventory_only: false,
        is_active: true,
    }
}

pub struct Fixture {
    pub ledger: Countersign<MemoryStore>,
    pub directory: Arc<StaticDirectory>,
    pub clock: Arc<FixedClock>,
}

impl Fixture {
    /// Credential for `id` with the fixture's password convention
    pub fn credential(&self, id: OperatorId) -> WitnessCredential {
        WitnessCredential::new(id, format!("pw{id}"))
    }

    pub fn receive_request(&self, medication_id: MedicationId, quantity: i64) -> ReceiveLot {
        ReceiveLot {
            medication_id,
            lot_number: format!("A{}", 100 + medication_id.get()),
            expiration_date: NaiveDate::from_ymd_opt(2030, 12, 31).expect("valid date"),
            quantity: q(quantity),
            unit: None,
            source: Some("Wholesaler".to_string()),
            invoice_number: None,
            storage_location: Some("Safe 1".to_string()),
        }
    }
}

/// Ledger on a fresh memory store, clock at 2024-03-01
pub fn fixture() -> Fixture {
    let directory = Arc::new(StaticDirectory::new());
    for (id, role) in [(1, Role::Admin), (2, Role::Staff), (3, Role::Staff), (4, Role::Provider)] {
        directory.add_operator(operator(id, role), &format!("pw{id}"));
    }

    let mut lorazepam = medication(LORAZEPAM.get(), Schedule::IV);
    lorazepam.name = "Lorazepam 1 mg".to_string();
    lorazepam.default_unit = Some("tablets".to_string());
    directory.add_medication(lorazepam);
    let mut fentanyl = medication(FENTANYL.get(), Schedule::II);
    fentanyl.name = "Fentanyl 50 mcg/mL".to_string();
    fentanyl.default_unit = Some("mL".to_string());
    directory.add_medication(fentanyl);
    let mut testosterone = medication(TESTOSTERONE.get(), Schedule::III);
    testosterone.name = "Testosterone cypionate".to_string();
    testosterone.patient_inventory_only = true;
    directory.add_medication(testosterone);

    let clock = Arc::new(FixedClock::new(at(2024, 3, 1)));
    let ledger = Countersign::new(
        MemoryStore::new(),
        directory.clone(),
        directory.clone(),
        LedgerSettings::default(),
    )
    .with_clock(clock.clone());
    Fixture {
        ledger,
        directory,
        clock,
    }
}

/// Receives a lot of `medication_id` as the nurse
pub fn receive(fx: &Fixture, medication_id: MedicationId, quantity: i64) -> Lot {
    fx.ledger
        .lots()
        .receive_lot(fx.receive_request(medication_id, quantity), NURSE)
        .expect("receive lot")
}

/// Preparation for patient 77, prescribed by the doctor
pub fn prepare_request(medication_id: MedicationId, quantity: i64) -> PrepareStock {
    PrepareStock {
        patient: PatientLink {
            patient_id: Some(PatientId(77)),
            name: Some("Doe, Jane".to_string()),
            ..PatientLink::default()
        },
        medication_id,
        source_lot: None,
        quantity: q(quantity),
        prescriber: DOCTOR,
        preparation_date: None,
        unit: None,
        lot_number: None,
        expiration_date: None,
        storage_location: None,
        notes: None,
    }
}
