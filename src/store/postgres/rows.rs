//! Row decoding.
//!
//! Enum columns are stored as their `as_str` text; an unrecognized value is a decode
//! error rather than a silent default.

use super::executor::SqlError;
use crate::model::{
    AdjustmentRef, AuditEntry, AuditId, Count, CountId, CountMethod, CountSession, CountTarget,
    InventorySnapshot, InventoryTiming, InventoryTransaction, Lot, LotId, MedicationId, OperatorId,
    PatientId, PatientLink, PatientStock, PatientStockId, PatientStockLog, PatientStockLogId,
    PatientStockLogKind, PatientStockStatus, Quarantine, Resolution, Schedule, SessionId,
    SessionKind, SessionStatus, SnapshotId, SnapshotLine, SnapshotLineId, TransactionId,
    TransactionKind, VoidRecord,
};
use chrono::NaiveDate;
use may_postgres::types::FromSql;
use may_postgres::Row;

pub const LOT_COLUMNS: &str = "id, medication_id, lot_number, expiration_date, quantity_received, \
     current_quantity, unit, source, invoice_number, storage_location, received_by, received_at, \
     is_active, quarantine_reason, quarantined_by, quarantined_at";

pub const TRANSACTION_COLUMNS: &str = "id, lot_id, medication_id, kind, quantity, balance_before, \
     balance_after, actor, witness, witnessed_at, prescriber, patient_id, patient_name, patient_dob, \
     patient_mrn, prescription_number, reason, notes, destination, reverses, occurred_at, voided_by, \
     voided_at, void_reason, reversal_id";

pub const PATIENT_STOCK_COLUMNS: &str = "id, patient_id, patient_name, patient_dob, patient_mrn, \
     prescription_number, medication_id, source_lot, preparation_date, prepared_by, prescriber, \
     lot_number, expiration_date, quantity_prepared, quantity_remaining, unit, status, \
     storage_location, notes, created_at";

pub const PATIENT_STOCK_LOG_COLUMNS: &str = "id, stock_id, kind, quantity, quantity_before, \
     quantity_after, actor, witness, reason, notes, occurred_at";

pub const SESSION_COLUMNS: &str = "id, kind, session_date, status, started_by, started_at, \
     completed_by, completed_at, reviewed_by, reviewed_at, notes";

pub const COUNT_COLUMNS: &str = "id, session_id, lot_id, patient_stock_id, medication_id, \
     expected_quantity, actual_quantity, counted_by, counted_at, verified_by, verified_at, notes, \
     resolution_type, resolution_notes, resolved_by, resolved_at, adjustment_transaction_id, \
     adjustment_log_id";

pub const SNAPSHOT_COLUMNS: &str = "id, inventory_date, timing, dea_registration, \
     state_registration, conducted_by, witnessed_by, created_at, completed_at, notes";

pub const SNAPSHOT_LINE_COLUMNS: &str = "id, snapshot_id, medication_id, lot_id, drug_name, \
     schedule, ndc, form, strength, lot_number, expiration_date, container_opened, \
     quantity_counted, unit, method";

pub const AUDIT_COLUMNS: &str = "id, unit_id, occurred_at, actor, action, entity_type, entity_id, \
     detail, previous_hash, hash";

fn get<'a, T: FromSql<'a>>(row: &'a Row, column: &str) -> Result<T, SqlError> {
    row.try_get(column)
        .map_err(|e| SqlError::Decode(format!("column {column}: {e}")))
}

fn text_enum<T>(row: &Row, column: &str, parse: fn(&str) -> Option<T>) -> Result<T, SqlError> {
    let raw: String = get(row, column)?;
    parse(&raw).ok_or_else(|| SqlError::Decode(format!("column {column}: unknown value {raw:?}")))
}

fn operator(row: &Row, column: &str) -> Result<OperatorId, SqlError> {
    get::<i64>(row, column).map(OperatorId)
}

fn opt_operator(row: &Row, column: &str) -> Result<Option<OperatorId>, SqlError> {
    Ok(get::<Option<i64>>(row, column)?.map(OperatorId))
}

fn patient_link(row: &Row) -> Result<PatientLink, SqlError> {
    Ok(PatientLink {
        patient_id: get::<Option<i64>>(row, "patient_id")?.map(PatientId),
        name: get(row, "patient_name")?,
        date_of_birth: get::<Option<NaiveDate>>(row, "patient_dob")?,
        mrn: get(row, "patient_mrn")?,
        prescription_number: get(row, "prescription_number")?,
    })
}

pub fn lot(row: &Row) -> Result<Lot, SqlError> {
    let quarantine = match get::<Option<String>>(row, "quarantine_reason")? {
        Some(reason) => Some(Quarantine {
            reason,
            by: operator(row, "quarantined_by")?,
            at: get(row, "quarantined_at")?,
        }),
        None => None,
    };
    Ok(Lot {
        id: LotId(get(row, "id")?),
        medication_id: MedicationId(get(row, "medication_id")?),
        lot_number: get(row, "lot_number")?,
        expiration_date: get(row, "expiration_date")?,
        quantity_received: get(row, "quantity_received")?,
        current_quantity: get(row, "current_quantity")?,
        unit: get(row, "unit")?,
        source: get(row, "source")?,
        invoice_number: get(row, "invoice_number")?,
        storage_location: get(row, "storage_location")?,
        received_by: operator(row, "received_by")?,
        received_at: get(row, "received_at")?,
        is_active: get(row, "is_active")?,
        quarantine,
    })
}

pub fn transaction(row: &Row) -> Result<InventoryTransaction, SqlError> {
    let patient = patient_link(row)?;
    let void = match get::<Option<i64>>(row, "voided_by")? {
        Some(voided_by) => Some(VoidRecord {
            voided_by: OperatorId(voided_by),
            voided_at: get(row, "voided_at")?,
            reason: get(row, "void_reason")?,
            reversal_id: TransactionId(get(row, "reversal_id")?),
        }),
        None => None,
    };
    Ok(InventoryTransaction {
        id: TransactionId(get(row, "id")?),
        lot_id: LotId(get(row, "lot_id")?),
        medication_id: MedicationId(get(row, "medication_id")?),
        kind: text_enum(row, "kind", TransactionKind::parse)?,
        quantity: get(row, "quantity")?,
        balance_before: get(row, "balance_before")?,
        balance_after: get(row, "balance_after")?,
        actor: operator(row, "actor")?,
        witness: opt_operator(row, "witness")?,
        witnessed_at: get(row, "witnessed_at")?,
        prescriber: opt_operator(row, "prescriber")?,
        patient: (!patient.is_empty()).then_some(patient),
        reason: get(row, "reason")?,
        notes: get(row, "notes")?,
        destination: get(row, "destination")?,
        reverses: get::<Option<i64>>(row, "reverses")?.map(TransactionId),
        occurred_at: get(row, "occurred_at")?,
        void,
    })
}

pub fn patient_stock(row: &Row) -> Result<PatientStock, SqlError> {
    Ok(PatientStock {
        id: PatientStockId(get(row, "id")?),
        patient: patient_link(row)?,
        medication_id: MedicationId(get(row, "medication_id")?),
        source_lot: get::<Option<i64>>(row, "source_lot")?.map(LotId),
        preparation_date: get(row, "preparation_date")?,
        prepared_by: operator(row, "prepared_by")?,
        prescriber: operator(row, "prescriber")?,
        lot_number: get(row, "lot_number")?,
        expiration_date: get(row, "expiration_date")?,
        quantity_prepared: get(row, "quantity_prepared")?,
        quantity_remaining: get(row, "quantity_remaining")?,
        unit: get(row, "unit")?,
        status: text_enum(row, "status", PatientStockStatus::parse)?,
        storage_location: get(row, "storage_location")?,
        notes: get(row, "notes")?,
        created_at: get(row, "created_at")?,
    })
}

pub fn patient_stock_log(row: &Row) -> Result<PatientStockLog, SqlError> {
    Ok(PatientStockLog {
        id: PatientStockLogId(get(row, "id")?),
        stock_id: PatientStockId(get(row, "stock_id")?),
        kind: text_enum(row, "kind", PatientStockLogKind::parse)?,
        quantity: get(row, "quantity")?,
        quantity_before: get(row, "quantity_before")?,
        quantity_after: get(row, "quantity_after")?,
        actor: operator(row, "actor")?,
        witness: opt_operator(row, "witness")?,
        reason: get(row, "reason")?,
        notes: get(row, "notes")?,
        occurred_at: get(row, "occurred_at")?,
    })
}

pub fn session(row: &Row) -> Result<CountSession, SqlError> {
    Ok(CountSession {
        id: SessionId(get(row, "id")?),
        kind: text_enum(row, "kind", SessionKind::parse)?,
        session_date: get(row, "session_date")?,
        status: text_enum(row, "status", SessionStatus::parse)?,
        started_by: operator(row, "started_by")?,
        started_at: get(row, "started_at")?,
        completed_by: opt_operator(row, "completed_by")?,
        completed_at: get(row, "completed_at")?,
        reviewed_by: opt_operator(row, "reviewed_by")?,
        reviewed_at: get(row, "reviewed_at")?,
        notes: get(row, "notes")?,
    })
}

pub fn count(row: &Row) -> Result<Count, SqlError> {
    let target = match (
        get::<Option<i64>>(row, "lot_id")?,
        get::<Option<i64>>(row, "patient_stock_id")?,
    ) {
        (Some(lot), None) => CountTarget::Lot(LotId(lot)),
        (None, Some(stock)) => CountTarget::PatientStock(PatientStockId(stock)),
        _ => {
            return Err(SqlError::Decode(
                "count must reference exactly one of lot_id, patient_stock_id".to_string(),
            ))
        }
    };
    let adjustment = match (
        get::<Option<i64>>(row, "adjustment_transaction_id")?,
        get::<Option<i64>>(row, "adjustment_log_id")?,
    ) {
        (Some(tx), _) => Some(AdjustmentRef::Transaction(TransactionId(tx))),
        (None, Some(log)) => Some(AdjustmentRef::PatientStockLog(PatientStockLogId(log))),
        (None, None) => None,
    };
    let resolution = match get::<Option<i64>>(row, "resolved_by")? {
        Some(resolved_by) => Some(Resolution {
            resolution_type: get(row, "resolution_type")?,
            notes: get(row, "resolution_notes")?,
            resolved_by: OperatorId(resolved_by),
            resolved_at: get(row, "resolved_at")?,
            adjustment,
        }),
        None => None,
    };
    Ok(Count {
        id: CountId(get(row, "id")?),
        session_id: SessionId(get(row, "session_id")?),
        target,
        medication_id: MedicationId(get(row, "medication_id")?),
        expected_quantity: get(row, "expected_quantity")?,
        actual_quantity: get(row, "actual_quantity")?,
        counted_by: opt_operator(row, "counted_by")?,
        counted_at: get(row, "counted_at")?,
        verified_by: opt_operator(row, "verified_by")?,
        verified_at: get(row, "verified_at")?,
        notes: get(row, "notes")?,
        resolution,
    })
}

pub fn snapshot(row: &Row) -> Result<InventorySnapshot, SqlError> {
    Ok(InventorySnapshot {
        id: SnapshotId(get(row, "id")?),
        inventory_date: get(row, "inventory_date")?,
        timing: text_enum(row, "timing", InventoryTiming::parse)?,
        dea_registration: get(row, "dea_registration")?,
        state_registration: get(row, "state_registration")?,
        conducted_by: operator(row, "conducted_by")?,
        witnessed_by: opt_operator(row, "witnessed_by")?,
        created_at: get(row, "created_at")?,
        completed_at: get(row, "completed_at")?,
        notes: get(row, "notes")?,
    })
}

pub fn snapshot_line(row: &Row) -> Result<SnapshotLine, SqlError> {
    Ok(SnapshotLine {
        id: SnapshotLineId(get(row, "id")?),
        snapshot_id: SnapshotId(get(row, "snapshot_id")?),
        medication_id: MedicationId(get(row, "medication_id")?),
        lot_id: get::<Option<i64>>(row, "lot_id")?.map(LotId),
        drug_name: get(row, "drug_name")?,
        schedule: text_enum(row, "schedule", Schedule::parse)?,
        ndc: get(row, "ndc")?,
        form: get(row, "form")?,
        strength: get(row, "strength")?,
        lot_number: get(row, "lot_number")?,
        expiration_date: get(row, "expiration_date")?,
        container_opened: get(row, "container_opened")?,
        quantity_counted: get(row, "quantity_counted")?,
        unit: get(row, "unit")?,
        method: text_enum(row, "method", CountMethod::parse)?,
    })
}

pub fn audit_entry(row: &Row) -> Result<AuditEntry, SqlError> {
    Ok(AuditEntry {
        id: AuditId(get(row, "id")?),
        unit_id: get(row, "unit_id")?,
        occurred_at: get(row, "occurred_at")?,
        actor: operator(row, "actor")?,
        action: get(row, "action")?,
        entity_type: get(row, "entity_type")?,
        entity_id: get(row, "entity_id")?,
        detail: get(row, "detail")?,
        previous_hash: get(row, "previous_hash")?,
        hash: get(row, "hash")?,
    })
}

pub fn collect<T>(rows: &[Row], decode: fn(&Row) -> Result<T, SqlError>) -> Result<Vec<T>, SqlError> {
    rows.iter().map(decode).collect()
}
