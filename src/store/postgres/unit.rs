//! [`UnitOfWork`] over one open database transaction.
//!
//! `lock_*` reads use `SELECT ... FOR UPDATE`. The audit chain head lives in the
//! single `audit_head` row, locked the same way, so appends from concurrent units
//! stay linear under every isolation level.

use super::executor::{SqlError, SqlExecutor};
use super::queries;
use super::rows::{
    self, AUDIT_COLUMNS, COUNT_COLUMNS, LOT_COLUMNS, PATIENT_STOCK_COLUMNS,
    PATIENT_STOCK_LOG_COLUMNS, SESSION_COLUMNS, SNAPSHOT_COLUMNS, SNAPSHOT_LINE_COLUMNS,
    TRANSACTION_COLUMNS,
};
use crate::error::LedgerError;
use crate::model::{
    AdjustmentRef, AuditEntry, AuditFilter, Count, CountId, CountSession, CountTarget,
    InventorySnapshot, InventoryTransaction, Lot, LotFilter, LotId, NewAuditEntry, NewCount,
    NewLot, NewPatientStock, NewPatientStockLog, NewSession, NewSnapshot, NewSnapshotLine,
    NewTransaction, OperatorId, PatientStock, PatientStockFilter, PatientStockId, PatientStockLog,
    SessionFilter, SessionId, SnapshotId, SnapshotLine, SnapshotLineId, TransactionFilter,
    TransactionId, VoidRecord,
};
use crate::store::UnitOfWork;
use may_postgres::Row;

fn id_of(operator: Option<OperatorId>) -> Option<i64> {
    operator.map(OperatorId::get)
}

pub struct PgUnit<'a> {
    executor: &'a dyn SqlExecutor,
}

impl<'a> PgUnit<'a> {
    pub fn new(executor: &'a dyn SqlExecutor) -> Self {
        Self { executor }
    }

    fn one<T>(
        &self,
        sql: &str,
        params: &[&dyn may_postgres::types::ToSql],
        decode: fn(&Row) -> Result<T, SqlError>,
    ) -> Result<T, LedgerError> {
        let row = self.executor.query_one(sql, params)?;
        Ok(decode(&row)?)
    }

    fn opt<T>(
        &self,
        sql: &str,
        params: &[&dyn may_postgres::types::ToSql],
        decode: fn(&Row) -> Result<T, SqlError>,
    ) -> Result<Option<T>, LedgerError> {
        match self.executor.query_opt(sql, params)? {
            Some(row) => Ok(Some(decode(&row)?)),
            None => Ok(None),
        }
    }

    fn all<T>(
        &self,
        sql: &str,
        params: &[&dyn may_postgres::types::ToSql],
        decode: fn(&Row) -> Result<T, SqlError>,
    ) -> Result<Vec<T>, LedgerError> {
        let found = self.executor.query_all(sql, params)?;
        Ok(rows::collect(&found, decode)?)
    }

    fn filtered<T>(
        &self,
        (sql, values): (String, sea_query::Values),
        decode: fn(&Row) -> Result<T, SqlError>,
    ) -> Result<Vec<T>, LedgerError> {
        let found = queries::with_params(&values, |params| self.executor.query_all(&sql, params))?;
        Ok(rows::collect(&found, decode)?)
    }

    /// Fails when an update or delete touched no row
    fn expect_row(&self, affected: u64, what: &str) -> Result<(), LedgerError> {
        if affected == 0 {
            return Err(SqlError::Decode(format!("{what}: no row affected")).into());
        }
        Ok(())
    }
}

impl UnitOfWork for PgUnit<'_> {
    fn lot(&mut self, id: LotId) -> Result<Option<Lot>, LedgerError> {
        let sql = format!("SELECT {LOT_COLUMNS} FROM lots WHERE id = $1");
        self.opt(&sql, &[&id.get()], rows::lot)
    }

    fn lock_lot(&mut self, id: LotId) -> Result<Option<Lot>, LedgerError> {
        let sql = format!("SELECT {LOT_COLUMNS} FROM lots WHERE id = $1 FOR UPDATE");
        self.opt(&sql, &[&id.get()], rows::lot)
    }

    fn insert_lot(&mut self, lot: NewLot) -> Result<Lot, LedgerError> {
        let sql = format!(
            "INSERT INTO lots (medication_id, lot_number, expiration_date, quantity_received, \
             current_quantity, unit, source, invoice_number, storage_location, received_by, \
             received_at, is_active) \
             VALUES ($1, $2, $3, $4, $4, $5, $6, $7, $8, $9, $10, TRUE) RETURNING {LOT_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &lot.medication_id.get(),
                &lot.lot_number,
                &lot.expiration_date,
                &lot.quantity_received,
                &lot.unit,
                &lot.source,
                &lot.invoice_number,
                &lot.storage_location,
                &lot.received_by.get(),
                &lot.received_at,
            ],
            rows::lot,
        )
    }

    fn update_lot(&mut self, lot: &Lot) -> Result<(), LedgerError> {
        let quarantine = lot.quarantine.as_ref();
        let affected = self.executor.execute(
            "UPDATE lots SET current_quantity = $2, is_active = $3, storage_location = $4, \
             quarantine_reason = $5, quarantined_by = $6, quarantined_at = $7 WHERE id = $1",
            &[
                &lot.id.get(),
                &lot.current_quantity,
                &lot.is_active,
                &lot.storage_location,
                &quarantine.map(|q| q.reason.clone()),
                &quarantine.map(|q| q.by.get()),
                &quarantine.map(|q| q.at),
            ],
        )?;
        self.expect_row(affected, "update lot")
    }

    fn delete_lot(&mut self, id: LotId) -> Result<(), LedgerError> {
        let affected = self
            .executor
            .execute("DELETE FROM lots WHERE id = $1", &[&id.get()])?;
        self.expect_row(affected, "delete lot")
    }

    fn lots(&mut self, filter: &LotFilter) -> Result<Vec<Lot>, LedgerError> {
        self.filtered(queries::lots(filter), rows::lot)
    }

    fn lot_has_history(&mut self, id: LotId) -> Result<bool, LedgerError> {
        let row = self.executor.query_one(
            "SELECT EXISTS (SELECT 1 FROM inventory_transactions WHERE lot_id = $1) \
             OR EXISTS (SELECT 1 FROM counts WHERE lot_id = $1) \
             OR EXISTS (SELECT 1 FROM snapshot_lines WHERE lot_id = $1) \
             OR EXISTS (SELECT 1 FROM patient_stock WHERE source_lot = $1)",
            &[&id.get()],
        )?;
        Ok(row.try_get::<_, bool>(0).map_err(SqlError::from)?)
    }

    fn insert_transaction(&mut self, tx: NewTransaction) -> Result<InventoryTransaction, LedgerError> {
        let patient = tx.patient.clone().unwrap_or_default();
        let sql = format!(
            "INSERT INTO inventory_transactions (lot_id, medication_id, kind, quantity, \
             balance_before, balance_after, actor, witness, witnessed_at, prescriber, patient_id, \
             patient_name, patient_dob, patient_mrn, prescription_number, reason, notes, \
             destination, reverses, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20) RETURNING {TRANSACTION_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &tx.lot_id.get(),
                &tx.medication_id.get(),
                &tx.kind.as_str(),
                &tx.quantity,
                &tx.balance_before,
                &tx.balance_after,
                &tx.actor.get(),
                &id_of(tx.witness),
                &tx.witnessed_at,
                &id_of(tx.prescriber),
                &patient.patient_id.map(|p| p.get()),
                &patient.name,
                &patient.date_of_birth,
                &patient.mrn,
                &patient.prescription_number,
                &tx.reason,
                &tx.notes,
                &tx.destination,
                &tx.reverses.map(TransactionId::get),
                &tx.occurred_at,
            ],
            rows::transaction,
        )
    }

    fn transaction(&mut self, id: TransactionId) -> Result<Option<InventoryTransaction>, LedgerError> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM inventory_transactions WHERE id = $1");
        self.opt(&sql, &[&id.get()], rows::transaction)
    }

    fn lock_transaction(&mut self, id: TransactionId) -> Result<Option<InventoryTransaction>, LedgerError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM inventory_transactions WHERE id = $1 FOR UPDATE"
        );
        self.opt(&sql, &[&id.get()], rows::transaction)
    }

    fn record_void(&mut self, id: TransactionId, void: &VoidRecord) -> Result<(), LedgerError> {
        let affected = self.executor.execute(
            "UPDATE inventory_transactions SET voided_by = $2, voided_at = $3, void_reason = $4, \
             reversal_id = $5 WHERE id = $1 AND voided_by IS NULL",
            &[
                &id.get(),
                &void.voided_by.get(),
                &void.voided_at,
                &void.reason,
                &void.reversal_id.get(),
            ],
        )?;
        self.expect_row(affected, "record void")
    }

    fn transactions(&mut self, filter: &TransactionFilter) -> Result<Vec<InventoryTransaction>, LedgerError> {
        self.filtered(queries::transactions(filter), rows::transaction)
    }

    fn patient_stock(&mut self, id: PatientStockId) -> Result<Option<PatientStock>, LedgerError> {
        let sql = format!("SELECT {PATIENT_STOCK_COLUMNS} FROM patient_stock WHERE id = $1");
        self.opt(&sql, &[&id.get()], rows::patient_stock)
    }

    fn lock_patient_stock(&mut self, id: PatientStockId) -> Result<Option<PatientStock>, LedgerError> {
        let sql = format!("SELECT {PATIENT_STOCK_COLUMNS} FROM patient_stock WHERE id = $1 FOR UPDATE");
        self.opt(&sql, &[&id.get()], rows::patient_stock)
    }

    fn insert_patient_stock(&mut self, stock: NewPatientStock) -> Result<PatientStock, LedgerError> {
        let sql = format!(
            "INSERT INTO patient_stock (patient_id, patient_name, patient_dob, patient_mrn, \
             prescription_number, medication_id, source_lot, preparation_date, prepared_by, \
             prescriber, lot_number, expiration_date, quantity_prepared, quantity_remaining, unit, \
             status, storage_location, notes, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13, $14, 'active', \
             $15, $16, $17) RETURNING {PATIENT_STOCK_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &stock.patient.patient_id.map(|p| p.get()),
                &stock.patient.name,
                &stock.patient.date_of_birth,
                &stock.patient.mrn,
                &stock.patient.prescription_number,
                &stock.medication_id.get(),
                &stock.source_lot.map(LotId::get),
                &stock.preparation_date,
                &stock.prepared_by.get(),
                &stock.prescriber.get(),
                &stock.lot_number,
                &stock.expiration_date,
                &stock.quantity_prepared,
                &stock.unit,
                &stock.storage_location,
                &stock.notes,
                &stock.created_at,
            ],
            rows::patient_stock,
        )
    }

    fn update_patient_stock(&mut self, stock: &PatientStock) -> Result<(), LedgerError> {
        let affected = self.executor.execute(
            "UPDATE patient_stock SET quantity_prepared = $2, quantity_remaining = $3, status = $4, \
             storage_location = $5, notes = $6 WHERE id = $1",
            &[
                &stock.id.get(),
                &stock.quantity_prepared,
                &stock.quantity_remaining,
                &stock.status.as_str(),
                &stock.storage_location,
                &stock.notes,
            ],
        )?;
        self.expect_row(affected, "update patient stock")
    }

    fn patient_stocks(&mut self, filter: &PatientStockFilter) -> Result<Vec<PatientStock>, LedgerError> {
        self.filtered(queries::patient_stocks(filter), rows::patient_stock)
    }

    fn insert_patient_stock_log(&mut self, log: NewPatientStockLog) -> Result<PatientStockLog, LedgerError> {
        let sql = format!(
            "INSERT INTO patient_stock_logs (stock_id, kind, quantity, quantity_before, \
             quantity_after, actor, witness, reason, notes, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {PATIENT_STOCK_LOG_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &log.stock_id.get(),
                &log.kind.as_str(),
                &log.quantity,
                &log.quantity_before,
                &log.quantity_after,
                &log.actor.get(),
                &id_of(log.witness),
                &log.reason,
                &log.notes,
                &log.occurred_at,
            ],
            rows::patient_stock_log,
        )
    }

    fn patient_stock_logs(&mut self, id: PatientStockId) -> Result<Vec<PatientStockLog>, LedgerError> {
        let sql = format!(
            "SELECT {PATIENT_STOCK_LOG_COLUMNS} FROM patient_stock_logs WHERE stock_id = $1 ORDER BY id"
        );
        self.all(&sql, &[&id.get()], rows::patient_stock_log)
    }

    fn insert_session(&mut self, session: NewSession) -> Result<CountSession, LedgerError> {
        let sql = format!(
            "INSERT INTO count_sessions (kind, session_date, status, started_by, started_at, notes) \
             VALUES ($1, $2, 'in_progress', $3, $4, $5) RETURNING {SESSION_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &session.kind.as_str(),
                &session.session_date,
                &session.started_by.get(),
                &session.started_at,
                &session.notes,
            ],
            rows::session,
        )
    }

    fn session(&mut self, id: SessionId) -> Result<Option<CountSession>, LedgerError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM count_sessions WHERE id = $1");
        self.opt(&sql, &[&id.get()], rows::session)
    }

    fn lock_session(&mut self, id: SessionId) -> Result<Option<CountSession>, LedgerError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM count_sessions WHERE id = $1 FOR UPDATE");
        self.opt(&sql, &[&id.get()], rows::session)
    }

    fn update_session(&mut self, session: &CountSession) -> Result<(), LedgerError> {
        let affected = self.executor.execute(
            "UPDATE count_sessions SET status = $2, completed_by = $3, completed_at = $4, \
             reviewed_by = $5, reviewed_at = $6, notes = $7 WHERE id = $1",
            &[
                &session.id.get(),
                &session.status.as_str(),
                &id_of(session.completed_by),
                &session.completed_at,
                &id_of(session.reviewed_by),
                &session.reviewed_at,
                &session.notes,
            ],
        )?;
        self.expect_row(affected, "update count session")
    }

    fn delete_session(&mut self, id: SessionId) -> Result<(), LedgerError> {
        let affected = self
            .executor
            .execute("DELETE FROM count_sessions WHERE id = $1", &[&id.get()])?;
        self.expect_row(affected, "delete count session")
    }

    fn sessions(&mut self, filter: &SessionFilter) -> Result<Vec<CountSession>, LedgerError> {
        self.filtered(queries::sessions(filter), rows::session)
    }

    fn insert_count(&mut self, count: NewCount) -> Result<Count, LedgerError> {
        let (lot_id, stock_id) = match count.target {
            CountTarget::Lot(lot) => (Some(lot.get()), None),
            CountTarget::PatientStock(stock) => (None, Some(stock.get())),
        };
        let sql = format!(
            "INSERT INTO counts (session_id, lot_id, patient_stock_id, medication_id, expected_quantity) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {COUNT_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &count.session_id.get(),
                &lot_id,
                &stock_id,
                &count.medication_id.get(),
                &count.expected_quantity,
            ],
            rows::count,
        )
    }

    fn count(&mut self, id: CountId) -> Result<Option<Count>, LedgerError> {
        let sql = format!("SELECT {COUNT_COLUMNS} FROM counts WHERE id = $1");
        self.opt(&sql, &[&id.get()], rows::count)
    }

    fn lock_count(&mut self, id: CountId) -> Result<Option<Count>, LedgerError> {
        let sql = format!("SELECT {COUNT_COLUMNS} FROM counts WHERE id = $1 FOR UPDATE");
        self.opt(&sql, &[&id.get()], rows::count)
    }

    fn update_count(&mut self, count: &Count) -> Result<(), LedgerError> {
        let resolution = count.resolution.as_ref();
        let (adjustment_tx, adjustment_log) = match resolution.and_then(|r| r.adjustment) {
            Some(AdjustmentRef::Transaction(tx)) => (Some(tx.get()), None),
            Some(AdjustmentRef::PatientStockLog(log)) => (None, Some(log.get())),
            None => (None, None),
        };
        let affected = self.executor.execute(
            "UPDATE counts SET actual_quantity = $2, counted_by = $3, counted_at = $4, \
             verified_by = $5, verified_at = $6, notes = $7, resolution_type = $8, \
             resolution_notes = $9, resolved_by = $10, resolved_at = $11, \
             adjustment_transaction_id = $12, adjustment_log_id = $13 WHERE id = $1",
            &[
                &count.id.get(),
                &count.actual_quantity,
                &id_of(count.counted_by),
                &count.counted_at,
                &id_of(count.verified_by),
                &count.verified_at,
                &count.notes,
                &resolution.map(|r| r.resolution_type.clone()),
                &resolution.and_then(|r| r.notes.clone()),
                &resolution.map(|r| r.resolved_by.get()),
                &resolution.map(|r| r.resolved_at),
                &adjustment_tx,
                &adjustment_log,
            ],
        )?;
        self.expect_row(affected, "update count")
    }

    fn session_counts(&mut self, id: SessionId) -> Result<Vec<Count>, LedgerError> {
        let sql = format!("SELECT {COUNT_COLUMNS} FROM counts WHERE session_id = $1 ORDER BY id");
        self.all(&sql, &[&id.get()], rows::count)
    }

    fn insert_snapshot(&mut self, snapshot: NewSnapshot) -> Result<InventorySnapshot, LedgerError> {
        let sql = format!(
            "INSERT INTO inventory_snapshots (inventory_date, timing, dea_registration, \
             state_registration, conducted_by, created_at, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {SNAPSHOT_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &snapshot.inventory_date,
                &snapshot.timing.as_str(),
                &snapshot.dea_registration,
                &snapshot.state_registration,
                &snapshot.conducted_by.get(),
                &snapshot.created_at,
                &snapshot.notes,
            ],
            rows::snapshot,
        )
    }

    fn snapshot(&mut self, id: SnapshotId) -> Result<Option<InventorySnapshot>, LedgerError> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM inventory_snapshots WHERE id = $1");
        self.opt(&sql, &[&id.get()], rows::snapshot)
    }

    fn lock_snapshot(&mut self, id: SnapshotId) -> Result<Option<InventorySnapshot>, LedgerError> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM inventory_snapshots WHERE id = $1 FOR UPDATE");
        self.opt(&sql, &[&id.get()], rows::snapshot)
    }

    fn update_snapshot(&mut self, snapshot: &InventorySnapshot) -> Result<(), LedgerError> {
        let affected = self.executor.execute(
            "UPDATE inventory_snapshots SET witnessed_by = $2, completed_at = $3, notes = $4 \
             WHERE id = $1",
            &[
                &snapshot.id.get(),
                &id_of(snapshot.witnessed_by),
                &snapshot.completed_at,
                &snapshot.notes,
            ],
        )?;
        self.expect_row(affected, "update snapshot")
    }

    fn snapshots(&mut self) -> Result<Vec<InventorySnapshot>, LedgerError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM inventory_snapshots ORDER BY inventory_date DESC, id DESC"
        );
        self.all(&sql, &[], rows::snapshot)
    }

    fn insert_snapshot_line(&mut self, line: NewSnapshotLine) -> Result<SnapshotLine, LedgerError> {
        let sql = format!(
            "INSERT INTO snapshot_lines (snapshot_id, medication_id, lot_id, drug_name, schedule, \
             ndc, form, strength, lot_number, expiration_date, container_opened, quantity_counted, \
             unit, method) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             RETURNING {SNAPSHOT_LINE_COLUMNS}"
        );
        self.one(
            &sql,
            &[
                &line.snapshot_id.get(),
                &line.medication_id.get(),
                &line.lot_id.map(LotId::get),
                &line.drug_name,
                &line.schedule.as_str(),
                &line.ndc,
                &line.form,
                &line.strength,
                &line.lot_number,
                &line.expiration_date,
                &line.container_opened,
                &line.quantity_counted,
                &line.unit,
                &line.method.as_str(),
            ],
            rows::snapshot_line,
        )
    }

    fn snapshot_line(&mut self, id: SnapshotLineId) -> Result<Option<SnapshotLine>, LedgerError> {
        let sql = format!("SELECT {SNAPSHOT_LINE_COLUMNS} FROM snapshot_lines WHERE id = $1");
        self.opt(&sql, &[&id.get()], rows::snapshot_line)
    }

    fn update_snapshot_line(&mut self, line: &SnapshotLine) -> Result<(), LedgerError> {
        let affected = self.executor.execute(
            "UPDATE snapshot_lines SET container_opened = $2, quantity_counted = $3, method = $4 \
             WHERE id = $1",
            &[
                &line.id.get(),
                &line.container_opened,
                &line.quantity_counted,
                &line.method.as_str(),
            ],
        )?;
        self.expect_row(affected, "update snapshot line")
    }

    fn snapshot_lines(&mut self, id: SnapshotId) -> Result<Vec<SnapshotLine>, LedgerError> {
        let sql = format!(
            "SELECT {SNAPSHOT_LINE_COLUMNS} FROM snapshot_lines WHERE snapshot_id = $1 ORDER BY id"
        );
        self.all(&sql, &[&id.get()], rows::snapshot_line)
    }

    fn last_audit_hash(&mut self) -> Result<Option<String>, LedgerError> {
        let row = self
            .executor
            .query_opt("SELECT hash FROM audit_head WHERE id = 1 FOR UPDATE", &[])?;
        match row {
            Some(row) => Ok(row.try_get::<_, Option<String>>(0).map_err(SqlError::from)?),
            None => Err(SqlError::Decode("audit_head row is missing".to_string()).into()),
        }
    }

    fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditEntry, LedgerError> {
        let sql = format!(
            "INSERT INTO audit_log (unit_id, occurred_at, actor, action, entity_type, entity_id, \
             detail, previous_hash, hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {AUDIT_COLUMNS}"
        );
        let affected = self.executor.execute(
            "UPDATE audit_head SET hash = $1 WHERE id = 1",
            &[&entry.hash],
        )?;
        self.expect_row(affected, "audit head")?;
        self.one(
            &sql,
            &[
                &entry.unit_id,
                &entry.occurred_at,
                &entry.actor.get(),
                &entry.action,
                &entry.entity_type,
                &entry.entity_id,
                &entry.detail,
                &entry.previous_hash,
                &entry.hash,
            ],
            rows::audit_entry,
        )
    }

    fn audit_entries(&mut self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, LedgerError> {
        self.filtered(queries::audit_entries(filter), rows::audit_entry)
    }
}
