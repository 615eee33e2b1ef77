//! In-process store.
//!
//! All tables live behind one `may` mutex. A unit works on a private copy of the tables
//! and swaps it in only when the closure succeeds, so an error leaves no trace and no
//! reader ever sees a half-applied unit.

use super::{LedgerStore, UnitOfWork};
use crate::error::{EntityKind, LedgerError, StorageError};
use crate::model::{
    AuditEntry, AuditFilter, AuditId, Count, CountId, CountSession, CountTarget, InventorySnapshot,
    InventoryTransaction, Lot, LotFilter, LotId, NewAuditEntry, NewCount, NewLot, NewPatientStock,
    NewPatientStockLog, NewSession, NewSnapshot, NewSnapshotLine, NewTransaction, PatientStock,
    PatientStockFilter, PatientStockId, PatientStockLog, PatientStockLogId, SessionFilter,
    SessionId, SnapshotId, SnapshotLine, SnapshotLineId, TransactionFilter, TransactionId,
    VoidRecord,
};
use may::sync::Mutex;
use std::collections::BTreeMap;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    lots: BTreeMap<LotId, Lot>,
    transactions: BTreeMap<TransactionId, InventoryTransaction>,
    patient_stock: BTreeMap<PatientStockId, PatientStock>,
    patient_stock_logs: BTreeMap<PatientStockLogId, PatientStockLog>,
    sessions: BTreeMap<SessionId, CountSession>,
    counts: BTreeMap<CountId, Count>,
    snapshots: BTreeMap<SnapshotId, InventorySnapshot>,
    snapshot_lines: BTreeMap<SnapshotLineId, SnapshotLine>,
    audit: BTreeMap<AuditId, AuditEntry>,
}

impl Tables {
    /// Ids are unique across all tables
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for MemoryStore {
    fn atomically<T, F>(&self, mut work: F) -> Result<T, LedgerError>
    where
        F: FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::store_unit_span("memory").entered();

        let mut tables = self.tables.lock().map_err(|_| StorageError::Poisoned)?;
        let mut draft = tables.clone();
        let result = work(&mut MemoryUnit { tables: &mut draft });
        if result.is_ok() {
            *tables = draft;
        }
        result
    }
}

struct MemoryUnit<'a> {
    tables: &'a mut Tables,
}

fn missing(entity: EntityKind, id: impl Into<i64>) -> LedgerError {
    LedgerError::not_found(entity, id)
}

impl UnitOfWork for MemoryUnit<'_> {
    fn lot(&mut self, id: LotId) -> Result<Option<Lot>, LedgerError> {
        Ok(self.tables.lots.get(&id).cloned())
    }

    fn lock_lot(&mut self, id: LotId) -> Result<Option<Lot>, LedgerError> {
        self.lot(id)
    }

    fn insert_lot(&mut self, lot: NewLot) -> Result<Lot, LedgerError> {
        let lot = lot.into_lot(LotId(self.tables.allocate()));
        self.tables.lots.insert(lot.id, lot.clone());
        Ok(lot)
    }

    fn update_lot(&mut self, lot: &Lot) -> Result<(), LedgerError> {
        match self.tables.lots.get_mut(&lot.id) {
            Some(row) => {
                *row = lot.clone();
                Ok(())
            }
            None => Err(missing(EntityKind::Lot, lot.id)),
        }
    }

    fn delete_lot(&mut self, id: LotId) -> Result<(), LedgerError> {
        self.tables
            .lots
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing(EntityKind::Lot, id))
    }

    fn lots(&mut self, filter: &LotFilter) -> Result<Vec<Lot>, LedgerError> {
        Ok(self
            .tables
            .lots
            .values()
            .filter(|lot| filter.matches(lot))
            .cloned()
            .collect())
    }

    fn lot_has_history(&mut self, id: LotId) -> Result<bool, LedgerError> {
        let tables = &*self.tables;
        Ok(tables.transactions.values().any(|tx| tx.lot_id == id)
            || tables.counts.values().any(|c| c.target == CountTarget::Lot(id))
            || tables.snapshot_lines.values().any(|l| l.lot_id == Some(id))
            || tables.patient_stock.values().any(|s| s.source_lot == Some(id)))
    }

    fn insert_transaction(&mut self, tx: NewTransaction) -> Result<InventoryTransaction, LedgerError> {
        let tx = tx.into_transaction(TransactionId(self.tables.allocate()));
        self.tables.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    fn transaction(&mut self, id: TransactionId) -> Result<Option<InventoryTransaction>, LedgerError> {
        Ok(self.tables.transactions.get(&id).cloned())
    }

    fn lock_transaction(&mut self, id: TransactionId) -> Result<Option<InventoryTransaction>, LedgerError> {
        self.transaction(id)
    }

    fn record_void(&mut self, id: TransactionId, void: &VoidRecord) -> Result<(), LedgerError> {
        match self.tables.transactions.get_mut(&id) {
            Some(tx) => {
                tx.void = Some(void.clone());
                Ok(())
            }
            None => Err(missing(EntityKind::Transaction, id)),
        }
    }

    fn transactions(&mut self, filter: &TransactionFilter) -> Result<Vec<InventoryTransaction>, LedgerError> {
        Ok(self
            .tables
            .transactions
            .values()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect())
    }

    fn patient_stock(&mut self, id: PatientStockId) -> Result<Option<PatientStock>, LedgerError> {
        Ok(self.tables.patient_stock.get(&id).cloned())
    }

    fn lock_patient_stock(&mut self, id: PatientStockId) -> Result<Option<PatientStock>, LedgerError> {
        self.patient_stock(id)
    }

    fn insert_patient_stock(&mut self, stock: NewPatientStock) -> Result<PatientStock, LedgerError> {
        let stock = stock.into_stock(PatientStockId(self.tables.allocate()));
        self.tables.patient_stock.insert(stock.id, stock.clone());
        Ok(stock)
    }

    fn update_patient_stock(&mut self, stock: &PatientStock) -> Result<(), LedgerError> {
        match self.tables.patient_stock.get_mut(&stock.id) {
            Some(row) => {
                *row = stock.clone();
                Ok(())
            }
            None => Err(missing(EntityKind::PatientStock, stock.id)),
        }
    }

    fn patient_stocks(&mut self, filter: &PatientStockFilter) -> Result<Vec<PatientStock>, LedgerError> {
        Ok(self
            .tables
            .patient_stock
            .values()
            .filter(|stock| filter.matches(stock))
            .cloned()
            .collect())
    }

    fn insert_patient_stock_log(&mut self, log: NewPatientStockLog) -> Result<PatientStockLog, LedgerError> {
        let log = log.into_log(PatientStockLogId(self.tables.allocate()));
        self.tables.patient_stock_logs.insert(log.id, log.clone());
        Ok(log)
    }

    fn patient_stock_logs(&mut self, id: PatientStockId) -> Result<Vec<PatientStockLog>, LedgerError> {
        Ok(self
            .tables
            .patient_stock_logs
            .values()
            .filter(|log| log.stock_id == id)
            .cloned()
            .collect())
    }

    fn insert_session(&mut self, session: NewSession) -> Result<CountSession, LedgerError> {
        let session = session.into_session(SessionId(self.tables.allocate()));
        self.tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    fn session(&mut self, id: SessionId) -> Result<Option<CountSession>, LedgerError> {
        Ok(self.tables.sessions.get(&id).cloned())
    }

    fn lock_session(&mut self, id: SessionId) -> Result<Option<CountSession>, LedgerError> {
        self.session(id)
    }

    fn update_session(&mut self, session: &CountSession) -> Result<(), LedgerError> {
        match self.tables.sessions.get_mut(&session.id) {
            Some(row) => {
                *row = session.clone();
                Ok(())
            }
            None => Err(missing(EntityKind::Session, session.id)),
        }
    }

    fn delete_session(&mut self, id: SessionId) -> Result<(), LedgerError> {
        if self.tables.sessions.remove(&id).is_none() {
            return Err(missing(EntityKind::Session, id));
        }
        self.tables.counts.retain(|_, count| count.session_id != id);
        Ok(())
    }

    fn sessions(&mut self, filter: &SessionFilter) -> Result<Vec<CountSession>, LedgerError> {
        let mut sessions: Vec<CountSession> = self
            .tables
            .sessions
            .values()
            .filter(|session| filter.matches(session))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.session_date.cmp(&a.session_date).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    fn insert_count(&mut self, count: NewCount) -> Result<Count, LedgerError> {
        let count = count.into_count(CountId(self.tables.allocate()));
        self.tables.counts.insert(count.id, count.clone());
        Ok(count)
    }

    fn count(&mut self, id: CountId) -> Result<Option<Count>, LedgerError> {
        Ok(self.tables.counts.get(&id).cloned())
    }

    fn lock_count(&mut self, id: CountId) -> Result<Option<Count>, LedgerError> {
        self.count(id)
    }

    fn update_count(&mut self, count: &Count) -> Result<(), LedgerError> {
        match self.tables.counts.get_mut(&count.id) {
            Some(row) => {
                *row = count.clone();
                Ok(())
            }
            None => Err(missing(EntityKind::Count, count.id)),
        }
    }

    fn session_counts(&mut self, id: SessionId) -> Result<Vec<Count>, LedgerError> {
        Ok(self
            .tables
            .counts
            .values()
            .filter(|count| count.session_id == id)
            .cloned()
            .collect())
    }

    fn insert_snapshot(&mut self, snapshot: NewSnapshot) -> Result<InventorySnapshot, LedgerError> {
        let snapshot = snapshot.into_snapshot(SnapshotId(self.tables.allocate()));
        self.tables.snapshots.insert(snapshot.id, snapshot.clone());
        Ok(snapshot)
    }

    fn snapshot(&mut self, id: SnapshotId) -> Result<Option<InventorySnapshot>, LedgerError> {
        Ok(self.tables.snapshots.get(&id).cloned())
    }

    fn lock_snapshot(&mut self, id: SnapshotId) -> Result<Option<InventorySnapshot>, LedgerError> {
        self.snapshot(id)
    }

    fn update_snapshot(&mut self, snapshot: &InventorySnapshot) -> Result<(), LedgerError> {
        match self.tables.snapshots.get_mut(&snapshot.id) {
            Some(row) => {
                *row = snapshot.clone();
                Ok(())
            }
            None => Err(missing(EntityKind::Snapshot, snapshot.id)),
        }
    }

    fn snapshots(&mut self) -> Result<Vec<InventorySnapshot>, LedgerError> {
        let mut snapshots: Vec<InventorySnapshot> = self.tables.snapshots.values().cloned().collect();
        snapshots.sort_by(|a, b| b.inventory_date.cmp(&a.inventory_date).then(b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    fn insert_snapshot_line(&mut self, line: NewSnapshotLine) -> Result<SnapshotLine, LedgerError> {
        let line = line.into_line(SnapshotLineId(self.tables.allocate()));
        self.tables.snapshot_lines.insert(line.id, line.clone());
        Ok(line)
    }

    fn snapshot_line(&mut self, id: SnapshotLineId) -> Result<Option<SnapshotLine>, LedgerError> {
        Ok(self.tables.snapshot_lines.get(&id).cloned())
    }

    fn update_snapshot_line(&mut self, line: &SnapshotLine) -> Result<(), LedgerError> {
        match self.tables.snapshot_lines.get_mut(&line.id) {
            Some(row) => {
                *row = line.clone();
                Ok(())
            }
            None => Err(missing(EntityKind::SnapshotLine, line.id)),
        }
    }

    fn snapshot_lines(&mut self, id: SnapshotId) -> Result<Vec<SnapshotLine>, LedgerError> {
        Ok(self
            .tables
            .snapshot_lines
            .values()
            .filter(|line| line.snapshot_id == id)
            .cloned()
            .collect())
    }

    fn last_audit_hash(&mut self) -> Result<Option<String>, LedgerError> {
        Ok(self
            .tables
            .audit
            .values()
            .next_back()
            .map(|entry| entry.hash.clone()))
    }

    fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditEntry, LedgerError> {
        let entry = entry.into_entry(AuditId(self.tables.allocate()));
        self.tables.audit.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn audit_entries(&mut self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, LedgerError> {
        Ok(self
            .tables
            .audit
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }
}
