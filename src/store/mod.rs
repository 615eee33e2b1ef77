//! Persistence seam.
//!
//! [`LedgerStore::atomically`] runs one closure against a [`UnitOfWork`] and either
//! commits everything it wrote or nothing. Balance reads that precede a balance write go
//! through the `lock_*` methods so that two units touching the same row serialize.
//! Implementations: [`memory::MemoryStore`] and [`postgres::PgStore`].

pub mod memory;
pub mod postgres;

use crate::error::LedgerError;
use crate::model::{
    AuditEntry, AuditFilter, Count, CountId, CountSession, InventorySnapshot, InventoryTransaction,
    Lot, LotFilter, LotId, NewAuditEntry, NewCount, NewLot, NewPatientStock, NewPatientStockLog,
    NewSession, NewSnapshot, NewSnapshotLine, NewTransaction, PatientStock, PatientStockFilter,
    PatientStockId, PatientStockLog, SessionFilter, SessionId, SnapshotId, SnapshotLine,
    SnapshotLineId, TransactionFilter, TransactionId, VoidRecord,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub trait LedgerStore: Send + Sync {
    /// Runs `work` as one atomic unit.
    ///
    /// `work` may be invoked more than once when the backend detects contention; it must
    /// not have side effects outside the unit.
    fn atomically<T, F>(&self, work: F) -> Result<T, LedgerError>
    where
        F: FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>;
}

/// Row operations available inside one atomic unit
pub trait UnitOfWork {
    // Lots
    fn lot(&mut self, id: LotId) -> Result<Option<Lot>, LedgerError>;
    /// Reads a lot and holds its row until the unit ends
    fn lock_lot(&mut self, id: LotId) -> Result<Option<Lot>, LedgerError>;
    fn insert_lot(&mut self, lot: NewLot) -> Result<Lot, LedgerError>;
    /// Writes balance, activity and quarantine state back
    fn update_lot(&mut self, lot: &Lot) -> Result<(), LedgerError>;
    fn delete_lot(&mut self, id: LotId) -> Result<(), LedgerError>;
    fn lots(&mut self, filter: &LotFilter) -> Result<Vec<Lot>, LedgerError>;
    /// Any transaction, count, snapshot line or patient stock referencing the lot
    fn lot_has_history(&mut self, id: LotId) -> Result<bool, LedgerError>;

    // Transactions
    fn insert_transaction(&mut self, tx: NewTransaction) -> Result<InventoryTransaction, LedgerError>;
    fn transaction(&mut self, id: TransactionId) -> Result<Option<InventoryTransaction>, LedgerError>;
    fn lock_transaction(&mut self, id: TransactionId) -> Result<Option<InventoryTransaction>, LedgerError>;
    fn record_void(&mut self, id: TransactionId, void: &VoidRecord) -> Result<(), LedgerError>;
    /// Matching transactions in id order
    fn transactions(&mut self, filter: &TransactionFilter) -> Result<Vec<InventoryTransaction>, LedgerError>;

    // Patient stock
    fn patient_stock(&mut self, id: PatientStockId) -> Result<Option<PatientStock>, LedgerError>;
    fn lock_patient_stock(&mut self, id: PatientStockId) -> Result<Option<PatientStock>, LedgerError>;
    fn insert_patient_stock(&mut self, stock: NewPatientStock) -> Result<PatientStock, LedgerError>;
    fn update_patient_stock(&mut self, stock: &PatientStock) -> Result<(), LedgerError>;
    fn patient_stocks(&mut self, filter: &PatientStockFilter) -> Result<Vec<PatientStock>, LedgerError>;
    fn insert_patient_stock_log(&mut self, log: NewPatientStockLog) -> Result<PatientStockLog, LedgerError>;
    fn patient_stock_logs(&mut self, id: PatientStockId) -> Result<Vec<PatientStockLog>, LedgerError>;

    // Count sessions
    fn insert_session(&mut self, session: NewSession) -> Result<CountSession, LedgerError>;
    fn session(&mut self, id: SessionId) -> Result<Option<CountSession>, LedgerError>;
    fn lock_session(&mut self, id: SessionId) -> Result<Option<CountSession>, LedgerError>;
    fn update_session(&mut self, session: &CountSession) -> Result<(), LedgerError>;
    /// Removes the session and all of its counts
    fn delete_session(&mut self, id: SessionId) -> Result<(), LedgerError>;
    /// Matching sessions, newest date first
    fn sessions(&mut self, filter: &SessionFilter) -> Result<Vec<CountSession>, LedgerError>;

    // Counts
    fn insert_count(&mut self, count: NewCount) -> Result<Count, LedgerError>;
    fn count(&mut self, id: CountId) -> Result<Option<Count>, LedgerError>;
    fn lock_count(&mut self, id: CountId) -> Result<Option<Count>, LedgerError>;
    fn update_count(&mut self, count: &Count) -> Result<(), LedgerError>;
    fn session_counts(&mut self, id: SessionId) -> Result<Vec<Count>, LedgerError>;

    // Snapshots
    fn insert_snapshot(&mut self, snapshot: NewSnapshot) -> Result<InventorySnapshot, LedgerError>;
    fn snapshot(&mut self, id: SnapshotId) -> Result<Option<InventorySnapshot>, LedgerError>;
    fn lock_snapshot(&mut self, id: SnapshotId) -> Result<Option<InventorySnapshot>, LedgerError>;
    fn update_snapshot(&mut self, snapshot: &InventorySnapshot) -> Result<(), LedgerError>;
    fn snapshots(&mut self) -> Result<Vec<InventorySnapshot>, LedgerError>;
    fn insert_snapshot_line(&mut self, line: NewSnapshotLine) -> Result<SnapshotLine, LedgerError>;
    fn snapshot_line(&mut self, id: SnapshotLineId) -> Result<Option<SnapshotLine>, LedgerError>;
    fn update_snapshot_line(&mut self, line: &SnapshotLine) -> Result<(), LedgerError>;
    fn snapshot_lines(&mut self, id: SnapshotId) -> Result<Vec<SnapshotLine>, LedgerError>;

    // Audit
    /// Hash of the newest audit row; holds the chain head until the unit ends
    fn last_audit_hash(&mut self) -> Result<Option<String>, LedgerError>;
    fn append_audit(&mut self, entry: NewAuditEntry) -> Result<AuditEntry, LedgerError>;
    /// Matching entries in id order
    fn audit_entries(&mut self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, LedgerError>;
}
