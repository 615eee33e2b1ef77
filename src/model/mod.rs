//! Ledger records and the request/filter types that travel with them.

mod audit;
mod count;
mod ids;
mod lot;
mod medication;
mod operator;
mod patient_stock;
mod snapshot;
mod transaction;

pub use audit::{AuditEntry, AuditFilter, NewAuditEntry};
pub use count::{
    AdjustmentRef, Count, CountSession, CountTarget, DiscrepancyLine, NewCount, NewSession,
    Resolution, SessionFilter, SessionKind, SessionStatus,
};
pub use ids::{
    AuditId, CountId, LotId, MedicationId, OperatorId, PatientId, PatientStockId,
    PatientStockLogId, SessionId, SnapshotId, SnapshotLineId, TransactionId,
};
pub use lot::{Lot, LotFilter, NewLot, Quarantine, ReceiveLot, Retirement};
pub use medication::{MedicationInfo, Schedule};
pub use operator::{Operator, PrescriberAuthority, Role};
pub use patient_stock::{
    NewPatientStock, NewPatientStockLog, PatientStock, PatientStockFilter, PatientStockLog,
    PatientStockLogKind, PatientStockStatus,
};
pub use snapshot::{
    CountMethod, InventorySnapshot, InventoryTiming, NewSnapshot, NewSnapshotLine, SnapshotLine,
    SnapshotReport,
};
pub use transaction::{
    InventoryTransaction, NewTransaction, PatientLink, TransactionFilter, TransactionKind,
    VoidRecord,
};
