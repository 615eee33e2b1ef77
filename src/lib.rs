//! # Countersign
//!
//! Perpetual inventory ledger for controlled substances with dual-control witness
//! verification, built for the `may` coroutine runtime.
//!
//! Every balance change is one atomic unit: the lot row is locked, the new balance is
//! computed from the locked value, and the lot update, the transaction row and a
//! hash-chained audit row commit together. Voids append a compensating entry instead of
//! editing history. Counts compare expected and actual quantities and drive
//! discrepancies to a resolution by someone other than the counter.
//!
//! ```ignore
//! let ledger = Countersign::new(store, directory.clone(), directory, settings);
//! let lot = ledger.lots().receive_lot(request, receiver)?;
//! let tx = ledger.lots().dispense(lot.id, nurse, quantity, Some(prescriber), None)?;
//! ledger.reversals().void(tx.id, admin, &WitnessCredential::new(witness, secret), "wrong patient")?;
//! ```

pub mod audit;
pub mod catalog;
pub mod clock;
pub mod config;
mod context;
pub mod counts;
pub mod directory;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod patient_stock;
pub mod quantity;
pub mod reversal;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod test_helpers;

pub use audit::{AuditTrail, ChainBreak, ChainFault};
pub use catalog::Catalog;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{CountersignConfig, DatabaseSettings, LedgerSettings};
pub use context::{Countersign, UnitScope};
pub use counts::{
    BulkVerification, CountEngine, PlannedCount, ResolutionRequest, SessionRequest, StartedSession,
};
pub use directory::StaticDirectory;
pub use error::{
    AuthorizationError, ConflictError, EntityKind, LedgerError, NotFoundError, StorageError,
    ValidationError,
};
pub use identity::{IdentityStore, VerifiedWitness, WitnessCredential};
pub use ledger::{ExpirationWatch, LotLedger, Movement, Reconciliation, TransactionRequest};
pub use patient_stock::{PatientStockLedger, PrepareStock, StockReconciliation};
pub use quantity::Quantity;
pub use reversal::{Reversals, Voided};
pub use snapshot::{LineUpdate, SnapshotBook, SnapshotRequest};
pub use store::{LedgerStore, MemoryStore, PgStore, UnitOfWork};
