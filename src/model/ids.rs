//! Surrogate identifiers.
//!
//! Every persisted record is keyed by a database-assigned `i64`. Each record kind gets
//! its own newtype so a lot id can never be passed where a transaction id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl $name {
                pub fn get(self) -> i64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<i64> for $name {
                fn from(id: i64) -> Self {
                    $name(id)
                }
            }

            impl From<$name> for i64 {
                fn from(id: $name) -> i64 {
                    id.0
                }
            }
        )+
    };
}

entity_id!(
    /// Received batch of one medication
    LotId,
    /// Ledger transaction against one lot
    TransactionId,
    /// Single count row inside a session
    CountId,
    /// Count session grouping many counts
    SessionId,
    /// Medication prepared for one patient
    PatientStockId,
    PatientStockLogId,
    /// Biennial inventory header
    SnapshotId,
    SnapshotLineId,
    AuditId,
    /// Operator account in the identity store
    OperatorId,
    /// Medication in the external catalog
    MedicationId,
    /// Patient record owned by the clinical system
    PatientId,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trips_through_i64() {
        let id = LotId::from(42);
        assert_eq!(i64::from(id), 42);
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_id_serializes_transparently() {
        let json = serde_json::to_string(&OperatorId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
