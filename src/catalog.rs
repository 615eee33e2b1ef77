//! Read-only medication catalog seam.

use crate::error::LedgerError;
use crate::model::{MedicationId, MedicationInfo};

pub trait Catalog: Send + Sync {
    fn medication(&self, id: MedicationId) -> Result<Option<MedicationInfo>, LedgerError>;

    fn medications(&self) -> Result<Vec<MedicationInfo>, LedgerError>;
}
