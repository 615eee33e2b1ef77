//! In-process identity store and catalog.
//!
//! Backs tests and small embeddings that keep operators and medications in memory.
//! Secrets are held as SHA-256 digests.

use crate::catalog::Catalog;
use crate::error::{LedgerError, StorageError};
use crate::identity::IdentityStore;
use crate::model::{MedicationId, MedicationInfo, Operator, OperatorId};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct StaticDirectory {
    operators: RwLock<BTreeMap<OperatorId, (Operator, String)>>,
    medications: RwLock<BTreeMap<MedicationId, MedicationInfo>>,
}

fn digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an operator and their secret
    pub fn add_operator(&self, operator: Operator, secret: &str) {
        let mut operators = match self.operators.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        operators.insert(operator.id, (operator, digest(secret)));
    }

    pub fn set_active(&self, id: OperatorId, active: bool) {
        let mut operators = match self.operators.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((operator, _)) = operators.get_mut(&id) {
            operator.is_active = active;
        }
    }

    pub fn add_medication(&self, medication: MedicationInfo) {
        let mut medications = match self.medications.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        medications.insert(medication.id, medication);
    }
}

impl IdentityStore for StaticDirectory {
    fn operator(&self, id: OperatorId) -> Result<Option<Operator>, LedgerError> {
        let operators = self.operators.read().map_err(|_| StorageError::Poisoned)?;
        Ok(operators.get(&id).map(|(operator, _)| operator.clone()))
    }

    fn check_password(&self, id: OperatorId, secret: &str) -> Result<bool, LedgerError> {
        let operators = self.operators.read().map_err(|_| StorageError::Poisoned)?;
        Ok(operators
            .get(&id)
            .is_some_and(|(_, stored)| *stored == digest(secret)))
    }
}

impl Catalog for StaticDirectory {
    fn medication(&self, id: MedicationId) -> Result<Option<MedicationInfo>, LedgerError> {
        let medications = self.medications.read().map_err(|_| StorageError::Poisoned)?;
        Ok(medications.get(&id).cloned())
    }

    fn medications(&self) -> Result<Vec<MedicationInfo>, LedgerError> {
        let medications = self.medications.read().map_err(|_| StorageError::Poisoned)?;
        Ok(medications.values().cloned().collect())
    }
}
