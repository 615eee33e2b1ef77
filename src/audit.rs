//! Tamper-evident audit trail.
//!
//! Every mutating operation appends at least one row inside its own unit of work. Each
//! row's `hash` is SHA-256 over the previous row's hash followed by the canonical JSON
//! of the row's content, so editing, removing or reordering any row breaks every hash
//! after it.

use crate::context::{LedgerContext, UnitScope};
use crate::error::{EntityKind, LedgerError};
use crate::model::{AuditEntry, AuditFilter, AuditId, NewAuditEntry, OperatorId};
use crate::store::{LedgerStore, UnitOfWork};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

#[derive(Serialize)]
struct HashedContent<'a> {
    unit_id: &'a Uuid,
    occurred_at: &'a DateTime<Utc>,
    actor: OperatorId,
    action: &'a str,
    entity_type: &'a str,
    entity_id: i64,
    detail: &'a str,
}

#[allow(clippy::too_many_arguments)]
fn content_hash(
    previous_hash: Option<&str>,
    unit_id: &Uuid,
    occurred_at: &DateTime<Utc>,
    actor: OperatorId,
    action: &str,
    entity_type: &str,
    entity_id: i64,
    detail: &str,
) -> String {
    let content = HashedContent {
        unit_id,
        occurred_at,
        actor,
        action,
        entity_type,
        entity_id,
        detail,
    };
    // Serializing a struct of strings and integers cannot fail
    let canonical = serde_json::to_string(&content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.unwrap_or_default().as_bytes());
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Recomputes the hash `entry` should carry
pub fn entry_hash(entry: &AuditEntry) -> String {
    content_hash(
        entry.previous_hash.as_deref(),
        &entry.unit_id,
        &entry.occurred_at,
        entry.actor,
        &entry.action,
        &entry.entity_type,
        entry.entity_id,
        &entry.detail,
    )
}

/// Appends one chained row for the current unit
pub fn append(
    uow: &mut dyn UnitOfWork,
    scope: &UnitScope,
    actor: OperatorId,
    action: &str,
    entity: EntityKind,
    entity_id: i64,
    detail: impl Into<String>,
) -> Result<AuditEntry, LedgerError> {
    let detail = detail.into();
    let previous_hash = uow.last_audit_hash()?;
    let hash = content_hash(
        previous_hash.as_deref(),
        &scope.unit_id,
        &scope.now,
        actor,
        action,
        entity.as_str(),
        entity_id,
        &detail,
    );
    uow.append_audit(NewAuditEntry {
        unit_id: scope.unit_id,
        occurred_at: scope.now,
        actor,
        action: action.to_string(),
        entity_type: entity.as_str().to_string(),
        entity_id,
        detail,
        previous_hash,
        hash,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFault {
    /// Stored hash differs from the recomputed one
    HashMismatch,
    /// `previous_hash` does not name the row before it
    BrokenLink,
}

/// First row at which the chain stops verifying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainBreak {
    pub entry: AuditId,
    pub fault: ChainFault,
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fault {
            ChainFault::HashMismatch => write!(f, "audit entry {} was altered", self.entry),
            ChainFault::BrokenLink => write!(f, "audit chain broken before entry {}", self.entry),
        }
    }
}

impl std::error::Error for ChainBreak {}

/// Walks `entries` (the full log in id order) and returns how many rows verified
pub fn verify_chain(entries: &[AuditEntry]) -> Result<usize, ChainBreak> {
    let mut previous: Option<&str> = None;
    for entry in entries {
        if entry.previous_hash.as_deref() != previous {
            return Err(ChainBreak {
                entry: entry.id,
                fault: ChainFault::BrokenLink,
            });
        }
        if entry_hash(entry) != entry.hash {
            return Err(ChainBreak {
                entry: entry.id,
                fault: ChainFault::HashMismatch,
            });
        }
        previous = Some(entry.hash.as_str());
    }
    Ok(entries.len())
}

/// Read side of the audit log
pub struct AuditTrail<'a, S> {
    ctx: &'a LedgerContext<S>,
}

impl<'a, S: LedgerStore> AuditTrail<'a, S> {
    pub(crate) fn new(ctx: &'a LedgerContext<S>) -> Self {
        Self { ctx }
    }

    pub fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, LedgerError> {
        self.ctx.read(|uow| uow.audit_entries(filter))
    }

    /// Entries for one record, oldest first
    pub fn history(&self, entity: EntityKind, entity_id: i64) -> Result<Vec<AuditEntry>, LedgerError> {
        self.entries(&AuditFilter {
            entity_type: Some(entity.as_str().to_string()),
            entity_id: Some(entity_id),
            ..AuditFilter::default()
        })
    }

    /// Verifies the whole stored chain.
    ///
    /// The outer error is a storage failure; the inner one is the first broken row.
    pub fn verify(&self) -> Result<Result<usize, ChainBreak>, LedgerError> {
        let entries = self.entries(&AuditFilter::default())?;
        let verified = verify_chain(&entries);
        if let Err(broken) = &verified {
            log::warn!("audit chain verification failed: {broken}");
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LedgerStore, MemoryStore};
    use crate::test_helpers::at;

    fn scope(unit: u128, day: u32) -> UnitScope {
        UnitScope {
            unit_id: Uuid::from_u128(unit),
            now: at(2024, 3, day),
            today: at(2024, 3, day).date_naive(),
        }
    }

    fn seeded_chain() -> Vec<AuditEntry> {
        let store = MemoryStore::new();
        for (i, action) in ["receive_lot", "dispense", "waste"].iter().enumerate() {
            let scope = scope(i as u128 + 1, i as u32 + 1);
            store
                .atomically(|uow| {
                    append(uow, &scope, OperatorId(1), action, EntityKind::Lot, 7, format!("step {i}"))
                })
                .unwrap();
        }
        store
            .atomically(|uow| uow.audit_entries(&AuditFilter::default()))
            .unwrap()
    }

    #[test]
    fn test_entries_link_to_their_predecessor() {
        let entries = seeded_chain();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].previous_hash, None);
        assert_eq!(entries[1].previous_hash.as_deref(), Some(entries[0].hash.as_str()));
        assert_eq!(entries[2].previous_hash.as_deref(), Some(entries[1].hash.as_str()));
        assert_eq!(entries[0].hash.len(), 64);
        assert_eq!(verify_chain(&entries), Ok(3));
    }

    #[test]
    fn test_edited_detail_is_detected() {
        let mut entries = seeded_chain();
        entries[1].detail = "step 1, quietly edited".to_string();
        assert_eq!(
            verify_chain(&entries),
            Err(ChainBreak {
                entry: entries[1].id,
                fault: ChainFault::HashMismatch
            })
        );
    }

    #[test]
    fn test_removed_row_is_detected() {
        let mut entries = seeded_chain();
        entries.remove(1);
        assert_eq!(
            verify_chain(&entries).map_err(|b| b.fault),
            Err(ChainFault::BrokenLink)
        );
    }

    #[test]
    fn test_hash_depends_on_previous_hash() {
        let entries = seeded_chain();
        let mut relinked = entries[1].clone();
        relinked.previous_hash = Some("0".repeat(64));
        assert_ne!(entry_hash(&relinked), entries[1].hash);
    }

    #[test]
    fn test_empty_chain_verifies() {
        assert_eq!(verify_chain(&[]), Ok(0));
    }
}
