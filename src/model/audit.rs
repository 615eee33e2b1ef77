use super::ids::{AuditId, OperatorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hash-chained audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    /// Shared by every row written in the same atomic unit
    pub unit_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub actor: OperatorId,
    pub action: String,
    pub entity_type: String,
    pub entity_id: i64,
    pub detail: String,
    pub previous_hash: Option<String>,
    pub hash: String,
}

/// Audit row before the store assigns its id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewAuditEntry {
    pub unit_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub actor: OperatorId,
    pub action: String,
    pub entity_type: String,
    pub entity_id: i64,
    pub detail: String,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl NewAuditEntry {
    pub fn into_entry(self, id: AuditId) -> AuditEntry {
        AuditEntry {
            id,
            unit_id: self.unit_id,
            occurred_at: self.occurred_at,
            actor: self.actor,
            action: self.action,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            detail: self.detail,
            previous_hash: self.previous_hash,
            hash: self.hash,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub actor: Option<OperatorId>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.map_or(true, |a| entry.actor == a)
            && self.entity_type.as_deref().map_or(true, |t| entry.entity_type == t)
            && self.entity_id.map_or(true, |id| entry.entity_id == id)
            && self.action.as_deref().map_or(true, |a| entry.action == a)
            && self.from.map_or(true, |from| entry.occurred_at >= from)
            && self.until.map_or(true, |until| entry.occurred_at < until)
    }
}
