//! Voiding transactions by compensating entry.
//!
//! A void never edits or deletes the original. It writes an `adjust` transaction that
//! carries the inverse signed amount and `reverses = original`, then stamps the original
//! with a [`VoidRecord`] pointing at that entry. Both land in the same unit.

use crate::audit;
use crate::context::LedgerContext;
use crate::error::{ConflictError, EntityKind, LedgerError, ValidationError};
use crate::identity::{self, WitnessCredential};
use crate::ledger::{self, Amount, Posting};
use crate::model::{InventoryTransaction, OperatorId, Role, TransactionId, TransactionKind, VoidRecord};
use crate::store::LedgerStore;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Outcome of a void: the stamped original and its compensating entry
#[derive(Debug, Clone, PartialEq)]
pub struct Voided {
    pub original: InventoryTransaction,
    pub reversal: InventoryTransaction,
}

fn title(kind: TransactionKind) -> String {
    let name = kind.as_str();
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub struct Reversals<'a, S> {
    ctx: &'a LedgerContext<S>,
}

impl<'a, S: LedgerStore> Reversals<'a, S> {
    pub(crate) fn new(ctx: &'a LedgerContext<S>) -> Self {
        Self { ctx }
    }

    /// Voids a dispense, waste or adjustment. Admin only, witnessed, reason required.
    pub fn void(
        &self,
        transaction_id: TransactionId,
        actor: OperatorId,
        witness: &WitnessCredential,
        reason: &str,
    ) -> Result<Voided, LedgerError> {
        self.ctx.perform("void", |scope| {
            let actor = self.ctx.actor(actor)?;
            identity::require_role(&actor, Role::Admin)?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(ValidationError::ReasonRequired.into());
            }
            let witness = self.ctx.witness(actor.id, witness, scope)?;

            let voided = self.ctx.atomically(|uow| {
                let mut original = uow
                    .lock_transaction(transaction_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::Transaction, transaction_id))?;
                if original.is_voided() {
                    return Err(ConflictError::AlreadyVoided.into());
                }
                if original.is_reversal() {
                    return Err(ConflictError::NotVoidable("reversal".to_string()).into());
                }
                if !original.kind.is_voidable() {
                    return Err(ConflictError::NotVoidable(original.kind.as_str().to_string()).into());
                }

                let mut posting = Posting::new(
                    original.lot_id,
                    TransactionKind::Adjust,
                    Amount::Quantity(-original.signed_quantity()),
                    actor.id,
                )
                .witnessed(Some(&witness));
                posting.reason = Some(format!(
                    "VOID: {} transaction #{} voided. Reason: {reason}",
                    title(original.kind),
                    original.id
                ));
                posting.notes = Some(format!(
                    "Reversal of transaction #{} ({} {})",
                    original.id,
                    original.kind.as_str(),
                    original.quantity
                ));
                posting.reverses = Some(original.id);
                let reversal = ledger::post(uow, scope, &posting)?;

                let void = VoidRecord {
                    voided_by: actor.id,
                    voided_at: scope.now,
                    reason: reason.to_string(),
                    reversal_id: reversal.id,
                };
                uow.record_void(original.id, &void)?;
                original.void = Some(void);
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "void",
                    EntityKind::Transaction,
                    original.id.get(),
                    format!(
                        "Voided {} transaction #{} via reversal #{}, witnessed by operator {}. Reason: {reason}",
                        original.kind.as_str(),
                        original.id,
                        reversal.id,
                        witness.id()
                    ),
                )?;
                Ok(Voided { original, reversal })
            })?;

            #[cfg(feature = "metrics")]
            METRICS.record_posting("void");
            log::info!(
                "voided transaction {} with reversal {}",
                voided.original.id,
                voided.reversal.id
            );
            Ok(voided)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthorizationError;
    use crate::model::TransactionFilter;
    use crate::test_helpers::{fixture, q, receive, ADMIN, LORAZEPAM, NURSE, TECH};

    #[test]
    fn test_void_dispense_restores_balance() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 100);
        let tx = fx.ledger.lots().dispense(lot.id, NURSE, q(30), None, None).unwrap();

        let voided = fx
            .ledger
            .reversals()
            .void(tx.id, ADMIN, &fx.credential(NURSE), "wrong patient")
            .unwrap();
        assert_eq!(voided.reversal.kind, TransactionKind::Adjust);
        assert_eq!(voided.reversal.quantity, q(30));
        assert_eq!(voided.reversal.reverses, Some(tx.id));
        assert_eq!(voided.reversal.balance_after, q(100));
        assert_eq!(
            voided.reversal.reason.as_deref(),
            Some(format!("VOID: Dispense transaction #{} voided. Reason: wrong patient", tx.id).as_str())
        );
        let void = voided.original.void.clone().unwrap();
        assert_eq!(void.reversal_id, voided.reversal.id);

        let stored = fx.ledger.lots().transaction(tx.id).unwrap();
        assert!(stored.is_voided());
        assert_eq!(stored.quantity, q(30));
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(100));
        assert!(fx.ledger.lots().reconcile_lot(lot.id).unwrap().is_balanced());
    }

    #[test]
    fn test_void_adjustment_applies_inverse_delta() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 40);
        let tx = fx.ledger.lots().adjust(lot.id, ADMIN, q(45), "found stock").unwrap();
        let voided = fx
            .ledger
            .reversals()
            .void(tx.id, ADMIN, &fx.credential(TECH), "miscount")
            .unwrap();
        assert_eq!(voided.reversal.quantity, q(-5));
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(40));
    }

    #[test]
    fn test_second_void_is_refused() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let tx = fx.ledger.lots().dispense(lot.id, NURSE, q(1), None, None).unwrap();
        let reversals = fx.ledger.reversals();
        let voided = reversals.void(tx.id, ADMIN, &fx.credential(NURSE), "dup").unwrap();
        assert_eq!(
            reversals.void(tx.id, ADMIN, &fx.credential(NURSE), "dup").unwrap_err(),
            LedgerError::Conflict(ConflictError::AlreadyVoided)
        );
        assert_eq!(
            reversals
                .void(voided.reversal.id, ADMIN, &fx.credential(NURSE), "undo")
                .unwrap_err(),
            LedgerError::Conflict(ConflictError::NotVoidable("reversal".to_string()))
        );
        let history = fx.ledger.lots().history(&TransactionFilter::lot(lot.id)).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_void_requires_admin_reason_and_witness() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let tx = fx.ledger.lots().dispense(lot.id, NURSE, q(1), None, None).unwrap();
        let reversals = fx.ledger.reversals();
        assert_eq!(
            reversals.void(tx.id, NURSE, &fx.credential(TECH), "x").unwrap_err(),
            LedgerError::Authorization(AuthorizationError::RoleRequired(Role::Admin))
        );
        assert_eq!(
            reversals.void(tx.id, ADMIN, &fx.credential(TECH), "  ").unwrap_err(),
            LedgerError::Validation(ValidationError::ReasonRequired)
        );
        assert_eq!(
            reversals.void(tx.id, ADMIN, &fx.credential(ADMIN), "x").unwrap_err(),
            LedgerError::Authorization(AuthorizationError::SameActorWitness)
        );
        assert!(!fx.ledger.lots().transaction(tx.id).unwrap().is_voided());
    }

    #[test]
    fn test_returns_are_not_voidable() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let tx = fx
            .ledger
            .lots()
            .apply(crate::ledger::TransactionRequest::new(
                lot.id,
                NURSE,
                crate::ledger::Movement::Return { quantity: q(2) },
            ))
            .unwrap();
        assert_eq!(
            fx.ledger
                .reversals()
                .void(tx.id, ADMIN, &fx.credential(NURSE), "x")
                .unwrap_err(),
            LedgerError::Conflict(ConflictError::NotVoidable("return".to_string()))
        );
    }

    #[test]
    fn test_title_capitalizes_kind() {
        assert_eq!(title(TransactionKind::Waste), "Waste");
    }
}
