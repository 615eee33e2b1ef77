//! Patient-specific stock.
//!
//! Medication prepared for one patient is tracked outside lot balances. Each change
//! appends a log row with before/after balances in the same unit that updates
//! `quantity_remaining`, mirroring the lot ledger. Stock drawn from a lot leaves that lot
//! through a `transfer` posting in the same unit.

use crate::audit;
use crate::context::{LedgerContext, UnitScope};
use crate::error::{AuthorizationError, ConflictError, EntityKind, LedgerError, ValidationError};
use crate::identity::{VerifiedWitness, WitnessCredential};
use crate::ledger::{self, Amount, Posting};
use crate::model::{
    LotId, MedicationId, NewPatientStock, NewPatientStockLog, OperatorId, PatientLink,
    PatientStock, PatientStockFilter, PatientStockId, PatientStockLog, PatientStockLogKind,
    PatientStockStatus, TransactionKind,
};
use crate::quantity::{self, Quantity};
use crate::store::{LedgerStore, UnitOfWork};
use chrono::NaiveDate;

const DEFAULT_UNIT: &str = "doses";

/// Request to prepare stock for one patient
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareStock {
    /// `patient_id` is required; stock merges per patient and medication
    pub patient: PatientLink,
    pub medication_id: MedicationId,
    pub source_lot: Option<LotId>,
    pub quantity: Quantity,
    pub prescriber: OperatorId,
    /// Defaults to today
    pub preparation_date: Option<NaiveDate>,
    pub unit: Option<String>,
    pub lot_number: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub storage_location: Option<String>,
    pub notes: Option<String>,
}

/// Stock balance recomputed from its log
#[derive(Debug, Clone, PartialEq)]
pub struct StockReconciliation {
    pub stock_id: PatientStockId,
    pub quantity_prepared: Quantity,
    /// Signed total of every non-intake log row
    pub consumed: Quantity,
    pub recorded_remaining: Quantity,
}

impl StockReconciliation {
    pub fn is_balanced(&self) -> bool {
        self.quantity_prepared + self.consumed == self.recorded_remaining
    }
}

struct Change<'r> {
    kind: PatientStockLogKind,
    delta: Quantity,
    actor: OperatorId,
    witness: Option<OperatorId>,
    reason: Option<&'r str>,
    notes: Option<&'r str>,
}

/// Applies one consuming change to a locked stock row and logs it
fn apply_change(
    uow: &mut dyn UnitOfWork,
    scope: &UnitScope,
    stock_id: PatientStockId,
    change: &Change<'_>,
) -> Result<PatientStockLog, LedgerError> {
    let mut stock = uow
        .lock_patient_stock(stock_id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::PatientStock, stock_id))?;
    let open = match change.kind {
        PatientStockLogKind::Destroyed => matches!(
            stock.status,
            PatientStockStatus::Active | PatientStockStatus::Expired
        ),
        _ => stock.is_active(),
    };
    if !open {
        return Err(ConflictError::PatientStockClosed.into());
    }

    let before = stock.quantity_remaining;
    let after = quantity::checked_sum(before, change.delta)?;
    if after < Quantity::ZERO {
        return Err(ConflictError::InsufficientQuantity {
            available: before.to_string(),
            requested: change.delta.abs().to_string(),
        }
        .into());
    }
    stock.quantity_remaining = after;
    if change.kind == PatientStockLogKind::Destroyed {
        stock.status = PatientStockStatus::Destroyed;
    } else if after.is_zero() {
        stock.status = PatientStockStatus::Completed;
    }
    uow.update_patient_stock(&stock)?;

    let log = uow.insert_patient_stock_log(NewPatientStockLog {
        stock_id,
        kind: change.kind,
        quantity: change.delta,
        quantity_before: before,
        quantity_after: after,
        actor: change.actor,
        witness: change.witness,
        reason: change.reason.map(str::to_string),
        notes: change.notes.map(str::to_string),
        occurred_at: scope.now,
    })?;

    let mut detail = format!(
        "{} {} {} (remaining {} -> {})",
        change.kind.as_str(),
        change.delta.abs(),
        stock.unit,
        before,
        after
    );
    if let Some(witness) = change.witness {
        detail.push_str(&format!(", witnessed by operator {witness}"));
    }
    if let Some(reason) = change.reason {
        detail.push_str(&format!(". Reason: {reason}"));
    }
    audit::append(
        uow,
        scope,
        change.actor,
        change.kind.as_str(),
        EntityKind::PatientStock,
        stock_id.get(),
        detail,
    )?;
    Ok(log)
}

/// Sets a stock's remaining quantity to `target`, as a count resolution does
pub(crate) fn adjust_to(
    uow: &mut dyn UnitOfWork,
    scope: &UnitScope,
    stock_id: PatientStockId,
    target: Quantity,
    actor: OperatorId,
    witness: Option<OperatorId>,
    reason: &str,
) -> Result<PatientStockLog, LedgerError> {
    let current = uow
        .lock_patient_stock(stock_id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::PatientStock, stock_id))?
        .quantity_remaining;
    apply_change(
        uow,
        scope,
        stock_id,
        &Change {
            kind: PatientStockLogKind::Adjusted,
            delta: target - current,
            actor,
            witness,
            reason: Some(reason),
            notes: None,
        },
    )
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct PatientStockLedger<'a, S> {
    ctx: &'a LedgerContext<S>,
}

impl<'a, S: LedgerStore> PatientStockLedger<'a, S> {
    pub(crate) fn new(ctx: &'a LedgerContext<S>) -> Self {
        Self { ctx }
    }

    /// Prepares stock for a patient, merging into their open stock of the same medication
    pub fn prepare(&self, request: PrepareStock, actor: OperatorId) -> Result<PatientStock, LedgerError> {
        self.ctx.perform("prepare_patient_stock", |scope| {
            let actor = self.ctx.actor(actor)?;
            let quantity = quantity::positive(request.quantity, self.ctx.settings.quantity_scale)?;
            let Some(patient_id) = request.patient.patient_id else {
                return Err(ValidationError::MissingField("patient_id").into());
            };
            let medication = self.ctx.medication(request.medication_id)?;
            if !medication.is_active {
                return Err(ValidationError::MedicationUnavailable(medication.name).into());
            }
            let Some(prescriber) = self.ctx.identity.operator(request.prescriber)? else {
                return Err(AuthorizationError::PrescriberNotAuthorized("unknown prescriber".to_string()).into());
            };
            if let Some(reason) = prescriber.prescribing_refusal(medication.schedule, scope.today) {
                return Err(AuthorizationError::PrescriberNotAuthorized(reason).into());
            }

            let stock = self.ctx.atomically(|uow| {
                let mut lot_number = non_blank(&request.lot_number);
                let mut expiration_date = request.expiration_date;
                let mut unit = non_blank(&request.unit);

                let existing = uow
                    .patient_stocks(&PatientStockFilter {
                        patient_id: Some(patient_id),
                        medication_id: Some(medication.id),
                        status: Some(PatientStockStatus::Active),
                        with_stock_only: true,
                    })?
                    .into_iter()
                    .next();

                if let Some(lot_id) = request.source_lot {
                    let lot = uow
                        .lock_lot(lot_id)?
                        .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, lot_id))?;
                    if lot.medication_id != medication.id {
                        return Err(ValidationError::LotMedicationMismatch.into());
                    }
                    lot_number = lot_number.or_else(|| Some(lot.lot_number.clone()));
                    expiration_date = expiration_date.or(Some(lot.expiration_date));
                    unit = unit.or_else(|| Some(lot.unit.clone()));

                    let mut posting = Posting::new(
                        lot_id,
                        TransactionKind::Transfer,
                        Amount::Quantity(quantity),
                        actor.id,
                    );
                    posting.prescriber = Some(prescriber.id);
                    posting.patient = Some(request.patient.clone());
                    posting.destination = Some("patient stock".to_string());
                    posting.notes = Some(if existing.is_some() {
                        "Added to existing patient-specific inventory".to_string()
                    } else {
                        "Prepared for patient-specific inventory".to_string()
                    });
                    ledger::post(uow, scope, &posting)?;
                }

                let (stock, kind) = match existing {
                    Some(found) => {
                        let mut stock = uow
                            .lock_patient_stock(found.id)?
                            .ok_or_else(|| LedgerError::not_found(EntityKind::PatientStock, found.id))?;
                        stock.quantity_prepared = quantity::checked_sum(stock.quantity_prepared, quantity)?;
                        stock.quantity_remaining = quantity::checked_sum(stock.quantity_remaining, quantity)?;
                        if let Some(expires) = expiration_date {
                            if stock.expiration_date.map_or(true, |current| expires > current) {
                                stock.expiration_date = Some(expires);
                            }
                        }
                        if let Some(number) = &lot_number {
                            stock.lot_number = match stock.lot_number.take() {
                                Some(current) if current.split(", ").any(|n| n == number.as_str()) => Some(current),
                                Some(current) => Some(format!("{current}, {number}")),
                                None => Some(number.clone()),
                            };
                        }
                        uow.update_patient_stock(&stock)?;
                        (stock, PatientStockLogKind::Added)
                    }
                    None => {
                        let stock = uow.insert_patient_stock(NewPatientStock {
                            patient: request.patient.clone(),
                            medication_id: medication.id,
                            source_lot: request.source_lot,
                            preparation_date: request.preparation_date.unwrap_or(scope.today),
                            prepared_by: actor.id,
                            prescriber: prescriber.id,
                            lot_number: lot_number.clone(),
                            expiration_date,
                            quantity_prepared: quantity,
                            unit: unit
                                .clone()
                                .or_else(|| medication.default_unit.clone())
                                .unwrap_or_else(|| DEFAULT_UNIT.to_string()),
                            storage_location: non_blank(&request.storage_location),
                            notes: non_blank(&request.notes),
                            created_at: scope.now,
                        })?;
                        (stock, PatientStockLogKind::Prepared)
                    }
                };

                uow.insert_patient_stock_log(NewPatientStockLog {
                    stock_id: stock.id,
                    kind,
                    quantity,
                    quantity_before: stock.quantity_remaining - quantity,
                    quantity_after: stock.quantity_remaining,
                    actor: actor.id,
                    witness: None,
                    reason: None,
                    notes: non_blank(&request.notes),
                    occurred_at: scope.now,
                })?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "prepare_patient_stock",
                    EntityKind::PatientStock,
                    stock.id.get(),
                    format!(
                        "{} {} {} of {} for patient {}: now {}",
                        kind.as_str(),
                        quantity,
                        stock.unit,
                        medication.name,
                        patient_id,
                        stock.quantity_remaining
                    ),
                )?;
                Ok(stock)
            })?;
            log::info!("patient stock {} now holds {}", stock.id, stock.quantity_remaining);
            Ok(stock)
        })
    }

    pub fn administer(
        &self,
        stock_id: PatientStockId,
        actor: OperatorId,
        quantity: Quantity,
        witness: Option<&WitnessCredential>,
        notes: Option<&str>,
    ) -> Result<PatientStockLog, LedgerError> {
        self.ctx.perform("administer_patient_stock", |scope| {
            let actor = self.ctx.actor(actor)?;
            let quantity = quantity::positive(quantity, self.ctx.settings.quantity_scale)?;
            let witness = self.ctx.optional_witness(actor.id, witness, scope)?;
            self.ctx.atomically(|uow| {
                apply_change(
                    uow,
                    scope,
                    stock_id,
                    &Change {
                        kind: PatientStockLogKind::Administered,
                        delta: -quantity,
                        actor: actor.id,
                        witness: witness.as_ref().map(VerifiedWitness::id),
                        reason: None,
                        notes,
                    },
                )
            })
        })
    }

    /// Wastes part of the stock; witnessed, reason required
    pub fn waste(
        &self,
        stock_id: PatientStockId,
        actor: OperatorId,
        quantity: Quantity,
        witness: &WitnessCredential,
        reason: &str,
    ) -> Result<PatientStockLog, LedgerError> {
        self.ctx.perform("waste_patient_stock", |scope| {
            let actor = self.ctx.actor(actor)?;
            let quantity = quantity::positive(quantity, self.ctx.settings.quantity_scale)?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(ValidationError::ReasonRequired.into());
            }
            let witness = self.ctx.witness(actor.id, witness, scope)?;
            self.ctx.atomically(|uow| {
                apply_change(
                    uow,
                    scope,
                    stock_id,
                    &Change {
                        kind: PatientStockLogKind::Wasted,
                        delta: -quantity,
                        actor: actor.id,
                        witness: Some(witness.id()),
                        reason: Some(reason),
                        notes: None,
                    },
                )
            })
        })
    }

    /// Destroys everything that remains; witnessed, reason required
    pub fn destroy(
        &self,
        stock_id: PatientStockId,
        actor: OperatorId,
        witness: &WitnessCredential,
        reason: &str,
    ) -> Result<PatientStockLog, LedgerError> {
        self.ctx.perform("destroy_patient_stock", |scope| {
            let actor = self.ctx.actor(actor)?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(ValidationError::ReasonRequired.into());
            }
            let witness = self.ctx.witness(actor.id, witness, scope)?;
            self.ctx.atomically(|uow| {
                let remaining = uow
                    .lock_patient_stock(stock_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::PatientStock, stock_id))?
                    .quantity_remaining;
                apply_change(
                    uow,
                    scope,
                    stock_id,
                    &Change {
                        kind: PatientStockLogKind::Destroyed,
                        delta: -remaining,
                        actor: actor.id,
                        witness: Some(witness.id()),
                        reason: Some(reason),
                        notes: None,
                    },
                )
            })
        })
    }

    /// Marks active stock past its expiration date as expired
    pub fn expire(&self, stock_id: PatientStockId, actor: OperatorId) -> Result<PatientStock, LedgerError> {
        self.ctx.perform("expire_patient_stock", |scope| {
            let actor = self.ctx.actor(actor)?;
            self.ctx.atomically(|uow| {
                let mut stock = uow
                    .lock_patient_stock(stock_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::PatientStock, stock_id))?;
                if !stock.is_active() {
                    return Err(ConflictError::PatientStockClosed.into());
                }
                stock.status = PatientStockStatus::Expired;
                uow.update_patient_stock(&stock)?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "expire_patient_stock",
                    EntityKind::PatientStock,
                    stock.id.get(),
                    format!(
                        "Marked expired with {} {} remaining",
                        stock.quantity_remaining, stock.unit
                    ),
                )?;
                Ok(stock)
            })
        })
    }

    pub fn stock(&self, stock_id: PatientStockId) -> Result<PatientStock, LedgerError> {
        self.ctx
            .read(|uow| uow.patient_stock(stock_id))?
            .ok_or_else(|| LedgerError::not_found(EntityKind::PatientStock, stock_id))
    }

    pub fn stocks(&self, filter: &PatientStockFilter) -> Result<Vec<PatientStock>, LedgerError> {
        self.ctx.read(|uow| uow.patient_stocks(filter))
    }

    /// Log rows in id order
    pub fn logs(&self, stock_id: PatientStockId) -> Result<Vec<PatientStockLog>, LedgerError> {
        self.ctx.read(|uow| uow.patient_stock_logs(stock_id))
    }

    pub fn reconcile(&self, stock_id: PatientStockId) -> Result<StockReconciliation, LedgerError> {
        let stock = self.stock(stock_id)?;
        let consumed = self
            .logs(stock_id)?
            .iter()
            .filter(|log| !log.kind.is_intake())
            .map(|log| log.quantity)
            .sum();
        Ok(StockReconciliation {
            stock_id,
            quantity_prepared: stock.quantity_prepared,
            consumed,
            recorded_remaining: stock.quantity_remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PatientId, TransactionFilter};
    use crate::test_helpers::{fixture, prepare_request, q, receive, DOCTOR, LORAZEPAM, NURSE, TECH, TESTOSTERONE};

    #[test]
    fn test_prepare_from_lot_posts_transfer() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 50);
        let mut request = prepare_request(LORAZEPAM, 10);
        request.source_lot = Some(lot.id);
        let stock = fx.ledger.patient_stock().prepare(request, NURSE).unwrap();

        assert_eq!(stock.quantity_remaining, q(10));
        assert_eq!(stock.lot_number.as_deref(), Some(lot.lot_number.as_str()));
        assert_eq!(stock.unit, "tablets");
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(40));
        let history = fx.ledger.lots().history(&TransactionFilter::lot(lot.id)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::Transfer);
        assert_eq!(history[0].prescriber, Some(DOCTOR));
    }

    #[test]
    fn test_prepare_merges_into_open_stock() {
        let fx = fixture();
        let stocks = fx.ledger.patient_stock();
        let mut first = prepare_request(TESTOSTERONE, 4);
        first.lot_number = Some("T-1".to_string());
        first.expiration_date = NaiveDate::from_ymd_opt(2025, 1, 1);
        let a = stocks.prepare(first, NURSE).unwrap();
        let mut second = prepare_request(TESTOSTERONE, 6);
        second.lot_number = Some("T-2".to_string());
        second.expiration_date = NaiveDate::from_ymd_opt(2025, 6, 1);
        let b = stocks.prepare(second, NURSE).unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.quantity_prepared, q(10));
        assert_eq!(b.quantity_remaining, q(10));
        assert_eq!(b.lot_number.as_deref(), Some("T-1, T-2"));
        assert_eq!(b.expiration_date, NaiveDate::from_ymd_opt(2025, 6, 1));
        let kinds: Vec<_> = stocks.logs(a.id).unwrap().iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![PatientStockLogKind::Prepared, PatientStockLogKind::Added]);
    }

    #[test]
    fn test_merge_past_storable_bound_is_refused() {
        let fx = fixture();
        let stocks = fx.ledger.patient_stock();
        let a = stocks
            .prepare(prepare_request(TESTOSTERONE, 99_999_999_999_990), NURSE)
            .unwrap();
        assert_eq!(
            stocks.prepare(prepare_request(TESTOSTERONE, 20), NURSE).unwrap_err(),
            LedgerError::Validation(ValidationError::QuantityTooLarge)
        );
        let b = stocks.prepare(prepare_request(TESTOSTERONE, 5), NURSE).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.quantity_remaining, q(99_999_999_999_995));
    }

    #[test]
    fn test_prepare_requires_patient_and_authorized_prescriber() {
        let fx = fixture();
        let stocks = fx.ledger.patient_stock();
        let mut request = prepare_request(TESTOSTERONE, 1);
        request.patient.patient_id = None;
        assert_eq!(
            stocks.prepare(request, NURSE).unwrap_err(),
            LedgerError::Validation(ValidationError::MissingField("patient_id"))
        );
        let mut request = prepare_request(TESTOSTERONE, 1);
        request.prescriber = TECH;
        assert!(matches!(
            stocks.prepare(request, NURSE).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::PrescriberNotAuthorized(_))
        ));
    }

    #[test]
    fn test_source_lot_must_match_medication() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 5);
        let mut request = prepare_request(TESTOSTERONE, 1);
        request.source_lot = Some(lot.id);
        assert_eq!(
            fx.ledger.patient_stock().prepare(request, NURSE).unwrap_err(),
            LedgerError::Validation(ValidationError::LotMedicationMismatch)
        );
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(5));
    }

    #[test]
    fn test_administer_to_zero_completes_stock() {
        let fx = fixture();
        let stocks = fx.ledger.patient_stock();
        let stock = stocks.prepare(prepare_request(TESTOSTERONE, 2), NURSE).unwrap();
        stocks.administer(stock.id, NURSE, q(1), None, Some("left deltoid")).unwrap();
        let err = stocks.administer(stock.id, NURSE, q(2), None, None).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(ConflictError::InsufficientQuantity { .. })));
        let log = stocks.administer(stock.id, NURSE, q(1), None, None).unwrap();
        assert_eq!(log.quantity, q(-1));
        assert_eq!(log.quantity_after, q(0));
        assert_eq!(stocks.stock(stock.id).unwrap().status, PatientStockStatus::Completed);
        assert_eq!(
            stocks.administer(stock.id, NURSE, q(1), None, None).unwrap_err(),
            LedgerError::Conflict(ConflictError::PatientStockClosed)
        );
        assert!(stocks.reconcile(stock.id).unwrap().is_balanced());
    }

    #[test]
    fn test_waste_and_destroy_need_witness() {
        let fx = fixture();
        let stocks = fx.ledger.patient_stock();
        let stock = stocks.prepare(prepare_request(TESTOSTERONE, 5), NURSE).unwrap();
        assert_eq!(
            stocks
                .waste(stock.id, NURSE, q(1), &fx.credential(NURSE), "spilled")
                .unwrap_err(),
            LedgerError::Authorization(AuthorizationError::SameActorWitness)
        );
        let wasted = stocks
            .waste(stock.id, NURSE, q(1), &fx.credential(TECH), "spilled")
            .unwrap();
        assert_eq!(wasted.witness, Some(TECH));

        let destroyed = stocks
            .destroy(stock.id, NURSE, &fx.credential(TECH), "discontinued")
            .unwrap();
        assert_eq!(destroyed.quantity, q(-4));
        let stock = stocks.stock(stock.id).unwrap();
        assert_eq!(stock.status, PatientStockStatus::Destroyed);
        assert_eq!(stock.quantity_remaining, q(0));
        assert!(stocks.reconcile(stock.id).unwrap().is_balanced());
    }

    #[test]
    fn test_expired_stock_can_only_be_destroyed() {
        let fx = fixture();
        let stocks = fx.ledger.patient_stock();
        let stock = stocks.prepare(prepare_request(TESTOSTERONE, 3), NURSE).unwrap();
        stocks.expire(stock.id, NURSE).unwrap();
        assert_eq!(
            stocks.administer(stock.id, NURSE, q(1), None, None).unwrap_err(),
            LedgerError::Conflict(ConflictError::PatientStockClosed)
        );
        assert!(stocks
            .destroy(stock.id, NURSE, &fx.credential(TECH), "expired")
            .is_ok());
        let by_patient = stocks
            .stocks(&PatientStockFilter {
                patient_id: Some(PatientId(77)),
                ..PatientStockFilter::default()
            })
            .unwrap();
        assert_eq!(by_patient.len(), 1);
    }
}
