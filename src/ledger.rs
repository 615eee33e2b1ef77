//! Lot ledger: receiving, balance-affecting postings and lot lifecycle.
//!
//! Every balance change goes through [`post`], which locks the lot row, checks the
//! lot's state, computes `balance_after` from the locked `balance_before`, refuses a
//! negative result, and writes the lot, the transaction and the audit row in the
//! caller's unit.

use crate::audit;
use crate::context::{LedgerContext, UnitScope};
use crate::error::{AuthorizationError, ConflictError, EntityKind, LedgerError, ValidationError};
use crate::identity::{VerifiedWitness, WitnessCredential};
use crate::model::{
    InventoryTransaction, Lot, LotFilter, LotId, MedicationId, MedicationInfo, NewLot,
    NewTransaction, OperatorId, PatientLink, Quarantine, ReceiveLot, Retirement, Role, Schedule,
    TransactionFilter, TransactionId, TransactionKind,
};
use crate::quantity::{self, Quantity};
use crate::store::{LedgerStore, UnitOfWork};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

const LOT_NUMBER_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9./_ -]{0,49}$";
const DEFAULT_UNIT: &str = "units";
const DEFAULT_QUARANTINE_REASON: &str = "Expired";

/// How much a posting moves the balance
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Amount {
    /// Magnitude, signed by the transaction kind; adjust deltas carry their own sign
    Quantity(Quantity),
    /// Adjust the locked balance to exactly this value
    Target(Quantity),
}

/// One balance change about to be written
#[derive(Debug, Clone)]
pub(crate) struct Posting {
    pub lot_id: LotId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub actor: OperatorId,
    pub witness: Option<(OperatorId, DateTime<Utc>)>,
    pub prescriber: Option<OperatorId>,
    pub patient: Option<PatientLink>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub destination: Option<String>,
    pub reverses: Option<TransactionId>,
}

impl Posting {
    pub(crate) fn new(lot_id: LotId, kind: TransactionKind, amount: Amount, actor: OperatorId) -> Self {
        Self {
            lot_id,
            kind,
            amount,
            actor,
            witness: None,
            prescriber: None,
            patient: None,
            reason: None,
            notes: None,
            destination: None,
            reverses: None,
        }
    }

    pub(crate) fn witnessed(mut self, witness: Option<&VerifiedWitness>) -> Self {
        self.witness = witness.map(|w| (w.id(), w.verified_at));
        self
    }
}

/// Applies `posting` against the locked lot and records it
pub(crate) fn post(
    uow: &mut dyn UnitOfWork,
    scope: &UnitScope,
    posting: &Posting,
) -> Result<InventoryTransaction, LedgerError> {
    let mut lot = uow
        .lock_lot(posting.lot_id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, posting.lot_id))?;
    if !lot.is_active {
        return Err(ConflictError::Inactive.into());
    }
    if posting.kind.removes_for_use() {
        if lot.is_expired(scope.today) {
            return Err(ConflictError::Expired.into());
        }
        if lot.is_quarantined() {
            return Err(ConflictError::Quarantined.into());
        }
    }

    let balance_before = lot.current_quantity;
    let quantity = match posting.amount {
        Amount::Quantity(quantity) => quantity,
        Amount::Target(target) => target - balance_before,
    };
    let balance_after = quantity::checked_sum(balance_before, posting.kind.signed(quantity))?;
    if balance_after < Quantity::ZERO {
        return Err(ConflictError::InsufficientQuantity {
            available: balance_before.to_string(),
            requested: quantity.abs().to_string(),
        }
        .into());
    }

    lot.current_quantity = balance_after;
    uow.update_lot(&lot)?;
    let tx = uow.insert_transaction(NewTransaction {
        lot_id: lot.id,
        medication_id: lot.medication_id,
        kind: posting.kind,
        quantity,
        balance_before,
        balance_after,
        actor: posting.actor,
        witness: posting.witness.map(|(id, _)| id),
        witnessed_at: posting.witness.map(|(_, at)| at),
        prescriber: posting.prescriber,
        patient: posting.patient.clone().filter(|p| !p.is_empty()),
        reason: posting.reason.clone(),
        notes: posting.notes.clone(),
        destination: posting.destination.clone(),
        reverses: posting.reverses,
        occurred_at: scope.now,
    })?;

    let mut detail = format!(
        "{} {} {} on lot {} (balance {} -> {})",
        posting.kind.as_str(),
        quantity,
        lot.unit,
        lot.lot_number,
        balance_before,
        balance_after
    );
    if let Some((witness, _)) = posting.witness {
        detail.push_str(&format!(", witnessed by operator {witness}"));
    }
    audit::append(
        uow,
        scope,
        posting.actor,
        posting.kind.as_str(),
        EntityKind::Transaction,
        tx.id.get(),
        detail,
    )?;
    Ok(tx)
}

/// Balance-affecting request against one lot
#[derive(Debug, Clone, PartialEq)]
pub enum Movement {
    Dispense {
        quantity: Quantity,
        prescriber: Option<OperatorId>,
        patient: Option<PatientLink>,
    },
    /// Requires a witness
    Waste { quantity: Quantity },
    Return { quantity: Quantity },
    Transfer {
        quantity: Quantity,
        destination: Option<String>,
    },
    /// Sets the balance to `target`; admin only, reason required
    Adjust { target: Quantity },
}

impl Movement {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Movement::Dispense { .. } => TransactionKind::Dispense,
            Movement::Waste { .. } => TransactionKind::Waste,
            Movement::Return { .. } => TransactionKind::Return,
            Movement::Transfer { .. } => TransactionKind::Transfer,
            Movement::Adjust { .. } => TransactionKind::Adjust,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub lot_id: LotId,
    pub actor: OperatorId,
    pub movement: Movement,
    pub witness: Option<WitnessCredential>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

impl TransactionRequest {
    pub fn new(lot_id: LotId, actor: OperatorId, movement: Movement) -> Self {
        Self {
            lot_id,
            actor,
            movement,
            witness: None,
            reason: None,
            notes: None,
        }
    }

    pub fn witnessed_by(mut self, credential: WitnessCredential) -> Self {
        self.witness = Some(credential);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Lots with stock grouped by how close they are to expiring
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpirationWatch {
    pub expired: Vec<Lot>,
    pub expiring_soon: Vec<Lot>,
    pub expiring_later: Vec<Lot>,
    pub quarantined: Vec<Lot>,
}

/// A lot's balance recomputed from its history
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub lot_id: LotId,
    pub quantity_received: Quantity,
    /// Signed total of every transaction, reversals included
    pub posted: Quantity,
    pub recorded_balance: Quantity,
    pub transactions: usize,
}

impl Reconciliation {
    pub fn expected_balance(&self) -> Quantity {
        self.quantity_received + self.posted
    }

    pub fn is_balanced(&self) -> bool {
        self.expected_balance() == self.recorded_balance
    }
}

fn validate_lot_number(raw: &str) -> Result<String, LedgerError> {
    let lot_number = raw.trim();
    if lot_number.is_empty() {
        return Err(ValidationError::MissingField("lot_number").into());
    }
    let re = Regex::new(LOT_NUMBER_PATTERN)
        .map_err(|e| ValidationError::InvalidLotNumber(format!("pattern: {e}")))?;
    if !re.is_match(lot_number) {
        return Err(ValidationError::InvalidLotNumber(lot_number.to_string()).into());
    }
    Ok(lot_number.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub struct LotLedger<'a, S> {
    ctx: &'a LedgerContext<S>,
}

impl<'a, S: LedgerStore> LotLedger<'a, S> {
    pub(crate) fn new(ctx: &'a LedgerContext<S>) -> Self {
        Self { ctx }
    }

    /// Records a received lot; its balance starts at the received quantity
    pub fn receive_lot(&self, request: ReceiveLot, receiver: OperatorId) -> Result<Lot, LedgerError> {
        self.ctx.perform("receive_lot", |scope| {
            let receiver = self.ctx.actor(receiver)?;
            let quantity = quantity::positive(request.quantity, self.ctx.settings.quantity_scale)?;
            let lot_number = validate_lot_number(&request.lot_number)?;
            let medication = self.ctx.medication(request.medication_id)?;
            if !medication.is_active || medication.patient_inventory_only {
                return Err(ValidationError::MedicationUnavailable(medication.name).into());
            }
            let unit = non_blank(request.unit.clone())
                .or_else(|| medication.default_unit.clone())
                .unwrap_or_else(|| DEFAULT_UNIT.to_string());

            let lot = self.ctx.atomically(|uow| {
                let lot = uow.insert_lot(NewLot {
                    medication_id: medication.id,
                    lot_number: lot_number.clone(),
                    expiration_date: request.expiration_date,
                    quantity_received: quantity,
                    unit: unit.clone(),
                    source: non_blank(request.source.clone()),
                    invoice_number: non_blank(request.invoice_number.clone()),
                    storage_location: non_blank(request.storage_location.clone()),
                    received_by: receiver.id,
                    received_at: scope.now,
                })?;
                audit::append(
                    uow,
                    scope,
                    receiver.id,
                    "receive_lot",
                    EntityKind::Lot,
                    lot.id.get(),
                    format!(
                        "Received {} {} of {}, lot {}",
                        quantity, lot.unit, medication.name, lot.lot_number
                    ),
                )?;
                Ok(lot)
            })?;
            log::info!("received lot {} ({} {})", lot.id, lot.quantity_received, lot.unit);
            Ok(lot)
        })
    }

    /// Applies one dispense, waste, return, transfer or adjustment
    pub fn apply(&self, request: TransactionRequest) -> Result<InventoryTransaction, LedgerError> {
        let operation = request.movement.kind().as_str();
        self.ctx.perform(operation, |scope| {
            let actor = self.ctx.actor(request.actor)?;
            let scale = self.ctx.settings.quantity_scale;
            let witness = match &request.movement {
                Movement::Waste { .. } => {
                    Some(self.ctx.required_witness(actor.id, request.witness.as_ref(), scope)?)
                }
                _ => self
                    .ctx
                    .optional_witness(actor.id, request.witness.as_ref(), scope)?,
            };

            let mut posting = match &request.movement {
                Movement::Dispense {
                    quantity,
                    prescriber,
                    patient,
                } => {
                    let quantity = quantity::positive(*quantity, scale)?;
                    let medication = self.lot_medication(request.lot_id)?;
                    self.check_prescriber(&medication, *prescriber, scope.today)?;
                    let mut posting = Posting::new(
                        request.lot_id,
                        TransactionKind::Dispense,
                        Amount::Quantity(quantity),
                        actor.id,
                    );
                    posting.prescriber = *prescriber;
                    posting.patient = patient.clone();
                    posting
                }
                Movement::Waste { quantity } | Movement::Return { quantity } => Posting::new(
                    request.lot_id,
                    request.movement.kind(),
                    Amount::Quantity(quantity::positive(*quantity, scale)?),
                    actor.id,
                ),
                Movement::Transfer {
                    quantity,
                    destination,
                } => {
                    let mut posting = Posting::new(
                        request.lot_id,
                        TransactionKind::Transfer,
                        Amount::Quantity(quantity::positive(*quantity, scale)?),
                        actor.id,
                    );
                    posting.destination = non_blank(destination.clone());
                    posting
                }
                Movement::Adjust { target } => {
                    if !actor.is_admin() {
                        return Err(AuthorizationError::RoleRequired(Role::Admin).into());
                    }
                    if non_blank(request.reason.clone()).is_none() {
                        return Err(ValidationError::ReasonRequired.into());
                    }
                    Posting::new(
                        request.lot_id,
                        TransactionKind::Adjust,
                        Amount::Target(quantity::non_negative(*target, scale)?),
                        actor.id,
                    )
                }
            }
            .witnessed(witness.as_ref());
            posting.reason = non_blank(request.reason.clone());
            posting.notes = non_blank(request.notes.clone());

            let tx = self.ctx.atomically(|uow| post(uow, scope, &posting))?;
            #[cfg(feature = "metrics")]
            METRICS.record_posting(tx.kind.as_str());
            log::info!(
                "{} of {} on lot {}: balance {} -> {}",
                tx.kind.as_str(),
                tx.quantity,
                tx.lot_id,
                tx.balance_before,
                tx.balance_after
            );
            Ok(tx)
        })
    }

    pub fn dispense(
        &self,
        lot_id: LotId,
        actor: OperatorId,
        quantity: Quantity,
        prescriber: Option<OperatorId>,
        patient: Option<PatientLink>,
    ) -> Result<InventoryTransaction, LedgerError> {
        self.apply(TransactionRequest::new(
            lot_id,
            actor,
            Movement::Dispense {
                quantity,
                prescriber,
                patient,
            },
        ))
    }

    pub fn waste(
        &self,
        lot_id: LotId,
        actor: OperatorId,
        quantity: Quantity,
        witness: WitnessCredential,
        reason: impl Into<String>,
    ) -> Result<InventoryTransaction, LedgerError> {
        self.apply(
            TransactionRequest::new(lot_id, actor, Movement::Waste { quantity })
                .witnessed_by(witness)
                .with_reason(reason),
        )
    }

    pub fn adjust(
        &self,
        lot_id: LotId,
        actor: OperatorId,
        target: Quantity,
        reason: impl Into<String>,
    ) -> Result<InventoryTransaction, LedgerError> {
        self.apply(
            TransactionRequest::new(lot_id, actor, Movement::Adjust { target }).with_reason(reason),
        )
    }

    /// Blocks dispensing and transfers from the lot until released
    pub fn quarantine_lot(
        &self,
        lot_id: LotId,
        actor: OperatorId,
        reason: Option<String>,
    ) -> Result<Lot, LedgerError> {
        self.ctx.perform("quarantine_lot", |scope| {
            let actor = self.ctx.actor(actor)?;
            if !matches!(actor.role, Role::Admin | Role::Provider) {
                return Err(AuthorizationError::RoleRequired(Role::Provider).into());
            }
            let reason = non_blank(reason.clone()).unwrap_or_else(|| DEFAULT_QUARANTINE_REASON.to_string());
            self.ctx.atomically(|uow| {
                let mut lot = uow
                    .lock_lot(lot_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, lot_id))?;
                if lot.is_quarantined() {
                    return Err(ConflictError::AlreadyQuarantined.into());
                }
                lot.quarantine = Some(Quarantine {
                    reason: reason.clone(),
                    by: actor.id,
                    at: scope.now,
                });
                uow.update_lot(&lot)?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "quarantine_lot",
                    EntityKind::Lot,
                    lot.id.get(),
                    format!("Quarantined lot {}. Reason: {reason}", lot.lot_number),
                )?;
                Ok(lot)
            })
        })
    }

    pub fn release_quarantine(&self, lot_id: LotId, actor: OperatorId) -> Result<Lot, LedgerError> {
        self.ctx.perform("release_quarantine", |scope| {
            let actor = self.ctx.actor(actor)?;
            crate::identity::require_role(&actor, Role::Admin)?;
            self.ctx.atomically(|uow| {
                let mut lot = uow
                    .lock_lot(lot_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, lot_id))?;
                let Some(previous) = lot.quarantine.take() else {
                    return Err(ConflictError::NotQuarantined.into());
                };
                uow.update_lot(&lot)?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "release_quarantine",
                    EntityKind::Lot,
                    lot.id.get(),
                    format!(
                        "Released lot {} from quarantine. Was quarantined for: {}",
                        lot.lot_number, previous.reason
                    ),
                )?;
                Ok(lot)
            })
        })
    }

    /// Removes an empty lot, or deactivates it when history references it
    pub fn retire_lot(&self, lot_id: LotId, actor: OperatorId) -> Result<Retirement, LedgerError> {
        self.ctx.perform("retire_lot", |scope| {
            let actor = self.ctx.actor(actor)?;
            crate::identity::require_role(&actor, Role::Admin)?;
            self.ctx.atomically(|uow| {
                let lot = uow
                    .lock_lot(lot_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, lot_id))?;
                if lot.current_quantity > Quantity::ZERO {
                    return Err(ConflictError::StockRemaining.into());
                }
                let outcome = retire(uow, lot)?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "retire_lot",
                    EntityKind::Lot,
                    lot_id.get(),
                    retirement_detail(&outcome),
                )?;
                Ok(outcome)
            })
        })
    }

    /// Retires every lot of a medication; soft when any of them has history
    pub fn retire_medication_lots(
        &self,
        medication_id: MedicationId,
        actor: OperatorId,
    ) -> Result<Retirement, LedgerError> {
        self.ctx.perform("retire_medication_lots", |scope| {
            let actor = self.ctx.actor(actor)?;
            crate::identity::require_role(&actor, Role::Admin)?;
            self.ctx.atomically(|uow| {
                let mut lots = Vec::new();
                for lot in uow.lots(&LotFilter::medication(medication_id))? {
                    if let Some(locked) = uow.lock_lot(lot.id)? {
                        lots.push(locked);
                    }
                }
                if lots
                    .iter()
                    .any(|lot| lot.is_active && lot.current_quantity > Quantity::ZERO)
                {
                    return Err(ConflictError::StockRemaining.into());
                }
                let mut has_history = false;
                for lot in &lots {
                    has_history |= uow.lot_has_history(lot.id)?;
                }
                let outcome = if has_history {
                    for lot in &mut lots {
                        lot.is_active = false;
                        uow.update_lot(lot)?;
                    }
                    Retirement::SoftDeleted {
                        reason: "lots have transaction history".to_string(),
                    }
                } else {
                    for lot in &lots {
                        uow.delete_lot(lot.id)?;
                    }
                    Retirement::HardDeleted
                };
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "retire_medication_lots",
                    EntityKind::Medication,
                    medication_id.get(),
                    format!("{} ({} lots)", retirement_detail(&outcome), lots.len()),
                )?;
                Ok(outcome)
            })
        })
    }

    pub fn expiration_watch(&self) -> Result<ExpirationWatch, LedgerError> {
        let today = self.ctx.clock.today();
        let soon = today + Duration::days(self.ctx.settings.expiring_soon_days);
        let later = today + Duration::days(self.ctx.settings.expiring_later_days);
        let (mut on_hand, mut all) = self.ctx.read(|uow| {
            Ok((uow.lots(&LotFilter::on_hand())?, uow.lots(&LotFilter::default())?))
        })?;
        on_hand.sort_by_key(|lot| lot.expiration_date);
        all.sort_by_key(|lot| lot.expiration_date);

        let mut watch = ExpirationWatch::default();
        for lot in on_hand {
            let expires = lot.expiration_date;
            if expires < today {
                watch.expired.push(lot);
            } else if expires <= soon {
                watch.expiring_soon.push(lot);
            } else if expires <= later {
                watch.expiring_later.push(lot);
            }
        }
        watch.quarantined = all.into_iter().filter(Lot::is_quarantined).collect();
        Ok(watch)
    }

    pub fn lot(&self, lot_id: LotId) -> Result<Lot, LedgerError> {
        self.ctx
            .read(|uow| uow.lot(lot_id))?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, lot_id))
    }

    pub fn lots(&self, filter: &LotFilter) -> Result<Vec<Lot>, LedgerError> {
        self.ctx.read(|uow| uow.lots(filter))
    }

    /// Sum of active balances for one medication
    pub fn on_hand(&self, medication_id: MedicationId) -> Result<Quantity, LedgerError> {
        let filter = LotFilter {
            medication_id: Some(medication_id),
            active_only: true,
            with_stock_only: false,
        };
        Ok(self
            .lots(&filter)?
            .iter()
            .map(|lot| lot.current_quantity)
            .sum())
    }

    pub fn transaction(&self, id: TransactionId) -> Result<InventoryTransaction, LedgerError> {
        self.ctx
            .read(|uow| uow.transaction(id))?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Transaction, id))
    }

    /// Transaction history in id order
    pub fn history(&self, filter: &TransactionFilter) -> Result<Vec<InventoryTransaction>, LedgerError> {
        self.ctx.read(|uow| uow.transactions(filter))
    }

    /// Transactions on or after `from` and before `until`
    pub fn history_between(
        &self,
        from: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<InventoryTransaction>, LedgerError> {
        let start = |day: NaiveDate| day.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        self.history(&TransactionFilter {
            from: start(from),
            until: start(until),
            include_voided: true,
            ..TransactionFilter::default()
        })
    }

    pub fn reconcile_lot(&self, lot_id: LotId) -> Result<Reconciliation, LedgerError> {
        let (lot, history) = self.ctx.read(|uow| {
            let lot = uow
                .lot(lot_id)?
                .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, lot_id))?;
            Ok((lot, uow.transactions(&TransactionFilter::lot(lot_id))?))
        })?;
        Ok(Reconciliation {
            lot_id,
            quantity_received: lot.quantity_received,
            posted: history.iter().map(InventoryTransaction::signed_quantity).sum(),
            recorded_balance: lot.current_quantity,
            transactions: history.len(),
        })
    }

    fn lot_medication(&self, lot_id: LotId) -> Result<MedicationInfo, LedgerError> {
        let lot = self.lot(lot_id)?;
        self.ctx.medication(lot.medication_id)
    }

    fn check_prescriber(
        &self,
        medication: &MedicationInfo,
        prescriber: Option<OperatorId>,
        today: NaiveDate,
    ) -> Result<(), LedgerError> {
        let Some(prescriber) = prescriber else {
            if medication.schedule == Schedule::II
                && self.ctx.settings.require_prescriber_for_schedule_ii
            {
                return Err(AuthorizationError::PrescriberRequired.into());
            }
            return Ok(());
        };
        let Some(operator) = self.ctx.identity.operator(prescriber)? else {
            return Err(AuthorizationError::PrescriberNotAuthorized("unknown prescriber".to_string()).into());
        };
        match operator.prescribing_refusal(medication.schedule, today) {
            Some(reason) => Err(AuthorizationError::PrescriberNotAuthorized(reason).into()),
            None => Ok(()),
        }
    }
}

fn retire(uow: &mut dyn UnitOfWork, mut lot: Lot) -> Result<Retirement, LedgerError> {
    if uow.lot_has_history(lot.id)? {
        lot.is_active = false;
        uow.update_lot(&lot)?;
        Ok(Retirement::SoftDeleted {
            reason: "lot has transaction history".to_string(),
        })
    } else {
        uow.delete_lot(lot.id)?;
        Ok(Retirement::HardDeleted)
    }
}

fn retirement_detail(outcome: &Retirement) -> String {
    match outcome {
        Retirement::HardDeleted => "Deleted (no history)".to_string(),
        Retirement::SoftDeleted { reason } => format!("Deactivated: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConflictError, NotFoundError};
    use crate::identity::WitnessCredential;
    use crate::model::PatientId;
    use crate::test_helpers::{
        fixture, q, receive, ADMIN, DOCTOR, FENTANYL, LORAZEPAM, NURSE, TECH,
    };

    #[test]
    fn test_receive_lot_starts_balance_at_received_quantity() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 100);
        assert_eq!(lot.quantity_received, q(100));
        assert_eq!(lot.current_quantity, q(100));
        assert_eq!(lot.unit, "tablets");
        assert!(lot.is_active);
        let audit = fx.ledger.audit().history(EntityKind::Lot, lot.id.get()).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "receive_lot");
    }

    #[test]
    fn test_receive_lot_rejects_bad_input() {
        let fx = fixture();
        let lots = fx.ledger.lots();
        let mut request = fx.receive_request(LORAZEPAM, 0);
        assert_eq!(
            lots.receive_lot(request.clone(), NURSE).unwrap_err(),
            LedgerError::Validation(ValidationError::NonPositiveQuantity)
        );
        request.quantity = q(10);
        request.lot_number = "  ".to_string();
        assert_eq!(
            lots.receive_lot(request.clone(), NURSE).unwrap_err(),
            LedgerError::Validation(ValidationError::MissingField("lot_number"))
        );
        request.lot_number = "#bad!".to_string();
        assert!(matches!(
            lots.receive_lot(request, NURSE).unwrap_err(),
            LedgerError::Validation(ValidationError::InvalidLotNumber(_))
        ));
    }

    #[test]
    fn test_receive_lot_refuses_patient_only_medication() {
        let fx = fixture();
        let request = fx.receive_request(crate::test_helpers::TESTOSTERONE, 10);
        assert!(matches!(
            fx.ledger.lots().receive_lot(request, NURSE).unwrap_err(),
            LedgerError::Validation(ValidationError::MedicationUnavailable(_))
        ));
    }

    #[test]
    fn test_dispense_snapshots_balances() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 100);
        let patient = PatientLink {
            patient_id: Some(PatientId(9)),
            name: Some("Doe, Jane".to_string()),
            ..PatientLink::default()
        };
        let tx = fx
            .ledger
            .lots()
            .dispense(lot.id, NURSE, q(30), Some(DOCTOR), Some(patient.clone()))
            .unwrap();
        assert_eq!(tx.balance_before, q(100));
        assert_eq!(tx.balance_after, q(70));
        assert_eq!(tx.patient, Some(patient));
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(70));

        let by_patient = fx
            .ledger
            .lots()
            .history(&TransactionFilter {
                patient_id: Some(PatientId(9)),
                ..TransactionFilter::default()
            })
            .unwrap();
        assert_eq!(by_patient.len(), 1);
    }

    #[test]
    fn test_overdraw_is_rejected_without_side_effects() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 20);
        let err = fx
            .ledger
            .lots()
            .dispense(lot.id, NURSE, q(21), None, None)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Conflict(ConflictError::InsufficientQuantity {
                available: "20".to_string(),
                requested: "21".to_string(),
            })
        );
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(20));
        assert!(fx.ledger.lots().history(&TransactionFilter::lot(lot.id)).unwrap().is_empty());
    }

    #[test]
    fn test_balance_past_storable_bound_is_refused() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 99_999_999_999_990);
        let lots = fx.ledger.lots();
        let err = lots
            .apply(TransactionRequest::new(lot.id, NURSE, Movement::Return { quantity: q(20) }))
            .unwrap_err();
        assert_eq!(err, LedgerError::Validation(ValidationError::QuantityTooLarge));
        assert_eq!(lots.lot(lot.id).unwrap().current_quantity, q(99_999_999_999_990));

        let tx = lots.dispense(lot.id, NURSE, q(1), None, None).unwrap();
        assert_eq!(tx.balance_after, q(99_999_999_999_989));
        assert!(lots.reconcile_lot(lot.id).unwrap().is_balanced());
    }

    #[test]
    fn test_quarantine_keeps_first_record() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let lots = fx.ledger.lots();
        let first = lots
            .quarantine_lot(lot.id, DOCTOR, Some("recall notice".to_string()))
            .unwrap();
        assert_eq!(
            lots.quarantine_lot(lot.id, ADMIN, Some("second look".to_string()))
                .unwrap_err(),
            LedgerError::Conflict(ConflictError::AlreadyQuarantined)
        );
        let stored = lots.lot(lot.id).unwrap();
        assert_eq!(stored.quarantine, first.quarantine);
        assert_eq!(stored.quarantine.unwrap().reason, "recall notice");
        let audit = fx.ledger.audit().history(EntityKind::Lot, lot.id.get()).unwrap();
        assert_eq!(audit.iter().filter(|e| e.action == "quarantine_lot").count(), 1);
    }

    #[test]
    fn test_waste_requires_distinct_witness() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 50);
        let lots = fx.ledger.lots();
        let missing = lots.apply(TransactionRequest::new(lot.id, NURSE, Movement::Waste { quantity: q(5) }));
        assert_eq!(
            missing.unwrap_err(),
            LedgerError::Authorization(AuthorizationError::WitnessRequired)
        );
        let own = lots.waste(lot.id, NURSE, q(5), fx.credential(NURSE), "dropped");
        assert_eq!(
            own.unwrap_err(),
            LedgerError::Authorization(AuthorizationError::SameActorWitness)
        );
        let wrong = lots.waste(lot.id, NURSE, q(5), WitnessCredential::new(TECH, "nope"), "dropped");
        assert_eq!(
            wrong.unwrap_err(),
            LedgerError::Authorization(AuthorizationError::InvalidCredential)
        );
        let tx = lots.waste(lot.id, NURSE, q(5), fx.credential(TECH), "dropped").unwrap();
        assert_eq!(tx.witness, Some(TECH));
        assert!(tx.witnessed_at.is_some());
        assert_eq!(tx.balance_after, q(45));
    }

    #[test]
    fn test_schedule_ii_dispense_needs_authorized_prescriber() {
        let fx = fixture();
        let lot = receive(&fx, FENTANYL, 10);
        let lots = fx.ledger.lots();
        assert_eq!(
            lots.dispense(lot.id, NURSE, q(1), None, None).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::PrescriberRequired)
        );
        assert!(matches!(
            lots.dispense(lot.id, NURSE, q(1), Some(TECH), None).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::PrescriberNotAuthorized(_))
        ));
        assert!(lots.dispense(lot.id, NURSE, q(1), Some(DOCTOR), None).is_ok());
    }

    #[test]
    fn test_expired_and_quarantined_lots_block_dispense_only() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let lots = fx.ledger.lots();
        lots.quarantine_lot(lot.id, DOCTOR, None).unwrap();
        assert_eq!(
            lots.dispense(lot.id, NURSE, q(1), None, None).unwrap_err(),
            LedgerError::Conflict(ConflictError::Quarantined)
        );
        assert!(lots.waste(lot.id, NURSE, q(1), fx.credential(TECH), "expired").is_ok());

        assert_eq!(
            lots.release_quarantine(lot.id, NURSE).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::RoleRequired(Role::Admin))
        );
        let released = lots.release_quarantine(lot.id, ADMIN).unwrap();
        assert!(!released.is_quarantined());
        assert_eq!(
            lots.release_quarantine(lot.id, ADMIN).unwrap_err(),
            LedgerError::Conflict(ConflictError::NotQuarantined)
        );

        fx.clock.set(crate::test_helpers::at(2031, 1, 1));
        assert_eq!(
            lots.dispense(lot.id, NURSE, q(1), None, None).unwrap_err(),
            LedgerError::Conflict(ConflictError::Expired)
        );
        assert!(lots.adjust(lot.id, ADMIN, q(0), "destroyed expired stock").is_ok());
    }

    #[test]
    fn test_adjust_sets_target_and_requires_admin_and_reason() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 40);
        let lots = fx.ledger.lots();
        assert_eq!(
            lots.adjust(lot.id, NURSE, q(38), "recount").unwrap_err(),
            LedgerError::Authorization(AuthorizationError::RoleRequired(Role::Admin))
        );
        assert_eq!(
            lots.adjust(lot.id, ADMIN, q(38), " ").unwrap_err(),
            LedgerError::Validation(ValidationError::ReasonRequired)
        );
        let tx = lots.adjust(lot.id, ADMIN, q(38), "recount").unwrap();
        assert_eq!(tx.quantity, q(-2));
        assert_eq!(tx.balance_after, q(38));
    }

    #[test]
    fn test_missing_lot_is_not_found() {
        let fx = fixture();
        let err = fx
            .ledger
            .lots()
            .apply(TransactionRequest::new(LotId(404), NURSE, Movement::Return { quantity: q(1) }))
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::NotFound(NotFoundError {
                entity: EntityKind::Lot,
                id: 404
            })
        );
    }

    #[test]
    fn test_retire_lot_soft_deletes_with_history() {
        let fx = fixture();
        let lots = fx.ledger.lots();
        let untouched = receive(&fx, LORAZEPAM, 5);
        lots.adjust(untouched.id, ADMIN, q(0), "received in error").unwrap();
        assert_eq!(
            lots.retire_lot(untouched.id, ADMIN).unwrap(),
            Retirement::SoftDeleted {
                reason: "lot has transaction history".to_string()
            }
        );
        assert!(!lots.lot(untouched.id).unwrap().is_active);

        let stocked = receive(&fx, LORAZEPAM, 5);
        assert_eq!(
            lots.retire_lot(stocked.id, ADMIN).unwrap_err(),
            LedgerError::Conflict(ConflictError::StockRemaining)
        );
    }

    #[test]
    fn test_retire_medication_lots_hard_deletes_without_history() {
        let fx = fixture();
        let lots = fx.ledger.lots();
        assert_eq!(
            lots.retire_medication_lots(FENTANYL, ADMIN).unwrap(),
            Retirement::HardDeleted
        );
    }

    #[test]
    fn test_expiration_watch_buckets() {
        let fx = fixture();
        let lots = fx.ledger.lots();
        let mut request = fx.receive_request(LORAZEPAM, 5);
        request.expiration_date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let expired = lots.receive_lot(request.clone(), NURSE).unwrap();
        request.expiration_date = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let soon = lots.receive_lot(request.clone(), NURSE).unwrap();
        request.expiration_date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let later = lots.receive_lot(request, NURSE).unwrap();
        receive(&fx, LORAZEPAM, 5);

        let watch = lots.expiration_watch().unwrap();
        assert_eq!(watch.expired.iter().map(|l| l.id).collect::<Vec<_>>(), vec![expired.id]);
        assert_eq!(watch.expiring_soon.iter().map(|l| l.id).collect::<Vec<_>>(), vec![soon.id]);
        assert_eq!(watch.expiring_later.iter().map(|l| l.id).collect::<Vec<_>>(), vec![later.id]);
        assert!(watch.quarantined.is_empty());
    }

    #[test]
    fn test_reconcile_and_on_hand() {
        let fx = fixture();
        let lots = fx.ledger.lots();
        let a = receive(&fx, LORAZEPAM, 100);
        let b = receive(&fx, LORAZEPAM, 20);
        lots.dispense(a.id, NURSE, q(30), None, None).unwrap();
        lots.apply(TransactionRequest::new(a.id, NURSE, Movement::Return { quantity: q(5) }))
            .unwrap();
        let report = lots.reconcile_lot(a.id).unwrap();
        assert_eq!(report.posted, q(-25));
        assert_eq!(report.expected_balance(), q(75));
        assert!(report.is_balanced());
        assert_eq!(lots.on_hand(LORAZEPAM).unwrap(), q(95));
        assert_eq!(lots.lot(b.id).unwrap().current_quantity, q(20));
    }
}
