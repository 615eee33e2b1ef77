//! Count engine shared by daily counts, full physical inventories, Schedule II counts and
//! spot checks.
//!
//! A session copies each target's balance as the expected quantity when it starts.
//! Counts are submitted, verified by a second person, and any non-zero discrepancy is
//! resolved by someone other than the counter, optionally adjusting the ledger to the
//! counted quantity. Sessions move `in_progress -> completed -> reviewed` only.

use crate::audit;
use crate::context::LedgerContext;
use crate::error::{AuthorizationError, ConflictError, EntityKind, LedgerError, ValidationError};
use crate::identity::{self, WitnessCredential};
use crate::ledger::{self, Amount, Posting};
use crate::model::{
    AdjustmentRef, Count, CountId, CountSession, CountTarget, DiscrepancyLine, LotFilter,
    MedicationId, MedicationInfo, NewCount, NewSession, OperatorId, PatientStockFilter,
    PatientStockStatus, Resolution, Role, Schedule, SessionFilter, SessionId, SessionKind,
    SessionStatus, TransactionKind,
};
use crate::patient_stock;
use crate::quantity::{self, Quantity};
use crate::store::{LedgerStore, UnitOfWork};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// One target a session would count, with its balance at planning time
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCount {
    pub target: CountTarget,
    pub medication_id: MedicationId,
    pub expected_quantity: Quantity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub kind: SessionKind,
    /// Defaults to today
    pub session_date: Option<NaiveDate>,
    /// Explicit targets; required for spot checks, overrides planning otherwise
    pub selection: Vec<CountTarget>,
    pub notes: Option<String>,
}

impl SessionRequest {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            session_date: None,
            selection: Vec::new(),
            notes: None,
        }
    }

    pub fn on(mut self, date: NaiveDate) -> Self {
        self.session_date = Some(date);
        self
    }

    pub fn select(mut self, targets: impl IntoIterator<Item = CountTarget>) -> Self {
        self.selection.extend(targets);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedSession {
    pub session: CountSession,
    pub counts: Vec<Count>,
}

#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    /// Short category such as `recount_error` or `documentation_error`
    pub resolution_type: String,
    pub notes: String,
    /// Sets the target's balance to the counted quantity; needs a witness
    pub adjust_inventory: bool,
    pub witness: Option<WitnessCredential>,
}

impl ResolutionRequest {
    pub fn document(resolution_type: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            resolution_type: resolution_type.into(),
            notes: notes.into(),
            adjust_inventory: false,
            witness: None,
        }
    }

    pub fn adjusting(mut self, witness: WitnessCredential) -> Self {
        self.adjust_inventory = true;
        self.witness = Some(witness);
        self
    }
}

/// Result of verifying every eligible count in a session at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkVerification {
    pub verified: usize,
    /// Counts the verifier entered themselves
    pub skipped_own: usize,
    /// Counts with no actual quantity yet
    pub pending: usize,
}

fn plan(
    uow: &mut dyn UnitOfWork,
    medications: &BTreeMap<MedicationId, MedicationInfo>,
    kind: SessionKind,
    selection: &[CountTarget],
) -> Result<Vec<PlannedCount>, LedgerError> {
    let mut planned = Vec::new();
    if !selection.is_empty() {
        for target in selection {
            if planned.iter().any(|p: &PlannedCount| p.target == *target) {
                continue;
            }
            let (medication_id, expected_quantity) = match *target {
                CountTarget::Lot(id) => {
                    let lot = uow
                        .lot(id)?
                        .ok_or_else(|| LedgerError::not_found(EntityKind::Lot, id))?;
                    if !lot.is_active {
                        return Err(ConflictError::Inactive.into());
                    }
                    (lot.medication_id, lot.current_quantity)
                }
                CountTarget::PatientStock(id) => {
                    let stock = uow
                        .patient_stock(id)?
                        .ok_or_else(|| LedgerError::not_found(EntityKind::PatientStock, id))?;
                    if !stock.is_active() {
                        return Err(ConflictError::PatientStockClosed.into());
                    }
                    (stock.medication_id, stock.quantity_remaining)
                }
            };
            planned.push(PlannedCount {
                target: *target,
                medication_id,
                expected_quantity,
            });
        }
        return Ok(planned);
    }
    if kind == SessionKind::SpotCheck {
        return Err(ValidationError::EmptySelection.into());
    }

    for lot in uow.lots(&LotFilter::on_hand())? {
        let Some(medication) = medications.get(&lot.medication_id) else {
            continue;
        };
        if medication.patient_inventory_only {
            continue;
        }
        if kind == SessionKind::ScheduleII && medication.schedule != Schedule::II {
            continue;
        }
        planned.push(PlannedCount {
            target: CountTarget::Lot(lot.id),
            medication_id: lot.medication_id,
            expected_quantity: lot.current_quantity,
        });
    }
    if kind == SessionKind::Daily {
        let open = PatientStockFilter {
            status: Some(PatientStockStatus::Active),
            with_stock_only: true,
            ..PatientStockFilter::default()
        };
        for stock in uow.patient_stocks(&open)? {
            planned.push(PlannedCount {
                target: CountTarget::PatientStock(stock.id),
                medication_id: stock.medication_id,
                expected_quantity: stock.quantity_remaining,
            });
        }
    }
    Ok(planned)
}

fn locked_count(uow: &mut dyn UnitOfWork, id: CountId) -> Result<(Count, CountSession), LedgerError> {
    let count = uow
        .lock_count(id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::Count, id))?;
    let session = uow
        .lock_session(count.session_id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::Session, count.session_id))?;
    Ok((count, session))
}

fn locked_session(uow: &mut dyn UnitOfWork, id: SessionId) -> Result<CountSession, LedgerError> {
    uow.lock_session(id)?
        .ok_or_else(|| LedgerError::not_found(EntityKind::Session, id))
}

fn transition(session: &CountSession, to: SessionStatus) -> Result<(), LedgerError> {
    if session.status.next() == Some(to) {
        Ok(())
    } else {
        Err(ConflictError::InvalidTransition {
            from: session.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
        .into())
    }
}

pub struct CountEngine<'a, S> {
    ctx: &'a LedgerContext<S>,
}

impl<'a, S: LedgerStore> CountEngine<'a, S> {
    pub(crate) fn new(ctx: &'a LedgerContext<S>) -> Self {
        Self { ctx }
    }

    fn medications(&self) -> Result<BTreeMap<MedicationId, MedicationInfo>, LedgerError> {
        Ok(self
            .ctx
            .catalog
            .medications()?
            .into_iter()
            .map(|m| (m.id, m))
            .collect())
    }

    /// Targets a session of `kind` would count right now
    pub fn plan_session(
        &self,
        kind: SessionKind,
        selection: &[CountTarget],
    ) -> Result<Vec<PlannedCount>, LedgerError> {
        let medications = self.medications()?;
        self.ctx.read(|uow| plan(uow, &medications, kind, selection))
    }

    /// Opens a session with one count per planned target
    pub fn start_session(
        &self,
        request: SessionRequest,
        actor: OperatorId,
    ) -> Result<StartedSession, LedgerError> {
        self.ctx.perform("start_count_session", |scope| {
            let actor = self.ctx.actor(actor)?;
            let medications = self.medications()?;
            let started = self.ctx.atomically(|uow| {
                let planned = plan(uow, &medications, request.kind, &request.selection)?;
                if planned.is_empty() {
                    return Err(ValidationError::EmptySelection.into());
                }
                let session = uow.insert_session(NewSession {
                    kind: request.kind,
                    session_date: request.session_date.unwrap_or(scope.today),
                    started_by: actor.id,
                    started_at: scope.now,
                    notes: request.notes.clone(),
                })?;
                let mut counts = Vec::with_capacity(planned.len());
                for item in &planned {
                    counts.push(uow.insert_count(NewCount {
                        session_id: session.id,
                        target: item.target,
                        medication_id: item.medication_id,
                        expected_quantity: item.expected_quantity,
                    })?);
                }
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "start_count_session",
                    EntityKind::Session,
                    session.id.get(),
                    format!(
                        "Started {} count for {} with {} items",
                        session.kind.as_str(),
                        session.session_date,
                        counts.len()
                    ),
                )?;
                Ok(StartedSession { session, counts })
            })?;
            log::info!(
                "count session {} started with {} items",
                started.session.id,
                started.counts.len()
            );
            Ok(started)
        })
    }

    /// Records the counted quantity; a witness given here also verifies the count.
    ///
    /// Resubmitting replaces the previous entry and clears its verification.
    pub fn submit_count(
        &self,
        count_id: CountId,
        actual: Quantity,
        counter: OperatorId,
        witness: Option<&WitnessCredential>,
    ) -> Result<Count, LedgerError> {
        self.ctx.perform("submit_count", |scope| {
            let counter = self.ctx.actor(counter)?;
            let actual = quantity::non_negative(actual, self.ctx.settings.quantity_scale)?;
            let witness = self.ctx.optional_witness(counter.id, witness, scope)?;
            self.ctx.atomically(|uow| {
                let (mut count, session) = locked_count(uow, count_id)?;
                if session.status != SessionStatus::InProgress {
                    return Err(ConflictError::SessionClosed.into());
                }
                if count.resolution.is_some() {
                    return Err(ConflictError::AlreadyResolved.into());
                }
                count.actual_quantity = Some(actual);
                count.counted_by = Some(counter.id);
                count.counted_at = Some(scope.now);
                count.verified_by = witness.as_ref().map(|w| w.id());
                count.verified_at = witness.as_ref().map(|w| w.verified_at);
                uow.update_count(&count)?;

                let discrepancy = count.discrepancy().unwrap_or_default();
                let mut detail = format!(
                    "Counted {} (expected {}, discrepancy {})",
                    actual, count.expected_quantity, discrepancy
                );
                if let Some(witness) = &witness {
                    detail.push_str(&format!(", verified by operator {}", witness.id()));
                }
                audit::append(
                    uow,
                    scope,
                    counter.id,
                    "submit_count",
                    EntityKind::Count,
                    count.id.get(),
                    detail,
                )?;
                Ok(count)
            })
        })
    }

    /// Second-person verification of a submitted count
    pub fn verify_count(&self, count_id: CountId, credential: &WitnessCredential) -> Result<Count, LedgerError> {
        self.ctx.perform("verify_count", |scope| {
            let current = self
                .ctx
                .read(|uow| uow.count(count_id))?
                .ok_or_else(|| LedgerError::not_found(EntityKind::Count, count_id))?;
            let Some(counter) = current.counted_by else {
                return Err(ConflictError::CountNotSubmitted.into());
            };
            if credential.witness == counter {
                return Err(AuthorizationError::VerifierIsCounter.into());
            }
            let verifier = self.ctx.witness(counter, credential, scope)?;

            self.ctx.atomically(|uow| {
                let (mut count, session) = locked_count(uow, count_id)?;
                if session.status != SessionStatus::InProgress {
                    return Err(ConflictError::SessionClosed.into());
                }
                match count.counted_by {
                    None => return Err(ConflictError::CountNotSubmitted.into()),
                    Some(id) if id == verifier.id() => {
                        return Err(AuthorizationError::VerifierIsCounter.into())
                    }
                    Some(_) => {}
                }
                if count.is_verified() {
                    return Err(ConflictError::AlreadyVerified.into());
                }
                count.verified_by = Some(verifier.id());
                count.verified_at = Some(verifier.verified_at);
                uow.update_count(&count)?;
                audit::append(
                    uow,
                    scope,
                    verifier.id(),
                    "verify_count",
                    EntityKind::Count,
                    count.id.get(),
                    format!("Verified count entered by operator {counter}"),
                )?;
                Ok(count)
            })
        })
    }

    /// Verifies every submitted, unverified count the verifier did not enter
    pub fn verify_all(
        &self,
        session_id: SessionId,
        credential: &WitnessCredential,
    ) -> Result<BulkVerification, LedgerError> {
        self.ctx.perform("verify_all_counts", |scope| {
            let verifier = identity::authenticate(self.ctx.identity.as_ref(), credential, scope.now)?;
            self.ctx.atomically(|uow| {
                let session = locked_session(uow, session_id)?;
                if session.status != SessionStatus::InProgress {
                    return Err(ConflictError::SessionClosed.into());
                }
                let mut outcome = BulkVerification::default();
                for count in uow.session_counts(session_id)? {
                    if count.is_verified() {
                        continue;
                    }
                    match count.counted_by {
                        None => outcome.pending += 1,
                        Some(counter) if counter == verifier.id() => outcome.skipped_own += 1,
                        Some(_) => {
                            let mut count = uow
                                .lock_count(count.id)?
                                .ok_or_else(|| LedgerError::not_found(EntityKind::Count, count.id))?;
                            count.verified_by = Some(verifier.id());
                            count.verified_at = Some(verifier.verified_at);
                            uow.update_count(&count)?;
                            outcome.verified += 1;
                        }
                    }
                }
                audit::append(
                    uow,
                    scope,
                    verifier.id(),
                    "verify_all_counts",
                    EntityKind::Session,
                    session_id.get(),
                    format!(
                        "Verified {} counts ({} own counts skipped, {} not yet counted)",
                        outcome.verified, outcome.skipped_own, outcome.pending
                    ),
                )?;
                Ok(outcome)
            })
        })
    }

    /// Closes a non-zero discrepancy, optionally adjusting stock to the counted quantity
    pub fn resolve_discrepancy(
        &self,
        count_id: CountId,
        resolver: OperatorId,
        request: &ResolutionRequest,
    ) -> Result<Count, LedgerError> {
        self.ctx.perform("resolve_discrepancy", |scope| {
            let resolver = self.ctx.actor(resolver)?;
            let resolution_type = request.resolution_type.trim().to_ascii_uppercase();
            if resolution_type.is_empty() {
                return Err(ValidationError::MissingField("resolution_type").into());
            }
            let witness = if request.adjust_inventory {
                Some(self.ctx.required_witness(resolver.id, request.witness.as_ref(), scope)?)
            } else {
                self.ctx
                    .optional_witness(resolver.id, request.witness.as_ref(), scope)?
            };
            let notes = match request.notes.trim() {
                "" => format!("[{resolution_type}]"),
                text => format!("[{resolution_type}] {text}"),
            };

            let count = self.ctx.atomically(|uow| {
                let (mut count, session) = locked_count(uow, count_id)?;
                if session.status == SessionStatus::Reviewed {
                    return Err(ConflictError::SessionClosed.into());
                }
                let Some(actual) = count.actual_quantity else {
                    return Err(ConflictError::CountNotSubmitted.into());
                };
                if !count.has_discrepancy() {
                    return Err(ConflictError::NoDiscrepancy.into());
                }
                if count.resolution.is_some() {
                    return Err(ConflictError::AlreadyResolved.into());
                }
                if count.counted_by == Some(resolver.id) {
                    return Err(AuthorizationError::ResolverIsCounter.into());
                }

                let adjustment = if request.adjust_inventory {
                    let reason = format!("Count discrepancy resolution: {notes}");
                    let witness_id = witness.as_ref().map(|w| w.id());
                    Some(match count.target {
                        CountTarget::Lot(lot_id) => {
                            let mut posting = Posting::new(
                                lot_id,
                                TransactionKind::Adjust,
                                Amount::Target(actual),
                                resolver.id,
                            )
                            .witnessed(witness.as_ref());
                            posting.reason = Some(reason);
                            posting.notes = Some(format!("Count #{} in session #{}", count.id, session.id));
                            AdjustmentRef::Transaction(ledger::post(uow, scope, &posting)?.id)
                        }
                        CountTarget::PatientStock(stock_id) => AdjustmentRef::PatientStockLog(
                            patient_stock::adjust_to(uow, scope, stock_id, actual, resolver.id, witness_id, &reason)?
                                .id,
                        ),
                    })
                } else {
                    None
                };

                count.resolution = Some(Resolution {
                    resolution_type: resolution_type.clone(),
                    notes: notes.clone(),
                    resolved_by: resolver.id,
                    resolved_at: scope.now,
                    adjustment,
                });
                uow.update_count(&count)?;
                audit::append(
                    uow,
                    scope,
                    resolver.id,
                    "resolve_discrepancy",
                    EntityKind::Count,
                    count.id.get(),
                    format!(
                        "Resolved discrepancy of {} {}: {notes}",
                        count.discrepancy().unwrap_or_default(),
                        if adjustment.is_some() { "with adjustment" } else { "without adjustment" }
                    ),
                )?;
                Ok(count)
            })?;
            log::info!("discrepancy on count {} resolved", count.id);
            Ok(count)
        })
    }

    /// `in_progress -> completed`; every count must be entered and verified
    pub fn complete_session(&self, session_id: SessionId, actor: OperatorId) -> Result<CountSession, LedgerError> {
        self.ctx.perform("complete_count_session", |scope| {
            let actor = self.ctx.actor(actor)?;
            self.ctx.atomically(|uow| {
                let mut session = locked_session(uow, session_id)?;
                transition(&session, SessionStatus::Completed)?;
                let counts = uow.session_counts(session_id)?;
                let incomplete = counts.iter().filter(|c| c.actual_quantity.is_none()).count();
                if incomplete > 0 {
                    return Err(ConflictError::IncompleteCounts(incomplete).into());
                }
                let unverified = counts.iter().filter(|c| !c.is_verified()).count();
                if unverified > 0 {
                    return Err(ConflictError::UnverifiedCounts(unverified).into());
                }
                session.status = SessionStatus::Completed;
                session.completed_by = Some(actor.id);
                session.completed_at = Some(scope.now);
                uow.update_session(&session)?;
                let open = counts.iter().filter(|c| !c.discrepancy_resolved()).count();
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "complete_count_session",
                    EntityKind::Session,
                    session.id.get(),
                    format!(
                        "Completed {} count with {} items, {} open discrepancies",
                        session.kind.as_str(),
                        counts.len(),
                        open
                    ),
                )?;
                Ok(session)
            })
        })
    }

    /// `completed -> reviewed`; reviewer differs from the completer and nothing is open
    pub fn review_session(
        &self,
        session_id: SessionId,
        reviewer: OperatorId,
        notes: Option<&str>,
    ) -> Result<CountSession, LedgerError> {
        self.ctx.perform("review_count_session", |scope| {
            let reviewer = self.ctx.actor(reviewer)?;
            self.ctx.atomically(|uow| {
                let mut session = locked_session(uow, session_id)?;
                transition(&session, SessionStatus::Reviewed)?;
                if session.completed_by == Some(reviewer.id) {
                    return Err(AuthorizationError::ReviewerIsCompleter.into());
                }
                let unresolved = uow
                    .session_counts(session_id)?
                    .iter()
                    .filter(|c| !c.discrepancy_resolved())
                    .count();
                if unresolved > 0 {
                    return Err(ConflictError::UnresolvedDiscrepancies(unresolved).into());
                }
                if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
                    session.notes = Some(match session.notes.take() {
                        Some(existing) => format!("{existing}\nReview: {notes}"),
                        None => format!("Review: {notes}"),
                    });
                }
                session.status = SessionStatus::Reviewed;
                session.reviewed_by = Some(reviewer.id);
                session.reviewed_at = Some(scope.now);
                uow.update_session(&session)?;
                audit::append(
                    uow,
                    scope,
                    reviewer.id,
                    "review_count_session",
                    EntityKind::Session,
                    session.id.get(),
                    format!("Reviewed {} count of {}", session.kind.as_str(), session.session_date),
                )?;
                Ok(session)
            })
        })
    }

    /// Removes a session and its counts; admin only, refused once it adjusted stock
    pub fn delete_session(&self, session_id: SessionId, actor: OperatorId, reason: &str) -> Result<(), LedgerError> {
        self.ctx.perform("delete_count_session", |scope| {
            let actor = self.ctx.actor(actor)?;
            identity::require_role(&actor, Role::Admin)?;
            let reason = reason.trim();
            if reason.is_empty() {
                return Err(ValidationError::ReasonRequired.into());
            }
            self.ctx.atomically(|uow| {
                let session = locked_session(uow, session_id)?;
                let counts = uow.session_counts(session_id)?;
                if counts
                    .iter()
                    .any(|c| c.resolution.as_ref().is_some_and(|r| r.adjustment.is_some()))
                {
                    return Err(ConflictError::SessionHasAdjustments.into());
                }
                uow.delete_session(session_id)?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "delete_count_session",
                    EntityKind::Session,
                    session_id.get(),
                    format!(
                        "DELETED {} {} count of {} with {} items. Reason: {reason}",
                        session.status.as_str(),
                        session.kind.as_str(),
                        session.session_date,
                        counts.len()
                    ),
                )?;
                Ok(())
            })
        })
    }

    pub fn session(&self, session_id: SessionId) -> Result<CountSession, LedgerError> {
        self.ctx
            .read(|uow| uow.session(session_id))?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Session, session_id))
    }

    /// Newest session date first
    pub fn sessions(&self, filter: &SessionFilter) -> Result<Vec<CountSession>, LedgerError> {
        self.ctx.read(|uow| uow.sessions(filter))
    }

    pub fn session_counts(&self, session_id: SessionId) -> Result<Vec<Count>, LedgerError> {
        self.ctx.read(|uow| uow.session_counts(session_id))
    }

    pub fn count(&self, count_id: CountId) -> Result<Count, LedgerError> {
        self.ctx
            .read(|uow| uow.count(count_id))?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Count, count_id))
    }

    /// Non-zero discrepancies in matching sessions, newest session first
    pub fn discrepancy_report(
        &self,
        filter: &SessionFilter,
        include_resolved: bool,
    ) -> Result<Vec<DiscrepancyLine>, LedgerError> {
        self.ctx.read(|uow| {
            let mut lines = Vec::new();
            for session in uow.sessions(filter)? {
                for count in uow.session_counts(session.id)? {
                    let Some(discrepancy) = count.discrepancy().filter(|d| !d.is_zero()) else {
                        continue;
                    };
                    if count.resolution.is_some() && !include_resolved {
                        continue;
                    }
                    lines.push(DiscrepancyLine {
                        session: session.clone(),
                        count,
                        discrepancy,
                    });
                }
            }
            Ok(lines)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Lot, TransactionFilter};
    use crate::test_helpers::{
        fixture, prepare_request, q, receive, Fixture, ADMIN, DOCTOR, FENTANYL, LORAZEPAM, NURSE,
        TECH, TESTOSTERONE,
    };

    fn spot_check(fx: &Fixture, lot: &Lot) -> StartedSession {
        fx.ledger
            .counts()
            .start_session(
                SessionRequest::new(SessionKind::SpotCheck).select([CountTarget::Lot(lot.id)]),
                NURSE,
            )
            .unwrap()
    }

    #[test]
    fn test_plan_by_kind() {
        let fx = fixture();
        let lorazepam = receive(&fx, LORAZEPAM, 10);
        let fentanyl = receive(&fx, FENTANYL, 5);
        receive(&fx, LORAZEPAM, 1);
        fx.ledger.lots().adjust(lorazepam.id, ADMIN, q(0), "empty").unwrap();
        let stock = fx
            .ledger
            .patient_stock()
            .prepare(prepare_request(TESTOSTERONE, 2), NURSE)
            .unwrap();

        let counts = fx.ledger.counts();
        let full = counts.plan_session(SessionKind::Full, &[]).unwrap();
        assert_eq!(full.len(), 2);
        let schedule_ii = counts.plan_session(SessionKind::ScheduleII, &[]).unwrap();
        assert_eq!(schedule_ii.len(), 1);
        assert_eq!(schedule_ii[0].target, CountTarget::Lot(fentanyl.id));
        assert_eq!(schedule_ii[0].expected_quantity, q(5));
        let daily = counts.plan_session(SessionKind::Daily, &[]).unwrap();
        assert_eq!(daily.len(), 3);
        assert!(daily.iter().any(|p| p.target == CountTarget::PatientStock(stock.id)));
        assert_eq!(
            counts.plan_session(SessionKind::SpotCheck, &[]).unwrap_err(),
            LedgerError::Validation(ValidationError::EmptySelection)
        );
    }

    #[test]
    fn test_completion_requires_counts_and_verification() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 90);
        let started = spot_check(&fx, &lot);
        let counts = fx.ledger.counts();
        let session = started.session.id;
        let count = started.counts[0].id;
        assert_eq!(started.counts[0].expected_quantity, q(90));

        assert_eq!(
            counts.complete_session(session, NURSE).unwrap_err(),
            LedgerError::Conflict(ConflictError::IncompleteCounts(1))
        );
        counts.submit_count(count, q(90), NURSE, None).unwrap();
        assert_eq!(
            counts.complete_session(session, NURSE).unwrap_err(),
            LedgerError::Conflict(ConflictError::UnverifiedCounts(1))
        );
        assert_eq!(
            counts.verify_count(count, &fx.credential(NURSE)).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::VerifierIsCounter)
        );
        counts.verify_count(count, &fx.credential(TECH)).unwrap();
        assert_eq!(
            counts.verify_count(count, &fx.credential(ADMIN)).unwrap_err(),
            LedgerError::Conflict(ConflictError::AlreadyVerified)
        );
        let completed = counts.complete_session(session, NURSE).unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);
        assert_eq!(
            counts.complete_session(session, NURSE).unwrap_err(),
            LedgerError::Conflict(ConflictError::InvalidTransition {
                from: "completed".to_string(),
                to: "completed".to_string(),
            })
        );
        assert_eq!(
            counts.submit_count(count, q(1), NURSE, None).unwrap_err(),
            LedgerError::Conflict(ConflictError::SessionClosed)
        );
    }

    #[test]
    fn test_resolution_adjusts_lot_to_counted_quantity() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 90);
        let started = spot_check(&fx, &lot);
        let counts = fx.ledger.counts();
        let count_id = started.counts[0].id;

        let count = counts
            .submit_count(count_id, q(85), NURSE, Some(&fx.credential(TECH)))
            .unwrap();
        assert_eq!(count.discrepancy(), Some(q(-5)));
        assert!(!count.discrepancy_resolved());

        let request = ResolutionRequest::document("recount_error", "blister miscounted")
            .adjusting(fx.credential(TECH));
        assert_eq!(
            counts.resolve_discrepancy(count_id, NURSE, &request).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::ResolverIsCounter)
        );
        let resolved = counts.resolve_discrepancy(count_id, ADMIN, &request).unwrap();
        let resolution = resolved.resolution.clone().unwrap();
        assert_eq!(resolution.notes, "[RECOUNT_ERROR] blister miscounted");
        assert!(resolved.discrepancy_resolved());
        let Some(AdjustmentRef::Transaction(tx_id)) = resolution.adjustment else {
            panic!("expected a ledger adjustment");
        };
        let tx = fx.ledger.lots().transaction(tx_id).unwrap();
        assert_eq!(tx.kind, TransactionKind::Adjust);
        assert_eq!(tx.quantity, q(-5));
        assert_eq!(tx.witness, Some(TECH));
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(85));

        assert_eq!(
            counts.resolve_discrepancy(count_id, ADMIN, &request).unwrap_err(),
            LedgerError::Conflict(ConflictError::AlreadyResolved)
        );
    }

    #[test]
    fn test_resolution_overwrites_postings_made_during_session() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 90);
        let started = spot_check(&fx, &lot);
        let counts = fx.ledger.counts();
        let count_id = started.counts[0].id;
        counts
            .submit_count(count_id, q(85), NURSE, Some(&fx.credential(TECH)))
            .unwrap();
        fx.ledger.lots().dispense(lot.id, NURSE, q(3), None, None).unwrap();

        let request = ResolutionRequest::document("recount_error", "late dispense")
            .adjusting(fx.credential(TECH));
        let resolved = counts.resolve_discrepancy(count_id, ADMIN, &request).unwrap();
        let Some(AdjustmentRef::Transaction(tx_id)) = resolved.resolution.unwrap().adjustment else {
            panic!("expected a ledger adjustment");
        };
        let tx = fx.ledger.lots().transaction(tx_id).unwrap();
        assert_eq!(tx.balance_before, q(87));
        assert_eq!(tx.quantity, q(-2));
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(85));
    }

    #[test]
    fn test_adjusting_resolution_requires_witness() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let started = spot_check(&fx, &lot);
        let counts = fx.ledger.counts();
        let count_id = started.counts[0].id;
        counts.submit_count(count_id, q(9), NURSE, None).unwrap();

        let mut request = ResolutionRequest::document("theft_suspected", "reported");
        request.adjust_inventory = true;
        assert_eq!(
            counts.resolve_discrepancy(count_id, ADMIN, &request).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::WitnessRequired)
        );
        let documented = counts
            .resolve_discrepancy(count_id, ADMIN, &ResolutionRequest::document("recount_error", ""))
            .unwrap();
        assert!(documented.resolution.unwrap().adjustment.is_none());
        assert_eq!(fx.ledger.lots().lot(lot.id).unwrap().current_quantity, q(10));
        assert!(fx.ledger.lots().history(&TransactionFilter::lot(lot.id)).unwrap().is_empty());
    }

    #[test]
    fn test_patient_stock_resolution_writes_log() {
        let fx = fixture();
        let stock = fx
            .ledger
            .patient_stock()
            .prepare(prepare_request(TESTOSTERONE, 4), NURSE)
            .unwrap();
        let counts = fx.ledger.counts();
        let started = counts
            .start_session(
                SessionRequest::new(SessionKind::SpotCheck).select([CountTarget::PatientStock(stock.id)]),
                NURSE,
            )
            .unwrap();
        let count_id = started.counts[0].id;
        counts.submit_count(count_id, q(3), NURSE, None).unwrap();
        let request = ResolutionRequest::document("documentation_error", "missed entry")
            .adjusting(fx.credential(DOCTOR));
        let resolved = counts.resolve_discrepancy(count_id, TECH, &request).unwrap();
        assert!(matches!(
            resolved.resolution.unwrap().adjustment,
            Some(AdjustmentRef::PatientStockLog(_))
        ));
        let stock = fx.ledger.patient_stock().stock(stock.id).unwrap();
        assert_eq!(stock.quantity_remaining, q(3));
        assert!(fx.ledger.patient_stock().reconcile(stock.id).unwrap().is_balanced());
    }

    #[test]
    fn test_verify_all_skips_own_counts() {
        let fx = fixture();
        let a = receive(&fx, LORAZEPAM, 10);
        let b = receive(&fx, LORAZEPAM, 20);
        let c = receive(&fx, LORAZEPAM, 30);
        let counts = fx.ledger.counts();
        let started = counts
            .start_session(
                SessionRequest::new(SessionKind::SpotCheck).select([
                    CountTarget::Lot(a.id),
                    CountTarget::Lot(b.id),
                    CountTarget::Lot(c.id),
                ]),
                NURSE,
            )
            .unwrap();
        counts.submit_count(started.counts[0].id, q(10), NURSE, None).unwrap();
        counts.submit_count(started.counts[1].id, q(20), TECH, None).unwrap();

        let outcome = counts.verify_all(started.session.id, &fx.credential(TECH)).unwrap();
        assert_eq!(
            outcome,
            BulkVerification {
                verified: 1,
                skipped_own: 1,
                pending: 1
            }
        );
        assert_eq!(counts.count(started.counts[0].id).unwrap().verified_by, Some(TECH));
    }

    #[test]
    fn test_review_rules() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let started = spot_check(&fx, &lot);
        let counts = fx.ledger.counts();
        let session = started.session.id;
        let count_id = started.counts[0].id;
        counts
            .submit_count(count_id, q(8), NURSE, Some(&fx.credential(TECH)))
            .unwrap();
        assert!(matches!(
            counts.review_session(session, ADMIN, None).unwrap_err(),
            LedgerError::Conflict(ConflictError::InvalidTransition { .. })
        ));
        counts.complete_session(session, NURSE).unwrap();
        assert_eq!(
            counts.review_session(session, NURSE, None).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::ReviewerIsCompleter)
        );
        assert_eq!(
            counts.review_session(session, ADMIN, None).unwrap_err(),
            LedgerError::Conflict(ConflictError::UnresolvedDiscrepancies(1))
        );
        let report = counts.discrepancy_report(&SessionFilter::default(), false).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].discrepancy, q(-2));

        counts
            .resolve_discrepancy(count_id, ADMIN, &ResolutionRequest::document("recount_error", "ok"))
            .unwrap();
        assert!(counts.discrepancy_report(&SessionFilter::default(), false).unwrap().is_empty());
        assert_eq!(counts.discrepancy_report(&SessionFilter::default(), true).unwrap().len(), 1);
        let reviewed = counts.review_session(session, ADMIN, Some("looks right")).unwrap();
        assert_eq!(reviewed.status, SessionStatus::Reviewed);
        assert_eq!(reviewed.notes.as_deref(), Some("Review: looks right"));
    }

    #[test]
    fn test_delete_session_rules() {
        let fx = fixture();
        let lot = receive(&fx, LORAZEPAM, 10);
        let counts = fx.ledger.counts();
        let plain = spot_check(&fx, &lot);
        assert_eq!(
            counts.delete_session(plain.session.id, NURSE, "duplicate").unwrap_err(),
            LedgerError::Authorization(AuthorizationError::RoleRequired(Role::Admin))
        );
        counts.delete_session(plain.session.id, ADMIN, "duplicate").unwrap();
        assert!(matches!(
            counts.session(plain.session.id).unwrap_err(),
            LedgerError::NotFound(_)
        ));
        assert!(counts.session_counts(plain.session.id).unwrap().is_empty());

        let adjusted = spot_check(&fx, &lot);
        let count_id = adjusted.counts[0].id;
        counts.submit_count(count_id, q(9), NURSE, None).unwrap();
        counts
            .resolve_discrepancy(
                count_id,
                ADMIN,
                &ResolutionRequest::document("unknown", "short one").adjusting(fx.credential(TECH)),
            )
            .unwrap();
        assert_eq!(
            counts.delete_session(adjusted.session.id, ADMIN, "mistake").unwrap_err(),
            LedgerError::Conflict(ConflictError::SessionHasAdjustments)
        );
    }
}
