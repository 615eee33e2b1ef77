//! Biennial inventory snapshots.
//!
//! A snapshot freezes one line per on-hand lot at the moment it begins. Lines stay
//! editable until a witnessed completion, after which the snapshot is read-only. Nothing
//! here touches lot balances.

use crate::audit;
use crate::context::LedgerContext;
use crate::error::{
    AuthorizationError, ConflictError, EntityKind, EstimateRefusal, LedgerError, ValidationError,
};
use crate::identity::WitnessCredential;
use crate::model::{
    CountMethod, InventorySnapshot, InventoryTiming, LotFilter, MedicationId, MedicationInfo,
    NewSnapshot, NewSnapshotLine, Operator, OperatorId, Role, Schedule, SnapshotId, SnapshotLine,
    SnapshotLineId, SnapshotReport,
};
use crate::quantity::{self, Quantity};
use crate::store::LedgerStore;
use chrono::NaiveDate;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    pub inventory_date: NaiveDate,
    pub timing: InventoryTiming,
    pub dea_registration: Option<String>,
    pub state_registration: Option<String>,
    pub notes: Option<String>,
}

/// Edit to one draft line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineUpdate {
    pub quantity_counted: Quantity,
    pub method: CountMethod,
    /// Keeps the frozen value when `None`
    pub container_opened: Option<bool>,
}

fn require_conductor(operator: &Operator) -> Result<(), LedgerError> {
    if matches!(operator.role, Role::Admin | Role::Provider) {
        Ok(())
    } else {
        Err(AuthorizationError::RoleRequired(Role::Provider).into())
    }
}

/// Estimates are allowed only for opened containers outside Schedule II
fn check_method(schedule: Schedule, container_opened: bool, method: CountMethod) -> Result<(), ValidationError> {
    if method == CountMethod::Exact {
        return Ok(());
    }
    if schedule == Schedule::II {
        return Err(ValidationError::EstimateNotPermitted(EstimateRefusal::ScheduleII));
    }
    if !container_opened {
        return Err(ValidationError::EstimateNotPermitted(EstimateRefusal::UnopenedContainer));
    }
    Ok(())
}

pub struct SnapshotBook<'a, S> {
    ctx: &'a LedgerContext<S>,
}

impl<'a, S: LedgerStore> SnapshotBook<'a, S> {
    pub(crate) fn new(ctx: &'a LedgerContext<S>) -> Self {
        Self { ctx }
    }

    /// Creates a draft snapshot with one exact line per on-hand lot
    pub fn begin(&self, request: SnapshotRequest, conductor: OperatorId) -> Result<InventorySnapshot, LedgerError> {
        self.ctx.perform("begin_snapshot", |scope| {
            let conductor = self.ctx.actor(conductor)?;
            require_conductor(&conductor)?;
            let medications: BTreeMap<MedicationId, MedicationInfo> = self
                .ctx
                .catalog
                .medications()?
                .into_iter()
                .map(|m| (m.id, m))
                .collect();

            let (snapshot, lines) = self.ctx.atomically(|uow| {
                let mut lots: Vec<_> = uow
                    .lots(&LotFilter::on_hand())?
                    .into_iter()
                    .filter_map(|lot| {
                        let medication = medications.get(&lot.medication_id)?;
                        (!medication.patient_inventory_only).then_some((lot, medication))
                    })
                    .collect();
                lots.sort_by(|(a, ma), (b, mb)| {
                    (ma.schedule, &ma.name, a.id).cmp(&(mb.schedule, &mb.name, b.id))
                });

                let snapshot = uow.insert_snapshot(NewSnapshot {
                    inventory_date: request.inventory_date,
                    timing: request.timing,
                    dea_registration: request.dea_registration.clone(),
                    state_registration: request.state_registration.clone(),
                    conducted_by: conductor.id,
                    created_at: scope.now,
                    notes: request.notes.clone(),
                })?;
                for (lot, medication) in &lots {
                    uow.insert_snapshot_line(NewSnapshotLine {
                        snapshot_id: snapshot.id,
                        medication_id: medication.id,
                        lot_id: Some(lot.id),
                        drug_name: medication.name.clone(),
                        schedule: medication.schedule,
                        ndc: medication.ndc.clone(),
                        form: medication.form.clone(),
                        strength: medication.strength.clone(),
                        lot_number: Some(lot.lot_number.clone()),
                        expiration_date: Some(lot.expiration_date),
                        container_opened: lot.is_opened(),
                        quantity_counted: lot.current_quantity,
                        unit: lot.unit.clone(),
                        method: CountMethod::Exact,
                    })?;
                }
                audit::append(
                    uow,
                    scope,
                    conductor.id,
                    "begin_snapshot",
                    EntityKind::Snapshot,
                    snapshot.id.get(),
                    format!(
                        "Began biennial inventory for {} ({}) with {} lines",
                        snapshot.inventory_date,
                        snapshot.timing.as_str(),
                        lots.len()
                    ),
                )?;
                Ok((snapshot, lots.len()))
            })?;
            log::info!("snapshot {} drafted with {lines} lines", snapshot.id);
            Ok(snapshot)
        })
    }

    pub fn update_line(
        &self,
        line_id: SnapshotLineId,
        actor: OperatorId,
        update: LineUpdate,
    ) -> Result<SnapshotLine, LedgerError> {
        self.ctx.perform("update_snapshot_line", |scope| {
            let actor = self.ctx.actor(actor)?;
            require_conductor(&actor)?;
            let counted = quantity::non_negative(update.quantity_counted, self.ctx.settings.quantity_scale)?;
            self.ctx.atomically(|uow| {
                let mut line = uow
                    .snapshot_line(line_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::SnapshotLine, line_id))?;
                let snapshot = uow
                    .lock_snapshot(line.snapshot_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::Snapshot, line.snapshot_id))?;
                if snapshot.is_complete() {
                    return Err(ConflictError::SnapshotFinalized.into());
                }
                let opened = update.container_opened.unwrap_or(line.container_opened);
                check_method(line.schedule, opened, update.method)?;
                let previous = line.quantity_counted;
                line.quantity_counted = counted;
                line.method = update.method;
                line.container_opened = opened;
                uow.update_snapshot_line(&line)?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "update_snapshot_line",
                    EntityKind::SnapshotLine,
                    line.id.get(),
                    format!(
                        "{} lot {}: {} -> {} ({})",
                        line.drug_name,
                        line.lot_number.as_deref().unwrap_or("-"),
                        previous,
                        counted,
                        line.method.as_str()
                    ),
                )?;
                Ok(line)
            })
        })
    }

    /// Finalizes the snapshot under a witness distinct from the actor and the conductor
    pub fn complete(
        &self,
        snapshot_id: SnapshotId,
        actor: OperatorId,
        witness: &WitnessCredential,
    ) -> Result<InventorySnapshot, LedgerError> {
        self.ctx.perform("complete_snapshot", |scope| {
            let actor = self.ctx.actor(actor)?;
            require_conductor(&actor)?;
            let witness = self.ctx.witness(actor.id, witness, scope)?;
            self.ctx.atomically(|uow| {
                let mut snapshot = uow
                    .lock_snapshot(snapshot_id)?
                    .ok_or_else(|| LedgerError::not_found(EntityKind::Snapshot, snapshot_id))?;
                if snapshot.is_complete() {
                    return Err(ConflictError::SnapshotFinalized.into());
                }
                if witness.id() == snapshot.conducted_by {
                    return Err(AuthorizationError::SameActorWitness.into());
                }
                snapshot.witnessed_by = Some(witness.id());
                snapshot.completed_at = Some(scope.now);
                uow.update_snapshot(&snapshot)?;
                audit::append(
                    uow,
                    scope,
                    actor.id,
                    "complete_snapshot",
                    EntityKind::Snapshot,
                    snapshot.id.get(),
                    format!("Completed biennial inventory, witnessed by operator {}", witness.id()),
                )?;
                Ok(snapshot)
            })
        })
    }

    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Result<InventorySnapshot, LedgerError> {
        self.ctx
            .read(|uow| uow.snapshot(snapshot_id))?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Snapshot, snapshot_id))
    }

    /// Newest inventory date first
    pub fn snapshots(&self) -> Result<Vec<InventorySnapshot>, LedgerError> {
        let mut snapshots = self.ctx.read(|uow| uow.snapshots())?;
        snapshots.sort_by(|a, b| b.inventory_date.cmp(&a.inventory_date).then(b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    pub fn lines(&self, snapshot_id: SnapshotId) -> Result<Vec<SnapshotLine>, LedgerError> {
        self.ctx.read(|uow| uow.snapshot_lines(snapshot_id))
    }

    /// Lines split into Schedule II and Schedules III-V
    pub fn report(&self, snapshot_id: SnapshotId) -> Result<SnapshotReport, LedgerError> {
        let snapshot = self.snapshot(snapshot_id)?;
        let (schedule_ii, schedules_iii_to_v) = self
            .lines(snapshot_id)?
            .into_iter()
            .partition(|line| line.schedule == Schedule::II);
        Ok(SnapshotReport {
            snapshot,
            schedule_ii,
            schedules_iii_to_v,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        fixture, q, receive, Fixture, ADMIN, DOCTOR, FENTANYL, LORAZEPAM, NURSE, TECH,
    };

    fn request() -> SnapshotRequest {
        SnapshotRequest {
            inventory_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            timing: InventoryTiming::CloseOfBusiness,
            dea_registration: Some("AB1234563".to_string()),
            state_registration: None,
            notes: None,
        }
    }

    fn stocked(fx: &Fixture) -> InventorySnapshot {
        let opened = receive(fx, LORAZEPAM, 100);
        fx.ledger.lots().dispense(opened.id, NURSE, q(10), None, None).unwrap();
        receive(fx, FENTANYL, 20);
        fx.ledger.snapshots().begin(request(), DOCTOR).unwrap()
    }

    #[test]
    fn test_begin_freezes_on_hand_lots() {
        let fx = fixture();
        let snapshot = stocked(&fx);
        let report = fx.ledger.snapshots().report(snapshot.id).unwrap();
        assert_eq!(report.schedule_ii.len(), 1);
        assert_eq!(report.schedules_iii_to_v.len(), 1);
        let lorazepam = &report.schedules_iii_to_v[0];
        assert!(lorazepam.container_opened);
        assert_eq!(lorazepam.quantity_counted, q(90));
        assert_eq!(lorazepam.method, CountMethod::Exact);
        assert!(!report.schedule_ii[0].container_opened);
    }

    #[test]
    fn test_staff_cannot_conduct() {
        let fx = fixture();
        assert_eq!(
            fx.ledger.snapshots().begin(request(), NURSE).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::RoleRequired(Role::Provider))
        );
    }

    #[test]
    fn test_estimates_refused_for_schedule_ii_and_unopened() {
        let fx = fixture();
        let snapshot = stocked(&fx);
        let book = fx.ledger.snapshots();
        let report = book.report(snapshot.id).unwrap();
        let estimate = LineUpdate {
            quantity_counted: q(19),
            method: CountMethod::Estimated,
            container_opened: None,
        };
        assert_eq!(
            book.update_line(report.schedule_ii[0].id, DOCTOR, estimate).unwrap_err(),
            LedgerError::Validation(ValidationError::EstimateNotPermitted(EstimateRefusal::ScheduleII))
        );
        let line = book
            .update_line(report.schedules_iii_to_v[0].id, DOCTOR, estimate)
            .unwrap();
        assert_eq!(line.quantity_counted, q(19));
        let sealed = LineUpdate {
            container_opened: Some(false),
            ..estimate
        };
        assert_eq!(
            book.update_line(line.id, DOCTOR, sealed).unwrap_err(),
            LedgerError::Validation(ValidationError::EstimateNotPermitted(
                EstimateRefusal::UnopenedContainer
            ))
        );
    }

    #[test]
    fn test_completion_is_witnessed_and_final() {
        let fx = fixture();
        let snapshot = stocked(&fx);
        let book = fx.ledger.snapshots();
        assert_eq!(
            book.complete(snapshot.id, ADMIN, &fx.credential(DOCTOR)).unwrap_err(),
            LedgerError::Authorization(AuthorizationError::SameActorWitness)
        );
        let done = book.complete(snapshot.id, DOCTOR, &fx.credential(TECH)).unwrap();
        assert_eq!(done.witnessed_by, Some(TECH));
        assert!(done.is_complete());

        let line = book.lines(snapshot.id).unwrap()[0].clone();
        let update = LineUpdate {
            quantity_counted: q(1),
            method: CountMethod::Exact,
            container_opened: None,
        };
        assert_eq!(
            book.update_line(line.id, DOCTOR, update).unwrap_err(),
            LedgerError::Conflict(ConflictError::SnapshotFinalized)
        );
        assert_eq!(
            book.complete(snapshot.id, DOCTOR, &fx.credential(TECH)).unwrap_err(),
            LedgerError::Conflict(ConflictError::SnapshotFinalized)
        );
        assert_eq!(book.snapshots().unwrap().len(), 1);
    }
}
