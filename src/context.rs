//! Shared plumbing for ledger operations and the [`Countersign`] entry point.

use crate::audit::AuditTrail;
use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerSettings;
use crate::counts::CountEngine;
use crate::error::{EntityKind, LedgerError};
use crate::identity::{self, IdentityStore, VerifiedWitness, WitnessCredential};
use crate::ledger::LotLedger;
use crate::model::{MedicationId, MedicationInfo, Operator, OperatorId};
use crate::patient_stock::PatientStockLedger;
use crate::reversal::Reversals;
use crate::snapshot::SnapshotBook;
use crate::store::{LedgerStore, UnitOfWork};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Identity and time of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitScope {
    /// Shared by every audit row the operation writes
    pub unit_id: Uuid,
    /// Truncated to microseconds, the precision PostgreSQL stores
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
}

impl UnitScope {
    pub fn begin(clock: &dyn Clock) -> Self {
        let now = clock.now().trunc_subsecs(6);
        Self {
            unit_id: Uuid::new_v4(),
            now,
            today: clock.today(),
        }
    }
}

pub struct LedgerContext<S> {
    pub(crate) store: S,
    pub(crate) identity: Arc<dyn IdentityStore>,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: LedgerSettings,
}

impl<S: LedgerStore> LedgerContext<S> {
    /// Runs one named operation: span, timing, rejection accounting.
    ///
    /// `body` performs any pre-unit checks (witness verification) and then opens the
    /// unit of work itself through [`LedgerContext::atomically`].
    pub(crate) fn perform<T>(
        &self,
        operation: &'static str,
        body: impl FnOnce(&UnitScope) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::ledger_operation_span(operation).entered();
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let scope = UnitScope::begin(self.clock.as_ref());
        let result = body(&scope);

        #[cfg(feature = "metrics")]
        METRICS.record_unit(operation, started.elapsed());
        if let Err(e) = &result {
            #[cfg(feature = "metrics")]
            METRICS.record_rejection(operation, e.kind());
            log::warn!("{operation} rejected: {e}");
        }
        result
    }

    pub(crate) fn atomically<T>(
        &self,
        work: impl FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        self.store.atomically(work)
    }

    /// Read-only unit
    pub(crate) fn read<T>(
        &self,
        work: impl FnMut(&mut dyn UnitOfWork) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        self.store.atomically(work)
    }

    pub(crate) fn actor(&self, id: OperatorId) -> Result<Operator, LedgerError> {
        identity::actor(self.identity.as_ref(), id)
    }

    pub(crate) fn witness(
        &self,
        actor: OperatorId,
        credential: &WitnessCredential,
        scope: &UnitScope,
    ) -> Result<VerifiedWitness, LedgerError> {
        identity::verify(self.identity.as_ref(), actor, credential, scope.now)
    }

    pub(crate) fn required_witness(
        &self,
        actor: OperatorId,
        credential: Option<&WitnessCredential>,
        scope: &UnitScope,
    ) -> Result<VerifiedWitness, LedgerError> {
        identity::require(self.identity.as_ref(), actor, credential, scope.now)
    }

    pub(crate) fn optional_witness(
        &self,
        actor: OperatorId,
        credential: Option<&WitnessCredential>,
        scope: &UnitScope,
    ) -> Result<Option<VerifiedWitness>, LedgerError> {
        credential
            .map(|credential| self.witness(actor, credential, scope))
            .transpose()
    }

    pub(crate) fn medication(&self, id: MedicationId) -> Result<MedicationInfo, LedgerError> {
        self.catalog
            .medication(id)?
            .ok_or_else(|| LedgerError::not_found(EntityKind::Medication, id))
    }
}

/// Entry point: one store, one identity store, one catalog.
///
/// Component views ([`Countersign::lots`], [`Countersign::counts`], ...) borrow the
/// shared context and are cheap to create per call.
pub struct Countersign<S> {
    ctx: LedgerContext<S>,
}

impl<S: LedgerStore> Countersign<S> {
    pub fn new(
        store: S,
        identity: Arc<dyn IdentityStore>,
        catalog: Arc<dyn Catalog>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            ctx: LedgerContext {
                store,
                identity,
                catalog,
                clock: Arc::new(SystemClock),
                settings,
            },
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ctx.clock = clock;
        self
    }

    pub fn lots(&self) -> LotLedger<'_, S> {
        LotLedger::new(&self.ctx)
    }

    pub fn reversals(&self) -> Reversals<'_, S> {
        Reversals::new(&self.ctx)
    }

    pub fn counts(&self) -> CountEngine<'_, S> {
        CountEngine::new(&self.ctx)
    }

    pub fn patient_stock(&self) -> PatientStockLedger<'_, S> {
        PatientStockLedger::new(&self.ctx)
    }

    pub fn snapshots(&self) -> SnapshotBook<'_, S> {
        SnapshotBook::new(&self.ctx)
    }

    pub fn audit(&self) -> AuditTrail<'_, S> {
        AuditTrail::new(&self.ctx)
    }

    pub fn store(&self) -> &S {
        &self.ctx.store
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.ctx.settings
    }
}
