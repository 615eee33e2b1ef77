//! Error taxonomy for the ledger.
//!
//! Every public operation returns [`LedgerError`]. The five top-level variants mirror
//! how a caller is expected to react: fix the input (`Validation`), get a different
//! person involved (`Authorization`), re-read state and try something else
//! (`Conflict`), or give up (`NotFound`, `Storage`).
//!
//! `Display` carries the full diagnostic for logs. [`LedgerError::user_message`] is the
//! operator-facing text and never includes internal identifiers.

use crate::model::Role;
use std::fmt;

/// Top-level ledger error
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Bad input shape or range
    Validation(ValidationError),
    /// Witness, role, or dual-control rule violated
    Authorization(AuthorizationError),
    /// The request is well-formed but the current state forbids it
    Conflict(ConflictError),
    /// A referenced record does not exist
    NotFound(NotFoundError),
    /// The persistence layer failed
    Storage(StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    NonPositiveQuantity,
    NegativeQuantity,
    ExcessPrecision { scale: u32 },
    /// Quantity or resulting balance reaches the storable bound
    QuantityTooLarge,
    ReasonRequired,
    MissingField(&'static str),
    InvalidLotNumber(String),
    /// Medication is inactive in the catalog or tracked per patient only
    MedicationUnavailable(String),
    EstimateNotPermitted(EstimateRefusal),
    EmptySelection,
    /// Source lot holds a different medication than the one requested
    LotMedicationMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateRefusal {
    ScheduleII,
    UnopenedContainer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationError {
    InvalidCredential,
    SameActorWitness,
    InactiveWitness,
    WitnessRequired,
    UnknownActor,
    InactiveActor,
    ResolverIsCounter,
    VerifierIsCounter,
    ReviewerIsCompleter,
    RoleRequired(Role),
    PrescriberRequired,
    PrescriberNotAuthorized(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictError {
    InsufficientQuantity { available: String, requested: String },
    AlreadyVoided,
    NotVoidable(String),
    Inactive,
    Expired,
    Quarantined,
    AlreadyQuarantined,
    NotQuarantined,
    IncompleteCounts(usize),
    UnverifiedCounts(usize),
    UnresolvedDiscrepancies(usize),
    InvalidTransition { from: String, to: String },
    SessionClosed,
    AlreadyResolved,
    NoDiscrepancy,
    CountNotSubmitted,
    AlreadyVerified,
    StockRemaining,
    PatientStockClosed,
    SnapshotFinalized,
    SessionHasAdjustments,
    /// Concurrent writers collided; the unit may be retried
    Contention,
    RetryExhausted(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Lot,
    Transaction,
    Count,
    Session,
    PatientStock,
    Snapshot,
    SnapshotLine,
    Medication,
    Operator,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Lot => "lot",
            EntityKind::Transaction => "transaction",
            EntityKind::Count => "count",
            EntityKind::Session => "count_session",
            EntityKind::PatientStock => "patient_stock",
            EntityKind::Snapshot => "snapshot",
            EntityKind::SnapshotLine => "snapshot_line",
            EntityKind::Medication => "medication",
            EntityKind::Operator => "operator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFoundError {
    pub entity: EntityKind,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Database driver error
    Database(String),
    /// Row could not be decoded into a record
    Decode(String),
    /// No pooled connection became available in time
    PoolTimeout,
    /// Connection could not be established
    Connection(String),
    /// A lock guarding in-process state was poisoned
    Poisoned,
    /// Schema installation failed
    Schema(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Validation(e) => write!(f, "Validation error: {e}"),
            LedgerError::Authorization(e) => write!(f, "Authorization error: {e}"),
            LedgerError::Conflict(e) => write!(f, "Conflict: {e}"),
            LedgerError::NotFound(e) => write!(f, "Not found: {e}"),
            LedgerError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NonPositiveQuantity => write!(f, "quantity must be greater than zero"),
            ValidationError::NegativeQuantity => write!(f, "quantity cannot be negative"),
            ValidationError::ExcessPrecision { scale } => {
                write!(f, "quantity has more than {scale} decimal places")
            }
            ValidationError::QuantityTooLarge => {
                write!(f, "quantity exceeds the largest storable amount")
            }
            ValidationError::ReasonRequired => write!(f, "a reason is required"),
            ValidationError::MissingField(field) => write!(f, "{field} is required"),
            ValidationError::InvalidLotNumber(lot) => write!(f, "invalid lot number {lot:?}"),
            ValidationError::MedicationUnavailable(why) => {
                write!(f, "medication cannot be stocked: {why}")
            }
            ValidationError::EstimateNotPermitted(EstimateRefusal::ScheduleII) => {
                write!(f, "Schedule II quantities must be counted exactly")
            }
            ValidationError::EstimateNotPermitted(EstimateRefusal::UnopenedContainer) => {
                write!(f, "unopened containers must be counted exactly")
            }
            ValidationError::EmptySelection => write!(f, "no items were selected"),
            ValidationError::LotMedicationMismatch => {
                write!(f, "source lot holds a different medication")
            }
        }
    }
}

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorizationError::InvalidCredential => write!(f, "witness credential check failed"),
            AuthorizationError::SameActorWitness => write!(f, "witness is the acting operator"),
            AuthorizationError::InactiveWitness => write!(f, "witness account is deactivated"),
            AuthorizationError::WitnessRequired => write!(f, "a verified witness is required"),
            AuthorizationError::UnknownActor => write!(f, "acting operator is not known"),
            AuthorizationError::InactiveActor => write!(f, "acting operator is deactivated"),
            AuthorizationError::ResolverIsCounter => {
                write!(f, "discrepancy resolver is the original counter")
            }
            AuthorizationError::VerifierIsCounter => write!(f, "count verifier is the original counter"),
            AuthorizationError::ReviewerIsCompleter => {
                write!(f, "session reviewer is the operator who completed it")
            }
            AuthorizationError::RoleRequired(role) => write!(f, "role {} required", role.as_str()),
            AuthorizationError::PrescriberRequired => {
                write!(f, "a prescriber is required for Schedule II dispensing")
            }
            AuthorizationError::PrescriberNotAuthorized(why) => {
                write!(f, "prescriber not authorized: {why}")
            }
        }
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictError::InsufficientQuantity { available, requested } => {
                write!(f, "insufficient quantity: requested {requested}, available {available}")
            }
            ConflictError::AlreadyVoided => write!(f, "transaction is already voided"),
            ConflictError::NotVoidable(kind) => write!(f, "{kind} transactions cannot be voided"),
            ConflictError::Inactive => write!(f, "record is deactivated"),
            ConflictError::Expired => write!(f, "lot is expired"),
            ConflictError::Quarantined => write!(f, "lot is quarantined"),
            ConflictError::AlreadyQuarantined => write!(f, "lot is already quarantined"),
            ConflictError::NotQuarantined => write!(f, "lot is not quarantined"),
            ConflictError::IncompleteCounts(n) => write!(f, "{n} counts have no actual quantity"),
            ConflictError::UnverifiedCounts(n) => write!(f, "{n} counts have no verifier"),
            ConflictError::UnresolvedDiscrepancies(n) => {
                write!(f, "{n} discrepancies are still unresolved")
            }
            ConflictError::InvalidTransition { from, to } => {
                write!(f, "cannot move session from {from} to {to}")
            }
            ConflictError::SessionClosed => write!(f, "count session is no longer in progress"),
            ConflictError::AlreadyResolved => write!(f, "discrepancy is already resolved"),
            ConflictError::NoDiscrepancy => write!(f, "count has no discrepancy"),
            ConflictError::CountNotSubmitted => write!(f, "count has not been submitted"),
            ConflictError::AlreadyVerified => write!(f, "count is already verified"),
            ConflictError::StockRemaining => write!(f, "stock remains on hand"),
            ConflictError::PatientStockClosed => write!(f, "patient stock is no longer active"),
            ConflictError::SnapshotFinalized => write!(f, "snapshot is already completed"),
            ConflictError::SessionHasAdjustments => {
                write!(f, "session resolutions already adjusted the ledger")
            }
            ConflictError::Contention => write!(f, "concurrent update detected"),
            ConflictError::RetryExhausted(n) => {
                write!(f, "concurrent update persisted after {n} retries")
            }
        }
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity.as_str(), self.id)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Database(s) => write!(f, "database error: {s}"),
            StorageError::Decode(s) => write!(f, "decode error: {s}"),
            StorageError::PoolTimeout => write!(f, "timed out waiting for a pooled connection"),
            StorageError::Connection(s) => write!(f, "connection error: {s}"),
            StorageError::Poisoned => write!(f, "in-process store lock poisoned"),
            StorageError::Schema(s) => write!(f, "schema error: {s}"),
        }
    }
}

impl std::error::Error for LedgerError {}
impl std::error::Error for ValidationError {}
impl std::error::Error for AuthorizationError {}
impl std::error::Error for ConflictError {}
impl std::error::Error for NotFoundError {}
impl std::error::Error for StorageError {}

impl From<ValidationError> for LedgerError {
    fn from(err: ValidationError) -> Self {
        LedgerError::Validation(err)
    }
}

impl From<AuthorizationError> for LedgerError {
    fn from(err: AuthorizationError) -> Self {
        LedgerError::Authorization(err)
    }
}

impl From<ConflictError> for LedgerError {
    fn from(err: ConflictError) -> Self {
        LedgerError::Conflict(err)
    }
}

impl From<NotFoundError> for LedgerError {
    fn from(err: NotFoundError) -> Self {
        LedgerError::NotFound(err)
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        LedgerError::Storage(err)
    }
}

impl LedgerError {
    pub fn not_found(entity: EntityKind, id: impl Into<i64>) -> Self {
        LedgerError::NotFound(NotFoundError {
            entity,
            id: id.into(),
        })
    }

    /// Whether the failed unit may be re-run from scratch
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(ConflictError::Contention))
    }

    /// Short name used as a metrics/log label
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::Authorization(_) => "authorization",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Storage(_) => "storage",
        }
    }

    /// Message safe to show the acting operator
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::Validation(ValidationError::NonPositiveQuantity) => {
                "Quantity must be greater than zero.".to_string()
            }
            LedgerError::Validation(ValidationError::NegativeQuantity) => {
                "Quantity cannot be negative.".to_string()
            }
            LedgerError::Validation(ValidationError::ExcessPrecision { scale }) => {
                format!("Quantity may have at most {scale} decimal places.")
            }
            LedgerError::Validation(ValidationError::QuantityTooLarge) => {
                "Quantity is too large.".to_string()
            }
            LedgerError::Validation(ValidationError::ReasonRequired) => {
                "A reason is required.".to_string()
            }
            LedgerError::Validation(ValidationError::MissingField(field)) => {
                format!("The {} field is required.", field.replace('_', " "))
            }
            LedgerError::Validation(ValidationError::InvalidLotNumber(_)) => {
                "Lot number is not valid.".to_string()
            }
            LedgerError::Validation(ValidationError::MedicationUnavailable(_)) => {
                "This medication cannot be received into lot inventory.".to_string()
            }
            LedgerError::Validation(ValidationError::EstimateNotPermitted(_)) => {
                "This item must be counted exactly.".to_string()
            }
            LedgerError::Validation(ValidationError::EmptySelection) => {
                "Select at least one item.".to_string()
            }
            LedgerError::Validation(ValidationError::LotMedicationMismatch) => {
                "The selected lot is for a different medication.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::InvalidCredential) => {
                "Invalid witness credentials.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::SameActorWitness) => {
                "Witness must be a different user.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::InactiveWitness) => {
                "Witness account is not active.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::WitnessRequired) => {
                "Witness required.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::UnknownActor)
            | LedgerError::Authorization(AuthorizationError::InactiveActor) => {
                "Your account cannot perform this action.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::ResolverIsCounter) => {
                "A discrepancy must be resolved by someone other than the counter.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::VerifierIsCounter) => {
                "Cannot verify your own count.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::ReviewerIsCompleter) => {
                "Cannot review an inventory you completed.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::RoleRequired(role)) => {
                format!("This action requires the {} role.", role.as_str())
            }
            LedgerError::Authorization(AuthorizationError::PrescriberRequired) => {
                "A prescriber is required for Schedule II medications.".to_string()
            }
            LedgerError::Authorization(AuthorizationError::PrescriberNotAuthorized(why)) => {
                format!("Prescriber is not authorized: {why}.")
            }
            LedgerError::Conflict(ConflictError::InsufficientQuantity { available, .. }) => {
                format!("Insufficient quantity. Only {available} available.")
            }
            LedgerError::Conflict(ConflictError::AlreadyVoided) => {
                "This transaction has already been voided.".to_string()
            }
            LedgerError::Conflict(ConflictError::NotVoidable(_)) => {
                "This type of transaction cannot be voided.".to_string()
            }
            LedgerError::Conflict(ConflictError::Inactive) => {
                "This item is no longer active.".to_string()
            }
            LedgerError::Conflict(ConflictError::Expired) => {
                "Cannot dispense from an expired lot.".to_string()
            }
            LedgerError::Conflict(ConflictError::Quarantined) => {
                "Cannot dispense from a quarantined lot.".to_string()
            }
            LedgerError::Conflict(ConflictError::IncompleteCounts(n)) => {
                format!("Cannot complete inventory: {n} items not yet counted.")
            }
            LedgerError::Conflict(ConflictError::UnverifiedCounts(n)) => {
                format!("Cannot complete inventory: {n} items not yet verified.")
            }
            LedgerError::Conflict(ConflictError::Contention)
            | LedgerError::Conflict(ConflictError::RetryExhausted(_)) => {
                "The item was being changed by someone else. Please try again.".to_string()
            }
            LedgerError::Conflict(other) => {
                let mut message = other.to_string();
                if let Some(first) = message.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                message.push('.');
                message
            }
            LedgerError::NotFound(e) => {
                format!("The requested {} was not found.", e.entity.as_str().replace('_', " "))
            }
            LedgerError::Storage(_) => {
                "The inventory store is unavailable. No changes were made.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_identifiers() {
        let err = LedgerError::not_found(EntityKind::Lot, 4812);
        assert!(err.to_string().contains("4812"));
        assert!(!err.user_message().contains("4812"));
        assert_eq!(err.user_message(), "The requested lot was not found.");
    }

    #[test]
    fn test_insufficient_quantity_message() {
        let err = LedgerError::Conflict(ConflictError::InsufficientQuantity {
            available: "70".to_string(),
            requested: "80".to_string(),
        });
        assert_eq!(err.user_message(), "Insufficient quantity. Only 70 available.");
        assert!(err.to_string().contains("requested 80"));
    }

    #[test]
    fn test_only_contention_is_retryable() {
        assert!(LedgerError::Conflict(ConflictError::Contention).is_retryable());
        assert!(!LedgerError::Conflict(ConflictError::RetryExhausted(3)).is_retryable());
        assert!(!LedgerError::Conflict(ConflictError::AlreadyVoided).is_retryable());
        assert!(!LedgerError::Storage(StorageError::PoolTimeout).is_retryable());
    }

    #[test]
    fn test_generic_conflict_message_is_sentence() {
        let err = LedgerError::Conflict(ConflictError::SessionClosed);
        assert_eq!(err.user_message(), "Count session is no longer in progress.");
    }

    #[test]
    fn test_already_quarantined_message() {
        let err = LedgerError::Conflict(ConflictError::AlreadyQuarantined);
        assert_eq!(err.user_message(), "Lot is already quarantined.");
    }

    #[test]
    fn test_missing_field_message() {
        let err = LedgerError::Validation(ValidationError::MissingField("lot_number"));
        assert_eq!(err.user_message(), "The lot number field is required.");
    }

    #[test]
    fn test_from_conversions() {
        let err: LedgerError = AuthorizationError::SameActorWitness.into();
        assert_eq!(err.kind(), "authorization");
        let err: LedgerError = StorageError::Poisoned.into();
        assert_eq!(err.kind(), "storage");
    }
}
