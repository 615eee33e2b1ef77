//! Witness verification.
//!
//! A witness co-signs a sensitive action by presenting their own credential. The check is
//! a pure read of the identity store and runs before any unit of work is opened, so a
//! refused witness never leaves ledger state behind. Nothing is cached between calls.

use crate::error::{AuthorizationError, LedgerError};
use crate::model::{Operator, OperatorId, Role};
use chrono::{DateTime, Utc};
use std::fmt;

/// Identity and credential lookups owned by the surrounding application
pub trait IdentityStore: Send + Sync {
    fn operator(&self, id: OperatorId) -> Result<Option<Operator>, LedgerError>;

    fn check_password(&self, id: OperatorId, secret: &str) -> Result<bool, LedgerError>;
}

/// Second person's id and the secret they typed
#[derive(Clone)]
pub struct WitnessCredential {
    pub witness: OperatorId,
    pub secret: String,
}

impl WitnessCredential {
    pub fn new(witness: OperatorId, secret: impl Into<String>) -> Self {
        Self {
            witness,
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for WitnessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WitnessCredential")
            .field("witness", &self.witness)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Proof that a witness passed verification at `verified_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedWitness {
    pub operator: Operator,
    pub verified_at: DateTime<Utc>,
}

impl VerifiedWitness {
    pub fn id(&self) -> OperatorId {
        self.operator.id
    }
}

/// Checks `credential` on behalf of `actor`.
///
/// Fails with `InvalidCredential` for an unknown witness or a wrong secret,
/// `SameActorWitness` when the witness is the actor, and `InactiveWitness` when the
/// witness account is deactivated.
pub fn verify(
    identity: &dyn IdentityStore,
    actor: OperatorId,
    credential: &WitnessCredential,
    now: DateTime<Utc>,
) -> Result<VerifiedWitness, LedgerError> {
    let witness = check_credential(identity, credential)?;
    if witness.id == actor {
        return Err(AuthorizationError::SameActorWitness.into());
    }
    if !witness.is_active {
        return Err(AuthorizationError::InactiveWitness.into());
    }
    Ok(VerifiedWitness {
        operator: witness,
        verified_at: now,
    })
}

/// Verifies a credential with no acting operator to compare against.
///
/// Used where the person presenting the credential is the actor, as in bulk count
/// verification.
pub fn authenticate(
    identity: &dyn IdentityStore,
    credential: &WitnessCredential,
    now: DateTime<Utc>,
) -> Result<VerifiedWitness, LedgerError> {
    let operator = check_credential(identity, credential)?;
    if !operator.is_active {
        return Err(AuthorizationError::InactiveWitness.into());
    }
    Ok(VerifiedWitness {
        operator,
        verified_at: now,
    })
}

fn check_credential(
    identity: &dyn IdentityStore,
    credential: &WitnessCredential,
) -> Result<Operator, LedgerError> {
    let Some(operator) = identity.operator(credential.witness)? else {
        return Err(AuthorizationError::InvalidCredential.into());
    };
    if !identity.check_password(operator.id, &credential.secret)? {
        return Err(AuthorizationError::InvalidCredential.into());
    }
    Ok(operator)
}

/// Like [`verify`] but a missing credential is `WitnessRequired`
pub fn require(
    identity: &dyn IdentityStore,
    actor: OperatorId,
    credential: Option<&WitnessCredential>,
    now: DateTime<Utc>,
) -> Result<VerifiedWitness, LedgerError> {
    match credential {
        Some(credential) => verify(identity, actor, credential, now),
        None => Err(AuthorizationError::WitnessRequired.into()),
    }
}

/// Loads the acting operator, refusing unknown or deactivated accounts
pub fn actor(identity: &dyn IdentityStore, id: OperatorId) -> Result<Operator, LedgerError> {
    match identity.operator(id)? {
        Some(operator) if operator.is_active => Ok(operator),
        Some(_) => Err(AuthorizationError::InactiveActor.into()),
        None => Err(AuthorizationError::UnknownActor.into()),
    }
}

pub fn require_role(operator: &Operator, role: Role) -> Result<(), LedgerError> {
    if operator.role == role {
        Ok(())
    } else {
        Err(AuthorizationError::RoleRequired(role).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::test_helpers::{at, operator};

    fn directory() -> StaticDirectory {
        let directory = StaticDirectory::new();
        directory.add_operator(operator(1, Role::Staff), "alpha");
        directory.add_operator(operator(2, Role::Staff), "bravo");
        let mut retired = operator(3, Role::Staff);
        retired.is_active = false;
        directory.add_operator(retired, "charlie");
        directory
    }

    #[test]
    fn test_verify_accepts_distinct_active_witness() {
        let directory = directory();
        let witness = verify(
            &directory,
            OperatorId(1),
            &WitnessCredential::new(OperatorId(2), "bravo"),
            at(2024, 3, 1),
        )
        .unwrap();
        assert_eq!(witness.id(), OperatorId(2));
        assert_eq!(witness.verified_at, at(2024, 3, 1));
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_unknown_witness() {
        let directory = directory();
        let wrong = WitnessCredential::new(OperatorId(2), "nope");
        let unknown = WitnessCredential::new(OperatorId(99), "bravo");
        for credential in [wrong, unknown] {
            let err = verify(&directory, OperatorId(1), &credential, at(2024, 3, 1)).unwrap_err();
            assert_eq!(err, AuthorizationError::InvalidCredential.into());
        }
    }

    #[test]
    fn test_verify_rejects_self_witness() {
        let directory = directory();
        let err = verify(
            &directory,
            OperatorId(1),
            &WitnessCredential::new(OperatorId(1), "alpha"),
            at(2024, 3, 1),
        )
        .unwrap_err();
        assert_eq!(err, AuthorizationError::SameActorWitness.into());
    }

    #[test]
    fn test_verify_rejects_inactive_witness() {
        let directory = directory();
        let err = verify(
            &directory,
            OperatorId(1),
            &WitnessCredential::new(OperatorId(3), "charlie"),
            at(2024, 3, 1),
        )
        .unwrap_err();
        assert_eq!(err, AuthorizationError::InactiveWitness.into());
    }

    #[test]
    fn test_require_without_credential() {
        let directory = directory();
        let err = require(&directory, OperatorId(1), None, at(2024, 3, 1)).unwrap_err();
        assert_eq!(err, AuthorizationError::WitnessRequired.into());
    }

    #[test]
    fn test_authenticate_checks_secret_and_activity() {
        let directory = directory();
        let ok = authenticate(&directory, &WitnessCredential::new(OperatorId(1), "alpha"), at(2024, 3, 1));
        assert_eq!(ok.unwrap().id(), OperatorId(1));
        let wrong = authenticate(&directory, &WitnessCredential::new(OperatorId(1), "x"), at(2024, 3, 1));
        assert_eq!(wrong.unwrap_err(), AuthorizationError::InvalidCredential.into());
        let retired = authenticate(&directory, &WitnessCredential::new(OperatorId(3), "charlie"), at(2024, 3, 1));
        assert_eq!(retired.unwrap_err(), AuthorizationError::InactiveWitness.into());
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let rendered = format!("{:?}", WitnessCredential::new(OperatorId(2), "bravo"));
        assert!(!rendered.contains("bravo"));
    }
}
