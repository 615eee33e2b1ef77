//! Versioned schema installation.
//!
//! Each [`SchemaStep`] is applied once and recorded in `countersign_schema_migrations`
//! with the SHA-256 checksum of its SQL. Re-running installation verifies every recorded
//! checksum and refuses to continue when an applied step's SQL has since changed.

use super::executor::{SqlError, SqlExecutor};
use crate::error::{LedgerError, StorageError};
use sha2::{Digest, Sha256};
use std::fmt;

/// Advisory lock key serializing concurrent installers
const SCHEMA_LOCK_KEY: i64 = 0x636f_756e_7465_7201;

pub struct SchemaStep {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

impl SchemaStep {
    /// SHA-256 over the step's statements joined by newlines
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.statements.join("\n").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug)]
pub enum SchemaError {
    ChecksumMismatch {
        version: i64,
        stored: String,
        current: String,
    },
    Execution {
        version: i64,
        source: SqlError,
    },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::ChecksumMismatch {
                version,
                stored,
                current,
            } => write!(
                f,
                "Checksum mismatch for schema step {version}: stored={stored}, current={current}"
            ),
            SchemaError::Execution { version, source } => {
                write!(f, "Schema step {version} failed: {source}")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

impl From<SchemaError> for LedgerError {
    fn from(err: SchemaError) -> Self {
        LedgerError::Storage(StorageError::Schema(err.to_string()))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    pub applied: Vec<i64>,
    pub already_applied: Vec<i64>,
}

pub fn validate_checksum(version: i64, stored: &str, current: &str) -> Result<(), SchemaError> {
    if stored == current {
        Ok(())
    } else {
        Err(SchemaError::ChecksumMismatch {
            version,
            stored: stored.to_string(),
            current: current.to_string(),
        })
    }
}

const STATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS countersign_schema_migrations (
        version BIGINT PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        checksum VARCHAR(64) NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

pub const STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "lots_and_transactions",
        statements: &[
            r#"CREATE TABLE lots (
                id BIGSERIAL PRIMARY KEY,
                medication_id BIGINT NOT NULL,
                lot_number TEXT NOT NULL,
                expiration_date DATE NOT NULL,
                quantity_received NUMERIC(20, 6) NOT NULL CHECK (quantity_received > 0),
                current_quantity NUMERIC(20, 6) NOT NULL CHECK (current_quantity >= 0),
                unit TEXT NOT NULL,
                source TEXT,
                invoice_number TEXT,
                storage_location TEXT,
                received_by BIGINT NOT NULL,
                received_at TIMESTAMPTZ NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                quarantine_reason TEXT,
                quarantined_by BIGINT,
                quarantined_at TIMESTAMPTZ
            )"#,
            "CREATE INDEX idx_lots_medication ON lots (medication_id)",
            r#"CREATE TABLE inventory_transactions (
                id BIGSERIAL PRIMARY KEY,
                lot_id BIGINT NOT NULL REFERENCES lots (id),
                medication_id BIGINT NOT NULL,
                kind TEXT NOT NULL,
                quantity NUMERIC(20, 6) NOT NULL,
                balance_before NUMERIC(20, 6) NOT NULL,
                balance_after NUMERIC(20, 6) NOT NULL CHECK (balance_after >= 0),
                actor BIGINT NOT NULL,
                witness BIGINT,
                witnessed_at TIMESTAMPTZ,
                prescriber BIGINT,
                patient_id BIGINT,
                patient_name TEXT,
                patient_dob DATE,
                patient_mrn TEXT,
                prescription_number TEXT,
                reason TEXT,
                notes TEXT,
                destination TEXT,
                reverses BIGINT REFERENCES inventory_transactions (id),
                occurred_at TIMESTAMPTZ NOT NULL,
                voided_by BIGINT,
                voided_at TIMESTAMPTZ,
                void_reason TEXT,
                reversal_id BIGINT REFERENCES inventory_transactions (id)
            )"#,
            "CREATE INDEX idx_transactions_lot ON inventory_transactions (lot_id)",
            "CREATE INDEX idx_transactions_medication ON inventory_transactions (medication_id)",
            "CREATE INDEX idx_transactions_patient ON inventory_transactions (patient_id)",
        ],
    },
    SchemaStep {
        version: 2,
        name: "patient_stock",
        statements: &[
            r#"CREATE TABLE patient_stock (
                id BIGSERIAL PRIMARY KEY,
                patient_id BIGINT,
                patient_name TEXT,
                patient_dob DATE,
                patient_mrn TEXT,
                prescription_number TEXT,
                medication_id BIGINT NOT NULL,
                source_lot BIGINT REFERENCES lots (id),
                preparation_date DATE NOT NULL,
                prepared_by BIGINT NOT NULL,
                prescriber BIGINT NOT NULL,
                lot_number TEXT,
                expiration_date DATE,
                quantity_prepared NUMERIC(20, 6) NOT NULL,
                quantity_remaining NUMERIC(20, 6) NOT NULL CHECK (quantity_remaining >= 0),
                unit TEXT NOT NULL,
                status TEXT NOT NULL,
                storage_location TEXT,
                notes TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE patient_stock_logs (
                id BIGSERIAL PRIMARY KEY,
                stock_id BIGINT NOT NULL REFERENCES patient_stock (id),
                kind TEXT NOT NULL,
                quantity NUMERIC(20, 6) NOT NULL,
                quantity_before NUMERIC(20, 6) NOT NULL,
                quantity_after NUMERIC(20, 6) NOT NULL,
                actor BIGINT NOT NULL,
                witness BIGINT,
                reason TEXT,
                notes TEXT,
                occurred_at TIMESTAMPTZ NOT NULL
            )"#,
            "CREATE INDEX idx_patient_stock_logs_stock ON patient_stock_logs (stock_id)",
        ],
    },
    SchemaStep {
        version: 3,
        name: "count_sessions",
        statements: &[
            r#"CREATE TABLE count_sessions (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                session_date DATE NOT NULL,
                status TEXT NOT NULL,
                started_by BIGINT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_by BIGINT,
                completed_at TIMESTAMPTZ,
                reviewed_by BIGINT,
                reviewed_at TIMESTAMPTZ,
                notes TEXT
            )"#,
            r#"CREATE TABLE counts (
                id BIGSERIAL PRIMARY KEY,
                session_id BIGINT NOT NULL REFERENCES count_sessions (id) ON DELETE CASCADE,
                lot_id BIGINT REFERENCES lots (id),
                patient_stock_id BIGINT REFERENCES patient_stock (id),
                medication_id BIGINT NOT NULL,
                expected_quantity NUMERIC(20, 6) NOT NULL,
                actual_quantity NUMERIC(20, 6),
                counted_by BIGINT,
                counted_at TIMESTAMPTZ,
                verified_by BIGINT,
                verified_at TIMESTAMPTZ,
                notes TEXT,
                resolution_type TEXT,
                resolution_notes TEXT,
                resolved_by BIGINT,
                resolved_at TIMESTAMPTZ,
                adjustment_transaction_id BIGINT REFERENCES inventory_transactions (id),
                adjustment_log_id BIGINT REFERENCES patient_stock_logs (id),
                CHECK ((lot_id IS NULL) <> (patient_stock_id IS NULL))
            )"#,
            "CREATE INDEX idx_counts_session ON counts (session_id)",
        ],
    },
    SchemaStep {
        version: 4,
        name: "inventory_snapshots",
        statements: &[
            r#"CREATE TABLE inventory_snapshots (
                id BIGSERIAL PRIMARY KEY,
                inventory_date DATE NOT NULL,
                timing TEXT NOT NULL,
                dea_registration TEXT,
                state_registration TEXT,
                conducted_by BIGINT NOT NULL,
                witnessed_by BIGINT,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                notes TEXT
            )"#,
            r#"CREATE TABLE snapshot_lines (
                id BIGSERIAL PRIMARY KEY,
                snapshot_id BIGINT NOT NULL REFERENCES inventory_snapshots (id),
                medication_id BIGINT NOT NULL,
                lot_id BIGINT REFERENCES lots (id),
                drug_name TEXT NOT NULL,
                schedule TEXT NOT NULL,
                ndc TEXT,
                form TEXT,
                strength TEXT,
                lot_number TEXT,
                expiration_date DATE,
                container_opened BOOLEAN NOT NULL,
                quantity_counted NUMERIC(20, 6) NOT NULL CHECK (quantity_counted >= 0),
                unit TEXT NOT NULL,
                method TEXT NOT NULL
            )"#,
            "CREATE INDEX idx_snapshot_lines_snapshot ON snapshot_lines (snapshot_id)",
        ],
    },
    SchemaStep {
        version: 5,
        name: "audit_log",
        statements: &[
            r#"CREATE TABLE audit_log (
                id BIGSERIAL PRIMARY KEY,
                unit_id UUID NOT NULL,
                occurred_at TIMESTAMPTZ NOT NULL,
                actor BIGINT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id BIGINT NOT NULL,
                detail TEXT NOT NULL,
                previous_hash VARCHAR(64),
                hash VARCHAR(64) NOT NULL UNIQUE
            )"#,
            "CREATE INDEX idx_audit_log_entity ON audit_log (entity_type, entity_id)",
            "CREATE INDEX idx_audit_log_actor ON audit_log (actor)",
        ],
    },
    SchemaStep {
        version: 6,
        name: "audit_head",
        statements: &[
            r#"CREATE TABLE audit_head (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                hash VARCHAR(64)
            )"#,
            "INSERT INTO audit_head (id, hash) \
             SELECT 1, (SELECT hash FROM audit_log ORDER BY id DESC LIMIT 1)",
        ],
    },
];

/// Applies every pending step of `steps` through `executor`.
///
/// Runs inside the caller's transaction; the advisory lock is released at its end.
pub fn install(executor: &dyn SqlExecutor, steps: &[SchemaStep]) -> Result<SchemaReport, LedgerError> {
    executor.execute(STATE_TABLE, &[])?;
    executor.execute("SELECT pg_advisory_xact_lock($1)", &[&SCHEMA_LOCK_KEY])?;

    let rows = executor.query_all(
        "SELECT version, checksum FROM countersign_schema_migrations ORDER BY version",
        &[],
    )?;
    let mut recorded = Vec::with_capacity(rows.len());
    for row in &rows {
        let version: i64 = row.try_get("version").map_err(SqlError::from)?;
        let checksum: String = row.try_get("checksum").map_err(SqlError::from)?;
        recorded.push((version, checksum));
    }

    let mut report = SchemaReport::default();
    for step in steps {
        let current = step.checksum();
        if let Some((_, stored)) = recorded.iter().find(|(version, _)| *version == step.version) {
            validate_checksum(step.version, stored, &current)?;
            report.already_applied.push(step.version);
            continue;
        }

        for statement in step.statements {
            executor.execute(statement, &[]).map_err(|source| {
                if source.is_contention() {
                    LedgerError::from(source)
                } else {
                    SchemaError::Execution {
                        version: step.version,
                        source,
                    }
                    .into()
                }
            })?;
        }
        executor.execute(
            "INSERT INTO countersign_schema_migrations (version, name, checksum) VALUES ($1, $2, $3)",
            &[&step.version, &step.name, &current],
        )?;
        log::info!("applied schema step {} ({})", step.version, step.name);
        report.applied.push(step.version);
    }

    Ok(report)
}
