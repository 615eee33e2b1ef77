//! Filtered reads built with `sea-query`.
//!
//! Builders return the SQL text and its bound values; [`with_params`] turns the values
//! into `ToSql` parameters for `may_postgres`.

use super::executor::SqlError;
use super::rows::{AUDIT_COLUMNS, LOT_COLUMNS, PATIENT_STOCK_COLUMNS, SESSION_COLUMNS, TRANSACTION_COLUMNS};
use crate::model::{AuditFilter, LotFilter, PatientStockFilter, SessionFilter, TransactionFilter};
use chrono::{DateTime, NaiveDate, Utc};
use may_postgres::types::ToSql;
use rust_decimal::Decimal;
use sea_query::{
    Alias, Expr, ExprTrait, Order, PostgresQueryBuilder, Query, SelectStatement, Value, ValueType,
    Values,
};
use uuid::Uuid;

fn col(name: &'static str) -> Expr {
    Expr::col(Alias::new(name))
}

fn select(table: &'static str, columns: &'static str) -> SelectStatement {
    let mut query = Query::select();
    query.expr(Expr::cust(columns)).from(Alias::new(table));
    query
}

pub fn lots(filter: &LotFilter) -> (String, Values) {
    let mut query = select("lots", LOT_COLUMNS);
    if let Some(medication) = filter.medication_id {
        query.and_where(col("medication_id").eq(medication.get()));
    }
    if filter.active_only {
        query.and_where(col("is_active").eq(true));
    }
    if filter.with_stock_only {
        query.and_where(col("current_quantity").gt(Decimal::ZERO));
    }
    query.order_by(Alias::new("id"), Order::Asc);
    query.build(PostgresQueryBuilder)
}

pub fn transactions(filter: &TransactionFilter) -> (String, Values) {
    let mut query = select("inventory_transactions", TRANSACTION_COLUMNS);
    if let Some(lot) = filter.lot_id {
        query.and_where(col("lot_id").eq(lot.get()));
    }
    if let Some(medication) = filter.medication_id {
        query.and_where(col("medication_id").eq(medication.get()));
    }
    if let Some(patient) = filter.patient_id {
        query.and_where(col("patient_id").eq(patient.get()));
    }
    if let Some(kind) = filter.kind {
        query.and_where(col("kind").eq(kind.as_str()));
    }
    if let Some(from) = filter.from {
        query.and_where(col("occurred_at").gte(from));
    }
    if let Some(until) = filter.until {
        query.and_where(col("occurred_at").lt(until));
    }
    if !filter.include_voided {
        query.and_where(col("voided_by").is_null());
    }
    query.order_by(Alias::new("id"), Order::Asc);
    query.build(PostgresQueryBuilder)
}

pub fn patient_stocks(filter: &PatientStockFilter) -> (String, Values) {
    let mut query = select("patient_stock", PATIENT_STOCK_COLUMNS);
    if let Some(patient) = filter.patient_id {
        query.and_where(col("patient_id").eq(patient.get()));
    }
    if let Some(medication) = filter.medication_id {
        query.and_where(col("medication_id").eq(medication.get()));
    }
    if let Some(status) = filter.status {
        query.and_where(col("status").eq(status.as_str()));
    }
    if filter.with_stock_only {
        query.and_where(col("quantity_remaining").gt(Decimal::ZERO));
    }
    query.order_by(Alias::new("id"), Order::Asc);
    query.build(PostgresQueryBuilder)
}

pub fn sessions(filter: &SessionFilter) -> (String, Values) {
    let mut query = select("count_sessions", SESSION_COLUMNS);
    if let Some(kind) = filter.kind {
        query.and_where(col("kind").eq(kind.as_str()));
    }
    if let Some(status) = filter.status {
        query.and_where(col("status").eq(status.as_str()));
    }
    if let Some(from) = filter.from {
        query.and_where(col("session_date").gte(from));
    }
    if let Some(until) = filter.until {
        query.and_where(col("session_date").lte(until));
    }
    query
        .order_by(Alias::new("session_date"), Order::Desc)
        .order_by(Alias::new("id"), Order::Desc);
    query.build(PostgresQueryBuilder)
}

pub fn audit_entries(filter: &AuditFilter) -> (String, Values) {
    let mut query = select("audit_log", AUDIT_COLUMNS);
    if let Some(actor) = filter.actor {
        query.and_where(col("actor").eq(actor.get()));
    }
    if let Some(entity_type) = &filter.entity_type {
        query.and_where(col("entity_type").eq(entity_type.as_str()));
    }
    if let Some(entity_id) = filter.entity_id {
        query.and_where(col("entity_id").eq(entity_id));
    }
    if let Some(action) = &filter.action {
        query.and_where(col("action").eq(action.as_str()));
    }
    if let Some(from) = filter.from {
        query.and_where(col("occurred_at").gte(from));
    }
    if let Some(until) = filter.until {
        query.and_where(col("occurred_at").lt(until));
    }
    query.order_by(Alias::new("id"), Order::Asc);
    query.build(PostgresQueryBuilder)
}

fn convert<T>(value: &Value) -> Result<Box<dyn ToSql>, SqlError>
where
    Option<T>: ValueType + ToSql + 'static,
{
    <Option<T> as ValueType>::try_from(value.clone())
        .map(|v| Box::new(v) as Box<dyn ToSql>)
        .map_err(|_| SqlError::Build(format!("cannot bind {value:?}")))
}

fn to_param(value: &Value) -> Result<Box<dyn ToSql>, SqlError> {
    match value {
        Value::Bool(_) => convert::<bool>(value),
        Value::BigInt(_) => convert::<i64>(value),
        Value::String(_) => convert::<String>(value),
        Value::Decimal(_) => convert::<Decimal>(value),
        Value::ChronoDate(_) => convert::<NaiveDate>(value),
        Value::ChronoDateTimeUtc(_) => convert::<DateTime<Utc>>(value),
        Value::Uuid(_) => convert::<Uuid>(value),
        other => Err(SqlError::Build(format!("unsupported parameter {other:?}"))),
    }
}

/// Converts `values` to parameters and hands them to `f` in placeholder order
pub fn with_params<R>(
    values: &Values,
    f: impl FnOnce(&[&dyn ToSql]) -> Result<R, SqlError>,
) -> Result<R, SqlError> {
    let owned = values
        .0
        .iter()
        .map(to_param)
        .collect::<Result<Vec<_>, _>>()?;
    let params: Vec<&dyn ToSql> = owned.iter().map(|p| p.as_ref()).collect();
    f(&params)
}
