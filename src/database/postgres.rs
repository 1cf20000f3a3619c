use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde_json::Value;
use sqlx::{
    postgres::{PgPool, PgRow},
    Column, Row, TypeInfo, ValueRef,
};
use uuid::Uuid;

use super::{float_value, ColumnInfo, DatabaseError, RowSet, SqlRow};

pub(super) async fn list_tables(pool: &PgPool) -> Result<Vec<String>, DatabaseError> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = current_schema() \
           AND table_type IN ('BASE TABLE', 'VIEW') \
         ORDER BY table_name",
    )
    .fetch_all(pool)
    .await?;
    Ok(names)
}

pub(super) async fn table_columns(
    pool: &PgPool,
    table: &str,
) -> Result<Vec<ColumnInfo>, DatabaseError> {
    let rows = sqlx::query_as::<_, (String, String, bool)>(
        "SELECT column_name::text, data_type::text, (is_nullable = 'YES') \
         FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1 \
         ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, data_type, nullable)| ColumnInfo {
            name,
            data_type,
            nullable: Some(nullable),
        })
        .collect())
}

pub(super) async fn fetch_rows(
    pool: &PgPool,
    sql: &str,
    limit: usize,
) -> Result<RowSet, DatabaseError> {
    let mut stream = sqlx::query(sql).persistent(false).fetch(pool);
    let mut set = RowSet::default();
    while let Some(row) = stream.try_next().await? {
        if set.columns.is_empty() {
            set.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }
        if set.rows.len() >= limit {
            break;
        }
        set.rows.push(decode_row(&row)?);
    }
    Ok(set)
}

fn decode_row(row: &PgRow) -> Result<SqlRow, DatabaseError> {
    let mut out = SqlRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, i, column.type_info().name())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_value(row: &PgRow, i: usize, type_name: &str) -> Result<Value, DatabaseError> {
    let value = match type_name {
        "INT2" => row.try_get::<Option<i16>, _>(i)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(i)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(i)?.map(Value::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(i)?
            .map(|v| float_value(f64::from(v))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(i)?.map(float_value),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(i)?
            .map(|d| d.to_f64().map(float_value).unwrap_or_else(|| Value::String(d.to_string()))),
        "BOOL" => row.try_get::<Option<bool>, _>(i)?.map(Value::Bool),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => {
            row.try_get::<Option<String>, _>(i)?.map(Value::String)
        }
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i)?,
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(i)?
            .map(|d| Value::String(d.to_string())),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(i)?
            .map(|t| Value::String(t.to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(i)?
            .map(|t| Value::String(t.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(i)?
            .map(|t| Value::String(t.to_rfc3339())),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(i)?
            .map(|u| Value::String(u.to_string())),
        _ if row.try_get_raw(i)?.is_null() => None,
        other => Some(Value::String(format!("<{other}>"))),
    };
    Ok(value.unwrap_or(Value::Null))
}
