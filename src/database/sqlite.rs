use futures::TryStreamExt;
use serde_json::Value;
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Column, Row, TypeInfo, ValueRef,
};

use super::{float_value, ColumnInfo, DatabaseError, RowSet, SqlRow};

pub(super) async fn list_tables(pool: &SqlitePool) -> Result<Vec<String>, DatabaseError> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await?;
    Ok(names)
}

pub(super) async fn table_columns(
    pool: &SqlitePool,
    table: &str,
) -> Result<Vec<ColumnInfo>, DatabaseError> {
    let rows = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, data_type, not_null)| ColumnInfo {
            name,
            // Columns declared without a type have no affinity name.
            data_type: if data_type.is_empty() {
                "ANY".to_string()
            } else {
                data_type
            },
            nullable: Some(not_null == 0),
        })
        .collect())
}

pub(super) async fn fetch_rows(
    pool: &SqlitePool,
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

fn decode_row(row: &SqliteRow) -> Result<SqlRow, DatabaseError> {
    let mut out = SqlRow::new();
    for (i, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_value(row, i)?);
    }
    Ok(out)
}

// SQLite is dynamically typed, so the storage class of the value itself
// decides the decoding, not the declared column type.
fn decode_value(row: &SqliteRow, index: usize) -> Result<Value, DatabaseError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_info = raw.type_info();
    let value = match type_info.name() {
        "INTEGER" | "INT8" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => float_value(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
            Value::String(format!("<{} bytes>", bytes.len()))
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}
