use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo};
use tracing::warn;

// 按数据库原生类型名把单元格转成 JSON。NUMERIC/DECIMAL 统一转 f64，
// 聚合结果 (AVG/SUM) 在两种数据库上多半是这个类型。

fn decimal_to_json(v: Option<Decimal>) -> Value {
    json!(v.map(|d| d.to_f64().unwrap_or(0.0)))
}

/// 解码失败按 NULL 处理，但要留下列名和类型
fn decoded<T>(column: &str, sql_type: &str, result: Result<Option<T>, sqlx::Error>) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(error) => {
            warn!(column, sql_type, %error, "单元格解码失败，按 NULL 处理");
            None
        }
    }
}

fn cell<'r, R, T>(row: &'r R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    Option<T>: Decode<'r, R::Database> + Type<R::Database>,
{
    let column = &row.columns()[idx];
    decoded(column.name(), column.type_info().name(), row.try_get::<Option<T>, _>(idx))
}

pub fn pg_cell(row: &PgRow, idx: usize) -> Value {
    match row.columns()[idx].type_info().name() {
        "INT2" => json!(cell::<_, i16>(row, idx)),
        "INT4" => json!(cell::<_, i32>(row, idx)),
        "INT8" => json!(cell::<_, i64>(row, idx)),
        "FLOAT4" => json!(cell::<_, f32>(row, idx)),
        "FLOAT8" => json!(cell::<_, f64>(row, idx)),
        "NUMERIC" => decimal_to_json(cell(row, idx)),
        "BOOL" => json!(cell::<_, bool>(row, idx)),
        "DATE" => json!(cell::<_, NaiveDate>(row, idx).map(|d| d.to_string())),
        "TIMESTAMP" => json!(cell::<_, NaiveDateTime>(row, idx).map(|dt| dt.to_string())),
        "TIMESTAMPTZ" => json!(cell::<_, DateTime<Utc>>(row, idx).map(|dt| dt.naive_utc().to_string())),
        "JSON" | "JSONB" => cell::<_, Value>(row, idx).unwrap_or(Value::Null),
        // TEXT / VARCHAR / BPCHAR / NAME 以及未知类型都按字符串取
        _ => json!(cell::<_, String>(row, idx)),
    }
}

pub fn mysql_cell(row: &MySqlRow, idx: usize) -> Value {
    match row.columns()[idx].type_info().name() {
        "TINYINT" | "SMALLINT" | "INT" | "MEDIUMINT" | "BIGINT" => json!(cell::<_, i64>(row, idx)),
        // BIT_AND / BIT_OR / BIT_XOR 返回 BIGINT UNSIGNED
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "INT UNSIGNED" | "MEDIUMINT UNSIGNED"
        | "BIGINT UNSIGNED" => json!(cell::<_, u64>(row, idx)),
        "FLOAT" => json!(cell::<_, f32>(row, idx)),
        "DOUBLE" => json!(cell::<_, f64>(row, idx)),
        "DECIMAL" | "NEWDECIMAL" => decimal_to_json(cell(row, idx)),
        "BOOLEAN" => json!(cell::<_, bool>(row, idx)),
        "DATE" => json!(cell::<_, NaiveDate>(row, idx).map(|d| d.to_string())),
        "DATETIME" | "TIMESTAMP" => json!(cell::<_, NaiveDateTime>(row, idx).map(|dt| dt.to_string())),
        _ => json!(cell::<_, String>(row, idx)),
    }
}

pub fn pg_row_values(row: &PgRow) -> Vec<Value> {
    (0..row.columns().len()).map(|i| pg_cell(row, i)).collect()
}

pub fn pg_row_record(row: &PgRow) -> Map<String, Value> {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), pg_cell(row, col.ordinal())))
        .collect()
}

pub fn mysql_row_values(row: &MySqlRow) -> Vec<Value> {
    (0..row.columns().len()).map(|i| mysql_cell(row, i)).collect()
}

pub fn mysql_row_record(row: &MySqlRow) -> Map<String, Value> {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), mysql_cell(row, col.ordinal())))
        .collect()
}

/// 解析 HTTP 参数或数据库返回的时间文本；只有日期时取当天零点
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches(" UTC");
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// 单元格的文本形式 (分组键展示、与 HTTP 参数比较)
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
