use axum::{
    extract::{Query, State},
    Json,
};
use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::api::error::AppError;
use crate::ax_state::AppState;
use crate::infra::utils::parse_datetime;
use crate::models::context::{
    split_multi, GroupByParams, GroupDoParams, OutlierInParams, OutlierParams, SeriesParams,
};
use crate::models::query::{GroupedResult, Outlier, UngroupedResult};
use crate::models::schema::TableRegistry;

/// 空串视为未提供；无法解析的时间直接 400
pub(crate) fn parse_bound(name: &str, raw: Option<&str>) -> Result<Option<NaiveDateTime>, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(text) => parse_datetime(text)
            .map(Some)
            .ok_or_else(|| AppError::BadRequest(format!("invalid {}: '{}'", name, text))),
    }
}

/// # GET /api
/// 已注册的表及其列声明
pub async fn list_tables(State(state): State<Arc<AppState>>) -> Json<TableRegistry> {
    Json(state.registry.as_ref().clone())
}

/// # GET /api/groupby
pub async fn groupby(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GroupByParams>,
) -> Result<Json<GroupedResult>, AppError> {
    let tstart = parse_bound("tstart", params.tstart.as_deref())?;
    let tend = parse_bound("tend", params.tend.as_deref())?;
    let result = state
        .engine
        .groupby(
            &params.table,
            &split_multi(&params.group_col),
            &split_multi(&params.response_col),
            &params.agg,
            tstart,
            tend,
        )
        .await?;
    Ok(Json(result))
}

/// # GET /api/groupdo
pub async fn groupdo(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GroupDoParams>,
) -> Result<Json<UngroupedResult>, AppError> {
    let tstart = parse_bound("tstart", params.tstart.as_deref())?;
    let tend = parse_bound("tend", params.tend.as_deref())?;
    let result = state
        .engine
        .groupdo(&params.table, &params.response_col, &split_multi(&params.aggs), tstart, tend)
        .await?;
    Ok(Json(result))
}

/// # GET /api/outliers
pub async fn outliers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OutlierParams>,
) -> Result<Json<BTreeMap<String, f64>>, AppError> {
    let tstart = parse_bound("tstart", params.tstart.as_deref())?;
    let tend = parse_bound("tend", params.tend.as_deref())?;
    let flagged = state
        .detector
        .outliers(&params.table, &params.group_col, &params.response_col, tstart, tend)
        .await?;
    info!(table = %params.table, count = flagged.len(), "离群检测完成");
    Ok(Json(flagged))
}

/// # GET /api/outlier_in
pub async fn outlier_in(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OutlierInParams>,
) -> Result<Json<Vec<Outlier>>, AppError> {
    let tstart = parse_bound("tstart", params.tstart.as_deref())?;
    let tend = parse_bound("tend", params.tend.as_deref())?;
    let response_col = params.response_col.as_deref().filter(|s| !s.is_empty());
    let flagged = state
        .detector
        .outlier_in(
            &params.table,
            &split_multi(&params.group_col),
            &params.agg,
            response_col,
            tstart,
            tend,
        )
        .await?;
    Ok(Json(flagged))
}

/// # GET /api/series
/// `group_col` 与 `group` 必须同时给出
pub async fn series(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<Vec<(Value, Value)>>, AppError> {
    let start = parse_bound("start", params.start.as_deref())?;
    let end = parse_bound("end", params.end.as_deref())?;
    let group = match (params.group_col.as_deref(), params.group.as_deref()) {
        (Some(col), Some(value)) => Some((col, value)),
        (None, None) => None,
        _ => {
            return Err(AppError::BadRequest(
                "group_col and group must be given together".to_string(),
            ))
        }
    };
    let points = state
        .engine
        .series(&params.table, &params.response_col, group, start, end, params.sort)
        .await?;
    Ok(Json(points))
}
