use axum::{
    extract::{Query, State},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::api::error::AppError;
use crate::ax_state::AppState;
use crate::infra::causal_client::DiffInDiffResult;
use crate::infra::utils::parse_datetime;
use crate::models::context::{split_multi, ComparisonParams, DiffInDiffParams};

#[derive(Debug, Serialize)]
pub struct ComparisonResponse {
    pub groups: Vec<String>,
    pub result: Vec<(Value, Value)>,
}

#[derive(Debug, Serialize)]
pub struct DiffInDiffResponse {
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub estimates: DiffInDiffResult,
}

/// # GET /api/comparison
/// 匹配对照组，并返回对照组响应变量的合并时间序列
pub async fn comparison(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ComparisonParams>,
) -> Result<Json<ComparisonResponse>, AppError> {
    let covariates = split_multi(&params.covs);
    let groups = state
        .bridge
        .get_comparisons(&params.table, &params.group_col, &params.group, &covariates)
        .await?;
    let result = state
        .bridge
        .comparison_series(&params.table, &params.group_col, &groups, &params.response_col, params.sort)
        .await?;
    Ok(Json(ComparisonResponse { groups, result }))
}

/// # GET /api/diffindiff
/// 先匹配对照组，再对目标组和对照组做双重差分
pub async fn diffindiff(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DiffInDiffParams>,
) -> Result<Json<DiffInDiffResponse>, AppError> {
    let event_date = parse_datetime(&params.event_date)
        .map(|dt| dt.date())
        .ok_or_else(|| AppError::BadRequest(format!("invalid event_date: '{}'", params.event_date)))?;
    let covariates = split_multi(&params.covs);

    let groups = state
        .bridge
        .get_comparisons(&params.table, &params.group_col, &params.group, &covariates)
        .await?;
    info!(treatment = %params.group, comparisons = ?groups, %event_date, "开始双重差分");
    let estimates = state
        .bridge
        .diffindiff(&params.table, &params.group_col, &params.group, &groups, event_date)
        .await?;
    Ok(Json(DiffInDiffResponse { groups, estimates }))
}
