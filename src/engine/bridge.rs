use chrono::NaiveDate;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::engine::aggregation::AggregationEngine;
use crate::engine::query_builder::{Predicate, RecordQuery};
use crate::error::TempusError;
use crate::infra::causal_client::{
    CausalService, DailyCount, DiffInDiffRequest, DiffInDiffResult, MatchRequest, RegionRef,
};
use crate::infra::utils::parse_datetime;
use crate::models::query::{GroupedResult, Record};
use crate::models::schema::ColumnRole;

/// 为外部因果推断服务准备输入、解析输出。统计方法本身不在这里。
#[derive(Clone)]
pub struct ComparisonBridge {
    engine: AggregationEngine,
    service: Arc<dyn CausalService>,
}

impl ComparisonBridge {
    pub fn new(engine: AggregationEngine, service: Arc<dyn CausalService>) -> Self {
        Self { engine, service }
    }

    /// 按协变量匹配出与 `target` 相近的对照组。
    /// 提交给服务的数据是每个分组的协变量均值，一组一条记录。
    #[instrument(skip_all, fields(table = %table, group = %group_col, treatment = %target))]
    pub async fn get_comparisons<C: AsRef<str>>(
        &self,
        table: &str,
        group_col: &str,
        target: &str,
        covariates: &[C],
    ) -> Result<Vec<String>, TempusError> {
        let descriptor = self.engine.registry().get(table)?;
        descriptor.column(group_col, ColumnRole::Groupable)?;
        for covariate in covariates {
            descriptor.column(covariate.as_ref(), ColumnRole::Covariate)?;
        }

        let grouped = self
            .engine
            .groupby(table, &[group_col], covariates, "AVG", None, None)
            .await?;
        let request = MatchRequest {
            data: matching_records(group_col, &grouped),
            treatment_col: group_col.to_string(),
            treatment_selection: target.to_string(),
            covariate_col: covariates.iter().map(|c| c.as_ref().to_string()).collect(),
        };
        let matched = self.service.match_groups(&request).await?;
        info!(matched = ?matched, "对照组匹配完成");
        Ok(matched)
    }

    /// 对照组响应变量的合并时间序列
    #[instrument(skip_all, fields(table = %table, groups = groups.len()))]
    pub async fn comparison_series<S: AsRef<str>>(
        &self,
        table: &str,
        group_col: &str,
        groups: &[S],
        response_col: &str,
        sort: bool,
    ) -> Result<Vec<(Value, Value)>, TempusError> {
        let mut combined = Vec::new();
        for group in groups {
            let series = self
                .engine
                .series(table, response_col, Some((group_col, group.as_ref())), None, None, false)
                .await?;
            combined.extend(series);
        }
        if sort {
            combined.sort_by_key(|(ts, _)| ts.as_str().and_then(parse_datetime));
        }
        Ok(combined)
    }

    /// 目标组与对照组在 `event_date` 前后的双重差分估计
    #[instrument(skip_all, fields(table = %table, treatment = %target, event = %event_date))]
    pub async fn diffindiff<C: AsRef<str>>(
        &self,
        table: &str,
        group_col: &str,
        target: &str,
        comparisons: &[C],
        event_date: NaiveDate,
    ) -> Result<DiffInDiffResult, TempusError> {
        let descriptor = self.engine.registry().get(table)?;
        let group = descriptor.column(group_col, ColumnRole::Groupable)?;
        let ts = descriptor.timestamp();

        let names = std::iter::once(target).chain(comparisons.iter().map(|c| c.as_ref()));
        let mut per_group = Vec::with_capacity(comparisons.len() + 1);
        for name in names {
            let query = RecordQuery {
                table: descriptor.name.clone(),
                columns: vec![ts.clone()],
                filters: vec![Predicate::Equals(group.clone(), name.to_string())],
                order_by: None,
            };
            let records = self.engine.extract(&query).await?;
            per_group.push((name.to_string(), daily_counts(&records, ts.name())));
        }

        let input_data = assemble_daily_series(&per_group);
        ensure_event_coverage(&input_data, event_date)?;

        let request = DiffInDiffRequest {
            target_region: target.to_string(),
            comparison_region_set: comparisons
                .iter()
                .map(|c| RegionRef {
                    region: c.as_ref().to_string(),
                })
                .collect(),
            event_date,
            input_data,
        };
        self.service.diff_in_diff(&request).await
    }
}

/// 每组一条记录：{group_col: 组值, 协变量: 均值, ...}
fn matching_records(group_col: &str, grouped: &GroupedResult) -> Vec<Record> {
    grouped
        .iter()
        .map(|entry| {
            let mut record = Record::new();
            record.insert(
                group_col.to_string(),
                entry.group.first().cloned().unwrap_or(Value::Null),
            );
            record.extend(entry.values.iter().map(|(k, v)| (k.clone(), v.clone())));
            record
        })
        .collect()
}

pub fn daily_counts(records: &[Record], ts_col: &str) -> BTreeMap<NaiveDate, i64> {
    let mut counts = BTreeMap::new();
    for record in records {
        if let Some(ts) = record.get(ts_col).and_then(Value::as_str).and_then(parse_datetime) {
            *counts.entry(ts.date()).or_insert(0) += 1;
        }
    }
    counts
}

/// 所有组共用观测日期的并集，某组缺失的日期补 0
pub fn assemble_daily_series(groups: &[(String, BTreeMap<NaiveDate, i64>)]) -> Vec<DailyCount> {
    let dates: BTreeSet<NaiveDate> = groups.iter().flat_map(|(_, c)| c.keys().copied()).collect();
    groups
        .iter()
        .flat_map(|(region, counts)| {
            dates.iter().map(move |date| DailyCount {
                region: region.clone(),
                date: *date,
                count: counts.get(date).copied().unwrap_or(0),
            })
        })
        .collect()
}

/// 事件日前 (date < event) 与事件日后 (date >= event) 都必须有观测
pub fn ensure_event_coverage(data: &[DailyCount], event_date: NaiveDate) -> Result<(), TempusError> {
    let before = data.iter().any(|c| c.count > 0 && c.date < event_date);
    let after = data.iter().any(|c| c.count > 0 && c.date >= event_date);
    if before && after {
        Ok(())
    } else {
        Err(TempusError::InsufficientData(format!(
            "need observations both before and after {} (before: {}, after: {})",
            event_date, before, after
        )))
    }
}
