use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::engine::query_builder::{AggregateQuery, Predicate, RecordQuery};
use crate::error::TempusError;
use crate::infra::store::AggregateStore;
use crate::models::query::{GroupedResult, Record, Row, TimeRange, UngroupedResult};
use crate::models::schema::{ColumnRole, TableRegistry};

/// 执行构建好的查询，并把原始行整理成分组 / 不分组两种结果
#[derive(Clone)]
pub struct AggregationEngine {
    registry: Arc<TableRegistry>,
    store: Arc<dyn AggregateStore>,
}

impl AggregationEngine {
    pub fn new(registry: Arc<TableRegistry>, store: Arc<dyn AggregateStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn shared_registry(&self) -> Arc<TableRegistry> {
        Arc::clone(&self.registry)
    }

    /// 对每个分组套用聚合函数。
    ///
    /// `tstart` 和 `tend` 必须同时给出才会过滤，只给一个等同于不过滤。
    #[instrument(skip_all, fields(table = %table, agg = %function))]
    pub async fn groupby<G, R>(
        &self,
        table: &str,
        group_cols: &[G],
        response_cols: &[R],
        function: &str,
        tstart: Option<NaiveDateTime>,
        tend: Option<NaiveDateTime>,
    ) -> Result<GroupedResult, TempusError>
    where
        G: AsRef<str>,
        R: AsRef<str>,
    {
        let descriptor = self.registry.get(table)?;
        let query = AggregateQuery::grouped(
            descriptor,
            group_cols,
            response_cols,
            function,
            TimeRange::from_bounds(tstart, tend),
        )?;
        let rows = self.store.aggregate(&query).await?;
        debug!(groups = rows.len(), "groupby 完成");
        Ok(reshape_grouped(rows, response_cols))
    }

    /// 对整张表 (全体) 依次套用多个聚合函数，返回一条记录，值的顺序与函数顺序一致
    #[instrument(skip_all, fields(table = %table, response = %response_col))]
    pub async fn groupdo<F>(
        &self,
        table: &str,
        response_col: &str,
        functions: &[F],
        tstart: Option<NaiveDateTime>,
        tend: Option<NaiveDateTime>,
    ) -> Result<UngroupedResult, TempusError>
    where
        F: AsRef<str>,
    {
        let descriptor = self.registry.get(table)?;
        let query = AggregateQuery::ungrouped(
            descriptor,
            response_col,
            functions,
            TimeRange::from_bounds(tstart, tend),
        )?;
        let rows = self.store.aggregate(&query).await?;
        let mut values = rows.into_iter().next().unwrap_or_default();
        values.resize(functions.len(), Value::Null);
        Ok(UngroupedResult { values })
    }

    /// 响应变量的原始时间序列 `(timestamp, value)`。
    /// 与 groupby 不同，这里 start / end 各自独立生效。
    #[instrument(skip_all, fields(table = %table, response = %response_col, sort = sort))]
    pub async fn series(
        &self,
        table: &str,
        response_col: &str,
        group: Option<(&str, &str)>,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        sort: bool,
    ) -> Result<Vec<(Value, Value)>, TempusError> {
        let descriptor = self.registry.get(table)?;
        let ts = descriptor.timestamp();
        let response = descriptor.column(response_col, ColumnRole::Response)?;

        let mut filters = Vec::new();
        if let Some((group_col, group_value)) = group {
            let column = descriptor.column(group_col, ColumnRole::Groupable)?;
            filters.push(Predicate::Equals(column, group_value.to_string()));
        }
        if let Some(start) = start {
            filters.push(Predicate::After(ts.clone(), start));
        }
        if let Some(end) = end {
            filters.push(Predicate::Before(ts.clone(), end));
        }

        let query = RecordQuery {
            table: descriptor.name.clone(),
            columns: vec![ts.clone(), response.clone()],
            filters,
            order_by: sort.then(|| ts.clone()),
        };
        let records = self.extract(&query).await?;
        Ok(records
            .into_iter()
            .map(|mut r| {
                let value = r.remove(response.name()).unwrap_or(Value::Null);
                let timestamp = r.remove(ts.name()).unwrap_or(Value::Null);
                (timestamp, value)
            })
            .collect())
    }

    /// 明细抽取 (对照组、双重差分用)
    pub async fn extract(&self, query: &RecordQuery) -> Result<Vec<Record>, TempusError> {
        let records = self.store.records(query).await?;
        debug!(table = %query.table, rows = records.len(), "明细抽取完成");
        Ok(records)
    }
}

/// 结果行的前 `len(response_cols)` 列是聚合值，其余是分组键
pub fn reshape_grouped<R: AsRef<str>>(rows: Vec<Row>, response_cols: &[R]) -> GroupedResult {
    let mut result = GroupedResult::default();
    for mut row in rows {
        let key = row.split_off(response_cols.len().min(row.len()));
        let values: BTreeMap<String, Value> = response_cols
            .iter()
            .map(|r| r.as_ref().to_string())
            .zip(row)
            .collect();
        result.insert(key, values);
    }
    result
}
