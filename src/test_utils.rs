//! 测试夹具：内存版的存储和因果服务，不需要数据库或网络

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::ax_state::AppState;
use crate::engine::aggregation::AggregationEngine;
use crate::engine::bridge::ComparisonBridge;
use crate::engine::query_builder::{AggregateQuery, Predicate, RecordQuery};
use crate::error::TempusError;
use crate::infra::causal_client::{
    CausalService, DiffInDiffRequest, DiffInDiffResult, Estimate, MatchRequest,
};
use crate::infra::store::AggregateStore;
use crate::infra::utils::{parse_datetime, value_text};
use crate::models::query::{AggFunction, Record, Row};
use crate::models::schema::{TableDescriptor, TableRegistry};

pub fn ads_descriptor() -> TableDescriptor {
    TableDescriptor {
        name: "ads".to_string(),
        timestamp_column: "posted_at".to_string(),
        groupable_columns: ["region", "city"].iter().map(|s| s.to_string()).collect(),
        covariate_columns: ["price", "age"].iter().map(|s| s.to_string()).collect(),
        price_column: "price".to_string(),
        primary_key: vec!["id".to_string()],
    }
}

pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

pub fn ads_row(region: &str, city: &str, price: f64, posted_at: &str) -> Record {
    let mut row = Record::new();
    row.insert("region".to_string(), json!(region));
    row.insert("city".to_string(), json!(city));
    row.insert("price".to_string(), json!(price));
    row.insert("age".to_string(), json!(30));
    row.insert("posted_at".to_string(), json!(posted_at));
    row
}

pub fn ads_engine(store: MemoryStore) -> (AggregationEngine, Arc<MemoryStore>) {
    let store = Arc::new(store);
    let registry = Arc::new(TableRegistry::new([ads_descriptor()]));
    (AggregationEngine::new(registry, store.clone()), store)
}

static NULL: Value = Value::Null;

/// 按 MySQL 语义在内存中求值结构化查询
#[derive(Default)]
pub struct MemoryStore {
    tables: HashMap<String, Vec<Record>>,
    queries: AtomicUsize,
}

impl MemoryStore {
    pub fn with_table(name: &str, rows: Vec<Record>) -> Self {
        let mut store = Self::default();
        store.tables.insert(name.to_string(), rows);
        store
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn scan(&self, table: &str, filters: &[Predicate]) -> Result<Vec<&Record>, TempusError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let rows = self.tables.get(table).ok_or_else(|| {
            TempusError::Store(sqlx::Error::Protocol(format!("table '{}' doesn't exist", table)))
        })?;
        Ok(rows.iter().filter(|r| filters.iter().all(|f| satisfies(r, f))).collect())
    }
}

fn timestamp_of(row: &Record, column: &str) -> Option<NaiveDateTime> {
    row.get(column).and_then(|v| parse_datetime(&value_text(v)))
}

fn satisfies(row: &Record, filter: &Predicate) -> bool {
    match filter {
        Predicate::After(col, ts) => timestamp_of(row, col.name()).is_some_and(|t| t > *ts),
        Predicate::Before(col, ts) => timestamp_of(row, col.name()).is_some_and(|t| t < *ts),
        Predicate::Equals(col, value) => row.get(col.name()).is_some_and(|v| value_text(v) == *value),
    }
}

fn moments(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    Some((mean, ss))
}

fn apply(function: AggFunction, cells: &[&Value]) -> Value {
    let present: Vec<&Value> = cells.iter().copied().filter(|v| !v.is_null()).collect();
    let numbers: Vec<f64> = present.iter().filter_map(|v| v.as_f64()).collect();
    let bits: Vec<u64> = present.iter().filter_map(|v| v.as_u64()).collect();
    let n = numbers.len() as f64;
    let float = |v: Option<f64>| v.map(|f| json!(f)).unwrap_or(Value::Null);

    match function {
        AggFunction::Count => json!(present.len()),
        AggFunction::CountDistinct => {
            json!(present.iter().map(|v| value_text(v)).collect::<BTreeSet<_>>().len())
        }
        AggFunction::Avg => float(moments(&numbers).map(|(mean, _)| mean)),
        AggFunction::Sum => float((!numbers.is_empty()).then(|| numbers.iter().sum())),
        AggFunction::Min => float(numbers.iter().copied().reduce(f64::min)),
        AggFunction::Max => float(numbers.iter().copied().reduce(f64::max)),
        AggFunction::Std | AggFunction::Stddev | AggFunction::StddevPop => {
            float(moments(&numbers).map(|(_, ss)| (ss / n).sqrt()))
        }
        AggFunction::StddevSamp => {
            float(moments(&numbers).filter(|_| n > 1.0).map(|(_, ss)| (ss / (n - 1.0)).sqrt()))
        }
        AggFunction::Variance | AggFunction::VarPop => float(moments(&numbers).map(|(_, ss)| ss / n)),
        AggFunction::VarSamp => {
            float(moments(&numbers).filter(|_| n > 1.0).map(|(_, ss)| ss / (n - 1.0)))
        }
        AggFunction::BitAnd => json!(bits.iter().fold(u64::MAX, |acc, b| acc & b)),
        AggFunction::BitOr => json!(bits.iter().fold(0, |acc, b| acc | b)),
        AggFunction::BitXor => json!(bits.iter().fold(0, |acc, b| acc ^ b)),
        AggFunction::GroupConcat => {
            if present.is_empty() {
                Value::Null
            } else {
                json!(present.iter().map(|v| value_text(v)).collect::<Vec<_>>().join(","))
            }
        }
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<Row>, TempusError> {
        let rows = self.scan(&query.table, &query.filters)?;

        // 组按首次出现的顺序排列；不分组时整张表算一组 (即使为空)
        let mut groups: Vec<(Row, Vec<&Record>)> = Vec::new();
        if query.group_by.is_empty() {
            groups.push((Vec::new(), rows));
        } else {
            let mut positions: HashMap<String, usize> = HashMap::new();
            for row in rows {
                let key: Row = query
                    .group_by
                    .iter()
                    .map(|c| row.get(c.name()).cloned().unwrap_or(Value::Null))
                    .collect();
                let text = Value::Array(key.clone()).to_string();
                match positions.get(&text) {
                    Some(&i) => groups[i].1.push(row),
                    None => {
                        positions.insert(text, groups.len());
                        groups.push((key, vec![row]));
                    }
                }
            }
        }

        Ok(groups
            .into_iter()
            .map(|(key, members)| {
                let mut out: Row = query
                    .measures
                    .iter()
                    .map(|m| {
                        let cells: Vec<&Value> = members
                            .iter()
                            .map(|r| r.get(m.column.name()).unwrap_or(&NULL))
                            .collect();
                        apply(m.function, &cells)
                    })
                    .collect();
                out.extend(key);
                out
            })
            .collect())
    }

    async fn records(&self, query: &RecordQuery) -> Result<Vec<Record>, TempusError> {
        let mut rows = self.scan(&query.table, &query.filters)?;
        if let Some(col) = &query.order_by {
            rows.sort_by_key(|r| timestamp_of(r, col.name()));
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                query
                    .columns
                    .iter()
                    .map(|c| {
                        let value = row.get(c.name()).cloned().unwrap_or(Value::Null);
                        (c.name().to_string(), value)
                    })
                    .collect()
            })
            .collect())
    }
}

/// 记录收到的请求，按预设返回
#[derive(Default)]
pub struct FakeCausalService {
    matches: Vec<String>,
    failing: bool,
    match_calls: Mutex<Vec<MatchRequest>>,
    did_calls: Mutex<Vec<DiffInDiffRequest>>,
}

impl FakeCausalService {
    pub fn new(matches: Vec<String>) -> Self {
        Self {
            matches,
            ..Self::default()
        }
    }

    /// 每次调用都返回 502 风格的错误
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn estimates() -> DiffInDiffResult {
        let estimate = |est: f64| Estimate {
            estimate: est,
            standard_error: 0.5,
            t_statistic: est / 0.5,
            p_value: 0.01,
        };
        DiffInDiffResult {
            diff_in_diff: estimate(1.5),
            target_trend: estimate(2.0),
            comparison_trend: estimate(0.5),
        }
    }

    pub fn call_count(&self) -> usize {
        self.match_calls.lock().unwrap().len() + self.did_calls.lock().unwrap().len()
    }

    pub fn last_match(&self) -> Option<MatchRequest> {
        self.match_calls.lock().unwrap().last().cloned()
    }

    pub fn last_diff_in_diff(&self) -> Option<DiffInDiffRequest> {
        self.did_calls.lock().unwrap().last().cloned()
    }

    fn outcome<T>(&self, value: T) -> Result<T, TempusError> {
        if self.failing {
            return Err(TempusError::ExternalService {
                status: Some(500),
                body: "Error in lm.fit(x, y): 0 (non-NA) cases".to_string(),
            });
        }
        Ok(value)
    }
}

#[async_trait]
impl CausalService for FakeCausalService {
    async fn match_groups(&self, request: &MatchRequest) -> Result<Vec<String>, TempusError> {
        self.match_calls.lock().unwrap().push(request.clone());
        self.outcome(self.matches.clone())
    }

    async fn diff_in_diff(&self, request: &DiffInDiffRequest) -> Result<DiffInDiffResult, TempusError> {
        self.did_calls.lock().unwrap().push(request.clone());
        self.outcome(Self::estimates())
    }
}

pub fn test_state(
    store: MemoryStore,
    service: FakeCausalService,
) -> (Arc<AppState>, Arc<MemoryStore>, Arc<FakeCausalService>) {
    let (engine, store) = ads_engine(store);
    let service = Arc::new(service);
    let bridge = ComparisonBridge::new(engine.clone(), service.clone());
    (Arc::new(AppState::new(engine, bridge)), store, service)
}
