//! 离群分组检测：偏离参考中心超过 2 个参考标准差。
//!
//! - `outliers`：参考值来自全体数据 (不分组 AVG + STD)，双侧判定。
//! - `outlier_in`：参考值来自各组聚合结果本身的分布，只判定高于均值的一侧。
//!
//! 两者的不对称是有意保留的，调用方依赖各自的行为。

use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::engine::aggregation::AggregationEngine;
use crate::error::TempusError;
use crate::infra::utils::value_text;
use crate::models::query::{GroupedResult, Outlier};
use crate::models::schema::ColumnRole;

pub const THRESHOLD_SIGMAS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reference {
    pub mean: f64,
    pub std_dev: f64,
}

impl Reference {
    /// 均值与总体标准差；空输入返回 None
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std_dev: variance.sqrt(),
        })
    }

    pub fn upper_bound(&self) -> f64 {
        self.mean + THRESHOLD_SIGMAS * self.std_dev
    }
}

/// null、0、false、空串都视为“没有值”，无法与基线比较
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// 双侧：|value - mean| > 2 * std。结果以组键的第一列为键。
pub fn baseline_outliers(
    reference: Reference,
    groups: &GroupedResult,
    response: &str,
) -> BTreeMap<String, f64> {
    let limit = THRESHOLD_SIGMAS * reference.std_dev;
    groups
        .iter()
        .filter_map(|entry| {
            let value = entry.values.get(response).filter(|v| is_truthy(v))?.as_f64()?;
            if (value - reference.mean).abs() > limit {
                let label = entry.group.first().map(value_text).unwrap_or_default();
                Some((label, value))
            } else {
                None
            }
        })
        .collect()
}

/// 单侧：value > mean + 2 * std，均值和标准差取自全部组的聚合值。
/// 非数值的聚合结果 (如 GROUP_CONCAT) 不参与统计也不会被标记。
pub fn self_relative_outliers(groups: &GroupedResult, response: &str) -> Vec<Outlier> {
    let numeric: Vec<(&Vec<Value>, f64)> = groups
        .iter()
        .filter_map(|entry| Some((&entry.group, entry.values.get(response)?.as_f64()?)))
        .collect();
    let values: Vec<f64> = numeric.iter().map(|(_, v)| *v).collect();
    let Some(reference) = Reference::of(&values) else {
        return Vec::new();
    };
    debug!(mean = reference.mean, std = reference.std_dev, "分组聚合值分布");

    let bound = reference.upper_bound();
    numeric
        .into_iter()
        .filter(|(_, v)| *v > bound)
        .map(|(group, value)| Outlier {
            group: group.clone(),
            value,
        })
        .collect()
}

#[derive(Clone)]
pub struct OutlierDetector {
    engine: AggregationEngine,
}

impl OutlierDetector {
    pub fn new(engine: AggregationEngine) -> Self {
        Self { engine }
    }

    /// 各组 AVG 相对全体基线的离群值
    #[instrument(skip_all, fields(table = %table, group = %group_col, response = %response_col))]
    pub async fn outliers(
        &self,
        table: &str,
        group_col: &str,
        response_col: &str,
        tstart: Option<NaiveDateTime>,
        tend: Option<NaiveDateTime>,
    ) -> Result<BTreeMap<String, f64>, TempusError> {
        let descriptor = self.engine.registry().get(table)?;
        descriptor.column(group_col, ColumnRole::Groupable)?;
        descriptor.column(response_col, ColumnRole::Covariate)?;

        let baseline = self
            .engine
            .groupdo(table, response_col, &["AVG", "STD"], tstart, tend)
            .await?;
        let reference = match (
            baseline.values.first().and_then(Value::as_f64),
            baseline.values.get(1).and_then(Value::as_f64),
        ) {
            (Some(mean), Some(std_dev)) => Reference { mean, std_dev },
            _ => {
                debug!("全体基线为空，没有可比较的数据");
                return Ok(BTreeMap::new());
            }
        };
        debug!(avg = reference.mean, std = reference.std_dev, "全体基线");

        let averages = self
            .engine
            .groupby(table, &[group_col], &[response_col], "AVG", tstart, tend)
            .await?;
        debug!(groups = averages.len(), "分组均值数量");
        Ok(baseline_outliers(reference, &averages, response_col))
    }

    /// 聚合结果内部的离群组；不指定响应变量时使用表的默认价格列
    #[instrument(skip_all, fields(table = %table, agg = %function))]
    pub async fn outlier_in<G: AsRef<str>>(
        &self,
        table: &str,
        group_cols: &[G],
        function: &str,
        response_col: Option<&str>,
        tstart: Option<NaiveDateTime>,
        tend: Option<NaiveDateTime>,
    ) -> Result<Vec<Outlier>, TempusError> {
        let descriptor = self.engine.registry().get(table)?;
        let response = response_col.unwrap_or(&descriptor.price_column).to_string();
        let results = self
            .engine
            .groupby(table, group_cols, &[response.as_str()], function, tstart, tend)
            .await?;
        Ok(self_relative_outliers(&results, &response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ads_engine, ads_row, MemoryStore};
    use serde_json::json;

    fn groups(values: &[(&str, Value)]) -> GroupedResult {
        let mut result = GroupedResult::default();
        for (name, value) in values {
            result.insert(
                vec![json!(name)],
                BTreeMap::from([("price".to_string(), value.clone())]),
            );
        }
        result
    }

    #[test]
    fn test_baseline_flags_only_far_groups() {
        let reference = Reference { mean: 100.0, std_dev: 10.0 };
        let averages = groups(&[("A", json!(100.0)), ("B", json!(95.0)), ("C", json!(140.0))]);
        let flagged = baseline_outliers(reference, &averages, "price");
        assert_eq!(flagged, BTreeMap::from([("C".to_string(), 140.0)]));
    }

    #[test]
    fn test_baseline_is_two_sided_and_skips_empty_values() {
        let reference = Reference { mean: 100.0, std_dev: 10.0 };
        let averages = groups(&[
            ("low", json!(50.0)),
            ("null", Value::Null),
            ("zero", json!(0.0)),
            ("edge", json!(120.0)),
        ]);
        let flagged = baseline_outliers(reference, &averages, "price");
        assert_eq!(flagged, BTreeMap::from([("low".to_string(), 50.0)]));
    }

    #[test]
    fn test_reference_is_population_std() {
        let reference = Reference::of(&[10.0, 12.0, 11.0, 50.0]).unwrap();
        assert_eq!(reference.mean, 20.75);
        assert!((reference.std_dev - 285.6875_f64.sqrt()).abs() < 1e-12);
        assert!(Reference::of(&[]).is_none());
    }

    #[test]
    fn test_self_relative_uses_exact_threshold() {
        // mean 20.75, std ≈ 16.902，阈值 ≈ 54.55，50 不超过
        let counts = groups(&[
            ("A", json!(10)),
            ("B", json!(12)),
            ("C", json!(11)),
            ("D", json!(50)),
        ]);
        assert!(self_relative_outliers(&counts, "price").is_empty());

        // mean 19, std 27，阈值 73
        let mut values: Vec<(String, Value)> =
            (0..9).map(|i| (format!("g{}", i), json!(10))).collect();
        values.push(("big".to_string(), json!(100)));
        let refs: Vec<(&str, Value)> = values.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        let flagged = self_relative_outliers(&groups(&refs), "price");
        assert_eq!(flagged, vec![Outlier { group: vec![json!("big")], value: 100.0 }]);
    }

    #[test]
    fn test_self_relative_is_one_sided() {
        // mean 90, std 30：0 比均值低 3 个标准差，但不算离群
        let mut values: Vec<(String, Value)> =
            (0..9).map(|i| (format!("g{}", i), json!(100))).collect();
        values.push(("tiny".to_string(), json!(0)));
        let refs: Vec<(&str, Value)> = values.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
        assert!(self_relative_outliers(&groups(&refs), "price").is_empty());
    }

    #[test]
    fn test_self_relative_ignores_non_numeric() {
        let concat = groups(&[("A", json!("1,2")), ("B", json!("3"))]);
        assert!(self_relative_outliers(&concat, "price").is_empty());
        assert!(self_relative_outliers(&GroupedResult::default(), "price").is_empty());
    }

    #[tokio::test]
    async fn test_outliers_against_population() {
        let mut rows = Vec::new();
        for region in ["A", "B", "C", "D"] {
            rows.push(ads_row(region, "Boston", 100.0, "2014-01-05 10:00:00"));
            rows.push(ads_row(region, "Boston", 100.0, "2014-01-06 10:00:00"));
        }
        rows.push(ads_row("E", "Austin", 300.0, "2014-01-07 10:00:00"));
        let (engine, store) = ads_engine(MemoryStore::with_table("ads", rows));
        let detector = OutlierDetector::new(engine);

        let flagged = detector.outliers("ads", "region", "price", None, None).await.unwrap();
        assert_eq!(flagged, BTreeMap::from([("E".to_string(), 300.0)]));
        // 全体基线 + 分组均值
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn test_outliers_validates_roles_before_querying() {
        let (engine, store) = ads_engine(MemoryStore::with_table("ads", vec![]));
        let detector = OutlierDetector::new(engine);
        assert!(matches!(
            detector.outliers("ads", "price", "price", None, None).await,
            Err(TempusError::InvalidColumn { .. })
        ));
        assert!(matches!(
            detector.outliers("ads", "region", "city", None, None).await,
            Err(TempusError::InvalidColumn { .. })
        ));
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn test_outliers_on_empty_table() {
        let (engine, _store) = ads_engine(MemoryStore::with_table("ads", vec![]));
        let detector = OutlierDetector::new(engine);
        assert!(detector
            .outliers("ads", "region", "price", None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_outlier_in_counts_with_default_response() {
        let mut rows = Vec::new();
        for i in 0..9 {
            rows.push(ads_row(&format!("R{}", i), "Boston", 50.0, "2014-01-05 10:00:00"));
        }
        for _ in 0..10 {
            rows.push(ads_row("HOT", "Austin", 50.0, "2014-01-05 10:00:00"));
        }
        let (engine, _store) = ads_engine(MemoryStore::with_table("ads", rows));
        let detector = OutlierDetector::new(engine);

        // counts [1 x 9, 10]：mean 1.9, std 2.7，阈值 7.3
        let flagged = detector
            .outlier_in("ads", &["region"], "COUNT", None, None, None)
            .await
            .unwrap();
        assert_eq!(flagged, vec![Outlier { group: vec![json!("HOT")], value: 10.0 }]);
    }
}
