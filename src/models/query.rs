use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::TempusError;

/// 允许的聚合函数 (MySQL 聚合函数白名单)
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggFunction {
    Avg,
    BitAnd,
    BitOr,
    BitXor,
    Count,
    CountDistinct,
    GroupConcat,
    Max,
    Min,
    Std,
    Stddev,
    StddevPop,
    StddevSamp,
    Sum,
    VarPop,
    VarSamp,
    Variance,
}

impl AggFunction {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunction::Avg => "AVG",
            AggFunction::BitAnd => "BIT_AND",
            AggFunction::BitOr => "BIT_OR",
            AggFunction::BitXor => "BIT_XOR",
            AggFunction::Count => "COUNT",
            AggFunction::CountDistinct => "COUNT DISTINCT",
            AggFunction::GroupConcat => "GROUP_CONCAT",
            AggFunction::Max => "MAX",
            AggFunction::Min => "MIN",
            AggFunction::Std => "STD",
            AggFunction::Stddev => "STDDEV",
            AggFunction::StddevPop => "STDDEV_POP",
            AggFunction::StddevSamp => "STDDEV_SAMP",
            AggFunction::Sum => "SUM",
            AggFunction::VarPop => "VAR_POP",
            AggFunction::VarSamp => "VAR_SAMP",
            AggFunction::Variance => "VARIANCE",
        }
    }
}

impl fmt::Display for AggFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggFunction {
    type Err = TempusError;

    /// 大小写不敏感；`COUNT DISTINCT`、`COUNT(DISTINCT)`、`COUNT_DISTINCT` 均可
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .to_ascii_uppercase()
            .replace(['(', ')'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_");
        let f = match normalized.as_str() {
            "AVG" => AggFunction::Avg,
            "BIT_AND" => AggFunction::BitAnd,
            "BIT_OR" => AggFunction::BitOr,
            "BIT_XOR" => AggFunction::BitXor,
            "COUNT" => AggFunction::Count,
            "COUNT_DISTINCT" => AggFunction::CountDistinct,
            "GROUP_CONCAT" => AggFunction::GroupConcat,
            "MAX" => AggFunction::Max,
            "MIN" => AggFunction::Min,
            "STD" => AggFunction::Std,
            "STDDEV" => AggFunction::Stddev,
            "STDDEV_POP" => AggFunction::StddevPop,
            "STDDEV_SAMP" => AggFunction::StddevSamp,
            "SUM" => AggFunction::Sum,
            "VAR_POP" => AggFunction::VarPop,
            "VAR_SAMP" => AggFunction::VarSamp,
            "VARIANCE" => AggFunction::Variance,
            _ => return Err(TempusError::UnsupportedAggregation(s.to_string())),
        };
        Ok(f)
    }
}

/// 开区间 (start, end)。只有两端都给出时才存在。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    /// 单边界不生效：返回 None，查询不做任何时间过滤
    pub fn from_bounds(start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Option<Self> {
        match (start, end) {
            (Some(start), Some(end)) => Some(Self { start, end }),
            (None, None) => None,
            (start, end) => {
                warn!(?start, ?end, "只给出了一个时间边界，忽略时间过滤");
                None
            }
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts > self.start && ts < self.end
    }
}

pub type GroupKey = Vec<Value>;

/// 一行原始结果 (按列位置)
pub type Row = Vec<Value>;

/// 一行原始结果 (按列名)
pub type Record = Map<String, Value>;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct GroupEntry {
    pub group: GroupKey,
    pub values: BTreeMap<String, Value>,
}

/// 分组聚合结果：组键 -> {响应变量 -> 聚合值}，组键唯一，保持插入顺序
#[derive(Debug, Serialize, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct GroupedResult {
    entries: Vec<GroupEntry>,
    /// 组键的 JSON 文本 -> entries 下标
    #[serde(skip)]
    index: HashMap<String, usize>,
}

fn key_text(group: &[Value]) -> String {
    let parts: Vec<String> = group.iter().map(Value::to_string).collect();
    format!("[{}]", parts.join(","))
}

impl GroupedResult {
    /// 已存在的组键会被覆盖
    pub fn insert(&mut self, group: GroupKey, values: BTreeMap<String, Value>) {
        let key = key_text(&group);
        match self.index.get(&key) {
            Some(&i) => self.entries[i].values = values,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(GroupEntry { group, values });
            }
        }
    }

    pub fn get(&self, group: &[Value]) -> Option<&BTreeMap<String, Value>> {
        self.index
            .get(&key_text(group))
            .map(|&i| &self.entries[i].values)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 不分组聚合结果：每个请求的函数一个值，顺序与请求一致
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(transparent)]
pub struct UngroupedResult {
    pub values: Vec<Value>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Outlier {
    pub group: GroupKey,
    pub value: f64,
}
