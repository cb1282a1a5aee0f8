use serde::Deserialize;

// 所有接口都是 GET + 查询参数；多值参数用 `|` 分隔

#[derive(Debug, Deserialize)]
pub struct GroupByParams {
    pub table: String,
    pub group_col: String,
    pub response_col: String,
    pub agg: String,
    pub tstart: Option<String>,
    pub tend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GroupDoParams {
    pub table: String,
    pub response_col: String,
    pub aggs: String,
    pub tstart: Option<String>,
    pub tend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutlierParams {
    pub table: String,
    pub group_col: String,
    pub response_col: String,
    pub tstart: Option<String>,
    pub tend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutlierInParams {
    pub table: String,
    pub group_col: String,
    pub agg: String,
    pub response_col: Option<String>,
    pub tstart: Option<String>,
    pub tend: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeriesParams {
    pub table: String,
    pub response_col: String,
    pub group_col: Option<String>,
    pub group: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub sort: bool,
}

#[derive(Debug, Deserialize)]
pub struct ComparisonParams {
    pub table: String,
    pub group_col: String,
    pub group: String,
    pub covs: String,
    pub response_col: String,
    #[serde(default)]
    pub sort: bool,
}

#[derive(Debug, Deserialize)]
pub struct DiffInDiffParams {
    pub table: String,
    pub group_col: String,
    pub group: String,
    pub covs: String,
    pub event_date: String,
}

/// `a|b|c` -> ["a", "b", "c"]，忽略空段
pub fn split_multi(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
