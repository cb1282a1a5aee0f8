use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::TempusError;
use crate::infra::settings::CausalSettings;
use crate::infra::utils::value_text;
use crate::models::query::Record;

/// 匹配对照组请求
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MatchRequest {
    pub data: Vec<Record>,
    pub treatment_col: String,
    pub treatment_selection: String,
    pub covariate_col: Vec<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RegionRef {
    pub region: String,
}

/// 双重差分输入的一行：某个分组某天的事件数 (缺失日期补 0)
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DailyCount {
    pub region: String,
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DiffInDiffRequest {
    #[serde(rename = "target.region")]
    pub target_region: String,
    #[serde(rename = "comparison.region.set")]
    pub comparison_region_set: Vec<RegionRef>,
    #[serde(rename = "event.date")]
    pub event_date: NaiveDate,
    pub input_data: Vec<DailyCount>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Estimate {
    #[serde(rename(deserialize = "est"), deserialize_with = "scalar")]
    pub estimate: f64,
    #[serde(rename(deserialize = "stderr"), deserialize_with = "scalar")]
    pub standard_error: f64,
    #[serde(rename(deserialize = "tstat"), deserialize_with = "scalar")]
    pub t_statistic: f64,
    #[serde(rename(deserialize = "pval"), deserialize_with = "scalar")]
    pub p_value: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiffInDiffResult {
    #[serde(rename(deserialize = "diffindiff"))]
    pub diff_in_diff: Estimate,
    #[serde(rename(deserialize = "target"))]
    pub target_trend: Estimate,
    #[serde(rename(deserialize = "comparison"))]
    pub comparison_trend: Estimate,
}

/// R (jsonlite) 会把标量包成长度为 1 的数组，NA 会变成 null
fn scalar<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Num(f64),
        List(Vec<Option<f64>>),
        Null,
    }

    match Scalar::deserialize(deserializer)? {
        Scalar::Num(v) => Ok(v),
        Scalar::List(list) => match list.as_slice() {
            [single] => Ok(single.unwrap_or(f64::NAN)),
            _ => Err(serde::de::Error::custom(format!(
                "expected a single value, got {} values",
                list.len()
            ))),
        },
        Scalar::Null => Ok(f64::NAN),
    }
}

/// 外部因果推断服务 (黑盒)：这里只负责请求体和响应体的形状
#[async_trait]
pub trait CausalService: Send + Sync {
    async fn match_groups(&self, request: &MatchRequest) -> Result<Vec<String>, TempusError>;

    async fn diff_in_diff(&self, request: &DiffInDiffRequest) -> Result<DiffInDiffResult, TempusError>;
}

pub struct HttpCausalService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCausalService {
    pub fn new(settings: &CausalSettings) -> Result<Self, TempusError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, TempusError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        debug!(%url, status = status.as_u16(), "因果服务返回");

        if !status.is_success() {
            return Err(TempusError::ExternalService {
                status: Some(status.as_u16()),
                body: text,
            });
        }
        decode(Some(status.as_u16()), &text)
    }
}

#[async_trait]
impl CausalService for HttpCausalService {
    #[instrument(skip(self, request), fields(treatment = %request.treatment_selection))]
    async fn match_groups(&self, request: &MatchRequest) -> Result<Vec<String>, TempusError> {
        let raw: Value = self.post("matching", request).await?;
        parse_match_response(raw)
    }

    #[instrument(skip(self, request), fields(treatment = %request.target_region))]
    async fn diff_in_diff(&self, request: &DiffInDiffRequest) -> Result<DiffInDiffResult, TempusError> {
        self.post("diffindiff", request).await
    }
}

fn transport_error(e: reqwest::Error) -> TempusError {
    TempusError::ExternalService {
        status: e.status().map(|s| s.as_u16()),
        body: e.to_string(),
    }
}

fn decode<R: DeserializeOwned>(status: Option<u16>, text: &str) -> Result<R, TempusError> {
    serde_json::from_str(text).map_err(|e| TempusError::ExternalService {
        status,
        body: format!("{}: {}", e, text),
    })
}

/// 匹配结果可能是字符串或数字，也可能是未包数组的单个值；统一成字符串列表
pub fn parse_match_response(raw: Value) -> Result<Vec<String>, TempusError> {
    match raw {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(_) | Value::Number(_) => Ok(value_text(&item)),
                other => Err(TempusError::ExternalService {
                    status: None,
                    body: format!("unexpected group identifier: {}", other),
                }),
            })
            .collect(),
        Value::String(_) | Value::Number(_) => Ok(vec![value_text(&raw)]),
        other => Err(TempusError::ExternalService {
            status: None,
            body: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_in_diff_request_shape() {
        let request = DiffInDiffRequest {
            target_region: "A".to_string(),
            comparison_region_set: vec![RegionRef { region: "B".to_string() }],
            event_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            input_data: vec![DailyCount {
                region: "A".to_string(),
                date: NaiveDate::from_ymd_opt(2019, 12, 31).unwrap(),
                count: 3,
            }],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "target.region": "A",
                "comparison.region.set": [{ "region": "B" }],
                "event.date": "2020-01-01",
                "input_data": [{ "region": "A", "date": "2019-12-31", "count": 3 }]
            })
        );
    }

    #[test]
    fn test_match_request_shape() {
        let mut record = Record::new();
        record.insert("region".to_string(), json!("A"));
        record.insert("price".to_string(), json!(12.5));
        let request = MatchRequest {
            data: vec![record],
            treatment_col: "region".to_string(),
            treatment_selection: "A".to_string(),
            covariate_col: vec!["price".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "data": [{ "region": "A", "price": 12.5 }],
                "treatment_col": "region",
                "treatment_selection": "A",
                "covariate_col": ["price"]
            })
        );
    }

    #[test]
    fn test_diff_in_diff_response_accepts_r_style_scalars() {
        let body = r#"{
            "diffindiff": {"est": [1.5], "stderr": [0.5], "tstat": [3.0], "pval": [0.003]},
            "target": {"est": 2.0, "stderr": 0.4, "tstat": 5.0, "pval": 0.0001},
            "comparison": {"est": [0.5], "stderr": [0.2], "tstat": [2.5], "pval": [null]}
        }"#;
        let result: DiffInDiffResult = decode(Some(200), body).unwrap();
        assert_eq!(result.diff_in_diff.estimate, 1.5);
        assert_eq!(result.diff_in_diff.p_value, 0.003);
        assert_eq!(result.target_trend.t_statistic, 5.0);
        assert_eq!(result.comparison_trend.standard_error, 0.2);
        assert!(result.comparison_trend.p_value.is_nan());

        let out = serde_json::to_value(&result.target_trend).unwrap();
        assert_eq!(
            out,
            json!({ "estimate": 2.0, "standard_error": 0.4, "t_statistic": 5.0, "p_value": 0.0001 })
        );
    }

    #[test]
    fn test_malformed_response_keeps_raw_body() {
        let err = decode::<DiffInDiffResult>(Some(200), "Error in lm(...)").unwrap_err();
        match err {
            TempusError::ExternalService { status, body } => {
                assert_eq!(status, Some(200));
                assert!(body.contains("Error in lm(...)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_match_response() {
        assert_eq!(parse_match_response(json!(["B", "C"])).unwrap(), vec!["B", "C"]);
        assert_eq!(parse_match_response(json!([12, "C"])).unwrap(), vec!["12", "C"]);
        assert_eq!(parse_match_response(json!("B")).unwrap(), vec!["B"]);
        assert!(parse_match_response(json!({ "error": "no match" })).is_err());
        assert!(parse_match_response(json!([null])).is_err());
    }
}
