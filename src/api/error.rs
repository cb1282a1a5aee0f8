use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::TempusError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] TempusError),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// 错误统一转成 `{ "error": ... }`
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Domain(err) => match err {
                TempusError::UnknownTable(_) => (StatusCode::NOT_FOUND, err.to_string()),
                TempusError::InvalidColumn { .. }
                | TempusError::UnsupportedAggregation(_)
                | TempusError::EmptySelection(_) => (StatusCode::BAD_REQUEST, err.to_string()),
                TempusError::InsufficientData(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
                }
                TempusError::ExternalService { .. } => {
                    tracing::error!(error = %err, "因果服务调用失败");
                    (StatusCode::BAD_GATEWAY, err.to_string())
                }
                TempusError::Store(store_err) => {
                    tracing::error!(error = ?store_err, "查询执行失败");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "An internal database error occurred".to_string(),
                    )
                }
                TempusError::Config(config_err) => {
                    tracing::error!(error = ?config_err, "配置错误");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "A server configuration error occurred".to_string(),
                    )
                }
            },
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
