use thiserror::Error;

use crate::models::schema::ColumnRole;

#[derive(Error, Debug)]
pub enum TempusError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Column '{column}' is not a {role} column of table '{table}'")]
    InvalidColumn {
        table: String,
        column: String,
        role: ColumnRole,
    },

    #[error("Unsupported aggregation function: {0}")]
    UnsupportedAggregation(String),

    /// 多值参数 (分组列、响应列、聚合函数) 解析后为空
    #[error("At least one {0} is required")]
    EmptySelection(&'static str),

    /// 查询执行失败；事务已在返回前回滚
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Causal service error (status {status:?}): {body}")]
    ExternalService { status: Option<u16>, body: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
