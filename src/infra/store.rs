use async_trait::async_trait;

use crate::engine::query_builder::{AggregateQuery, RecordQuery};
use crate::error::TempusError;
use crate::models::query::{Record, Row};

/// 只读的关系存储。实现方负责在执行失败时回滚自己的事务，
/// 保证共享连接在下一次请求时仍然可用。
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// 聚合查询，按列位置返回每一行
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<Row>, TempusError>;

    /// 明细抽取，按列名返回每一行
    async fn records(&self, query: &RecordQuery) -> Result<Vec<Record>, TempusError>;
}
