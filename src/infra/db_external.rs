use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{
    mysql::MySqlPoolOptions, postgres::PgPoolOptions, Database, Encode, Executor, IntoArguments,
    MySql, Pool, Postgres, Row, Type,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::query_builder::{AggregateQuery, Bind, Dialect, RecordQuery, SqlStatement};
use crate::error::TempusError;
use crate::infra::settings::{DatabaseSettings, TableSettings};
use crate::infra::store::AggregateStore;
use crate::infra::utils::{mysql_row_record, mysql_row_values, pg_row_record, pg_row_values};
use crate::models::query::{Record, Row as ValueRow};
use crate::models::schema::{TableDescriptor, TableRegistry};

pub enum DynamicPool {
    Postgres(Pool<Postgres>),
    MySql(Pool<MySql>),
}

/// 进程启动时建立的连接池；每条语句在各自的事务里执行
pub struct SqlStore {
    pool: DynamicPool,
}

impl SqlStore {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, TempusError> {
        let url = settings.resolve_url()?;
        let timeout = Duration::from_secs(settings.acquire_timeout_secs);
        let pool = match url.split(':').next().unwrap_or_default().to_lowercase().as_str() {
            "postgres" | "postgresql" => DynamicPool::Postgres(
                PgPoolOptions::new()
                    .max_connections(settings.max_connections)
                    .acquire_timeout(timeout)
                    .connect(&url)
                    .await?,
            ),
            "mysql" | "mariadb" => DynamicPool::MySql(
                MySqlPoolOptions::new()
                    .max_connections(settings.max_connections)
                    .acquire_timeout(timeout)
                    .connect(&url)
                    .await?,
            ),
            other => {
                return Err(TempusError::Config(config::ConfigError::Message(format!(
                    "Unsupported DB type: {}",
                    other
                ))))
            }
        };
        Ok(Self { pool })
    }

    pub fn dialect(&self) -> Dialect {
        match self.pool {
            DynamicPool::Postgres(_) => Dialect::Postgres,
            DynamicPool::MySql(_) => Dialect::MySql,
        }
    }

    /// 探测指定表的所有列名 (按定义顺序)
    pub async fn list_columns(&self, table: &str) -> Result<Vec<String>, TempusError> {
        let names = match &self.pool {
            DynamicPool::Postgres(p) => {
                sqlx::query(
                    "SELECT column_name::text FROM information_schema.columns \
                     WHERE table_name = $1 ORDER BY ordinal_position",
                )
                .bind(table)
                .fetch_all(p)
                .await?
                .into_iter()
                .filter_map(|r| r.try_get::<String, _>(0).ok())
                .collect()
            }
            // 部分版本里 column_name 按二进制返回，CAST 成 CHAR 才能解码为 String
            DynamicPool::MySql(p) => {
                sqlx::query(
                    "SELECT CAST(column_name AS CHAR) FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ordinal_position",
                )
                .bind(table)
                .fetch_all(p)
                .await?
                .into_iter()
                .filter_map(|r| r.try_get::<String, _>(0).ok())
                .collect()
            }
        };
        Ok(names)
    }

    /// 反射主键列，按主键内顺序返回
    pub async fn primary_key(&self, table: &str) -> Result<Vec<String>, TempusError> {
        match &self.pool {
            DynamicPool::Postgres(p) => {
                let rows = sqlx::query(
                    "SELECT a.attname::text FROM pg_index i \
                     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                     WHERE i.indrelid = $1::regclass AND i.indisprimary \
                     ORDER BY array_position(i.indkey, a.attnum)",
                )
                .bind(table)
                .fetch_all(p)
                .await?;
                Ok(rows.into_iter().filter_map(|r| r.try_get::<String, _>(0).ok()).collect())
            }
            DynamicPool::MySql(p) => {
                let rows = sqlx::query(&format!(
                    "SHOW KEYS FROM `{}` WHERE Key_name = 'PRIMARY'",
                    table.replace('`', "``")
                ))
                .fetch_all(p)
                .await?;
                let mut keys: Vec<(i64, String)> = rows
                    .into_iter()
                    .filter_map(|r| {
                        let seq = r
                            .try_get::<u32, _>("Seq_in_index")
                            .map(i64::from)
                            .or_else(|_| r.try_get::<i64, _>("Seq_in_index"))
                            .ok()?;
                        let name = r.try_get::<String, _>("Column_name").ok()?;
                        Some((seq, name))
                    })
                    .collect();
                keys.sort();
                Ok(keys.into_iter().map(|(_, name)| name).collect())
            }
        }
    }
}

impl SqlStore {
    async fn fetch_values(&self, stmt: &SqlStatement) -> Result<Vec<ValueRow>, TempusError> {
        match &self.pool {
            DynamicPool::Postgres(p) => Ok(fetch_in_tx(p, stmt).await?.iter().map(pg_row_values).collect()),
            DynamicPool::MySql(p) => Ok(fetch_in_tx(p, stmt).await?.iter().map(mysql_row_values).collect()),
        }
    }

    async fn fetch_records(&self, stmt: &SqlStatement) -> Result<Vec<Record>, TempusError> {
        match &self.pool {
            DynamicPool::Postgres(p) => Ok(fetch_in_tx(p, stmt).await?.iter().map(pg_row_record).collect()),
            DynamicPool::MySql(p) => Ok(fetch_in_tx(p, stmt).await?.iter().map(mysql_row_record).collect()),
        }
    }
}

#[async_trait]
impl AggregateStore for SqlStore {
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<ValueRow>, TempusError> {
        let stmt = query.render(self.dialect());
        debug!(sql = %stmt.sql, binds = stmt.binds.len(), "执行聚合查询");
        self.fetch_values(&stmt).await
    }

    async fn records(&self, query: &RecordQuery) -> Result<Vec<Record>, TempusError> {
        let stmt = query.render(self.dialect());
        debug!(sql = %stmt.sql, binds = stmt.binds.len(), "执行明细抽取");
        self.fetch_records(&stmt).await
    }
}

/// 开启事务 -> 执行 -> 提交；执行失败时先回滚再把错误交给调用方
async fn fetch_in_tx<DB>(pool: &Pool<DB>, stmt: &SqlStatement) -> Result<Vec<DB::Row>, TempusError>
where
    DB: Database,
    for<'c> &'c mut DB::Connection: Executor<'c, Database = DB>,
    for<'q> DB::Arguments<'q>: IntoArguments<'q, DB>,
    NaiveDateTime: for<'q> Encode<'q, DB> + Type<DB>,
    String: for<'q> Encode<'q, DB> + Type<DB>,
{
    let mut tx = pool.begin().await?;
    let mut query = sqlx::query::<DB>(&stmt.sql);
    for bind in &stmt.binds {
        query = match bind {
            Bind::Timestamp(ts) => query.bind(*ts),
            Bind::Text(text) => query.bind(text.clone()),
        };
    }
    match query.fetch_all(&mut *tx).await {
        Ok(rows) => {
            tx.commit().await?;
            Ok(rows)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "回滚失败");
            }
            Err(e.into())
        }
    }
}

/// 由配置 + 反射构建表注册表 (主键来自数据库，声明的列与实际列比对)
pub async fn load_registry(
    store: &SqlStore,
    tables: &BTreeMap<String, TableSettings>,
) -> Result<TableRegistry, TempusError> {
    let mut descriptors = Vec::with_capacity(tables.len());
    for (name, conf) in tables {
        let descriptor = TableDescriptor {
            name: name.clone(),
            timestamp_column: conf.timestamp.clone(),
            groupable_columns: conf.groupable.iter().cloned().collect(),
            covariate_columns: conf.covariates.iter().cloned().collect(),
            price_column: conf.price.clone(),
            primary_key: store.primary_key(name).await?,
        };

        let actual: BTreeSet<String> = store.list_columns(name).await?.into_iter().collect();
        for column in descriptor.declared_columns() {
            if !actual.contains(column) {
                warn!(table = %name, column = %column, "配置中声明的列在数据库中不存在");
            }
        }
        info!(table = %name, pk = ?descriptor.primary_key, "已加载表描述");
        descriptors.push(descriptor);
    }
    Ok(TableRegistry::new(descriptors))
}
