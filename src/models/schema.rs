use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::TempusError;

/// 列在查询中扮演的角色，决定校验时使用哪一个声明集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Groupable,
    Covariate,
    /// 协变量或表的默认价格列
    Response,
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnRole::Groupable => "groupable",
            ColumnRole::Covariate => "covariate",
            ColumnRole::Response => "response",
        };
        f.write_str(name)
    }
}

/// 经过描述符校验的列句柄。只能通过 `TableDescriptor` 获得，
/// 因此查询构建器拿到的列名一定是已声明的。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef(String);

impl ColumnRef {
    pub fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TableDescriptor {
    pub name: String,
    pub timestamp_column: String,
    pub groupable_columns: BTreeSet<String>,
    pub covariate_columns: BTreeSet<String>,
    pub price_column: String,
    pub primary_key: Vec<String>,
}

impl TableDescriptor {
    /// 按角色查找列，未声明的列直接拒绝
    pub fn column(&self, name: &str, role: ColumnRole) -> Result<ColumnRef, TempusError> {
        let declared = match role {
            ColumnRole::Groupable => self.groupable_columns.contains(name),
            ColumnRole::Covariate => self.covariate_columns.contains(name),
            ColumnRole::Response => {
                self.covariate_columns.contains(name) || self.price_column == name
            }
        };
        if !declared {
            return Err(TempusError::InvalidColumn {
                table: self.name.clone(),
                column: name.to_string(),
                role,
            });
        }
        Ok(ColumnRef(name.to_string()))
    }

    pub fn timestamp(&self) -> ColumnRef {
        ColumnRef(self.timestamp_column.clone())
    }

    /// 所有声明过的列 (用于启动时与反射结果比对)
    pub fn declared_columns(&self) -> BTreeSet<&str> {
        let mut cols: BTreeSet<&str> = self
            .groupable_columns
            .iter()
            .chain(self.covariate_columns.iter())
            .map(String::as_str)
            .collect();
        cols.insert(&self.timestamp_column);
        cols.insert(&self.price_column);
        cols
    }
}

/// 表名 -> 描述符。启动后只读。
#[derive(Debug, Serialize, Clone, Default)]
#[serde(transparent)]
pub struct TableRegistry {
    tables: BTreeMap<String, TableDescriptor>,
}

impl TableRegistry {
    pub fn new(tables: impl IntoIterator<Item = TableDescriptor>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&TableDescriptor, TempusError> {
        self.tables
            .get(name)
            .ok_or_else(|| TempusError::UnknownTable(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
