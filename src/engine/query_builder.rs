//! 把聚合请求翻译成可执行的 SQL。
//!
//! 这里只做纯粹的构建：列名都已经过 `TableDescriptor` 校验 (见 `ColumnRef`)，
//! 取值一律走占位符绑定，执行交给 `AggregateStore`。

use chrono::NaiveDateTime;

use crate::error::TempusError;
use crate::models::query::{AggFunction, TimeRange};
use crate::models::schema::{ColumnRef, ColumnRole, TableDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::MySql => "?".to_string(),
        }
    }

    fn as_text(&self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST({} AS TEXT)", expr),
            Dialect::MySql => format!("CAST({} AS CHAR)", expr),
        }
    }

    /// MySQL 的函数语义为准；Postgres 上 STD/STDDEV/VARIANCE 都映射到总体版本
    fn aggregate(&self, function: AggFunction, expr: &str) -> String {
        match self {
            Dialect::MySql => match function {
                AggFunction::CountDistinct => format!("COUNT(DISTINCT {})", expr),
                other => format!("{}({})", other.name(), expr),
            },
            Dialect::Postgres => match function {
                AggFunction::Avg => format!("avg({})", expr),
                AggFunction::Sum => format!("sum({})", expr),
                AggFunction::Count => format!("count({})", expr),
                AggFunction::CountDistinct => format!("count(DISTINCT {})", expr),
                AggFunction::Min => format!("min({})", expr),
                AggFunction::Max => format!("max({})", expr),
                AggFunction::Std | AggFunction::Stddev | AggFunction::StddevPop => {
                    format!("stddev_pop({})", expr)
                }
                AggFunction::StddevSamp => format!("stddev_samp({})", expr),
                AggFunction::Variance | AggFunction::VarPop => format!("var_pop({})", expr),
                AggFunction::VarSamp => format!("var_samp({})", expr),
                AggFunction::BitAnd => format!("bit_and({})", expr),
                AggFunction::BitOr => format!("bit_or({})", expr),
                AggFunction::BitXor => format!("bit_xor({})", expr),
                AggFunction::GroupConcat => format!("string_agg({}, ',')", self.as_text(expr)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Timestamp(NaiveDateTime),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub binds: Vec<Bind>,
}

/// 可组合的 WHERE 条件，多个条件之间为 AND
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    After(ColumnRef, NaiveDateTime),
    Before(ColumnRef, NaiveDateTime),
    /// 按文本形式比较，分组值来自 HTTP 参数
    Equals(ColumnRef, String),
}

impl Predicate {
    pub fn within(column: &ColumnRef, range: TimeRange) -> [Predicate; 2] {
        [
            Predicate::After(column.clone(), range.start),
            Predicate::Before(column.clone(), range.end),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub function: AggFunction,
    pub column: ColumnRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub table: String,
    pub measures: Vec<Measure>,
    pub group_by: Vec<ColumnRef>,
    pub filters: Vec<Predicate>,
}

impl AggregateQuery {
    /// 分组模式：每个响应变量一个聚合表达式，按全部分组列 GROUP BY。
    /// 结果行 = 聚合值 (按 response 顺序) + 分组键 (按 group_by 顺序)。
    pub fn grouped<G, R>(
        table: &TableDescriptor,
        group_by: &[G],
        responses: &[R],
        function: &str,
        range: Option<TimeRange>,
    ) -> Result<Self, TempusError>
    where
        G: AsRef<str>,
        R: AsRef<str>,
    {
        let function: AggFunction = function.parse()?;
        if group_by.is_empty() {
            return Err(TempusError::EmptySelection("group-by column"));
        }
        if responses.is_empty() {
            return Err(TempusError::EmptySelection("response column"));
        }
        let group_by = group_by
            .iter()
            .map(|g| table.column(g.as_ref(), ColumnRole::Groupable))
            .collect::<Result<Vec<_>, _>>()?;
        let measures = responses
            .iter()
            .map(|r| {
                Ok(Measure {
                    function,
                    column: table.column(r.as_ref(), ColumnRole::Response)?,
                })
            })
            .collect::<Result<Vec<_>, TempusError>>()?;

        Ok(Self {
            table: table.name.clone(),
            measures,
            group_by,
            filters: time_filters(table, range),
        })
    }

    /// 不分组模式：同一个响应变量上依次套用每个函数
    pub fn ungrouped<F>(
        table: &TableDescriptor,
        response: &str,
        functions: &[F],
        range: Option<TimeRange>,
    ) -> Result<Self, TempusError>
    where
        F: AsRef<str>,
    {
        let column = table.column(response, ColumnRole::Response)?;
        if functions.is_empty() {
            return Err(TempusError::EmptySelection("aggregation function"));
        }
        let measures = functions
            .iter()
            .map(|f| {
                Ok(Measure {
                    function: f.as_ref().parse()?,
                    column: column.clone(),
                })
            })
            .collect::<Result<Vec<_>, TempusError>>()?;

        Ok(Self {
            table: table.name.clone(),
            measures,
            group_by: Vec::new(),
            filters: time_filters(table, range),
        })
    }

    pub fn render(&self, dialect: Dialect) -> SqlStatement {
        let mut select: Vec<String> = self
            .measures
            .iter()
            .map(|m| dialect.aggregate(m.function, &dialect.quote(m.column.name())))
            .collect();
        let keys: Vec<String> = self.group_by.iter().map(|c| dialect.quote(c.name())).collect();
        select.extend(keys.iter().cloned());

        let mut sql = format!("SELECT {} FROM {}", select.join(", "), dialect.quote(&self.table));
        let binds = push_where(&mut sql, &self.filters, dialect);
        if !keys.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
        }
        SqlStatement { sql, binds }
    }
}

/// 明细抽取 (时间序列、对照组数据)
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub table: String,
    pub columns: Vec<ColumnRef>,
    pub filters: Vec<Predicate>,
    pub order_by: Option<ColumnRef>,
}

impl RecordQuery {
    pub fn render(&self, dialect: Dialect) -> SqlStatement {
        let columns: Vec<String> = self.columns.iter().map(|c| dialect.quote(c.name())).collect();
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), dialect.quote(&self.table));
        let binds = push_where(&mut sql, &self.filters, dialect);
        if let Some(col) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {}", dialect.quote(col.name())));
        }
        SqlStatement { sql, binds }
    }
}

fn time_filters(table: &TableDescriptor, range: Option<TimeRange>) -> Vec<Predicate> {
    match range {
        Some(range) => Predicate::within(&table.timestamp(), range).to_vec(),
        None => Vec::new(),
    }
}

fn push_where(sql: &mut String, filters: &[Predicate], dialect: Dialect) -> Vec<Bind> {
    let mut binds = Vec::with_capacity(filters.len());
    let mut conds = Vec::with_capacity(filters.len());
    for (i, filter) in filters.iter().enumerate() {
        let ph = dialect.placeholder(i + 1);
        let cond = match filter {
            Predicate::After(col, ts) => {
                binds.push(Bind::Timestamp(*ts));
                format!("{} > {}", dialect.quote(col.name()), ph)
            }
            Predicate::Before(col, ts) => {
                binds.push(Bind::Timestamp(*ts));
                format!("{} < {}", dialect.quote(col.name()), ph)
            }
            Predicate::Equals(col, value) => {
                binds.push(Bind::Text(value.clone()));
                format!("{} = {}", dialect.as_text(&dialect.quote(col.name())), ph)
            }
        };
        conds.push(cond);
    }
    if !conds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    binds
}
