use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;

use crate::error::TempusError;

/// 根配置，对应 `tempus.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub causal: CausalSettings,
    /// 表名 -> 列角色声明
    #[serde(default)]
    pub tables: BTreeMap<String, TableSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// 不配置时回退到 `DATABASE_URL`
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl DatabaseSettings {
    pub fn resolve_url(&self) -> Result<String, TempusError> {
        self.url
            .clone()
            .or_else(|| env::var("DATABASE_URL").ok())
            .ok_or_else(|| {
                TempusError::Config(config::ConfigError::NotFound(
                    "database.url (or DATABASE_URL)".to_string(),
                ))
            })
    }
}

/// 外部因果推断服务 (匹配对照组、双重差分)
#[derive(Debug, Clone, Deserialize)]
pub struct CausalSettings {
    #[serde(default = "default_causal_url")]
    pub base_url: String,
    #[serde(default = "default_causal_timeout")]
    pub timeout_secs: u64,
}

impl Default for CausalSettings {
    fn default() -> Self {
        Self {
            base_url: default_causal_url(),
            timeout_secs: default_causal_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSettings {
    pub timestamp: String,
    pub price: String,
    #[serde(default)]
    pub groupable: Vec<String>,
    #[serde(default)]
    pub covariates: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout() -> u64 {
    5
}
fn default_causal_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_causal_timeout() -> u64 {
    60
}

/// 读取 `tempus.toml` (路径可用 `TEMPUS_CONFIG` 覆盖)，
/// 再叠加 `TEMPUS__SECTION__KEY` 形式的环境变量
pub fn load_settings() -> Result<Settings, TempusError> {
    let path = env::var("TEMPUS_CONFIG").unwrap_or_else(|_| "tempus.toml".to_string());
    let builder = config::Config::builder()
        .add_source(config::File::with_name(&path).required(false))
        .add_source(environment(env::vars().collect()))
        .build()?;

    let settings = builder.try_deserialize::<Settings>()?;
    Ok(settings)
}

/// 数值和布尔按类型解析；`TEMPUS__TABLES__<表>__GROUPABLE` 与
/// `__COVARIATES` 按逗号拆成列表
fn environment(vars: config::Map<String, String>) -> config::Environment {
    let list_keys: Vec<String> = vars.keys().filter_map(|var| list_key(var)).collect();
    let mut source = config::Environment::with_prefix("TEMPUS")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true);
    // 设了分隔符却没有指定键时，所有值都会被拆成列表
    if !list_keys.is_empty() {
        source = source.list_separator(",");
        for key in &list_keys {
            source = source.with_list_parse_key(key);
        }
    }
    source.source(Some(vars))
}

fn list_key(var: &str) -> Option<String> {
    let path = var.to_lowercase().strip_prefix("tempus__")?.to_string();
    let parts: Vec<&str> = path.split("__").collect();
    match parts.as_slice() {
        ["tables", _, "groupable" | "covariates"] => Some(parts.join(".")),
        _ => None,
    }
}
