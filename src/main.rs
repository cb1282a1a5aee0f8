use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tempus::api;
use tempus::ax_state::AppState;
use tempus::engine::aggregation::AggregationEngine;
use tempus::engine::bridge::ComparisonBridge;
use tempus::infra::causal_client::HttpCausalService;
use tempus::infra::db_external::{load_registry, SqlStore};
use tempus::infra::settings::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tempus=info,tower_http=info")),
        )
        .init();

    let settings = load_settings()?;
    let store = SqlStore::connect(&settings.database).await?;
    info!(dialect = ?store.dialect(), "数据库连接池已建立");

    // 注册表在启动后只读
    let registry = Arc::new(load_registry(&store, &settings.tables).await?);
    info!(tables = registry.len(), "表注册完成");

    let engine = AggregationEngine::new(registry, Arc::new(store));
    let causal = Arc::new(HttpCausalService::new(&settings.causal)?);
    let bridge = ComparisonBridge::new(engine.clone(), causal);
    let state = Arc::new(AppState::new(engine, bridge));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = api::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = settings.server.bind.parse()?;
    info!("🚀 Tempus 运行在 http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
