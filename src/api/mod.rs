pub mod aggregate;
pub mod comparison;
pub mod error;

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::ax_state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api", get(aggregate::list_tables))
        .route("/api/groupby", get(aggregate::groupby))
        .route("/api/groupdo", get(aggregate::groupdo))
        .route("/api/outliers", get(aggregate::outliers))
        .route("/api/outlier_in", get(aggregate::outlier_in))
        .route("/api/series", get(aggregate::series))
        .route("/api/comparison", get(comparison::comparison))
        .route("/api/diffindiff", get(comparison::diffindiff))
        .with_state(state)
}
