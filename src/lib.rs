pub mod api;
pub mod engine;
pub mod error;
pub mod infra;
pub mod models;

#[cfg(test)]
mod test_utils;

pub mod ax_state {
    use std::sync::Arc;

    use crate::engine::aggregation::AggregationEngine;
    use crate::engine::bridge::ComparisonBridge;
    use crate::engine::outliers::OutlierDetector;
    use crate::models::schema::TableRegistry;

    pub struct AppState {
        pub registry: Arc<TableRegistry>,
        pub engine: AggregationEngine,
        pub detector: OutlierDetector,
        pub bridge: ComparisonBridge,
    }

    impl AppState {
        pub fn new(engine: AggregationEngine, bridge: ComparisonBridge) -> Self {
            Self {
                registry: engine.shared_registry(),
                detector: OutlierDetector::new(engine.clone()),
                engine,
                bridge,
            }
        }
    }
}
