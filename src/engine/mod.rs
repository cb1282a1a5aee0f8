pub mod aggregation;
pub mod bridge;
pub mod outliers;
pub mod query_builder;
