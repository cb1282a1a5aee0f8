pub mod causal_client;
pub mod db_external;
pub mod settings;
pub mod store;
pub mod utils;
