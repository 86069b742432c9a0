pub mod config;
pub mod database;
pub mod error;
pub mod json_bridge;
pub mod schema;
pub mod store;

pub use config::{CONFIG_FILE, load_config};
pub use database::{DATABASE_FILE, Database, default_data_dir};
pub use error::{Result, StoreError};
pub use store::{Store, StoreStats};
