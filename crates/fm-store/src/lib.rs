//! SQLite persistence for fm-core engine snapshots, plus config and data
//! directory resolution.

pub mod config;
pub mod error;
mod json_bridge;
pub mod location;
pub mod schema;
pub mod store;

pub use config::{load_config, parse_config, render_config};
pub use error::{Result, StoreError};
pub use location::{StoreLocation, default_base_dir, sanitize_name};
pub use store::Store;
