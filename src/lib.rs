pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod resources;
pub mod storage;
pub mod wait;

pub use config::Settings;
pub use error::{DeployError, Result};
pub use manager::DeploymentManager;
pub use storage::Storage;
