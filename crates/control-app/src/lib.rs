pub mod api;
pub mod config;
pub mod services;

pub use api::{install_metrics, router, AppState};
pub use config::ControlConfig;
pub use services::{ControlService, ServiceError};
