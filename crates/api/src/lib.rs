//! Agendou API Library
//!
//! HTTP surface for the billing subsystem: gateway webhooks, tenant
//! wallet endpoints, and checkout creation.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
