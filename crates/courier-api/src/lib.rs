//! Courier HTTP API: enqueue endpoints, the admin control surface, health
//! probes and layered service configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ErrorDetail, ErrorResponse};
pub use server::{create_router, shutdown_signal, start_server, AppState};
