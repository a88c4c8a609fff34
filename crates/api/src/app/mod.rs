//! HTTP application wiring.
//!
//! - `services.rs`: store, broker, analyzer and background task wiring
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request bodies and query strings
//! - `errors.rs`: consistent `{error, message}` responses

use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices, Background};

/// Largest accepted upload.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Build the full HTTP router around already-built services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    routes::router().layer(
        ServiceBuilder::new()
            .layer(Extension(services))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
    )
}
