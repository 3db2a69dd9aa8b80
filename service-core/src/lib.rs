//! service-core: Shared infrastructure for the authority workspace.
pub mod config;
pub mod error;
pub mod observability;
pub mod rate_limit;

pub use axum;
pub use serde;
pub use tracing;
pub use validator;
