//! HTTP health endpoint
//!
//! # API Endpoints
//!
//! - `GET /healthz` - probes every device plugin socket; `200 ok` when all of
//!   them answer, otherwise `500` with one line per failing resource

pub mod errors;
pub mod handlers;
pub mod server;
pub mod types;

pub use errors::ApiError;
pub use server::HealthServer;
pub use types::HealthProbe;
pub use types::ProbeOutcome;
