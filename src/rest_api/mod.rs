//! HTTP surface for probes and metrics
//!
//! Serves `/healthz`, `/readyz` and, with the `metrics` feature,
//! `/metrics`.

mod dto;
mod handlers;
mod server;

pub use dto::{HealthResponse, ReadyResponse};
pub use server::{router, run_server, ApiState};
