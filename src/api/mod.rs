//! HTTP API Module
//!
//! Provides the REST API for writes, reads and cluster introspection.

mod http;

pub use http::{AppState, ErrorResponse, HealthResponse, HttpServer, StatusResponse};
