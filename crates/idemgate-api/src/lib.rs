//! # idemgate-api
//!
//! HTTP surface for idempotent request execution.
//!
//! This crate wires the coordinator from `idemgate-core` into an axum
//! application:
//!
//! - **Middleware**: key resolution, claim/wait, capture and replay
//! - **Configuration**: environment variables plus the policy file
//! - **Observability**: request metrics, health and readiness checks
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health   - Health check
//! GET  /ready    - Readiness check (pings the shared store)
//! GET  /metrics  - Prometheus metrics
//! POST /         - Demonstration handler (echo after `delay` ms)
//! ```
//!
//! Coordinated responses carry `x-idempotency-key`, `x-idempotency-duration`
//! and `x-idempotency-source`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use idemgate_api::server::Server;
//!
//! let server = Server::builder()
//!     .http_port(3000)
//!     .debug(true)
//!     .build();
//!
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod capture;
pub mod config;
pub mod demo;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod server;
