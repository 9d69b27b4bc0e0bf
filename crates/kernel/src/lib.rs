//! Refract Kernel Library
//!
//! On-demand media transformation proxy: fingerprinted requests, a
//! content-addressed disk cache, and coalescing of concurrent identical
//! requests. The main entry point for running the server is the `refract`
//! binary.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod flight;
pub mod metrics;
pub mod request;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

pub use config::Config;
pub use error::{ProxyError, ProxyResult, SourceError};
pub use fingerprint::Fingerprint;
pub use request::{AspectMode, ImageParams, OutputFormat, OutputSize, TransformRequest};
pub use services::coordinator::{CacheStatus, Resolved, TransformCoordinator};
pub use state::AppState;
