//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `api` - HTTP request/response surface and Prometheus endpoint
//! - `events` - Per-service broadcast of committed token transitions

pub mod api;
pub mod events;

// Re-export commonly used types
pub use api::{start_api_server, ApiContext};
pub use events::{EventHub, TokenChangeEvent};
