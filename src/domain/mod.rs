//! Domain models - core business types and the token state machine
//!
//! This module contains the canonical data types used throughout the system:
//! - `Token` - the primary business entity, a customer's place in a queue
//! - `TokenState` - the presence-verified lifecycle state machine
//! - `Service` / `Counter` - the physical service point and its desks
//! - `geo` - pure geofence evaluation (haversine)
//! - `QueueError` - the operation error taxonomy

pub mod error;
pub mod geo;
pub mod token;
pub mod types;

// Re-export commonly used types at module level
pub use error::{ErrorKind, QueueError, Result};
pub use token::{Token, TokenState};
pub use types::{Counter, CounterId, GeoPoint, Service, ServiceId, ServiceStatus, TokenId};
