//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `ledger` - Token ledger, the single writer of queue state
//! - `admission` - Join-queue validation and execution
//! - `presence` - Geofence-gated presence verification
//! - `dispatcher` - Counter assignment and the served-token flow
//! - `sweeper` - Periodic MISSED/EXPIRED timeout sweep

pub mod admission;
pub mod dispatcher;
pub mod ledger;
pub mod presence;
pub mod sweeper;

// Re-export commonly used types
pub use admission::AdmissionController;
pub use dispatcher::CallDispatcher;
pub use ledger::{BeginConfirm, ConfirmTicket, IssueResult, SweepOutcome, TokenLedger};
pub use presence::{PresenceVerifier, VerifyOutcome};
pub use sweeper::Sweeper;
