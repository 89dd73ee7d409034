//! Queue admission: validating and executing join requests

use crate::domain::error::{QueueError, Result};
use crate::domain::token::Token;
use crate::domain::types::{GeoPoint, ServiceId};
use crate::infra::metrics::Metrics;
use crate::services::ledger::{IssueResult, TokenLedger};
use std::sync::Arc;
use tracing::{info, warn};

/// Validates and executes "join queue" requests against the ledger
pub struct AdmissionController {
    ledger: Arc<TokenLedger>,
    metrics: Arc<Metrics>,
}

impl AdmissionController {
    pub fn new(ledger: Arc<TokenLedger>, metrics: Arc<Metrics>) -> Self {
        Self { ledger, metrics }
    }

    /// Join a service's queue.
    ///
    /// Coordinates are optional and only validated when present; the
    /// geofence gates verification, not admission. A repeated join from
    /// a user who already holds an active token returns that token.
    pub fn join(
        &self,
        service_id: ServiceId,
        user_id: &str,
        coordinates: Option<GeoPoint>,
    ) -> Result<Token> {
        if user_id.trim().is_empty() {
            return Err(QueueError::Validation("user identifier must not be empty".into()));
        }
        if let Some(point) = coordinates {
            if !point.is_valid() {
                return Err(QueueError::Validation(format!(
                    "malformed coordinates: ({}, {})",
                    point.latitude, point.longitude
                )));
            }
        }

        match self.ledger.issue(service_id, user_id) {
            Ok(IssueResult::Fresh(token)) => {
                self.metrics.record_token_issued();
                info!(
                    token_id = %token.id,
                    service_id = %service_id,
                    token_number = %token.token_number,
                    "queue_joined"
                );
                Ok(token)
            }
            Ok(IssueResult::Existing(token)) => {
                info!(
                    token_id = %token.id,
                    service_id = %service_id,
                    state = %token.state,
                    "queue_join_idempotent"
                );
                Ok(token)
            }
            Err(e) => {
                self.metrics.record_join_rejected();
                warn!(service_id = %service_id, error = %e, "queue_join_rejected");
                Err(e)
            }
        }
    }
}
