//! Presence verification: geofence-gated WAITING/NEAR -> CONFIRMED

use crate::domain::error::{QueueError, Result};
use crate::domain::geo;
use crate::domain::token::Token;
use crate::domain::types::{GeoPoint, TokenId};
use crate::infra::metrics::Metrics;
use crate::services::ledger::{BeginConfirm, TokenLedger};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a verification attempt. A geofence rejection is a domain
/// outcome (`accepted = false`), not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub accepted: bool,
    pub message: String,
    pub token: Token,
}

/// Orchestrates the two-phase CONFIRMING -> CONFIRMED/revert flow
pub struct PresenceVerifier {
    ledger: Arc<TokenLedger>,
    metrics: Arc<Metrics>,
}

impl PresenceVerifier {
    pub fn new(ledger: Arc<TokenLedger>, metrics: Arc<Metrics>) -> Self {
        Self { ledger, metrics }
    }

    /// Verify a reported position against the token's service geofence.
    ///
    /// Safe to retry: after success, repeated calls re-confirm without
    /// side effects. A concurrent attempt on the same token is rejected
    /// with AlreadyVerifying while the first holds the CONFIRMING guard.
    pub fn verify(&self, token_id: TokenId, coordinates: GeoPoint) -> Result<VerifyOutcome> {
        if !coordinates.is_valid() {
            return Err(QueueError::Validation(format!(
                "malformed coordinates: ({}, {})",
                coordinates.latitude, coordinates.longitude
            )));
        }

        let ticket = match self.ledger.begin_confirm(token_id)? {
            BeginConfirm::AlreadyConfirmed(token) => {
                debug!(token_id = %token_id, "presence_already_confirmed");
                return Ok(VerifyOutcome {
                    accepted: true,
                    message: "You are confirmed.".to_string(),
                    token,
                });
            }
            BeginConfirm::Started(ticket) => ticket,
        };

        let distance_m = geo::haversine_distance_m(coordinates, ticket.anchor);
        let accepted = distance_m <= ticket.radius_m;
        let token = self.ledger.resolve_confirm(token_id, ticket.prior, accepted)?;

        if accepted {
            self.metrics.record_presence_confirmed();
            info!(
                token_id = %token_id,
                distance_m = %distance_m,
                radius_m = %ticket.radius_m,
                "presence_verified"
            );
            Ok(VerifyOutcome { accepted: true, message: "You are confirmed.".to_string(), token })
        } else {
            self.metrics.record_presence_rejected();
            info!(
                token_id = %token_id,
                distance_m = %distance_m,
                radius_m = %ticket.radius_m,
                "presence_too_far"
            );
            Ok(VerifyOutcome {
                accepted: false,
                message: format!(
                    "You are too far from the service location: {distance_m:.0} m away, within {:.0} m required.",
                    ticket.radius_m
                ),
                token,
            })
        }
    }
}
