//! Call dispatch: counter assignment and the served-token flow

use crate::domain::error::Result;
use crate::domain::token::Token;
use crate::domain::types::{CounterId, Service, ServiceId, ServiceStatus, TokenId};
use crate::infra::metrics::Metrics;
use crate::services::ledger::TokenLedger;
use std::sync::Arc;
use tracing::info;

/// Assigns eligible tokens to counters and drives
/// CALLED -> SERVING -> DONE, plus administrative cancellation.
pub struct CallDispatcher {
    ledger: Arc<TokenLedger>,
    metrics: Arc<Metrics>,
}

impl CallDispatcher {
    pub fn new(ledger: Arc<TokenLedger>, metrics: Arc<Metrics>) -> Self {
        Self { ledger, metrics }
    }

    /// Call the best eligible token to a free counter.
    ///
    /// Returns None when no token is eligible; the ledger guarantees two
    /// concurrent calls never receive the same token.
    pub fn call_next(&self, service_id: ServiceId, counter_id: CounterId) -> Result<Option<Token>> {
        let called = self.ledger.call_next(service_id, counter_id)?;
        if called.is_some() {
            self.metrics.record_call_dispatched();
        }
        Ok(called)
    }

    /// Admin scanned the customer's entry QR at the counter
    pub fn complete_arrival(&self, token_id: TokenId, proof: &str) -> Result<Token> {
        let token = self.ledger.start_serving(token_id, proof)?;
        self.metrics.record_arrival();
        Ok(token)
    }

    /// Customer scanned the desk's exit QR; the counter frees up
    pub fn complete_service(&self, token_id: TokenId, proof: &str) -> Result<Token> {
        let token = self.ledger.finish_serving(token_id, proof)?;
        self.metrics.record_service_completed();
        Ok(token)
    }

    /// Administrative skip/cancel: any active token -> MISSED
    pub fn cancel(&self, token_id: TokenId) -> Result<Token> {
        let token = self.ledger.cancel(token_id)?;
        self.metrics.record_token_cancelled();
        Ok(token)
    }

    /// OPEN <-> CLOSED. Closing never terminates active tokens; it only
    /// stops new joins.
    pub fn toggle_service(&self, service_id: ServiceId, status: ServiceStatus) -> Result<Service> {
        let service = self.ledger.set_service_status(service_id, status)?;
        info!(service_id = %service_id, status = %status.as_str(), "service_toggled");
        Ok(service)
    }
}
