//! Per-service broadcast of committed token transitions
//!
//! Every ledger commit is published here, in commit order, on a channel
//! scoped to the token's service. Publishing never blocks: a slow or
//! disconnected subscriber lags and reconciles with a snapshot fetch
//! (the events are a convenience, not the source of truth).

use crate::domain::token::{epoch_ms, Token, TokenState};
use crate::domain::types::ServiceId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// A committed ledger transition, with the full new token payload
#[derive(Debug, Clone, Serialize)]
pub struct TokenChangeEvent {
    pub token: Token,
    /// None for the insert event of a freshly issued token
    pub old_state: Option<TokenState>,
    pub new_state: TokenState,
    /// Commit timestamp (epoch ms)
    pub ts_ms: u64,
}

impl TokenChangeEvent {
    pub fn new(token: Token, old_state: Option<TokenState>) -> Self {
        let new_state = token.state;
        Self { token, old_state, new_state, ts_ms: epoch_ms() }
    }
}

/// Topic registry: one broadcast channel per service, created on demand
pub struct EventHub {
    capacity: usize,
    channels: Mutex<FxHashMap<ServiceId, broadcast::Sender<TokenChangeEvent>>>,
}

impl EventHub {
    /// `capacity` bounds how far a subscriber may fall behind before it
    /// starts observing `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, channels: Mutex::new(FxHashMap::default()) }
    }

    /// Subscribe to all committed transitions for one service
    pub fn subscribe(&self, service_id: ServiceId) -> broadcast::Receiver<TokenChangeEvent> {
        let mut channels = self.channels.lock();
        channels
            .entry(service_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish a committed transition. Non-blocking; delivery to zero
    /// subscribers is not an error.
    pub fn publish(&self, event: TokenChangeEvent) {
        let channels = self.channels.lock();
        if let Some(tx) = channels.get(&event.token.service_id) {
            let _ = tx.send(event);
        }
    }

    /// Number of live subscribers for a service
    pub fn subscriber_count(&self, service_id: ServiceId) -> usize {
        self.channels.lock().get(&service_id).map_or(0, |tx| tx.receiver_count())
    }
}
