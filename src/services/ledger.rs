//! Token ledger - the single writer of queue state
//!
//! Owns services, counters, tokens, per-service numbering, and the
//! counter assignment table. Every mutating operation runs as one
//! critical section over the shared state, so concurrent joins, verifies
//! and dispatches serialize here. Committed transitions are published to
//! the event hub before the lock is released, which keeps the delivery
//! order of a service's events identical to its commit order.

use crate::domain::error::{QueueError, Result};
use crate::domain::token::{Token, TokenState};
use crate::domain::types::{
    Counter, CounterId, GeoPoint, Service, ServiceId, ServiceStatus, TokenId,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::events::{EventHub, TokenChangeEvent};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of an issue request
#[derive(Debug, Clone, PartialEq)]
pub enum IssueResult {
    /// A new token was created and entered WAITING
    Fresh(Token),
    /// The user already held an active token for this service
    Existing(Token),
}

impl IssueResult {
    pub fn into_token(self) -> Token {
        match self {
            IssueResult::Fresh(token) | IssueResult::Existing(token) => token,
        }
    }
}

/// Outcome of entering the CONFIRMING guard
#[derive(Debug, Clone, PartialEq)]
pub enum BeginConfirm {
    /// Guard taken; evaluate the geofence and resolve with [`TokenLedger::resolve_confirm`]
    Started(ConfirmTicket),
    /// Token already CONFIRMED; verification is idempotent
    AlreadyConfirmed(Token),
}

/// Snapshot handed to the presence verifier while a token is CONFIRMING
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmTicket {
    pub token: Token,
    pub anchor: GeoPoint,
    pub radius_m: f64,
    /// State to revert to if the geofence check fails
    pub prior: TokenState,
}

/// Counts from one timeout sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub missed: usize,
    pub expired: usize,
}

struct LedgerState {
    services: FxHashMap<ServiceId, Service>,
    counters: FxHashMap<CounterId, Counter>,
    tokens: FxHashMap<TokenId, Token>,
    /// Next token_number per service; numbers are never reused
    next_number: FxHashMap<ServiceId, u64>,
    /// Counter -> token currently CALLED/SERVING there
    assignments: FxHashMap<CounterId, TokenId>,
}

/// Single source of truth for queue state
pub struct TokenLedger {
    state: Mutex<LedgerState>,
    events: Arc<EventHub>,
    metrics: Arc<Metrics>,
    near_threshold: usize,
}

impl TokenLedger {
    pub fn new(config: &Config, events: Arc<EventHub>, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                services: FxHashMap::default(),
                counters: FxHashMap::default(),
                tokens: FxHashMap::default(),
                next_number: FxHashMap::default(),
                assignments: FxHashMap::default(),
            }),
            events,
            metrics,
            near_threshold: config.near_threshold(),
        }
    }

    // --- registry ---

    /// Register a service. New services start Closed.
    pub fn create_service(
        &self,
        name: &str,
        latitude: f64,
        longitude: f64,
        presence_radius_m: f64,
    ) -> Service {
        let service = Service::new(name, latitude, longitude, presence_radius_m);
        let mut state = self.state.lock();
        state.next_number.insert(service.id, 1);
        state.services.insert(service.id, service.clone());
        info!(
            service_id = %service.id,
            name = %service.name,
            radius_m = %service.presence_radius_m,
            "service_created"
        );
        service
    }

    /// Add a counter to an existing service
    pub fn add_counter(&self, service_id: ServiceId, name: &str) -> Result<Counter> {
        let mut state = self.state.lock();
        if !state.services.contains_key(&service_id) {
            return Err(QueueError::ServiceNotFound);
        }
        let counter = Counter::new(service_id, name);
        state.counters.insert(counter.id, counter.clone());
        info!(counter_id = %counter.id, service_id = %service_id, name = %name, "counter_created");
        Ok(counter)
    }

    pub fn service(&self, service_id: ServiceId) -> Result<Service> {
        self.state.lock().services.get(&service_id).cloned().ok_or(QueueError::ServiceNotFound)
    }

    pub fn counter(&self, counter_id: CounterId) -> Result<Counter> {
        self.state.lock().counters.get(&counter_id).cloned().ok_or(QueueError::CounterNotFound)
    }

    pub fn token(&self, token_id: TokenId) -> Result<Token> {
        self.state.lock().tokens.get(&token_id).cloned().ok_or(QueueError::TokenNotFound)
    }

    /// Flip a service OPEN/CLOSED. Closing only blocks new joins; active
    /// tokens keep progressing.
    pub fn set_service_status(
        &self,
        service_id: ServiceId,
        status: ServiceStatus,
    ) -> Result<Service> {
        let mut state = self.state.lock();
        let service = state.services.get_mut(&service_id).ok_or(QueueError::ServiceNotFound)?;
        service.status = status;
        let service = service.clone();
        info!(service_id = %service_id, status = %status.as_str(), "service_status_set");
        Ok(service)
    }

    /// All non-terminal tokens for a service, ordered by token_number.
    /// This is the authoritative ordering clients derive people-ahead from.
    pub fn active_tokens(&self, service_id: ServiceId) -> Result<Vec<Token>> {
        let state = self.state.lock();
        if !state.services.contains_key(&service_id) {
            return Err(QueueError::ServiceNotFound);
        }
        let mut tokens: Vec<Token> = state
            .tokens
            .values()
            .filter(|t| t.service_id == service_id && t.state.is_active())
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.token_number);
        Ok(tokens)
    }

    /// The user's active token for a service, if any
    pub fn active_token_for_user(&self, service_id: ServiceId, user_id: &str) -> Option<Token> {
        let state = self.state.lock();
        state
            .tokens
            .values()
            .find(|t| t.service_id == service_id && t.user_id == user_id && t.state.is_active())
            .cloned()
    }

    /// Number of queued tokens ahead of this one (recomputed, never stored)
    pub fn queue_ahead_count(&self, token_id: TokenId) -> Result<usize> {
        let state = self.state.lock();
        let token = state.tokens.get(&token_id).ok_or(QueueError::TokenNotFound)?;
        Ok(Self::ahead_of(&state, token))
    }

    /// Tokens currently in each lifecycle state, across all services
    pub fn state_census(&self) -> FxHashMap<TokenState, usize> {
        let state = self.state.lock();
        let mut census = FxHashMap::default();
        for token in state.tokens.values() {
            *census.entry(token.state).or_insert(0) += 1;
        }
        census
    }

    // --- admission ---

    /// Atomically allocate the next number and create a WAITING token.
    ///
    /// Retry-tolerant: if the user already holds an active token for the
    /// service, that token is returned unchanged instead of an error.
    pub fn issue(&self, service_id: ServiceId, user_id: &str) -> Result<IssueResult> {
        let mut state = self.state.lock();
        let service = state.services.get(&service_id).ok_or(QueueError::ServiceNotFound)?;
        if service.status != ServiceStatus::Open {
            return Err(QueueError::ServiceClosed);
        }

        if let Some(existing) = state
            .tokens
            .values()
            .find(|t| t.service_id == service_id && t.user_id == user_id && t.state.is_active())
        {
            debug!(
                token_id = %existing.id,
                service_id = %service_id,
                state = %existing.state,
                "token_issue_returned_existing"
            );
            return Ok(IssueResult::Existing(existing.clone()));
        }

        let number = {
            let next = state.next_number.entry(service_id).or_insert(1);
            let number = *next;
            *next += 1;
            number
        };

        let mut token = Token::issue(service_id, user_id, number);
        let mut events = Vec::new();
        Self::transition(&mut token, TokenState::Waiting)?;
        events.push(TokenChangeEvent::new(token.clone(), None));
        info!(
            token_id = %token.id,
            service_id = %service_id,
            token_number = %number,
            "token_issued"
        );

        state.tokens.insert(token.id, token.clone());
        self.promote_near(&mut state, service_id, &mut events);
        // The fresh token may itself be near the front already
        let token = state.tokens.get(&token.id).cloned().unwrap_or(token);
        self.publish_all(events);
        Ok(IssueResult::Fresh(token))
    }

    // --- presence verification (two-phase) ---

    /// Take the CONFIRMING guard for a token.
    ///
    /// At most one verification attempt per token may hold the guard; a
    /// concurrent second attempt fails immediately with AlreadyVerifying.
    pub fn begin_confirm(&self, token_id: TokenId) -> Result<BeginConfirm> {
        let mut state = self.state.lock();
        let token = state.tokens.get(&token_id).cloned().ok_or(QueueError::TokenNotFound)?;
        match token.state {
            TokenState::Confirmed => return Ok(BeginConfirm::AlreadyConfirmed(token)),
            TokenState::Confirming => return Err(QueueError::AlreadyVerifying),
            TokenState::Waiting | TokenState::Near => {}
            from => {
                return Err(QueueError::InvalidTransition { from, to: TokenState::Confirming })
            }
        }

        let service =
            state.services.get(&token.service_id).cloned().ok_or(QueueError::ServiceNotFound)?;

        let prior = token.state;
        let token = {
            let slot = state.tokens.get_mut(&token_id).expect("token fetched above");
            Self::transition(slot, TokenState::Confirming)?;
            slot.clone()
        };
        debug!(token_id = %token_id, prior = %prior, "presence_confirming");
        self.publish_all(vec![TokenChangeEvent::new(token.clone(), Some(prior))]);

        Ok(BeginConfirm::Started(ConfirmTicket {
            token,
            anchor: service.anchor(),
            radius_m: service.presence_radius_m,
            prior,
        }))
    }

    /// Commit or revert a CONFIRMING token.
    ///
    /// Fails with Concurrency if the token left CONFIRMING in the
    /// meantime (sweeper or admin action); the caller may retry.
    pub fn resolve_confirm(
        &self,
        token_id: TokenId,
        prior: TokenState,
        accepted: bool,
    ) -> Result<Token> {
        let mut state = self.state.lock();
        let token = state.tokens.get_mut(&token_id).ok_or(QueueError::TokenNotFound)?;
        if token.state != TokenState::Confirming {
            return Err(QueueError::Concurrency(format!(
                "token left CONFIRMING during verification (now {})",
                token.state
            )));
        }

        let target = if accepted { TokenState::Confirmed } else { prior };
        let from = Self::transition(token, target)?;
        let token = token.clone();
        if accepted {
            info!(token_id = %token_id, "presence_confirmed");
        } else {
            debug!(token_id = %token_id, reverted_to = %target, "presence_reverted");
        }
        self.publish_all(vec![TokenChangeEvent::new(token.clone(), Some(from))]);
        Ok(token)
    }

    // --- dispatch ---

    /// Select and call the best eligible token for a free counter.
    ///
    /// CONFIRMED beats WAITING/NEAR; within a tier, lowest token_number.
    /// Selection and assignment are one critical section, so two counters
    /// calling concurrently always receive distinct tokens.
    pub fn call_next(&self, service_id: ServiceId, counter_id: CounterId) -> Result<Option<Token>> {
        let mut state = self.state.lock();
        if !state.services.contains_key(&service_id) {
            return Err(QueueError::ServiceNotFound);
        }
        let counter = state.counters.get(&counter_id).ok_or(QueueError::CounterNotFound)?;
        if counter.service_id != service_id {
            return Err(QueueError::Validation(format!(
                "counter {counter_id} does not belong to service {service_id}"
            )));
        }
        if state.assignments.contains_key(&counter_id) {
            return Err(QueueError::CounterOccupied);
        }

        let Some(token_id) = Self::select_next(&state, service_id) else {
            debug!(service_id = %service_id, counter_id = %counter_id, "call_next_none_eligible");
            return Ok(None);
        };

        let mut events = Vec::new();
        let token = {
            let token = state.tokens.get_mut(&token_id).expect("selected token exists");
            let from = Self::transition(token, TokenState::Called)?;
            token.counter_id = Some(counter_id);
            events.push(TokenChangeEvent::new(token.clone(), Some(from)));
            token.clone()
        };
        state.assignments.insert(counter_id, token_id);
        info!(
            token_id = %token_id,
            token_number = %token.token_number,
            service_id = %service_id,
            counter_id = %counter_id,
            "token_called"
        );

        self.promote_near(&mut state, service_id, &mut events);
        self.publish_all(events);
        Ok(Some(token))
    }

    /// Entry proof accepted: CALLED -> SERVING
    pub fn start_serving(&self, token_id: TokenId, proof: &str) -> Result<Token> {
        let mut state = self.state.lock();
        let token = state.tokens.get_mut(&token_id).ok_or(QueueError::TokenNotFound)?;
        if token.entry_code != proof {
            return Err(QueueError::InvalidProof);
        }
        if token.state != TokenState::Called {
            return Err(QueueError::InvalidTransition {
                from: token.state,
                to: TokenState::Serving,
            });
        }
        let from = Self::transition(token, TokenState::Serving)?;
        let token = token.clone();
        info!(token_id = %token_id, counter_id = ?token.counter_id, "service_started");
        self.publish_all(vec![TokenChangeEvent::new(token.clone(), Some(from))]);
        Ok(token)
    }

    /// Exit proof accepted: SERVING -> DONE, counter released
    pub fn finish_serving(&self, token_id: TokenId, proof: &str) -> Result<Token> {
        let mut state = self.state.lock();
        let token = state.tokens.get_mut(&token_id).ok_or(QueueError::TokenNotFound)?;
        if token.exit_code != proof {
            return Err(QueueError::InvalidProof);
        }
        if token.state != TokenState::Serving {
            return Err(QueueError::InvalidTransition { from: token.state, to: TokenState::Done });
        }
        let from = Self::transition(token, TokenState::Done)?;
        let released = token.counter_id.take();
        let token = token.clone();
        if let Some(counter_id) = released {
            state.assignments.remove(&counter_id);
        }
        info!(token_id = %token_id, counter_id = ?released, "service_completed");
        self.publish_all(vec![TokenChangeEvent::new(token.clone(), Some(from))]);
        Ok(token)
    }

    /// Administrative cancellation: any active state -> MISSED
    pub fn cancel(&self, token_id: TokenId) -> Result<Token> {
        let mut state = self.state.lock();
        let token = state.tokens.get_mut(&token_id).ok_or(QueueError::TokenNotFound)?;
        let was_queued = token.state.is_queued();
        let from = Self::transition(token, TokenState::Missed)?;
        let released = token.counter_id.take();
        let token = token.clone();
        if let Some(counter_id) = released {
            state.assignments.remove(&counter_id);
        }
        info!(token_id = %token_id, from = %from, "token_cancelled");

        let mut events = vec![TokenChangeEvent::new(token.clone(), Some(from))];
        if was_queued {
            self.promote_near(&mut state, token.service_id, &mut events);
        }
        self.publish_all(events);
        Ok(token)
    }

    /// Token currently assigned to a counter, if any
    pub fn assignment(&self, counter_id: CounterId) -> Option<TokenId> {
        self.state.lock().assignments.get(&counter_id).copied()
    }

    // --- timeout sweep ---

    /// Retire CALLED no-shows to MISSED and over-age WAITING/NEAR tokens
    /// to EXPIRED. Driven by the periodic sweeper, never by callers.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        called_timeout: Duration,
        max_wait: Duration,
    ) -> SweepOutcome {
        let called_limit = ChronoDuration::from_std(called_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 1_000));
        let wait_limit = ChronoDuration::from_std(max_wait)
            .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 1_000));

        let mut state = self.state.lock();
        let mut outcome = SweepOutcome::default();
        let mut events = Vec::new();
        let mut touched_services = Vec::new();

        let due: Vec<TokenId> = state
            .tokens
            .values()
            .filter(|t| match t.state {
                TokenState::Called => now - t.state_changed_at > called_limit,
                TokenState::Waiting | TokenState::Near => now - t.issued_at > wait_limit,
                _ => false,
            })
            .map(|t| t.id)
            .collect();

        for token_id in due {
            let token = state.tokens.get_mut(&token_id).expect("due token exists");
            let (target, field) = match token.state {
                TokenState::Called => (TokenState::Missed, &mut outcome.missed),
                _ => (TokenState::Expired, &mut outcome.expired),
            };
            // The table guarantees these transitions; skip rather than panic
            let Ok(from) = Self::transition(token, target) else { continue };
            *field += 1;
            let released = token.counter_id.take();
            let token = token.clone();
            if let Some(counter_id) = released {
                state.assignments.remove(&counter_id);
            }
            info!(
                token_id = %token_id,
                from = %from,
                to = %target,
                "token_swept"
            );
            if !touched_services.contains(&token.service_id) {
                touched_services.push(token.service_id);
            }
            events.push(TokenChangeEvent::new(token, Some(from)));
        }

        for service_id in touched_services {
            self.promote_near(&mut state, service_id, &mut events);
        }
        self.publish_all(events);
        outcome
    }

    // --- internals ---

    /// Apply one guarded transition, stamping state_changed_at
    fn transition(token: &mut Token, to: TokenState) -> Result<TokenState> {
        let from = token.state;
        if !from.can_transition(to) {
            return Err(QueueError::InvalidTransition { from, to });
        }
        token.state = to;
        token.state_changed_at = Utc::now();
        Ok(from)
    }

    /// Queued tokens ahead of `token` in its service
    fn ahead_of(state: &LedgerState, token: &Token) -> usize {
        state
            .tokens
            .values()
            .filter(|t| {
                t.service_id == token.service_id
                    && t.state.is_queued()
                    && t.token_number < token.token_number
            })
            .count()
    }

    /// Best eligible token: CONFIRMED tier first, then WAITING/NEAR,
    /// lowest number within the tier
    fn select_next(state: &LedgerState, service_id: ServiceId) -> Option<TokenId> {
        let eligible = |t: &&Token, tier: fn(TokenState) -> bool| {
            t.service_id == service_id && tier(t.state)
        };
        state
            .tokens
            .values()
            .filter(|t| eligible(t, |s| s == TokenState::Confirmed))
            .min_by_key(|t| t.token_number)
            .or_else(|| {
                state
                    .tokens
                    .values()
                    .filter(|t| {
                        eligible(t, |s| matches!(s, TokenState::Waiting | TokenState::Near))
                    })
                    .min_by_key(|t| t.token_number)
            })
            .map(|t| t.id)
    }

    /// Promote WAITING tokens whose queue-ahead count has dropped to the
    /// near threshold. Advisory only; does not gate verification.
    fn promote_near(
        &self,
        state: &mut LedgerState,
        service_id: ServiceId,
        events: &mut Vec<TokenChangeEvent>,
    ) {
        let mut queued: Vec<(TokenId, TokenState, u64)> = state
            .tokens
            .values()
            .filter(|t| t.service_id == service_id && t.state.is_queued())
            .map(|t| (t.id, t.state, t.token_number))
            .collect();
        queued.sort_by_key(|(_, _, number)| *number);

        for (ahead, (token_id, token_state, _)) in queued.into_iter().enumerate() {
            if ahead > self.near_threshold {
                break;
            }
            if token_state != TokenState::Waiting {
                continue;
            }
            let token = state.tokens.get_mut(&token_id).expect("queued token exists");
            let Ok(from) = Self::transition(token, TokenState::Near) else { continue };
            debug!(token_id = %token_id, ahead = %ahead, "token_near");
            events.push(TokenChangeEvent::new(token.clone(), Some(from)));
        }
    }

    /// Publish committed events in commit order, counting each
    fn publish_all(&self, events: Vec<TokenChangeEvent>) {
        for event in events {
            self.metrics.record_event_published();
            self.events.publish(event);
        }
    }
}
