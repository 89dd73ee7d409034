//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Cumulative engine counters
#[derive(Default)]
pub struct Metrics {
    tokens_issued: AtomicU64,
    joins_rejected: AtomicU64,
    presence_confirmed: AtomicU64,
    presence_rejected: AtomicU64,
    calls_dispatched: AtomicU64,
    arrivals: AtomicU64,
    services_completed: AtomicU64,
    tokens_cancelled: AtomicU64,
    swept_missed: AtomicU64,
    swept_expired: AtomicU64,
    events_published: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSummary {
    pub tokens_issued: u64,
    pub joins_rejected: u64,
    pub presence_confirmed: u64,
    pub presence_rejected: u64,
    pub calls_dispatched: u64,
    pub arrivals: u64,
    pub services_completed: u64,
    pub tokens_cancelled: u64,
    pub swept_missed: u64,
    pub swept_expired: u64,
    pub events_published: u64,
}

impl MetricsSummary {
    /// Emit the summary as a single structured log line
    pub fn log(&self) {
        info!(
            tokens_issued = %self.tokens_issued,
            joins_rejected = %self.joins_rejected,
            presence_confirmed = %self.presence_confirmed,
            presence_rejected = %self.presence_rejected,
            calls_dispatched = %self.calls_dispatched,
            arrivals = %self.arrivals,
            services_completed = %self.services_completed,
            tokens_cancelled = %self.tokens_cancelled,
            swept_missed = %self.swept_missed,
            swept_expired = %self.swept_expired,
            events_published = %self.events_published,
            "metrics_summary"
        );
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_token_issued(&self) {
        self.tokens_issued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_join_rejected(&self) {
        self.joins_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_presence_confirmed(&self) {
        self.presence_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_presence_rejected(&self) {
        self.presence_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_call_dispatched(&self) {
        self.calls_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_arrival(&self) {
        self.arrivals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_service_completed(&self) {
        self.services_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_token_cancelled(&self) {
        self.tokens_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_swept_missed(&self, count: u64) {
        self.swept_missed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_swept_expired(&self, count: u64) {
        self.swept_expired.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters
    pub fn report(&self) -> MetricsSummary {
        MetricsSummary {
            tokens_issued: self.tokens_issued.load(Ordering::Relaxed),
            joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
            presence_confirmed: self.presence_confirmed.load(Ordering::Relaxed),
            presence_rejected: self.presence_rejected.load(Ordering::Relaxed),
            calls_dispatched: self.calls_dispatched.load(Ordering::Relaxed),
            arrivals: self.arrivals.load(Ordering::Relaxed),
            services_completed: self.services_completed.load(Ordering::Relaxed),
            tokens_cancelled: self.tokens_cancelled.load(Ordering::Relaxed),
            swept_missed: self.swept_missed.load(Ordering::Relaxed),
            swept_expired: self.swept_expired.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
        }
    }
}
