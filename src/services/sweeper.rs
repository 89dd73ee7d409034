//! Periodic timeout sweep for CALLED no-shows and over-age waiters

use crate::domain::token::epoch_ms;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::ledger::TokenLedger;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Drives the ledger's data-level timeouts on an interval. Callers are
/// never blocked on timeout evaluation; this task is the only place
/// MISSED/EXPIRED aging happens.
pub struct Sweeper {
    ledger: Arc<TokenLedger>,
    metrics: Arc<Metrics>,
    interval: Duration,
    called_timeout: Duration,
    max_wait: Duration,
}

impl Sweeper {
    pub fn new(config: &Config, ledger: Arc<TokenLedger>, metrics: Arc<Metrics>) -> Self {
        Self {
            ledger,
            metrics,
            interval: config.sweep_interval(),
            called_timeout: config.called_timeout(),
            max_wait: config.max_wait(),
        }
    }

    /// Run until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("sweeper_shutdown");
                        break;
                    }
                }
            }
        }
    }

    fn sweep_once(&self) {
        let started = epoch_ms();
        let outcome = self.ledger.sweep(Utc::now(), self.called_timeout, self.max_wait);
        if outcome.missed > 0 {
            self.metrics.record_swept_missed(outcome.missed as u64);
        }
        if outcome.expired > 0 {
            self.metrics.record_swept_expired(outcome.expired as u64);
        }
        if outcome.missed > 0 || outcome.expired > 0 {
            info!(
                missed = %outcome.missed,
                expired = %outcome.expired,
                elapsed_ms = %(epoch_ms() - started),
                "sweep_completed"
            );
        }
    }
}
