//! Outbox relay: moves committed outbox rows onto the transport.
//!
//! Each pass claims a batch, groups it by aggregate (keeping insertion order
//! inside each group), and publishes every group strictly in order. A group
//! stops at its first failed publish: that row is scheduled for a retry with
//! backoff and the rest of the group is released untouched, so a later message
//! of an aggregate can never overtake an earlier one.
//!
//! Delivery is at-least-once. A crash between a successful publish and
//! `mark_sent` publishes the row again once its lease expires; consumers
//! absorb the duplicate through their inbox.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use bidbus_core::AggregateId;
use bidbus_events::Transport;

use crate::config::RelayConfig;
use crate::outbox::{OutboxMessage, OutboxStore, later};
use crate::store::StoreError;

/// Result of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayPass {
    pub claimed: usize,
    pub published: usize,
    /// Rows whose publish failed and were scheduled for retry.
    pub failed: usize,
    /// Rows released unpublished because an earlier row of their aggregate failed.
    pub deferred: usize,
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub passes: u64,
    pub published: u64,
    pub failed: u64,
    pub deferred: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Request graceful shutdown; the current pass completes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct OutboxRelay<S: OutboxStore, T: Transport> {
    store: S,
    transport: T,
    config: RelayConfig,
}

impl<S: OutboxStore, T: Transport> OutboxRelay<S, T> {
    pub fn new(store: S, transport: T, config: RelayConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Claim one batch and publish it.
    pub fn run_once(&self) -> Result<RelayPass, StoreError> {
        let batch = self.store.claim_batch(
            &self.config.relay_id,
            self.config.batch_size,
            self.config.lease,
            Utc::now(),
        )?;

        let mut pass = RelayPass {
            claimed: batch.len(),
            ..RelayPass::default()
        };
        for (_, group) in group_by_aggregate(batch) {
            self.publish_group(group, &mut pass)?;
        }

        if pass.claimed > 0 {
            debug!(
                relay = %self.config.relay_id,
                claimed = pass.claimed,
                published = pass.published,
                failed = pass.failed,
                deferred = pass.deferred,
                "relay pass complete"
            );
        }
        Ok(pass)
    }

    fn publish_group(&self, group: Vec<OutboxMessage>, pass: &mut RelayPass) -> Result<(), StoreError> {
        let mut rows = group.into_iter();
        while let Some(message) = rows.next() {
            match self
                .transport
                .publish(&message.to_envelope(), self.config.publish_timeout)
            {
                Ok(()) => {
                    self.store.mark_sent(message.id, Utc::now())?;
                    pass.published += 1;
                }
                Err(err) => {
                    let delay = self.config.backoff.delay_for_attempt(message.attempts + 1);
                    let attempts =
                        self.store
                            .record_failure(message.id, &err.to_string(), later(Utc::now(), delay))?;
                    pass.failed += 1;

                    if err.is_transient() {
                        warn!(
                            relay = %self.config.relay_id,
                            message_id = %message.id,
                            aggregate_id = %message.aggregate_id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "publish failed; will retry"
                        );
                    } else {
                        error!(
                            relay = %self.config.relay_id,
                            message_id = %message.id,
                            attempts,
                            error = ?err,
                            "publish failed with non-transient error; will retry"
                        );
                    }

                    for deferred in rows.by_ref() {
                        self.store.release(deferred.id)?;
                        pass.deferred += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run passes on a background thread until shut down.
    pub fn spawn(self) -> io::Result<RelayHandle>
    where
        S: 'static,
        T: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RelayStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.relay_id.clone())
            .spawn(move || relay_loop(self, shutdown_rx, stats_clone))?;

        Ok(RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

/// Split a claimed batch into per-aggregate groups, in first-seen order.
fn group_by_aggregate(batch: Vec<OutboxMessage>) -> Vec<(AggregateId, Vec<OutboxMessage>)> {
    let mut index: HashMap<AggregateId, usize> = HashMap::new();
    let mut groups: Vec<(AggregateId, Vec<OutboxMessage>)> = Vec::new();
    for message in batch {
        let slot = *index.entry(message.aggregate_id).or_insert_with(|| {
            groups.push((message.aggregate_id, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(message);
    }
    groups
}

fn relay_loop<S: OutboxStore, T: Transport>(
    relay: OutboxRelay<S, T>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RelayStats>>,
) {
    let config = relay.config().clone();
    info!(relay = %config.relay_id, poll_ms = config.poll_interval.as_millis() as u64, "outbox relay started");
    let start_time = Instant::now();

    loop {
        let full_batch = match relay.run_once() {
            Ok(pass) => {
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.passes += 1;
                s.published += pass.published as u64;
                s.failed += pass.failed as u64;
                s.deferred += pass.deferred as u64;
                s.uptime_secs = start_time.elapsed().as_secs();
                pass.claimed >= config.batch_size && pass.failed == 0
            }
            Err(e) => {
                error!(relay = %config.relay_id, error = ?e, "relay pass failed");
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .store_errors += 1;
                false
            }
        };

        // A full batch means more is probably waiting: go again straight away.
        let wait = if full_batch {
            std::time::Duration::ZERO
        } else {
            config.poll_interval
        };
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    info!(relay = %config.relay_id, "outbox relay stopped");
}
