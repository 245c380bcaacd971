use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde::Serialize;
use tracing::{info, warn};

use bidbus_core::AggregateId;
use bidbus_events::{Delivery, Transport};

use super::{ConsumerDispatcher, DispatchError, DispatchOutcome};
use crate::config::ConsumerConfig;

/// Per-pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub faulted: u64,
    pub dead_lettered: u64,
    /// Deliveries handed back for redelivery.
    pub retried: u64,
    pub errors: u64,
}

impl ConsumerStats {
    fn record(&mut self, result: &Result<DispatchOutcome, DispatchError>) {
        match result {
            Ok(DispatchOutcome::Applied) => self.applied += 1,
            Ok(DispatchOutcome::Duplicate) => self.duplicates += 1,
            Ok(DispatchOutcome::Skipped) => self.skipped += 1,
            Ok(DispatchOutcome::Faulted { .. }) => self.faulted += 1,
            Ok(DispatchOutcome::DeadLettered) => self.dead_lettered += 1,
            Ok(DispatchOutcome::Retry { .. }) => self.retried += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Handle to stop a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    shutdown: mpsc::Sender<()>,
    intake: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl PoolHandle {
    /// Stop receiving, let workers finish what they hold, and wait for them.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(intake) = self.intake.take() {
            let _ = intake.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One queue, one intake thread, N partition workers.
///
/// The intake thread receives from the queue and routes each delivery by
/// aggregate id, so all messages of one aggregate are handled by the same
/// worker in queue order while different aggregates proceed in parallel.
pub struct ConsumerPool<T: Transport + 'static> {
    dispatcher: Arc<ConsumerDispatcher<T>>,
    config: ConsumerConfig,
}

impl<T: Transport + 'static> ConsumerPool<T> {
    pub fn new(dispatcher: ConsumerDispatcher<T>, config: ConsumerConfig) -> Self {
        let dispatcher = dispatcher
            .with_retry(config.retry_limit, config.retry_interval)
            .with_publish_timeout(config.publish_timeout);
        Self {
            dispatcher: Arc::new(dispatcher),
            config,
        }
    }

    pub fn spawn(self) -> io::Result<PoolHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let name = self.config.consumer_id.to_string();

        let mut senders = Vec::with_capacity(self.config.workers.max(1));
        let mut workers = Vec::with_capacity(senders.capacity());
        for index in 0..self.config.workers.max(1) {
            let (tx, rx) = mpsc::channel::<Delivery>();
            senders.push(tx);
            let dispatcher = self.dispatcher.clone();
            let stats = stats.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(&dispatcher, rx, &stats))?;
            workers.push(worker);
        }

        let intake_stats = stats.clone();
        let intake = thread::Builder::new()
            .name(format!("{name}-intake"))
            .spawn(move || {
                intake_loop(&self.dispatcher, &self.config, shutdown_rx, senders, &intake_stats)
            })?;

        Ok(PoolHandle {
            shutdown: shutdown_tx,
            intake: Some(intake),
            workers,
            stats,
        })
    }
}

fn partition(aggregate_id: AggregateId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

fn intake_loop<T: Transport>(
    dispatcher: &ConsumerDispatcher<T>,
    config: &ConsumerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    workers: Vec<mpsc::Sender<Delivery>>,
    stats: &Mutex<ConsumerStats>,
) {
    info!(
        consumer = %config.consumer_id,
        queue = %config.queue,
        workers = workers.len(),
        "consumer pool started"
    );

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match dispatcher
            .transport()
            .receive(&config.queue, config.receive_timeout)
        {
            Ok(Some(delivery)) => {
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .received += 1;
                let index = partition(delivery.envelope.aggregate_id(), workers.len());
                if workers[index].send(delivery).is_err() {
                    warn!(consumer = %config.consumer_id, worker = index, "worker gone; stopping intake");
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(consumer = %config.consumer_id, queue = %config.queue, error = %err, "receive failed");
                thread::sleep(config.receive_timeout);
            }
        }
    }

    // Dropping the senders lets workers drain and exit.
    drop(workers);
    info!(consumer = %config.consumer_id, "consumer pool stopped");
}

fn worker_loop<T: Transport>(
    dispatcher: &ConsumerDispatcher<T>,
    deliveries: mpsc::Receiver<Delivery>,
    stats: &Mutex<ConsumerStats>,
) {
    for delivery in deliveries {
        let result = dispatcher.handle_delivery(&delivery);
        stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&result);
        if let Err(err) = result {
            warn!(
                consumer = %dispatcher.consumer_id(),
                message_id = %delivery.envelope.message_id(),
                error = ?err,
                "delivery not settled"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        let id = AggregateId::new();
        let first = partition(id, 4);
        assert!(first < 4);
        assert_eq!(partition(id, 4), first);
        assert_eq!(partition(id, 1), 0);
    }

    #[test]
    fn stats_count_outcomes() {
        let mut stats = ConsumerStats::default();
        stats.record(&Ok(DispatchOutcome::Applied));
        stats.record(&Ok(DispatchOutcome::Duplicate));
        stats.record(&Ok(DispatchOutcome::Applied));
        stats.record(&Err(DispatchError::DuplicateHandler("T".into())));
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.errors, 1);
    }
}
