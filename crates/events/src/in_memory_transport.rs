//! In-memory broker for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::transport::{Delivery, Transport, TransportError};

const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Ready {
    envelope: Envelope,
    delivery_count: u32,
}

#[derive(Debug)]
struct InFlight {
    envelope: Envelope,
    delivery_count: u32,
    visible_again_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Ready>,
    in_flight: HashMap<u64, InFlight>,
}

impl QueueState {
    /// Move expired in-flight deliveries back to the head, oldest tag first.
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_again_at <= now)
            .map(|(tag, _)| *tag)
            .collect();
        expired.sort_unstable_by(|a, b| b.cmp(a));
        for tag in expired {
            if let Some(f) = self.in_flight.remove(&tag) {
                self.ready.push_front(Ready {
                    envelope: f.envelope,
                    delivery_count: f.delivery_count,
                });
            }
        }
    }
}

#[derive(Debug)]
struct State {
    /// message_type -> bound queues.
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    available: bool,
    fail_next_publishes: u32,
    publish_latency: Duration,
    published: u64,
}

/// Queue-per-consumer broker.
///
/// - No IO / no async
/// - Fan-out by `message_type` bindings
/// - Visibility timeout redelivers unacknowledged messages
/// - Outages and slow publishes can be injected for testing
#[derive(Debug)]
pub struct InMemoryTransport {
    state: Mutex<State>,
    arrivals: Condvar,
    visibility_timeout: Duration,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryTransport {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                bindings: HashMap::new(),
                queues: HashMap::new(),
                next_tag: 1,
                available: true,
                fail_next_publishes: 0,
                publish_latency: Duration::ZERO,
                published: 0,
            }),
            arrivals: Condvar::new(),
            visibility_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, TransportError> {
        self.state.lock().map_err(|_| TransportError::Poisoned)
    }

    /// Create `queue` if needed.
    pub fn declare_queue(&self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    /// Route every future `message_type` publish to `queue` (declaring it).
    pub fn bind(&self, queue: &str, message_type: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.queues.entry(queue.to_string()).or_default();
        let bound = state.bindings.entry(message_type.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) -> Result<(), TransportError> {
        self.lock()?.available = available;
        Ok(())
    }

    /// Reject the next `n` publishes with `Unavailable`.
    pub fn fail_next_publishes(&self, n: u32) -> Result<(), TransportError> {
        self.lock()?.fail_next_publishes = n;
        Ok(())
    }

    /// Make every publish take `latency`; publishes whose deadline is shorter time out.
    pub fn set_publish_latency(&self, latency: Duration) -> Result<(), TransportError> {
        self.lock()?.publish_latency = latency;
        Ok(())
    }

    /// Ready plus in-flight deliveries on `queue`.
    pub fn queue_depth(&self, queue: &str) -> Result<usize, TransportError> {
        let state = self.lock()?;
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        Ok(q.ready.len() + q.in_flight.len())
    }

    /// Number of successful publishes since creation.
    pub fn published_count(&self) -> Result<u64, TransportError> {
        Ok(self.lock()?.published)
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, envelope: &Envelope, deadline: Duration) -> Result<(), TransportError> {
        let latency = {
            let mut state = self.lock()?;
            if !state.available {
                return Err(TransportError::Unavailable("broker offline".to_string()));
            }
            if state.fail_next_publishes > 0 {
                state.fail_next_publishes -= 1;
                return Err(TransportError::Unavailable("publish rejected".to_string()));
            }
            state.publish_latency
        };

        if latency > deadline {
            thread::sleep(deadline);
            return Err(TransportError::Timeout(deadline));
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let mut state = self.lock()?;
        let targets = state
            .bindings
            .get(envelope.message_type())
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            debug!(
                message_id = %envelope.message_id(),
                message_type = envelope.message_type(),
                "no queue bound; message dropped"
            );
        }
        for queue in targets {
            state.queues.entry(queue).or_default().ready.push_back(Ready {
                envelope: envelope.clone(),
                delivery_count: 0,
            });
        }
        state.published += 1;
        drop(state);
        self.arrivals.notify_all();
        Ok(())
    }

    fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let give_up_at = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            let now = Instant::now();
            let tag = state.next_tag;
            let visibility = self.visibility_timeout;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            q.reclaim_expired(now);

            if let Some(ready) = q.ready.pop_front() {
                let delivery_count = ready.delivery_count + 1;
                q.in_flight.insert(
                    tag,
                    InFlight {
                        envelope: ready.envelope.clone(),
                        delivery_count,
                        visible_again_at: now + visibility,
                    },
                );
                state.next_tag += 1;
                trace!(queue, tag, delivery_count, "delivery handed out");
                return Ok(Some(Delivery {
                    tag,
                    queue: queue.to_string(),
                    envelope: ready.envelope,
                    delivery_count,
                }));
            }

            if now >= give_up_at {
                return Ok(None);
            }
            let wait = (give_up_at - now).min(MAX_WAIT_SLICE);
            state = self
                .arrivals
                .wait_timeout(state, wait)
                .map_err(|_| TransportError::Poisoned)?
                .0;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let q = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| TransportError::UnknownQueue(delivery.queue.clone()))?;
        q.in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })
    }

    fn nack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let q = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| TransportError::UnknownQueue(delivery.queue.clone()))?;
        let f = q
            .in_flight
            .remove(&delivery.tag)
            .ok_or_else(|| TransportError::UnknownDelivery {
                queue: delivery.queue.clone(),
                tag: delivery.tag,
            })?;
        q.ready.push_front(Ready {
            envelope: f.envelope,
            delivery_count: f.delivery_count,
        });
        drop(state);
        self.arrivals.notify_all();
        Ok(())
    }
}
