//! In-memory broker for tests/dev and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use docflow_core::JobId;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::{Broker, BrokerError, BrokerResult, Delivery};

/// Default time a delivery may stay unacknowledged before it is handed out again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Queued {
    job_id: JobId,
    redelivered: bool,
}

#[derive(Debug)]
struct InFlight {
    job_id: JobId,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Queued>,
    in_flight: HashMap<u64, InFlight>,
    next_receipt: u64,
    closed: bool,
}

impl State {
    /// Move deliveries whose visibility timeout elapsed back to the ready queue.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();

        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                debug!(job_id = %flight.job_id, receipt, "delivery not acknowledged in time; requeueing");
                self.ready.push_back(Queued {
                    job_id: flight.job_id,
                    redelivered: true,
                });
            }
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }
}

/// FIFO queue with visibility-timeout redelivery.
///
/// - Messages are handed to one consumer at a time
/// - Unacknowledged deliveries reappear after the visibility timeout
/// - Nothing survives a process restart (the reaper republishes stale jobs)
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Stop accepting publishes and wake every waiting consumer.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Messages waiting to be consumed.
    pub fn ready_len(&self) -> usize {
        self.state.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Deliveries handed out and not yet acknowledged.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn lock(&self) -> BrokerResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Transport("in-memory broker lock poisoned".to_string()))
    }

    /// Hand out the next ready message, or report when to look again.
    fn try_take(&self) -> BrokerResult<Result<Delivery, Option<Instant>>> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.requeue_expired(now);

        match state.ready.pop_front() {
            Some(queued) => {
                let receipt = state.next_receipt;
                state.next_receipt += 1;
                state.in_flight.insert(
                    receipt,
                    InFlight {
                        job_id: queued.job_id,
                        visible_at: now + self.visibility_timeout,
                    },
                );
                Ok(Ok(Delivery {
                    job_id: queued.job_id,
                    receipt: receipt.to_string(),
                    redelivered: queued.redelivered,
                }))
            }
            None if state.closed => Err(BrokerError::Closed),
            None => Ok(Err(state.next_visible_at())),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, job_id: JobId) -> BrokerResult<()> {
        {
            let mut state = self.lock()?;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.ready.push_back(Queued {
                job_id,
                redelivered: false,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, wait: Duration) -> BrokerResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            let wake_at = match self.try_take()? {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_visible) => match next_visible {
                    Some(at) if at < deadline => at,
                    _ => deadline,
                },
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // A publish or close wakes us early; otherwise look again when the
            // earliest in-flight delivery becomes visible or the wait runs out.
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        let Ok(receipt) = delivery.receipt.parse::<u64>() else {
            return Err(BrokerError::Codec(format!(
                "malformed receipt '{}'",
                delivery.receipt
            )));
        };
        self.lock()?.in_flight.remove(&receipt);
        Ok(())
    }
}
