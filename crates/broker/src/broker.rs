//! Broker contract (mechanics only).
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a message is handed out again if its consumer does not
//!   acknowledge it in time (crash, hang, lost connection).
//! - **No ordering**: consumers compete for messages; nothing is promised between jobs.
//! - **No payload**: a message is a job id. The job store is the source of truth,
//!   so a redelivered or stale message is harmless once the claim CAS rejects it.
//!
//! ## Usage pattern
//!
//! ```ignore
//! loop {
//!     match broker.consume(Duration::from_secs(1)).await? {
//!         Some(delivery) => {
//!             handle(delivery.job_id).await;
//!             broker.ack(&delivery).await?;
//!         }
//!         None => continue, // check for shutdown
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docflow_core::JobId;
use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker was shut down; no further publishes or deliveries.
    #[error("broker closed")]
    Closed,

    #[error("broker transport error: {0}")]
    Transport(String),

    /// A message could not be encoded or decoded.
    #[error("broker codec error: {0}")]
    Codec(String),
}

/// One handed-out message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Broker-specific token used to acknowledge this delivery.
    pub receipt: String,
    /// Whether the message was handed out before without being acknowledged.
    pub redelivered: bool,
}

/// At-least-once delivery channel of job ids.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, job_id: JobId) -> BrokerResult<()>;

    /// Wait up to `wait` for a message.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn consume(&self, wait: Duration) -> BrokerResult<Option<Delivery>>;

    /// Acknowledge a delivery so it is not handed out again.
    ///
    /// Acknowledging an unknown or already acknowledged receipt is not an error.
    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn publish(&self, job_id: JobId) -> BrokerResult<()> {
        (**self).publish(job_id).await
    }

    async fn consume(&self, wait: Duration) -> BrokerResult<Option<Delivery>> {
        (**self).consume(wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        (**self).ack(delivery).await
    }
}
