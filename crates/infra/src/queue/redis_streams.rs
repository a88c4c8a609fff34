//! Redis Streams broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream key**: `docflow:jobs`, one entry per publish with a `job_id` field
//! - **Consumer group**: `docflow-workers`, shared by every worker process
//! - **Consumer**: one name per broker instance
//!
//! A delivery stays in the group's pending list until acknowledged. Entries
//! idle longer than the visibility timeout are claimed by whichever consumer
//! asks next and handed out with `redelivered = true`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use docflow_broker::{Broker, BrokerError, BrokerResult, Delivery};
use docflow_core::JobId;

const DEFAULT_STREAM_KEY: &str = "docflow:jobs";
const DEFAULT_GROUP: &str = "docflow-workers";
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Approximate cap on stream length; acknowledged history is trimmed past it.
const DEFAULT_MAX_LEN: usize = 100_000;
const JOB_ID_FIELD: &str = "job_id";

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub max_len: usize,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("docflow-{}", Uuid::now_v7().simple()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_len: DEFAULT_MAX_LEN,
        }
    }
}

pub struct RedisStreamsBroker {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    config: RedisStreamsConfig,
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn transport(context: &str, err: RedisError) -> BrokerError {
    BrokerError::Transport(format!("{context}: {err}"))
}

impl RedisStreamsBroker {
    /// Parse the URL; the connection is opened lazily on first use.
    pub fn new(redis_url: impl AsRef<str>, config: RedisStreamsConfig) -> BrokerResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| transport("invalid redis url", e))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            config,
        })
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    async fn connection(&self) -> BrokerResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let mut conn = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| transport("connect", e))?;
                self.ensure_group(&mut conn).await?;
                Ok::<_, BrokerError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Create the consumer group (and stream) if missing.
    async fn ensure_group(&self, conn: &mut ConnectionManager) -> BrokerResult<()> {
        let created: Result<String, RedisError> = conn
            .xgroup_create_mkstream(&self.config.stream_key, &self.config.group, "0")
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(transport("XGROUP CREATE", err)),
        }
    }

    fn decode(entry: &StreamId, redelivered: bool) -> Result<Delivery, String> {
        let raw: String = entry
            .get(JOB_ID_FIELD)
            .ok_or_else(|| format!("entry {} has no {JOB_ID_FIELD} field", entry.id))?;
        let job_id: JobId = raw
            .parse()
            .map_err(|e| format!("entry {}: {e}", entry.id))?;
        Ok(Delivery {
            job_id,
            receipt: entry.id.clone(),
            redelivered,
        })
    }

    /// First decodable entry; malformed ones are acknowledged and skipped.
    async fn first_valid(
        &self,
        conn: &mut ConnectionManager,
        entries: &[StreamId],
        redelivered: bool,
    ) -> BrokerResult<Option<Delivery>> {
        let mut found = None;
        for entry in entries {
            match Self::decode(entry, redelivered) {
                Ok(delivery) if found.is_none() => found = Some(delivery),
                Ok(_) => {}
                Err(reason) => {
                    warn!(stream = %self.config.stream_key, reason = %reason, "dropping malformed stream entry");
                    let _: u64 = conn
                        .xack(&self.config.stream_key, &self.config.group, &[&entry.id])
                        .await
                        .map_err(|e| transport("XACK", e))?;
                }
            }
        }
        Ok(found)
    }

    /// Claim one entry another consumer left idle past the visibility timeout.
    async fn claim_idle(&self, conn: &mut ConnectionManager) -> BrokerResult<Option<Delivery>> {
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.config.stream_key, &self.config.group, "-", "+", 16)
            .await
            .map_err(|e| transport("XPENDING", e))?;

        let min_idle_ms = self.config.visibility_timeout.as_millis() as usize;
        let idle: Vec<&str> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id.as_str())
            .take(1)
            .collect();
        if idle.is_empty() {
            return Ok(None);
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.stream_key,
                &self.config.group,
                &self.config.consumer,
                min_idle_ms,
                &idle,
            )
            .await
            .map_err(|e| transport("XCLAIM", e))?;
        if !claimed.ids.is_empty() {
            debug!(stream = %self.config.stream_key, count = claimed.ids.len(), "claimed idle entries");
        }
        self.first_valid(conn, &claimed.ids, true).await
    }

    async fn read_new(&self, conn: &mut ConnectionManager) -> BrokerResult<Option<Delivery>> {
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(1);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.config.stream_key], &[">"], &options)
            .await
            .map_err(|e| transport("XREADGROUP", e))?;

        let entries: Vec<StreamId> = reply.keys.into_iter().flat_map(|k| k.ids).collect();
        self.first_valid(conn, &entries, false).await
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(skip(self), fields(stream = %self.config.stream_key), err)]
    async fn publish(&self, job_id: JobId) -> BrokerResult<()> {
        let mut conn = self.connection().await?;
        let _: String = conn
            .xadd_maxlen(
                &self.config.stream_key,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                &[(JOB_ID_FIELD, job_id.to_string())],
            )
            .await
            .map_err(|e| transport("XADD", e))?;
        Ok(())
    }

    // Polls without BLOCK: a blocking read would stall the shared connection.
    async fn consume(&self, wait: Duration) -> BrokerResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        let mut conn = self.connection().await?;

        loop {
            if let Some(delivery) = self.claim_idle(&mut conn).await? {
                return Ok(Some(delivery));
            }
            if let Some(delivery) = self.read_new(&mut conn).await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        let mut conn = self.connection().await?;
        let _: u64 = conn
            .xack(&self.config.stream_key, &self.config.group, &[&delivery.receipt])
            .await
            .map_err(|e| transport("XACK", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(url: &str, visibility_timeout: Duration) -> RedisStreamsBroker {
        let config = RedisStreamsConfig {
            stream_key: format!("docflow:test:{}", Uuid::now_v7().simple()),
            visibility_timeout,
            poll_interval: Duration::from_millis(10),
            ..RedisStreamsConfig::default()
        };
        RedisStreamsBroker::new(url, config).unwrap()
    }

    #[tokio::test]
    async fn publish_consume_ack() {
        let Ok(url) = std::env::var("TEST_REDIS_URL") else {
            eprintln!("TEST_REDIS_URL not set; skipping redis streams broker test");
            return;
        };
        let broker = broker(&url, Duration::from_secs(60));
        let id = JobId::new();

        broker.publish(id).await.unwrap();
        let delivery = broker.consume(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, id);
        assert!(!delivery.redelivered);
        broker.ack(&delivery).await.unwrap();

        assert!(broker.consume(Duration::from_millis(50)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_delivery_is_claimed_by_another_consumer() {
        let Ok(url) = std::env::var("TEST_REDIS_URL") else {
            eprintln!("TEST_REDIS_URL not set; skipping redis streams broker test");
            return;
        };
        let first = broker(&url, Duration::from_millis(50));
        let second = RedisStreamsBroker::new(
            &url,
            RedisStreamsConfig {
                consumer: "second".to_string(),
                ..first.config().clone()
            },
        )
        .unwrap();
        let id = JobId::new();

        first.publish(id).await.unwrap();
        let lost = first.consume(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(lost.job_id, id);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = second.consume(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.job_id, id);
        assert!(again.redelivered);
        second.ack(&again).await.unwrap();
    }
}
