//! Broker backends beyond the in-memory one.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConfig};
