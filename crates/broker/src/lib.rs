//! Job queue abstraction.
//!
//! The broker only carries job ids from the submitter to the worker pool.
//! Delivery is at-least-once; duplicate suppression is the job store's job.

pub mod broker;
pub mod in_memory;

pub use broker::{Broker, BrokerError, BrokerResult, Delivery};
pub use in_memory::InMemoryBroker;
