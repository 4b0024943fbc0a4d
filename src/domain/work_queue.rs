// src/domain/work_queue.rs

//! Durable work-queue abstractions.
//!
//! Durable pipes need a persistent stream that captures messages published
//! to `pipe.ASYNC.>` and a durable pull consumer per pipe. This module
//! describes those resources and the operations on them without committing
//! to a concrete broker. NATS JetStream and the in-memory hub both provide
//! an implementation.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Result, Subject};

/// Publish acknowledgement returned for a message captured by a stream.
///
/// Any other reply body, such as a broker error object, does not decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
}

/// Message retention policy of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Each message is removed once a consumer acknowledges it.
    WorkQueue,
}

/// Storage backend of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// File backed, survives broker restarts.
    File,
}

/// Acknowledgement policy of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every message must be acknowledged individually.
    Explicit,
}

/// Stream definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub storage: Storage,
    pub max_age: Duration,
}

/// Durable pull consumer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Durable name, equal to the pipe name.
    pub durable_name: String,
    /// Only messages on this subject reach the consumer.
    pub filter_subject: String,
    pub ack_policy: AckPolicy,
    /// Unacknowledged messages become eligible for redelivery after this.
    pub ack_wait: Duration,
}

/// Acknowledgement handle for a fetched message.
#[async_trait::async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledge the message so it is removed from the work queue.
    async fn ack(&self) -> Result<()>;
}

/// A message fetched from a durable consumer.
pub struct Delivery {
    // ---
    pub subject: Subject,
    pub payload: Bytes,
    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Create a delivery from its payload and acknowledgement handle.
    pub fn new(subject: Subject, payload: Bytes, acker: Box<dyn Acker>) -> Self {
        // ---
        Self {
            subject,
            payload,
            acker,
        }
    }

    /// Acknowledge the delivery.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Durable work-queue operations.
///
/// Create operations are not idempotent at this layer: creating a resource
/// that exists fails with [`PipeError::AlreadyExists`](crate::PipeError::AlreadyExists)
/// or an adapter error. Idempotency is layered on top by the provisioner.
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync {
    // ---
    /// Names of all existing streams.
    async fn stream_names(&self) -> Result<Vec<String>>;

    /// Create a stream.
    async fn create_stream(&self, spec: &StreamSpec) -> Result<()>;

    /// Names of the consumers defined on `stream`.
    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>>;

    /// Create a durable consumer on `stream`.
    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()>;

    /// Fetch the next available message for `consumer`.
    ///
    /// Returns `Ok(None)` when nothing became available within `deadline`;
    /// that is the normal "no work queued" outcome, not an error.
    async fn fetch(&self, stream: &str, consumer: &str, deadline: Duration)
        -> Result<Option<Delivery>>;
}

/// Shared work-queue pointer.
pub type WorkQueuePtr = Arc<dyn WorkQueue>;
