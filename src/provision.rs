//! Durable resource provisioning.
//!
//! Durable pipes share a single work-queue stream and get one durable pull
//! consumer per pipe name. The [`Provisioner`] makes sure both exist before
//! anything is sent or pulled. Checking and creating are separate bus
//! operations, so two processes may both see a resource missing and both try
//! to create it; the loser of that race re-checks and treats the resource as
//! present.

use std::future::Future;
use std::time::Duration;

use crate::{
    // ---
    log_debug,
    log_info,
    subject::{durable_subject, durable_wildcard, STREAM_NAME},
    AckPolicy,
    ConsumerSpec,
    PipeError,
    Result,
    Retention,
    Storage,
    StreamSpec,
    WorkQueuePtr,
};

/// Messages older than this are discarded from the stream.
pub const STREAM_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Unacknowledged messages are redelivered after this.
pub const ACK_WAIT: Duration = Duration::from_secs(30);

/// Definition of the durable stream.
pub fn stream_spec() -> StreamSpec {
    // ---
    StreamSpec {
        name: STREAM_NAME.to_string(),
        subjects: vec![durable_wildcard()],
        retention: Retention::WorkQueue,
        storage: Storage::File,
        max_age: STREAM_MAX_AGE,
    }
}

/// Definition of the durable consumer for pipe `name`.
pub fn consumer_spec(name: &str) -> ConsumerSpec {
    // ---
    ConsumerSpec {
        durable_name: name.to_string(),
        filter_subject: durable_subject(name).to_string(),
        ack_policy: AckPolicy::Explicit,
        ack_wait: ACK_WAIT,
    }
}

/// Idempotent creation of the durable stream and consumers.
pub struct Provisioner {
    queue: WorkQueuePtr,
    request_timeout: Duration,
}

impl Provisioner {
    pub fn new(queue: WorkQueuePtr, request_timeout: Duration) -> Self {
        Self {
            queue,
            request_timeout,
        }
    }

    /// Make sure the durable stream exists.
    ///
    /// # Errors
    ///
    /// [`PipeError::Provision`] when the stream is neither found nor created.
    pub async fn ensure_stream(&self) -> Result<()> {
        // ---
        let spec = stream_spec();

        if self.has_stream(&spec.name).await? {
            log_debug!("stream {} already exists", spec.name);
            return Ok(());
        }

        match self.bounded(self.queue.create_stream(&spec)).await {
            Ok(()) => {
                log_info!("created stream {}", spec.name);
                Ok(())
            }
            Err(err) => {
                // lost a creation race?
                if self.has_stream(&spec.name).await? {
                    log_debug!("stream {} was created concurrently", spec.name);
                    return Ok(());
                }
                Err(provision_error(err))
            }
        }
    }

    /// Make sure the durable consumer for pipe `name` exists.
    ///
    /// The stream must exist; see [`ensure_stream`](Self::ensure_stream).
    pub async fn ensure_consumer(&self, name: &str) -> Result<()> {
        // ---
        let spec = consumer_spec(name);

        if self.has_consumer(name).await? {
            log_debug!("consumer {name} already exists");
            return Ok(());
        }

        match self.bounded(self.queue.create_consumer(STREAM_NAME, &spec)).await {
            Ok(()) => {
                log_info!("created consumer {name} on {STREAM_NAME}");
                Ok(())
            }
            Err(err) => {
                if self.has_consumer(name).await? {
                    log_debug!("consumer {name} was created concurrently");
                    return Ok(());
                }
                Err(provision_error(err))
            }
        }
    }

    /// Stream and consumer for pipe `name`.
    pub async fn ensure_pipe(&self, name: &str) -> Result<()> {
        // ---
        self.ensure_stream().await?;
        self.ensure_consumer(name).await
    }

    async fn has_stream(&self, name: &str) -> Result<bool> {
        // ---
        let names = self
            .bounded(self.queue.stream_names())
            .await
            .map_err(provision_error)?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn has_consumer(&self, name: &str) -> Result<bool> {
        // ---
        let names = self
            .bounded(self.queue.consumer_names(STREAM_NAME))
            .await
            .map_err(provision_error)?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        // ---
        tokio::time::timeout(self.request_timeout, op)
            .await
            .map_err(|_| PipeError::Timeout)?
    }
}

fn provision_error(err: PipeError) -> PipeError {
    // ---
    match err {
        PipeError::Provision(_) => err,
        other => PipeError::Provision(other.to_string()),
    }
}
