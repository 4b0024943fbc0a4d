// src/domain/bus.rs

//! Bus domain abstractions.
//!
//! This module defines the minimal publish/subscribe contract the pipe
//! protocol needs from a message bus: publish, subscribe (optionally as a
//! queue group and optionally self-cancelling after N messages),
//! request-with-deadline, flush and close.
//!
//! It intentionally avoids any reference to concrete client libraries.
//! Higher-level semantics such as discovery, retries, compression or
//! acknowledgement ordering are handled by the notifier and listener.
//!
//! Concrete implementations live under `src/bus/`.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{PipeError, Result, WorkQueuePtr};

/// Capacity of a subscription inbox.
pub(crate) const INBOX_CAPACITY: usize = 64;

/// A bus subject.
///
/// Subjects are dot separated tokens (`pipe.ASYNC.orders`). The domain layer
/// treats them as opaque; matching rules belong to the bus implementation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Subject(pub Arc<str>);

impl Subject {
    /// Borrow the subject as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Subject
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Subject(value.into())
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as carried by the bus.
///
/// The payload is opaque at this layer. Whether it is gzip framed is a
/// static property of the pipe mode and is never signalled in-band.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    // ---
    /// Subject the message was published to.
    pub subject: Subject,

    /// Raw payload bytes, possibly empty.
    pub payload: Bytes,

    /// Reply subject set by the request primitive.
    pub reply_to: Option<Subject>,
}

impl Message {
    // ---
    /// Create a message without a reply subject.
    pub fn new(subject: impl Into<Subject>, payload: impl Into<Bytes>) -> Self {
        // ---
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply_to: None,
        }
    }

    /// Attach a reply subject.
    pub fn with_reply_to(mut self, reply_to: impl Into<Subject>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Build the reply to this message, if it carries a reply subject.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Option<Message> {
        // ---
        self.reply_to
            .as_ref()
            .map(|reply_to| Message::new(reply_to.clone(), payload))
    }
}

/// Subscription parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group name. Each message is delivered to exactly one member.
    pub queue_group: Option<String>,

    /// Unsubscribe automatically after this many deliveries.
    ///
    /// Enforced by the bus, so no more than `max_messages` envelopes ever
    /// reach the inbox even when publishes race with the teardown.
    pub max_messages: Option<u64>,
}

impl SubscribeOptions {
    /// Plain fan-out subscription.
    pub fn fanout() -> Self {
        Self::default()
    }

    /// Queue-group subscription.
    pub fn queue(group: impl Into<String>) -> Self {
        // ---
        Self {
            queue_group: Some(group.into()),
            max_messages: None,
        }
    }

    /// Limit the subscription to `n` deliveries.
    pub fn max_messages(mut self, n: u64) -> Self {
        self.max_messages = Some(n);
        self
    }
}

/// Handle returned from a successful subscription.
///
/// The subscription stays active until the bus auto-unsubscribes it, the
/// handle is dropped, or the bus is closed. Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    // ---
    /// Subject this handle receives messages for.
    pub subject: Subject,

    /// Receiver for delivered messages.
    pub inbox: mpsc::Receiver<Message>,
}

/// Connection-level event queue shared by every bus implementation.
///
/// Bus implementations push background failures (server errors, a closed
/// connection) into the sender; the pipe caller takes the receiver once and
/// selects on it alongside its own completion channel.
pub struct BusBase {
    /// Identifier for this bus instance, used in log lines.
    pub bus_id: String,
    errors_tx: mpsc::UnboundedSender<PipeError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<PipeError>>>,
}

impl BusBase {
    /// Create a new `BusBase`.
    pub fn new(bus_id: impl Into<String>) -> Self {
        // ---
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            bus_id: bus_id.into(),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Sender side of the error channel, for adapter callbacks.
    pub fn error_sink(&self) -> mpsc::UnboundedSender<PipeError> {
        self.errors_tx.clone()
    }

    /// Take the receiver side of the error channel. Only the first caller
    /// gets it.
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<PipeError>> {
        // ---
        match self.errors_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Bus abstraction.
///
/// A `Bus` provides best-effort delivery of messages between publishers and
/// subscribers. Implementations must ensure that:
/// - once `subscribe()` returns, later matching publishes are deliverable;
/// - a queue-group message reaches exactly one live member of the group;
/// - `max_messages` is enforced atomically with delivery;
/// - `request()` fails fast with [`PipeError::Transport`] when nothing is
///   subscribed to the subject, and with [`PipeError::Timeout`] when no
///   reply arrives within the deadline.
///
/// The in-memory bus serves as the reference implementation.
#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &BusBase;

    /// Returns the bus id.
    fn bus_id(&self) -> &str {
        &self.base().bus_id
    }

    /// Take the background error channel. Returns `None` after the first call.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<PipeError>> {
        self.base().take_errors()
    }

    /// Publish a message.
    async fn publish(&self, msg: Message) -> Result<()>;

    /// Register a subscription and return a handle for receiving messages.
    async fn subscribe(&self, subject: Subject, opts: SubscribeOptions)
        -> Result<SubscriptionHandle>;

    /// Publish `payload` to `subject` with a fresh reply subject and wait up
    /// to `deadline` for the first reply.
    async fn request(&self, subject: Subject, payload: Bytes, deadline: Duration)
        -> Result<Message>;

    /// Wait until everything published so far has reached the server.
    async fn flush(&self) -> Result<()>;

    /// Close the connection and release its resources.
    async fn close(&self) -> Result<()>;

    /// Access the durable work-queue facilities of this bus.
    ///
    /// Fails with [`PipeError::Provision`] when the bus has none.
    async fn work_queue(&self) -> Result<WorkQueuePtr>;
}

/// Shared bus pointer.
pub type BusPtr = Arc<dyn Bus>;
