//! Named network pipes over a pub/sub message bus.
//!
//! A pipe connects a notifier to a listener by name alone. Four delivery
//! modes are available:
//!
//! - **Direct**: one listener takes one message.
//! - **Group**: many listeners share a queue group; each message reaches one.
//! - **Discover**: the listener hands out a private one-time subject first.
//! - **Durable**: messages wait in a work-queue stream until a listener pulls
//!   them, and are acknowledged after delivery.
//!
//! The bus is abstracted by the [`Bus`] and [`WorkQueue`] traits. NATS (with
//! JetStream for durable pipes) and an in-process [`MemoryHub`] implement them.
//!
//! # Example
//!
//! ```no_run
//! use piper::{BusBuilder, Input, Mode, Notifier, Pipe, PipeConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> piper::Result<()> {
//! let config = PipeConfig::with_servers("nats://localhost:4222", "notify");
//! let bus = BusBuilder::from_config(&config).build().await?;
//!
//! let pipe = Pipe::new("build-done", Mode::Direct)?;
//! Notifier::new(bus, pipe, config)
//!     .notify(Input::from_message("ok"), &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod macros;

mod bus;
mod bus_builder;
mod domain;
mod inbox;
mod io;
mod listener;
mod notifier;
mod provision;
mod retry;

mod config;
mod error;

pub mod codec;
pub mod subject;

#[doc(hidden)]
pub mod __private {
    #[cfg(feature = "logging")]
    pub use tracing;
}

pub use bus::{
    // ---
    create_memory_bus,
    create_memory_bus_with_hub,
    create_nats_bus,
    BusGuard,
    MemoryHub,
};
pub use bus_builder::{BusBuilder, BUS_TYPES};

pub use config::{
    // ---
    PipeConfig,
    RetryPolicy,
    DEFAULT_CREDENTIALS_FILE,
    DEFAULT_DURABLE_TIMEOUT,
    DEFAULT_TIMEOUT,
};
pub use error::{PipeError, Result};

pub use inbox::Inbox;
pub use io::{CaptureSink, Input, OutputSink, SinkPtr, StdoutSink};
pub use listener::{DiscoveryTicket, ListenState, Listener};
pub use notifier::{NotifyState, Notifier};
pub use provision::{consumer_spec, stream_spec, Provisioner, ACK_WAIT, STREAM_MAX_AGE};
pub use retry::Deadline;
pub use subject::{Mode, Pipe, Subjects};

// --- public re-exports
pub use domain::{
    // ---
    AckPolicy,
    Acker,
    Bus,
    BusBase,
    BusPtr,
    ConsumerSpec,
    Delivery,
    Message,
    PubAck,
    Retention,
    Storage,
    StreamSpec,
    Subject,
    SubscribeOptions,
    SubscriptionHandle,
    WorkQueue,
    WorkQueuePtr,
};
