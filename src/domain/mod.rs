//! Domain layer public interface.
//!
//! This module defines the bus and work-queue abstractions the pipe protocol
//! is written against. They are independent of any concrete broker client.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod bus;
mod work_queue;

// --- Bus domain re-exports ---

pub(crate) use bus::INBOX_CAPACITY;

pub use bus::{
    //
    Bus,
    BusBase,
    BusPtr,
    Message,
    SubscribeOptions,
    Subject,
    SubscriptionHandle,
};

// --- Work-queue domain re-exports ---

pub use work_queue::{
    //
    AckPolicy,
    Acker,
    ConsumerSpec,
    Delivery,
    PubAck,
    Retention,
    Storage,
    StreamSpec,
    WorkQueue,
    WorkQueuePtr,
};
