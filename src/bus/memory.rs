//! In-memory bus implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Bus` and `WorkQueue` traits. It is intended primarily for testing, local
//! execution, and as a reference for bus semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory bus defines the **reference behavior** for bus adapters:
//!
//! - Once `subscribe()` returns successfully, messages published *after* that
//!   point and matching the subscription are deliverable.
//! - Subjects match token-wise; `*` matches one token and `>` matches the
//!   remaining tokens.
//! - A queue group receives each message on exactly one live member,
//!   members are picked round-robin.
//! - `max_messages` is enforced under the same lock that delivers, so an
//!   auto-unsubscribed subscription never sees an extra message.
//! - A request that reaches no subscriber fails immediately with a
//!   transport error ("no responders").
//! - Messages published to a subject captured by a stream are stored and,
//!   when they carry a reply subject, acknowledged with a publish ack.
//!
//! ## Non-Goals
//!
//! Persistence across processes, network failure simulation, and flow
//! control. A full subscriber inbox drops the message with a warning.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

use crate::{
    // ---
    log_debug,
    log_warn,
    Bus,
    BusBase,
    BusPtr,
    ConsumerSpec,
    Delivery,
    Inbox,
    Message,
    PipeConfig,
    PipeError,
    PubAck,
    Result,
    StreamSpec,
    Subject,
    SubscribeOptions,
    SubscriptionHandle,
    WorkQueue,
    WorkQueuePtr,
};

use crate::domain::{Acker, INBOX_CAPACITY};

use super::subject_matches;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Subscriber {
    owner: u64,
    pattern: Subject,
    tx: mpsc::Sender<Message>,
    group: Option<String>,
    remaining: Option<u64>,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        !self.tx.is_closed() && self.remaining != Some(0)
    }
}

#[derive(Default)]
struct CoreState {
    subscribers: Vec<Subscriber>,
    cursors: HashMap<(Subject, String), usize>,
}

struct Stored {
    subject: Subject,
    payload: Bytes,
    stored_at: Instant,
}

struct MemConsumer {
    spec: ConsumerSpec,
    /// seq → instant the message becomes eligible for redelivery
    in_flight: HashMap<u64, Instant>,
}

struct MemStream {
    spec: StreamSpec,
    next_seq: u64,
    messages: BTreeMap<u64, Stored>,
    consumers: HashMap<String, MemConsumer>,
}

impl MemStream {
    fn captures(&self, subject: &Subject) -> bool {
        self.spec
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject.as_str()))
    }

    fn prune_expired(&mut self, now: Instant) {
        // ---
        let max_age = self.spec.max_age;
        if max_age.is_zero() {
            return;
        }
        self.messages
            .retain(|_, stored| now.saturating_duration_since(stored.stored_at) < max_age);
    }
}

#[derive(Default)]
struct DurableState {
    streams: HashMap<String, MemStream>,
}

/// Shared message bus for the in-memory implementation.
///
/// Simulates a broker (including its durable streams) within a single
/// process. All `MemoryBus` instances that share a `MemoryHub` see each
/// other's messages, exactly as clients connected to a real server would.
///
/// For tests that run in parallel, construct one hub per test and pass it to
/// [`create_memory_bus_with_hub`].
pub struct MemoryHub {
    // ---
    core: Mutex<CoreState>,
    durable: Mutex<DurableState>,
    stored: Notify,
    next_owner: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route a message; returns how many receivers (subscribers or streams)
    /// took it.
    fn route(&self, msg: Message) -> usize {
        // ---
        let mut delivered = self.deliver(&msg);

        if let Some(ack) = self.capture(&msg) {
            delivered += 1;
            if let Some(reply) = msg.reply(ack) {
                self.deliver(&reply);
            }
        }

        delivered
    }

    fn deliver(&self, msg: &Message) -> usize {
        // ---
        let mut core = lock_ignore_poison(&self.core);
        let CoreState {
            subscribers,
            cursors,
        } = &mut *core;

        let mut delivered = 0;
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (idx, sub) in subscribers.iter_mut().enumerate() {
            if !sub.is_live() || !subject_matches(sub.pattern.as_str(), msg.subject.as_str()) {
                continue;
            }
            match &sub.group {
                Some(group) => groups.entry(group.clone()).or_default().push(idx),
                None => {
                    if offer(sub, msg) {
                        delivered += 1;
                    }
                }
            }
        }

        for (group, members) in groups {
            let cursor = cursors.entry((msg.subject.clone(), group)).or_insert(0);
            let start = *cursor;

            for step in 0..members.len() {
                let idx = members[(start + step) % members.len()];
                if offer(&mut subscribers[idx], msg) {
                    *cursor = (start + step + 1) % members.len();
                    delivered += 1;
                    break;
                }
            }
        }

        subscribers.retain(Subscriber::is_live);
        delivered
    }

    /// Store `msg` in the first stream capturing its subject.
    fn capture(&self, msg: &Message) -> Option<Bytes> {
        // ---
        let mut durable = lock_ignore_poison(&self.durable);
        let stream = durable
            .streams
            .values_mut()
            .find(|stream| stream.captures(&msg.subject))?;

        let seq = stream.next_seq;
        stream.next_seq += 1;
        stream.messages.insert(
            seq,
            Stored {
                subject: msg.subject.clone(),
                payload: msg.payload.clone(),
                stored_at: Instant::now(),
            },
        );

        let ack = PubAck {
            stream: stream.spec.name.clone(),
            seq,
        };
        drop(durable);

        log_debug!("stored {} in stream {} as seq {seq}", msg.subject, ack.stream);
        self.stored.notify_waiters();

        serde_json::to_vec(&ack).ok().map(Bytes::from)
    }

    fn subscribe(&self, owner: u64, subject: Subject, opts: SubscribeOptions) -> SubscriptionHandle {
        // ---
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        let mut core = lock_ignore_poison(&self.core);
        core.subscribers.push(Subscriber {
            owner,
            pattern: subject.clone(),
            tx,
            group: opts.queue_group,
            remaining: opts.max_messages,
        });

        SubscriptionHandle { subject, inbox: rx }
    }

    fn close(&self, owner: u64) {
        // ---
        let mut core = lock_ignore_poison(&self.core);
        core.subscribers.retain(|sub| sub.owner != owner);
    }

    /// Claim the next eligible message for `consumer`, if any.
    ///
    /// Returns the claim and the next instant an in-flight message becomes
    /// eligible again.
    fn claim(
        self: &Arc<Self>,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<(Option<Delivery>, Option<Instant>)> {
        // ---
        let now = Instant::now();
        let mut durable = lock_ignore_poison(&self.durable);

        let stream = durable
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| PipeError::Transport(format!("stream {stream_name} not found")))?;

        stream.prune_expired(now);

        let MemStream {
            messages, consumers, ..
        } = stream;

        let consumer = consumers.get_mut(consumer_name).ok_or_else(|| {
            PipeError::Transport(format!("consumer {consumer_name} not found on {stream_name}"))
        })?;

        consumer.in_flight.retain(|seq, _| messages.contains_key(seq));

        let mut next_wake: Option<Instant> = None;

        for (seq, stored) in messages.iter() {
            if !subject_matches(&consumer.spec.filter_subject, stored.subject.as_str()) {
                continue;
            }

            if let Some(eligible_at) = consumer.in_flight.get(seq) {
                if *eligible_at > now {
                    next_wake = Some(next_wake.map_or(*eligible_at, |w| w.min(*eligible_at)));
                    continue;
                }
                log_debug!("redelivering seq {seq} to {consumer_name}, ack wait expired");
            }

            consumer.in_flight.insert(*seq, now + consumer.spec.ack_wait);

            let acker = MemoryAcker {
                hub: Arc::clone(self),
                stream: stream_name.to_string(),
                consumer: consumer_name.to_string(),
                seq: *seq,
            };
            let delivery = Delivery::new(
                stored.subject.clone(),
                stored.payload.clone(),
                Box::new(acker),
            );
            return Ok((Some(delivery), None));
        }

        Ok((None, next_wake))
    }

    fn ack(&self, stream_name: &str, consumer_name: &str, seq: u64) -> Result<()> {
        // ---
        let mut durable = lock_ignore_poison(&self.durable);
        let stream = durable
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| PipeError::Transport(format!("stream {stream_name} not found")))?;

        // work-queue retention: an acknowledged message is gone for everyone
        stream.messages.remove(&seq);
        if let Some(consumer) = stream.consumers.get_mut(consumer_name) {
            consumer.in_flight.remove(&seq);
        }
        Ok(())
    }

    /// Number of messages currently held by `stream`.
    pub fn stored_len(&self, stream_name: &str) -> usize {
        // ---
        let durable = lock_ignore_poison(&self.durable);
        durable
            .streams
            .get(stream_name)
            .map_or(0, |stream| stream.messages.len())
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            core: Mutex::new(CoreState::default()),
            durable: Mutex::new(DurableState::default()),
            stored: Notify::new(),
            next_owner: AtomicU64::new(1),
        }
    }
}

/// Offer `msg` to one subscriber, consuming one of its remaining deliveries.
fn offer(sub: &mut Subscriber, msg: &Message) -> bool {
    // ---
    match sub.tx.try_send(msg.clone()) {
        Ok(()) => {
            if let Some(remaining) = sub.remaining.as_mut() {
                *remaining -= 1;
            }
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            log_warn!("subscriber inbox for {} is full, dropping message", sub.pattern);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Process-global hub used by [`create_memory_bus`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory bus.
///
/// Routes messages through a shared [`MemoryHub`]. Closing a bus removes only
/// its own subscriptions from the hub.
struct MemoryBus {
    // ---
    base: BusBase,
    hub: Arc<MemoryHub>,
    owner: u64,
    closed: AtomicBool,
}

impl MemoryBus {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipeError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
    // ---
    fn base(&self) -> &BusBase {
        &self.base
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        self.ensure_open()?;
        let delivered = self.hub.route(msg);
        log_debug!("{}: published to {delivered} receivers", self.bus_id());
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: Subject,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_open()?;
        log_debug!("{}: subscribe to {subject} {opts:?}", self.bus_id());
        Ok(self.hub.subscribe(self.owner, subject, opts))
    }

    async fn request(&self, subject: Subject, payload: Bytes, deadline: Duration) -> Result<Message> {
        // ---
        self.ensure_open()?;

        let inbox = Inbox::generate();
        let mut reply = self.hub.subscribe(
            self.owner,
            inbox.subject(),
            SubscribeOptions::fanout().max_messages(1),
        );

        let msg = Message::new(subject.clone(), payload).with_reply_to(inbox.subject());
        if self.hub.route(msg) == 0 {
            return Err(PipeError::Transport(format!(
                "no responders available for request on {subject}"
            )));
        }

        match tokio::time::timeout(deadline, reply.inbox.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(PipeError::Transport(format!(
                "reply subscription for {subject} closed"
            ))),
            Err(_) => Err(PipeError::Timeout),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log_debug!("{}: closing bus", self.bus_id());
        self.hub.close(self.owner);
        Ok(())
    }

    async fn work_queue(&self) -> Result<WorkQueuePtr> {
        // ---
        self.ensure_open()?;
        Ok(Arc::new(MemoryWorkQueue {
            hub: Arc::clone(&self.hub),
        }))
    }
}

/// Durable streams and consumers held by a [`MemoryHub`].
struct MemoryWorkQueue {
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl WorkQueue for MemoryWorkQueue {
    // ---
    async fn stream_names(&self) -> Result<Vec<String>> {
        // ---
        let durable = lock_ignore_poison(&self.hub.durable);
        let mut names: Vec<String> = durable.streams.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        // ---
        let mut durable = lock_ignore_poison(&self.hub.durable);
        if durable.streams.contains_key(&spec.name) {
            return Err(PipeError::AlreadyExists(format!("stream {}", spec.name)));
        }

        durable.streams.insert(
            spec.name.clone(),
            MemStream {
                spec: spec.clone(),
                next_seq: 1,
                messages: BTreeMap::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>> {
        // ---
        let durable = lock_ignore_poison(&self.hub.durable);
        let stream = durable
            .streams
            .get(stream)
            .ok_or_else(|| PipeError::Transport(format!("stream {stream} not found")))?;

        let mut names: Vec<String> = stream.consumers.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        // ---
        let mut durable = lock_ignore_poison(&self.hub.durable);
        let stream = durable
            .streams
            .get_mut(stream)
            .ok_or_else(|| PipeError::Transport(format!("stream {stream} not found")))?;

        if stream.consumers.contains_key(&spec.durable_name) {
            return Err(PipeError::AlreadyExists(format!(
                "consumer {}",
                spec.durable_name
            )));
        }

        stream.consumers.insert(
            spec.durable_name.clone(),
            MemConsumer {
                spec: spec.clone(),
                in_flight: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        deadline: Duration,
    ) -> Result<Option<Delivery>> {
        // ---
        let until = Instant::now() + deadline;

        loop {
            let notified = self.hub.stored.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (delivery, redeliver_at) = self.hub.claim(stream, consumer)?;
            if delivery.is_some() {
                return Ok(delivery);
            }

            if Instant::now() >= until {
                return Ok(None);
            }

            let wake = redeliver_at.map_or(until, |at| at.min(until));
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake) => {}
            }
        }
    }
}

struct MemoryAcker {
    hub: Arc<MemoryHub>,
    stream: String,
    consumer: String,
    seq: u64,
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.hub.ack(&self.stream, &self.consumer, self.seq)
    }
}

/// Create a new in-memory bus using the process-global hub.
///
/// All buses created with this function share a single hub, matching the
/// semantics of clients connected to one server. For isolated parallel
/// testing, use [`create_memory_bus_with_hub`].
///
/// # Errors
///
/// Currently infallible, always returns `Ok`.
pub async fn create_memory_bus(config: &PipeConfig) -> Result<BusPtr> {
    // ---
    create_memory_bus_with_hub(config, global_hub()).await
}

/// Create a new in-memory bus attached to `hub`.
///
/// # Errors
///
/// Currently infallible, always returns `Ok`.
pub async fn create_memory_bus_with_hub(config: &PipeConfig, hub: Arc<MemoryHub>) -> Result<BusPtr> {
    // ---
    let owner = hub.next_owner.fetch_add(1, Ordering::Relaxed);
    log_debug!("{}: create memory bus (owner {owner})", config.bus_id);

    Ok(Arc::new(MemoryBus {
        base: BusBase::new(config.bus_id.clone()),
        hub,
        owner,
        closed: AtomicBool::new(false),
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{AckPolicy, Retention, Storage};
    use tokio::time::timeout;

    async fn bus_on(hub: &Arc<MemoryHub>, id: &str) -> BusPtr {
        create_memory_bus_with_hub(&PipeConfig::memory(id), hub.clone())
            .await
            .unwrap()
    }

    fn stream_spec() -> StreamSpec {
        StreamSpec {
            name: "S".into(),
            subjects: vec!["q.>".into()],
            retention: Retention::WorkQueue,
            storage: Storage::File,
            max_age: Duration::from_secs(60),
        }
    }

    fn consumer_spec(name: &str, ack_wait: Duration) -> ConsumerSpec {
        ConsumerSpec {
            durable_name: name.into(),
            filter_subject: format!("q.{name}"),
            ack_policy: AckPolicy::Explicit,
            ack_wait,
        }
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;

        let mut sub = bus
            .subscribe(Subject::from("t.x"), SubscribeOptions::fanout())
            .await
            .unwrap();

        bus.publish(Message::new("t.x", Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let received = timeout(Duration::from_millis(100), sub.inbox.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription channel closed unexpectedly");

        assert_eq!(&received.payload[..], b"hello");
        assert_eq!(received.subject.as_str(), "t.x");
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;

        let mut members = Vec::new();
        for _ in 0..3 {
            members.push(
                bus.subscribe(Subject::from("work"), SubscribeOptions::queue("g"))
                    .await
                    .unwrap(),
            );
        }

        for i in 0..3u8 {
            bus.publish(Message::new("work", Bytes::from(vec![i])))
                .await
                .unwrap();
        }

        // round-robin: each member got exactly one
        for member in members.iter_mut() {
            assert!(member.inbox.try_recv().is_ok());
            assert!(member.inbox.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_max_messages_auto_unsubscribes() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;

        let mut sub = bus
            .subscribe(
                Subject::from("once"),
                SubscribeOptions::fanout().max_messages(1),
            )
            .await
            .unwrap();

        bus.publish(Message::new("once", Bytes::from_static(b"1")))
            .await
            .unwrap();
        bus.publish(Message::new("once", Bytes::from_static(b"2")))
            .await
            .unwrap();

        assert_eq!(&sub.inbox.recv().await.unwrap().payload[..], b"1");
        // the hub dropped its sender after the first delivery
        assert!(sub.inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_request_without_responders_fails_fast() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;

        let err = bus
            .request(Subject::from("nobody"), Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipeError::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;
        let _silent = bus
            .subscribe(Subject::from("silent"), SubscribeOptions::fanout())
            .await
            .unwrap();

        let err = bus
            .request(Subject::from("silent"), Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PipeError::Timeout));
    }

    #[tokio::test]
    async fn test_close_only_removes_own_subscriptions() {
        // ---
        let hub = MemoryHub::new();
        let a = bus_on(&hub, "a").await;
        let b = bus_on(&hub, "b").await;

        let mut sub_a = a
            .subscribe(Subject::from("t"), SubscribeOptions::fanout())
            .await
            .unwrap();
        let mut sub_b = b
            .subscribe(Subject::from("t"), SubscribeOptions::fanout())
            .await
            .unwrap();

        a.close().await.unwrap();
        b.publish(Message::new("t", Bytes::new())).await.unwrap();

        assert!(sub_a.inbox.recv().await.is_none());
        assert!(sub_b.inbox.recv().await.is_some());
        assert!(matches!(
            a.publish(Message::new("t", Bytes::new())).await,
            Err(PipeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_stream_captures_and_acks_publish() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;
        let queue = bus.work_queue().await.unwrap();
        queue.create_stream(&stream_spec()).await.unwrap();

        let reply = bus
            .request(Subject::from("q.jobs"), Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        let ack: PubAck = serde_json::from_slice(&reply.payload).unwrap();

        assert_eq!(ack, PubAck { stream: "S".into(), seq: 1 });
        assert_eq!(hub.stored_len("S"), 1);
    }

    #[tokio::test]
    async fn test_create_twice_reports_already_exists() {
        // ---
        let hub = MemoryHub::new();
        let queue = bus_on(&hub, "a").await.work_queue().await.unwrap();

        queue.create_stream(&stream_spec()).await.unwrap();
        assert!(matches!(
            queue.create_stream(&stream_spec()).await,
            Err(PipeError::AlreadyExists(_))
        ));

        let spec = consumer_spec("jobs", Duration::from_secs(30));
        queue.create_consumer("S", &spec).await.unwrap();
        assert!(matches!(
            queue.create_consumer("S", &spec).await,
            Err(PipeError::AlreadyExists(_))
        ));
        assert_eq!(queue.consumer_names("S").await.unwrap(), vec!["jobs"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_after_ack_wait() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;
        let queue = bus.work_queue().await.unwrap();
        queue.create_stream(&stream_spec()).await.unwrap();
        queue
            .create_consumer("S", &consumer_spec("jobs", Duration::from_secs(30)))
            .await
            .unwrap();

        bus.publish(Message::new("q.jobs", Bytes::from_static(b"job")))
            .await
            .unwrap();

        let first = queue
            .fetch("S", "jobs", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("message available");
        drop(first); // never acked

        let start = Instant::now();
        let second = queue
            .fetch("S", "jobs", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("redelivered");
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(&second.payload[..], b"job");

        second.ack().await.unwrap();
        assert_eq!(hub.stored_len("S"), 0);
        assert!(queue
            .fetch("S", "jobs", Duration::from_secs(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fetch_filters_by_subject() {
        // ---
        let hub = MemoryHub::new();
        let bus = bus_on(&hub, "a").await;
        let queue = bus.work_queue().await.unwrap();
        queue.create_stream(&stream_spec()).await.unwrap();
        queue
            .create_consumer("S", &consumer_spec("mine", Duration::from_secs(30)))
            .await
            .unwrap();

        bus.publish(Message::new("q.other", Bytes::from_static(b"no")))
            .await
            .unwrap();

        assert!(queue
            .fetch("S", "mine", Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }
}
