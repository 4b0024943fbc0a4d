//! NATS bus implementation using `async-nats`.
//!
//! ## Concurrency model
//!
//! - The `async_nats::Client` is internally multiplexed and cheap to clone;
//!   every operation clones it out of a shared slot and runs on the caller's
//!   task. Closing the bus empties the slot.
//! - Each subscription gets a **forwarding task** that drains the
//!   `Subscriber` stream into the handle's inbox. The task stops when the
//!   handle is dropped, the server ends the subscription (auto-unsubscribe),
//!   or the bus is closed.
//! - Connection events are observed in the client's event callback. Error
//!   class events are pushed into the bus error channel; the rest are only
//!   logged.
//!
//! ## Durable work queue
//!
//! JetStream backs [`WorkQueue`]: a work-queue retention stream plus one
//! durable pull consumer per pipe. Fetches pull a single message with an
//! expiry, and acknowledgements go straight back to the server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy as NatsAckPolicy, DeliverPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    Context,
};
use async_nats::{Client, ConnectOptions, Event, RequestErrorKind, ServerAddr};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    AckPolicy,
    Bus,
    BusBase,
    BusPtr,
    ConsumerSpec,
    Delivery,
    Message,
    PipeConfig,
    PipeError,
    Result,
    Retention,
    Storage,
    StreamSpec,
    Subject,
    SubscribeOptions,
    SubscriptionHandle,
    WorkQueue,
    WorkQueuePtr,
};

use crate::domain::{Acker, INBOX_CAPACITY};

/// Server used when no servers are configured.
pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";

const MAX_RECONNECTS: usize = 100;

type TaskList = Mutex<Vec<JoinHandle<()>>>;

struct NatsBus {
    // ---
    base: BusBase,
    client: RwLock<Option<Client>>,
    tasks: TaskList,
}

impl NatsBus {
    async fn client(&self) -> Result<Client> {
        // ---
        self.client.read().await.clone().ok_or(PipeError::Closed)
    }

    fn track(&self, task: JoinHandle<()>) {
        // ---
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

fn from_nats(msg: async_nats::Message) -> Message {
    // ---
    Message {
        subject: Subject::from(msg.subject.to_string()),
        payload: msg.payload,
        reply_to: msg.reply.map(|reply| Subject::from(reply.to_string())),
    }
}

#[async_trait::async_trait]
impl Bus for NatsBus {
    // ---
    fn base(&self) -> &BusBase {
        &self.base
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        // ---
        let client = self.client().await?;
        let subject = msg.subject.to_string();

        let published = match msg.reply_to {
            Some(reply_to) => {
                client
                    .publish_with_reply(subject, reply_to.to_string(), msg.payload)
                    .await
            }
            None => client.publish(subject, msg.payload).await,
        };

        published.map_err(|err| PipeError::Transport(format!("publish to {} failed: {err}", msg.subject)))
    }

    async fn subscribe(
        &self,
        subject: Subject,
        opts: SubscribeOptions,
    ) -> Result<SubscriptionHandle> {
        // ---
        let client = self.client().await?;

        let subscribed = match &opts.queue_group {
            Some(group) => {
                client
                    .queue_subscribe(subject.to_string(), group.clone())
                    .await
            }
            None => client.subscribe(subject.to_string()).await,
        };
        let mut subscriber = subscribed
            .map_err(|err| PipeError::Transport(format!("subscribe to {subject} failed: {err}")))?;

        if let Some(n) = opts.max_messages {
            subscriber
                .unsubscribe_after(n)
                .await
                .map_err(|err| PipeError::Transport(format!("auto-unsubscribe on {subject} failed: {err}")))?;
        }

        log_debug!("{}: subscribed to {subject} {opts:?}", self.bus_id());

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let task = tokio::spawn(async move {
            // ---
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = subscriber.next() => {
                        let Some(msg) = next else { break };
                        if tx.send(from_nats(msg)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.track(task);

        Ok(SubscriptionHandle { subject, inbox: rx })
    }

    async fn request(&self, subject: Subject, payload: Bytes, deadline: Duration) -> Result<Message> {
        // ---
        let client = self.client().await?;

        let reply = tokio::time::timeout(deadline, client.request(subject.to_string(), payload)).await;
        match reply {
            Err(_) => Err(PipeError::Timeout),
            Ok(Ok(msg)) => Ok(from_nats(msg)),
            Ok(Err(err)) => match err.kind() {
                RequestErrorKind::TimedOut => Err(PipeError::Timeout),
                RequestErrorKind::NoResponders => Err(PipeError::Transport(format!(
                    "no responders available for request on {subject}"
                ))),
                _ => Err(PipeError::Transport(format!("request on {subject} failed: {err}"))),
            },
        }
    }

    async fn flush(&self) -> Result<()> {
        // ---
        let client = self.client().await?;
        client
            .flush()
            .await
            .map_err(|err| PipeError::Transport(format!("flush failed: {err}")))
    }

    async fn close(&self) -> Result<()> {
        // ---
        let Some(client) = self.client.write().await.take() else {
            return Ok(());
        };

        log_debug!("{}: closing bus", self.bus_id());

        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }

        if let Err(err) = client.flush().await {
            log_warn!("{}: flush before close failed: {err}", self.bus_id());
        }
        drop(client);
        Ok(())
    }

    async fn work_queue(&self) -> Result<WorkQueuePtr> {
        // ---
        let context = jetstream::new(self.client().await?);

        context
            .query_account()
            .await
            .map_err(|err| PipeError::Provision(format!("JetStream is not available: {err}")))?;

        Ok(Arc::new(JetStreamQueue { context }))
    }
}

/// JetStream-backed work queue.
struct JetStreamQueue {
    context: Context,
}

impl JetStreamQueue {
    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream> {
        // ---
        self.context
            .get_stream(name)
            .await
            .map_err(|err| PipeError::Transport(format!("stream {name} lookup failed: {err}")))
    }
}

#[async_trait::async_trait]
impl WorkQueue for JetStreamQueue {
    // ---
    async fn stream_names(&self) -> Result<Vec<String>> {
        // ---
        self.context
            .stream_names()
            .try_collect()
            .await
            .map_err(|err| PipeError::Transport(format!("listing streams failed: {err}")))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        // ---
        let config = StreamConfig {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            retention: match spec.retention {
                Retention::WorkQueue => RetentionPolicy::WorkQueue,
            },
            storage: match spec.storage {
                Storage::File => StorageType::File,
            },
            max_age: spec.max_age,
            ..Default::default()
        };

        self.context
            .create_stream(config)
            .await
            .map(|_| ())
            .map_err(|err| PipeError::Transport(format!("creating stream {} failed: {err}", spec.name)))
    }

    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>> {
        // ---
        self.stream(stream)
            .await?
            .consumer_names()
            .try_collect()
            .await
            .map_err(|err| PipeError::Transport(format!("listing consumers of {stream} failed: {err}")))
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        // ---
        let config = pull::Config {
            durable_name: Some(spec.durable_name.clone()),
            filter_subject: spec.filter_subject.clone(),
            ack_policy: match spec.ack_policy {
                AckPolicy::Explicit => NatsAckPolicy::Explicit,
            },
            ack_wait: spec.ack_wait,
            deliver_policy: DeliverPolicy::All,
            ..Default::default()
        };

        self.stream(stream)
            .await?
            .create_consumer(config)
            .await
            .map(|_| ())
            .map_err(|err| {
                PipeError::Transport(format!(
                    "creating consumer {} on {stream} failed: {err}",
                    spec.durable_name
                ))
            })
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        deadline: Duration,
    ) -> Result<Option<Delivery>> {
        // ---
        let consumer: PullConsumer = self
            .stream(stream)
            .await?
            .get_consumer(consumer)
            .await
            .map_err(|err| PipeError::Transport(format!("consumer {consumer} lookup failed: {err}")))?;

        let mut batch = consumer
            .batch()
            .max_messages(1)
            .expires(deadline)
            .messages()
            .await
            .map_err(|err| PipeError::Transport(format!("fetch failed: {err}")))?;

        match batch.next().await {
            None => Ok(None),
            Some(Err(err)) => Err(PipeError::Transport(format!("fetch failed: {err}"))),
            Some(Ok(message)) => {
                let subject = Subject::from(message.subject.to_string());
                let payload = message.payload.clone();
                Ok(Some(Delivery::new(
                    subject,
                    payload,
                    Box::new(JetStreamAcker { message }),
                )))
            }
        }
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait::async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|err| PipeError::Transport(format!("ack failed: {err}")))
    }
}

fn server_addrs(servers: &str) -> Result<Vec<ServerAddr>> {
    // ---
    let servers = if servers.trim().is_empty() {
        DEFAULT_SERVER
    } else {
        servers
    };

    servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ServerAddr>()
                .map_err(|err| PipeError::Connect(format!("invalid server address {s:?}: {err}")))
        })
        .collect()
}

/// Connect to NATS and return a bus.
///
/// # Errors
///
/// [`PipeError::Connect`] when the server list is invalid, the credentials
/// file cannot be loaded or the initial connection fails.
pub async fn create_nats_bus(config: &PipeConfig) -> Result<BusPtr> {
    // ---
    let addrs = server_addrs(&config.servers)?;
    let base = BusBase::new(config.bus_id.clone());
    let errors = base.error_sink();
    let bus_id = config.bus_id.clone();

    let mut options = ConnectOptions::new()
        .name(format!("piper-{}", config.bus_id))
        .max_reconnects(Some(MAX_RECONNECTS))
        .no_echo()
        .event_callback(move |event| {
            let errors = errors.clone();
            let bus_id = bus_id.clone();
            async move {
                match event {
                    Event::Connected => log_info!("{bus_id}: reconnected"),
                    Event::Disconnected => log_warn!("{bus_id}: disconnected"),
                    Event::ServerError(err) => {
                        log_warn!("{bus_id}: server error: {err}");
                        let _ = errors.send(PipeError::Transport(format!("server error: {err}")));
                    }
                    Event::ClientError(err) => {
                        log_warn!("{bus_id}: client error: {err}");
                        let _ = errors.send(PipeError::Transport(format!("client error: {err}")));
                    }
                    Event::Closed => {
                        log_warn!("{bus_id}: connection closed");
                        let _ = errors.send(PipeError::Closed);
                    }
                    other => log_debug!("{bus_id}: {other}"),
                }
            }
        });

    if let Some(path) = &config.credentials {
        options = options.credentials_file(path).await.map_err(|err| {
            PipeError::Connect(format!(
                "could not load credentials from {}: {err}",
                path.display()
            ))
        })?;
    }

    log_debug!("{}: connecting to {}", config.bus_id, config.servers);

    let client = options
        .connect(addrs.as_slice())
        .await
        .map_err(|err| PipeError::Connect(err.to_string()))?;

    log_info!("{}: connected", config.bus_id);

    Ok(Arc::new(NatsBus {
        base,
        client: RwLock::new(Some(client)),
        tasks: Mutex::new(Vec::new()),
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_server_addrs_default() {
        // ---
        let addrs = server_addrs("").unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].host(), "127.0.0.1");
        assert_eq!(addrs[0].port(), 4222);
    }

    #[test]
    fn test_server_addrs_list() {
        // ---
        let addrs = server_addrs("nats://a:4222, nats://b:5222").unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].host(), "b");
        assert_eq!(addrs[1].port(), 5222);
    }

    #[test]
    fn test_server_addrs_invalid() {
        // ---
        assert!(matches!(
            server_addrs("nats://host:notaport"),
            Err(PipeError::Connect(_))
        ));
    }
}
