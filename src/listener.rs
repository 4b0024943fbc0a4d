//! Receiving side of a pipe.
//!
//! A [`Listener`] subscribes according to the pipe's mode and writes every
//! delivered payload to its [`OutputSink`](crate::OutputSink).
//!
//! # Concurrency
//!
//! Subscription inboxes are drained by a spawned worker task. The worker
//! reports progress over a single event channel, and the foreground task
//! selects over that channel, the bus's background error channel and the
//! caller's cancellation token. Whichever fires first ends the call; the
//! worker is aborted on the way out.
//!
//! # Modes
//!
//! | Mode     | Subscription                                   | Ends after       |
//! |----------|------------------------------------------------|------------------|
//! | Direct   | data subject, one message                      | one delivery     |
//! | Group    | data subject, queue group `pipe`, one message  | one delivery     |
//! | Discover | discover subject, queue group, one request     | one delivery     |
//! | Durable  | pull consumer named after the pipe             | cancellation     |
//!
//! Request/reply modes acknowledge the sender with an empty reply before the
//! payload is decoded. Durable mode acknowledges only after the payload was
//! decoded and written, so a failed delivery is retried by the stream.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    codec,
    log_debug,
    log_info,
    log_warn,
    provision::Provisioner,
    subject::{GROUP_NAME, STREAM_NAME},
    BusPtr,
    Inbox,
    Message,
    Mode,
    Pipe,
    PipeConfig,
    PipeError,
    Result,
    SinkPtr,
    Subject,
    SubscribeOptions,
    SubscriptionHandle,
    WorkQueuePtr,
};

/// Progress of a listen call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    Subscribed,
    Delivering,
    Done,
    Failed,
}

impl fmt::Display for ListenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One-time data subject handed out by a discover listener.
///
/// The ticket is claimed by the first discovery request that reaches it;
/// every later claim fails, so at most one sender is ever told the subject.
#[derive(Debug)]
pub struct DiscoveryTicket {
    data_subject: Subject,
    claimed: AtomicBool,
}

impl DiscoveryTicket {
    /// A ticket for a freshly generated inbox subject.
    pub fn new() -> Self {
        Self {
            data_subject: Inbox::generate().subject(),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn data_subject(&self) -> &Subject {
        &self.data_subject
    }

    /// Returns `true` for the first caller only.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl Default for DiscoveryTicket {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker to foreground reports.
enum Event {
    Delivering,
    Delivered,
    Done,
    Failed(PipeError),
}

type EventTx = mpsc::UnboundedSender<Event>;

/// Receiver of pipe messages.
pub struct Listener {
    bus: BusPtr,
    pipe: Pipe,
    config: PipeConfig,
    sink: SinkPtr,
    state: watch::Sender<ListenState>,
}

impl Listener {
    pub fn new(bus: BusPtr, pipe: Pipe, config: PipeConfig, sink: SinkPtr) -> Self {
        // ---
        let (state, _) = watch::channel(ListenState::Idle);
        Self {
            bus,
            pipe,
            config,
            sink,
            state,
        }
    }

    pub fn state(&self) -> ListenState {
        *self.state.borrow()
    }

    /// Watch state transitions, e.g. to wait until the listener is subscribed.
    pub fn watch_state(&self) -> watch::Receiver<ListenState> {
        self.state.subscribe()
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    fn set_state(&self, state: ListenState) {
        // ---
        log_debug!("listener on {}: {state}", self.pipe);
        self.state.send_replace(state);
    }

    /// Listen until the pipe's delivery completes, fails, or `cancel` fires.
    ///
    /// Cancellation is a clean exit and returns `Ok(())`. Durable listeners
    /// only ever end through cancellation or an error.
    pub async fn listen(&self, cancel: &CancellationToken) -> Result<()> {
        // ---
        let result = self.run(cancel).await;
        self.set_state(match result {
            Ok(()) => ListenState::Done,
            Err(_) => ListenState::Failed,
        });
        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        // ---
        let mut bus_errors = self.bus.take_errors();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let worker = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            worker = self.start(events_tx) => worker?,
        };
        let _abort = AbortOnDrop(worker);

        self.set_state(ListenState::Subscribed);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log_debug!("listener on {} cancelled", self.pipe);
                    return Ok(());
                }
                err = next_bus_error(&mut bus_errors) => {
                    log_warn!("listener on {} aborted by bus error: {err}", self.pipe);
                    return Err(err);
                }
                event = events.recv() => match event {
                    Some(Event::Delivering) => self.set_state(ListenState::Delivering),
                    Some(Event::Delivered) => self.set_state(ListenState::Subscribed),
                    Some(Event::Done) => return Ok(()),
                    Some(Event::Failed(err)) => return Err(err),
                    None => {
                        return Err(PipeError::Transport(format!(
                            "listener worker for {} stopped unexpectedly",
                            self.pipe
                        )))
                    }
                },
            }
        }
    }

    /// Subscribe for the pipe's mode and spawn the worker draining it.
    async fn start(&self, events: EventTx) -> Result<JoinHandle<()>> {
        // ---
        let subjects = self.pipe.subjects();
        let mode = self.pipe.mode();
        let bus = self.bus.clone();
        let sink = self.sink.clone();

        let worker = match mode {
            Mode::Direct | Mode::Group => {
                let subject = required(subjects.data.clone(), "data", &self.pipe)?;
                let opts = match subjects.group {
                    Some(group) => SubscribeOptions::queue(group),
                    None => SubscribeOptions::fanout(),
                }
                .max_messages(1);

                log_debug!("listening on {subject}");
                let sub = self.bus.subscribe(subject, opts).await?;
                spawn_worker(events, move |events| deliver_one(bus, sink, mode, sub, events))
            }
            Mode::Discover => {
                let subject = required(subjects.discover.clone(), "discover", &self.pipe)?;
                let group = subjects.group.unwrap_or(GROUP_NAME);

                log_debug!("listening for discovery on {subject}");
                let sub = self
                    .bus
                    .subscribe(subject, SubscribeOptions::queue(group).max_messages(1))
                    .await?;
                let ticket = Arc::new(DiscoveryTicket::new());
                spawn_worker(events, move |events| answer_discovery(bus, sink, ticket, sub, events))
            }
            Mode::Durable => {
                let queue = self.bus.work_queue().await?;
                Provisioner::new(queue.clone(), self.config.provision_timeout)
                    .ensure_pipe(self.pipe.name())
                    .await?;

                log_debug!("pulling from consumer {} on {STREAM_NAME}", self.pipe.name());
                let name = self.pipe.name().to_string();
                let fetch_timeout = self.config.fetch_timeout;
                spawn_worker(events, move |events| pull(queue, sink, name, fetch_timeout, events))
            }
        };

        Ok(worker)
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn required(subject: Option<Subject>, kind: &str, pipe: &Pipe) -> Result<Subject> {
    subject.ok_or_else(|| PipeError::InvalidPipe(format!("{pipe} has no {kind} subject")))
}

async fn next_bus_error(errors: &mut Option<mpsc::UnboundedReceiver<PipeError>>) -> PipeError {
    // ---
    match errors {
        Some(rx) => match rx.recv().await {
            Some(err) => err,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Run `work` on its own task and report its outcome as the final event.
fn spawn_worker<F, Fut>(events: EventTx, work: F) -> JoinHandle<()>
where
    F: FnOnce(EventTx) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    // ---
    let fut = work(events.clone());
    tokio::spawn(async move {
        let event = match fut.await {
            Ok(()) => Event::Done,
            Err(err) => Event::Failed(err),
        };
        let _ = events.send(event);
    })
}

/// Reply to the sender, then decode and write.
async fn deliver_request(bus: &BusPtr, sink: &SinkPtr, mode: Mode, msg: Message) -> Result<()> {
    // ---
    if let Some(reply) = msg.reply(Bytes::new()) {
        bus.publish(reply).await?;
    }

    let text = codec::decode(mode, &msg.payload)?;
    log_debug!("received {} bytes on {}", msg.payload.len(), msg.subject);
    sink.write(&text)
}

async fn first_message(sub: &mut SubscriptionHandle) -> Result<Message> {
    // ---
    sub.inbox.recv().await.ok_or_else(|| {
        PipeError::Transport(format!("subscription on {} closed before a message arrived", sub.subject))
    })
}

async fn deliver_one(
    bus: BusPtr,
    sink: SinkPtr,
    mode: Mode,
    mut sub: SubscriptionHandle,
    events: EventTx,
) -> Result<()> {
    // ---
    let msg = first_message(&mut sub).await?;
    drop(sub);

    let _ = events.send(Event::Delivering);
    deliver_request(&bus, &sink, mode, msg).await
}

async fn answer_discovery(
    bus: BusPtr,
    sink: SinkPtr,
    ticket: Arc<DiscoveryTicket>,
    mut sub: SubscriptionHandle,
    events: EventTx,
) -> Result<()> {
    // ---
    let request = first_message(&mut sub).await?;
    drop(sub);

    let reply_to = request.reply_to.ok_or(PipeError::MissingReplySubject)?;

    if !ticket.claim() {
        log_debug!("discovery ticket already claimed, ignoring request");
        return Ok(());
    }

    // subscribe before replying so the sender can never publish too early
    let mut data = bus
        .subscribe(
            ticket.data_subject().clone(),
            SubscribeOptions::fanout().max_messages(1),
        )
        .await?;

    let answer = Bytes::from(ticket.data_subject().to_string());
    bus.publish(Message::new(reply_to, answer)).await?;
    log_debug!("answered discovery with {}", ticket.data_subject());

    let msg = first_message(&mut data).await?;
    drop(data);

    let _ = events.send(Event::Delivering);
    deliver_request(&bus, &sink, Mode::Discover, msg).await
}

async fn pull(
    queue: WorkQueuePtr,
    sink: SinkPtr,
    name: String,
    fetch_timeout: Duration,
    events: EventTx,
) -> Result<()> {
    // ---
    loop {
        let delivery = match queue.fetch(STREAM_NAME, &name, fetch_timeout).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) | Err(PipeError::Timeout) => {
                log_debug!("no message on {name} within {fetch_timeout:?}");
                continue;
            }
            Err(err) => return Err(err),
        };

        let _ = events.send(Event::Delivering);

        // unacknowledged on failure: the stream redelivers after the ack wait
        let text = codec::decode(Mode::Durable, &delivery.payload)?;
        sink.write(&text)?;
        delivery.ack().await?;

        log_info!("delivered durable message on {name}");
        let _ = events.send(Event::Delivered);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_ticket_claimed_once() {
        // ---
        let ticket = DiscoveryTicket::new();
        assert!(ticket.data_subject().as_str().starts_with("_INBOX."));
        assert!(!ticket.is_claimed());

        assert!(ticket.claim());
        assert!(!ticket.claim());
        assert!(ticket.is_claimed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ticket_claim_races() {
        // ---
        let ticket = Arc::new(DiscoveryTicket::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let ticket = ticket.clone();
            tasks.push(tokio::spawn(async move { ticket.claim() }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_tickets_are_unique() {
        // ---
        assert_ne!(
            DiscoveryTicket::new().data_subject(),
            DiscoveryTicket::new().data_subject()
        );
    }
}
