//! Sending side of a pipe.
//!
//! A [`Notifier`] delivers one message to one listener. It keeps retrying
//! until a listener acknowledges the message, the overall deadline runs out
//! or the caller cancels.
//!
//! # Flow
//!
//! 1. Read the payload (literal text or stdin).
//! 2. Durable pipes: provision the stream and the pipe's consumer.
//! 3. Discover pipes: ask a listener for its one-time data subject.
//! 4. Encode the payload for the pipe's mode.
//! 5. Request on the data subject until a reply arrives. For durable pipes
//!    the reply must be the stream's publish acknowledgement.
//!
//! Every step, including reading stdin, stops when the cancellation token
//! fires.

use std::fmt;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    codec,
    log_debug,
    log_info,
    provision::Provisioner,
    PubAck,
    retry::{retry_until, Deadline},
    BusPtr,
    Input,
    Message,
    Mode,
    Pipe,
    PipeConfig,
    PipeError,
    Result,
    Subject,
};

/// Progress of a notify call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    Idle,
    Discovering,
    Sending,
    Succeeded,
    TimedOut,
    Cancelled,
    Failed,
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Sender of a single pipe message.
pub struct Notifier {
    bus: BusPtr,
    pipe: Pipe,
    config: PipeConfig,
    state: NotifyState,
}

impl Notifier {
    pub fn new(bus: BusPtr, pipe: Pipe, config: PipeConfig) -> Self {
        // ---
        Self {
            bus,
            pipe,
            config,
            state: NotifyState::Idle,
        }
    }

    pub fn state(&self) -> NotifyState {
        self.state
    }

    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }

    /// Deliver `input` to a listener of the pipe.
    ///
    /// # Errors
    ///
    /// - [`PipeError::Input`] when the payload cannot be read
    /// - [`PipeError::Provision`] when durable resources cannot be ensured
    /// - [`PipeError::TimedOut`] when the overall deadline is exhausted
    /// - [`PipeError::Cancelled`] when `cancel` fires first
    pub async fn notify(&mut self, input: Input, cancel: &CancellationToken) -> Result<()> {
        // ---
        let result = self.run(input, cancel).await;

        self.state = match &result {
            Ok(()) => NotifyState::Succeeded,
            Err(PipeError::TimedOut(_)) => NotifyState::TimedOut,
            Err(PipeError::Cancelled) => NotifyState::Cancelled,
            Err(_) => NotifyState::Failed,
        };

        log_debug!("notify on {} finished: {}", self.pipe, self.state);
        result
    }

    async fn run(&mut self, input: Input, cancel: &CancellationToken) -> Result<()> {
        // ---
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipeError::Cancelled),
            text = input.read() => text?,
        };

        let mode = self.pipe.mode();
        let overall = self.config.notify_timeout(mode == Mode::Durable);
        let deadline = Deadline::after(overall);

        log_debug!("publishing to {} with a timeout of {overall:?}", self.pipe);

        let subject = match mode {
            Mode::Discover => {
                self.state = NotifyState::Discovering;
                self.discover(&deadline, cancel).await?
            }
            Mode::Durable => {
                self.provision().await?;
                self.data_subject()?
            }
            Mode::Direct | Mode::Group => self.data_subject()?,
        };

        self.state = NotifyState::Sending;

        let payload = codec::encode(mode, &text)?;
        log_debug!(
            "sending {} bytes of data encoded to {} on subject {subject}",
            text.len(),
            payload.len()
        );

        let bus = &self.bus;
        let retry = &self.config.retry;
        retry_until(&deadline, retry.attempt_timeout, retry.backoff, cancel, move |attempt| {
            let subject = subject.clone();
            let payload = payload.clone();
            async move {
                let reply = bus.request(subject, payload, attempt).await?;
                if mode == Mode::Durable {
                    let ack = stored(&reply)?;
                    log_debug!("stored as {} #{}", ack.stream, ack.seq);
                }
                Ok::<(), PipeError>(())
            }
        })
        .await?;

        log_info!("delivered message on {}", self.pipe);
        Ok(())
    }

    async fn provision(&self) -> Result<()> {
        // ---
        let queue = self.bus.work_queue().await?;
        Provisioner::new(queue, self.config.provision_timeout)
            .ensure_pipe(self.pipe.name())
            .await
    }

    /// Ask a listener for its one-time data subject.
    async fn discover(&self, deadline: &Deadline, cancel: &CancellationToken) -> Result<Subject> {
        // ---
        let discover = self.pipe.subjects().discover.clone().ok_or_else(|| {
            PipeError::InvalidPipe(format!("{} has no discovery subject", self.pipe))
        })?;

        let bus = &self.bus;
        let subject = retry_until(
            deadline,
            self.config.discovery_timeout,
            std::time::Duration::ZERO,
            cancel,
            move |attempt| {
                let discover = discover.clone();
                async move {
                    let reply = bus.request(discover.clone(), Bytes::new(), attempt).await?;
                    let subject = std::str::from_utf8(&reply.payload)
                        .map_err(|_| PipeError::Transport("discovery reply is not UTF-8".into()))?;
                    if subject.is_empty() {
                        return Err(PipeError::Transport(format!(
                            "empty discovery reply on {discover}"
                        )));
                    }
                    Ok(Subject::from(subject))
                }
            },
        )
        .await?;

        log_debug!("discovered data subject {subject} for {}", self.pipe);
        Ok(subject)
    }

    fn data_subject(&self) -> Result<Subject> {
        // ---
        self.pipe
            .subjects()
            .data
            .clone()
            .ok_or_else(|| PipeError::InvalidPipe(format!("{} has no data subject", self.pipe)))
    }
}

/// Decode a stream's publish acknowledgement. Anything else, such as a
/// broker error reply, is a transport error and gets retried.
fn stored(reply: &Message) -> Result<PubAck> {
    // ---
    serde_json::from_slice(&reply.payload).map_err(|_| {
        PipeError::Transport(format!(
            "message was not stored: {}",
            String::from_utf8_lossy(&reply.payload)
        ))
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Bus, BusBase, RetryPolicy, SubscribeOptions, SubscriptionHandle, WorkQueuePtr};
    use std::io::Read;
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    /// Bus whose requests fail with a transport error a fixed number of times.
    struct FlakyBus {
        base: BusBase,
        failures: usize,
        calls: Mutex<Vec<Subject>>,
    }

    impl FlakyBus {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                base: BusBase::new("flaky"),
                failures,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl Bus for FlakyBus {
        fn base(&self) -> &BusBase {
            &self.base
        }

        async fn publish(&self, _msg: Message) -> Result<()> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _subject: Subject,
            _opts: SubscribeOptions,
        ) -> Result<SubscriptionHandle> {
            Err(PipeError::Transport("unsupported".into()))
        }

        async fn request(&self, subject: Subject, _payload: Bytes, _deadline: Duration) -> Result<Message> {
            // ---
            let mut calls = self.calls.lock().unwrap();
            calls.push(subject.clone());
            if calls.len() <= self.failures {
                return Err(PipeError::Transport("no responders".into()));
            }
            Ok(Message::new(subject, Bytes::new()))
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn work_queue(&self) -> Result<WorkQueuePtr> {
            Err(PipeError::Provision("no work queue".into()))
        }
    }

    fn config() -> PipeConfig {
        PipeConfig::memory("n").with_retry(RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_delivered() {
        // ---
        let bus = FlakyBus::new(3);
        let pipe = Pipe::new("x", Mode::Direct).unwrap();
        let mut notifier = Notifier::new(bus.clone(), pipe, config());
        let start = Instant::now();

        notifier
            .notify(Input::from_message("hello"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bus.calls(), 4);
        assert_eq!(notifier.state(), NotifyState::Succeeded);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout_reports_configured_value() {
        // ---
        let bus = FlakyBus::new(usize::MAX);
        let pipe = Pipe::new("x", Mode::Group).unwrap();
        let mut notifier =
            Notifier::new(bus, pipe, config().with_timeout(Duration::from_secs(2)));

        let err = notifier
            .notify(Input::from_message("hello"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "timeout after 2s");
        assert_eq!(notifier.state(), NotifyState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_reported() {
        // ---
        let bus = FlakyBus::new(usize::MAX);
        let pipe = Pipe::new("x", Mode::Direct).unwrap();
        let mut notifier = Notifier::new(bus, pipe, config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = notifier
            .notify(Input::from_message("hello"), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(notifier.state(), NotifyState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_without_work_queue_is_fatal() {
        // ---
        let bus = FlakyBus::new(0);
        let pipe = Pipe::new("jobs", Mode::Durable).unwrap();
        let mut notifier = Notifier::new(bus.clone(), pipe, config());

        let err = notifier
            .notify(Input::from_message("hello"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipeError::Provision(_)));
        assert_eq!(bus.calls(), 0);
        assert_eq!(notifier.state(), NotifyState::Failed);
    }

    #[tokio::test]
    async fn test_discovery_retries_empty_replies() {
        // ---
        // the flaky bus answers with an empty body, so discovery never ends
        let bus = FlakyBus::new(0);
        let pipe = Pipe::new("x", Mode::Discover).unwrap();
        let mut notifier =
            Notifier::new(bus.clone(), pipe, config().with_timeout(Duration::from_millis(10)));

        let err = notifier
            .notify(Input::from_message("hello"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipeError::TimedOut(_)));
        assert!(bus.calls() > 1);
        assert_eq!(bus.calls.lock().unwrap()[0].as_str(), "pipe.x.discover");
    }

    /// Reader that blocks until its sender is dropped, like an idle stdin.
    struct Stalled(mpsc::Receiver<()>);

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_input() {
        // ---
        let (release, stalled) = mpsc::channel();
        let bus = FlakyBus::new(0);
        let pipe = Pipe::new("x", Mode::Direct).unwrap();
        let mut notifier = Notifier::new(bus.clone(), pipe, config());
        let cancel = CancellationToken::new();

        let interrupt = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            interrupt.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            notifier.notify(Input::Reader(Box::new(Stalled(stalled))), &cancel),
        )
        .await
        .expect("notify kept waiting on its input");

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(notifier.state(), NotifyState::Cancelled);
        assert_eq!(bus.calls(), 0);

        drop(release);
    }

    #[test]
    fn test_only_publish_acks_count_as_stored() {
        // ---
        let ack = Message::new(
            "_INBOX.a",
            Bytes::from_static(br#"{"stream":"PIPER","seq":7,"duplicate":false}"#),
        );
        assert_eq!(
            stored(&ack).unwrap(),
            PubAck {
                stream: "PIPER".into(),
                seq: 7
            }
        );

        let refused = Message::new(
            "_INBOX.b",
            Bytes::from_static(br#"{"error":{"code":503,"description":"no responders"}}"#),
        );
        assert!(matches!(stored(&refused), Err(PipeError::Transport(_))));
        assert!(stored(&Message::new("_INBOX.c", Bytes::new()))
            .unwrap_err()
            .is_retryable());
    }
}
