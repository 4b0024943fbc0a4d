#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use piper::{
    // ---
    create_memory_bus_with_hub,
    BusPtr,
    CaptureSink,
    ListenState,
    Listener,
    MemoryHub,
    Mode,
    Pipe,
    PipeConfig,
    Result,
    RetryPolicy,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Config with short retry timing so tests do not wait on production backoffs.
pub fn fast_config(id: &str) -> PipeConfig {
    // ---
    PipeConfig::memory(id)
        .with_retry(RetryPolicy {
            attempt_timeout: Duration::from_millis(500),
            backoff: Duration::from_millis(10),
        })
        .with_timeout(Duration::from_secs(5))
        .with_discovery_timeout(Duration::from_millis(200))
        .with_fetch_timeout(Duration::from_millis(200))
}

pub async fn bus(hub: &Arc<MemoryHub>, id: &str) -> BusPtr {
    create_memory_bus_with_hub(&fast_config(id), hub.clone())
        .await
        .expect("memory bus")
}

/// A listener running on its own task.
pub struct Running {
    pub sink: CaptureSink,
    pub cancel: CancellationToken,
    pub state: watch::Receiver<ListenState>,
    pub task: JoinHandle<Result<()>>,
}

impl Running {
    pub async fn subscribed(&mut self) {
        // ---
        tokio::time::timeout(
            Duration::from_secs(2),
            self.state.wait_for(|s| *s != ListenState::Idle),
        )
        .await
        .expect("listener did not subscribe in time")
        .expect("listener state channel closed");
    }

    pub async fn join(self) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("listener did not finish in time")
            .expect("listener task panicked")
    }
}

pub async fn spawn_listener(hub: &Arc<MemoryHub>, id: &str, name: &str, mode: Mode) -> Running {
    // ---
    let sink = CaptureSink::new();
    let pipe = Pipe::new(name, mode).expect("valid pipe");
    let listener = Listener::new(bus(hub, id).await, pipe, fast_config(id), Arc::new(sink.clone()));
    let state = listener.watch_state();
    let cancel = CancellationToken::new();

    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { listener.listen(&cancel).await })
    };

    Running {
        sink,
        cancel,
        state,
        task,
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    // ---
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
