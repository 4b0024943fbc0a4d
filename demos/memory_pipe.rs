//! Every pipe mode, end to end, on one in-memory hub.
//!
//! ```text
//! cargo run --example memory_pipe
//! ```

use std::sync::Arc;
use std::time::Duration;

use piper::{
    BusBuilder, BusPtr, CaptureSink, Input, Listener, MemoryHub, Mode, Notifier, Pipe, PipeConfig,
    Result, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

fn config(id: &str) -> PipeConfig {
    PipeConfig::memory(id).with_retry(RetryPolicy {
        attempt_timeout: Duration::from_millis(500),
        backoff: Duration::from_millis(50),
    })
}

async fn bus(hub: &Arc<MemoryHub>, id: &str) -> Result<BusPtr> {
    BusBuilder::new().bus_id(id).memory_hub(hub.clone()).build().await
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let hub = MemoryHub::new();

    for (name, mode) in [
        ("direct", Mode::Direct),
        ("group", Mode::Group),
        ("discover", Mode::Discover),
        ("durable", Mode::Durable),
    ] {
        let sink = CaptureSink::new();
        let cancel = CancellationToken::new();

        let listener = Listener::new(
            bus(&hub, "listener").await?,
            Pipe::new(name, mode)?,
            config("listener"),
            Arc::new(sink.clone()),
        );
        let listening = {
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.listen(&cancel).await })
        };

        let mut notifier = Notifier::new(
            bus(&hub, "notifier").await?,
            Pipe::new(name, mode)?,
            config("notifier"),
        );
        notifier
            .notify(Input::from_message(format!("hello over {mode}")), &cancel)
            .await?;

        // durable listeners pull until told to stop
        while sink.lines().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        if let Ok(result) = listening.await {
            result?;
        }

        println!("{name}: {:?}", sink.lines());
    }

    Ok(())
}
