mod common;

use std::time::Duration;

use bytes::Bytes;
use piper::{
    // ---
    subject::STREAM_NAME,
    Input,
    MemoryHub,
    Message,
    Mode,
    Notifier,
    Pipe,
    PipeError,
    Provisioner,
    WorkQueue,
};
use tokio_util::sync::CancellationToken;

use common::{bus, eventually, fast_config, spawn_listener};

async fn queue_message(hub: &std::sync::Arc<MemoryHub>, name: &str, text: &str) {
    // ---
    let pipe = Pipe::new(name, Mode::Durable).unwrap();
    let mut notifier = Notifier::new(bus(hub, "notifier").await, pipe, fast_config("notifier"));
    notifier
        .notify(Input::from_message(text), &CancellationToken::new())
        .await
        .unwrap();
}

// ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queued_before_listener_is_delivered() {
    // ---
    let hub = MemoryHub::new();

    queue_message(&hub, "jobs", "first").await;
    queue_message(&hub, "jobs", "second").await;
    assert_eq!(hub.stored_len(STREAM_NAME), 2);

    let listener = spawn_listener(&hub, "worker", "jobs", Mode::Durable).await;
    let sink = listener.sink.clone();

    assert!(eventually(|| sink.lines().len() == 2).await);
    assert_eq!(sink.lines(), vec!["first", "second"]);
    assert!(eventually(|| hub.stored_len(STREAM_NAME) == 0).await);

    listener.cancel.cancel();
    listener.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listener_keeps_pulling() {
    // ---
    let hub = MemoryHub::new();
    let mut listener = spawn_listener(&hub, "worker", "stream", Mode::Durable).await;
    listener.subscribed().await;

    for i in 0..5 {
        queue_message(&hub, "stream", &format!("msg-{i}")).await;
    }

    let sink = listener.sink.clone();
    assert!(eventually(|| sink.lines().len() == 5).await);
    assert_eq!(sink.lines()[4], "msg-4");

    listener.cancel.cancel();
    listener.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipes_do_not_share_messages() {
    // ---
    let hub = MemoryHub::new();
    queue_message(&hub, "alpha", "for alpha").await;

    let mut listener = spawn_listener(&hub, "worker", "beta", Mode::Durable).await;
    listener.subscribed().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(listener.sink.lines().is_empty());
    assert_eq!(hub.stored_len(STREAM_NAME), 1);

    listener.cancel.cancel();
    listener.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_undecodable_message_is_not_acknowledged() {
    // ---
    let hub = MemoryHub::new();
    let setup = bus(&hub, "setup").await;
    Provisioner::new(setup.work_queue().await.unwrap(), Duration::from_secs(1))
        .ensure_pipe("broken")
        .await
        .unwrap();

    setup
        .publish(Message::new("pipe.ASYNC.broken", Bytes::from_static(b"not gzip")))
        .await
        .unwrap();

    let listener = spawn_listener(&hub, "worker", "broken", Mode::Durable).await;
    let err = listener.join().await.unwrap_err();

    assert!(matches!(err, PipeError::Codec(_)), "{err:?}");
    assert_eq!(hub.stored_len(STREAM_NAME), 1);
}

#[tokio::test]
async fn test_setup_is_idempotent() {
    // ---
    let hub = MemoryHub::new();
    let queue = bus(&hub, "setup").await.work_queue().await.unwrap();
    let provisioner = Provisioner::new(queue.clone(), Duration::from_secs(1));

    provisioner.ensure_stream().await.unwrap();
    provisioner.ensure_stream().await.unwrap();
    provisioner.ensure_consumer("a").await.unwrap();
    provisioner.ensure_consumer("b").await.unwrap();
    provisioner.ensure_consumer("a").await.unwrap();

    assert_eq!(queue.stream_names().await.unwrap(), vec![STREAM_NAME]);
    assert_eq!(queue.consumer_names(STREAM_NAME).await.unwrap(), vec!["a", "b"]);
}
