//! Work-queue behaviour against a real JetStream server.
//!
//! Run with `cargo test -p workqueue -- --ignored` on a machine with Docker.

mod common;

use std::sync::Arc;
use std::time::Duration;
use test_utils::TestNats;
use tokio::sync::watch;
use workqueue::{
    AckKind, Broker, ConnectionConfig, ConnectionEvent, ConnectionManager, ConsumerDescriptor,
    ConsumerLoop, ConsumerLoopConfig, FetchMode, JitteredInterval, ManagedConnection,
    NoOpProcessor, ProducerConfig, ProducerLoop, Provisioner, StreamApi, StreamDescriptor,
    SubmitTxQueue, WorkItem,
};

async fn connect(nats: &TestNats) -> ConnectionManager {
    let config = ConnectionConfig::new(nats.connection_string())
        .with_name("workqueue-tests")
        .with_operation_timeout(common::TIMEOUT);
    ConnectionManager::connect(config).await.unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scenario_a_occupancy_after_publish() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;

    common::scenario_a(connection.broker(), connection.publisher().as_ref()).await;
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scenario_b_unfiltered_consumer_drains_stream() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;

    common::scenario_b(connection.broker(), connection.publisher().as_ref()).await;
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scenario_c_second_unfiltered_consumer_rejected() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;

    common::scenario_c(connection.broker()).await;
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scenario_d_filtered_consumers_partition_work() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;

    common::scenario_d(connection.broker(), connection.publisher().as_ref()).await;
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lookup_distinguishes_missing_resources() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;
    let broker = connection.broker();

    assert!(broker.lookup_stream("MISSING").await.unwrap().is_none());

    let provisioner = Provisioner::new(broker, common::TIMEOUT);
    let stream = provisioner
        .ensure_stream(&common::events_stream())
        .await
        .unwrap();
    assert!(stream.was_created());
    assert!(stream.api().lookup_consumer("missing").await.unwrap().is_none());

    let again = provisioner
        .ensure_stream(&common::events_stream())
        .await
        .unwrap();
    assert!(!again.was_created());
    assert_eq!(again.subjects(), ["events.>".to_string()]);

    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_close_drains_and_refuses_later_publishes() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;
    let stream = Provisioner::new(connection.broker(), common::TIMEOUT)
        .ensure_stream(&common::events_stream())
        .await
        .unwrap();

    let publisher = connection.publisher();
    common::publish_item(publisher.as_ref(), "events.us.page_loaded").await;

    let mut events = connection.events();
    connection.close().await.unwrap();

    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        saw_closed |= event == ConnectionEvent::Closed;
    }
    assert!(saw_closed, "transport never reported Closed");

    let item = WorkItem::new("events.us.page_loaded");
    let refused = publisher
        .publish("events.us.page_loaded", item.encode().unwrap())
        .await;
    assert!(refused.is_err(), "publish after close was accepted");

    assert!(stream.info().await.is_err(), "lookup after close was answered");

    // The drain flushed the earlier publish before closing.
    let mut events_stream = nats.jetstream().get_stream("EVENTS").await.unwrap();
    assert_eq!(events_stream.info().await.unwrap().state.messages, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redelivery_after_ack_wait_and_nak() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;
    let provisioner = Provisioner::new(connection.broker(), common::TIMEOUT);

    let stream = provisioner
        .ensure_stream(&common::events_stream())
        .await
        .unwrap();
    let consumer = provisioner
        .ensure_consumer(
            &stream,
            &ConsumerDescriptor::new("processor-1").with_ack_wait(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    let publisher = connection.publisher();
    let item = common::publish_item(publisher.as_ref(), "events.us.page_loaded").await;

    let first = consumer.fetch(1, FetchMode::NoWait).await.unwrap();
    assert_eq!(first.len(), 1);
    drop(first);

    let second = consumer
        .fetch(1, FetchMode::Wait(Duration::from_secs(3)))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].delivered, 2);
    assert_eq!(WorkItem::decode(&second[0].payload).unwrap(), item);

    for delivery in second {
        delivery.ack(AckKind::Nak(None)).await.unwrap();
    }
    let third = consumer
        .fetch(1, FetchMode::Wait(Duration::from_secs(3)))
        .await
        .unwrap();
    assert_eq!(third[0].delivered, 3);
    for delivery in third {
        delivery.ack(AckKind::AckConfirmed).await.unwrap();
    }

    assert_eq!(stream.info().await.unwrap().messages, 0);
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_producer_and_consumer_loops() {
    let nats = TestNats::new().await;
    let connection = connect(&nats).await;
    let provisioner = Provisioner::new(connection.broker(), common::TIMEOUT);

    let stream = provisioner
        .ensure_stream(&StreamDescriptor::from_def::<SubmitTxQueue>())
        .await
        .unwrap();
    let consumer = provisioner
        .ensure_consumer(&stream, &ConsumerDescriptor::from_def::<SubmitTxQueue>())
        .await
        .unwrap();

    let producer = ProducerLoop::new(
        connection.publisher(),
        stream.clone(),
        ProducerConfig::new("submit-tx")
            .with_interval(JitteredInterval::new(Duration::from_millis(50), 0.5)),
        common::TIMEOUT,
    )
    .unwrap()
    .with_events(connection.events());
    let consumer_loop = ConsumerLoop::new(
        consumer,
        stream.clone(),
        Arc::new(NoOpProcessor),
        ConsumerLoopConfig::default()
            .with_interval(JitteredInterval::fixed(Duration::from_millis(50))),
        common::TIMEOUT,
    )
    .with_events(connection.events());

    let (tx, rx) = watch::channel(false);
    let producer = tokio::spawn(producer.run(rx.clone()));
    let consumer = tokio::spawn(consumer_loop.run(rx));
    tokio::time::sleep(Duration::from_secs(1)).await;
    tx.send(true).unwrap();

    let produced = producer.await.unwrap().unwrap();
    let consumed = consumer.await.unwrap().unwrap();
    assert!(produced.published > 0);

    let remaining = stream.info().await.unwrap().messages;
    assert_eq!(consumed.acked + remaining, produced.published);

    connection.close().await.unwrap();
}
