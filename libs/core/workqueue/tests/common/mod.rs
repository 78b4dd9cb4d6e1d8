//! Scenarios shared by the in-memory and JetStream integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use workqueue::{
    Broker, ConsumerDescriptor, ConsumerHandle, FetchMode, Provisioner, Publish, StreamDescriptor,
    StreamHandle, WorkItem, WorkQueueError,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const GEO_SUBJECTS: [&str; 3] = [
    "events.us.page_loaded",
    "events.eu.mouse_clicked",
    "events.us.input_focused",
];

pub fn events_stream() -> StreamDescriptor {
    StreamDescriptor::new("EVENTS", ["events.>"]).with_description("User interface events")
}

pub async fn publish_item(publisher: &dyn Publish, subject: &str) -> WorkItem {
    let item = WorkItem::new(subject);
    publisher
        .publish(subject, item.encode().unwrap())
        .await
        .unwrap();
    item
}

pub async fn fetch_all(consumer: &ConsumerHandle) -> Vec<workqueue::Delivery> {
    consumer.fetch(100, FetchMode::NoWait).await.unwrap()
}

/// Provision EVENTS and publish the three geo events.
pub async fn scenario_a(broker: Arc<dyn Broker>, publisher: &dyn Publish) -> StreamHandle {
    let provisioner = Provisioner::new(broker, TIMEOUT);
    let stream = provisioner.ensure_stream(&events_stream()).await.unwrap();

    for subject in GEO_SUBJECTS {
        publish_item(publisher, subject).await;
    }

    let state = stream.info().await.unwrap();
    assert_eq!(state.messages, 3);
    assert_eq!(state.subjects, 3);
    assert_eq!(state.consumers, 0);
    stream
}

/// Unfiltered consumer drains the stream.
pub async fn scenario_b(broker: Arc<dyn Broker>, publisher: &dyn Publish) {
    let stream = scenario_a(broker.clone(), publisher).await;
    let provisioner = Provisioner::new(broker, TIMEOUT);
    let consumer = provisioner
        .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-1"))
        .await
        .unwrap();

    let batch = consumer.fetch(3, FetchMode::NoWait).await.unwrap();
    assert_eq!(batch.len(), 3);
    let subjects: Vec<_> = batch.iter().map(|d| d.subject.clone()).collect();
    assert_eq!(subjects, GEO_SUBJECTS);

    for delivery in batch {
        let item = WorkItem::decode(&delivery.payload).unwrap();
        assert_eq!(item.payload, delivery.subject);
        delivery.ack(workqueue::AckKind::AckConfirmed).await.unwrap();
    }

    let consumer_state = consumer.info().await.unwrap();
    assert_eq!(consumer_state.pending, 0);
    assert_eq!(consumer_state.ack_pending, 0);

    let stream_state = stream.info().await.unwrap();
    assert_eq!(stream_state.messages, 0);
    assert_eq!(stream_state.consumers, 1);
}

/// A second unfiltered consumer is rejected until the first is deleted.
pub async fn scenario_c(broker: Arc<dyn Broker>) {
    let provisioner = Provisioner::new(broker, TIMEOUT);
    let stream = provisioner.ensure_stream(&events_stream()).await.unwrap();
    provisioner
        .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-1"))
        .await
        .unwrap();

    let err = provisioner
        .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-2"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, WorkQueueError::Capability { .. }),
        "expected capability error, got {err}"
    );

    assert!(provisioner
        .delete_consumer(&stream, "processor-1")
        .await
        .unwrap());
    let consumer = provisioner
        .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-2"))
        .await
        .unwrap();
    assert!(consumer.was_created());
}

/// Disjoint filtered consumers each see only their region.
pub async fn scenario_d(broker: Arc<dyn Broker>, publisher: &dyn Publish) {
    let provisioner = Provisioner::new(broker, TIMEOUT);
    let stream = provisioner.ensure_stream(&events_stream()).await.unwrap();

    let us = provisioner
        .ensure_consumer(
            &stream,
            &ConsumerDescriptor::new("processor-us").with_filter("events.us.>"),
        )
        .await
        .unwrap();
    let eu = provisioner
        .ensure_consumer(
            &stream,
            &ConsumerDescriptor::new("processor-eu").with_filter("events.eu.>"),
        )
        .await
        .unwrap();

    for subject in [
        "events.us.page_loaded",
        "events.eu.mouse_clicked",
        "events.us.input_focused",
        "events.eu.page_loaded",
    ] {
        publish_item(publisher, subject).await;
    }

    for (consumer, region) in [(&us, "events.us."), (&eu, "events.eu.")] {
        let batch = fetch_all(consumer).await;
        assert_eq!(batch.len(), 2, "consumer {}", consumer.name());
        for delivery in batch {
            assert!(
                delivery.subject.starts_with(region),
                "{} received {}",
                consumer.name(),
                delivery.subject
            );
            delivery.ack(workqueue::AckKind::AckConfirmed).await.unwrap();
        }
    }

    assert_eq!(stream.info().await.unwrap().messages, 0);

    let overlapping = provisioner
        .ensure_consumer(
            &stream,
            &ConsumerDescriptor::new("processor-us-pages").with_filter("events.us.page_loaded"),
        )
        .await
        .unwrap_err();
    assert!(overlapping.is_capability());
}
