// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{eventually, order};
use futures_util::future::{ready, Ready};
use rabbitmq_services::{
    dispatcher::{ConsumerOptions, RabbitMQConsumer},
    errors::{AmqpError, HandlerError},
    events::{exchanges, routing_keys, OrderCreatedEvent},
    memory::InMemoryBroker,
    publisher::RabbitMQPublisher,
    queue::QueueDefinition,
    transport::MessageChannel,
};
use serde_json::json;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

const QUEUE: &str = "order.created.test";

async fn setup(broker: &InMemoryBroker) -> (Arc<RabbitMQPublisher>, RabbitMQConsumer) {
    let factory = Arc::new(broker.clone());
    let publisher = RabbitMQPublisher::new(factory.clone()).await.unwrap();
    (publisher, RabbitMQConsumer::new(factory))
}

/// Handler recording every order id it sees.
fn recorder(
    seen: Arc<Mutex<Vec<i32>>>,
) -> impl Fn(OrderCreatedEvent) -> Ready<Result<(), HandlerError>> + Send + Sync {
    move |event: OrderCreatedEvent| {
        seen.lock().unwrap().push(event.order_id);
        ready(Ok(()))
    }
}

#[tokio::test]
async fn round_trip_acks_and_empties_the_queue() {
    let broker = InMemoryBroker::new();
    let (publisher, consumer) = setup(&broker).await;

    let received = Arc::new(Mutex::new(vec![]));
    let sink = received.clone();
    let handle = consumer
        .consume_bound::<OrderCreatedEvent, _>(
            exchanges::ORDER_EVENTS,
            routing_keys::ORDER_CREATED,
            QUEUE,
            move |event: OrderCreatedEvent| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                    Ok::<(), HandlerError>(())
                }
            },
        )
        .await
        .unwrap();

    let sent = order(1);
    publisher.publish_event(&sent).await.unwrap();

    eventually("the order to be handled", || received.lock().unwrap().len() == 1).await;
    assert_eq!(received.lock().unwrap()[0], sent);
    eventually("the ack", || broker.unacked_count(QUEUE) == Some(0)).await;
    assert_eq!(broker.message_count(QUEUE), Some(0));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(broker.consumer_count(QUEUE), Some(0));
}

#[tokio::test]
async fn handlers_run_one_at_a_time() {
    let broker = InMemoryBroker::new();
    let (publisher, consumer) = setup(&broker).await;

    for id in 1..=5 {
        publisher.publish_to_queue(QUEUE, &order(id)).await.unwrap();
    }

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Mutex::new(vec![]));
    let (a, p, d) = (active.clone(), peak.clone(), done.clone());

    let handle = consumer
        .consume::<OrderCreatedEvent, _>(QUEUE, move |event: OrderCreatedEvent| {
            let (active, peak, done) = (a.clone(), p.clone(), d.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.lock().unwrap().push(event.order_id);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    eventually("all five orders", || done.lock().unwrap().len() == 5).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(*done.lock().unwrap(), vec![1, 2, 3, 4, 5]);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn failing_handler_drops_the_message_and_keeps_consuming() {
    let broker = InMemoryBroker::new();
    let (publisher, consumer) = setup(&broker).await;

    let seen = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    let handle = consumer
        .consume::<OrderCreatedEvent, _>(QUEUE, move |event: OrderCreatedEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.order_id);
                if event.order_id == 1 {
                    return Err(HandlerError::new("order 1 is cursed"));
                }
                Ok(())
            }
        })
        .await
        .unwrap();

    publisher.publish_to_queue(QUEUE, &order(1)).await.unwrap();
    publisher.publish_to_queue(QUEUE, &order(2)).await.unwrap();

    eventually("both orders", || seen.lock().unwrap().len() == 2).await;
    eventually("settlement", || broker.unacked_count(QUEUE) == Some(0)).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(broker.message_count(QUEUE), Some(0));
    assert!(!handle.is_finished());

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn malformed_payload_skips_the_handler() {
    let broker = InMemoryBroker::new();
    let (publisher, consumer) = setup(&broker).await;

    let seen = Arc::new(Mutex::new(vec![]));
    let handle = consumer
        .consume::<OrderCreatedEvent, _>(QUEUE, recorder(seen.clone()))
        .await
        .unwrap();

    publisher
        .publish_to_queue(QUEUE, &json!({ "orderId": "not a number" }))
        .await
        .unwrap();
    publisher.publish_to_queue(QUEUE, &order(3)).await.unwrap();

    eventually("the valid order", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![3]);
    eventually("settlement", || broker.unacked_count(QUEUE) == Some(0)).await;
    assert_eq!(broker.message_count(QUEUE), Some(0));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn competing_consumers_split_the_messages() {
    let broker = InMemoryBroker::new();
    let (publisher, consumer) = setup(&broker).await;

    let first = Arc::new(Mutex::new(vec![]));
    let second = Arc::new(Mutex::new(vec![]));
    let h1 = consumer
        .consume_bound::<OrderCreatedEvent, _>(
            exchanges::ORDER_EVENTS,
            routing_keys::ORDER_CREATED,
            QUEUE,
            recorder(first.clone()),
        )
        .await
        .unwrap();
    let h2 = consumer
        .consume_bound::<OrderCreatedEvent, _>(
            exchanges::ORDER_EVENTS,
            routing_keys::ORDER_CREATED,
            QUEUE,
            recorder(second.clone()),
        )
        .await
        .unwrap();

    for id in 1..=10 {
        publisher.publish_event(&order(id)).await.unwrap();
    }

    eventually("all ten orders", || {
        first.lock().unwrap().len() + second.lock().unwrap().len() == 10
    })
    .await;

    let a: Vec<i32> = first.lock().unwrap().clone();
    let b: Vec<i32> = second.lock().unwrap().clone();
    let a_set: HashSet<i32> = a.iter().copied().collect();
    let b_set: HashSet<i32> = b.iter().copied().collect();

    assert_eq!(a_set.len(), a.len());
    assert_eq!(b_set.len(), b.len());
    assert!(a_set.is_disjoint(&b_set));
    let all: HashSet<i32> = a_set.union(&b_set).copied().collect();
    assert_eq!(all, (1..=10).collect::<HashSet<i32>>());
    assert!(!a.is_empty() && !b.is_empty());

    h1.shutdown(Duration::from_secs(1)).await.unwrap();
    h2.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn dead_letter_option_keeps_rejected_messages() {
    let broker = InMemoryBroker::new();
    let factory = Arc::new(broker.clone());
    let publisher = RabbitMQPublisher::new(factory.clone()).await.unwrap();
    let consumer =
        RabbitMQConsumer::with_options(factory, ConsumerOptions::new().with_dead_letter());

    let handle = consumer
        .consume_bound::<OrderCreatedEvent, _>(
            exchanges::ORDER_EVENTS,
            routing_keys::ORDER_CREATED,
            QUEUE,
            |_: OrderCreatedEvent| async {
                Err::<(), _>(HandlerError::new("downstream unavailable"))
            },
        )
        .await
        .unwrap();

    publisher.publish_event(&order(1)).await.unwrap();

    let dlq = format!("{QUEUE}-dlq");
    eventually("the dead letter", || broker.message_count(&dlq) == Some(1)).await;
    assert_eq!(broker.message_count(QUEUE), Some(0));

    let parked: OrderCreatedEvent =
        serde_json::from_slice(&broker.ready_payloads(&dlq)[0]).unwrap();
    assert_eq!(parked.order_id, 1);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn dead_letter_queue_accepts_direct_publishes() {
    let broker = InMemoryBroker::new();
    let factory = Arc::new(broker.clone());
    let consumer =
        RabbitMQConsumer::with_options(factory.clone(), ConsumerOptions::new().with_dead_letter());

    let seen = Arc::new(Mutex::new(vec![]));
    let handle = consumer
        .consume::<OrderCreatedEvent, _>(QUEUE, recorder(seen.clone()))
        .await
        .unwrap();

    let publisher = RabbitMQPublisher::with_dead_letter(factory).await.unwrap();
    publisher.publish_to_queue(QUEUE, &order(4)).await.unwrap();

    eventually("the order", || seen.lock().unwrap().len() == 1).await;
    eventually("the ack", || broker.unacked_count(QUEUE) == Some(0)).await;
    assert_eq!(*seen.lock().unwrap(), vec![4]);
    assert_eq!(broker.message_count(&format!("{QUEUE}-dlq")), Some(0));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn consumer_resubscribes_after_connection_loss() {
    let broker = InMemoryBroker::new().with_recovery_interval(Duration::from_millis(20));
    let (publisher, consumer) = setup(&broker).await;

    let seen = Arc::new(Mutex::new(vec![]));
    let handle = consumer
        .consume_bound::<OrderCreatedEvent, _>(
            exchanges::ORDER_EVENTS,
            routing_keys::ORDER_CREATED,
            QUEUE,
            recorder(seen.clone()),
        )
        .await
        .unwrap();

    publisher.publish_event(&order(1)).await.unwrap();
    eventually("the first order", || seen.lock().unwrap().len() == 1).await;
    eventually("the first ack", || broker.unacked_count(QUEUE) == Some(0)).await;

    broker.disconnect();
    assert_eq!(broker.consumer_count(QUEUE), Some(0));
    eventually("the consumer to come back", || broker.consumer_count(QUEUE) == Some(1)).await;

    // the publisher replaces its closed channel on its own
    publisher.publish_event(&order(2)).await.unwrap();
    eventually("the second order", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_the_in_flight_delivery() {
    let broker = InMemoryBroker::new();
    let (publisher, consumer) = setup(&broker).await;

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (started.clone(), finished.clone());
    let handle = consumer
        .consume::<OrderCreatedEvent, _>(QUEUE, move |_: OrderCreatedEvent| {
            let (started, finished) = (s.clone(), f.clone());
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    publisher.publish_to_queue(QUEUE, &order(1)).await.unwrap();
    eventually("the handler to start", || started.load(Ordering::SeqCst)).await;

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.message_count(QUEUE), Some(0));
    assert_eq!(broker.unacked_count(QUEUE), Some(0));
    assert_eq!(broker.consumer_count(QUEUE), Some(0));
}

#[tokio::test]
async fn shutdown_gives_up_on_a_stuck_handler() {
    let broker = InMemoryBroker::new();
    let (publisher, consumer) = setup(&broker).await;

    let started = Arc::new(AtomicBool::new(false));
    let s = started.clone();
    let handle = consumer
        .consume::<OrderCreatedEvent, _>(QUEUE, move |_: OrderCreatedEvent| {
            let started = s.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap();

    publisher.publish_to_queue(QUEUE, &order(1)).await.unwrap();
    eventually("the handler to start", || started.load(Ordering::SeqCst)).await;

    let err = handle.shutdown(Duration::from_millis(50)).await.unwrap_err();
    assert_eq!(err, AmqpError::ShutdownTimeout(QUEUE.to_owned()));

    // the aborted consumer's channel goes away with it
    eventually("the message to be ready again", || {
        broker.message_count(QUEUE) == Some(1) && broker.unacked_count(QUEUE) == Some(0)
    })
    .await;
    assert_eq!(broker.consumer_count(QUEUE), Some(0));
}

#[tokio::test]
async fn startup_errors_reach_the_caller() {
    let broker = InMemoryBroker::new();
    let (_publisher, consumer) = setup(&broker).await;

    // an existing non-durable queue conflicts with the durable declaration
    broker
        .open_channel()
        .declare_queue(&QueueDefinition::new(QUEUE))
        .await
        .unwrap();

    let err = consumer
        .consume::<OrderCreatedEvent, _>(QUEUE, recorder(Arc::new(Mutex::new(vec![]))))
        .await
        .err()
        .unwrap();
    assert_eq!(err, AmqpError::TopologyConflict(QUEUE.to_owned()));
    assert_eq!(broker.consumer_count(QUEUE), Some(0));
}
