//! Integration tests for the in-memory bus: consumer-group streams,
//! restarts, and recovery of deliveries held by a crashed consumer.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use taskbridge::bus::{consume, InMemoryBus, MessageBus, Subscription, TaskEvent};
use taskbridge::compute::EchoCompute;
use taskbridge::store::{GenericTaskStore, InMemoryBackend, TaskStore};
use taskbridge::{Payload, TaskStatus, WorkerConfig, WorkerLoop};

fn subscription(consumer: &str, lease: Duration) -> Subscription {
    Subscription::new("work", "workers", consumer)
        .with_wait(Duration::from_millis(50))
        .with_lease(lease)
}

async fn publish_work(bus: &dyn MessageBus, ids: &[&str]) {
    for id in ids {
        bus.publish("work", &TaskEvent::work(*id, Payload::text(*id)))
            .await
            .unwrap();
    }
}

mod stream_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_restarted_stream_resumes_group() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        publish_work(bus.as_ref(), &["a", "b", "c"]).await;

        {
            let mut stream = consume(
                Arc::clone(&bus),
                subscription("w1", Duration::from_secs(5)).with_batch_size(1),
            );
            let first = stream.next().await.unwrap().unwrap();
            assert_eq!(first.event.correlation_id, "a");
            bus.ack(&first).await.unwrap();

            let second = stream.next().await.unwrap().unwrap();
            assert_eq!(second.event.correlation_id, "b");
            // Dropped without ack: the consumer "crashes".
        }

        let mut stream = consume(
            Arc::clone(&bus),
            subscription("w2", Duration::from_secs(5)).with_batch_size(1),
        );
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.event.correlation_id, "c");
        bus.ack(&next).await.unwrap();

        // "b" comes back once its lease has run out.
        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.event.correlation_id, "b");
        assert_eq!(redelivered.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_are_isolated() {
        let bus = InMemoryBus::new();
        bus.publish(
            "results",
            &TaskEvent::completion("a", TaskStatus::Completed, None),
        )
        .await
        .unwrap();

        let batch = bus
            .receive(&subscription("w1", Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(bus.published("results").len(), 1);
    }
}

mod crash_recovery_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_worker_picks_up_delivery_of_crashed_consumer() {
        let store: Arc<dyn TaskStore> = Arc::new(GenericTaskStore::new(InMemoryBackend::new()));
        let bus = Arc::new(InMemoryBus::new());
        store.create("c-1", Payload::text("hello")).await.unwrap();
        publish_work(bus.as_ref(), &["c-1"]).await;

        // A consumer leases the event and disappears before claiming.
        let leased = bus
            .receive(&subscription("crashed", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(bus.outstanding("work", "workers"), 1);

        let worker = WorkerLoop::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::new(EchoCompute),
            WorkerConfig {
                work_topic: "work".to_string(),
                group: "workers".to_string(),
                receive_wait: Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        );
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        for _ in 0..100 {
            if store.get("c-1").await.unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let record = store.get("c-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(Payload::text("hello")));
        assert_eq!(bus.outstanding("work", "workers"), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
