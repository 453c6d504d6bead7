//! End-to-end tests for submit -> publish -> process -> complete -> observe.
//!
//! Every test wires a correlator, one or more worker loops and (where
//! relevant) a reaper over a shared in-memory store and bus, then checks the
//! task record and the outcome the submitter sees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use taskbridge::bus::{InMemoryBus, MessageBus, TaskEvent};
use taskbridge::compute::{Compute, ComputeError, FnCompute};
use taskbridge::retry::Backoff;
use taskbridge::store::{GenericTaskStore, InMemoryBackend, TaskStore};
use taskbridge::worker::DropReason;
use taskbridge::{
    AwaitOutcome, Correlator, CorrelatorConfig, Payload, ProcessOutcome, ReapReport, Reaper,
    ReaperConfig, TaskStatus, TaskUpdate, WorkerConfig, WorkerLoop,
};

const WORK_TOPIC: &str = "taskbridge.work";

struct Harness {
    store: Arc<dyn TaskStore>,
    bus: Arc<InMemoryBus>,
    correlator: Correlator,
}

fn harness() -> Harness {
    let store: Arc<dyn TaskStore> = Arc::new(GenericTaskStore::new(InMemoryBackend::new()));
    let bus = Arc::new(InMemoryBus::new());
    let config = CorrelatorConfig {
        poll: Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
        ..CorrelatorConfig::default()
    };
    let correlator = Correlator::new(Arc::clone(&store), bus.clone(), config);
    Harness {
        store,
        bus,
        correlator,
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        receive_wait: Duration::from_millis(20),
        ..WorkerConfig::default()
    }
}

impl Harness {
    fn worker(&self, compute: Arc<dyn Compute>) -> WorkerLoop {
        let bus: Arc<dyn MessageBus> = self.bus.clone();
        WorkerLoop::new(Arc::clone(&self.store), bus, compute, worker_config())
    }

    fn spawn_worker(&self, compute: Arc<dyn Compute>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let worker = self.worker(compute);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { worker.run(token).await });
        (shutdown, handle)
    }
}

/// A compute step that counts its invocations and answers with a fixed
/// reading.
fn counting_reading(calls: Arc<AtomicUsize>, reading: &'static str) -> Arc<dyn Compute> {
    Arc::new(FnCompute::new(move |_payload: Payload| {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(Payload::text(reading)) })
    }))
}

mod happy_path {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_birth_date_round_trip() {
        let h = harness();
        let id = h
            .correlator
            .submit(Payload::new("birth-date", 1, "1990-05-12"))
            .await
            .unwrap();

        let pending = h.store.get(&id).await.unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert_eq!(pending.result, None);

        let calls = Arc::new(AtomicUsize::new(0));
        let (shutdown, handle) = h.spawn_worker(counting_reading(calls.clone(), "Leo reading..."));

        let outcome = h
            .correlator
            .await_result(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Completed(Payload::text("Leo reading...")));

        let done = h.store.get(&id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(Payload::text("Leo reading...")));
        assert_eq!(done.error, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_event_published() {
        let h = harness();
        let worker = h.worker(counting_reading(Arc::new(AtomicUsize::new(0)), "done"));
        h.store.create("c-1", Payload::text("x")).await.unwrap();

        let outcome = worker
            .handle_event(&TaskEvent::work("c-1", Payload::text("x")))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let completions = h.bus.published("taskbridge.results");
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].correlation_id, "c-1");
        assert_eq!(completions[0].payload, Some(Payload::text("done")));
    }

    #[tokio::test]
    async fn test_result_observed_promptly_after_transition() {
        let h = harness();
        let id = h.correlator.submit(Payload::text("x")).await.unwrap();

        let store = Arc::clone(&h.store);
        let writer_id = id.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store
                .transition(&writer_id, TaskStatus::Pending, TaskUpdate::Processing)
                .await
                .unwrap();
            store
                .transition(
                    &writer_id,
                    TaskStatus::Processing,
                    TaskUpdate::Completed(Payload::text("ok")),
                )
                .await
                .unwrap();
        });

        let started = tokio::time::Instant::now();
        let outcome = h
            .correlator
            .await_result(&id, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Completed(Payload::text("ok")));
        // Poll cap is 50ms; allow generous scheduling slack.
        assert!(started.elapsed() < Duration::from_secs(2));
        writer.await.unwrap();
    }
}

mod duplicate_delivery {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_redelivery_after_completion_changes_nothing() {
        let h = harness();
        h.store.create("c-1", Payload::text("x")).await.unwrap();
        h.store
            .transition("c-1", TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();
        h.store
            .transition(
                "c-1",
                TaskStatus::Processing,
                TaskUpdate::Completed(Payload::text("first")),
            )
            .await
            .unwrap();
        let before = h.store.get("c-1").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let first = h.worker(counting_reading(calls.clone(), "second"));
        let second = h.worker(counting_reading(calls.clone(), "second"));
        let event = TaskEvent::work("c-1", Payload::text("x"));

        let (a, b) = tokio::join!(first.handle_event(&event), second.handle_event(&event));
        let duplicate = ProcessOutcome::Dropped(DropReason::Duplicate(TaskStatus::Completed));
        assert_eq!(a.unwrap(), duplicate);
        assert_eq!(b.unwrap(), duplicate);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get("c-1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_workers_compute_once() {
        let h = harness();
        h.store.create("c-1", Payload::text("x")).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let workers: Vec<WorkerLoop> = (0..8)
            .map(|_| h.worker(counting_reading(calls.clone(), "once")))
            .collect();
        let event = TaskEvent::work("c-1", Payload::text("x"));

        let outcomes = join_all(workers.iter().map(|w| w.handle_event(&event))).await;
        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(ProcessOutcome::Completed)))
            .count();
        assert_eq!(completed, 1);
        for outcome in &outcomes {
            assert!(matches!(
                outcome,
                Ok(ProcessOutcome::Completed
                    | ProcessOutcome::Dropped(DropReason::ClaimLost | DropReason::Duplicate(_)))
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_dropped() {
        let h = harness();
        let worker = h.worker(counting_reading(Arc::new(AtomicUsize::new(0)), "x"));
        let outcome = worker
            .handle_event(&TaskEvent::work("never-created", Payload::text("x")))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::NotFound));
    }
}

mod failures {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use taskbridge::bus::{BusError, Delivery, Subscription};
    use taskbridge::{SubmitError, TaskError};

    #[tokio::test]
    async fn test_compute_failure_is_recorded_and_not_retried() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let compute: Arc<dyn Compute> = Arc::new(FnCompute::new(move |_payload: Payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(ComputeError::Failed("model offline".to_string())) })
        }));

        let id = h.correlator.submit(Payload::text("x")).await.unwrap();
        let (shutdown, handle) = h.spawn_worker(compute);

        let outcome = h
            .correlator
            .await_result(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AwaitOutcome::Failed("compute failed: model offline".to_string())
        );

        let record = h.store.get(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("compute failed: model offline"));
        assert_eq!(record.result, None);

        // Give the loop time to pick up anything it might retry.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_compute_timeout_fails_task() {
        let h = harness();
        let slow: Arc<dyn Compute> = Arc::new(FnCompute::new(|_payload: Payload| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Payload::text("too late"))
            })
        }));
        let bus: Arc<dyn MessageBus> = h.bus.clone();
        let worker = WorkerLoop::new(
            Arc::clone(&h.store),
            bus,
            slow,
            WorkerConfig {
                compute_timeout: Duration::from_millis(50),
                ..worker_config()
            },
        );
        h.store.create("c-1", Payload::text("x")).await.unwrap();

        let outcome = worker
            .handle_event(&TaskEvent::work("c-1", Payload::text("x")))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed(ref reason) if reason.contains("timed out")));
        assert_eq!(h.store.get("c-1").await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_worker() {
        let h = harness();
        let id = h.correlator.submit(Payload::text("x")).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = h
            .correlator
            .await_result(&id, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));

        // Timing out is read-only.
        assert_eq!(h.store.get(&id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_wait_on_unknown_id_is_not_found() {
        let h = harness();
        let err = h
            .correlator
            .await_result("missing", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            taskbridge::CorrelatorError::Store(TaskError::NotFound { .. })
        ));
    }

    /// Bus whose publishes always fail.
    struct DownBus;

    #[async_trait]
    impl MessageBus for DownBus {
        async fn publish(&self, topic: &str, _event: &TaskEvent) -> Result<String, BusError> {
            Err(BusError::TransientPublish {
                topic: topic.to_string(),
                message: "broker unreachable".to_string(),
            })
        }

        async fn receive(&self, _sub: &Subscription) -> Result<Vec<Delivery>, BusError> {
            Ok(Vec::new())
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<(), BusError> {
            Ok(())
        }

        async fn nack(&self, _delivery: &Delivery) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpublishable_submission_fails_task() {
        let store: Arc<dyn TaskStore> = Arc::new(GenericTaskStore::new(InMemoryBackend::new()));
        let correlator = Correlator::new(
            Arc::clone(&store),
            Arc::new(DownBus),
            CorrelatorConfig::default(),
        );

        let correlation_id = match correlator.submit(Payload::text("x")).await {
            Err(SubmitError::Publish { correlation_id, .. }) => correlation_id,
            other => panic!("expected publish error, got {other:?}"),
        };

        let record = store.get(&correlation_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.unwrap().contains("broker unreachable"));
    }
}

mod recovery {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reaper(h: &Harness, max_attempts: u32) -> Reaper {
        let bus: Arc<dyn MessageBus> = h.bus.clone();
        Reaper::new(
            Arc::clone(&h.store),
            bus,
            ReaperConfig {
                grace_period: Duration::ZERO,
                max_attempts,
                ..ReaperConfig::default()
            },
        )
    }

    /// Claims the task the way a worker would, then "crashes".
    async fn claim_and_crash(h: &Harness, id: &str) {
        h.store
            .transition(id, TaskStatus::Pending, TaskUpdate::Processing)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_crashed_claim_is_reclaimed_and_completed() {
        let h = harness();
        let id = h.correlator.submit(Payload::text("x")).await.unwrap();
        claim_and_crash(&h, &id).await;

        let report = reaper(&h, 5).sweep().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.abandoned, 0);

        let record = h.store.get(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(h.bus.published(WORK_TOPIC).len(), 2);

        let calls = Arc::new(AtomicUsize::new(0));
        let (shutdown, handle) = h.spawn_worker(counting_reading(calls.clone(), "recovered"));
        let outcome = h
            .correlator
            .await_result(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, AwaitOutcome::Completed(Payload::text("recovered")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeatedly_stale_task_is_abandoned() {
        let h = harness();
        let id = h.correlator.submit(Payload::text("x")).await.unwrap();
        let reaper = reaper(&h, 1);

        claim_and_crash(&h, &id).await;
        assert_eq!(reaper.sweep().await.unwrap().reclaimed, 1);

        claim_and_crash(&h, &id).await;
        let report = reaper.sweep().await.unwrap();
        assert_eq!(
            report,
            ReapReport {
                abandoned: 1,
                ..ReapReport::default()
            }
        );

        let outcome = h
            .correlator
            .await_result(&id, Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(outcome, AwaitOutcome::Failed(ref reason) if reason.contains("abandoned")));
    }

    #[tokio::test]
    async fn test_slow_healthy_compute_survives_sweeps() {
        let h = harness();
        h.store.create("c-1", Payload::text("x")).await.unwrap();

        // Grace above the compute timeout, as validated configs require.
        let bus: Arc<dyn MessageBus> = h.bus.clone();
        let reaper = Arc::new(Reaper::new(
            Arc::clone(&h.store),
            bus.clone(),
            ReaperConfig {
                grace_period: Duration::from_millis(500),
                ..ReaperConfig::default()
            },
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let slow: Arc<dyn Compute> = {
            let calls = Arc::clone(&calls);
            Arc::new(FnCompute::new(move |_payload: Payload| {
                calls.fetch_add(1, Ordering::SeqCst);
                let reaper = Arc::clone(&reaper);
                Box::pin(async move {
                    for _ in 0..2 {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        let report = reaper.sweep().await;
                        assert!(matches!(report, Ok(ReapReport { reclaimed: 0, .. })));
                    }
                    Ok(Payload::text("slow but fine"))
                })
            }))
        };
        let worker = WorkerLoop::new(
            Arc::clone(&h.store),
            bus,
            slow,
            WorkerConfig {
                compute_timeout: Duration::from_millis(400),
                ..worker_config()
            },
        );

        let outcome = worker
            .handle_event(&TaskEvent::work("c-1", Payload::text("x")))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let record = h.store.get("c-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.bus.published(WORK_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_late_result_from_reclaimed_claim_is_discarded() {
        let h = harness();
        h.store.create("c-1", Payload::text("x")).await.unwrap();

        // The claim goes stale mid-compute and the reaper hands it back.
        let reaper = Arc::new(reaper(&h, 5));
        let slow: Arc<dyn Compute> = Arc::new(FnCompute::new(move |_payload: Payload| {
            let reaper = Arc::clone(&reaper);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let report = reaper.sweep().await;
                assert!(matches!(report, Ok(ReapReport { reclaimed: 1, .. })));
                Ok(Payload::text("stale"))
            })
        }));
        let worker = h.worker(slow);

        let outcome = worker
            .handle_event(&TaskEvent::work("c-1", Payload::text("x")))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::StaleClaim));

        let record = h.store.get("c-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.result, None);
    }
}
