//! Worker lifecycle: start/stop, error backoff, isolation, panics, reloads.

use async_trait::async_trait;
use jobhost::config::{ConfigStore, Properties};
use jobhost::context::MemoryContext;
use jobhost::error::{Error, Result};
use jobhost::model::{WorkerId, WorkerStatus};
use jobhost::worker::{Job, JobContext, Worker};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// What a test job does each cycle.
#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
    /// Block until the worker is stopped.
    Park,
}

struct TestJob {
    behaviour: Behaviour,
    runs: AtomicU64,
}

impl TestJob {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            runs: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Job for TestJob {
    async fn configure(&self, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn do_processing(&self, cx: &JobContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err(Error::Endpoint("gateway unreachable".to_string())),
            Behaviour::Panic => panic!("corrupt state"),
            Behaviour::Park => {
                cx.stopped().await;
                Ok(())
            }
        }
    }
}

fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs.iter().copied().collect()
}

async fn worker(
    cx: &MemoryContext,
    id: u64,
    name: &str,
    job: Arc<TestJob>,
    properties: Properties,
) -> Arc<Worker> {
    let (worker, err) =
        Worker::create(WorkerId(id), name, "test", job, cx.app.clone(), properties).await;
    assert!(err.is_none(), "unexpected property error: {err:?}");
    worker
}

#[tokio::test]
async fn new_worker_starts_in_init() {
    let cx = MemoryContext::new();
    let w = worker(&cx, 1, "a", TestJob::new(Behaviour::Succeed), Properties::new()).await;
    assert_eq!(w.current_status(), WorkerStatus::Init);
    assert_eq!(w.status().running_ms, 0);
}

#[tokio::test]
async fn stop_twice_is_harmless() {
    let cx = MemoryContext::new();
    let w = worker(&cx, 1, "a", TestJob::new(Behaviour::Succeed), Properties::new()).await;

    assert!(w.stop());
    assert_eq!(w.current_status(), WorkerStatus::Stopped);
    assert!(!w.stop());
    assert_eq!(w.current_status(), WorkerStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn async_worker_cycles_until_stopped() {
    let cx = MemoryContext::new();
    let job = TestJob::new(Behaviour::Succeed);
    let w = worker(&cx, 1, "a", job.clone(), props(&[("sleep_interval_ms", "10")])).await;

    assert!(w.start().await.unwrap());
    tokio::time::sleep(Duration::from_millis(35)).await;
    assert!(w.cycles() >= 3, "only {} cycles", w.cycles());

    assert!(w.stop());
    assert!(w.join(Duration::from_secs(1)).await);
    assert_eq!(w.current_status(), WorkerStatus::Stopped);

    let after = job.runs.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.runs.load(Ordering::SeqCst), after, "no cycles after stop");
}

#[tokio::test]
async fn starting_a_running_worker_is_a_no_op() {
    let cx = MemoryContext::new();
    let job = TestJob::new(Behaviour::Park);
    let w = worker(&cx, 1, "a", job.clone(), Properties::new()).await;

    assert!(w.start().await.unwrap());
    assert!(!w.start().await.unwrap());

    w.stop();
    assert!(w.join(Duration::from_secs(1)).await);
    assert_eq!(job.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stopped_worker_can_be_restarted() {
    let cx = MemoryContext::new();
    let w = worker(&cx, 1, "a", TestJob::new(Behaviour::Park), Properties::new()).await;

    w.start().await.unwrap();
    w.stop();
    assert!(w.start().await.unwrap());
    assert!(w.current_status().is_active());

    w.stop();
    assert!(w.join(Duration::from_secs(1)).await);
}

#[tokio::test(start_paused = true)]
async fn failing_cycle_backs_off_three_times_longer() {
    let cx = MemoryContext::new();
    let job = TestJob::new(Behaviour::Fail);
    let w = worker(&cx, 1, "flaky", job, props(&[("sleep_interval_ms", "20")])).await;

    w.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(w.errors(), 1, "still inside the 60ms backoff");
    assert_eq!(w.current_status(), WorkerStatus::Idle);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(w.errors(), 2);

    w.stop();
    w.join(Duration::from_secs(1)).await;
    assert_eq!(cx.notifier.matching("flaky failed").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn huge_error_backoff_keeps_the_loop_alive() {
    let cx = MemoryContext::new();
    let w = worker(
        &cx,
        1,
        "slow",
        TestJob::new(Behaviour::Fail),
        props(&[
            ("sleep_interval_ms", "10000000000000"),
            ("error_backoff_factor", "4000000000"),
        ]),
    )
    .await;

    w.start().await.unwrap();
    while w.errors() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The loop is parked in its backoff, so a second start is a no-op.
    assert_eq!(w.current_status(), WorkerStatus::Idle);
    assert!(!w.start().await.unwrap());
    assert_eq!(cx.notifier.matching("slow failed").len(), 1);

    assert!(w.stop());
    assert!(w.join(Duration::from_secs(1)).await);
    assert_eq!(w.current_status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn failing_worker_does_not_disturb_its_sibling() {
    let cx = MemoryContext::new();
    let inline = props(&[("execution_mode", "inline")]);
    let a = worker(&cx, 1, "a", TestJob::new(Behaviour::Fail), inline.clone()).await;
    let b = worker(&cx, 2, "b", TestJob::new(Behaviour::Succeed), inline).await;

    for _ in 0..5 {
        a.start().await.unwrap();
        b.start().await.unwrap();
    }

    assert_eq!(b.cycles(), 5);
    assert_eq!(b.errors(), 0);
    assert_eq!(a.errors(), 5);
    assert_eq!(a.cycles(), 0);
    assert_eq!(a.current_status(), WorkerStatus::Idle);
    assert_eq!(b.current_status(), WorkerStatus::Idle);
    assert_eq!(cx.notifier.matching("a failed").len(), 5);
}

#[tokio::test]
async fn panicking_cycle_aborts_the_worker() {
    let cx = MemoryContext::new();
    let w = worker(
        &cx,
        1,
        "p",
        TestJob::new(Behaviour::Panic),
        props(&[("execution_mode", "inline")]),
    )
    .await;

    w.start().await.unwrap();
    assert_eq!(w.current_status(), WorkerStatus::Aborted);
    assert_eq!(w.errors(), 1);
    assert_eq!(cx.notifier.matching("p aborted").len(), 1);

    // An aborted worker can be restarted.
    w.start().await.unwrap();
    assert_eq!(w.errors(), 2);
}

#[tokio::test]
async fn invalid_properties_make_the_worker_fatal() {
    let cx = MemoryContext::new();
    let (w, err) = Worker::create(
        WorkerId(1),
        "bad",
        "test",
        TestJob::new(Behaviour::Succeed),
        cx.app.clone(),
        props(&[("max_concurrency", "0")]),
    )
    .await;

    assert!(matches!(err, Some(Error::Config(_))));
    assert_eq!(w.current_status(), WorkerStatus::Fatal);
    assert!(matches!(
        w.start().await,
        Err(Error::InvalidTransition { .. })
    ));

    w.set_properties(props(&[("max_concurrency", "2")])).await.unwrap();
    assert_eq!(w.current_status(), WorkerStatus::Init);
    assert_eq!(w.settings().max_concurrency, 2);
}

#[tokio::test]
async fn own_config_file_reloads_properties() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path());
    let cx = MemoryContext::new();
    let w = worker(
        &cx,
        1,
        "feed",
        TestJob::new(Behaviour::Succeed),
        props(&[("config_file", "feed.toml"), ("sleep_interval_ms", "100")]),
    )
    .await;
    assert!(w.watch_config(&store));

    std::fs::write(dir.path().join("feed.toml"), "sleep_interval_ms = 2500\n").unwrap();
    let changed = store.poll_changes().await;

    assert_eq!(changed.len(), 1);
    assert!(changed[0].notified);
    assert_eq!(w.settings().sleep_interval, Duration::from_millis(2500));
    assert_eq!(w.properties().get("config_file"), Some("feed.toml"));
}

#[tokio::test]
async fn jobs_without_injection_support_reject_data() {
    let cx = MemoryContext::new();
    let w = worker(&cx, 1, "a", TestJob::new(Behaviour::Succeed), Properties::new()).await;
    assert!(w.process_data(b"payload").await.is_err());
}
