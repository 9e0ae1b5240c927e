//! Control facade and console transport.

use async_trait::async_trait;
use jobhost::config::{Properties, WorkerDefinition};
use jobhost::context::MemoryContext;
use jobhost::engine::{ControlFacade, JobRef, Supervisor, SupervisorConfig, run_console};
use jobhost::error::{Error, Result};
use jobhost::worker::{Job, JobContext, JobFactory};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Counts non-empty lines of injected data.
#[derive(Default)]
struct LineCounter {
    seen: AtomicI64,
}

#[async_trait]
impl Job for LineCounter {
    async fn configure(&self, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    async fn do_processing(&self, cx: &JobContext) -> Result<()> {
        cx.stopped().await;
        Ok(())
    }

    async fn process_data(&self, _cx: &JobContext, data: &[u8]) -> Result<i64> {
        let text = std::str::from_utf8(data).map_err(|e| Error::Decode(e.to_string()))?;
        if text.contains("explode") {
            panic!("bad input");
        }
        let n = text.lines().filter(|l| !l.trim().is_empty()).count() as i64;
        self.seen.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}

async fn facade(cx: &MemoryContext) -> (tempfile::TempDir, ControlFacade) {
    let dir = tempfile::tempdir().unwrap();
    let mut factory = JobFactory::empty();
    factory.register("lines", || Arc::new(LineCounter::default()));
    let sup = Supervisor::new(
        cx.app.clone(),
        factory,
        SupervisorConfig {
            config_dir: dir.path().to_path_buf(),
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        },
    );
    sup.load_workers(&[
        WorkerDefinition::new("ingest", "lines"),
        WorkerDefinition::new("report", "lines"),
    ])
    .await;
    (dir, ControlFacade::new(sup))
}

#[tokio::test]
async fn app_ids_resolve_by_name() {
    let cx = MemoryContext::new();
    let (_dir, facade) = facade(&cx).await;

    let ingest = facade.get_app_id("ingest").await;
    let report = facade.get_app_id("report").await;
    assert!(ingest > 0);
    assert!(report > 0);
    assert_ne!(ingest, report);
    assert_eq!(facade.get_app_id("nobody").await, 0);
}

#[tokio::test]
async fn start_and_stop_jobs() {
    let cx = MemoryContext::new();
    let (_dir, facade) = facade(&cx).await;
    let ingest = facade.get_app_id("ingest").await;
    let by_name = JobRef::Name("ingest".to_string());

    assert!(facade.start_job(0, &by_name).await);
    assert!(!facade.start_job(0, &by_name).await, "already running");
    assert!(facade.stop_job(ingest, &JobRef::Id(jobhost::model::WorkerId(ingest))).await);
    assert!(!facade.stop_job(0, &by_name).await, "already stopped");

    assert!(!facade.start_job(0, &JobRef::Name("nobody".to_string())).await);
}

#[tokio::test]
async fn mismatched_app_id_is_refused() {
    let cx = MemoryContext::new();
    let (_dir, facade) = facade(&cx).await;
    let report = facade.get_app_id("report").await;

    let ingest = JobRef::Name("ingest".to_string());
    assert!(!facade.start_job(report, &ingest).await);
    assert!(!facade.stop_job(report, &ingest).await);
    assert!(facade.view_status_info().await.contains("ingest (lines) status=init"));
}

#[tokio::test]
async fn process_data_decodes_and_dispatches() {
    let cx = MemoryContext::new();
    let (_dir, facade) = facade(&cx).await;
    let ingest = facade.get_app_id("ingest").await;

    // "a\nb\n"
    assert_eq!(facade.process_data(ingest, "b64:YQpiCg==").await, 2);
    assert_eq!(facade.process_data(ingest, "url:one%0Atwo%0Athree").await, 3);
    // Unprefixed input is never guessed to be base64.
    assert_eq!(facade.process_data(ingest, "YQpiCg==").await, 1);
    assert_eq!(facade.process_data(ingest, "abcd%0Atest").await, 2);
}

#[tokio::test]
async fn process_data_failures_return_zero() {
    let cx = MemoryContext::new();
    let (_dir, facade) = facade(&cx).await;
    let ingest = facade.get_app_id("ingest").await;

    assert_eq!(facade.process_data(0, "b64:YQpiCg==").await, 0);
    assert_eq!(facade.process_data(9_999, "b64:YQpiCg==").await, 0);
    assert_eq!(facade.process_data(ingest, "b64:!!!").await, 0);
    assert_eq!(facade.process_data(ingest, "url:explode").await, 0);
    // The worker survives a panicking injection.
    assert_eq!(facade.process_data(ingest, "url:still-here").await, 1);
}

#[tokio::test]
async fn console_serves_until_quit() {
    let cx = MemoryContext::new();
    let (_dir, facade) = facade(&cx).await;
    let ingest = facade.get_app_id("ingest").await;

    let script = format!("id ingest\n\nprocess {ingest} url:x%0Ay\nreboot\nquit\nid report\n");
    let mut out = Vec::new();
    run_console(&facade, script.as_bytes(), &mut out).await.unwrap();

    let out = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], ingest.to_string());
    assert_eq!(lines[1], "2");
    assert_eq!(lines[2], "error: unknown command 'reboot'");
    assert!(lines[3].starts_with("commands:"));
    assert_eq!(lines[4], "bye");
    assert_eq!(lines.len(), 5, "nothing runs after quit: {out}");
}
