//! End-to-end runs of the bundled jobs over the in-memory broker.

use async_trait::async_trait;
use jobhost::config::WorkerDefinition;
use jobhost::context::MemoryContext;
use jobhost::engine::{ControlFacade, Supervisor, SupervisorConfig};
use jobhost::error::Result;
use jobhost::jobs::{FaxRequest, FaxTransmissionJob};
use jobhost::model::TransmissionStatus;
use jobhost::retry::{Confirmation, Endpoint, Response};
use jobhost::worker::JobFactory;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Gateway stub answering with a fixed code.
struct Gateway {
    code: u16,
    calls: AtomicU32,
    received: Mutex<Vec<Vec<u8>>>,
}

impl Gateway {
    fn answering(code: u16) -> Arc<Self> {
        Arc::new(Self {
            code,
            calls: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for Gateway {
    fn name(&self) -> &str {
        "stub-gateway"
    }

    async fn deliver(&self, payload: &[u8]) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(payload.to_vec());
        Ok(Response::new(self.code, "stub"))
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn supervisor(cx: &MemoryContext, dir: &tempfile::TempDir, factory: JobFactory) -> Arc<Supervisor> {
    Supervisor::new(
        cx.app.clone(),
        factory,
        SupervisorConfig {
            config_dir: dir.path().to_path_buf(),
            shutdown_grace: Duration::from_secs(2),
            ..Default::default()
        },
    )
}

/// Built-in jobs, with the fax job talking to the given stubs.
fn factory_with_gateway(gateway: Arc<Gateway>, resend: Option<Arc<Gateway>>) -> JobFactory {
    let mut factory = JobFactory::with_builtin();
    factory.register(FaxTransmissionJob::IMPLEMENTATION, move || {
        let resend = resend.clone().map(|r| r as Arc<dyn Endpoint>);
        Arc::new(FaxTransmissionJob::new().with_endpoints(gateway.clone(), None, resend))
    });
    factory
}

fn fax_definition() -> WorkerDefinition {
    WorkerDefinition::new("fax-out", FaxTransmissionJob::IMPLEMENTATION)
        .auto_start(true)
        .property("queue", "fax.out")
        .property("confirm_queue", "fax.confirm")
        .property("max_tries", "2")
        .property("retry_backoff_ms", "0")
        .property("attempt_timeout_ms", "200")
}

fn fax_request(reference: &str) -> Vec<u8> {
    serde_json::to_vec(&FaxRequest {
        reference: reference.to_string(),
        destination: "+15550100".to_string(),
        document: "JVBERi0x".to_string(),
    })
    .unwrap()
}

#[tokio::test]
async fn catalog_feed_flows_into_one_report() {
    let dir = tempfile::tempdir().unwrap();
    let cx = MemoryContext::new();
    let sup = supervisor(&cx, &dir, JobFactory::with_builtin());
    let report = sup
        .load_workers(&[
            WorkerDefinition::new("catalog", "catalog-ingest")
                .auto_start(true)
                .property("queue", "catalog.raw")
                .property("feed", "acme")
                .property("report_queue", "reports"),
            WorkerDefinition::new("report", "report-dispatch")
                .auto_start(true)
                .property("queue", "reports")
                .property("recipients", "buyers@example.com")
                .property("sleep_interval_ms", "10"),
        ])
        .await;
    assert_eq!(report.started.len(), 2);

    cx.broker.push(
        "catalog.raw",
        "{\"sku\":\"A-1\",\"price\":3}\n{\"sku\":\"B-2\",\"price\":5}\n",
    );

    let datastore = cx.datastore.clone();
    eventually("report dispatch", move || datastore.reports().len() == 1).await;

    assert_eq!(cx.datastore.items("acme").len(), 2);
    let reports = cx.datastore.reports();
    assert_eq!(reports[0].items, 2);
    assert_eq!(reports[0].worker, "report");
    assert_eq!(reports[0].recipients, vec!["buyers@example.com"]);

    let mails = cx.notifier.matching("Batch report");
    assert_eq!(mails.len(), 1);
    assert!(mails[0].body.contains("acme:A-1"));
    assert!(mails[0].body.contains("acme:B-2"));
    assert_eq!(cx.broker.depth("reports"), 0);
    assert_eq!(cx.broker.depth("catalog.raw"), 0);

    sup.shutdown().await;
    assert_eq!(cx.broker.unacked(), 0);
}

#[tokio::test]
async fn bad_feed_payload_is_acked_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let cx = MemoryContext::new();
    let sup = supervisor(&cx, &dir, JobFactory::with_builtin());
    sup.load_workers(&[WorkerDefinition::new("catalog", "catalog-ingest")
        .auto_start(true)
        .property("queue", "catalog.raw")])
        .await;

    cx.broker.push("catalog.raw", "not json");
    let notifier = cx.notifier.clone();
    eventually("drop alert", move || {
        !notifier.matching("catalog dropped a message").is_empty()
    })
    .await;

    assert_eq!(cx.broker.acks().len(), 1);
    assert!(cx.broker.nacks().is_empty());
    assert!(cx.datastore.items("catalog.raw").is_empty());
    let alert = &cx.notifier.matching("catalog dropped a message")[0];
    assert!(alert.body.contains("not json"));

    sup.shutdown().await;
}

#[tokio::test]
async fn fax_is_transmitted_recorded_and_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let cx = MemoryContext::new();
    let gateway = Gateway::answering(200);
    let sup = supervisor(&cx, &dir, factory_with_gateway(gateway.clone(), None));
    sup.load_workers(&[fax_definition()]).await;

    cx.broker.push("fax.out", fax_request("F-1"));
    let broker = cx.broker.clone();
    eventually("fax ack", move || broker.acks().len() == 1).await;

    let record = cx.datastore.transmission("F-1").unwrap();
    assert_eq!(record.status, TransmissionStatus::Delivered);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.response_code, 200);
    assert_eq!(record.worker, "fax-out");
    assert_eq!(gateway.calls(), 1);

    let confirmations = cx.broker.peek("fax.confirm");
    assert_eq!(confirmations.len(), 1);
    let confirmation: Confirmation = serde_json::from_str(&confirmations[0]).unwrap();
    assert_eq!(confirmation.reference, "F-1");
    assert_eq!(confirmation.status, TransmissionStatus::Delivered);
    assert!(cx.notifier.sent().is_empty());

    sup.shutdown().await;
}

#[tokio::test]
async fn failing_gateway_defers_to_resend_and_escalates_once() {
    let dir = tempfile::tempdir().unwrap();
    let cx = MemoryContext::new();
    let gateway = Gateway::answering(503);
    let resend = Gateway::answering(202);
    let sup = supervisor(
        &cx,
        &dir,
        factory_with_gateway(gateway.clone(), Some(resend.clone())),
    );
    sup.load_workers(&[fax_definition()]).await;

    cx.broker.push("fax.out", fax_request("F-2"));
    let broker = cx.broker.clone();
    eventually("fax ack", move || broker.acks().len() == 1).await;

    assert_eq!(gateway.calls(), 2);
    assert_eq!(resend.calls(), 1);
    let record = cx.datastore.transmission("F-2").unwrap();
    assert_eq!(record.status, TransmissionStatus::Deferred);
    assert_eq!(record.attempts, 2);
    assert_eq!(cx.notifier.sent().len(), 1);
    assert!(cx.broker.nacks().is_empty(), "escalated payloads are not requeued");

    sup.shutdown().await;
}

#[tokio::test]
async fn fax_is_redelivered_while_the_datastore_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let cx = MemoryContext::new();
    let gateway = Gateway::answering(200);
    let sup = supervisor(&cx, &dir, factory_with_gateway(gateway.clone(), None));
    cx.datastore.set_unavailable(true);
    sup.load_workers(&[fax_definition()]).await;

    cx.broker.push("fax.out", fax_request("F-3"));
    let broker = cx.broker.clone();
    eventually("a requeue", move || !broker.nacks().is_empty()).await;
    assert!(cx.broker.nacks().iter().all(|(_, requeue)| *requeue));
    assert!(cx.broker.acks().is_empty());

    cx.datastore.set_unavailable(false);
    let broker = cx.broker.clone();
    eventually("the ack", move || broker.acks().len() == 1).await;
    assert_eq!(
        cx.datastore.transmission("F-3").unwrap().status,
        TransmissionStatus::Delivered
    );

    sup.shutdown().await;
    assert_eq!(cx.broker.depth("fax.out"), 0);
}

#[tokio::test]
async fn undecodable_fax_is_retired_with_an_alert() {
    let dir = tempfile::tempdir().unwrap();
    let cx = MemoryContext::new();
    let gateway = Gateway::answering(200);
    let sup = supervisor(&cx, &dir, factory_with_gateway(gateway.clone(), None));
    sup.load_workers(&[fax_definition()]).await;

    cx.broker.push("fax.out", "{\"reference\":");
    let broker = cx.broker.clone();
    eventually("fax ack", move || broker.acks().len() == 1).await;

    assert_eq!(gateway.calls(), 0);
    assert_eq!(cx.notifier.matching("undecodable request").len(), 1);
    assert!(cx.datastore.transmissions().is_empty());

    sup.shutdown().await;
}

#[tokio::test]
async fn injected_data_reaches_the_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let cx = MemoryContext::new();
    let sup = supervisor(&cx, &dir, JobFactory::with_builtin());
    sup.load_workers(&[
        WorkerDefinition::new("catalog", "catalog-ingest")
            .property("queue", "catalog.raw")
            .property("feed", "manual"),
        WorkerDefinition::new("report", "report-dispatch").property("queue", "reports"),
    ])
    .await;
    let facade = ControlFacade::new(Arc::clone(&sup));

    let catalog = facade.get_app_id("catalog").await;
    // {"sku":"Z-9"}
    assert_eq!(facade.process_data(catalog, "b64:eyJza3UiOiJaLTkifQ==").await, 1);
    assert_eq!(cx.datastore.items("manual").len(), 1);

    let report = facade.get_app_id("report").await;
    assert_eq!(
        facade
            .process_data(report, "url:manual:Z-9%0Amanual:Y-8%0Aend-of-batch")
            .await,
        2
    );
    let reports = cx.datastore.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].items, 2);
    // No recipients configured: the report goes to the alert list.
    assert_eq!(reports[0].recipients, vec!["ops@example.com"]);
}
