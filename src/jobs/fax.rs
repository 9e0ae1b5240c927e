//! Fax transmission through an HTTP gateway.
//!
//! Each message is a JSON [`FaxRequest`]. The request is posted to the
//! gateway through a [`RetryableTask`]; the outcome is recorded and, when
//! `confirm_queue` is set, a [`Confirmation`] is published. Messages are
//! acked only after the outcome is recorded.

use super::queue_consumer;
use crate::broker::Channel;
use crate::config::Properties;
use crate::consumer::{AckMode, MessageHandler, QueueConsumer};
use crate::context::AppContext;
use crate::datastore::TransmissionRecord;
use crate::error::{Error, Result};
use crate::model::{JobMessage, Producer, TransmissionStatus};
use crate::retry::{Confirmation, Endpoint, HttpEndpoint, RetryPolicy, RetryableTask};
use crate::worker::{Job, JobContext, SettingsCell};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info};

/// Payload of one fax message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaxRequest {
    pub reference: String,
    pub destination: String,
    /// Document body, typically base64.
    pub document: String,
}

/// Gateway endpoints: primary plus the two failure dispositions.
#[derive(Clone)]
struct Endpoints {
    gateway: Arc<dyn Endpoint>,
    error: Option<Arc<dyn Endpoint>>,
    resend: Option<Arc<dyn Endpoint>>,
}

struct FaxSettings {
    consumer: QueueConsumer,
    endpoints: Endpoints,
    policy: RetryPolicy,
    confirm_queue: Option<String>,
}

pub struct FaxTransmissionJob {
    settings: SettingsCell<FaxSettings>,
    client: reqwest::Client,
    /// When set, used instead of the URLs from properties.
    fixed_endpoints: RwLock<Option<Endpoints>>,
}

impl Default for FaxTransmissionJob {
    fn default() -> Self {
        Self::new()
    }
}

impl FaxTransmissionJob {
    pub const IMPLEMENTATION: &'static str = "fax-transmission";

    pub fn new() -> Self {
        Self {
            settings: SettingsCell::new(),
            client: reqwest::Client::new(),
            fixed_endpoints: RwLock::new(None),
        }
    }

    /// Use the given endpoints instead of building HTTP endpoints from the
    /// `gateway_url`, `error_url` and `resend_url` properties.
    pub fn with_endpoints(
        self,
        gateway: Arc<dyn Endpoint>,
        error: Option<Arc<dyn Endpoint>>,
        resend: Option<Arc<dyn Endpoint>>,
    ) -> Self {
        *self
            .fixed_endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Endpoints {
            gateway,
            error,
            resend,
        });
        self
    }

    fn endpoints_from(&self, props: &Properties) -> Result<Endpoints> {
        if let Some(fixed) = self
            .fixed_endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(fixed);
        }
        let http = |name: &str, url: &str| -> Arc<dyn Endpoint> {
            Arc::new(HttpEndpoint::with_client(name, url, self.client.clone()))
        };
        let gateway = http("fax-gateway", props.require("gateway_url")?);
        let error = props.get("error_url").map(|url| http("fax-error", url));
        let resend = props.get("resend_url").map(|url| http("fax-resend", url));
        Ok(Endpoints {
            gateway,
            error,
            resend,
        })
    }

    /// Transmit one request and record the outcome. Undecodable payloads are
    /// escalated and retired, since redelivery cannot fix them.
    async fn transmit(
        &self,
        cx: &JobContext,
        settings: &FaxSettings,
        payload: &[u8],
        channel: &dyn Channel,
    ) -> Result<Option<TransmissionStatus>> {
        let app: &AppContext = cx.app();
        let request: FaxRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                error!(worker = %cx.worker_name(), error = %e, "undecodable fax request");
                app.alert(
                    &format!("[{}] undecodable request", Producer::FaxTransmission),
                    &format!(
                        "Worker {} could not decode a fax request: {e}\n\nPayload:\n{}",
                        cx.worker_name(),
                        String::from_utf8_lossy(payload)
                    ),
                )
                .await;
                return Ok(None);
            }
        };

        cx.set_action(format!("transmitting {}", request.reference));
        let task = RetryableTask::new(
            settings.endpoints.gateway.clone(),
            app.notifier.clone(),
            app.alert_recipients.clone(),
        )
        .policy(settings.policy)
        .error_endpoint(settings.endpoints.error.clone())
        .resend_endpoint(settings.endpoints.resend.clone())
        .producer(Producer::FaxTransmission);

        let body = serde_json::to_vec(&request)?;
        let delivery = task.execute(&body).await;

        app.datastore
            .record_transmission(&TransmissionRecord {
                reference: request.reference.clone(),
                worker: cx.worker_name().to_string(),
                destination: request.destination.clone(),
                status: delivery.status,
                attempts: delivery.attempts,
                response_code: delivery.response.code,
                recorded_at: Utc::now(),
            })
            .await?;

        if let Some(queue) = &settings.confirm_queue {
            let confirmation =
                Confirmation::build(Producer::FaxTransmission, &request.reference, &delivery);
            channel
                .publish("", queue, &serde_json::to_vec(&confirmation)?)
                .await?;
        }
        info!(
            worker = %cx.worker_name(),
            reference = %request.reference,
            status = %delivery.status,
            attempts = delivery.attempts,
            "fax transmission settled"
        );
        Ok(Some(delivery.status))
    }
}

#[async_trait]
impl Job for FaxTransmissionJob {
    fn producer(&self) -> Producer {
        Producer::FaxTransmission
    }

    async fn configure(&self, properties: &Properties) -> Result<()> {
        let consumer = queue_consumer(properties, AckMode::AfterProcessing)?;
        let endpoints = self.endpoints_from(properties)?;
        let policy = RetryPolicy::from_properties(properties)?;
        let confirm_queue = properties.get("confirm_queue").map(str::to_string);
        self.settings.store(FaxSettings {
            consumer,
            endpoints,
            policy,
            confirm_queue,
        });
        Ok(())
    }

    async fn do_processing(&self, cx: &JobContext) -> Result<()> {
        let settings = self.settings.load()?;
        let handler = FaxHandler {
            job: self,
            settings: &settings,
            cx,
        };
        settings.consumer.run(cx, &handler).await?;
        Ok(())
    }

    /// Transmit one injected request. Returns 1 when it was delivered.
    async fn process_data(&self, cx: &JobContext, data: &[u8]) -> Result<i64> {
        let settings = self.settings.load()?;
        let channel = cx.app().broker.connect().await?;
        let result = self.transmit(cx, &settings, data, channel.as_ref()).await;
        channel.close().await?;
        match result? {
            Some(TransmissionStatus::Delivered) => Ok(1),
            Some(_) => Ok(0),
            None => Err(Error::Decode("fax request could not be decoded".to_string())),
        }
    }
}

struct FaxHandler<'a> {
    job: &'a FaxTransmissionJob,
    settings: &'a FaxSettings,
    cx: &'a JobContext,
}

#[async_trait]
impl MessageHandler for FaxHandler<'_> {
    async fn handle(&self, message: &JobMessage, channel: &dyn Channel) -> Result<()> {
        self.job
            .transmit(self.cx, self.settings, &message.payload, channel)
            .await
            .map(|_| ())
    }
}
