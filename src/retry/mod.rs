//! Bounded-retry delivery to unreliable endpoints.
//!
//! [`RetryableTask::execute`] tries the primary endpoint up to `max_tries`
//! times. When every attempt fails the payload is never dropped silently: it
//! is routed to the error endpoint (client errors) or the resend endpoint
//! (anything else), and operators get exactly one notification carrying the
//! full payload.

pub mod backoff;
pub mod confirm;
pub mod http;

use crate::config::Properties;
use crate::error::Result;
use crate::model::{Producer, TransmissionStatus};
use crate::notify::{Notifier, notify_soft};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use backoff::BackoffPolicy;
pub use confirm::{Confirmation, StatusProvider};
pub use http::HttpEndpoint;

/// What an endpoint answered. Code `0` means no response at all
/// (transport failure or timeout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub body: String,
}

impl Response {
    pub fn new(code: u16, body: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    pub fn no_response(reason: impl Into<String>) -> Self {
        Self::new(0, reason)
    }

    pub fn class(&self) -> ResponseClass {
        match self.code {
            0 => ResponseClass::NoResponse,
            200..=299 => ResponseClass::Success,
            400..=499 => ResponseClass::ClientError,
            500..=599 => ResponseClass::ServerError,
            _ => ResponseClass::Other,
        }
    }

    pub fn is_success(&self) -> bool {
        self.class() == ResponseClass::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// The endpoint rejected the payload itself; resending will not help.
    ClientError,
    ServerError,
    NoResponse,
    Other,
}

impl ResponseClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseClass::Success => "success",
            ResponseClass::ClientError => "client_error",
            ResponseClass::ServerError => "server_error",
            ResponseClass::NoResponse => "no_response",
            ResponseClass::Other => "other",
        }
    }
}

/// An external destination for payloads.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Short name for logs and alerts.
    fn name(&self) -> &str;

    /// One delivery attempt. `Err` is a transport failure.
    async fn deliver(&self, payload: &[u8]) -> Result<Response>;
}

/// Progress of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    pub try_count: u32,
    pub max_tries: u32,
    pub last_response_code: u16,
}

impl AttemptState {
    pub fn new(max_tries: u32) -> Self {
        Self {
            try_count: 0,
            max_tries: max_tries.max(1),
            last_response_code: 0,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.try_count >= self.max_tries
    }

    /// Terminal on the first success or once attempts run out.
    pub fn is_terminal(&self) -> bool {
        (200..=299).contains(&self.last_response_code) || self.exhausted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub backoff: BackoffPolicy,
    /// Upper bound on one attempt. A hung endpoint counts as a failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 3,
            backoff: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Reads `max_tries`, `attempt_timeout_ms` and the backoff keys.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_tries: props.parse_or("max_tries", defaults.max_tries)?.max(1),
            backoff: BackoffPolicy::from_properties(props)?,
            attempt_timeout: props.millis_or("attempt_timeout_ms", defaults.attempt_timeout)?,
        })
    }
}

/// Result of [`RetryableTask::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The last response from the primary endpoint.
    pub response: Response,
    pub attempts: u32,
    pub status: TransmissionStatus,
}

impl StatusProvider for Delivery {
    fn transmission_status(&self) -> TransmissionStatus {
        self.status
    }
}

pub struct RetryableTask {
    endpoint: Arc<dyn Endpoint>,
    error_endpoint: Option<Arc<dyn Endpoint>>,
    resend_endpoint: Option<Arc<dyn Endpoint>>,
    policy: RetryPolicy,
    notifier: Arc<dyn Notifier>,
    recipients: Arc<Vec<String>>,
    producer: Producer,
}

impl RetryableTask {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        notifier: Arc<dyn Notifier>,
        recipients: Arc<Vec<String>>,
    ) -> Self {
        Self {
            endpoint,
            error_endpoint: None,
            resend_endpoint: None,
            policy: RetryPolicy::default(),
            notifier,
            recipients,
            producer: Producer::Custom,
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Where client-error payloads go once retries run out.
    pub fn error_endpoint(mut self, endpoint: Option<Arc<dyn Endpoint>>) -> Self {
        self.error_endpoint = endpoint;
        self
    }

    /// Where other failed payloads go for a later resend.
    pub fn resend_endpoint(mut self, endpoint: Option<Arc<dyn Endpoint>>) -> Self {
        self.resend_endpoint = endpoint;
        self
    }

    pub fn producer(mut self, producer: Producer) -> Self {
        self.producer = producer;
        self
    }

    /// Deliver `payload`, retrying with backoff. Never fails: exhaustion is
    /// reported through the returned status and the escalation.
    pub async fn execute(&self, payload: &[u8]) -> Delivery {
        let mut state = AttemptState::new(self.policy.max_tries);
        let response = loop {
            state.try_count += 1;
            let response = self.attempt(self.endpoint.as_ref(), payload).await;
            state.last_response_code = response.code;
            metrics::endpoint_attempts().add(
                1,
                &[
                    KeyValue::new("endpoint", self.endpoint.name().to_string()),
                    KeyValue::new("class", response.class().as_str()),
                ],
            );

            if state.is_terminal() {
                break response;
            }
            let delay = self.policy.backoff.next(state.try_count - 1);
            warn!(
                endpoint = self.endpoint.name(),
                attempt = state.try_count,
                max_tries = state.max_tries,
                code = response.code,
                ?delay,
                "delivery attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        };

        if response.is_success() {
            info!(endpoint = self.endpoint.name(), attempts = state.try_count, "payload delivered");
            return Delivery {
                response,
                attempts: state.try_count,
                status: TransmissionStatus::Delivered,
            };
        }
        self.escalate(payload, state, response).await
    }

    async fn attempt(&self, endpoint: &dyn Endpoint, payload: &[u8]) -> Response {
        match tokio::time::timeout(self.policy.attempt_timeout, endpoint.deliver(payload)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => Response::no_response(e.to_string()),
            Err(_) => Response::no_response(format!(
                "no answer within {:?}",
                self.policy.attempt_timeout
            )),
        }
    }

    async fn escalate(&self, payload: &[u8], state: AttemptState, response: Response) -> Delivery {
        let (status, disposition) = match response.class() {
            ResponseClass::ClientError => (TransmissionStatus::Rejected, &self.error_endpoint),
            _ => (TransmissionStatus::Deferred, &self.resend_endpoint),
        };

        let routed = match disposition {
            Some(endpoint) => {
                let answer = self.attempt(endpoint.as_ref(), payload).await;
                if answer.is_success() {
                    format!("routed to {}", endpoint.name())
                } else {
                    warn!(
                        endpoint = endpoint.name(),
                        code = answer.code,
                        "disposition endpoint failed"
                    );
                    format!(
                        "routing to {} failed ({}: {})",
                        endpoint.name(),
                        answer.code,
                        answer.body
                    )
                }
            }
            None => "no disposition endpoint configured".to_string(),
        };

        metrics::escalations().add(
            1,
            &[
                KeyValue::new("endpoint", self.endpoint.name().to_string()),
                KeyValue::new("disposition", status.to_string()),
            ],
        );
        warn!(
            endpoint = self.endpoint.name(),
            attempts = state.try_count,
            code = response.code,
            %status,
            "retries exhausted, escalating"
        );

        let subject = format!(
            "[{}] delivery to {} {status} after {} attempts",
            self.producer,
            self.endpoint.name(),
            state.try_count
        );
        let body = format!(
            "Last response: {} {}\nDisposition: {routed}\n\n\
             The full payload follows for manual resubmission.\n\n{}",
            response.code,
            response.body,
            String::from_utf8_lossy(payload)
        );
        notify_soft(self.notifier.as_ref(), &self.recipients, &subject, &body).await;

        Delivery {
            response,
            attempts: state.try_count,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_classes() {
        assert_eq!(Response::new(204, "").class(), ResponseClass::Success);
        assert_eq!(Response::new(422, "").class(), ResponseClass::ClientError);
        assert_eq!(Response::new(503, "").class(), ResponseClass::ServerError);
        assert_eq!(Response::no_response("x").class(), ResponseClass::NoResponse);
    }

    #[test]
    fn attempt_state_is_bounded() {
        let mut state = AttemptState::new(0);
        assert_eq!(state.max_tries, 1);
        assert!(!state.is_terminal());
        state.try_count = 1;
        assert!(state.is_terminal());
    }

    #[test]
    fn policy_from_properties() {
        let props: Properties = [("max_tries", "5"), ("attempt_timeout_ms", "200")]
            .into_iter()
            .collect();
        let policy = RetryPolicy::from_properties(&props).unwrap();
        assert_eq!(policy.max_tries, 5);
        assert_eq!(policy.attempt_timeout, Duration::from_millis(200));
    }
}
