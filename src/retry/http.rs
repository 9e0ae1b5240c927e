//! HTTP endpoint: one POST per delivery attempt.

use super::{Endpoint, Response};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;

#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    name: String,
    url: String,
    content_type: String,
    client: Client,
}

impl HttpEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_client(name, url, Client::new())
    }

    /// Share a connection pool across endpoints.
    pub fn with_client(name: impl Into<String>, url: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            content_type: "application/json".to_string(),
            client,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, payload: &[u8]) -> Result<Response> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, &self.content_type)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| Error::Endpoint(format!("{} ({}): {e}", self.name, self.url)))?;
        let code = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Endpoint(format!("{}: reading response body: {e}", self.name)))?;
        Ok(Response::new(code, body))
    }
}
