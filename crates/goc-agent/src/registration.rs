// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registration of the agent's address with the goc center.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::error::Error as _;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::http_utils::build_client;
use crate::listener::real_host;

pub const REGISTER_ENDPOINT_PATH: &str = "/v1/cover/register";
pub const REMOVE_ENDPOINT_PATH: &str = "/v1/cover/remove";

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection reset, EOF, refused connection, timeout or any other
    /// network-layer failure. Worth one more attempt.
    #[error("network error: {0}")]
    Network(String),

    #[error("request error: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Sends a single POST to the center.
#[async_trait]
pub trait CoordinatorTransport: Send + Sync {
    async fn post(&self, url: Url, json_body: Option<Vec<u8>>)
        -> Result<TransportResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = build_client(timeout).map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl CoordinatorTransport for ReqwestTransport {
    async fn post(
        &self,
        url: Url,
        json_body: Option<Vec<u8>>,
    ) -> Result<TransportResponse, TransportError> {
        let mut request_builder = self.client.post(url);
        if let Some(body) = json_body {
            request_builder = request_builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request_builder.send().await.map_err(classify_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify_error)?;
        Ok(TransportResponse { status, body })
    }
}

fn classify_error(e: reqwest::Error) -> TransportError {
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || has_io_source(&e) {
        TransportError::Network(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

fn has_io_source(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if err.is::<io::Error>() {
            return true;
        }
        source = err.source();
    }
    false
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("failed to {action} coverage center, err: {source}")]
    Transport {
        action: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("failed to {action} coverage center, response code {code}")]
    Status {
        action: &'static str,
        code: StatusCode,
        body: Bytes,
    },

    #[error("failed to resolve local address: {0}")]
    Address(#[from] io::Error),

    #[error("invalid center url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl RegistrationError {
    /// Response body returned by the center, if it answered at all.
    pub fn response_body(&self) -> Option<&Bytes> {
        match self {
            RegistrationError::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct RemoveRequest<'a> {
    address: &'a [String],
}

pub struct RegistrationClient {
    center: String,
    center_url: Url,
    service_name: String,
    port: u16,
    transport: Arc<dyn CoordinatorTransport>,
}

impl RegistrationClient {
    pub fn new(
        center: &str,
        service_name: impl Into<String>,
        port: u16,
        transport: Arc<dyn CoordinatorTransport>,
    ) -> Result<Self, RegistrationError> {
        let center_url = Url::parse(center).map_err(|e| RegistrationError::InvalidUrl {
            url: center.to_string(),
            reason: e.to_string(),
        })?;
        Ok(RegistrationClient {
            center: center.trim_end_matches('/').to_string(),
            center_url,
            service_name: service_name.into(),
            port,
            transport,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Registers `http://<local ip towards center>:<port>` under the service name.
    pub async fn register_self(&self) -> Result<Bytes, RegistrationError> {
        let host = real_host(Some(&self.center_url), self.port).await?;
        let address = format!("http://{host}");
        let url = self.endpoint(
            REGISTER_ENDPOINT_PATH,
            &[("name", self.service_name.as_str()), ("address", &address)],
        )?;
        debug!("Registering {} as {address}", self.service_name);
        self.send("register into", url, None).await
    }

    /// Asks the center to forget every local IPv4 address on our port. The
    /// exact address string the center stored is not tracked, so all
    /// plausible candidates are offered.
    pub async fn deregister_self(&self) -> Result<Bytes, RegistrationError> {
        let address: Vec<String> = all_local_hosts(self.port)?
            .into_iter()
            .map(|host| format!("http://{host}"))
            .collect();
        let body = serde_json::to_vec(&RemoveRequest { address: &address }).map_err(|e| {
            RegistrationError::Transport {
                action: "deregister from",
                source: TransportError::Request(e.to_string()),
            }
        })?;
        let url = self.endpoint(REMOVE_ENDPOINT_PATH, &[])?;
        debug!("Deregistering {address:?}");
        self.send("deregister from", url, Some(body)).await
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, RegistrationError> {
        let raw = format!("{}{path}", self.center);
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|e| RegistrationError::InvalidUrl {
            url: raw,
            reason: e.to_string(),
        })
    }

    /// One attempt, plus exactly one retry when the first failure is transient.
    async fn send(
        &self,
        action: &'static str,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, RegistrationError> {
        let mut result = self.transport.post(url.clone(), body.clone()).await;
        if let Err(e) = &result {
            if e.is_transient() {
                warn!("Error occurred: {e}, try again");
                result = self.transport.post(url, body).await;
            }
        }

        let response = result.map_err(|source| RegistrationError::Transport { action, source })?;
        if !response.status.is_success() {
            return Err(RegistrationError::Status {
                action,
                code: response.status,
                body: response.body,
            });
        }
        Ok(response.body)
    }
}

/// `ip:port` for every IPv4 address on every local interface.
pub fn all_local_hosts(port: u16) -> io::Result<Vec<String>> {
    Ok(if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(format!("{ip}:{port}")),
            IpAddr::V6(_) => None,
        })
        .collect())
}
