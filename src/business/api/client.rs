//! HTTP API client for remote panel communication

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::models::{
    AliveIpWire, Envelope, NodeWire, PostData, RelayNodeWire, SubscriptionWire, TrafficWire,
};
use crate::config::CliArgs;
use crate::core::hooks::{ClientInfo, Fetched, PanelApi};
use crate::core::model::{
    NodeDescriptor, NodeId, OnlineIp, RelayNodeDescriptor, SubscriberRecord, Usage,
};
use crate::error::{NodeError, Result};
use crate::logger::log;

/// ETag slot of the node descriptor
const NODE_RESOURCE: &str = "node";
/// ETag slot of the subscriber list
const SUBSCRIPTIONS_RESOURCE: &str = "subscriptions";

/// Configuration for the panel client
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Panel base URL (e.g., "https://panel.example.com")
    pub api_host: String,
    pub api_key: String,
    /// Node ID for this server
    pub node_id: NodeId,
    /// API request timeout
    pub api_timeout: Duration,
}

impl PanelConfig {
    /// Create PanelConfig from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            api_host: cli.api_host.trim_end_matches('/').to_string(),
            api_key: cli.api_key.clone(),
            node_id: cli.node,
            api_timeout: cli.api_timeout,
        }
    }
}

/// Panel client over HTTP/JSON with conditional fetches
pub struct PanelClient {
    http: reqwest::Client,
    config: PanelConfig,
    /// resource -> last ETag seen on a successfully parsed response
    etags: RwLock<HashMap<&'static str, String>>,
}

impl PanelClient {
    pub fn new(config: PanelConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .build()
            .map_err(|e| NodeError::Api(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            etags: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}/{}", self.config.api_host, path, self.config.node_id)
    }

    /// POST `{"key"}` and decode the `data` member.
    ///
    /// With a `resource`, the request is conditional on its last ETag and a
    /// 304 answer yields `NotModified`.
    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        resource: Option<&'static str>,
    ) -> Result<Fetched<T>> {
        let url = self.url(path);
        let mut request = self.http.post(&url).json(&PostData::<()> {
            key: &self.config.api_key,
            data: None,
        });
        if let Some(resource) = resource {
            if let Some(etag) = self.etags.read().await.get(resource) {
                request = request.header(header::IF_NONE_MATCH, etag.as_str());
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::Api(format!("request error occurred for URL {}: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        check_status(&url, status, &body)?;

        let envelope: Envelope<T> = serde_json::from_slice(&body).map_err(|e| {
            NodeError::Api(format!(
                "failed to parse response of {}: {}: {}",
                url,
                e,
                String::from_utf8_lossy(&body)
            ))
        })?;

        if let (Some(resource), Some(etag)) = (resource, etag) {
            self.etags.write().await.insert(resource, etag);
        }
        Ok(Fetched::Changed(envelope.data))
    }

    /// POST `{"key", "data"}`
    async fn submit<T: Serialize + Send + Sync>(&self, path: &str, data: T) -> Result<()> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .json(&PostData {
                key: &self.config.api_key,
                data: Some(data),
            })
            .send()
            .await
            .map_err(|e| NodeError::Api(format!("request error occurred for URL {}: {}", url, e)))?;

        let status = response.status();
        let body = response.bytes().await?;
        check_status(&url, status, &body)?;
        serde_json::from_slice::<serde_json::Value>(&body).map_err(|_| {
            NodeError::Api(format!(
                "failed to parse JSON from {}: {}",
                url,
                String::from_utf8_lossy(&body)
            ))
        })?;
        Ok(())
    }
}

fn check_status(url: &str, status: StatusCode, body: &[u8]) -> Result<()> {
    if status.as_u16() >= 400 {
        return Err(NodeError::Api(format!(
            "request {} failed: {}, {}",
            url,
            status,
            String::from_utf8_lossy(body)
        )));
    }
    Ok(())
}

#[async_trait]
impl PanelApi for PanelClient {
    fn describe(&self) -> ClientInfo {
        ClientInfo {
            api_host: self.config.api_host.clone(),
            node_id: self.config.node_id,
        }
    }

    async fn fetch_node(&self) -> Result<Fetched<NodeDescriptor>> {
        match self
            .fetch::<NodeWire>("/api/server/info", Some(NODE_RESOURCE))
            .await?
        {
            Fetched::Changed(wire) => Ok(Fetched::Changed(wire.try_into()?)),
            Fetched::NotModified => Ok(Fetched::NotModified),
        }
    }

    async fn fetch_relay_node(&self) -> Result<RelayNodeDescriptor> {
        match self
            .fetch::<RelayNodeWire>("/api/server/transit", None)
            .await?
        {
            Fetched::Changed(wire) => wire.try_into(),
            Fetched::NotModified => Err(NodeError::Api(
                "relay node request answered not-modified".to_string(),
            )),
        }
    }

    async fn fetch_subscribers(&self) -> Result<Fetched<Vec<SubscriberRecord>>> {
        let fetched = self
            .fetch::<Vec<SubscriptionWire>>(
                "/api/server/subscription/lists",
                Some(SUBSCRIPTIONS_RESOURCE),
            )
            .await?;
        Ok(match fetched {
            Fetched::Changed(wire) => {
                let records: Vec<SubscriberRecord> = wire.into_iter().map(Into::into).collect();
                log::debug!(count = records.len(), "Subscribers fetched");
                Fetched::Changed(records)
            }
            Fetched::NotModified => Fetched::NotModified,
        })
    }

    async fn report_usage(&self, usage: &[Usage]) -> Result<()> {
        let data: Vec<TrafficWire> = usage.iter().map(Into::into).collect();
        self.submit("/api/server/subscription/traffic", data).await
    }

    async fn report_online(&self, online: &[OnlineIp]) -> Result<()> {
        let data: Vec<AliveIpWire> = online.iter().map(Into::into).collect();
        self.submit("/api/server/subscription/onlineip", data).await
    }
}
