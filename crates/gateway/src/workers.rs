//! HTTP client for the long-process worker fleet.
//!
//! A submit POSTs the job envelope to the worker's endpoint and returns an
//! acknowledgement; the worker reports its terminal result later on
//! `POST /lpt/callback`, echoing the same envelope with `response` filled
//! in.

use std::time::Duration;

use serde_json::Value;

use ma_domain::config::WorkersConfig;
use ma_domain::task::LptEnvelope;
use ma_domain::{Error, Result};

/// LPT tool name → worker route segment.
pub fn worker_route(tool_name: &str) -> Option<&'static str> {
    match tool_name {
        "LPT_APBOOKKEEPER" => Some("apbookkeeper"),
        "LPT_ROUTER" => Some("router"),
        "LPT_BANKER" => Some("banker"),
        "LPT_HR_JOBBER" => Some("hr_jobber"),
        _ => None,
    }
}

/// The submit seam. The runtime only needs "hand this envelope to that
/// worker"; tests plug in a double here.
#[async_trait::async_trait]
pub trait WorkerSubmitter: Send + Sync {
    /// Submit a job to the named worker. Returns the worker's ack body.
    async fn submit(&self, tool_name: &str, envelope: &LptEnvelope) -> Result<Value>;
}

pub struct HttpWorkerClient {
    base_url: String,
    callback_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn from_config(cfg: &WorkersConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let api_key = std::env::var(&cfg.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(env_var = %cfg.api_key_env, "worker API key not set — submits will be unauthenticated");
        }
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            callback_url: format!(
                "{}/lpt/callback",
                cfg.callback_base_url.trim_end_matches('/')
            ),
            api_key,
            client,
        })
    }
}

#[async_trait::async_trait]
impl WorkerSubmitter for HttpWorkerClient {
    async fn submit(&self, tool_name: &str, envelope: &LptEnvelope) -> Result<Value> {
        let route = worker_route(tool_name).ok_or_else(|| {
            Error::InvalidArgs(format!("'{tool_name}' is not a long-process tool"))
        })?;
        let url = format!("{}/v1/{route}/submit", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .header("X-Callback-Url", &self.callback_url)
            .json(envelope);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| Error::Worker {
            worker: route.to_string(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Error::Worker {
                worker: route.to_string(),
                message: format!("HTTP {} - {}", status.as_u16(), body),
            });
        }
        tracing::info!(worker = route, batch_id = %envelope.batch_id, "LPT submitted");
        Ok(body)
    }
}
