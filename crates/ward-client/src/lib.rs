//! Thin HTTP client for the coordinator's worker/client RPC surface. Mirrors
//! the JSON shapes `ward-dispatcher`'s HTTP layer exposes; kept dependency-
//! light (`reqwest` + `serde`) so worker binaries can embed it without
//! pulling in the coordination kernel itself.

use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use ward_core::RetryPolicy;

#[derive(Clone, Debug)]
pub struct WardClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub enum LeaseOutcome {
    Granted {
        task_id: Uuid,
        lease_id: Uuid,
        attempt: i64,
        payload: Vec<u8>,
        lease_expiry: DateTime<Utc>,
    },
    NoWork,
}

#[derive(Debug, Clone)]
pub enum HeartbeatOutcome {
    Committed { new_expiry: DateTime<Utc> },
    Rejected(String),
}

#[derive(Debug, Clone)]
pub enum TerminalOutcome {
    Committed,
    Cancelled,
    Rejected(String),
}

impl WardClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn submit_task(
        &self,
        payload: &[u8],
        execution_window_secs: i64,
        retry_policy: RetryPolicy,
        request_id: Option<String>,
    ) -> anyhow::Result<Uuid> {
        #[derive(Serialize)]
        struct Req {
            payload_base64: String,
            execution_window_secs: i64,
            max_attempts: i64,
            request_id: Option<String>,
        }
        #[derive(Deserialize)]
        struct Resp {
            task_id: Uuid,
        }

        let resp: Resp = self
            .http
            .post(self.url("/v1/tasks")?)
            .json(&Req {
                payload_base64: base64::engine::general_purpose::STANDARD.encode(payload),
                execution_window_secs,
                max_attempts: retry_policy.max_attempts,
                request_id,
            })
            .send()
            .await
            .context("POST /v1/tasks")?
            .error_for_status()
            .context("submit_task status")?
            .json()
            .await
            .context("decode submit_task response")?;

        Ok(resp.task_id)
    }

    pub async fn request_lease(&self, worker_id: &str) -> anyhow::Result<LeaseOutcome> {
        let value: serde_json::Value = self
            .http
            .post(self.url("/v1/leases")?)
            .json(&serde_json::json!({ "worker_id": worker_id }))
            .send()
            .await
            .context("POST /v1/leases")?
            .error_for_status()
            .context("request_lease status")?
            .json()
            .await
            .context("decode request_lease response")?;

        match value["status"].as_str() {
            Some("granted") => {
                let payload_base64 = value["payload_base64"].as_str().unwrap_or_default();
                let payload = base64::engine::general_purpose::STANDARD
                    .decode(payload_base64)
                    .context("decode lease payload")?;
                Ok(LeaseOutcome::Granted {
                    task_id: parse_uuid(&value["task_id"])?,
                    lease_id: parse_uuid(&value["lease_id"])?,
                    attempt: value["attempt"].as_i64().unwrap_or_default(),
                    payload,
                    lease_expiry: parse_timestamp(&value["lease_expiry"])?,
                })
            }
            _ => Ok(LeaseOutcome::NoWork),
        }
    }

    pub async fn heartbeat(&self, worker_id: &str, task_id: Uuid, lease_id: Uuid) -> anyhow::Result<HeartbeatOutcome> {
        let value: serde_json::Value = self
            .http
            .post(self.url("/v1/leases/heartbeat")?)
            .json(&serde_json::json!({ "worker_id": worker_id, "task_id": task_id, "lease_id": lease_id }))
            .send()
            .await
            .context("POST /v1/leases/heartbeat")?
            .error_for_status()
            .context("heartbeat status")?
            .json()
            .await
            .context("decode heartbeat response")?;

        match value["status"].as_str() {
            Some("committed") => Ok(HeartbeatOutcome::Committed {
                new_expiry: parse_timestamp(&value["new_expiry"])?,
            }),
            _ => Ok(HeartbeatOutcome::Rejected(
                value["reason"].as_str().unwrap_or("rejected").to_string(),
            )),
        }
    }

    pub async fn complete(&self, task_id: Uuid, lease_id: Uuid) -> anyhow::Result<TerminalOutcome> {
        self.terminal_call("/v1/leases/complete", task_id, lease_id, None).await
    }

    pub async fn fail(&self, task_id: Uuid, lease_id: Uuid, reason: String) -> anyhow::Result<TerminalOutcome> {
        self.terminal_call("/v1/leases/fail", task_id, lease_id, Some(reason)).await
    }

    async fn terminal_call(
        &self,
        path: &str,
        task_id: Uuid,
        lease_id: Uuid,
        reason: Option<String>,
    ) -> anyhow::Result<TerminalOutcome> {
        let value: serde_json::Value = self
            .http
            .post(self.url(path)?)
            .json(&serde_json::json!({ "task_id": task_id, "lease_id": lease_id, "reason": reason }))
            .send()
            .await
            .with_context(|| format!("POST {path}"))?
            .error_for_status()
            .context("terminal call status")?
            .json()
            .await
            .context("decode terminal response")?;

        Ok(match value["status"].as_str() {
            Some("committed") => TerminalOutcome::Committed,
            Some("cancelled") => TerminalOutcome::Cancelled,
            _ => TerminalOutcome::Rejected(value["reason"].as_str().unwrap_or("rejected").to_string()),
        })
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        let base = Url::parse(&self.base_url).context("parse ward coordinator base URL")?;
        base.join(path).context("join coordinator URL")
    }
}

fn parse_uuid(value: &serde_json::Value) -> anyhow::Result<Uuid> {
    value
        .as_str()
        .context("missing uuid field")?
        .parse()
        .context("parse uuid field")
}

fn parse_timestamp(value: &serde_json::Value) -> anyhow::Result<DateTime<Utc>> {
    value
        .as_str()
        .context("missing timestamp field")?
        .parse()
        .context("parse timestamp field")
}
