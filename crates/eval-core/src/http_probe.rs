//! Remote agent probe over HTTP.
//!
//! The daemon talks to agents that live in other processes. Each attempt is
//! one `POST` of [`ProbeRequest`] to the kind's endpoint; a 2xx answer must
//! carry `{score, data}`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use eval_state::AgentKind;
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::executor::{AgentOutput, AgentProbe, ProbeContext};

/// Body posted to a probe endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub target_id: String,
    pub evaluation_id: String,
    pub agent_kind: AgentKind,
    pub attempt: u32,
    pub timeout_ms: u64,
    pub previous_results: BTreeMap<AgentKind, AgentOutput>,
}

impl ProbeRequest {
    pub fn from_context(target_id: &str, ctx: &ProbeContext) -> Self {
        Self {
            target_id: target_id.to_string(),
            evaluation_id: ctx.evaluation_id.0.clone(),
            agent_kind: ctx.agent_kind,
            attempt: ctx.attempt,
            timeout_ms: ctx.timeout_ms,
            previous_results: (*ctx.previous_results).clone(),
        }
    }
}

/// Probe client for one agent endpoint
pub struct HttpProbe {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ProbeError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("evald/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Ok(Self::with_client(endpoint, http_client))
    }

    /// Share one connection pool across several probes.
    pub fn with_client(endpoint: impl Into<String>, http_client: reqwest::Client) -> Self {
        HttpProbe {
            endpoint: endpoint.into(),
            http_client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, body: &ProbeRequest) -> Result<AgentOutput, ProbeError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProbeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<AgentOutput>()
            .await
            .map_err(|e| ProbeError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl AgentProbe for HttpProbe {
    async fn probe(&self, target_id: &str, ctx: ProbeContext) -> Result<AgentOutput, ProbeError> {
        let body = ProbeRequest::from_context(target_id, &ctx);
        tracing::debug!(
            endpoint = %self.endpoint,
            agent_kind = %ctx.agent_kind,
            attempt = ctx.attempt,
            "posting probe request"
        );

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ProbeError::Cancelled),
            result = self.call(&body) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use eval_state::EvaluationId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ProbeContext {
        let mut previous = BTreeMap::new();
        previous.insert(
            AgentKind::Crawl,
            AgentOutput::new(70.0, serde_json::json!({"pages": 12})),
        );
        ProbeContext {
            evaluation_id: EvaluationId("eval-1".into()),
            agent_kind: AgentKind::Citation,
            attempt: 2,
            timeout_ms: 90_000,
            previous_results: Arc::new(previous),
            cancel: CancellationToken::new(),
        }
    }

    /// Serve exactly one HTTP response and hand back the raw request.
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (format!("http://{addr}/probe"), handle)
    }

    #[test]
    fn request_carries_previous_results() {
        let body = ProbeRequest::from_context("brand-7", &ctx());
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["target_id"], "brand-7");
        assert_eq!(json["agent_kind"], "citation_agent");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["previous_results"]["crawl_agent"]["score"], 70.0);
    }

    #[tokio::test]
    async fn parses_successful_response() {
        let (url, server) =
            one_shot_server("HTTP/1.1 200 OK", r#"{"score": 64.5, "data": {"cited": 3}}"#).await;
        let probe = HttpProbe::new(url).unwrap();

        let output = probe.probe("brand-7", ctx()).await.unwrap();
        assert_eq!(output.score, 64.5);
        assert_eq!(output.data["cited"], 3);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /probe"));
        assert!(request.contains("\"evaluation_id\":\"eval-1\""));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let (url, _server) =
            one_shot_server("HTTP/1.1 503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let probe = HttpProbe::new(url).unwrap();
        let err = probe.probe("brand-7", ctx()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let (url, _server) = one_shot_server("HTTP/1.1 200 OK", r#"{"data": 1}"#).await;
        let probe = HttpProbe::new(url).unwrap();
        let err = probe.probe("brand-7", ctx()).await.unwrap_err();
        assert!(matches!(err, ProbeError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let probe = HttpProbe::new("http://127.0.0.1:9/unused").unwrap();
        let context = ctx();
        context.cancel.cancel();
        let err = probe.probe("brand-7", context).await.unwrap_err();
        assert!(matches!(err, ProbeError::Cancelled));
    }
}
