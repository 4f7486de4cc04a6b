//! Client for the external LLM gateway's `agent` RPC.
//!
//! The core never performs inference itself. Waking an agent means one
//! outbound call per recipient, each on its own connectionless request with
//! an independent deadline, so a slow gateway turn for one agent never
//! serializes the others.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// One wake-up request. `deliver: false` tells the gateway the turn output
/// is not routed back over this call; the agent replies through the channel
/// post operation on its own time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurnRequest {
    pub session_key: String,
    pub message: String,
    pub deliver: bool,
    pub idempotency_key: String,
    /// Per-call deadline in seconds, also enforced client-side.
    pub timeout: u64,
}

/// Seam to the external gateway. Trait object so tests substitute a
/// recording stub.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Invoke `agent(sessionKey, message)`. The gateway completes the turn
    /// asynchronously; success here only means the request was accepted.
    async fn agent(&self, request: AgentTurnRequest) -> anyhow::Result<()>;
}

/// HTTP implementation posting `{method: "agent", params}` JSON.
pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
}

impl HttpGateway {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn agent(&self, request: AgentTurnRequest) -> anyhow::Result<()> {
        let timeout = Duration::from_secs(request.timeout);
        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&serde_json::json!({
                "method": "agent",
                "params": request,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("gateway rejected agent call: {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_wire_field_names() {
        let request = AgentTurnRequest {
            session_key: "agent:builder:webchat:channel:ch-1".into(),
            message: "hello".into(),
            deliver: false,
            idempotency_key: "key-1".into(),
            timeout: 300,
        };

        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["sessionKey"], "agent:builder:webchat:channel:ch-1");
        assert_eq!(value["deliver"], false);
        assert_eq!(value["idempotencyKey"], "key-1");
        assert_eq!(value["timeout"], 300);
    }
}
