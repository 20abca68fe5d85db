//! Downstream call boundary.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use super::request::Method;
use crate::error::{GatewayError, Result};
use crate::ratelimit::Tier;

/// What the pipeline hands to the downstream collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardRequest {
    pub path: String,
    pub method: Method,
    pub body: Option<Value>,
    /// Tier of the calling principal, for downstreams that vary by plan.
    pub tier: Tier,
}

/// Downstream status and payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardResponse {
    pub status: u16,
    pub payload: Value,
}

impl ForwardResponse {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: 200,
            payload,
        }
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A single downstream call.
///
/// Retries and backoff, if wanted, belong inside the implementation. The
/// pipeline enforces `timeout` on its side as well, so implementations that
/// ignore it are still bounded.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Fails with [`GatewayError::ForwardTimeout`] or
    /// [`GatewayError::ForwardConnection`].
    async fn forward(
        &self,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse>;
}

/// Simulated downstream that echoes the request back.
#[derive(Debug, Clone, Default)]
pub struct EchoForwarder {
    latency: Duration,
}

impl EchoForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Forwarder for EchoForwarder {
    async fn forward(
        &self,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse> {
        if !self.latency.is_zero() {
            if self.latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(GatewayError::ForwardTimeout(timeout));
            }
            tokio::time::sleep(self.latency).await;
        }

        Ok(ForwardResponse::ok(json!({
            "message": "Proxy request successful",
            "path": request.path,
            "method": request.method,
            "tier": request.tier,
        })))
    }
}
