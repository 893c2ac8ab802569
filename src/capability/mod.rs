//! Browser/AI capability boundary.
//!
//! The regression core never drives a browser itself. Everything it needs
//! from the outside world goes through the [`Capability`] trait: navigation,
//! taps described in natural language, boolean and structured page queries,
//! condition waits and screenshots. Every call may be slow and may fail.
//!
//! Agents that answer with loosely-typed JSON can be plugged in through
//! [`AgentAdapter`], which validates each [`CapabilityResponse`] at the
//! boundary so only typed values flow into the core.

pub mod mock;
pub mod prompts;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use mock::{MockBrowser, MockPage};

/// Result type for capability calls
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Errors raised by the capability layer.
///
/// `Failed` carries the collaborator's message verbatim so the retry
/// classifier can inspect it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("operation timeout after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("unexpected response to {call}: {detail}")]
    Unexpected { call: String, detail: String },
}

/// Operations the core requires from the browser/AI collaborator
#[async_trait]
pub trait Capability: Send + Sync {
    async fn navigate(&self, url: &str) -> CapabilityResult<()>;

    async fn current_url(&self) -> CapabilityResult<String>;

    async fn go_back(&self) -> CapabilityResult<()>;

    /// Interact with the element matching a natural-language description
    async fn tap(&self, description: &str) -> CapabilityResult<()>;

    async fn query_boolean(&self, prompt: &str) -> CapabilityResult<bool>;

    async fn query_structured(&self, prompt: &str) -> CapabilityResult<serde_json::Value>;

    /// Resolve once the described condition holds, or fail after `timeout`
    async fn wait_for_condition(&self, prompt: &str, timeout: Duration) -> CapabilityResult<()>;

    /// PNG-encoded capture of the current page
    async fn screenshot(&self) -> CapabilityResult<Vec<u8>>;
}

/// Run a capability call under an explicit per-call-site timeout
pub async fn bounded<T, F>(timeout: Duration, call: F) -> CapabilityResult<T>
where
    F: Future<Output = CapabilityResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout(timeout)),
    }
}

// ============================================================================
// Loosely-typed agents
// ============================================================================

/// A single call sent to a loosely-typed agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum CapabilityCall {
    Navigate { url: String },
    CurrentUrl,
    GoBack,
    Tap { description: String },
    QueryBoolean { prompt: String },
    QueryStructured { prompt: String },
    WaitForCondition { prompt: String, timeout_ms: u64 },
    Screenshot,
}

impl CapabilityCall {
    fn name(&self) -> &'static str {
        match self {
            CapabilityCall::Navigate { .. } => "navigate",
            CapabilityCall::CurrentUrl => "current_url",
            CapabilityCall::GoBack => "go_back",
            CapabilityCall::Tap { .. } => "tap",
            CapabilityCall::QueryBoolean { .. } => "query_boolean",
            CapabilityCall::QueryStructured { .. } => "query_structured",
            CapabilityCall::WaitForCondition { .. } => "wait_for_condition",
            CapabilityCall::Screenshot => "screenshot",
        }
    }
}

/// Raw answer from a loosely-typed agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CapabilityResponse {
    Boolean(bool),
    Structured(serde_json::Value),
    Error(String),
}

impl CapabilityResponse {
    /// Coerce into a boolean.
    ///
    /// Accepts JSON booleans, `"true"`/`"yes"`/`"false"`/`"no"` strings and
    /// objects carrying a boolean `result` or `answer` field.
    pub fn into_bool(self) -> CapabilityResult<bool> {
        match self {
            CapabilityResponse::Boolean(b) => Ok(b),
            CapabilityResponse::Error(msg) => Err(CapabilityError::Failed(msg)),
            CapabilityResponse::Structured(value) => {
                coerce_bool(&value).ok_or_else(|| CapabilityError::Unexpected {
                    call: "query_boolean".to_string(),
                    detail: value.to_string(),
                })
            }
        }
    }

    pub fn into_structured(self) -> CapabilityResult<serde_json::Value> {
        match self {
            CapabilityResponse::Boolean(b) => Ok(serde_json::Value::Bool(b)),
            CapabilityResponse::Structured(value) => Ok(value),
            CapabilityResponse::Error(msg) => Err(CapabilityError::Failed(msg)),
        }
    }

    /// Coerce into a string (current URL answers)
    pub fn into_text(self, call: &str) -> CapabilityResult<String> {
        match self {
            CapabilityResponse::Structured(serde_json::Value::String(s)) => Ok(s),
            CapabilityResponse::Structured(value) => value
                .get("url")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| CapabilityError::Unexpected {
                    call: call.to_string(),
                    detail: value.to_string(),
                }),
            CapabilityResponse::Boolean(b) => Err(CapabilityError::Unexpected {
                call: call.to_string(),
                detail: b.to_string(),
            }),
            CapabilityResponse::Error(msg) => Err(CapabilityError::Failed(msg)),
        }
    }

    /// Any non-error answer acknowledges a side-effecting call
    pub fn into_ack(self) -> CapabilityResult<()> {
        match self {
            CapabilityResponse::Error(msg) => Err(CapabilityError::Failed(msg)),
            CapabilityResponse::Boolean(false) => {
                Err(CapabilityError::Failed("operation reported failure".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Decode a screenshot answer: base64 text, optionally as a data URL
    pub fn into_image_bytes(self) -> CapabilityResult<Vec<u8>> {
        let text = self.into_text("screenshot")?;
        decode_image_payload(&text).ok_or_else(|| CapabilityError::Unexpected {
            call: "screenshot".to_string(),
            detail: "payload is not base64 image data".to_string(),
        })
    }
}

fn coerce_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        serde_json::Value::Object(map) => map
            .get("result")
            .or_else(|| map.get("answer"))
            .and_then(coerce_bool),
        _ => None,
    }
}

/// Decode base64 image data, stripping a `data:image/...;base64,` prefix
pub fn decode_image_payload(text: &str) -> Option<Vec<u8>> {
    let payload = match text.split_once(";base64,") {
        Some((_, data)) => data,
        None => text,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()
}

/// An agent that answers every call with a loosely-typed response
#[async_trait]
pub trait RawAgent: Send + Sync {
    async fn invoke(&self, call: CapabilityCall) -> CapabilityResponse;
}

/// Wraps a [`RawAgent`] so it can be used wherever a [`Capability`] is expected
pub struct AgentAdapter<A> {
    agent: A,
}

impl<A: RawAgent> AgentAdapter<A> {
    pub fn new(agent: A) -> Self {
        Self { agent }
    }

    async fn call(&self, call: CapabilityCall) -> CapabilityResponse {
        let name = call.name();
        let response = self.agent.invoke(call).await;
        if let CapabilityResponse::Error(msg) = &response {
            tracing::debug!(target: "menu_regress::capability", call = name, error = %msg, "agent call failed");
        }
        response
    }
}

#[async_trait]
impl<A: RawAgent> Capability for AgentAdapter<A> {
    async fn navigate(&self, url: &str) -> CapabilityResult<()> {
        self.call(CapabilityCall::Navigate { url: url.to_string() })
            .await
            .into_ack()
    }

    async fn current_url(&self) -> CapabilityResult<String> {
        self.call(CapabilityCall::CurrentUrl)
            .await
            .into_text("current_url")
    }

    async fn go_back(&self) -> CapabilityResult<()> {
        self.call(CapabilityCall::GoBack).await.into_ack()
    }

    async fn tap(&self, description: &str) -> CapabilityResult<()> {
        self.call(CapabilityCall::Tap {
            description: description.to_string(),
        })
        .await
        .into_ack()
    }

    async fn query_boolean(&self, prompt: &str) -> CapabilityResult<bool> {
        self.call(CapabilityCall::QueryBoolean {
            prompt: prompt.to_string(),
        })
        .await
        .into_bool()
    }

    async fn query_structured(&self, prompt: &str) -> CapabilityResult<serde_json::Value> {
        self.call(CapabilityCall::QueryStructured {
            prompt: prompt.to_string(),
        })
        .await
        .into_structured()
    }

    async fn wait_for_condition(&self, prompt: &str, timeout: Duration) -> CapabilityResult<()> {
        let call = CapabilityCall::WaitForCondition {
            prompt: prompt.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        bounded(timeout, async { self.call(call).await.into_ack() }).await
    }

    async fn screenshot(&self) -> CapabilityResult<Vec<u8>> {
        self.call(CapabilityCall::Screenshot).await.into_image_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct CannedAgent {
        answers: Mutex<Vec<CapabilityResponse>>,
    }

    #[async_trait]
    impl RawAgent for CannedAgent {
        async fn invoke(&self, _call: CapabilityCall) -> CapabilityResponse {
            self.answers
                .lock()
                .map(|mut a| a.pop())
                .ok()
                .flatten()
                .unwrap_or(CapabilityResponse::Error("no answer".to_string()))
        }
    }

    #[test]
    fn test_coerce_bool_shapes() {
        assert_eq!(CapabilityResponse::Boolean(true).into_bool(), Ok(true));
        assert_eq!(
            CapabilityResponse::Structured(json!("Yes")).into_bool(),
            Ok(true)
        );
        assert_eq!(
            CapabilityResponse::Structured(json!({"result": false})).into_bool(),
            Ok(false)
        );
        assert!(matches!(
            CapabilityResponse::Structured(json!(42)).into_bool(),
            Err(CapabilityError::Unexpected { .. })
        ));
        assert_eq!(
            CapabilityResponse::Error("boom".to_string()).into_bool(),
            Err(CapabilityError::Failed("boom".to_string()))
        );
    }

    #[test]
    fn test_decode_image_payload() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([0x89, 0x50, 0x4E, 0x47]);
        assert_eq!(
            decode_image_payload(&format!("data:image/png;base64,{}", encoded)),
            Some(vec![0x89, 0x50, 0x4E, 0x47])
        );
        assert_eq!(decode_image_payload(&encoded), Some(vec![0x89, 0x50, 0x4E, 0x47]));
        assert_eq!(decode_image_payload("not base64!"), None);
    }

    #[test]
    fn test_call_serialization_is_tagged() {
        let call = CapabilityCall::Tap {
            description: "Reports".to_string(),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value, json!({"call": "tap", "description": "Reports"}));
    }

    #[tokio::test]
    async fn test_agent_adapter_coerces_responses() {
        let agent = CannedAgent {
            answers: Mutex::new(vec![
                CapabilityResponse::Structured(json!({"url": "https://a.com/x"})),
                CapabilityResponse::Structured(json!("no")),
            ]),
        };
        let adapter = AgentAdapter::new(agent);
        assert_eq!(adapter.query_boolean("blank?").await, Ok(false));
        assert_eq!(adapter.current_url().await, Ok("https://a.com/x".to_string()));
        assert_eq!(
            adapter.go_back().await,
            Err(CapabilityError::Failed("no answer".to_string()))
        );
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: CapabilityResult<()> = bounded(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(CapabilityError::Timeout(Duration::from_millis(5))));
    }
}
