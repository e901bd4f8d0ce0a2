//! Client for the plain `{response}` provider shape.
//!
//! Some self-hosted model gateways take the same `messages` array but answer
//! with a single field: `{"response": "..."}`. This wrapper speaks that shape.

use async_trait::async_trait;
use log::debug;

use crate::meetmesh::client_wrapper::{ChatMessage, LlmClient};
use crate::meetmesh::clients::common::{format_messages, get_shared_http_client};
use crate::meetmesh::error::BoxError;

/// Client wrapper for gateways answering `{"response": string}`.
pub struct LlamaClient {
    http: reqwest::Client,
    url: String,
}

impl LlamaClient {
    pub fn new(url: &str) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for LlamaClient {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, BoxError> {
        let payload = serde_json::json!({
            "messages": format_messages(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        debug!("[llama] sending {} messages to {}", messages.len(), self.url);

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        let content = body["response"]
            .as_str()
            .ok_or("model gateway response carried no `response` field")?;
        Ok(content.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.url
    }
}
