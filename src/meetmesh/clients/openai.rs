//! OpenAI-shaped Chat Completions client.
//!
//! Targets any endpoint that answers with a `choices` array:
//! `{"choices": [{"message": {"content": "..."}}], ...}`. This covers OpenAI
//! itself and the many self-hosted deployments that mirror its surface.
//!
//! # Example
//!
//! ```rust,no_run
//! use meetmesh::{ChatMessage, LlmClient};
//! use meetmesh::meetmesh::clients::openai::OpenAiClient;
//!
//! # async fn example() -> Result<(), meetmesh::BoxError> {
//! let client = OpenAiClient::new(&std::env::var("OPENAI_API_KEY")?, "gpt-4o-mini");
//! let reply = client.send_message(&[ChatMessage::user("Hello!")], 0.7, 100).await?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::meetmesh::client_wrapper::{ChatMessage, LlmClient};
use crate::meetmesh::clients::common::{format_messages, get_shared_http_client};
use crate::meetmesh::error::BoxError;

/// Client wrapper for OpenAI-compatible Chat Completions endpoints.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    /// Construct a client against the official endpoint.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, "https://api.openai.com/v1")
    }

    /// Construct a client against a compatible self-hosted endpoint.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, BoxError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = serde_json::json!({
            "model": self.model,
            "messages": format_messages(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or("chat completion response carried no choices[0].message.content")?;
        Ok(content.trim().to_string())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
