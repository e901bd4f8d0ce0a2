//! Shared primitives for provider-agnostic LLM clients.
//!
//! The coordinator consumes its language model strictly as a black-box chat
//! completion interface: a list of role-tagged messages in, one text reply
//! out. The [`LlmClient`] trait abstracts over the concrete vendor wire
//! formats; see [`clients`](crate::meetmesh::clients) for the two supported
//! shapes. Nothing in the system depends on structured function calls — the
//! LLM writes prose, never decisions.
//!
//! # Example
//!
//! ```rust,no_run
//! use meetmesh::{ChatMessage, LlmClient, Role};
//! use meetmesh::meetmesh::clients::openai::OpenAiClient;
//!
//! # async fn example() -> Result<(), meetmesh::BoxError> {
//! let client = OpenAiClient::new(&std::env::var("OPENAI_API_KEY")?, "gpt-4o-mini");
//! let reply = client
//!     .send_message(
//!         &[ChatMessage::user("안녕하세요!")],
//!         0.7,
//!         200,
//!     )
//!     .await?;
//! println!("{}", reply);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::meetmesh::error::BoxError;

/// Represents the possible roles for a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message.
    Assistant,
}

impl Role {
    /// Wire name used by both provider shapes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message sent to an LLM.
#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Trait defining the interface to interact with an LLM service.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks behind an `Arc`. A failing implementation is a
/// supported mode of operation: every caller in this crate has a
/// deterministic fallback for the prose it would have produced.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a full request/response style chat completion and return the
    /// assistant's text reply.
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, BoxError>;

    /// Identifier used to select the upstream model (e.g. `"gpt-4o-mini"`),
    /// or the endpoint name for providers without model selection.
    fn model_name(&self) -> &str;
}
