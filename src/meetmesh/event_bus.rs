//! Per-user real-time push channel.
//!
//! The bus delivers envelopes to whichever subscribers a user currently has
//! (multiple concurrent subscribers are allowed — one per open client).
//! Delivery is best-effort and independent of persistence: a subscriber that
//! appears after a session completes reconstructs the transcript from the
//! store, not from the bus.
//!
//! # Example
//!
//! ```rust
//! use meetmesh::{Envelope, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe("user-1").await;
//! bus.send_to("user-1", Envelope::notification("안내", "일정이 확정되었습니다.")).await;
//! let envelope = rx.recv().await.unwrap();
//! assert!(matches!(envelope, Envelope::Notification { .. }));
//! # }
//! ```

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use log::debug;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::meetmesh::timeparse::now_kst;

/// Outbound payload pushed over a user's real-time channel.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// UI toast.
    Notification {
        title: String,
        body: String,
        timestamp: DateTime<FixedOffset>,
    },
    /// One streamed negotiation message (truncated preview).
    A2aMessage {
        session_id: String,
        message_type: String,
        sender_name: String,
        message: String,
        round: u32,
        timestamp: DateTime<FixedOffset>,
    },
    /// A new chat reply.
    NewMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        sender: String,
        message: String,
        timestamp: DateTime<FixedOffset>,
    },
    FriendRequest {
        from_user_id: String,
        from_name: String,
        timestamp: DateTime<FixedOffset>,
    },
    FriendAccepted {
        from_user_id: String,
        from_name: String,
        timestamp: DateTime<FixedOffset>,
    },
    FriendRejected {
        from_user_id: String,
        from_name: String,
        timestamp: DateTime<FixedOffset>,
    },
}

impl Envelope {
    pub fn notification(title: impl Into<String>, body: impl Into<String>) -> Self {
        Envelope::Notification {
            title: title.into(),
            body: body.into(),
            timestamp: now_kst(),
        }
    }
}

/// Per-user subscriber registry.
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<UnboundedSender<Envelope>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new subscriber for a user and return its receiving end.
    pub async fn subscribe(&self, user_id: &str) -> UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().await;
        subscribers.entry(user_id.to_string()).or_default().push(tx);
        rx
    }

    /// Send an envelope to every live subscriber of one user.
    ///
    /// Closed subscribers are pruned on the way; a user with no subscribers
    /// simply receives nothing.
    pub async fn send_to(&self, user_id: &str, envelope: Envelope) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(senders) = subscribers.get_mut(user_id) {
            senders.retain(|tx| tx.send(envelope.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(user_id);
            }
        } else {
            debug!("[bus] no subscribers for {}", user_id);
        }
    }

    /// Send the same envelope to several users.
    pub async fn broadcast(&self, user_ids: &[String], envelope: Envelope) {
        for user_id in user_ids {
            self.send_to(user_id, envelope.clone()).await;
        }
    }

    /// Whether the user currently has at least one live subscriber.
    pub async fn is_connected(&self, user_id: &str) -> bool {
        let subscribers = self.subscribers.lock().await;
        subscribers
            .get(user_id)
            .map(|senders| senders.iter().any(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}
