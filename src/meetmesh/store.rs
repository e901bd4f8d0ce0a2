//! Persistence seam and its in-memory implementation.
//!
//! The backend is modelled as a row-oriented store with JSON-valued columns.
//! [`Store`] names the logical tables the coordinator touches: users,
//! negotiation sessions, negotiation messages, chat logs, per-user chat
//! containers, friendships, and calendar-event links. The free-form JSON bags
//! of the storage layer are given named record types here
//! ([`SessionPrefs`], [`ApprovalMeta`], [`RecoordinationMeta`], …) and are
//! encoded/decoded only at this boundary.
//!
//! [`MemoryStore`] keeps everything behind a single `RwLock` and is both the
//! test double and a usable single-process backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::meetmesh::error::BoxError;
use crate::meetmesh::protocol::{Proposal, SessionStatus};
use crate::meetmesh::timeparse::now_kst;

/// A registered user.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

/// `time_window` column of a session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    pub date: Option<String>,
    pub time: Option<String>,
    #[serde(default)]
    pub duration_minutes: i64,
}

/// The session preference bag, typed.
///
/// Field renames preserve the storage keys of the JSON column so existing
/// rows stay readable.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionPrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    /// The human's original ask, preserved even when agreements overwrite
    /// everything else.
    #[serde(rename = "requestedDate", default, skip_serializing_if = "Option::is_none")]
    pub requested_date: Option<String>,
    #[serde(rename = "requestedTime", default, skip_serializing_if = "Option::is_none")]
    pub requested_time: Option<String>,
    #[serde(rename = "agreedDate", default, skip_serializing_if = "Option::is_none")]
    pub agreed_date: Option<String>,
    #[serde(rename = "agreedTime", default, skip_serializing_if = "Option::is_none")]
    pub agreed_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreed_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hidden_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub left_participants: Vec<String>,
}

/// What the engine stores when a negotiation reaches agreement.
#[derive(Clone, Debug, Default)]
pub struct AgreementDetails {
    pub requested_date: Option<String>,
    pub requested_time: Option<String>,
    pub agreed_date: Option<String>,
    pub agreed_time: Option<String>,
    pub location: Option<String>,
    pub activity: Option<String>,
    pub agreed_at: Option<DateTime<FixedOffset>>,
}

/// One negotiation session row.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub id: String,
    pub initiator_user_id: String,
    pub target_user_id: Option<String>,
    pub participant_user_ids: Vec<String>,
    pub intent: String,
    pub status: SessionStatus,
    pub time_window: Option<TimeWindow>,
    pub prefs: SessionPrefs,
    pub final_event_id: Option<String>,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

impl SessionRecord {
    /// Every user attached to this session (initiator, target, listed
    /// participants), deduplicated.
    pub fn all_participants(&self) -> Vec<String> {
        let mut out = vec![self.initiator_user_id.clone()];
        if let Some(target) = &self.target_user_id {
            if !out.contains(target) {
                out.push(target.clone());
            }
        }
        for p in self.participant_user_ids.iter().chain(&self.prefs.participants) {
            if !out.contains(p) {
                out.push(p.clone());
            }
        }
        out
    }
}

/// Kinds of persisted negotiation messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum A2aMessageKind {
    Propose,
    Accept,
    Reject,
    Counter,
    Query,
    NeedHuman,
    Info,
    ConflictChoice,
    AwaitingChoice,
    MajorityRecommend,
    AgentQuery,
    AgentReply,
    Proposal,
    Confirm,
    Final,
    ScheduleRejection,
}

/// JSON payload of one persisted negotiation message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Proposal>,
}

/// One persisted negotiation message row.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub sender_user_id: String,
    pub receiver_user_id: Option<String>,
    pub kind: A2aMessageKind,
    pub payload: MessagePayload,
    pub created_at: DateTime<FixedOffset>,
}

/// Kinds of chat-log entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatLogKind {
    UserMessage,
    AiResponse,
    ScheduleApproval,
    ApprovalResponse,
    ScheduleRejection,
    ScheduleConfirmed,
    FriendRequest,
    FriendAccepted,
    FriendRejected,
    System,
}

/// One chat-log row.
#[derive(Clone, Debug)]
pub struct ChatLogEntry {
    pub id: String,
    pub user_id: String,
    pub friend_id: Option<String>,
    pub chat_session_id: Option<String>,
    pub request_text: Option<String>,
    pub response_text: Option<String>,
    pub kind: ChatLogKind,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<FixedOffset>,
}

impl ChatLogEntry {
    pub fn new(user_id: &str, kind: ChatLogKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            friend_id: None,
            chat_session_id: None,
            request_text: None,
            response_text: None,
            kind,
            metadata: None,
            created_at: now_kst(),
        }
    }

    pub fn with_response(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }

    pub fn with_request(mut self, text: impl Into<String>) -> Self {
        self.request_text = Some(text.into());
        self
    }

    pub fn with_chat_session(mut self, id: Option<&str>) -> Self {
        self.chat_session_id = id.map(str::to_string);
        self
    }

    pub fn with_friend(mut self, id: Option<&str>) -> Self {
        self.friend_id = id.map(str::to_string);
        self
    }

    pub fn with_metadata<T: Serialize>(mut self, metadata: &T) -> Self {
        self.metadata = serde_json::to_value(metadata).ok();
        self
    }

    /// Decode this entry's metadata into a typed record, if present and
    /// well-formed.
    pub fn metadata_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.metadata
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

/// Proposal payload carried by an approval request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApprovalProposal {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    /// RFC3339 instants once the time string has been parsed.
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

/// Metadata of a `schedule_approval` chat log.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApprovalMeta {
    pub proposal: ApprovalProposal,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub session_ids: Vec<String>,
    /// Drives the approve/reject buttons; cleared on rejection.
    #[serde(default)]
    pub needs_approval: bool,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approved_by_list: Vec<String>,
    #[serde(default)]
    pub all_approved: bool,
    #[serde(default)]
    pub approved_at: Option<String>,
}

/// Metadata of an `approval_response` chat log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalResponseMeta {
    pub approved: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub session_ids: Vec<String>,
}

/// Metadata flagging that the thread needs recoordination.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecoordinationMeta {
    pub needs_recoordination: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub session_ids: Vec<String>,
    #[serde(default)]
    pub rejected_by: Option<String>,
    #[serde(default)]
    pub unavailable_users: Vec<String>,
}

/// One offered candidate date in recommendation mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecommendedDate {
    pub date: String,
    pub condition: String,
}

/// Metadata of a recommendation-mode prompt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecommendationMeta {
    pub recommendation_mode: bool,
    #[serde(default)]
    pub recommendations: Vec<RecommendedDate>,
    #[serde(default)]
    pub friend_ids: Vec<String>,
    #[serde(default)]
    pub friend_names: Vec<String>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Metadata of a time-selection-mode prompt (a date was just picked).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DateSelectedMeta {
    pub date_selected_mode: bool,
    pub selected_date: String,
    #[serde(default)]
    pub time_condition: Option<String>,
    #[serde(default)]
    pub friend_ids: Vec<String>,
    #[serde(default)]
    pub friend_names: Vec<String>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Link row recording a calendar event written for one participant.
#[derive(Clone, Debug)]
pub struct CalendarEventLink {
    pub id: String,
    pub owner_user_id: String,
    pub session_id: Option<String>,
    pub google_event_id: String,
    pub summary: String,
    pub location: Option<String>,
    pub start_at: DateTime<FixedOffset>,
    pub end_at: DateTime<FixedOffset>,
    pub html_link: Option<String>,
    pub status: String,
}

/// A per-user chat container.
#[derive(Clone, Debug)]
pub struct ChatContainer {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<FixedOffset>,
    pub updated_at: DateTime<FixedOffset>,
}

/// The persistence operations the coordinator consumes.
#[async_trait]
pub trait Store: Send + Sync {
    // users
    async fn upsert_user(&self, user: UserRecord) -> Result<(), BoxError>;
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, BoxError>;
    async fn user_names(&self, user_ids: &[String]) -> Result<HashMap<String, String>, BoxError>;

    // friendships
    async fn add_friend(&self, user_id: &str, friend_id: &str) -> Result<(), BoxError>;
    async fn friend_id_by_name(&self, user_id: &str, name: &str) -> Result<Option<String>, BoxError>;

    // sessions
    async fn create_session(&self, session: SessionRecord) -> Result<(), BoxError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, BoxError>;
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, BoxError>;
    /// Merge agreement details into the session prefs. The requested
    /// date/time are write-once: existing values win over new ones.
    async fn store_agreement(
        &self,
        session_id: &str,
        details: &AgreementDetails,
    ) -> Result<bool, BoxError>;
    async fn merge_session_prefs(
        &self,
        session_id: &str,
        thread_id: Option<&str>,
        participants: &[String],
        location: Option<&str>,
        activity: Option<&str>,
    ) -> Result<bool, BoxError>;
    async fn thread_sessions(&self, thread_id: &str) -> Result<Vec<SessionRecord>, BoxError>;
    async fn find_existing_session(
        &self,
        initiator_user_id: &str,
        target_user_id: &str,
    ) -> Result<Option<SessionRecord>, BoxError>;

    // negotiation messages
    async fn add_message(&self, message: StoredMessage) -> Result<(), BoxError>;
    async fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, BoxError>;
    /// Messages of every session grouped under the thread, deduplicated and
    /// ordered by creation time.
    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>, BoxError>;

    // chat logs
    async fn add_chat_log(&self, entry: ChatLogEntry) -> Result<(), BoxError>;
    /// Newest-first recent logs for a user, optionally scoped to one chat
    /// container.
    async fn recent_chat_logs(
        &self,
        user_id: &str,
        limit: usize,
        chat_session_id: Option<&str>,
    ) -> Result<Vec<ChatLogEntry>, BoxError>;
    /// Newest-first recent logs of one kind for a user.
    async fn recent_chat_logs_of_kind(
        &self,
        user_id: &str,
        kind: ChatLogKind,
        limit: usize,
    ) -> Result<Vec<ChatLogEntry>, BoxError>;
    async fn update_chat_log_metadata(
        &self,
        log_id: &str,
        metadata: serde_json::Value,
    ) -> Result<bool, BoxError>;

    // chat containers
    async fn create_chat_container(&self, container: ChatContainer) -> Result<(), BoxError>;
    async fn get_chat_container(&self, id: &str) -> Result<Option<ChatContainer>, BoxError>;
    async fn rename_chat_container(&self, id: &str, title: &str) -> Result<bool, BoxError>;

    // calendar links
    /// Insert a link; returns `false` (and stores nothing) when a link with
    /// the same `(google_event_id, owner_user_id)` already exists.
    async fn add_calendar_link(&self, link: CalendarEventLink) -> Result<bool, BoxError>;
    async fn calendar_links_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<CalendarEventLink>, BoxError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    friends: HashMap<String, Vec<String>>,
    sessions: HashMap<String, SessionRecord>,
    messages: Vec<StoredMessage>,
    chat_logs: Vec<ChatLogEntry>,
    chat_containers: HashMap<String, ChatContainer>,
    calendar_links: Vec<CalendarEventLink>,
}

/// In-memory [`Store`] used in tests and single-process deployments.
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn name_similarity(a: &str, b: &str) -> f32 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        0.0
    } else if a == b {
        1.0
    } else if a.starts_with(&b) || b.starts_with(&a) {
        0.8
    } else if a.contains(&b) || b.contains(&a) {
        0.6
    } else {
        0.0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_user(&self, user: UserRecord) -> Result<(), BoxError> {
        self.inner.write().await.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, BoxError> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }

    async fn user_names(&self, user_ids: &[String]) -> Result<HashMap<String, String>, BoxError> {
        let tables = self.inner.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| tables.users.get(id).map(|u| (id.clone(), u.name.clone())))
            .collect())
    }

    async fn add_friend(&self, user_id: &str, friend_id: &str) -> Result<(), BoxError> {
        let mut tables = self.inner.write().await;
        let friends = tables.friends.entry(user_id.to_string()).or_default();
        if !friends.iter().any(|f| f == friend_id) {
            friends.push(friend_id.to_string());
        }
        Ok(())
    }

    async fn friend_id_by_name(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Option<String>, BoxError> {
        let tables = self.inner.read().await;
        let Some(friend_ids) = tables.friends.get(user_id) else {
            return Ok(None);
        };
        let mut best: Option<(f32, String)> = None;
        for fid in friend_ids {
            let Some(friend) = tables.users.get(fid) else {
                continue;
            };
            let score = name_similarity(&friend.name, name);
            if score >= 0.6 && best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, fid.clone()));
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    async fn create_session(&self, session: SessionRecord) -> Result<(), BoxError> {
        self.inner
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, BoxError> {
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, BoxError> {
        let mut tables = self.inner.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) => {
                session.status = status;
                session.updated_at = now_kst();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn store_agreement(
        &self,
        session_id: &str,
        details: &AgreementDetails,
    ) -> Result<bool, BoxError> {
        let mut tables = self.inner.write().await;
        let Some(session) = tables.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        let prefs = &mut session.prefs;
        if prefs.requested_date.is_none() {
            prefs.requested_date = details.requested_date.clone();
        }
        if prefs.requested_time.is_none() {
            prefs.requested_time = details.requested_time.clone();
        }
        prefs.agreed_date = details.agreed_date.clone();
        prefs.agreed_time = details.agreed_time.clone();
        if details.location.is_some() {
            prefs.location = details.location.clone();
        }
        if details.activity.is_some() {
            prefs.activity = details.activity.clone();
        }
        prefs.agreed_at = details.agreed_at;
        session.updated_at = now_kst();
        Ok(true)
    }

    async fn merge_session_prefs(
        &self,
        session_id: &str,
        thread_id: Option<&str>,
        participants: &[String],
        location: Option<&str>,
        activity: Option<&str>,
    ) -> Result<bool, BoxError> {
        let mut tables = self.inner.write().await;
        let Some(session) = tables.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if let Some(tid) = thread_id {
            session.prefs.thread_id = Some(tid.to_string());
        }
        if !participants.is_empty() {
            session.prefs.participants = participants.to_vec();
        }
        if let Some(loc) = location {
            session.prefs.location = Some(loc.to_string());
        }
        if let Some(act) = activity {
            session.prefs.activity = Some(act.to_string());
        }
        session.updated_at = now_kst();
        Ok(true)
    }

    async fn thread_sessions(&self, thread_id: &str) -> Result<Vec<SessionRecord>, BoxError> {
        let tables = self.inner.read().await;
        let mut sessions: Vec<SessionRecord> = tables
            .sessions
            .values()
            .filter(|s| s.prefs.thread_id.as_deref() == Some(thread_id))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn find_existing_session(
        &self,
        initiator_user_id: &str,
        target_user_id: &str,
    ) -> Result<Option<SessionRecord>, BoxError> {
        let tables = self.inner.read().await;
        let mut candidates: Vec<&SessionRecord> = tables
            .sessions
            .values()
            .filter(|s| {
                s.initiator_user_id == initiator_user_id
                    && s.target_user_id.as_deref() == Some(target_user_id)
            })
            .collect();
        candidates.sort_by_key(|s| s.created_at);
        Ok(candidates.last().map(|s| (*s).clone()))
    }

    async fn add_message(&self, message: StoredMessage) -> Result<(), BoxError> {
        self.inner.write().await.messages.push(message);
        Ok(())
    }

    async fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, BoxError> {
        let tables = self.inner.read().await;
        let mut messages: Vec<StoredMessage> = tables
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>, BoxError> {
        let session_ids: Vec<String> = self
            .thread_sessions(thread_id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let tables = self.inner.read().await;
        let mut seen = std::collections::HashSet::new();
        let mut messages: Vec<StoredMessage> = tables
            .messages
            .iter()
            .filter(|m| session_ids.contains(&m.session_id) && seen.insert(m.id.clone()))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn add_chat_log(&self, entry: ChatLogEntry) -> Result<(), BoxError> {
        self.inner.write().await.chat_logs.push(entry);
        Ok(())
    }

    async fn recent_chat_logs(
        &self,
        user_id: &str,
        limit: usize,
        chat_session_id: Option<&str>,
    ) -> Result<Vec<ChatLogEntry>, BoxError> {
        let tables = self.inner.read().await;
        let mut logs: Vec<ChatLogEntry> = tables
            .chat_logs
            .iter()
            .filter(|l| {
                l.user_id == user_id
                    && (chat_session_id.is_none() || l.chat_session_id.as_deref() == chat_session_id)
            })
            .cloned()
            .collect();
        logs.sort_by_key(|l| std::cmp::Reverse(l.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn recent_chat_logs_of_kind(
        &self,
        user_id: &str,
        kind: ChatLogKind,
        limit: usize,
    ) -> Result<Vec<ChatLogEntry>, BoxError> {
        let tables = self.inner.read().await;
        let mut logs: Vec<ChatLogEntry> = tables
            .chat_logs
            .iter()
            .filter(|l| l.user_id == user_id && l.kind == kind)
            .cloned()
            .collect();
        logs.sort_by_key(|l| std::cmp::Reverse(l.created_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn update_chat_log_metadata(
        &self,
        log_id: &str,
        metadata: serde_json::Value,
    ) -> Result<bool, BoxError> {
        let mut tables = self.inner.write().await;
        for log in tables.chat_logs.iter_mut() {
            if log.id == log_id {
                log.metadata = Some(metadata);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn create_chat_container(&self, container: ChatContainer) -> Result<(), BoxError> {
        self.inner
            .write()
            .await
            .chat_containers
            .insert(container.id.clone(), container);
        Ok(())
    }

    async fn get_chat_container(&self, id: &str) -> Result<Option<ChatContainer>, BoxError> {
        Ok(self.inner.read().await.chat_containers.get(id).cloned())
    }

    async fn rename_chat_container(&self, id: &str, title: &str) -> Result<bool, BoxError> {
        let mut tables = self.inner.write().await;
        match tables.chat_containers.get_mut(id) {
            Some(container) => {
                container.title = title.to_string();
                container.updated_at = now_kst();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_calendar_link(&self, link: CalendarEventLink) -> Result<bool, BoxError> {
        let mut tables = self.inner.write().await;
        let duplicate = tables.calendar_links.iter().any(|l| {
            l.google_event_id == link.google_event_id && l.owner_user_id == link.owner_user_id
        });
        if duplicate {
            return Ok(false);
        }
        tables.calendar_links.push(link);
        Ok(true)
    }

    async fn calendar_links_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<CalendarEventLink>, BoxError> {
        let tables = self.inner.read().await;
        Ok(tables
            .calendar_links
            .iter()
            .filter(|l| l.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_similarity_ranking() {
        assert_eq!(name_similarity("민서", "민서"), 1.0);
        assert_eq!(name_similarity("김민서", "민서"), 0.6);
        assert_eq!(name_similarity("민서", "민 서"), 1.0);
        assert_eq!(name_similarity("민서", "규민"), 0.0);
    }

    #[tokio::test]
    async fn test_calendar_link_dedup() {
        let store = MemoryStore::new();
        let link = CalendarEventLink {
            id: "l1".into(),
            owner_user_id: "u1".into(),
            session_id: Some("s1".into()),
            google_event_id: "evt-1".into(),
            summary: "저녁".into(),
            location: None,
            start_at: now_kst(),
            end_at: now_kst(),
            html_link: None,
            status: "confirmed".into(),
        };
        assert!(store.add_calendar_link(link.clone()).await.unwrap());
        assert!(!store.add_calendar_link(link).await.unwrap());
    }

    #[tokio::test]
    async fn test_requested_time_is_write_once() {
        let store = MemoryStore::new();
        let session = SessionRecord {
            id: "s1".into(),
            initiator_user_id: "u1".into(),
            target_user_id: Some("u2".into()),
            participant_user_ids: vec!["u1".into(), "u2".into()],
            intent: "schedule".into(),
            status: SessionStatus::InProgress,
            time_window: None,
            prefs: SessionPrefs::default(),
            final_event_id: None,
            created_at: now_kst(),
            updated_at: now_kst(),
        };
        store.create_session(session).await.unwrap();

        let first = AgreementDetails {
            requested_date: Some("2025-12-17".into()),
            requested_time: Some("18:00".into()),
            agreed_date: Some("2025-12-17".into()),
            agreed_time: Some("19:00".into()),
            ..Default::default()
        };
        store.store_agreement("s1", &first).await.unwrap();

        let second = AgreementDetails {
            requested_date: Some("2025-12-20".into()),
            requested_time: Some("12:00".into()),
            agreed_date: Some("2025-12-20".into()),
            agreed_time: Some("13:00".into()),
            ..Default::default()
        };
        store.store_agreement("s1", &second).await.unwrap();

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.prefs.requested_date.as_deref(), Some("2025-12-17"));
        assert_eq!(session.prefs.requested_time.as_deref(), Some("18:00"));
        assert_eq!(session.prefs.agreed_time.as_deref(), Some("13:00"));
    }
}
