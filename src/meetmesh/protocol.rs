//! Agent-to-agent negotiation protocol types.
//!
//! This module defines the data shapes exchanged between per-user agents and
//! streamed to observers: message kinds, proposals, decisions, availability
//! snapshots, and the session/negotiation status vocabularies. Everything here
//! is plain data — the decision logic lives in
//! [`personal_agent`](crate::meetmesh::personal_agent) and the sequencing in
//! [`negotiation`](crate::meetmesh::negotiation).
//!
//! The wire format produced by [`NegotiationMessage::to_wire`] is what real
//! time subscribers receive and what later readers reconstruct a transcript
//! from, so its field names are stable.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Kinds of messages agents exchange during a negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// A concrete slot proposal.
    Propose,
    /// Acceptance of the current proposal.
    Accept,
    /// Outright rejection (only humans produce this).
    Reject,
    /// A counter-proposal replacing the current one.
    Counter,
    /// Availability query between agents.
    Query,
    /// Human intervention is required; the negotiation stops.
    NeedHuman,
    /// Observable intermediate state ("checking…"). Streamed, never persisted.
    Info,
    /// A conflicting participant must choose to skip or adjust.
    ConflictChoice,
    /// Waiting for a human choice after a conflict.
    AwaitingChoice,
    /// A majority-only date recommendation when no date fits everyone.
    MajorityRecommend,
}

impl MessageType {
    /// Lowercase form used as the storage key for persisted messages.
    pub fn storage_key(&self) -> &'static str {
        match self {
            MessageType::Propose => "propose",
            MessageType::Accept => "accept",
            MessageType::Reject => "reject",
            MessageType::Counter => "counter",
            MessageType::Query => "query",
            MessageType::NeedHuman => "need_human",
            MessageType::Info => "info",
            MessageType::ConflictChoice => "conflict_choice",
            MessageType::AwaitingChoice => "awaiting_choice",
            MessageType::MajorityRecommend => "majority_recommend",
        }
    }
}

/// Half-open interval `[start, end)` in the fixed civil time zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl TimeSlot {
    /// Build a slot. Callers uphold `start < end`; a reversed pair is a bug
    /// upstream, so this is debug-asserted rather than widened into a Result.
    pub fn new(start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> Self {
        debug_assert!(start < end, "TimeSlot requires start < end");
        Self { start, end }
    }

    /// Overlap test: `self.start < other.end && other.start < self.end`.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether the instant falls inside the half-open interval.
    pub fn contains(&self, instant: DateTime<FixedOffset>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Slot length in whole minutes.
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// A concrete slot an agent puts on the table.
///
/// When `duration_nights > 0` the proposal denotes the multi-day span
/// `[date, date + duration_nights + 1)`; `time` is then unused and the
/// availability test requires every covered day to be entirely free.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Civil date, `YYYY-MM-DD`.
    pub date: String,
    /// Time of day, `HH:MM` (24h).
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: i64,
    #[serde(default)]
    pub duration_nights: u32,
}

fn default_duration_minutes() -> i64 {
    60
}

impl Proposal {
    /// A one-hour, single-day proposal.
    pub fn new(date: impl Into<String>, time: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            time: time.into(),
            location: None,
            activity: None,
            duration_minutes: 60,
            duration_nights: 0,
        }
    }
}

/// The owner's overlapping event behind a COUNTER.
///
/// Used for logging and for the owner's own UI. The event name must never be
/// surfaced to other users — prose generation receives an explicit
/// instruction to withhold it, and the deterministic fallbacks never include
/// it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_start: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_end: Option<DateTime<FixedOffset>>,
    /// Display form such as "오후 6시~오후 7시" or "종일".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time_display: Option<String>,
}

/// One participant's availability at a specific instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantAvailability {
    pub user_id: String,
    pub user_name: String,
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_info: Option<ConflictInfo>,
    /// "skip" | "adjust" once the human has chosen, `None` before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
}

/// A date that works for a majority (but not all) of the participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MajorityRecommendation {
    /// Display date such as "12월 17일".
    pub date: String,
    /// "6시 이후", "14시 이전", "9시~21시" or "시간 무관".
    pub time_condition: String,
    pub available_count: usize,
    pub total_count: usize,
    pub available_names: Vec<String>,
    pub unavailable_names: Vec<String>,
    pub is_majority: bool,
}

/// The outcome of one agent decision step.
///
/// The `action` is chosen by code from calendar facts; the LLM only supplies
/// `message` prose. `reason` is an internal annotation and is not shown to
/// other users.
#[derive(Clone, Debug)]
pub struct AgentDecision {
    pub action: MessageType,
    pub proposal: Option<Proposal>,
    pub reason: Option<String>,
    pub message: String,
    pub conflict_info: Option<ConflictInfo>,
}

impl AgentDecision {
    /// Shorthand for a NEED_HUMAN escalation with a user-facing sentence.
    pub fn need_human(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: MessageType::NeedHuman,
            proposal: None,
            reason: Some(reason.into()),
            message: message.into(),
            conflict_info: None,
        }
    }
}

/// One entry of a negotiation transcript.
///
/// Persisted once per session (not once per participant) so any observer
/// reading by session sees the full ordered transcript.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NegotiationMessage {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: String,
    pub sender_name: String,
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Proposal>,
    pub message: String,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_info: Option<ConflictInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub majority_recommendation: Option<Vec<MajorityRecommendation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_availabilities: Option<Vec<ParticipantAvailability>>,
}

impl NegotiationMessage {
    /// Wire envelope redacted for one viewer: conflict event names in the
    /// availability snapshot belong to their owner and are stripped from
    /// everyone else's copy.
    pub fn to_wire_for(&self, viewer_user_id: &str) -> serde_json::Value {
        let mut msg = self.clone();
        if let Some(list) = &mut msg.participant_availabilities {
            for availability in list.iter_mut() {
                if availability.user_id != viewer_user_id {
                    availability.conflict_info = None;
                }
            }
        }
        msg.to_wire()
    }

    /// JSON envelope pushed to real-time subscribers.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "type": self.message_type,
            "sender_name": self.sender_name,
            "round": self.round,
            "proposal": self.proposal,
            "message": self.message,
            "timestamp": self.timestamp.to_rfc3339(),
            "conflict_info": self.conflict_info,
            "majority_recommendation": self.majority_recommendation,
            "participant_availabilities": self.participant_availabilities,
        })
    }
}

/// Where a negotiation currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    InProgress,
    Agreed,
    Failed,
    NeedHuman,
    AwaitingUserChoice,
}

/// Persisted session lifecycle.
///
/// Transitions are forward-only except `completed → in_progress` (a new
/// reschedule inside the same thread) and `pending_approval → in_progress`
/// (any rejection).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    PendingApproval,
    Completed,
    Failed,
    NeedsReschedule,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::PendingApproval => "pending_approval",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::NeedsReschedule => "needs_reschedule",
        }
    }
}

/// Why a negotiation handed control back to humans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanInterventionReason {
    MaxRoundsExceeded,
    Deadlock,
    NoCommonTime,
    ConflictChoiceNeeded,
}

/// Final summary of one engine run.
#[derive(Clone, Debug)]
pub struct NegotiationResult {
    pub status: NegotiationStatus,
    pub final_proposal: Option<Proposal>,
    pub intervention_reason: Option<HumanInterventionReason>,
    pub total_rounds: u32,
    pub messages: Vec<NegotiationMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meetmesh::timeparse::kst_datetime;
    use chrono::NaiveDate;

    fn slot(d: u32, h1: u32, h2: u32) -> TimeSlot {
        let day = NaiveDate::from_ymd_opt(2025, 12, d).unwrap();
        TimeSlot::new(kst_datetime(day, h1, 0), kst_datetime(day, h2, 0))
    }

    #[test]
    fn test_overlap_rule_is_half_open() {
        let a = slot(17, 18, 20);
        let b = slot(17, 20, 22);
        assert!(!a.overlaps(&b));
        let c = slot(17, 19, 21);
        assert!(a.overlaps(&c));
    }

    #[test]
    fn test_contains_excludes_end() {
        let s = slot(17, 18, 20);
        assert!(s.contains(s.start));
        assert!(!s.contains(s.end));
    }

    #[test]
    fn test_message_type_wire_names() {
        let v = serde_json::to_value(MessageType::NeedHuman).unwrap();
        assert_eq!(v, serde_json::json!("NEED_HUMAN"));
        assert_eq!(MessageType::NeedHuman.storage_key(), "need_human");
    }

    #[test]
    fn test_wire_redaction_keeps_conflicts_owner_private() {
        let msg = NegotiationMessage {
            id: "m1".into(),
            session_id: "s1".into(),
            message_type: MessageType::NeedHuman,
            sender_id: "system".into(),
            sender_name: "시스템".into(),
            round: 3,
            proposal: None,
            message: "직접 결정해주세요".into(),
            timestamp: kst_datetime(NaiveDate::from_ymd_opt(2025, 12, 17).unwrap(), 18, 0),
            conflict_info: None,
            majority_recommendation: None,
            participant_availabilities: Some(vec![ParticipantAvailability {
                user_id: "u2".into(),
                user_name: "민서".into(),
                is_available: false,
                conflict_info: Some(ConflictInfo {
                    event_name: "치과 예약".into(),
                    event_start: None,
                    event_end: None,
                    event_time_display: None,
                }),
                choice: None,
            }]),
        };

        let for_owner = msg.to_wire_for("u2").to_string();
        assert!(for_owner.contains("치과 예약"));
        let for_other = msg.to_wire_for("u1").to_string();
        assert!(!for_other.contains("치과 예약"));
    }

    #[test]
    fn test_session_status_vocabulary() {
        assert_eq!(SessionStatus::PendingApproval.as_str(), "pending_approval");
        let v = serde_json::to_value(SessionStatus::NeedsReschedule).unwrap();
        assert_eq!(v, serde_json::json!("needs_reschedule"));
    }
}
