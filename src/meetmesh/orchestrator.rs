//! The chat orchestrator: one user message in, exactly one action out.
//!
//! Every incoming message is routed through a fixed cascade:
//!
//! 1. *Time-selection mode* — a date was just picked; parse the time, check
//!    it against the stored time condition, dispatch negotiation.
//! 2. *Recommendation mode* — three candidate dates were offered; parse a
//!    "1/2/3", "M/D" or "N일" selection and move to time-selection mode.
//! 3. Intent extraction, then slot-filling questions when the hard fields
//!    (date, time) are missing.
//! 4. Recoordination detection: an unresolved rejection newer than the last
//!    full approval plus any new scheduling content restarts the prior
//!    thread; explicit friend names override and force a fresh session.
//! 5. Dispatch: direct negotiation (concrete date+time), time-selection
//!    question (date only), or recommendation mode (range or nothing).
//! 6. Personal-calendar writes for friendless requests, with conflict
//!    refusal and short-confirmation reconstruction from recent logs.
//! 7. Otherwise a free-form LLM reply.
//!
//! State between turns lives in the metadata of the orchestrator's own chat
//! logs ([`DateSelectedMeta`], [`RecommendationMeta`], …) — there is no
//! separate state table.

use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset};
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::meetmesh::availability::AvailabilityProvider;
use crate::meetmesh::calendar::{CalendarClient, CreateEventRequest, CredentialProvider};
use crate::meetmesh::approval::ApprovalCoordinator;
use crate::meetmesh::config::CoordinatorConfig;
use crate::meetmesh::error::CoordinatorError;
use crate::meetmesh::event_bus::{Envelope, EventBus};
use crate::meetmesh::intent::{IntentExtractor, ScheduleIntent};
use crate::meetmesh::negotiation::{new_thread_id, NegotiationEngine, NegotiationParams};
use crate::meetmesh::prose::ProseService;
use crate::meetmesh::protocol::{NegotiationResult, NegotiationStatus, SessionStatus};
use crate::meetmesh::store::{
    ApprovalMeta, ApprovalProposal, ApprovalResponseMeta, ChatLogEntry, ChatLogKind,
    DateSelectedMeta, RecommendationMeta, RecommendedDate, RecoordinationMeta, SessionPrefs,
    SessionRecord, Store, TimeWindow, UserRecord,
};
use crate::meetmesh::timeparse::{
    now_kst, parse_chat_date, parse_civil_date, parse_time_range, parse_time_string,
};
use crate::meetmesh::client_wrapper::ChatMessage;
use uuid::Uuid;

lazy_static! {
    static ref RE_SELECT_HOUR: Regex = Regex::new(r"(\d{1,2})\s*[시:]").unwrap();
    static ref RE_TIME_COND: Regex = Regex::new(r"(\d+)시\s*(이후|이전)").unwrap();
    static ref RE_SELECT_NUMBER: Regex = Regex::new(r"(\d{1,2})\s*번?").unwrap();
    static ref RE_SELECT_MONTH_DAY: Regex = Regex::new(r"(\d{1,2})[/월]\s*(\d{1,2})").unwrap();
    static ref RE_SELECT_DAY: Regex = Regex::new(r"(\d{1,2})일").unwrap();
    static ref RE_TITLE: Regex =
        Regex::new(r"([가-힣A-Za-z0-9]+)\s*(예약|약속|미팅|모임|회식|진료|방문)").unwrap();
}

const CONFIRM_KEYWORDS: [&str; 9] = [
    "응", "네", "네네", "그래", "등록해", "등록해줘", "맞아", "ㅇㅇ", "시작시간만",
];
const NEGATIVE_CONFIRM_KEYWORDS: [&str; 8] = [
    "아닝", "아니", "아니요", "아뇨", "몰라", "모름", "미정", "정해진거없어",
];
const TIME_REALNESS_KEYWORDS: [&str; 9] =
    ["시", "분", "오전", "오후", "아침", "점심", "저녁", "밤", "새벽"];
const TITLE_STOPWORDS: [&str; 11] = [
    "오늘", "내일", "모레", "이번주", "다음주", "점심", "저녁", "아침", "새벽", "오후", "오전",
];

/// Outcome of a personal (friendless) calendar write attempt.
#[derive(Clone, Debug)]
pub struct PersonalEventOutcome {
    pub summary: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub google_event_id: Option<String>,
    pub conflict: bool,
    pub message: Option<String>,
}

/// What one orchestrated turn produced.
#[derive(Clone, Debug, Default)]
pub struct ChatTurn {
    pub ai_response: Option<String>,
    pub a2a_started: bool,
    pub recommendation_mode: bool,
    pub date_selected_mode: bool,
    pub calendar_event: Option<PersonalEventOutcome>,
    pub thread_id: Option<String>,
    pub session_ids: Vec<String>,
}

/// The per-message state machine mediating humans and negotiations.
pub struct ChatOrchestrator {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    prose: Arc<ProseService>,
    intent: IntentExtractor,
    provider: Arc<AvailabilityProvider>,
    approval: Arc<ApprovalCoordinator>,
    calendar: Arc<dyn CalendarClient>,
    credentials: Arc<dyn CredentialProvider>,
    config: CoordinatorConfig,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        prose: Arc<ProseService>,
        provider: Arc<AvailabilityProvider>,
        approval: Arc<ApprovalCoordinator>,
        calendar: Arc<dyn CalendarClient>,
        credentials: Arc<dyn CredentialProvider>,
        config: CoordinatorConfig,
    ) -> Self {
        let intent = IntentExtractor::new(prose.clone());
        Self {
            store,
            bus,
            prose,
            intent,
            provider,
            approval,
            calendar,
            credentials,
            config,
        }
    }

    /// Process one user message and decide exactly one terminal action.
    pub async fn handle_message(
        &self,
        user_id: &str,
        message: &str,
        selected_friend_ids: &[String],
        chat_session_id: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<ChatTurn, CoordinatorError> {
        self.store
            .add_chat_log(
                ChatLogEntry::new(user_id, ChatLogKind::UserMessage)
                    .with_request(message)
                    .with_chat_session(chat_session_id),
            )
            .await
            .map_err(CoordinatorError::store)?;
        self.maybe_retitle_container(chat_session_id, message).await;

        let recent = self
            .store
            .recent_chat_logs(user_id, 3, chat_session_id)
            .await
            .map_err(CoordinatorError::store)?;

        // Mode carryover: a date was picked, we are waiting for a time.
        if let Some(ctx) = recent
            .iter()
            .filter_map(|l| l.metadata_as::<DateSelectedMeta>())
            .find(|m| m.date_selected_mode && !m.selected_date.is_empty())
        {
            if let Some(turn) = self
                .handle_time_selection(user_id, message, &ctx, chat_session_id, now)
                .await?
            {
                return Ok(turn);
            }
        }

        // Mode carryover: candidate dates were offered, parse a selection.
        if let Some(ctx) = recent
            .iter()
            .filter_map(|l| l.metadata_as::<RecommendationMeta>())
            .find(|m| m.recommendation_mode && !m.recommendations.is_empty())
        {
            if let Some(turn) = self
                .handle_recommendation_selection(user_id, message, &ctx, chat_session_id, now)
                .await?
            {
                return Ok(turn);
            }
        }

        let intent = self.intent.extract(message, now).await;
        info!("[chat] intent: {:?}", intent);
        let mut friend_names = intent.all_friend_names();

        // Slot filling: the hard fields must exist before dispatch.
        let mut missing = intent.missing_fields.clone();
        if !selected_friend_ids.is_empty() {
            missing.retain(|f| f != "friend_name" && f != "friend_names");
        }
        if intent.has_schedule_request && !missing.is_empty() && selected_friend_ids.is_empty() {
            info!("[chat] slot filling, missing: {:?}", missing);
            let question = self.prose.slot_filling_question(&missing, &intent).await;
            self.log_ai_response(user_id, &question, chat_session_id, None)
                .await?;
            return Ok(ChatTurn {
                ai_response: Some(question),
                ..Default::default()
            });
        }

        // Recoordination detection.
        let mut recoordination = self.detect_recoordination(user_id, &intent, message).await?;
        if recoordination.is_some() && !friend_names.is_empty() {
            info!("[chat] explicit friend names override recoordination");
            recoordination = None;
        }

        // Resolve friend ids.
        let mut friend_ids: Vec<String> = Vec::new();
        let mut is_schedule = intent.has_schedule_request || recoordination.is_some();
        if !selected_friend_ids.is_empty() {
            friend_ids = selected_friend_ids.to_vec();
            recoordination = None;
            is_schedule = true;
            let names = self
                .store
                .user_names(&friend_ids)
                .await
                .map_err(CoordinatorError::store)?;
            friend_names = friend_ids
                .iter()
                .map(|id| names.get(id).cloned().unwrap_or_else(|| "사용자".to_string()))
                .collect();
        } else if let Some(reco) = &recoordination {
            let recovered = self.recover_participants(user_id, reco).await?;
            friend_ids = recovered;
            if friend_ids.is_empty() {
                let text = CoordinatorError::ParticipantsUnrecoverable.to_string();
                self.log_ai_response(user_id, &text, chat_session_id, None).await?;
                return Ok(ChatTurn {
                    ai_response: Some(text),
                    ..Default::default()
                });
            }
            let names = self
                .store
                .user_names(&friend_ids)
                .await
                .map_err(CoordinatorError::store)?;
            friend_names = friend_ids
                .iter()
                .map(|id| names.get(id).cloned().unwrap_or_else(|| "사용자".to_string()))
                .collect();
        } else if is_schedule {
            for name in &friend_names {
                if let Some(fid) = self
                    .store
                    .friend_id_by_name(user_id, name)
                    .await
                    .map_err(CoordinatorError::store)?
                {
                    friend_ids.push(fid);
                }
            }
        }

        if is_schedule && !friend_ids.is_empty() {
            return self
                .handle_group_schedule(
                    user_id,
                    &intent,
                    &friend_ids,
                    &friend_names,
                    recoordination,
                    chat_session_id,
                    now,
                )
                .await;
        }

        // Personal calendar path. A message that named friends never falls
        // through to a personal write, even when no friend id resolved.
        let mut ai_response: Option<String> = None;
        let mut calendar_event: Option<PersonalEventOutcome> = None;
        if recoordination.is_none() && friend_ids.is_empty() && friend_names.is_empty() {
            let (response, event) = self
                .handle_personal_schedule(user_id, message, &intent, chat_session_id, now)
                .await?;
            ai_response = response;
            calendar_event = event;
        }

        // Free-form fallback.
        if ai_response.is_none() {
            let history = self.conversation_history(user_id, chat_session_id).await?;
            ai_response = Some(self.prose.chat_reply(message, &history, now).await);
        }

        if let Some(text) = &ai_response {
            self.log_ai_response(user_id, text, chat_session_id, None).await?;
            self.bus
                .send_to(
                    user_id,
                    Envelope::NewMessage {
                        session_id: chat_session_id.map(str::to_string),
                        sender: "ai".to_string(),
                        message: text.clone(),
                        timestamp: now_kst(),
                    },
                )
                .await;
        }

        Ok(ChatTurn {
            ai_response,
            calendar_event,
            ..Default::default()
        })
    }

    /// Time-selection mode: parse the stated hour, validate it against the
    /// stored time condition, then dispatch negotiation.
    async fn handle_time_selection(
        &self,
        user_id: &str,
        message: &str,
        ctx: &DateSelectedMeta,
        chat_session_id: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<Option<ChatTurn>, CoordinatorError> {
        let Some(caps) = RE_SELECT_HOUR.captures(message) else {
            return Ok(None);
        };
        let mut hour: u32 = caps[1].parse().unwrap_or(0);
        if message.contains("오후") && hour < 12 {
            hour += 12;
        } else if message.contains("오전") && hour == 12 {
            hour = 0;
        } else if !message.contains("오전") && !message.contains("오후") && hour < 7 {
            hour += 12;
        }
        let selected_time = format!("{:02}:00", hour.min(23));
        info!("[chat] time selection: {} -> {}", message, selected_time);

        if let Some(condition) = &ctx.time_condition {
            if let Some(cond) = RE_TIME_COND.captures(condition) {
                let cond_hour: u32 = cond[1].parse().unwrap_or(0);
                let violates = match &cond[2] {
                    "이후" => hour < cond_hour,
                    _ => hour >= cond_hour,
                };
                if violates {
                    let text =
                        format!("😅 해당 시간은 불가능해요. {}로 말씀해주세요!", condition);
                    // Keep the mode alive so the user can answer again.
                    self.log_ai_response(user_id, &text, chat_session_id, Some(serde_json::to_value(ctx).unwrap_or_default()))
                        .await?;
                    return Ok(Some(ChatTurn {
                        ai_response: Some(text),
                        date_selected_mode: true,
                        ..Default::default()
                    }));
                }
            }
        }

        let confirm = format!(
            "✅ {} {}로 상대방에게 요청을 보냈습니다. 조율 화면에서 확인해주세요!",
            ctx.selected_date, selected_time
        );
        self.log_ai_response(user_id, &confirm, chat_session_id, None).await?;

        let (thread_id, session_ids, _result) = self
            .start_negotiation(
                user_id,
                &ctx.friend_ids,
                &ctx.friend_names,
                Some(ctx.selected_date.clone()),
                Some(selected_time),
                ctx.activity.clone(),
                ctx.location.clone(),
                None,
                now,
            )
            .await?;

        Ok(Some(ChatTurn {
            ai_response: Some(confirm),
            a2a_started: true,
            thread_id: Some(thread_id),
            session_ids,
            ..Default::default()
        }))
    }

    /// Recommendation mode: parse "1/2/3", "M/D", "M월 D일" or "N일".
    async fn handle_recommendation_selection(
        &self,
        user_id: &str,
        message: &str,
        ctx: &RecommendationMeta,
        chat_session_id: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<Option<ChatTurn>, CoordinatorError> {
        let recommendations = &ctx.recommendations;
        let mut selected: Option<&RecommendedDate> = None;

        if let Some(caps) = RE_SELECT_NUMBER.captures(message) {
            if let Ok(n) = caps[1].parse::<usize>() {
                if n >= 1 && n <= recommendations.len() {
                    selected = Some(&recommendations[n - 1]);
                }
            }
        }
        if selected.is_none() {
            if let Some(caps) = RE_SELECT_MONTH_DAY.captures(message) {
                let month: u32 = caps[1].parse().unwrap_or(0);
                let day: u32 = caps[2].parse().unwrap_or(0);
                let mut year = now.year();
                if month < now.month() {
                    year += 1;
                }
                let target = format!("{}-{:02}-{:02}", year, month, day);
                selected = recommendations.iter().find(|r| r.date == target);
            }
        }
        if selected.is_none() {
            if let Some(caps) = RE_SELECT_DAY.captures(message) {
                let day: u32 = caps[1].parse().unwrap_or(0);
                selected = recommendations
                    .iter()
                    .find(|r| parse_civil_date(&r.date).map(|d| d.day()) == Some(day));
            }
        }

        let Some(selection) = selected else {
            return Ok(None);
        };
        info!("[chat] recommendation selected: {}", selection.date);

        let time_condition = if selection.condition == "시간 무관" {
            None
        } else {
            Some(selection.condition.clone())
        };
        let hint = match &time_condition {
            Some(c) => format!(" ({}로 가능해요)", c),
            None => String::new(),
        };
        let date_display = parse_civil_date(&selection.date)
            .map(|d| format!("{}/{}", d.month(), d.day()))
            .unwrap_or_else(|| selection.date.clone());
        let question = format!(
            "📅 {}로 선택하셨습니다!{}\n원하시는 시간이 있을까요? (예: 6시, 오후 2시)",
            date_display, hint
        );

        let meta = DateSelectedMeta {
            date_selected_mode: true,
            selected_date: selection.date.clone(),
            time_condition,
            friend_ids: ctx.friend_ids.clone(),
            friend_names: ctx.friend_names.clone(),
            activity: ctx.activity.clone(),
            location: ctx.location.clone(),
        };
        self.log_ai_response(
            user_id,
            &question,
            chat_session_id,
            Some(serde_json::to_value(&meta).unwrap_or_default()),
        )
        .await?;

        Ok(Some(ChatTurn {
            ai_response: Some(question),
            date_selected_mode: true,
            ..Default::default()
        }))
    }

    /// Scan recent logs for an unresolved rejection newer than the last full
    /// approval. Requires the current message to carry at least a date, a
    /// time, or any text.
    async fn detect_recoordination(
        &self,
        user_id: &str,
        intent: &ScheduleIntent,
        message: &str,
    ) -> Result<Option<RecoordinationMeta>, CoordinatorError> {
        let carries_content =
            intent.date.is_some() || intent.time.is_some() || !message.trim().is_empty();
        if !carries_content {
            return Ok(None);
        }

        let mut last_success: Option<DateTime<FixedOffset>> = None;
        for log in self
            .store
            .recent_chat_logs_of_kind(user_id, ChatLogKind::ScheduleApproval, 10)
            .await
            .map_err(CoordinatorError::store)?
        {
            if let Some(meta) = log.metadata_as::<ApprovalMeta>() {
                if meta.all_approved {
                    last_success = Some(log.created_at);
                    break;
                }
            }
        }
        let newer_than_success =
            |at: DateTime<FixedOffset>| last_success.map(|s| at >= s).unwrap_or(true);

        // 1) The user's own rejection.
        for log in self
            .store
            .recent_chat_logs_of_kind(user_id, ChatLogKind::ApprovalResponse, 5)
            .await
            .map_err(CoordinatorError::store)?
        {
            if !newer_than_success(log.created_at) {
                continue;
            }
            if let Some(meta) = log.metadata_as::<ApprovalResponseMeta>() {
                if !meta.approved && meta.thread_id.is_some() {
                    info!("[chat] recoordination (own rejection): {:?}", meta.thread_id);
                    return Ok(Some(RecoordinationMeta {
                        needs_recoordination: true,
                        thread_id: meta.thread_id,
                        session_ids: meta.session_ids,
                        rejected_by: Some(user_id.to_string()),
                        unavailable_users: Vec::new(),
                    }));
                }
            }
        }

        // 2) A rejection notice from another participant.
        for log in self
            .store
            .recent_chat_logs_of_kind(user_id, ChatLogKind::ScheduleRejection, 3)
            .await
            .map_err(CoordinatorError::store)?
        {
            if !newer_than_success(log.created_at) {
                continue;
            }
            if let Some(meta) = log.metadata_as::<RecoordinationMeta>() {
                if meta.needs_recoordination && meta.thread_id.is_some() {
                    info!("[chat] recoordination (rejection notice): {:?}", meta.thread_id);
                    return Ok(Some(meta));
                }
            }
        }

        // 3) The assistant's own "tell me a new time" follow-up.
        for log in self
            .store
            .recent_chat_logs_of_kind(user_id, ChatLogKind::AiResponse, 3)
            .await
            .map_err(CoordinatorError::store)?
        {
            if !newer_than_success(log.created_at) {
                continue;
            }
            if let Some(meta) = log.metadata_as::<RecoordinationMeta>() {
                if meta.needs_recoordination && meta.thread_id.is_some() {
                    info!("[chat] recoordination (assistant follow-up): {:?}", meta.thread_id);
                    return Ok(Some(meta));
                }
            }
        }

        Ok(None)
    }

    /// Recover the prior thread's participant set, excluding the requester.
    async fn recover_participants(
        &self,
        user_id: &str,
        reco: &RecoordinationMeta,
    ) -> Result<Vec<String>, CoordinatorError> {
        let mut sessions: Vec<SessionRecord> = Vec::new();
        for session_id in &reco.session_ids {
            if let Some(session) = self
                .store
                .get_session(session_id)
                .await
                .map_err(CoordinatorError::store)?
            {
                sessions.push(session);
            }
        }
        if sessions.is_empty() {
            if let Some(thread_id) = &reco.thread_id {
                sessions = self
                    .store
                    .thread_sessions(thread_id)
                    .await
                    .map_err(CoordinatorError::store)?;
            }
        }
        let mut participants: Vec<String> = Vec::new();
        for session in &sessions {
            for p in session.all_participants() {
                if p != user_id && !participants.contains(&p) {
                    participants.push(p);
                }
            }
        }
        Ok(participants)
    }

    /// Group scheduling: direct dispatch, time question, or recommendation.
    #[allow(clippy::too_many_arguments)]
    async fn handle_group_schedule(
        &self,
        user_id: &str,
        intent: &ScheduleIntent,
        friend_ids: &[String],
        friend_names: &[String],
        recoordination: Option<RecoordinationMeta>,
        chat_session_id: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<ChatTurn, CoordinatorError> {
        let wait_text = if friend_names.len() > 1 {
            format!(
                "🤖 {}님들의 Agent와 일정을 조율하고 있습니다...",
                friend_names.join(", ")
            )
        } else {
            format!(
                "🤖 {}님의 Agent와 일정을 조율하고 있습니다...",
                friend_names.first().map(String::as_str).unwrap_or("상대방")
            )
        };
        self.log_ai_response(user_id, &wait_text, chat_session_id, None).await?;

        let has_explicit_date = intent.start_date.is_some();
        let time_text = intent.time.clone().unwrap_or_default();
        let is_real_time = TIME_REALNESS_KEYWORDS.iter().any(|k| time_text.contains(k));
        let has_explicit_time = intent.start_time.is_some() && is_real_time;
        let is_date_range = match (&intent.start_date, &intent.end_date) {
            (Some(start), Some(end)) => start != end,
            _ => false,
        };
        info!(
            "[chat] dispatch analysis: date={} time={} range={}",
            has_explicit_date, has_explicit_time, is_date_range
        );

        // Date known, time missing: ask for the time first.
        if has_explicit_date && !has_explicit_time && !is_date_range {
            let selected_date = intent.start_date.clone().unwrap_or_default();
            let date_display = parse_civil_date(&selected_date)
                .map(|d| format!("{}/{}", d.month(), d.day()))
                .unwrap_or_else(|| selected_date.clone());
            let question = format!(
                "📅 {}로 일정을 잡으려고 해요!\n원하시는 시간이 있을까요? (예: 6시, 오후 2시)",
                date_display
            );
            let meta = DateSelectedMeta {
                date_selected_mode: true,
                selected_date,
                time_condition: None,
                friend_ids: friend_ids.to_vec(),
                friend_names: friend_names.to_vec(),
                activity: intent.activity.clone(),
                location: intent.location.clone(),
            };
            self.log_ai_response(
                user_id,
                &question,
                chat_session_id,
                Some(serde_json::to_value(&meta).unwrap_or_default()),
            )
            .await?;
            return Ok(ChatTurn {
                ai_response: Some(question),
                date_selected_mode: true,
                ..Default::default()
            });
        }

        // Concrete single-day slot: negotiate right away.
        if has_explicit_date && has_explicit_time && !is_date_range {
            let date = intent.start_date.clone();
            let time = intent.start_time.clone();
            let confirm = format!(
                "✅ {} {}로 상대방에게 요청을 보냈습니다. 조율 화면에서 확인해주세요!",
                date.as_deref().unwrap_or(""),
                time.as_deref().unwrap_or("")
            );
            self.log_ai_response(user_id, &confirm, chat_session_id, None).await?;

            let reuse = recoordination
                .as_ref()
                .map(|r| (r.thread_id.clone(), r.session_ids.clone()));
            let (thread_id, session_ids, _result) = self
                .start_negotiation(
                    user_id,
                    friend_ids,
                    friend_names,
                    date,
                    time,
                    intent.activity.clone(),
                    intent.location.clone(),
                    reuse,
                    now,
                )
                .await?;
            return Ok(ChatTurn {
                ai_response: Some(confirm),
                a2a_started: true,
                thread_id: Some(thread_id),
                session_ids,
                ..Default::default()
            });
        }

        // Fresh request with a range (or nothing): recommendation mode.
        // Recoordination with partial information instead restarts the
        // thread with whatever the user stated.
        let Some(reco) = recoordination else {
            return self
                .offer_recommendations(user_id, intent, friend_ids, friend_names, chat_session_id, now)
                .await;
        };
        for session_id in &reco.session_ids {
            let _ = self
                .store
                .update_session_status(session_id, SessionStatus::InProgress)
                .await;
        }
        let (thread_id, session_ids, _result) = self
            .start_negotiation(
                user_id,
                friend_ids,
                friend_names,
                intent.start_date.clone().or_else(|| intent.date.clone()),
                intent.start_time.clone().or_else(|| intent.time.clone()),
                intent.activity.clone(),
                intent.location.clone(),
                Some((reco.thread_id.clone(), reco.session_ids.clone())),
                now,
            )
            .await?;
        Ok(ChatTurn {
            ai_response: Some(wait_text),
            a2a_started: true,
            thread_id: Some(thread_id),
            session_ids,
            ..Default::default()
        })
    }

    /// Compute and present the top-3 candidate dates for the cohort.
    async fn offer_recommendations(
        &self,
        user_id: &str,
        intent: &ScheduleIntent,
        friend_ids: &[String],
        friend_names: &[String],
        chat_session_id: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<ChatTurn, CoordinatorError> {
        let range_start = intent
            .start_date
            .as_deref()
            .and_then(parse_civil_date)
            .map(|d| crate::meetmesh::timeparse::kst_datetime(d, 0, 0))
            .unwrap_or(now);
        let range_end = intent
            .end_date
            .as_deref()
            .and_then(parse_civil_date)
            .map(|d| crate::meetmesh::timeparse::kst_datetime(d, 23, 0))
            .unwrap_or(range_start + chrono::Duration::days(self.config.recommendation_window_days));
        let preferred_hour = intent
            .start_time
            .as_deref()
            .and_then(|t| t.split(':').next())
            .and_then(|h| h.parse::<u32>().ok());

        let mut engine = self.build_engine(
            NegotiationParams {
                session_id: "analysis".to_string(),
                thread_id: None,
                all_session_ids: Vec::new(),
                initiator_user_id: user_id.to_string(),
                participant_user_ids: friend_ids.to_vec(),
                activity: intent.activity.clone(),
                location: intent.location.clone(),
                target_date: None,
                target_time: None,
                duration_nights: 0,
            },
            now,
        );
        let availabilities = engine.collect_all_availabilities(range_start, range_end).await;
        let intersections = engine.find_intersection_slots(&availabilities, preferred_hour);
        let recommendations = engine.recommend_best_dates(&intersections, 3);

        if recommendations.is_empty() {
            let text =
                "😅 안타깝게도 해당 기간에 모든 분이 가능한 시간이 없어요. 기간을 넓혀서 다시 찾아볼까요?";
            self.log_ai_response(user_id, text, chat_session_id, None).await?;
            return Ok(ChatTurn {
                ai_response: Some(text.to_string()),
                ..Default::default()
            });
        }

        let mut lines = vec!["📅 일정 조율 결과 추천 날짜입니다:\n".to_string()];
        for (i, rec) in recommendations.iter().enumerate() {
            lines.push(format!("{}️⃣ {}", i + 1, rec.display_text));
        }
        lines.push("\n번호나 날짜로 선택해주세요!".to_string());
        let text = lines.join("\n");

        let meta = RecommendationMeta {
            recommendation_mode: true,
            recommendations: recommendations
                .iter()
                .map(|r| RecommendedDate {
                    date: r.date.clone(),
                    condition: r.condition.clone(),
                })
                .collect(),
            friend_ids: friend_ids.to_vec(),
            friend_names: friend_names.to_vec(),
            activity: intent.activity.clone(),
            location: intent.location.clone(),
        };
        self.log_ai_response(
            user_id,
            &text,
            chat_session_id,
            Some(serde_json::to_value(&meta).unwrap_or_default()),
        )
        .await?;

        Ok(ChatTurn {
            ai_response: Some(text),
            recommendation_mode: true,
            ..Default::default()
        })
    }

    /// Create (or revive) the session group and run the negotiation.
    #[allow(clippy::too_many_arguments)]
    async fn start_negotiation(
        &self,
        user_id: &str,
        friend_ids: &[String],
        friend_names: &[String],
        date: Option<String>,
        time: Option<String>,
        activity: Option<String>,
        location: Option<String>,
        reuse: Option<(Option<String>, Vec<String>)>,
        now: DateTime<FixedOffset>,
    ) -> Result<(String, Vec<String>, NegotiationResult), CoordinatorError> {
        let (thread_id, session_ids) = match reuse {
            Some((thread, sessions)) if !sessions.is_empty() => {
                let thread = thread.unwrap_or_else(new_thread_id);
                for session_id in &sessions {
                    let _ = self
                        .store
                        .update_session_status(session_id, SessionStatus::InProgress)
                        .await;
                }
                (thread, sessions)
            }
            _ => self
                .ensure_sessions(user_id, friend_ids, date.as_deref(), time.as_deref(), activity.as_deref(), location.as_deref())
                .await?,
        };

        let params = NegotiationParams {
            session_id: session_ids
                .first()
                .cloned()
                .ok_or(CoordinatorError::SessionNotFound)?,
            thread_id: Some(thread_id.clone()),
            all_session_ids: session_ids.clone(),
            initiator_user_id: user_id.to_string(),
            participant_user_ids: friend_ids.to_vec(),
            activity: activity.clone(),
            location: location.clone(),
            target_date: date.clone(),
            target_time: time.clone(),
            duration_nights: 0,
        };
        let engine = self.build_engine(params, now);
        let result = engine.run().await;

        if result.status == NegotiationStatus::Agreed {
            if let Some(proposal) = &result.final_proposal {
                let initiator_name = self
                    .store
                    .find_user(user_id)
                    .await
                    .map_err(CoordinatorError::store)?
                    .map(|u| u.name)
                    .unwrap_or_else(|| "사용자".to_string());
                let mut participant_ids = vec![user_id.to_string()];
                participant_ids.extend(friend_ids.iter().cloned());
                let mut participant_names = vec![initiator_name.clone()];
                participant_names.extend(friend_names.iter().cloned());

                let (start, end) = parse_time_string(
                    &proposal.time,
                    &format!("{} {}", proposal.date, proposal.time),
                    now,
                );
                let approval_proposal = ApprovalProposal {
                    date: Some(proposal.date.clone()),
                    time: Some(proposal.time.clone()),
                    location: proposal.location.clone(),
                    participants: participant_names,
                    start_time: Some(start.to_rfc3339()),
                    end_time: Some(end.to_rfc3339()),
                };
                self.approval
                    .request_approvals(
                        Some(&thread_id),
                        &session_ids,
                        &approval_proposal,
                        &participant_ids,
                        &initiator_name,
                    )
                    .await?;
            }
        }

        Ok((thread_id, session_ids, result))
    }

    /// Reuse existing per-target sessions where possible, create the rest,
    /// and group them all under one thread id.
    async fn ensure_sessions(
        &self,
        user_id: &str,
        friend_ids: &[String],
        date: Option<&str>,
        time: Option<&str>,
        activity: Option<&str>,
        location: Option<&str>,
    ) -> Result<(String, Vec<String>), CoordinatorError> {
        let mut existing: Vec<(String, Option<SessionRecord>)> = Vec::new();
        for friend_id in friend_ids {
            let found = self
                .store
                .find_existing_session(user_id, friend_id)
                .await
                .map_err(CoordinatorError::store)?;
            existing.push((friend_id.clone(), found));
        }
        let thread_id = existing
            .iter()
            .filter_map(|(_, s)| s.as_ref().and_then(|s| s.prefs.thread_id.clone()))
            .next()
            .unwrap_or_else(new_thread_id);

        let mut session_ids = Vec::new();
        for (friend_id, found) in existing {
            match found {
                Some(session) => {
                    // Completed sessions revive; everything else re-enters.
                    self.store
                        .update_session_status(&session.id, SessionStatus::InProgress)
                        .await
                        .map_err(CoordinatorError::store)?;
                    self.store
                        .merge_session_prefs(&session.id, Some(&thread_id), friend_ids, location, activity)
                        .await
                        .map_err(CoordinatorError::store)?;
                    session_ids.push(session.id);
                }
                None => {
                    let mut participant_user_ids = vec![user_id.to_string()];
                    participant_user_ids.extend(friend_ids.iter().cloned());
                    let session = SessionRecord {
                        id: Uuid::new_v4().to_string(),
                        initiator_user_id: user_id.to_string(),
                        target_user_id: Some(friend_id.clone()),
                        participant_user_ids,
                        intent: "schedule".to_string(),
                        status: SessionStatus::InProgress,
                        time_window: if date.is_some() || time.is_some() {
                            Some(TimeWindow {
                                date: date.map(str::to_string),
                                time: time.map(str::to_string),
                                duration_minutes: 60,
                            })
                        } else {
                            None
                        },
                        prefs: SessionPrefs {
                            summary: activity.map(str::to_string),
                            thread_id: Some(thread_id.clone()),
                            participants: friend_ids.to_vec(),
                            location: location.map(str::to_string),
                            activity: activity.map(str::to_string),
                            ..Default::default()
                        },
                        final_event_id: None,
                        created_at: now_kst(),
                        updated_at: now_kst(),
                    };
                    session_ids.push(session.id.clone());
                    self.store
                        .create_session(session)
                        .await
                        .map_err(CoordinatorError::store)?;
                }
            }
        }
        Ok((thread_id, session_ids))
    }

    fn build_engine(&self, params: NegotiationParams, now: DateTime<FixedOffset>) -> NegotiationEngine {
        NegotiationEngine::new(
            params,
            self.store.clone(),
            self.bus.clone(),
            self.provider.clone(),
            self.prose.clone(),
            self.config.clone(),
            now,
        )
    }

    /// Personal (friendless) scheduling: direct writes, confirmations, and
    /// history reconstruction.
    async fn handle_personal_schedule(
        &self,
        user_id: &str,
        message: &str,
        intent: &ScheduleIntent,
        chat_session_id: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<(Option<String>, Option<PersonalEventOutcome>), CoordinatorError> {
        let trimmed = message.trim();
        let is_confirmation = CONFIRM_KEYWORDS.contains(&trimmed)
            || NEGATIVE_CONFIRM_KEYWORDS.contains(&trimmed)
            || ["등록", "좋아", "그거로", "시작시간만"]
                .iter()
                .any(|k| message.contains(k));

        // Case 1: the message itself carries date and time.
        if intent.has_schedule_request && intent.date.is_some() && intent.time.is_some() {
            let time_text = intent.time.clone().unwrap_or_default();
            let has_range = ["부터", "까지", "~", "-"].iter().any(|x| time_text.contains(x));
            let force = ["시작시간만", "시작 시간만", "그냥 등록", "바로 등록"]
                .iter()
                .any(|x| message.contains(x));
            if has_range || force {
                let outcome = self.write_personal_event(user_id, intent, message, now).await;
                return Ok(self.personal_outcome_response(outcome));
            }
            info!("[chat] single instant ('{}') — deferring to ask for an end time", time_text);
            return Ok((None, None));
        }

        // Case 2: a bare confirmation — rebuild the schedule from history.
        if is_confirmation {
            info!("[chat] confirmation '{}' — reconstructing from history", trimmed);
            let collected = self.collect_from_history(user_id, chat_session_id, now).await?;
            if collected.date.is_some() && collected.time.is_some() {
                let outcome = self
                    .write_personal_event(user_id, &collected, message, now)
                    .await;
                return Ok(self.personal_outcome_response(outcome));
            }
            if let Some(date) = &collected.date {
                return Ok((
                    Some(format!(
                        "날짜는 {}로 확인했어요. 몇 시에 시작하는 일정인가요?",
                        date
                    )),
                    None,
                ));
            }
            return Ok((None, None));
        }

        // Case 3: a time without a date — pull the date from history.
        if intent.time.is_some() && intent.date.is_none() {
            let mut collected = self.collect_from_history(user_id, chat_session_id, now).await?;
            collected.time = intent.time.clone();
            collected.title = intent.title.clone().or(collected.title);
            collected.activity = intent.activity.clone().or(collected.activity);
            collected.location = intent.location.clone().or(collected.location);
            if collected.date.is_some() {
                let outcome = self
                    .write_personal_event(user_id, &collected, message, now)
                    .await;
                return Ok(self.personal_outcome_response(outcome));
            }
        }

        Ok((None, None))
    }

    fn personal_outcome_response(
        &self,
        outcome: Option<PersonalEventOutcome>,
    ) -> (Option<String>, Option<PersonalEventOutcome>) {
        match outcome {
            Some(event) if event.conflict => {
                let text = format!("⚠️ {}", event.message.clone().unwrap_or_default());
                (Some(text), Some(event))
            }
            Some(event) => {
                let text = format!("✅ 일정이 추가되었습니다: {}", event.summary);
                (Some(text), Some(event))
            }
            None => (None, None),
        }
    }

    /// Merge scheduling fields found in the recent conversation.
    async fn collect_from_history(
        &self,
        user_id: &str,
        chat_session_id: Option<&str>,
        now: DateTime<FixedOffset>,
    ) -> Result<ScheduleIntent, CoordinatorError> {
        let logs = self
            .store
            .recent_chat_logs(user_id, 10, chat_session_id)
            .await
            .map_err(CoordinatorError::store)?;
        let mut collected = ScheduleIntent::default();
        for log in logs {
            let text = log
                .request_text
                .clone()
                .or(log.response_text.clone())
                .unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            let found = self.intent.extract(&text, now).await;
            if collected.date.is_none() {
                collected.date = found.date;
            }
            if collected.time.is_none() {
                collected.time = found.time;
            }
            if collected.title.is_none() {
                collected.title = found.title;
            }
            if collected.activity.is_none() {
                collected.activity = found.activity;
            }
            if collected.location.is_none() {
                collected.location = found.location;
            }
        }
        collected.has_schedule_request = true;
        info!("[chat] collected from history: {:?}", collected);
        Ok(collected)
    }

    /// Write one event into the requester's own calendar, refusing on
    /// conflicts (the conflict summary names the owner's events — they are
    /// the owner's to see).
    async fn write_personal_event(
        &self,
        user_id: &str,
        intent: &ScheduleIntent,
        original_text: &str,
        now: DateTime<FixedOffset>,
    ) -> Option<PersonalEventOutcome> {
        let date_text = intent.date.clone().unwrap_or_default();
        let time_text = intent.time.clone().unwrap_or_default();

        let start_day = parse_chat_date(&date_text, now);
        let (start, end) = parse_time_range(&time_text, original_text, start_day.date_naive());
        if start == end {
            info!("[chat] no end time stated — zero-length event at {}", start);
        }

        let title = intent.title.clone().or_else(|| {
            RE_TITLE.captures_iter(original_text).find_map(|caps| {
                let word = caps[1].to_string();
                if TITLE_STOPWORDS.contains(&word.as_str()) {
                    None
                } else {
                    Some(format!("{} {}", word, &caps[2]))
                }
            })
        });
        let summary = title
            .or_else(|| intent.activity.clone())
            .unwrap_or_else(|| {
                if original_text.is_empty() {
                    "일정".to_string()
                } else {
                    original_text.to_string()
                }
            });

        let token = match self.credentials.access_token(user_id).await {
            Some(token) => token,
            None => {
                warn!("[chat] {}: no credentials for personal write", user_id);
                return None;
            }
        };

        // Conflict scan over the target day, all-day events included.
        let day = start.date_naive();
        let day_start = crate::meetmesh::timeparse::kst_datetime(day, 0, 0);
        let day_end = crate::meetmesh::timeparse::kst_datetime(day, 23, 59);
        match self.calendar.list_events(&token, day_start, day_end).await {
            Ok(events) => {
                let conflicting: Vec<String> = events
                    .iter()
                    .filter(|e| e.all_day || (start < e.end && end > e.start))
                    .map(|e| e.summary.clone())
                    .take(3)
                    .collect();
                if !conflicting.is_empty() {
                    let user_name = self
                        .store
                        .find_user(user_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|u| u.name)
                        .unwrap_or_else(|| "회원".to_string());
                    warn!("[chat] conflicting events found: {:?}", conflicting);
                    return Some(PersonalEventOutcome {
                        summary,
                        start,
                        end,
                        google_event_id: None,
                        conflict: true,
                        message: Some(format!(
                            "{}님은 그 시간에 '{}' 일정이 있어요. 다른 시간을 선택해 주세요!",
                            user_name,
                            conflicting.join(", ")
                        )),
                    });
                }
            }
            Err(err) => warn!("[chat] conflict scan failed, proceeding: {}", err),
        }

        let request = CreateEventRequest {
            summary: summary.clone(),
            description: Some("일정 비서가 추가한 일정".to_string()),
            location: intent.location.clone(),
            start,
            end,
            attendees: Vec::new(),
        };
        match self.calendar.create_event(&token, &request).await {
            Ok(created) => {
                info!("[chat] personal event written: {} ({})", summary, created.id);
                Some(PersonalEventOutcome {
                    summary,
                    start,
                    end,
                    google_event_id: Some(created.id),
                    conflict: false,
                    message: None,
                })
            }
            Err(err) => {
                warn!("[chat] personal event write failed: {}", err);
                None
            }
        }
    }

    async fn conversation_history(
        &self,
        user_id: &str,
        chat_session_id: Option<&str>,
    ) -> Result<Vec<ChatMessage>, CoordinatorError> {
        let mut logs = self
            .store
            .recent_chat_logs(user_id, 10, chat_session_id)
            .await
            .map_err(CoordinatorError::store)?;
        logs.reverse();
        let mut history = Vec::new();
        for log in logs {
            match log.kind {
                ChatLogKind::UserMessage => {
                    if let Some(text) = log.request_text {
                        history.push(ChatMessage::user(text));
                    }
                }
                ChatLogKind::AiResponse => {
                    if let Some(text) = log.response_text {
                        history.push(ChatMessage::assistant(text));
                    }
                }
                _ => {}
            }
        }
        Ok(history)
    }

    async fn log_ai_response(
        &self,
        user_id: &str,
        text: &str,
        chat_session_id: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), CoordinatorError> {
        let mut entry = ChatLogEntry::new(user_id, ChatLogKind::AiResponse)
            .with_response(text)
            .with_chat_session(chat_session_id);
        entry.metadata = metadata;
        self.store
            .add_chat_log(entry)
            .await
            .map_err(CoordinatorError::store)
    }

    async fn maybe_retitle_container(&self, chat_session_id: Option<&str>, message: &str) {
        let Some(id) = chat_session_id else {
            return;
        };
        match self.store.get_chat_container(id).await {
            Ok(Some(container)) if container.title.trim() == "새 채팅" => {
                let title: String = message.chars().take(20).collect();
                let title = if message.chars().count() > 20 {
                    format!("{}...", title)
                } else {
                    title
                };
                let _ = self.store.rename_chat_container(id, &title).await;
            }
            _ => {}
        }
    }

    /// Register a user, convenience for embedding applications.
    pub async fn register_user(&self, id: &str, name: &str) -> Result<(), CoordinatorError> {
        self.store
            .upsert_user(UserRecord {
                id: id.to_string(),
                name: name.to_string(),
                email: None,
            })
            .await
            .map_err(CoordinatorError::store)
    }
}
