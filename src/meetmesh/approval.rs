//! Human approval aggregation and calendar finalization.
//!
//! Unanimous agent agreement is necessary but not sufficient: every human
//! participant must approve before anything touches a calendar. The
//! coordinator aggregates approvals per thread and, once complete, writes one
//! owner-local event per participant.
//!
//! The correctness-critical rule: the approval count is never trusted from a
//! cached `approved_by_list` — it is recomputed on every call by a fresh scan
//! of each participant's most recent approval-request log. Concurrent
//! approvals from different participants are serialized by a per-thread
//! mutex, and the mutex is never held across calendar HTTP calls; duplicate
//! writes are prevented by the `(google_event_id, owner)` link uniqueness
//! plus a per-session owner check.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset};
use log::{error, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::meetmesh::calendar::{CalendarClient, CreateEventRequest, CredentialProvider};
use crate::meetmesh::error::CoordinatorError;
use crate::meetmesh::event_bus::{Envelope, EventBus};
use crate::meetmesh::protocol::SessionStatus;
use crate::meetmesh::store::{
    A2aMessageKind, ApprovalMeta, ApprovalProposal, ApprovalResponseMeta, CalendarEventLink,
    ChatLogEntry, ChatLogKind, MessagePayload, RecoordinationMeta, SessionRecord, Store,
    StoredMessage,
};
use crate::meetmesh::timeparse::{now_kst, parse_time_string};

/// What one approval/rejection call accomplished.
#[derive(Clone, Debug)]
pub struct ApprovalOutcome {
    pub all_approved: bool,
    pub approved_by: Vec<String>,
    pub failed_users: Vec<String>,
    pub message: String,
}

/// Aggregates per-user approvals and fans out the confirmed event.
pub struct ApprovalCoordinator {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    calendar: Arc<dyn CalendarClient>,
    credentials: Arc<dyn CredentialProvider>,
    thread_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ApprovalCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        calendar: Arc<dyn CalendarClient>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            store,
            bus,
            calendar,
            credentials,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for_thread(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.thread_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Post the approval-request message into every participant's chat.
    pub async fn request_approvals(
        &self,
        thread_id: Option<&str>,
        session_ids: &[String],
        proposal: &ApprovalProposal,
        participant_ids: &[String],
        initiator_name: &str,
    ) -> Result<(), CoordinatorError> {
        let names = self
            .store
            .user_names(participant_ids)
            .await
            .map_err(CoordinatorError::store)?;

        for user_id in participant_ids {
            let user_name = names.get(user_id).cloned().unwrap_or_default();
            let others: Vec<String> = proposal
                .participants
                .iter()
                .filter(|p| **p != user_name)
                .cloned()
                .collect();
            let participants_str = if others.is_empty() {
                initiator_name.to_string()
            } else {
                others.join(", ")
            };

            let mut text = format!(
                "✅ 약속 확정: {} {}",
                proposal.date.as_deref().unwrap_or(""),
                proposal.time.as_deref().unwrap_or("")
            );
            if let Some(location) = &proposal.location {
                text.push_str(&format!(" / {}", location));
            }
            text.push_str(&format!(
                "\n참여자: {}\n확정하시겠습니까?",
                participants_str
            ));

            let meta = ApprovalMeta {
                proposal: proposal.clone(),
                thread_id: thread_id.map(str::to_string),
                session_ids: session_ids.to_vec(),
                needs_approval: true,
                ..Default::default()
            };
            let entry = ChatLogEntry::new(user_id, ChatLogKind::ScheduleApproval)
                .with_response(text)
                .with_metadata(&meta);
            self.store
                .add_chat_log(entry)
                .await
                .map_err(CoordinatorError::store)?;
        }
        info!(
            "[approval] approval requests posted: thread={:?} participants={}",
            thread_id,
            participant_ids.len()
        );
        Ok(())
    }

    /// Handle one participant's approve/reject.
    pub async fn handle_approval(
        &self,
        thread_id: Option<&str>,
        session_ids: &[String],
        user_id: &str,
        approved: bool,
        proposal: &ApprovalProposal,
        now: DateTime<FixedOffset>,
    ) -> Result<ApprovalOutcome, CoordinatorError> {
        let lock_key = thread_id
            .map(str::to_string)
            .or_else(|| session_ids.first().cloned())
            .unwrap_or_default();
        let lock = self.lock_for_thread(&lock_key).await;
        let _guard = lock.lock().await;

        let sessions = self.load_sessions(thread_id, session_ids).await?;
        if sessions.is_empty() {
            return Err(CoordinatorError::SessionNotFound);
        }

        let mut participants: Vec<String> = Vec::new();
        for session in &sessions {
            for p in session.all_participants() {
                if !participants.contains(&p) {
                    participants.push(p);
                }
            }
        }
        if participants.len() < 2 {
            warn!("[approval] only {} participant(s); instant approval possible", participants.len());
        }

        let user_name = self
            .store
            .find_user(user_id)
            .await
            .map_err(CoordinatorError::store)?
            .map(|u| u.name)
            .unwrap_or_else(|| "사용자".to_string());

        // Record the caller's own response before scanning.
        let response_meta = ApprovalResponseMeta {
            approved,
            thread_id: thread_id.map(str::to_string),
            session_ids: session_ids.to_vec(),
        };
        self.store
            .add_chat_log(
                ChatLogEntry::new(user_id, ChatLogKind::ApprovalResponse)
                    .with_metadata(&response_meta),
            )
            .await
            .map_err(CoordinatorError::store)?;

        if approved {
            self.handle_approve(&sessions, &participants, user_id, &user_name, proposal, now)
                .await
        } else {
            self.handle_reject(thread_id, session_ids, &sessions, &participants, user_id, &user_name)
                .await
        }
    }

    async fn handle_approve(
        &self,
        sessions: &[SessionRecord],
        participants: &[String],
        user_id: &str,
        user_name: &str,
        proposal: &ApprovalProposal,
        now: DateTime<FixedOffset>,
    ) -> Result<ApprovalOutcome, CoordinatorError> {
        // Fresh scan: the requesting user counts, plus every participant
        // whose latest approval-request log records their own approval.
        let mut approved_set: Vec<String> = vec![user_id.to_string()];
        for participant_id in participants {
            if participant_id == user_id {
                continue;
            }
            let logs = self
                .store
                .recent_chat_logs_of_kind(participant_id, ChatLogKind::ScheduleApproval, 1)
                .await
                .map_err(CoordinatorError::store)?;
            if let Some(log) = logs.first() {
                if let Some(meta) = log.metadata_as::<ApprovalMeta>() {
                    if meta.approved_by.as_deref() == Some(participant_id.as_str()) {
                        approved_set.push(participant_id.clone());
                    }
                }
            }
        }
        let all_approved = approved_set.len() >= participants.len();
        info!(
            "[approval] recount: {}/{} approved ({:?})",
            approved_set.len(),
            participants.len(),
            approved_set
        );

        // Sync every participant's approval-request metadata for the UI.
        for participant_id in participants {
            let logs = self
                .store
                .recent_chat_logs_of_kind(participant_id, ChatLogKind::ScheduleApproval, 1)
                .await
                .map_err(CoordinatorError::store)?;
            if let Some(log) = logs.first() {
                let mut meta = log.metadata_as::<ApprovalMeta>().unwrap_or_default();
                meta.approved_by_list = approved_set.clone();
                meta.all_approved = all_approved;
                if participant_id == user_id {
                    meta.approved_by = Some(user_id.to_string());
                    meta.approved_at = Some(now_kst().to_rfc3339());
                }
                if let Ok(value) = serde_json::to_value(&meta) {
                    self.store
                        .update_chat_log_metadata(&log.id, value)
                        .await
                        .map_err(CoordinatorError::store)?;
                }
            }
        }

        let mut text = format!("{}님이 일정을 승인했습니다.", user_name);
        if all_approved {
            text.push_str(" (전원 승인 완료 - 캘린더 등록 중...)");
        } else {
            let remaining = participants.len() - approved_set.len();
            text.push_str(&format!(" (남은 승인: {}명)", remaining));
        }
        self.post_to_sessions(sessions, user_id, A2aMessageKind::Confirm, &text)
            .await?;

        if !all_approved {
            return Ok(ApprovalOutcome {
                all_approved: false,
                approved_by: approved_set,
                failed_users: Vec::new(),
                message: "승인이 처리되었습니다.".to_string(),
            });
        }

        // Full approval: write one owner-local event per participant.
        let (start, end) = resolve_event_times(proposal, now);
        let mut failed_users = Vec::new();
        let primary_session = sessions.first().map(|s| s.id.clone());
        let already_written: Vec<String> = match &primary_session {
            Some(session_id) => self
                .store
                .calendar_links_for_session(session_id)
                .await
                .map_err(CoordinatorError::store)?
                .into_iter()
                .map(|link| link.owner_user_id)
                .collect(),
            None => Vec::new(),
        };

        let mut summary = format!(
            "{} 등과 미팅",
            proposal
                .participants
                .first()
                .cloned()
                .unwrap_or_else(|| "미팅".to_string())
        );
        if let Some(location) = &proposal.location {
            summary.push_str(&format!(" ({})", location));
        }

        for participant_id in participants {
            if already_written.contains(participant_id) {
                continue;
            }
            let participant_name = self
                .store
                .find_user(participant_id)
                .await
                .map_err(CoordinatorError::store)?
                .map(|u| u.name)
                .unwrap_or_else(|| "사용자".to_string());

            let Some(token) = self.credentials.access_token(participant_id).await else {
                error!("[approval] {}: token refresh failed, skipping write", participant_id);
                failed_users.push(participant_name);
                continue;
            };

            let request = CreateEventRequest {
                summary: summary.clone(),
                description: Some("일정 비서가 자동 생성한 일정입니다.".to_string()),
                location: proposal.location.clone(),
                start,
                end,
                // Owner-local events: no attendees, no duplicate invites.
                attendees: Vec::new(),
            };
            match self.calendar.create_event(&token, &request).await {
                Ok(created) => {
                    let link = CalendarEventLink {
                        id: Uuid::new_v4().to_string(),
                        owner_user_id: participant_id.clone(),
                        session_id: primary_session.clone(),
                        google_event_id: created.id,
                        summary: summary.clone(),
                        location: proposal.location.clone(),
                        start_at: start,
                        end_at: end,
                        html_link: created.html_link,
                        status: "confirmed".to_string(),
                    };
                    if !self
                        .store
                        .add_calendar_link(link)
                        .await
                        .map_err(CoordinatorError::store)?
                    {
                        warn!("[approval] duplicate event link for {}", participant_id);
                    }
                }
                Err(err) => {
                    error!("[approval] calendar write failed for {}: {}", participant_id, err);
                    failed_users.push(participant_name);
                }
            }
        }

        let final_text = if failed_users.is_empty() {
            "모든 참여자의 캘린더에 일정이 정상 등록되었습니다.".to_string()
        } else {
            format!(
                "일정이 확정되었으나, 다음 사용자의 캘린더 등록에 실패했습니다: {}. (권한/로그인 확인 필요)",
                failed_users.join(", ")
            )
        };
        self.post_to_sessions(sessions, user_id, A2aMessageKind::Final, &final_text)
            .await?;

        for session in sessions {
            self.store
                .update_session_status(&session.id, SessionStatus::Completed)
                .await
                .map_err(CoordinatorError::store)?;
        }
        self.bus
            .broadcast(
                &participants.to_vec(),
                Envelope::notification("일정 확정", final_text.clone()),
            )
            .await;

        Ok(ApprovalOutcome {
            all_approved: true,
            approved_by: approved_set,
            failed_users,
            message: final_text,
        })
    }

    async fn handle_reject(
        &self,
        thread_id: Option<&str>,
        session_ids: &[String],
        sessions: &[SessionRecord],
        participants: &[String],
        user_id: &str,
        user_name: &str,
    ) -> Result<ApprovalOutcome, CoordinatorError> {
        let reject_text = format!("{}님이 일정을 거절했습니다. 재조율을 진행합니다.", user_name);
        self.post_to_sessions(sessions, user_id, A2aMessageKind::ScheduleRejection, &reject_text)
            .await?;

        let reco_meta = RecoordinationMeta {
            needs_recoordination: true,
            thread_id: thread_id.map(str::to_string),
            session_ids: session_ids.to_vec(),
            rejected_by: Some(user_id.to_string()),
            unavailable_users: Vec::new(),
        };

        for participant_id in participants {
            if participant_id == user_id {
                self.store
                    .add_chat_log(
                        ChatLogEntry::new(participant_id, ChatLogKind::System)
                            .with_response("일정을 거절했습니다."),
                    )
                    .await
                    .map_err(CoordinatorError::store)?;
                self.store
                    .add_chat_log(
                        ChatLogEntry::new(participant_id, ChatLogKind::AiResponse)
                            .with_response(
                                "재조율을 위해 원하시는 날짜와 시간을 말씀해 주세요.\n(예: 내일 오후 5시)",
                            )
                            .with_metadata(&reco_meta),
                    )
                    .await
                    .map_err(CoordinatorError::store)?;
                continue;
            }
            self.store
                .add_chat_log(
                    ChatLogEntry::new(participant_id, ChatLogKind::ScheduleRejection)
                        .with_response(format!(
                            "{}\n상대방이 새로운 시간을 입력하면 다시 알려드리겠습니다.",
                            reject_text
                        ))
                        .with_metadata(&reco_meta),
                )
                .await
                .map_err(CoordinatorError::store)?;

            // Disable the approve/reject buttons on the stale request.
            let logs = self
                .store
                .recent_chat_logs_of_kind(participant_id, ChatLogKind::ScheduleApproval, 1)
                .await
                .map_err(CoordinatorError::store)?;
            if let Some(log) = logs.first() {
                let mut meta = log.metadata_as::<ApprovalMeta>().unwrap_or_default();
                meta.needs_approval = false;
                if let Ok(value) = serde_json::to_value(&meta) {
                    let _ = self.store.update_chat_log_metadata(&log.id, value).await;
                }
            }
        }

        for session in sessions {
            self.store
                .update_session_status(&session.id, SessionStatus::InProgress)
                .await
                .map_err(CoordinatorError::store)?;
        }
        self.bus
            .broadcast(
                &participants.to_vec(),
                Envelope::notification("일정 거절", reject_text.clone()),
            )
            .await;

        Ok(ApprovalOutcome {
            all_approved: false,
            approved_by: Vec::new(),
            failed_users: Vec::new(),
            message: "일정을 거절했습니다.".to_string(),
        })
    }

    async fn load_sessions(
        &self,
        thread_id: Option<&str>,
        session_ids: &[String],
    ) -> Result<Vec<SessionRecord>, CoordinatorError> {
        if let Some(thread_id) = thread_id {
            let sessions = self
                .store
                .thread_sessions(thread_id)
                .await
                .map_err(CoordinatorError::store)?;
            if !sessions.is_empty() {
                return Ok(sessions);
            }
        }
        let mut sessions = Vec::new();
        for session_id in session_ids {
            if let Some(session) = self
                .store
                .get_session(session_id)
                .await
                .map_err(CoordinatorError::store)?
            {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn post_to_sessions(
        &self,
        sessions: &[SessionRecord],
        sender_user_id: &str,
        kind: A2aMessageKind,
        text: &str,
    ) -> Result<(), CoordinatorError> {
        for session in sessions {
            let receiver = if session.target_user_id.as_deref() == Some(sender_user_id) {
                Some(session.initiator_user_id.clone())
            } else {
                session.target_user_id.clone()
            };
            let message = StoredMessage {
                id: Uuid::new_v4().to_string(),
                session_id: session.id.clone(),
                sender_user_id: sender_user_id.to_string(),
                receiver_user_id: receiver,
                kind,
                payload: MessagePayload {
                    text: text.to_string(),
                    round: None,
                    proposal: None,
                },
                created_at: now_kst(),
            };
            self.store
                .add_message(message)
                .await
                .map_err(CoordinatorError::store)?;
        }
        Ok(())
    }
}

/// Resolve the approval proposal into concrete event start/end instants.
///
/// Pre-parsed RFC3339 instants win; otherwise the Korean time text is parsed
/// in the date's context; as a last resort the event lands tomorrow at the
/// same wall-clock time.
fn resolve_event_times(
    proposal: &ApprovalProposal,
    now: DateTime<FixedOffset>,
) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    if let (Some(start_str), Some(end_str)) = (&proposal.start_time, &proposal.end_time) {
        if let (Ok(start), Ok(end)) = (
            DateTime::parse_from_rfc3339(start_str),
            DateTime::parse_from_rfc3339(end_str),
        ) {
            return (start, end);
        }
    }
    if let Some(time) = &proposal.time {
        let context = format!(
            "{} {}",
            proposal.date.as_deref().unwrap_or(""),
            time
        );
        return parse_time_string(time, &context, now);
    }
    let start = now + Duration::days(1);
    (start, start + Duration::hours(1))
}
