//! The bounded, round-based negotiation protocol.
//!
//! One [`NegotiationEngine`] drives one session group: the initiator's agent
//! opens with a proposal, every other participant's agent evaluates it in
//! turn, and counters are adopted round by round until everyone accepts, a
//! deadlock is detected, or the round cap is hit — at which point the humans
//! get it back (`NEED_HUMAN`).
//!
//! Every decision message is persisted to the session's append-only log
//! exactly once and pushed to the event bus immediately, before the next
//! protocol step proceeds; intermediate "checking…" states are streamed but
//! not persisted. A small inter-step delay paces the stream so human
//! observers can follow along — it is configurable
//! ([`CoordinatorConfig::step_delay`]) but deliberately present.
//!
//! The engine also hosts the date-intersection analysis used by
//! recommendation mode: per-date shared-hour sets, priority scoring, and
//! majority recommendations when no date fits everyone.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use futures_util::stream::Stream;
use log::{error, info, warn};
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use crate::meetmesh::availability::AvailabilityProvider;
use crate::meetmesh::config::CoordinatorConfig;
use crate::meetmesh::error::BoxError;
use crate::meetmesh::event_bus::{Envelope, EventBus};
use crate::meetmesh::personal_agent::PersonalAgent;
use crate::meetmesh::prose::{clean_llm_message, ProseService};
use crate::meetmesh::protocol::{
    HumanInterventionReason, MajorityRecommendation, MessageType, NegotiationMessage,
    NegotiationResult, NegotiationStatus, ParticipantAvailability, Proposal, SessionStatus,
    TimeSlot,
};
use crate::meetmesh::store::{
    A2aMessageKind, AgreementDetails, MessagePayload, Store, StoredMessage,
};
use crate::meetmesh::timeparse::{now_kst, parse_civil_date, parse_proposal_datetime};

/// Hard cap on negotiation rounds.
pub const MAX_ROUNDS: u32 = 5;

/// Stream of negotiation messages, in emission order.
pub type MessageStream = Pin<Box<dyn Stream<Item = NegotiationMessage> + Send>>;

/// Inputs identifying one negotiation run.
#[derive(Clone, Debug)]
pub struct NegotiationParams {
    /// Primary session the transcript is persisted under.
    pub session_id: String,
    /// Thread grouping every session of this participant cohort.
    pub thread_id: Option<String>,
    /// Every session to move through the status transitions together.
    pub all_session_ids: Vec<String>,
    pub initiator_user_id: String,
    pub participant_user_ids: Vec<String>,
    pub activity: Option<String>,
    pub location: Option<String>,
    /// Stated civil date (`YYYY-MM-DD`) or relative expression, if any.
    pub target_date: Option<String>,
    pub target_time: Option<String>,
    pub duration_nights: u32,
}

/// One candidate date produced by the intersection analysis.
#[derive(Clone, Debug)]
pub struct RecommendedSlot {
    pub date: String,
    pub time_condition: Option<String>,
    pub start_hour: Option<u32>,
    pub end_hour: Option<u32>,
    pub available_users: Vec<String>,
    pub unavailable_users: Vec<String>,
    pub is_all_available: bool,
    pub priority_score: i32,
}

/// A top-N candidate formatted for presentation.
#[derive(Clone, Debug)]
pub struct DateRecommendation {
    pub date: String,
    pub condition: String,
    pub display_text: String,
    pub available_count: usize,
    pub unavailable_names: Vec<String>,
}

/// Round-based multi-participant negotiation engine.
pub struct NegotiationEngine {
    params: NegotiationParams,
    agents: HashMap<String, PersonalAgent>,
    user_names: HashMap<String, String>,
    current_round: u32,
    status: NegotiationStatus,
    messages: Vec<NegotiationMessage>,
    last_proposals: HashMap<String, Proposal>,
    deadlock_counter: u32,
    final_proposal: Option<Proposal>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    provider: Arc<AvailabilityProvider>,
    prose: Arc<ProseService>,
    config: CoordinatorConfig,
    now: DateTime<FixedOffset>,
    stream_tx: Option<UnboundedSender<NegotiationMessage>>,
}

impl NegotiationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: NegotiationParams,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        provider: Arc<AvailabilityProvider>,
        prose: Arc<ProseService>,
        config: CoordinatorConfig,
        now: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            params,
            agents: HashMap::new(),
            user_names: HashMap::new(),
            current_round: 0,
            status: NegotiationStatus::InProgress,
            messages: Vec::new(),
            last_proposals: HashMap::new(),
            deadlock_counter: 0,
            final_proposal: None,
            store,
            bus,
            provider,
            prose,
            config,
            now,
            stream_tx: None,
        }
    }

    fn all_user_ids(&self) -> Vec<String> {
        let mut ids = vec![self.params.initiator_user_id.clone()];
        ids.extend(self.params.participant_user_ids.iter().cloned());
        ids
    }

    /// Instantiate one agent per participant, resolving display names.
    pub async fn initialize_agents(&mut self) {
        for user_id in self.all_user_ids() {
            if self.agents.contains_key(&user_id) {
                continue;
            }
            let name = match self.store.find_user(&user_id).await {
                Ok(Some(user)) => user.name,
                _ => "사용자".to_string(),
            };
            self.user_names.insert(user_id.clone(), name.clone());
            self.agents.insert(
                user_id.clone(),
                PersonalAgent::new(
                    user_id,
                    name,
                    self.provider.clone(),
                    self.prose.clone(),
                    self.config.clone(),
                    self.now,
                ),
            );
        }
    }

    /// Every participant's free slots over an explicit range.
    pub async fn collect_all_availabilities(
        &mut self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> HashMap<String, Vec<TimeSlot>> {
        self.initialize_agents().await;
        let mut results = HashMap::new();
        for user_id in self.all_user_ids() {
            if let Some(agent) = self.agents.get_mut(&user_id) {
                let slots = agent.availability_in_range(start, end).await;
                info!(
                    "[negotiation] {}: {} slots collected",
                    self.user_names.get(&user_id).map(String::as_str).unwrap_or("?"),
                    slots.len()
                );
                results.insert(user_id, slots);
            }
        }
        results
    }

    /// Per-participant availability snapshot at one instant.
    ///
    /// Conflict event names in the snapshot belong to each owner alone; the
    /// serialization rules upstream keep one user's event name out of another
    /// user's prose.
    pub async fn analyze_participant_availability(
        &mut self,
        target: DateTime<FixedOffset>,
    ) -> (Vec<ParticipantAvailability>, bool) {
        let mut results = Vec::new();
        let mut all_available = true;
        for user_id in self.all_user_ids() {
            let Some(agent) = self.agents.get_mut(&user_id) else {
                continue;
            };
            let availability = agent.availability().await;
            let is_available = availability.iter().any(|slot| slot.contains(target));
            let conflict_info = if is_available {
                None
            } else {
                all_available = false;
                agent.find_conflicting_event(target)
            };
            results.push(ParticipantAvailability {
                user_id: user_id.clone(),
                user_name: self
                    .user_names
                    .get(&user_id)
                    .cloned()
                    .unwrap_or_else(|| "사용자".to_string()),
                is_available,
                conflict_info,
                choice: None,
            });
        }
        (results, all_available)
    }

    /// Group availability by civil date, intersect shared hours, and rank.
    ///
    /// Priority: `10·|available| + 100·[all available] + 20·[preferred hour
    /// within the shared hours]`. Past dates and past hours of today never
    /// qualify.
    pub fn find_intersection_slots(
        &self,
        availabilities: &HashMap<String, Vec<TimeSlot>>,
        preferred_hour: Option<u32>,
    ) -> Vec<RecommendedSlot> {
        let all_user_ids: Vec<&String> = availabilities.keys().collect();
        let total_users = all_user_ids.len();
        let today = self.now.date_naive();
        let work_end = self.config.work_end_hour;

        let mut date_slots: HashMap<String, HashMap<&String, Vec<&TimeSlot>>> = HashMap::new();
        for (user_id, slots) in availabilities {
            for slot in slots {
                let date_str = slot.start.format("%Y-%m-%d").to_string();
                date_slots
                    .entry(date_str)
                    .or_default()
                    .entry(user_id)
                    .or_default()
                    .push(slot);
            }
        }

        let mut recommendations = Vec::new();
        for (date_str, user_slots) in &date_slots {
            if parse_civil_date(date_str).map(|d| d < today).unwrap_or(true) {
                continue;
            }
            let available_ids: Vec<&String> = user_slots.keys().copied().collect();
            let unavailable_ids: Vec<&String> = all_user_ids
                .iter()
                .filter(|id| !available_ids.contains(*id))
                .copied()
                .collect();

            let mut common_hours: Vec<u32> =
                (self.config.work_start_hour..work_end).collect();
            for slots in user_slots.values() {
                let mut user_hours = Vec::new();
                for slot in slots {
                    for hour in slot.start.hour()..(slot.end.hour() + 1).min(work_end) {
                        user_hours.push(hour);
                    }
                }
                common_hours.retain(|h| user_hours.contains(h));
            }
            if parse_civil_date(date_str) == Some(today) {
                let current_hour = self.now.hour();
                common_hours.retain(|h| *h > current_hour);
            }

            let (time_condition, start_hour, end_hour) = if common_hours.is_empty() {
                (None, None, None)
            } else {
                let min_hour = *common_hours.iter().min().unwrap();
                let max_hour = *common_hours.iter().max().unwrap();
                if min_hour >= 18 {
                    (Some(format!("{}시 이후", min_hour)), Some(min_hour), None)
                } else if max_hour <= 14 {
                    (Some(format!("{}시 이전", max_hour)), None, Some(max_hour))
                } else if common_hours.len() as u32 == work_end - self.config.work_start_hour {
                    (Some("시간 무관".to_string()), None, None)
                } else {
                    (
                        Some(format!("{}시~{}시", min_hour, max_hour)),
                        Some(min_hour),
                        Some(max_hour),
                    )
                }
            };

            let mut priority = available_ids.len() as i32 * 10;
            if available_ids.len() == total_users {
                priority += 100;
            }
            if let Some(hour) = preferred_hour {
                if common_hours.contains(&hour) {
                    priority += 20;
                }
            }

            let names = |ids: &[&String]| -> Vec<String> {
                ids.iter()
                    .map(|id| self.user_names.get(*id).cloned().unwrap_or_else(|| (*id).clone()))
                    .collect()
            };
            recommendations.push(RecommendedSlot {
                date: date_str.clone(),
                time_condition,
                start_hour,
                end_hour,
                available_users: names(&available_ids),
                unavailable_users: names(&unavailable_ids),
                is_all_available: available_ids.len() == total_users,
                priority_score: priority,
            });
        }

        recommendations.sort_by(|a, b| {
            b.priority_score
                .cmp(&a.priority_score)
                .then_with(|| a.date.cmp(&b.date))
        });
        recommendations
    }

    /// Present the top-N candidates with their availability summaries.
    pub fn recommend_best_dates(
        &self,
        recommendations: &[RecommendedSlot],
        max_count: usize,
    ) -> Vec<DateRecommendation> {
        recommendations
            .iter()
            .take(max_count)
            .filter_map(|rec| {
                let date = parse_civil_date(&rec.date)?;
                let date_display = format!("{}/{}", date.month(), date.day());
                let condition = rec
                    .time_condition
                    .clone()
                    .unwrap_or_else(|| "시간 무관".to_string());
                let display_text = if rec.is_all_available {
                    format!("{} ({}) - 전원 가능", date_display, condition)
                } else {
                    format!(
                        "{} ({}) - {}명 가능 ({}님 제외)",
                        date_display,
                        condition,
                        rec.available_users.len(),
                        rec.unavailable_users.join(", ")
                    )
                };
                Some(DateRecommendation {
                    date: rec.date.clone(),
                    condition,
                    display_text,
                    available_count: rec.available_users.len(),
                    unavailable_names: rec.unavailable_users.clone(),
                })
            })
            .collect()
    }

    /// Dates reaching a majority when no date fits everyone.
    pub fn majority_recommendations(
        &self,
        availabilities: &HashMap<String, Vec<TimeSlot>>,
        max_count: usize,
    ) -> Vec<MajorityRecommendation> {
        let recommendations = self.find_intersection_slots(availabilities, None);
        if recommendations.iter().any(|r| r.is_all_available) {
            return Vec::new();
        }
        let total_users = availabilities.len();
        let majority_threshold = total_users / 2 + 1;

        recommendations
            .iter()
            .filter(|r| r.available_users.len() >= majority_threshold)
            .take(max_count)
            .filter_map(|rec| {
                let date = parse_civil_date(&rec.date)?;
                Some(MajorityRecommendation {
                    date: format!("{}월 {}일", date.month(), date.day()),
                    time_condition: rec
                        .time_condition
                        .clone()
                        .unwrap_or_else(|| "시간 무관".to_string()),
                    available_count: rec.available_users.len(),
                    total_count: total_users,
                    available_names: rec.available_users.clone(),
                    unavailable_names: rec.unavailable_users.clone(),
                    is_majority: rec.available_users.len() >= majority_threshold,
                })
            })
            .collect()
    }

    /// Run to completion, persisting and streaming every message.
    pub async fn run(mut self) -> NegotiationResult {
        self.run_internal().await;
        self.result()
    }

    /// Run in a background task and expose the transcript as a stream.
    pub fn stream(mut self) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stream_tx = Some(tx);
        tokio::spawn(async move {
            self.run_internal().await;
        });
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        }))
    }

    async fn run_internal(&mut self) {
        info!(
            "[negotiation] start: session={} initiator={} participants={:?} date={:?} time={:?}",
            self.params.session_id,
            self.params.initiator_user_id,
            self.params.participant_user_ids,
            self.params.target_date,
            self.params.target_time
        );
        self.initialize_agents().await;

        let initiator_id = self.params.initiator_user_id.clone();
        let participant_ids = self.params.participant_user_ids.clone();
        let other_names = participant_ids
            .iter()
            .map(|id| self.user_names.get(id).cloned().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(", ");

        self.current_round = 1;
        let params = self.params.clone();
        let initial = match self.agents.get_mut(&initiator_id) {
            Some(agent) => {
                agent
                    .make_initial_proposal(
                        params.target_date.as_deref(),
                        params.target_time.as_deref(),
                        params.activity.as_deref(),
                        params.location.as_deref(),
                        &other_names,
                        params.duration_nights,
                    )
                    .await
            }
            None => return,
        };

        if initial.action == MessageType::NeedHuman {
            warn!("[negotiation] initial proposal failed: {}", initial.message);
            let msg = self.create_message(MessageType::NeedHuman, &initiator_id, None, &initial.message);
            let _ = self.emit_persisted(msg).await;
            self.status = NegotiationStatus::NeedHuman;
            self.mark_sessions(SessionStatus::NeedsReschedule).await;
            return;
        }

        let Some(mut current) = initial.proposal.clone() else {
            warn!("[negotiation] opening decision carried no proposal");
            return;
        };
        info!(
            "[negotiation] initial proposal: {} {}",
            current.date, current.time
        );
        let msg = self.create_message(
            MessageType::Propose,
            &initiator_id,
            Some(current.clone()),
            &initial.message,
        );
        if self.emit_persisted(msg).await.is_err() {
            return;
        }
        tokio::time::sleep(self.config.step_delay).await;

        while self.current_round <= self.config.max_rounds {
            let mut all_accepted = true;
            let mut counters: Vec<(String, Proposal)> = Vec::new();

            for participant_id in &participant_ids {
                let checking =
                    self.create_message(MessageType::Info, participant_id, None, "🔍 확인 중...");
                self.emit_transient(checking).await;
                tokio::time::sleep(self.config.short_delay).await;

                let decision = match self.agents.get_mut(participant_id) {
                    Some(agent) => agent.evaluate_proposal(&current, "상대방").await,
                    None => continue,
                };
                info!(
                    "[negotiation] round {} - {}: {:?}",
                    self.current_round,
                    self.user_names.get(participant_id).map(String::as_str).unwrap_or("?"),
                    decision.action
                );

                let msg = self.create_message(
                    decision.action,
                    participant_id,
                    decision.proposal.clone(),
                    &decision.message,
                );
                if self.emit_persisted(msg).await.is_err() {
                    return;
                }
                tokio::time::sleep(self.config.step_delay).await;

                match decision.action {
                    MessageType::Accept => {}
                    MessageType::Counter => {
                        all_accepted = false;
                        if let Some(proposal) = decision.proposal {
                            counters.push((participant_id.clone(), proposal));
                        }
                    }
                    MessageType::NeedHuman => {
                        self.status = NegotiationStatus::NeedHuman;
                        self.mark_sessions(SessionStatus::NeedsReschedule).await;
                        return;
                    }
                    _ => {}
                }
            }

            if all_accepted {
                self.status = NegotiationStatus::Agreed;
                info!(
                    "[negotiation] unanimous accept: {} {}",
                    current.date, current.time
                );
                let msg = self.create_message(
                    MessageType::Accept,
                    "system",
                    Some(current.clone()),
                    "전원 동의! 일정이 확정되었습니다!",
                );
                let _ = self.emit_persisted(msg).await;
                self.finalize_agreement(&current).await;
                self.final_proposal = Some(current);
                return;
            }

            if !counters.is_empty() {
                if self.check_deadlock(&counters) {
                    self.deadlock_counter += 1;
                    if self.deadlock_counter >= 2 {
                        self.status = NegotiationStatus::NeedHuman;
                        let snapshot = self.snapshot_for(&current).await;
                        let mut msg = self.create_message(
                            MessageType::NeedHuman,
                            "system",
                            Some(current.clone()),
                            "🔄 같은 제안이 반복되고 있어요. 직접 결정해주세요!",
                        );
                        msg.participant_availabilities = snapshot;
                        let _ = self.emit_persisted(msg).await;
                        self.mark_sessions(SessionStatus::NeedsReschedule).await;
                        self.final_proposal = Some(current);
                        return;
                    }
                }

                if let Some((_, newest)) = counters.last() {
                    current = newest.clone();
                }

                let decision = match self.agents.get_mut(&initiator_id) {
                    Some(agent) => agent.evaluate_proposal(&current, &other_names).await,
                    None => continue,
                };
                let msg = self.create_message(
                    decision.action,
                    &initiator_id,
                    decision.proposal.clone(),
                    &decision.message,
                );
                if self.emit_persisted(msg).await.is_err() {
                    return;
                }
                if decision.action == MessageType::Counter {
                    if let Some(proposal) = decision.proposal {
                        current = proposal;
                    }
                }
            }

            self.current_round += 1;
            tokio::time::sleep(self.config.short_delay).await;
        }

        // Round overflow.
        self.status = NegotiationStatus::NeedHuman;
        let snapshot = self.snapshot_for(&current).await;
        let mut msg = self.create_message(
            MessageType::NeedHuman,
            "system",
            Some(current.clone()),
            "5라운드 협상이 끝났어요. 최종 결정을 내려주세요!",
        );
        msg.participant_availabilities = snapshot;
        let _ = self.emit_persisted(msg).await;
        self.mark_sessions(SessionStatus::NeedsReschedule).await;
        self.final_proposal = Some(current);
    }

    /// Per-participant availability snapshot for the escalation message, so
    /// the humans see who the blocked proposal actually works for.
    async fn snapshot_for(&mut self, proposal: &Proposal) -> Option<Vec<ParticipantAvailability>> {
        let target = parse_proposal_datetime(proposal, self.now)?;
        let (snapshot, _) = self.analyze_participant_availability(target).await;
        Some(snapshot)
    }

    fn create_message(
        &mut self,
        message_type: MessageType,
        sender_id: &str,
        proposal: Option<Proposal>,
        message: &str,
    ) -> NegotiationMessage {
        let sender_name = if sender_id == "system" {
            "시스템".to_string()
        } else {
            self.user_names
                .get(sender_id)
                .map(|name| format!("{}의 AI", name))
                .unwrap_or_else(|| "AI".to_string())
        };
        NegotiationMessage {
            id: Uuid::new_v4().to_string(),
            session_id: self.params.session_id.clone(),
            message_type,
            sender_id: sender_id.to_string(),
            sender_name,
            round: self.current_round,
            proposal,
            message: clean_llm_message(message),
            timestamp: now_kst(),
            conflict_info: None,
            majority_recommendation: None,
            participant_availabilities: None,
        }
    }

    /// Persist, fan out, and record one transcript message.
    ///
    /// Persistence comes first: a message observers saw but the store lost
    /// would violate replay. A store failure aborts the negotiation round
    /// and leaves the sessions `in_progress`.
    async fn emit_persisted(&mut self, msg: NegotiationMessage) -> Result<(), BoxError> {
        let sender_user_id = if msg.sender_id == "system" {
            self.params.initiator_user_id.clone()
        } else {
            msg.sender_id.clone()
        };
        let receiver_user_id = if msg.sender_id == self.params.initiator_user_id {
            self.params.participant_user_ids.first().cloned()
        } else {
            Some(self.params.initiator_user_id.clone())
        };
        let stored = StoredMessage {
            id: msg.id.clone(),
            session_id: msg.session_id.clone(),
            sender_user_id,
            receiver_user_id,
            kind: message_kind(msg.message_type),
            payload: MessagePayload {
                text: msg.message.clone(),
                round: Some(msg.round),
                proposal: msg.proposal.clone(),
            },
            created_at: msg.timestamp,
        };
        if let Err(err) = self.store.add_message(stored).await {
            error!("[negotiation] message append failed: {}", err);
            return Err(err);
        }
        self.fan_out(&msg).await;
        self.messages.push(msg);
        Ok(())
    }

    /// Stream a message without persisting it (intermediate states).
    async fn emit_transient(&mut self, msg: NegotiationMessage) {
        self.fan_out(&msg).await;
    }

    async fn fan_out(&self, msg: &NegotiationMessage) {
        let preview: String = msg.message.chars().take(100).collect();
        let envelope = Envelope::A2aMessage {
            session_id: msg.session_id.clone(),
            message_type: msg.message_type.storage_key().to_string(),
            sender_name: msg.sender_name.clone(),
            message: preview,
            round: msg.round,
            timestamp: msg.timestamp,
        };
        self.bus.broadcast(&self.all_user_ids(), envelope).await;
        if let Some(tx) = &self.stream_tx {
            let _ = tx.send(msg.clone());
        }
    }

    /// A participant repeating its previous (date, time) counter is cycling.
    fn check_deadlock(&mut self, counters: &[(String, Proposal)]) -> bool {
        let mut cycling = false;
        for (participant_id, proposal) in counters {
            if let Some(last) = self.last_proposals.get(participant_id) {
                if last.date == proposal.date && last.time == proposal.time {
                    cycling = true;
                }
            }
            self.last_proposals
                .insert(participant_id.clone(), proposal.clone());
        }
        cycling
    }

    /// Move every grouped session to `pending_approval` and record both the
    /// requested and the agreed instants. Calendar writes are not ours: the
    /// approval coordinator owns them.
    async fn finalize_agreement(&mut self, proposal: &Proposal) {
        let details = AgreementDetails {
            requested_date: self.params.target_date.clone(),
            requested_time: self.params.target_time.clone(),
            agreed_date: Some(proposal.date.clone()),
            agreed_time: Some(proposal.time.clone()),
            location: proposal.location.clone(),
            activity: proposal.activity.clone(),
            agreed_at: Some(now_kst()),
        };
        for session_id in self.session_ids() {
            if let Err(err) = self.store.store_agreement(&session_id, &details).await {
                error!("[negotiation] storing agreement failed for {}: {}", session_id, err);
            }
            if let Err(err) = self
                .store
                .update_session_status(&session_id, SessionStatus::PendingApproval)
                .await
            {
                error!("[negotiation] status update failed for {}: {}", session_id, err);
            }
        }
    }

    async fn mark_sessions(&self, status: SessionStatus) {
        for session_id in self.session_ids() {
            if let Err(err) = self.store.update_session_status(&session_id, status).await {
                error!("[negotiation] status update failed for {}: {}", session_id, err);
            }
        }
    }

    fn session_ids(&self) -> Vec<String> {
        if self.params.all_session_ids.is_empty() {
            vec![self.params.session_id.clone()]
        } else {
            self.params.all_session_ids.clone()
        }
    }

    /// Snapshot of the run's outcome.
    pub fn result(&self) -> NegotiationResult {
        let intervention_reason = match self.status {
            NegotiationStatus::NeedHuman => {
                if self.current_round > self.config.max_rounds {
                    Some(HumanInterventionReason::MaxRoundsExceeded)
                } else if self.deadlock_counter >= 2 {
                    Some(HumanInterventionReason::Deadlock)
                } else {
                    Some(HumanInterventionReason::NoCommonTime)
                }
            }
            NegotiationStatus::AwaitingUserChoice => {
                Some(HumanInterventionReason::ConflictChoiceNeeded)
            }
            _ => None,
        };
        NegotiationResult {
            status: self.status,
            final_proposal: self.final_proposal.clone(),
            intervention_reason,
            total_rounds: self.current_round,
            messages: self.messages.clone(),
        }
    }

    /// Negotiation status observed so far.
    pub fn status(&self) -> NegotiationStatus {
        self.status
    }
}

fn message_kind(message_type: MessageType) -> A2aMessageKind {
    match message_type {
        MessageType::Propose => A2aMessageKind::Propose,
        MessageType::Accept => A2aMessageKind::Accept,
        MessageType::Reject => A2aMessageKind::Reject,
        MessageType::Counter => A2aMessageKind::Counter,
        MessageType::Query => A2aMessageKind::Query,
        MessageType::NeedHuman => A2aMessageKind::NeedHuman,
        MessageType::Info => A2aMessageKind::Info,
        MessageType::ConflictChoice => A2aMessageKind::ConflictChoice,
        MessageType::AwaitingChoice => A2aMessageKind::AwaitingChoice,
        MessageType::MajorityRecommend => A2aMessageKind::MajorityRecommend,
    }
}

/// Fresh thread id for a new session group.
pub fn new_thread_id() -> String {
    Uuid::new_v4().to_string()
}
