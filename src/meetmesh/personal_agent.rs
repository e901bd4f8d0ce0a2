//! The per-user decision kernel.
//!
//! One [`PersonalAgent`] exists per (user, negotiation session). It consults
//! exactly one user's calendar — cached on the instance for the session's
//! lifetime — and produces PROPOSE/ACCEPT/COUNTER/NEED_HUMAN decisions.
//!
//! The decision rules are hard: calendar facts decide the outcome in code,
//! and the LLM is invoked afterwards for wording only, with the decision and
//! target datetime injected as facts. A proposal that overlaps a cached busy
//! interval can therefore never come back as ACCEPT, whatever the model says;
//! and any internal error escalates to NEED_HUMAN rather than silently
//! accepting.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike};
use log::{info, warn};

use crate::meetmesh::availability::{AvailabilityProvider, CalendarEvent};
use crate::meetmesh::config::CoordinatorConfig;
use crate::meetmesh::error::BoxError;
use crate::meetmesh::prose::ProseService;
use crate::meetmesh::protocol::{AgentDecision, ConflictInfo, MessageType, Proposal, TimeSlot};
use crate::meetmesh::timeparse::{
    convert_relative_date, convert_relative_time, format_date_with_weekday, kst_datetime,
    parse_civil_date, parse_proposal_datetime, weekday_korean,
};

/// Per-user negotiation agent with session-scoped availability cache.
pub struct PersonalAgent {
    pub user_id: String,
    pub user_name: String,
    provider: Arc<AvailabilityProvider>,
    prose: Arc<ProseService>,
    config: CoordinatorConfig,
    /// Session reference instant; fixed at construction for determinism.
    now: DateTime<FixedOffset>,
    cached_availability: Option<Vec<TimeSlot>>,
    cached_events: Vec<CalendarEvent>,
}

impl PersonalAgent {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        provider: Arc<AvailabilityProvider>,
        prose: Arc<ProseService>,
        config: CoordinatorConfig,
        now: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            provider,
            prose,
            config,
            now,
            cached_availability: None,
            cached_events: Vec::new(),
        }
    }

    /// Load (or return the cached) free slots over the planning horizon.
    pub async fn availability(&mut self) -> Vec<TimeSlot> {
        if let Some(slots) = &self.cached_availability {
            return slots.clone();
        }
        let start = self.now;
        let end = self.now + Duration::days(self.config.planning_horizon_days);
        let (slots, events) = self
            .provider
            .availability(&self.user_id, start, end, 60, self.now)
            .await;
        self.cached_availability = Some(slots.clone());
        self.cached_events = events;
        slots
    }

    /// Free slots within an explicit range (used by recommendation mode).
    pub async fn availability_in_range(
        &mut self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Vec<TimeSlot> {
        let (slots, events) = self
            .provider
            .availability(&self.user_id, start, end, 60, self.now)
            .await;
        self.cached_availability = Some(slots.clone());
        self.cached_events = events;
        slots
    }

    /// The owner's event overlapping the given instant, if any.
    ///
    /// The returned name is for the owner's own logs and UI; it is never put
    /// into prose addressed to other users.
    pub fn find_conflicting_event(&self, target: DateTime<FixedOffset>) -> Option<ConflictInfo> {
        for event in &self.cached_events {
            if event.start <= target && target < event.end {
                let display = if event.all_day {
                    "종일".to_string()
                } else {
                    format!(
                        "{}~{}",
                        hour_display(event.start.hour()),
                        hour_display(event.end.hour())
                    )
                };
                info!(
                    "[{}] conflicting event found: {} ({} ~ {})",
                    self.user_name, event.summary, event.start, event.end
                );
                return Some(ConflictInfo {
                    event_name: event.summary.clone(),
                    event_start: Some(event.start),
                    event_end: Some(event.end),
                    event_time_display: Some(display),
                });
            }
        }
        None
    }

    /// Whether every civil day covered by `[date, date + nights]` is free of
    /// busy events.
    fn span_is_free(&self, start: NaiveDate, nights: u32) -> bool {
        for offset in 0..=nights as i64 {
            let day = start + Duration::days(offset);
            let day_start = kst_datetime(day, 0, 0);
            let day_end = kst_datetime(day, 23, 59);
            if self
                .cached_events
                .iter()
                .any(|e| e.overlaps(day_start, day_end))
            {
                return false;
            }
        }
        true
    }

    fn format_proposal_string(&self, proposal: &Proposal) -> String {
        if proposal.duration_nights > 0 {
            if let Some(start) = parse_civil_date(&proposal.date) {
                let end = start + Duration::days(proposal.duration_nights as i64);
                let end_str = end.format("%Y-%m-%d").to_string();
                return format!(
                    "{} {} ~ {} {} ({}박 {}일)",
                    proposal.date,
                    weekday_korean(&proposal.date),
                    end_str,
                    weekday_korean(&end_str),
                    proposal.duration_nights,
                    proposal.duration_nights + 1
                );
            }
        }
        format_date_with_weekday(&proposal.date, Some(proposal.time.as_str()))
    }

    /// Evaluate a proposal against the owner's calendar.
    ///
    /// Calendar conflict forces COUNTER, a free slot forces ACCEPT, an empty
    /// horizon forces NEED_HUMAN. Errors never accept: they escalate.
    pub async fn evaluate_proposal(&mut self, proposal: &Proposal, other_names: &str) -> AgentDecision {
        match self.evaluate_inner(proposal, other_names).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!("[{}] proposal evaluation failed: {}", self.user_name, err);
                AgentDecision::need_human(
                    "오류가 발생했어요. 직접 확인해주세요.",
                    format!("error: {}", err),
                )
            }
        }
    }

    async fn evaluate_inner(
        &mut self,
        proposal: &Proposal,
        other_names: &str,
    ) -> Result<AgentDecision, BoxError> {
        let availability = self.availability().await;

        let (target, is_available) = if proposal.duration_nights > 0 {
            let start = parse_civil_date(&proposal.date);
            let available = start
                .map(|d| self.span_is_free(d, proposal.duration_nights))
                .unwrap_or(false);
            (start.map(|d| kst_datetime(d, 12, 0)), available)
        } else {
            let target = parse_proposal_datetime(proposal, self.now);
            let available = target
                .map(|t| availability.iter().any(|slot| slot.contains(t)))
                .unwrap_or(false);
            (target, available)
        };

        if is_available {
            info!(
                "[{}] calendar free, accepting {} {}",
                self.user_name, proposal.date, proposal.time
            );
            let formatted = self.format_proposal_string(proposal);
            let multiday_hint = if proposal.duration_nights > 0 {
                " (기간이 있는 일정이므로 구체적인 시간은 언급하지 마세요)"
            } else {
                ""
            };
            let facts = format!(
                "상대방이 '{formatted}'에 만나자고 제안했고 캘린더가 비어있어서 수락합니다. \
'좋아요, {formatted}에 뵙겠습니다!' 처럼 흔쾌히 동의하는 메시지를 작성하세요.{multiday_hint}"
            );
            let message = self
                .prose
                .agent_message(
                    &format!("{}의 비서", self.user_name),
                    other_names,
                    &facts,
                    "friendly_accept",
                )
                .await
                .unwrap_or_else(|err| {
                    warn!("[{}] prose failed, using fallback: {}", self.user_name, err);
                    format!("좋아요! {}에 뵐게요 😊", formatted)
                });
            return Ok(AgentDecision {
                action: MessageType::Accept,
                proposal: Some(proposal.clone()),
                reason: Some("캘린더 가용 - 팩트 기반 수락".to_string()),
                message,
                conflict_info: None,
            });
        }

        if availability.is_empty() {
            warn!("[{}] no availability in planning horizon", self.user_name);
            return Ok(AgentDecision::need_human(
                "가능한 시간을 찾지 못했어요. 직접 확인해주세요",
                "no_availability",
            ));
        }

        // Conflict: counter with the closest alternative, never accept.
        let conflict_info = target.and_then(|t| self.find_conflicting_event(t));
        let best_slot = best_alternative_slot(target, &availability)
            .ok_or("availability non-empty but no alternative slot")?;
        let counter = Proposal {
            date: best_slot.start.format("%Y-%m-%d").to_string(),
            time: best_slot.start.format("%H:%M").to_string(),
            location: proposal.location.clone(),
            activity: proposal.activity.clone(),
            duration_minutes: proposal.duration_minutes,
            duration_nights: proposal.duration_nights,
        };
        info!(
            "[{}] calendar conflict, countering {} {} → {} {}",
            self.user_name, proposal.date, proposal.time, counter.date, counter.time
        );

        let original_formatted = self.format_proposal_string(proposal);
        let counter_formatted = self.format_proposal_string(&counter);
        let facts = format!(
            "상대가 제안한 '{original_formatted}'은 내 개인 일정과 겹쳐 참석이 어렵습니다. \
그래서 대안으로 '{counter_formatted}'을 제안해야 합니다. \
메시지에 '기존 시간은 충돌이라 어렵다'와 '대안 시간 제안'이 모두 드러나게 작성하세요. \
개인 일정의 구체적인 이름이나 내용은 절대 노출하지 마세요."
        );
        let message = self
            .prose
            .agent_message(
                &format!("{}의 비서", self.user_name),
                other_names,
                &facts,
                "friendly_counter",
            )
            .await
            .unwrap_or_else(|err| {
                warn!("[{}] prose failed, using fallback: {}", self.user_name, err);
                format!(
                    "{}에는 개인 일정이 있어 참석이 어려워요. 대신 {}은 어떠세요?",
                    original_formatted, counter_formatted
                )
            });

        Ok(AgentDecision {
            action: MessageType::Counter,
            proposal: Some(counter),
            reason: Some("캘린더 충돌: 개인 일정".to_string()),
            message,
            conflict_info,
        })
    }

    /// Build the opening proposal for the initiator.
    ///
    /// A concrete date+time stated by the human is authoritative: it is
    /// proposed as-is even when it conflicts with the initiator's own
    /// calendar (the conflict is logged, not auto-shifted). Without a stated
    /// time the earliest fitting slot wins, preferring ±2 h around a stated
    /// hour preference.
    pub async fn make_initial_proposal(
        &mut self,
        target_date: Option<&str>,
        target_time: Option<&str>,
        activity: Option<&str>,
        location: Option<&str>,
        other_names: &str,
        duration_nights: u32,
    ) -> AgentDecision {
        match self
            .initial_inner(target_date, target_time, activity, location, other_names, duration_nights)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!("[{}] initial proposal failed: {}", self.user_name, err);
                AgentDecision::need_human("제안 생성 중 오류가 발생했어요 😥", format!("error: {}", err))
            }
        }
    }

    async fn initial_inner(
        &mut self,
        target_date: Option<&str>,
        target_time: Option<&str>,
        activity: Option<&str>,
        location: Option<&str>,
        other_names: &str,
        duration_nights: u32,
    ) -> Result<AgentDecision, BoxError> {
        let availability = self.availability().await;
        if availability.is_empty() {
            return Ok(AgentDecision::need_human(
                "가능한 시간을 찾지 못했어요",
                "no_availability",
            ));
        }

        let actual_date = target_date.and_then(|d| convert_relative_date(d, self.now));
        let actual_time = target_time.and_then(|t| convert_relative_time(t, activity));
        info!(
            "[{}] initial proposal: {:?} {:?} → {:?} {:?}",
            self.user_name, target_date, target_time, actual_date, actual_time
        );

        let proposal = if let (Some(date), Some(time)) = (actual_date.clone(), actual_time.clone()) {
            let candidate = Proposal {
                date,
                time,
                location: location.map(str::to_string),
                activity: activity.map(str::to_string),
                duration_minutes: 60,
                duration_nights,
            };
            // The human chose this instant. Their intent is authoritative for
            // their own proposal, so a conflict is logged but not shifted.
            if let Some(target) = parse_proposal_datetime(&candidate, self.now) {
                if !availability.iter().any(|slot| slot.contains(target)) {
                    if let Some(conflict) = self.find_conflicting_event(target) {
                        warn!(
                            "[{}] initiator's own calendar conflicts ({}), proposing anyway",
                            self.user_name, conflict.event_name
                        );
                    }
                }
            }
            candidate
        } else {
            let best_slot = match &actual_time {
                Some(time) => {
                    let preferred_hour: u32 = time
                        .split(':')
                        .next()
                        .and_then(|h| h.parse().ok())
                        .unwrap_or(18);
                    availability
                        .iter()
                        .find(|slot| slot.start.hour().abs_diff(preferred_hour) <= 2)
                        .unwrap_or(&availability[0])
                        .clone()
                }
                None => availability[0].clone(),
            };
            Proposal {
                date: best_slot.start.format("%Y-%m-%d").to_string(),
                time: best_slot.start.format("%H:%M").to_string(),
                location: location.map(str::to_string),
                activity: activity.map(str::to_string),
                duration_minutes: 60,
                duration_nights,
            }
        };

        let formatted = self.format_proposal_string(&proposal);
        let span_hint = if duration_nights > 0 {
            "(기간이 있는 일정이므로 날짜 범위만 명확히 하고, 구체적인 시간은 언급하지 마세요)"
        } else {
            ""
        };
        let facts = format!(
            "'{formatted}'에 {}을 제안합니다. '어떠세요?' 형식으로 자연스럽게 제안하는 메시지를 작성하세요. {span_hint}",
            activity.unwrap_or("약속")
        );
        let message = self
            .prose
            .agent_message(
                &format!("{}의 비서", self.user_name),
                other_names,
                &facts,
                "friendly_propose",
            )
            .await
            .unwrap_or_else(|err| {
                warn!("[{}] prose failed, using fallback: {}", self.user_name, err);
                format!("{}에 {} 어떠세요? 😊", formatted, activity.unwrap_or("약속"))
            });

        Ok(AgentDecision {
            action: MessageType::Propose,
            proposal: Some(proposal),
            reason: None,
            message,
            conflict_info: None,
        })
    }
}

/// Pick the closest free slot to a rejected target: same-day slots ranked by
/// `|slot.start − target|` first, then the globally nearest slot, then the
/// first slot when the target itself was unparseable.
pub fn best_alternative_slot(
    target: Option<DateTime<FixedOffset>>,
    availability: &[TimeSlot],
) -> Option<TimeSlot> {
    if availability.is_empty() {
        return None;
    }
    let Some(target) = target else {
        return Some(availability[0].clone());
    };

    let same_day: Vec<&TimeSlot> = availability
        .iter()
        .filter(|slot| slot.start.date_naive() == target.date_naive())
        .collect();
    let pool: Vec<&TimeSlot> = if same_day.is_empty() {
        availability.iter().collect()
    } else {
        same_day
    };
    pool.into_iter()
        .min_by_key(|slot| (slot.start - target).num_seconds().abs())
        .cloned()
}

fn hour_display(hour: u32) -> String {
    if hour < 12 {
        format!("오전 {}시", if hour == 0 { 12 } else { hour })
    } else {
        format!("오후 {}시", if hour > 12 { hour - 12 } else { 12 })
    }
}
