use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use meetmesh::meetmesh::availability::{AvailabilityProvider, CalendarEvent};
use meetmesh::meetmesh::calendar::{
    CalendarClient, CreateEventRequest, CreatedEvent, CredentialProvider,
};
use meetmesh::meetmesh::personal_agent::{best_alternative_slot, PersonalAgent};
use meetmesh::meetmesh::prose::ProseService;
use meetmesh::meetmesh::protocol::{MessageType, Proposal, TimeSlot};
use meetmesh::meetmesh::timeparse::kst_datetime;
use meetmesh::{BoxError, ChatMessage, CoordinatorConfig, LlmClient};

struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn send_message(
        &self,
        _messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, BoxError> {
        Err("llm offline".into())
    }

    fn model_name(&self) -> &str {
        "failing-mock"
    }
}

struct StaticCalendar {
    events_by_token: HashMap<String, Vec<CalendarEvent>>,
}

#[async_trait]
impl CalendarClient for StaticCalendar {
    async fn list_events(
        &self,
        access_token: &str,
        time_min: DateTime<FixedOffset>,
        time_max: DateTime<FixedOffset>,
    ) -> Result<Vec<CalendarEvent>, BoxError> {
        Ok(self
            .events_by_token
            .get(access_token)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.start < time_max && e.end > time_min)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_event(
        &self,
        _access_token: &str,
        _request: &CreateEventRequest,
    ) -> Result<CreatedEvent, BoxError> {
        Ok(CreatedEvent {
            id: "evt".to_string(),
            html_link: None,
        })
    }

    async fn delete_event(&self, _access_token: &str, _event_id: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

struct MapCredentials(HashMap<String, String>);

#[async_trait]
impl CredentialProvider for MapCredentials {
    async fn access_token(&self, user_id: &str) -> Option<String> {
        self.0.get(user_id).cloned()
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 12, d).unwrap()
}

fn dt(d: u32, h: u32) -> DateTime<FixedOffset> {
    kst_datetime(day(d), h, 0)
}

fn busy(d: u32, from: u32, to: u32, summary: &str) -> CalendarEvent {
    CalendarEvent {
        id: format!("{}-{}-{}", d, from, to),
        summary: summary.to_string(),
        start: dt(d, from),
        end: dt(d, to),
        all_day: false,
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        step_delay: Duration::ZERO,
        short_delay: Duration::ZERO,
        ..CoordinatorConfig::default()
    }
}

fn agent_with_events(user_id: &str, name: &str, events: Vec<CalendarEvent>) -> PersonalAgent {
    let mut events_by_token = HashMap::new();
    events_by_token.insert(format!("tok-{}", user_id), events);
    let calendar = Arc::new(StaticCalendar { events_by_token });
    let credentials = Arc::new(MapCredentials(HashMap::from([(
        user_id.to_string(),
        format!("tok-{}", user_id),
    )])));
    let provider = Arc::new(AvailabilityProvider::new(
        calendar,
        credentials,
        fast_config(),
    ));
    let prose = Arc::new(ProseService::new(Arc::new(FailingLlm)));
    PersonalAgent::new(user_id, name, provider, prose, fast_config(), dt(16, 12))
}

#[tokio::test]
async fn test_accept_when_slot_is_free() {
    let mut agent = agent_with_events("u1", "민서", vec![busy(17, 9, 18, "수업")]);
    let proposal = Proposal::new("2025-12-17", "18:00");
    let decision = agent.evaluate_proposal(&proposal, "상대방").await;
    assert_eq!(decision.action, MessageType::Accept);
    assert_eq!(decision.proposal.unwrap(), proposal);
    // Prose fell back deterministically and names the slot.
    assert!(decision.message.contains("12월 17일"));
}

#[tokio::test]
async fn test_busy_overlap_always_counters_never_accepts() {
    let mut agent = agent_with_events("u1", "민서", vec![busy(17, 17, 19, "치과 예약")]);
    let proposal = Proposal::new("2025-12-17", "18:00");
    let decision = agent.evaluate_proposal(&proposal, "상대방").await;
    assert_eq!(decision.action, MessageType::Counter);

    let counter = decision.proposal.unwrap();
    // Same-day alternative nearest to 18:00 is the 19:00 slot.
    assert_eq!(counter.date, "2025-12-17");
    assert_eq!(counter.time, "19:00");

    // The conflicting event's name stays private to its owner.
    assert!(!decision.message.contains("치과"));
    assert_eq!(decision.conflict_info.unwrap().event_name, "치과 예약");
}

#[tokio::test]
async fn test_decision_is_deterministic_given_calendar() {
    let events = vec![busy(17, 17, 19, "회의")];
    for _ in 0..3 {
        let mut agent = agent_with_events("u1", "민서", events.clone());
        let decision = agent
            .evaluate_proposal(&Proposal::new("2025-12-17", "18:00"), "상대방")
            .await;
        assert_eq!(decision.action, MessageType::Counter);
        assert_eq!(decision.proposal.unwrap().time, "19:00");
    }
}

#[tokio::test]
async fn test_need_human_when_no_availability_exists() {
    // One all-day block covering the whole planning horizon.
    let all_busy = CalendarEvent {
        id: "block".to_string(),
        summary: "장기 출장".to_string(),
        start: dt(16, 0),
        end: kst_datetime(NaiveDate::from_ymd_opt(2027, 1, 1).unwrap(), 0, 0),
        all_day: true,
    };
    let mut agent = agent_with_events("u1", "민서", vec![all_busy]);
    let decision = agent
        .evaluate_proposal(&Proposal::new("2025-12-17", "18:00"), "상대방")
        .await;
    assert_eq!(decision.action, MessageType::NeedHuman);
}

#[tokio::test]
async fn test_initiator_keeps_stated_time_despite_own_conflict() {
    let mut agent = agent_with_events("u1", "규민", vec![busy(17, 18, 19, "회의")]);
    let decision = agent
        .make_initial_proposal(
            Some("2025-12-17"),
            Some("18:00"),
            Some("저녁"),
            None,
            "민서",
            0,
        )
        .await;
    assert_eq!(decision.action, MessageType::Propose);
    let proposal = decision.proposal.unwrap();
    assert_eq!(proposal.date, "2025-12-17");
    assert_eq!(proposal.time, "18:00");
}

#[tokio::test]
async fn test_initial_proposal_converts_relative_expressions() {
    let mut agent = agent_with_events("u1", "규민", vec![]);
    let decision = agent
        .make_initial_proposal(Some("내일"), Some("오후 6시"), Some("저녁"), None, "민서", 0)
        .await;
    assert_eq!(decision.action, MessageType::Propose);
    let proposal = decision.proposal.unwrap();
    assert_eq!(proposal.date, "2025-12-17");
    assert_eq!(proposal.time, "18:00");
}

#[tokio::test]
async fn test_initial_proposal_prefers_stated_hour_window() {
    // 12-17 is free all day (slot starts 09:00, far from 18:00); 12-18 is
    // busy until 17:00, so its slot starts within ±2 h of the preference.
    let mut agent = agent_with_events("u1", "규민", vec![busy(18, 9, 17, "근무")]);
    let decision = agent
        .make_initial_proposal(None, Some("오후 6시"), None, None, "민서", 0)
        .await;
    let proposal = decision.proposal.unwrap();
    assert_eq!(proposal.date, "2025-12-18");
    assert_eq!(proposal.time, "17:00");
}

#[tokio::test]
async fn test_initial_proposal_without_preference_takes_first_slot() {
    let mut agent = agent_with_events("u1", "규민", vec![]);
    let decision = agent
        .make_initial_proposal(None, None, None, None, "민서", 0)
        .await;
    // Today's slot starts in the past and is suppressed, so tomorrow opens.
    let proposal = decision.proposal.unwrap();
    assert_eq!(proposal.date, "2025-12-17");
    assert_eq!(proposal.time, "09:00");
}

#[tokio::test]
async fn test_multi_day_span_requires_fully_free_days() {
    // Busy on the middle day of a 2-night span.
    let mut agent = agent_with_events("u1", "규민", vec![busy(18, 10, 11, "발표")]);
    let proposal = Proposal {
        duration_nights: 2,
        ..Proposal::new("2025-12-17", "")
    };
    let decision = agent.evaluate_proposal(&proposal, "상대방").await;
    assert_eq!(decision.action, MessageType::Counter);

    // Fully free span is accepted.
    let mut agent = agent_with_events("u1", "규민", vec![]);
    let decision = agent.evaluate_proposal(&proposal, "상대방").await;
    assert_eq!(decision.action, MessageType::Accept);
}

#[test]
fn test_best_alternative_slot_ranking() {
    let slots = vec![
        TimeSlot::new(dt(17, 9), dt(17, 12)),
        TimeSlot::new(dt(17, 19), dt(17, 22)),
        TimeSlot::new(dt(18, 9), dt(18, 22)),
    ];
    // Same-day slot nearest to the 18:00 target wins.
    let best = best_alternative_slot(Some(dt(17, 18)), &slots).unwrap();
    assert_eq!(best.start, dt(17, 19));

    // No same-day slot: globally nearest.
    let slots = vec![
        TimeSlot::new(dt(18, 9), dt(18, 22)),
        TimeSlot::new(dt(20, 9), dt(20, 22)),
    ];
    let best = best_alternative_slot(Some(dt(17, 18)), &slots).unwrap();
    assert_eq!(best.start, dt(18, 9));

    // Unparseable target: first slot.
    let best = best_alternative_slot(None, &slots).unwrap();
    assert_eq!(best.start, dt(18, 9));
}
