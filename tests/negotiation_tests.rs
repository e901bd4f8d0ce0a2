use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use futures_util::StreamExt;
use meetmesh::meetmesh::availability::{AvailabilityProvider, CalendarEvent};
use meetmesh::meetmesh::calendar::{
    CalendarClient, CreateEventRequest, CreatedEvent, CredentialProvider,
};
use meetmesh::meetmesh::prose::ProseService;
use meetmesh::meetmesh::protocol::{
    HumanInterventionReason, MessageType, NegotiationStatus, SessionStatus,
};
use meetmesh::meetmesh::store::{SessionPrefs, SessionRecord, Store, UserRecord};
use meetmesh::meetmesh::timeparse::{kst_datetime, now_kst};
use meetmesh::{
    BoxError, ChatMessage, CoordinatorConfig, EventBus, LlmClient, MemoryStore, NegotiationEngine,
    NegotiationParams,
};

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

struct Fixture {
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    provider: Arc<AvailabilityProvider>,
    prose: Arc<ProseService>,
}

async fn fixture(events: HashMap<String, Vec<CalendarEvent>>) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_user(UserRecord {
            id: "u1".into(),
            name: "규민".into(),
            email: None,
        })
        .await
        .unwrap();
    store
        .upsert_user(UserRecord {
            id: "u2".into(),
            name: "민서".into(),
            email: None,
        })
        .await
        .unwrap();

    let mut events_by_token = HashMap::new();
    let mut tokens = HashMap::new();
    for (user, user_events) in events {
        tokens.insert(user.clone(), format!("tok-{}", user));
        events_by_token.insert(format!("tok-{}", user), user_events);
    }
    let calendar = Arc::new(StaticCalendar { events_by_token });
    let credentials = Arc::new(MapCredentials(tokens));
    let provider = Arc::new(AvailabilityProvider::new(
        calendar,
        credentials,
        fast_config(),
    ));
    let prose = Arc::new(ProseService::new(Arc::new(FailingLlm)));

    store
        .create_session(SessionRecord {
            id: "s1".into(),
            initiator_user_id: "u1".into(),
            target_user_id: Some("u2".into()),
            participant_user_ids: vec!["u1".into(), "u2".into()],
            intent: "schedule".into(),
            status: SessionStatus::InProgress,
            time_window: None,
            prefs: SessionPrefs {
                thread_id: Some("t1".into()),
                participants: vec!["u2".into()],
                ..Default::default()
            },
            final_event_id: None,
            created_at: now_kst(),
            updated_at: now_kst(),
        })
        .await
        .unwrap();

    Fixture {
        store,
        bus: Arc::new(EventBus::new()),
        provider,
        prose,
    }
}

fn engine(fx: &Fixture, date: &str, time: &str) -> NegotiationEngine {
    NegotiationEngine::new(
        NegotiationParams {
            session_id: "s1".into(),
            thread_id: Some("t1".into()),
            all_session_ids: vec!["s1".into()],
            initiator_user_id: "u1".into(),
            participant_user_ids: vec!["u2".into()],
            activity: Some("저녁".into()),
            location: None,
            target_date: Some(date.into()),
            target_time: Some(time.into()),
            duration_nights: 0,
        },
        fx.store.clone(),
        fx.bus.clone(),
        fx.provider.clone(),
        fx.prose.clone(),
        fast_config(),
        dt(16, 12),
    )
}

// S1: both participants free at the stated instant — one round, unanimous.
#[tokio::test]
async fn test_happy_path_unanimous_accept() {
    let fx = fixture(HashMap::from([
        ("u1".to_string(), vec![busy(17, 9, 18, "수업")]),
        ("u2".to_string(), vec![busy(17, 20, 22, "운동")]),
    ]))
    .await;

    let mut rx = fx.bus.subscribe("u2").await;
    let result = engine(&fx, "2025-12-17", "18:00").run().await;

    assert_eq!(result.status, NegotiationStatus::Agreed);
    let kinds: Vec<MessageType> = result.messages.iter().map(|m| m.message_type).collect();
    assert_eq!(
        kinds,
        vec![MessageType::Propose, MessageType::Accept, MessageType::Accept]
    );

    let session = fx.store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::PendingApproval);
    assert_eq!(session.prefs.agreed_date.as_deref(), Some("2025-12-17"));
    assert_eq!(session.prefs.agreed_time.as_deref(), Some("18:00"));
    assert_eq!(session.prefs.requested_date.as_deref(), Some("2025-12-17"));

    // Persisted transcript matches the emitted one, in order.
    let stored = fx.store.session_messages("s1").await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].payload.round, Some(1));

    // Observers got the stream, including the transient checking state.
    let first = rx.recv().await.unwrap();
    let serialized = serde_json::to_string(&first).unwrap();
    assert!(serialized.contains("a2a_message"));
}

// S2: the participant counters, the initiator accepts the counter.
#[tokio::test]
async fn test_counter_then_agreement() {
    let fx = fixture(HashMap::from([
        ("u1".to_string(), vec![busy(17, 9, 18, "수업")]),
        ("u2".to_string(), vec![busy(17, 17, 19, "치과 예약")]),
    ]))
    .await;

    let result = engine(&fx, "2025-12-17", "18:00").run().await;

    assert_eq!(result.status, NegotiationStatus::Agreed);
    let session = fx.store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.prefs.agreed_time.as_deref(), Some("19:00"));
    // The original human ask survives next to the negotiated slot.
    assert_eq!(session.prefs.requested_time.as_deref(), Some("18:00"));

    let counter = result
        .messages
        .iter()
        .find(|m| m.message_type == MessageType::Counter)
        .expect("counter message");
    assert_eq!(counter.sender_id, "u2");
    assert_eq!(counter.proposal.as_ref().unwrap().time, "19:00");
    // The countering agent's conflicting event name never leaks.
    assert!(!counter.message.contains("치과"));
}

// S3: both sides repeat their counters — deadlock escalation.
#[tokio::test]
async fn test_deadlock_escalates_to_human() {
    let fx = fixture(HashMap::from([
        (
            "u1".to_string(),
            vec![busy(17, 9, 18, "근무"), busy(17, 19, 22, "회식")],
        ),
        (
            "u2".to_string(),
            vec![busy(17, 9, 20, "근무"), busy(17, 21, 22, "운동")],
        ),
    ]))
    .await;

    let result = engine(&fx, "2025-12-17", "18:00").run().await;

    assert_eq!(result.status, NegotiationStatus::NeedHuman);
    assert_eq!(
        result.intervention_reason,
        Some(HumanInterventionReason::Deadlock)
    );
    // The last proposal is retained for the humans to decide on.
    assert!(result.final_proposal.is_some());
    let session = fx.store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::NeedsReschedule);

    // Round bound: at most MAX_ROUNDS × (participants + 1) + O(1) messages.
    let stored = fx.store.session_messages("s1").await.unwrap();
    assert!(stored.len() <= 5 * 2 + 2, "too many messages: {}", stored.len());
}

#[tokio::test]
async fn test_initiator_without_availability_escalates() {
    let fx = fixture(HashMap::from([
        (
            "u1".to_string(),
            vec![CalendarEvent {
                id: "block".into(),
                summary: "장기 출장".into(),
                start: dt(16, 0),
                end: kst_datetime(NaiveDate::from_ymd_opt(2027, 1, 1).unwrap(), 0, 0),
                all_day: true,
            }],
        ),
        ("u2".to_string(), vec![]),
    ]))
    .await;

    let result = engine(&fx, "2025-12-17", "18:00").run().await;
    assert_eq!(result.status, NegotiationStatus::NeedHuman);
    let stored = fx.store.session_messages("s1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        result.messages[0].message_type,
        MessageType::NeedHuman
    );
}

// A participant with no credentials is treated as fully free.
#[tokio::test]
async fn test_missing_credentials_means_fully_free() {
    let fx = fixture(HashMap::from([
        ("u1".to_string(), vec![]),
        // u2 intentionally absent: no token.
    ]))
    .await;

    let result = engine(&fx, "2025-12-17", "18:00").run().await;
    assert_eq!(result.status, NegotiationStatus::Agreed);
}

#[tokio::test]
async fn test_stream_yields_messages_in_emission_order() {
    let fx = fixture(HashMap::from([
        ("u1".to_string(), vec![]),
        ("u2".to_string(), vec![]),
    ]))
    .await;

    let stream = engine(&fx, "2025-12-17", "18:00").stream();
    let messages: Vec<_> = stream.collect().await;

    let kinds: Vec<MessageType> = messages.iter().map(|m| m.message_type).collect();
    assert_eq!(
        kinds,
        vec![
            MessageType::Propose,
            MessageType::Info,
            MessageType::Accept,
            MessageType::Accept
        ]
    );
    // Transient INFO states are streamed but never persisted.
    let stored = fx.store.session_messages("s1").await.unwrap();
    assert!(stored.iter().all(|m| m.payload.text != "🔍 확인 중..."));
}

#[tokio::test]
async fn test_intersection_scoring_and_recommendations() {
    let fx = fixture(HashMap::from([
        // u1 free evenings only on the 20th, fully busy on the 21st.
        (
            "u1".to_string(),
            vec![busy(20, 9, 18, "근무"), busy(21, 9, 22, "근무")],
        ),
        ("u2".to_string(), vec![]),
    ]))
    .await;

    let mut engine = engine(&fx, "2025-12-20", "18:00");
    let availabilities = engine
        .collect_all_availabilities(dt(20, 0), dt(21, 23))
        .await;
    let slots = engine.find_intersection_slots(&availabilities, None);

    // The 20th fits both (evening); the 21st fits only u2.
    assert_eq!(slots[0].date, "2025-12-20");
    assert!(slots[0].is_all_available);
    assert_eq!(slots[0].time_condition.as_deref(), Some("18시 이후"));
    assert!(slots[0].priority_score > slots[1].priority_score);
    assert_eq!(slots[1].date, "2025-12-21");
    assert_eq!(slots[1].unavailable_users, vec!["규민".to_string()]);

    let recs = engine.recommend_best_dates(&slots, 3);
    assert_eq!(recs.len(), 2);
    assert!(recs[0].display_text.contains("전원 가능"));
    assert!(recs[1].display_text.contains("제외"));

    // No all-available date → majority recommendations kick in (2 of 2 is a
    // majority here, so the helper only reports when nobody fits all).
    let majority = engine.majority_recommendations(&availabilities, 3);
    assert!(majority.is_empty());
}
