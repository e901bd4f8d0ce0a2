use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use meetmesh::meetmesh::availability::{AvailabilityProvider, CalendarEvent};
use meetmesh::meetmesh::calendar::{
    CalendarClient, CreateEventRequest, CreatedEvent, CredentialProvider,
};
use meetmesh::meetmesh::prose::ProseService;
use meetmesh::meetmesh::protocol::SessionStatus;
use meetmesh::meetmesh::store::{
    ChatLogEntry, ChatLogKind, RecoordinationMeta, SessionPrefs, SessionRecord, Store, UserRecord,
};
use meetmesh::meetmesh::timeparse::{kst_datetime, now_kst};
use meetmesh::{
    ApprovalCoordinator, BoxError, ChatMessage, ChatOrchestrator, CoordinatorConfig, EventBus,
    LlmClient, MemoryStore,
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

/// Answers the structured intent prompt with canned JSON, fails all prose
/// prompts (prose then exercises its deterministic fallbacks).
struct IntentOnlyLlm {
    json: String,
}

#[async_trait]
impl LlmClient for IntentOnlyLlm {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, BoxError> {
        if messages
            .first()
            .map(|m| m.content.contains("JSON 반환 형식"))
            .unwrap_or(false)
        {
            Ok(self.json.clone())
        } else {
            Err("prose disabled".into())
        }
    }

    fn model_name(&self) -> &str {
        "intent-mock"
    }
}

struct RecordingCalendar {
    events_by_token: HashMap<String, Vec<CalendarEvent>>,
    created: AtomicUsize,
}

#[async_trait]
impl CalendarClient for RecordingCalendar {
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
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedEvent {
            id: format!("evt-{}", n),
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

fn fixed_now() -> DateTime<FixedOffset> {
    kst_datetime(NaiveDate::from_ymd_opt(2025, 12, 16).unwrap(), 12, 0)
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
    calendar: Arc<RecordingCalendar>,
    orchestrator: ChatOrchestrator,
}

async fn fixture(
    llm: Arc<dyn LlmClient>,
    events: HashMap<String, Vec<CalendarEvent>>,
) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemoryStore::new());
    for (id, name) in [("u1", "지우"), ("u2", "민서"), ("u3", "철수")] {
        store
            .upsert_user(UserRecord {
                id: id.to_string(),
                name: name.to_string(),
                email: None,
            })
            .await
            .unwrap();
    }
    store.add_friend("u1", "u2").await.unwrap();
    store.add_friend("u1", "u3").await.unwrap();

    let tokens: HashMap<String, String> = ["u1", "u2", "u3"]
        .iter()
        .map(|u| (u.to_string(), format!("tok-{}", u)))
        .collect();
    let calendar = Arc::new(RecordingCalendar {
        events_by_token: events,
        created: AtomicUsize::new(0),
    });
    let credentials = Arc::new(MapCredentials(tokens));
    let provider = Arc::new(AvailabilityProvider::new(
        calendar.clone(),
        credentials.clone(),
        fast_config(),
    ));
    let bus = Arc::new(EventBus::new());
    let prose = Arc::new(ProseService::new(llm));
    let approval = Arc::new(ApprovalCoordinator::new(
        store.clone(),
        bus.clone(),
        calendar.clone(),
        credentials.clone(),
    ));
    let orchestrator = ChatOrchestrator::new(
        store.clone(),
        bus,
        prose,
        provider,
        approval,
        calendar.clone(),
        credentials,
        fast_config(),
    );
    Fixture {
        store,
        calendar,
        orchestrator,
    }
}

#[tokio::test]
async fn test_slot_filling_question_for_missing_date_and_time() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    let turn = fx
        .orchestrator
        .handle_message("u1", "민서랑 언제 볼까?", &[], None, fixed_now())
        .await
        .unwrap();

    assert!(!turn.a2a_started);
    let answer = turn.ai_response.unwrap();
    assert!(answer.contains("날짜"), "unexpected answer: {}", answer);
}

#[tokio::test]
async fn test_direct_dispatch_with_concrete_date_and_time() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    let turn = fx
        .orchestrator
        .handle_message("u1", "민서랑 내일 오후 6시에 만나자", &[], None, fixed_now())
        .await
        .unwrap();

    assert!(turn.a2a_started);
    assert_eq!(turn.session_ids.len(), 1);

    // Both calendars were free: unanimous accept, pending human approval.
    let session = fx
        .store
        .get_session(&turn.session_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::PendingApproval);
    assert_eq!(session.prefs.agreed_date.as_deref(), Some("2025-12-17"));
    assert_eq!(session.prefs.agreed_time.as_deref(), Some("18:00"));

    // Every participant received an approval request.
    for user in ["u1", "u2"] {
        let logs = fx
            .store
            .recent_chat_logs_of_kind(user, ChatLogKind::ScheduleApproval, 1)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1, "no approval request for {}", user);
    }
}

#[tokio::test]
async fn test_ui_selected_friends_skip_name_resolution() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    let turn = fx
        .orchestrator
        .handle_message(
            "u1",
            "내일 오후 6시에 만나자",
            &["u2".to_string(), "u3".to_string()],
            None,
            fixed_now(),
        )
        .await
        .unwrap();

    assert!(turn.a2a_started);
    assert_eq!(turn.session_ids.len(), 2);
}

// S4: range request → recommendation mode → "2" → time → negotiation.
#[tokio::test]
async fn test_recommendation_mode_flow() {
    let intent_json = serde_json::json!({
        "friend_name": "민서",
        "friend_names": ["민서", "철수"],
        "date": "12월",
        "start_date": "2025-12-17",
        "end_date": "2025-12-31",
        "time": "저녁",
        "start_time": "18:00",
        "activity": "저녁 약속",
        "has_schedule_request": true,
        "missing_fields": []
    })
    .to_string();
    let fx = fixture(Arc::new(IntentOnlyLlm { json: intent_json }), HashMap::new()).await;

    let turn = fx
        .orchestrator
        .handle_message("u1", "민서, 철수랑 12월에 저녁 약속", &[], None, fixed_now())
        .await
        .unwrap();
    assert!(turn.recommendation_mode, "expected recommendation mode");
    let offer = turn.ai_response.unwrap();
    assert!(offer.contains("1️⃣") && offer.contains("2️⃣") && offer.contains("3️⃣"));

    // Everyone is free: the top candidates are the earliest dates in range.
    let turn = fx
        .orchestrator
        .handle_message("u1", "2", &[], None, fixed_now())
        .await
        .unwrap();
    assert!(turn.date_selected_mode, "expected time-selection mode");
    assert!(turn.ai_response.unwrap().contains("12/18"));

    let turn = fx
        .orchestrator
        .handle_message("u1", "오후 7시", &[], None, fixed_now())
        .await
        .unwrap();
    assert!(turn.a2a_started);
    let session = fx
        .store
        .get_session(&turn.session_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::PendingApproval);
    assert_eq!(session.prefs.agreed_date.as_deref(), Some("2025-12-18"));
    assert_eq!(session.prefs.agreed_time.as_deref(), Some("19:00"));
}

// S5: personal write refused on conflict, naming the owner's own event.
#[tokio::test]
async fn test_personal_write_refused_on_conflict() {
    let day = NaiveDate::from_ymd_opt(2025, 12, 17).unwrap();
    let events = HashMap::from([(
        "tok-u1".to_string(),
        vec![CalendarEvent {
            id: "meeting".into(),
            summary: "회의".into(),
            start: kst_datetime(day, 15, 0),
            end: kst_datetime(day, 16, 0),
            all_day: false,
        }],
    )]);
    let fx = fixture(Arc::new(FailingLlm), events).await;

    let turn = fx
        .orchestrator
        .handle_message("u1", "내일 3시부터 5시까지 치과 예약", &[], None, fixed_now())
        .await
        .unwrap();

    let event = turn.calendar_event.expect("conflict outcome");
    assert!(event.conflict);
    assert!(turn.ai_response.unwrap().contains("회의"));
    // Nothing was written.
    assert_eq!(fx.calendar.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_personal_write_success_with_range() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    let turn = fx
        .orchestrator
        .handle_message(
            "u1",
            "내일 오후 7시부터 9시까지 저녁 약속 등록해줘",
            &[],
            None,
            fixed_now(),
        )
        .await
        .unwrap();

    let event = turn.calendar_event.expect("written event");
    assert!(!event.conflict);
    assert_eq!(event.start, kst_datetime(NaiveDate::from_ymd_opt(2025, 12, 17).unwrap(), 19, 0));
    assert_eq!(event.end, kst_datetime(NaiveDate::from_ymd_opt(2025, 12, 17).unwrap(), 21, 0));
    assert_eq!(fx.calendar.created.load(Ordering::SeqCst), 1);
    assert!(turn.ai_response.unwrap().contains("✅"));
}

#[tokio::test]
async fn test_single_instant_defers_to_ask_for_end_time() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    let turn = fx
        .orchestrator
        .handle_message("u1", "내일 3시에 치과 예약", &[], None, fixed_now())
        .await
        .unwrap();

    // No write without an end expression; the fallback reply asks instead.
    assert!(turn.calendar_event.is_none());
    assert_eq!(fx.calendar.created.load(Ordering::SeqCst), 0);
    assert!(turn.ai_response.is_some());
}

#[tokio::test]
async fn test_recoordination_reuses_prior_thread() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    fx.store
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
    let reco = RecoordinationMeta {
        needs_recoordination: true,
        thread_id: Some("t1".into()),
        session_ids: vec!["s1".into()],
        rejected_by: Some("u2".into()),
        unavailable_users: Vec::new(),
    };
    fx.store
        .add_chat_log(
            ChatLogEntry::new("u1", ChatLogKind::ScheduleRejection)
                .with_response("민서님이 일정을 거절했습니다.")
                .with_metadata(&reco),
        )
        .await
        .unwrap();

    let turn = fx
        .orchestrator
        .handle_message("u1", "내일 오후 8시는 어때?", &[], None, fixed_now())
        .await
        .unwrap();

    assert!(turn.a2a_started);
    assert_eq!(turn.thread_id.as_deref(), Some("t1"));
    assert_eq!(turn.session_ids, vec!["s1".to_string()]);
    let session = fx.store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::PendingApproval);
    assert_eq!(session.prefs.agreed_time.as_deref(), Some("20:00"));
}

#[tokio::test]
async fn test_explicit_names_override_recoordination() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    fx.store
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
    let reco = RecoordinationMeta {
        needs_recoordination: true,
        thread_id: Some("t1".into()),
        session_ids: vec!["s1".into()],
        rejected_by: Some("u2".into()),
        unavailable_users: Vec::new(),
    };
    fx.store
        .add_chat_log(
            ChatLogEntry::new("u1", ChatLogKind::ScheduleRejection)
                .with_response("거절 알림")
                .with_metadata(&reco),
        )
        .await
        .unwrap();

    // Naming 철수 forces a fresh session instead of reviving thread t1.
    let turn = fx
        .orchestrator
        .handle_message("u1", "철수랑 내일 오후 6시에 만나자", &[], None, fixed_now())
        .await
        .unwrap();

    assert!(turn.a2a_started);
    assert_ne!(turn.thread_id.as_deref(), Some("t1"));
    assert!(!turn.session_ids.contains(&"s1".to_string()));
}

#[tokio::test]
async fn test_freeform_message_gets_fallback_reply() {
    let fx = fixture(Arc::new(FailingLlm), HashMap::new()).await;
    let turn = fx
        .orchestrator
        .handle_message("u1", "안녕!", &[], None, fixed_now())
        .await
        .unwrap();

    assert!(!turn.a2a_started);
    assert!(turn.calendar_event.is_none());
    // With the LLM down, the deterministic apology is served.
    assert!(turn.ai_response.unwrap().contains("죄송해요"));
}
