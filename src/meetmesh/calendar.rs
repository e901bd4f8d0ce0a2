//! External calendar access.
//!
//! The calendar provider is a collaborator consumed through two seams:
//! [`CredentialProvider`] answers "a valid access token for user X" (or
//! nothing — token refresh failure deliberately collapses into "no
//! credentials" so one broken participant cannot halt a negotiation), and
//! [`CalendarClient`] performs the three HTTP operations the coordinator
//! needs: list events in a range, create an event, delete an event.
//!
//! [`GoogleCalendarClient`] is the production implementation against the
//! Google Calendar v3 surface. Tests substitute in-memory doubles.

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use log::{error, warn};

use crate::meetmesh::availability::CalendarEvent;
use crate::meetmesh::clients::common::get_shared_http_client;
use crate::meetmesh::error::BoxError;
use crate::meetmesh::timeparse::{kst, kst_datetime};

/// Yields a usable access token for a user, refreshing if needed.
///
/// `None` means "this user has no working calendar credentials right now" —
/// including the refresh-token-revoked case. Callers treat that as a fully
/// free calendar during negotiation and report it per-user at write time.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self, user_id: &str) -> Option<String>;
}

/// Request body for creating a calendar event.
#[derive(Clone, Debug)]
pub struct CreateEventRequest {
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    /// Kept empty for negotiated meetings: each participant gets their own
    /// owner-local event, which prevents duplicate invitation mail.
    pub attendees: Vec<String>,
}

/// Identifier handed back by the provider after a successful create.
#[derive(Clone, Debug)]
pub struct CreatedEvent {
    pub id: String,
    pub html_link: Option<String>,
}

/// The three calendar operations the coordinator consumes.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn list_events(
        &self,
        access_token: &str,
        time_min: DateTime<FixedOffset>,
        time_max: DateTime<FixedOffset>,
    ) -> Result<Vec<CalendarEvent>, BoxError>;

    async fn create_event(
        &self,
        access_token: &str,
        request: &CreateEventRequest,
    ) -> Result<CreatedEvent, BoxError>;

    async fn delete_event(&self, access_token: &str, event_id: &str) -> Result<(), BoxError>;
}

/// Google Calendar v3 implementation.
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    base_url: String,
    calendar_id: String,
}

impl Default for GoogleCalendarClient {
    fn default() -> Self {
        Self::new("https://www.googleapis.com/calendar/v3")
    }
}

impl GoogleCalendarClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            calendar_id: "primary".to_string(),
        }
    }

    fn events_url(&self) -> String {
        format!("{}/calendars/{}/events", self.base_url, self.calendar_id)
    }
}

/// Parse one provider event item into the read model.
///
/// Timed events carry `start.dateTime`/`end.dateTime`; all-day events carry
/// `start.date`/`end.date` (end exclusive). Items that fit neither shape are
/// skipped with a warning rather than failing the whole listing.
pub fn parse_event_item(item: &serde_json::Value) -> Option<CalendarEvent> {
    let id = item["id"].as_str().unwrap_or_default().to_string();
    let summary = item["summary"].as_str().unwrap_or("제목 없음").to_string();

    let start_dt = item["start"]["dateTime"].as_str();
    let end_dt = item["end"]["dateTime"].as_str();
    if let (Some(s), Some(e)) = (start_dt, end_dt) {
        let start = DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&kst());
        let end = DateTime::parse_from_rfc3339(e).ok()?.with_timezone(&kst());
        return Some(CalendarEvent {
            id,
            summary,
            start,
            end,
            all_day: false,
        });
    }

    let start_date = item["start"]["date"].as_str()?;
    let start_day = NaiveDate::parse_from_str(start_date, "%Y-%m-%d").ok()?;
    let end_day = match item["end"]["date"].as_str() {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()?,
        None => start_day + Duration::days(1),
    };
    Some(CalendarEvent {
        id,
        summary,
        start: kst_datetime(start_day, 0, 0),
        end: kst_datetime(end_day, 0, 0),
        all_day: true,
    })
}

#[async_trait]
impl CalendarClient for GoogleCalendarClient {
    async fn list_events(
        &self,
        access_token: &str,
        time_min: DateTime<FixedOffset>,
        time_max: DateTime<FixedOffset>,
    ) -> Result<Vec<CalendarEvent>, BoxError> {
        let response = self
            .http
            .get(self.events_url())
            .bearer_auth(access_token)
            .query(&[
                ("timeMin", time_min.to_rfc3339()),
                ("timeMax", time_max.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
                ("maxResults", "2500".to_string()),
                ("timeZone", "Asia/Seoul".to_string()),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err("인증 토큰 만료 또는 유효하지 않음".into());
        }
        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err("캘린더 접근 권한 없음".into());
        }
        let body: serde_json::Value = response.error_for_status()?.json().await?;

        let mut events = Vec::new();
        for item in body["items"].as_array().into_iter().flatten() {
            match parse_event_item(item) {
                Some(event) => events.push(event),
                None => warn!("[calendar] skipping unparseable event item"),
            }
        }
        Ok(events)
    }

    async fn create_event(
        &self,
        access_token: &str,
        request: &CreateEventRequest,
    ) -> Result<CreatedEvent, BoxError> {
        let attendees: Vec<serde_json::Value> = request
            .attendees
            .iter()
            .map(|email| serde_json::json!({ "email": email }))
            .collect();
        let payload = serde_json::json!({
            "summary": request.summary,
            "description": request.description,
            "location": request.location,
            "start": { "dateTime": request.start.to_rfc3339(), "timeZone": "Asia/Seoul" },
            "end": { "dateTime": request.end.to_rfc3339(), "timeZone": "Asia/Seoul" },
            "attendees": attendees,
        });

        let response = self
            .http
            .post(self.events_url())
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!("[calendar] create failed: {}", status);
            return Err(format!("캘린더 이벤트 생성 실패: {}", status).into());
        }
        let body: serde_json::Value = response.json().await?;
        let id = body["id"]
            .as_str()
            .ok_or("create response carried no event id")?
            .to_string();
        Ok(CreatedEvent {
            id,
            html_link: body["htmlLink"].as_str().map(str::to_string),
        })
    }

    async fn delete_event(&self, access_token: &str, event_id: &str) -> Result<(), BoxError> {
        let url = format!("{}/{}", self.events_url(), event_id);
        self.http
            .delete(&url)
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
