//! Intent extraction: one utterance in, a structured scheduling record out.
//!
//! Extraction is LLM-first with a deterministic heuristic fallback that
//! handles the same Korean participant/date/time patterns, so a failing model
//! degrades recall, not safety. Two guarantees hold regardless of which path
//! produced the record:
//!
//! - **Non-fabrication**: a friend name that does not literally occur in the
//!   utterance is dropped.
//! - **Missing-fields honesty**: the hard slots are `{date, time}`;
//!   `friend_name` is reported missing only when no friends were found.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::meetmesh::prose::ProseService;
use crate::meetmesh::timeparse::{convert_relative_date, convert_relative_time};

/// Models answer `null` where we model an empty collection; accept both.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Structured scheduling request extracted from one user utterance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScheduleIntent {
    #[serde(default)]
    pub friend_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub friend_names: Vec<String>,
    /// Raw date expression as typed ("이번주 금요일").
    #[serde(default)]
    pub date: Option<String>,
    /// Resolved range start, `YYYY-MM-DD`.
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    /// Raw time expression as typed ("저녁", "5시반").
    #[serde(default)]
    pub time: Option<String>,
    /// Resolved `HH:MM`.
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub has_schedule_request: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub missing_fields: Vec<String>,
}

impl ScheduleIntent {
    /// All extracted friend names, normalized into one list.
    pub fn all_friend_names(&self) -> Vec<String> {
        if !self.friend_names.is_empty() {
            self.friend_names.clone()
        } else {
            self.friend_name.clone().into_iter().collect()
        }
    }
}

const SCHEDULE_KEYWORDS: [&str; 22] = [
    "일정", "약속", "잡아줘", "스케줄", "잡아", "잡기", "잡아줄래", "만나", "만날", "만나자",
    "만나요", "만나고", "만나서", "약속잡", "일정잡", "시간", "언제", "몇시", "예약", "등록",
    "보자", "볼까",
];
const NAME_STOPWORDS: [&str; 12] = [
    "내일", "오늘", "모레", "다음", "이번", "이번주", "다음주", "저녁", "점심", "아침", "언제",
    "우리",
];

lazy_static! {
    static ref RE_COMMA_NAMES: Regex =
        Regex::new(r"([가-힣A-Za-z]{2,})\s*[,，]\s*([가-힣A-Za-z]{2,})").unwrap();
    static ref RE_CONNECTOR_NAMES: Regex =
        Regex::new(r"([가-힣A-Za-z]{2,})\s*(?:이랑|랑|와|과|하고)\s*([가-힣A-Za-z]{2,})").unwrap();
    static ref RE_NAME_WITH_IEUNG: Regex =
        Regex::new(r"([가-힣A-Za-z]{2,}이)(?:랑|와|과|하고)").unwrap();
    static ref RE_SINGLE_NAME: Regex =
        Regex::new(r"([가-힣A-Za-z]{2,})\s*(?:씨|님|이랑|랑|하고|과|와)").unwrap();
    static ref RE_DATE_RELATIVE: Regex = Regex::new(r"(오늘|내일|모레|다음주|이번주)").unwrap();
    static ref RE_DATE_MONTH_DAY: Regex = Regex::new(r"\d{1,2}\s*월\s*\d{1,2}\s*일").unwrap();
    static ref RE_DATE_DAY: Regex = Regex::new(r"\d{1,2}\s*일").unwrap();
    static ref RE_TIME_RANGE: Regex =
        Regex::new(r"\d{1,2}\s*시(?:\s*반)?\s*부터\s*\d{1,2}\s*시(?:\s*까지)?").unwrap();
    static ref RE_TIME_AMPM: Regex = Regex::new(r"(?:오전|오후)\s*\d{1,2}\s*시(?:\s*반)?").unwrap();
    static ref RE_TIME_HOUR: Regex = Regex::new(r"\d{1,2}\s*시(?:\s*반)?").unwrap();
    static ref RE_TIME_WORD: Regex = Regex::new(r"(점심|저녁|아침|새벽|낮)").unwrap();
    static ref RE_WORDS: Regex = Regex::new(r"[가-힣A-Za-z]+").unwrap();
}

const LOCATION_KEYWORDS: [&str; 7] = ["에서", "장소", "카페", "식당", "레스토랑", "공원", "영화관"];

/// Rule-based parse used when the model is unavailable or answers garbage.
pub fn heuristic_parse(message: &str, now: DateTime<FixedOffset>) -> ScheduleIntent {
    let text = message.trim();
    let lowered = text.to_lowercase();
    let has_schedule = SCHEDULE_KEYWORDS.iter().any(|k| text.contains(k))
        || ["schedule", "meeting", "appointment"]
            .iter()
            .any(|k| lowered.contains(k));

    let mut friend_names: Vec<String> = Vec::new();
    if let Some(caps) = RE_COMMA_NAMES.captures(text) {
        friend_names.push(caps[1].to_string());
        friend_names.push(caps[2].to_string());
    }
    if friend_names.is_empty() {
        if let Some(caps) = RE_CONNECTOR_NAMES.captures(text) {
            friend_names.push(caps[1].to_string());
            friend_names.push(caps[2].to_string());
        }
    }
    if friend_names.is_empty() {
        // Names ending in "이" swallow the particle otherwise ("성신조이랑").
        if let Some(caps) = RE_NAME_WITH_IEUNG.captures(text) {
            friend_names.push(caps[1].to_string());
        } else if let Some(caps) = RE_SINGLE_NAME.captures(text) {
            friend_names.push(caps[1].to_string());
        }
    }
    friend_names.retain(|n| n.chars().count() >= 2 && !NAME_STOPWORDS.contains(&n.as_str()));
    friend_names.dedup();

    let date_expr = RE_DATE_RELATIVE
        .find(text)
        .or_else(|| RE_DATE_MONTH_DAY.find(text))
        .or_else(|| RE_DATE_DAY.find(text))
        .map(|m| m.as_str().to_string());

    let time_expr = RE_TIME_RANGE
        .find(text)
        .or_else(|| RE_TIME_AMPM.find(text))
        .or_else(|| RE_TIME_HOUR.find(text))
        .or_else(|| RE_TIME_WORD.find(text))
        .map(|m| m.as_str().replace(' ', ""));

    let mut location = None;
    for keyword in LOCATION_KEYWORDS {
        if let Some(idx) = text.find(keyword) {
            let start = text[..idx]
                .char_indices()
                .rev()
                .nth(9)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let candidate = &text[start..idx + keyword.len()];
            if let Some(word) = RE_WORDS.find_iter(candidate).last() {
                if word.as_str().chars().count() > 1 {
                    location = Some(word.as_str().to_string());
                }
            }
            break;
        }
    }

    let start_date = date_expr
        .as_deref()
        .and_then(|d| convert_relative_date(d, now));

    ScheduleIntent {
        friend_name: friend_names.first().cloned(),
        friend_names: if friend_names.len() > 1 {
            friend_names
        } else {
            Vec::new()
        },
        date: date_expr,
        start_date,
        end_date: None,
        time: time_expr,
        start_time: None,
        end_time: None,
        activity: if has_schedule {
            Some("약속".to_string())
        } else {
            None
        },
        title: None,
        location,
        has_schedule_request: has_schedule,
        missing_fields: Vec::new(),
    }
}

/// LLM-first extractor with the heuristic as a fallback and a merge step.
pub struct IntentExtractor {
    prose: Arc<ProseService>,
}

impl IntentExtractor {
    pub fn new(prose: Arc<ProseService>) -> Self {
        Self { prose }
    }

    pub async fn extract(&self, message: &str, now: DateTime<FixedOffset>) -> ScheduleIntent {
        let heuristic = heuristic_parse(message, now);

        let llm: Option<ScheduleIntent> = match self.prose.extract_intent_json(message, now).await {
            Ok(value) => match serde_json::from_value::<ScheduleIntent>(value) {
                Ok(parsed) => {
                    info!(
                        "[intent] LLM extraction ok: schedule={} friend={:?}",
                        parsed.has_schedule_request, parsed.friend_name
                    );
                    Some(parsed)
                }
                Err(err) => {
                    warn!("[intent] LLM result shape invalid, using heuristic: {}", err);
                    None
                }
            },
            Err(err) => {
                warn!("[intent] LLM call failed, using heuristic: {}", err);
                None
            }
        };

        let mut merged = match llm {
            Some(llm) => merge(llm, heuristic),
            None => heuristic,
        };

        // Non-fabrication: a name the user never typed does not exist.
        merged.friend_names.retain(|n| message.contains(n.as_str()));
        if let Some(name) = merged.friend_name.clone() {
            if !message.contains(name.as_str()) {
                merged.friend_name = None;
            }
        }
        if merged.friend_name.is_none() {
            merged.friend_name = merged.friend_names.first().cloned();
        }

        // Resolve raw expressions the model left unresolved.
        if merged.start_date.is_none() {
            merged.start_date = merged
                .date
                .as_deref()
                .and_then(|d| convert_relative_date(d, now));
        }
        if merged.start_time.is_none() {
            merged.start_time = merged
                .time
                .as_deref()
                .and_then(|t| convert_relative_time(t, merged.activity.as_deref()));
        }

        merged.missing_fields = compute_missing(&merged);
        merged
    }
}

fn merge(llm: ScheduleIntent, heuristic: ScheduleIntent) -> ScheduleIntent {
    let has_schedule = llm.has_schedule_request || heuristic.has_schedule_request;
    let friend_names = if !llm.friend_names.is_empty() {
        llm.friend_names
    } else {
        heuristic.friend_names
    };
    ScheduleIntent {
        friend_name: llm.friend_name.or(heuristic.friend_name),
        friend_names,
        date: llm.date.or(heuristic.date),
        start_date: llm.start_date.or(heuristic.start_date),
        end_date: llm.end_date.or(heuristic.end_date),
        time: llm.time.or(heuristic.time),
        start_time: llm.start_time.or(heuristic.start_time),
        end_time: llm.end_time.or(heuristic.end_time),
        activity: llm.activity.or(heuristic.activity),
        title: llm.title.or(heuristic.title),
        location: llm.location.or(heuristic.location),
        has_schedule_request: has_schedule,
        missing_fields: llm.missing_fields,
    }
}

/// The hard slots are date and time. `friend_name` is kept only when the
/// model itself flagged it: a personal appointment legitimately has no
/// friends, and only the model judges meeting-vs-personal intent.
fn compute_missing(intent: &ScheduleIntent) -> Vec<String> {
    if !intent.has_schedule_request {
        return Vec::new();
    }
    let mut missing = Vec::new();
    if intent.date.is_none() && intent.start_date.is_none() {
        missing.push("date".to_string());
    }
    if intent.time.is_none() && intent.start_time.is_none() {
        missing.push("time".to_string());
    }
    if intent.missing_fields.iter().any(|f| f == "friend_name")
        && intent.all_friend_names().is_empty()
    {
        missing.push("friend_name".to_string());
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meetmesh::timeparse::kst_datetime;
    use chrono::NaiveDate;

    fn fixed_now() -> DateTime<FixedOffset> {
        kst_datetime(NaiveDate::from_ymd_opt(2025, 12, 16).unwrap(), 12, 0)
    }

    #[test]
    fn test_heuristic_single_friend() {
        let intent = heuristic_parse("민서랑 내일 저녁에 보자", fixed_now());
        assert_eq!(intent.friend_name.as_deref(), Some("민서"));
        assert!(intent.has_schedule_request);
        assert_eq!(intent.date.as_deref(), Some("내일"));
        assert_eq!(intent.start_date.as_deref(), Some("2025-12-17"));
    }

    #[test]
    fn test_heuristic_multiple_friends_comma() {
        let intent = heuristic_parse("민서, 규민 보자", fixed_now());
        assert_eq!(intent.friend_names, vec!["민서", "규민"]);
    }

    #[test]
    fn test_heuristic_no_friend_for_personal_schedule() {
        let intent = heuristic_parse("내일 한시에 티켓팅 예약 일정 등록해줘", fixed_now());
        assert!(intent.has_schedule_request);
        assert!(intent.friend_name.is_none());
        assert!(intent.friend_names.is_empty());
    }

    #[test]
    fn test_heuristic_time_range() {
        let intent = heuristic_parse("내일 3시부터 5시까지 치과 예약", fixed_now());
        assert!(intent.has_schedule_request);
        let time = intent.time.unwrap();
        assert!(time.contains("부터"));
    }

    #[test]
    fn test_stopwords_never_become_names() {
        let intent = heuristic_parse("내일이랑 모레 중에 언제가 좋아?", fixed_now());
        assert!(intent.friend_name.is_none());
    }
}
