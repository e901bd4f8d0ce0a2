//! LLM prose generation with deterministic fallbacks.
//!
//! The language model is an oracle for *wording only*. Decisions (accept,
//! counter, escalate) are made in code before any prompt is built, and the
//! decided facts are injected into the prompt as non-negotiable context. If
//! the model fails, returns an empty string, or wraps its reply in a stray
//! JSON envelope, every caller substitutes a deterministic sentence built
//! from the same facts — so a dead LLM degrades tone, never behavior.

use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::meetmesh::client_wrapper::{ChatMessage, LlmClient};
use crate::meetmesh::error::BoxError;
use crate::meetmesh::intent::ScheduleIntent;
use crate::meetmesh::timeparse::WEEKDAY_KR;

lazy_static! {
    static ref RE_LEADING_JSON: Regex = Regex::new(r"(?s)^(\{.*?\})\s*(.*)$").unwrap();
}

const QUOTES: &[char] = &['"', '\''];

/// Strip a stray JSON envelope from an LLM reply, keeping natural text only.
///
/// A reply starting with `{` is parsed: a `message` field wins, then a
/// `reason` field (when it is not itself JSON). A JSON prefix followed by
/// trailing text keeps the text. Surrounding quotes are dropped.
pub fn clean_llm_message(raw: &str) -> String {
    let message = raw.trim();
    if message.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(message) {
            if let Some(text) = parsed.get("message").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    info!("[llm cleanup] JSON.message → text");
                    return text.trim_matches(QUOTES).to_string();
                }
            }
            if let Some(text) = parsed.get("reason").and_then(|v| v.as_str()) {
                if !text.is_empty() && !text.starts_with('{') {
                    info!("[llm cleanup] JSON.reason → text");
                    return text.trim_matches(QUOTES).to_string();
                }
            }
        } else if let Some(caps) = RE_LEADING_JSON.captures(message) {
            let trailing = caps[2].trim();
            if !trailing.is_empty() {
                info!("[llm cleanup] dropped mixed JSON prefix");
                return trailing.trim_matches(QUOTES).to_string();
            }
        }
    }
    message.trim_matches(QUOTES).to_string()
}

/// Strip markdown code fences from a structured-output reply.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut inside = false;
    let mut lines = Vec::new();
    for line in trimmed.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            continue;
        }
        if inside {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Format the current instant for prompts, e.g.
/// "2025년 12월 16일 화요일 14시 30분 (한국 시간)".
pub fn current_time_info(now: DateTime<FixedOffset>) -> String {
    let weekday = WEEKDAY_KR[now.weekday().num_days_from_monday() as usize];
    format!(
        "{}년 {:02}월 {:02}일 {} {:02}시 {:02}분 (한국 시간)",
        now.year(),
        now.month(),
        now.day(),
        weekday,
        now.hour(),
        now.minute()
    )
}

/// Wording generator shared by agents and the chat orchestrator.
pub struct ProseService {
    client: Arc<dyn LlmClient>,
}

impl ProseService {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// One short agent-to-agent message for the given decided facts.
    ///
    /// Errors when the model fails or produces nothing usable — the caller
    /// owns the deterministic fallback sentence for its decision.
    pub async fn agent_message(
        &self,
        agent_name: &str,
        receiver_name: &str,
        facts: &str,
        tone: &str,
    ) -> Result<String, BoxError> {
        let system = format!(
            "당신은 '{agent_name}'이라는 이름의 AI 비서입니다. \
상대방('{receiver_name}')의 AI 비서와 대화하며 일정을 조율하고 있습니다.\n\n\
[필수 확인 시스템 팩트]: {facts}\n\
위의 시스템 팩트를 절대적으로 따르세요. 캘린더 상태와 다른 말을 지어내면 안 됩니다.\n\n\
톤앤매너: {tone} (친절하고 정중하게, 하지만 간결하게)\n\n\
규칙:\n\
1. 30자 이내로 짧게 말하세요.\n\
2. 상대방의 이름을 부르지 않아도 됩니다.\n\
3. 이모지를 적절히 사용하세요 (1~2개).\n\
4. 자연스러운 한국어로만 말하세요. 다른 언어는 금지입니다.\n\n\
절대 규칙: JSON 형식으로 응답하지 마세요. 오직 자연스러운 대화 메시지만 반환하세요."
        );
        let messages = [
            ChatMessage::system(system),
            ChatMessage::user("위 상황에 맞는 짧은 메시지 한 마디만 작성하세요."),
        ];
        let raw = self.client.send_message(&messages, 0.8, 100).await?;
        let cleaned = clean_llm_message(&raw);
        if cleaned.is_empty() || cleaned.starts_with('{') {
            return Err("LLM reply unusable after cleanup".into());
        }
        Ok(cleaned)
    }

    /// A question asking the user for the still-missing scheduling slots.
    pub async fn slot_filling_question(
        &self,
        missing: &[String],
        intent: &ScheduleIntent,
    ) -> String {
        let missing_korean: Vec<&str> = missing.iter().map(|f| field_korean(f)).collect();
        let fallback = format!(
            "일정을 잡으려면 {} 정보가 더 필요해요. 알려주시겠어요?",
            missing_korean.join(", ")
        );
        let friends = if intent.friend_names.is_empty() {
            "미정".to_string()
        } else {
            intent.friend_names.join(", ")
        };
        let system = format!(
            "당신은 사용자의 일정 비서입니다. \
사용자가 일정을 잡으려고 하는데 다음 정보가 부족합니다: {}\n\n\
현재 파악된 정보:\n- 날짜: {}\n- 시간: {}\n- 장소: {}\n- 친구: {}\n\n\
사용자에게 자연스럽고 친근하게 부족한 정보를 물어보세요.",
            missing_korean.join(", "),
            intent.date.as_deref().unwrap_or("미정"),
            intent.time.as_deref().unwrap_or("미정"),
            intent.location.as_deref().unwrap_or("미정"),
            friends,
        );
        match self
            .client
            .send_message(&[ChatMessage::system(system)], 0.7, 150)
            .await
        {
            Ok(raw) => {
                let cleaned = clean_llm_message(&raw);
                if cleaned.is_empty() {
                    fallback
                } else {
                    cleaned
                }
            }
            Err(err) => {
                warn!("[prose] slot filling question failed: {}", err);
                fallback
            }
        }
    }

    /// Free-form assistant reply for messages that are not scheduling
    /// requests.
    pub async fn chat_reply(
        &self,
        user_message: &str,
        history: &[ChatMessage],
        now: DateTime<FixedOffset>,
    ) -> String {
        let system = format!(
            "당신은 일정 도우미입니다.\n현재 시간: {}\n\n\
## 절대 규칙\n\
1. 사용자가 말하지 않은 정보를 만들어내지 마세요.\n\
2. 친구 이름이 없으면 개인 일정입니다.\n\
3. 장소, 시간은 사용자가 말한 것만 사용하세요.\n\
4. 기존 일정을 취소하거나 변경하지 마세요.\n\n\
## 응답 방식\n\
- 짧고 친근하게 답하세요 (1-2문장).\n\
- 필요한 정보가 없으면 간단히 물어보세요.\n\
- 일정 등록 전에는 끝나는 시간도 물어보세요.",
            current_time_info(now)
        );
        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(user_message));

        match self.client.send_message(&messages, 0.5, 300).await {
            Ok(raw) => {
                let cleaned = clean_llm_message(&raw);
                if cleaned.is_empty() {
                    fallback_chat_reply()
                } else {
                    cleaned
                }
            }
            Err(err) => {
                warn!("[prose] chat reply failed: {}", err);
                fallback_chat_reply()
            }
        }
    }

    /// Ask the model for a structured intent record; returns the parsed JSON.
    pub async fn extract_intent_json(
        &self,
        message: &str,
        now: DateTime<FixedOffset>,
    ) -> Result<serde_json::Value, BoxError> {
        let today = now.format("%Y-%m-%d");
        let system = format!(
            "다음 메시지에서 일정 관련 정보를 추출해주세요.\n\
현재 시각: {}\n오늘 날짜(기준): {}\n\n\
**중요: 반드시 유효한 JSON만 반환하세요.**\n\n\
JSON 반환 형식:\n{{\n\
    \"friend_name\": \"친구 이름 (언급 없으면 반드시 null!)\",\n\
    \"friend_names\": [\"친구1\", \"친구2\"],\n\
    \"date\": \"텍스트 날짜 (예: 이번주 금요일)\",\n\
    \"start_date\": \"YYYY-MM-DD (범위 시작)\",\n\
    \"end_date\": \"YYYY-MM-DD (범위 종료)\",\n\
    \"time\": \"시간 텍스트 (예: 저녁)\",\n\
    \"start_time\": \"HH:MM (24시간제)\",\n\
    \"end_time\": \"HH:MM (24시간제)\",\n\
    \"activity\": \"활동 내용\",\n\
    \"title\": \"일정 제목\",\n\
    \"location\": \"장소\",\n\
    \"has_schedule_request\": true,\n\
    \"missing_fields\": [\"date\", \"time\"]\n}}\n\n\
## 규칙\n\
- 사용자가 친구 이름을 명시적으로 말하지 않았다면 friend_name은 반드시 null이어야 합니다.\n\
- \"5시반\"은 \"17:30\", \"5시 30분\"도 \"17:30\"입니다 (반=30분).\n\
- \"오후\" 뒤의 숫자에는 반드시 12를 더하세요 (오후 9시 = 21:00).\n\
- \"아침\"은 09:00~11:00, \"점심\"은 12:00~14:00, \"저녁\"은 18:00~22:00.\n\
- 약속 의도가 명확한데 정보가 빠진 경우에만 missing_fields에 추가하세요.\n\n\
**반드시 JSON 형식만 반환하세요.**",
            current_time_info(now),
            today,
        );
        let messages = [ChatMessage::system(system), ChatMessage::user(message)];
        let raw = self.client.send_message(&messages, 0.1, 300).await?;
        let body = strip_code_fences(&raw);
        let value: serde_json::Value = serde_json::from_str(&body)?;
        Ok(value)
    }
}

fn fallback_chat_reply() -> String {
    "죄송해요, 지금 잠시 생각이 안 나네요. 잠시 후 다시 말해주시겠어요?".to_string()
}

fn field_korean(field: &str) -> &'static str {
    match field {
        "date" => "날짜",
        "time" => "시간",
        "location" => "장소",
        "friend_name" => "만날 친구",
        _ => "추가",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_extracts_message_field() {
        let raw = r#"{"action": "accept", "message": "좋아요! 그때 봬요"}"#;
        assert_eq!(clean_llm_message(raw), "좋아요! 그때 봬요");
    }

    #[test]
    fn test_clean_falls_back_to_reason() {
        let raw = r#"{"reason": "캘린더가 비어 있어요"}"#;
        assert_eq!(clean_llm_message(raw), "캘린더가 비어 있어요");
    }

    #[test]
    fn test_clean_keeps_trailing_text_of_mixed_reply() {
        let raw = "{\"action\": \"accept\"} 좋아요!";
        assert_eq!(clean_llm_message(raw), "좋아요!");
    }

    #[test]
    fn test_clean_strips_quotes() {
        assert_eq!(clean_llm_message("\"그날 봬요\""), "그날 봬요");
    }

    #[test]
    fn test_strip_code_fences() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(raw), "{\"a\": 1}");
        assert_eq!(strip_code_fences("{\"a\": 1}"), "{\"a\": 1}");
    }
}
