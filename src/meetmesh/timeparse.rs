//! Civil time handling and Korean-language date/time parsing.
//!
//! The whole system runs in one fixed civil zone (KST, UTC+9). Every function
//! that depends on "now" takes the current instant as an argument so tests can
//! pin the clock; only [`now_kst`] touches the wall clock.
//!
//! Parsing covers the expressions users actually type: relative dates
//! (오늘/내일/모레/다음주, weekday names, "12월 17일", bare "17일"), clock
//! times with 오전/오후 qualifiers, "반" for half past, ranges
//! ("7시부터 9시까지"), and category words (아침/점심/저녁). Bare numerals
//! without an AM/PM qualifier are disambiguated by [`infer_am_pm`]: hours 1–6
//! read as afternoon, hours 7–11 lean on activity keywords.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::meetmesh::protocol::Proposal;

/// Korean weekday names indexed by `Weekday::num_days_from_monday()`.
pub const WEEKDAY_KR: [&str; 7] = [
    "월요일", "화요일", "수요일", "목요일", "금요일", "토요일", "일요일",
];

const PM_WORDS: [&str; 5] = ["오후", "저녁", "밤", "낮", "점심"];
const AM_WORDS: [&str; 3] = ["오전", "아침", "새벽"];
const EVENING_ACTIVITY_WORDS: [&str; 6] = ["저녁", "술", "회식", "밥", "디너", "dinner"];
const MORNING_ACTIVITY_WORDS: [&str; 3] = ["아침", "조찬", "모닝"];

lazy_static! {
    static ref RE_ISO_DATE: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap();
    static ref RE_ISO_DATE_ANY: Regex = Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap();
    static ref RE_MONTH_DAY_DASH: Regex = Regex::new(r"^\d{2}-\d{2}$").unwrap();
    static ref RE_HHMM: Regex = Regex::new(r"^(\d{1,2}):(\d{2})$").unwrap();
    static ref RE_HHMM_ANY: Regex = Regex::new(r"(\d{1,2}):(\d{2})").unwrap();
    static ref RE_KR_MONTH_DAY: Regex = Regex::new(r"(\d{1,2})월\s*(\d{1,2})일").unwrap();
    static ref RE_KR_DAY_ONLY: Regex = Regex::new(r"(\d{1,2})일").unwrap();
    static ref RE_KR_HOUR: Regex = Regex::new(r"(\d{1,2})\s*시").unwrap();
    static ref RE_KR_MINUTE: Regex = Regex::new(r"(\d{1,2})\s*분").unwrap();
    static ref RE_RANGE_PM: Regex = Regex::new(r"오후\s*(\d{1,2})\s*시\s*부터\s*(\d{1,2})\s*시").unwrap();
    static ref RE_RANGE_AM: Regex = Regex::new(r"오전\s*(\d{1,2})\s*시\s*부터\s*(\d{1,2})\s*시").unwrap();
    static ref RE_RANGE_BARE: Regex = Regex::new(r"(\d{1,2})\s*시\s*부터\s*(\d{1,2})\s*시").unwrap();
}

/// The fixed civil zone (UTC+9, no DST).
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("valid KST offset")
}

/// Current instant in the civil zone.
pub fn now_kst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

/// Build a civil instant from a date plus hour/minute.
pub fn kst_datetime(date: NaiveDate, hour: u32, minute: u32) -> DateTime<FixedOffset> {
    date.and_hms_opt(hour.min(23), minute.min(59), 0)
        .expect("valid time of day")
        .and_local_timezone(kst())
        .single()
        .expect("unambiguous civil time")
}

/// Parse a `YYYY-MM-DD` string.
pub fn parse_civil_date(s: &str) -> Option<NaiveDate> {
    if RE_ISO_DATE.is_match(s) {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
    } else {
        None
    }
}

/// Korean weekday name for a civil date string, empty when unparseable.
pub fn weekday_korean(date_str: &str) -> &'static str {
    match parse_civil_date(date_str) {
        Some(d) => WEEKDAY_KR[d.weekday().num_days_from_monday() as usize],
        None => "",
    }
}

/// Format a date (and optional `HH:MM` time) for display, e.g.
/// "12월 22일 월요일 오후 1시 30분".
pub fn format_date_with_weekday(date_str: &str, time_str: Option<&str>) -> String {
    let Some(date) = parse_civil_date(date_str) else {
        return match time_str {
            Some(t) => format!("{} {}", date_str, t),
            None => date_str.to_string(),
        };
    };
    let weekday = WEEKDAY_KR[date.weekday().num_days_from_monday() as usize];
    let date_part = format!("{}월 {}일 {}", date.month(), date.day(), weekday);

    let Some(time) = time_str else {
        return date_part;
    };
    let Some(caps) = RE_HHMM.captures(time) else {
        return format!("{} {}", date_part, time);
    };
    let hour: u32 = caps[1].parse().unwrap_or(0);
    let minute: u32 = caps[2].parse().unwrap_or(0);
    let (am_pm, display_hour) = if hour < 12 {
        ("오전", if hour == 0 { 12 } else { hour })
    } else {
        ("오후", if hour > 12 { hour - 12 } else { 12 })
    };
    if minute > 0 {
        format!("{} {} {}시 {}분", date_part, am_pm, display_hour, minute)
    } else {
        format!("{} {} {}시", date_part, am_pm, display_hour)
    }
}

/// Convert a relative or Korean date expression to `YYYY-MM-DD`.
///
/// Handles weekday names ("다음주 금요일"), 오늘/내일/모레, week words, and
/// "M월 D일"/"D일" with rollover to next year/month when already past.
pub fn convert_relative_date(expr: &str, now: DateTime<FixedOffset>) -> Option<String> {
    if RE_ISO_DATE.is_match(expr) {
        return Some(expr.to_string());
    }

    let today = now.date_naive();
    let current_weekday = today.weekday().num_days_from_monday() as i64;

    if let Some(target_weekday) = WEEKDAY_KR.iter().position(|w| expr.contains(w)) {
        let target_weekday = target_weekday as i64;
        let days_ahead = if expr.contains("다음주") || expr.contains("다음 주") {
            let mut to_next_monday = (7 - current_weekday) % 7;
            if to_next_monday == 0 {
                to_next_monday = 7;
            }
            to_next_monday + target_weekday
        } else {
            (target_weekday - current_weekday).rem_euclid(7)
        };
        let target = today + Duration::days(days_ahead);
        return Some(target.format("%Y-%m-%d").to_string());
    }

    let target = if expr.contains("오늘") {
        today
    } else if expr.contains("내일") {
        today + Duration::days(1)
    } else if expr.contains("모레") {
        today + Duration::days(2)
    } else if expr.contains("다음주") || expr.contains("다음 주") {
        let mut to_monday = (7 - current_weekday) % 7;
        if to_monday == 0 {
            to_monday = 7;
        }
        today + Duration::days(to_monday)
    } else if expr.contains("이번주") || expr.contains("이번 주") {
        today
    } else if let Some(caps) = RE_KR_MONTH_DAY.captures(expr) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let mut year = today.year();
        if month < today.month() || (month == today.month() && day < today.day()) {
            year += 1;
        }
        NaiveDate::from_ymd_opt(year, month, day)?
    } else if let Some(caps) = RE_KR_DAY_ONLY.captures(expr) {
        let day: u32 = caps[1].parse().ok()?;
        let (mut year, mut month) = (today.year(), today.month());
        if day < today.day() {
            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
        NaiveDate::from_ymd_opt(year, month, day)?
    } else {
        return None;
    };

    Some(target.format("%Y-%m-%d").to_string())
}

/// Convert a Korean time expression to `HH:MM`, inferring AM/PM for bare
/// numerals from the expression and the activity.
pub fn convert_relative_time(expr: &str, activity: Option<&str>) -> Option<String> {
    if RE_HHMM.is_match(expr) {
        return Some(normalize_hhmm(expr));
    }

    if let Some(caps) = RE_KR_HOUR.captures(expr) {
        let mut hour: u32 = caps[1].parse().ok()?;
        if expr.contains("오후") && hour < 12 {
            hour += 12;
        } else if expr.contains("오전") {
            if hour == 12 {
                hour = 0;
            }
        } else {
            hour = infer_am_pm(hour, expr, activity);
        }
        let minute = if expr.contains('반') {
            30
        } else {
            RE_KR_MINUTE
                .captures(expr)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0)
        };
        return Some(format!("{:02}:{:02}", hour.min(23), minute));
    }

    if expr.contains("점심") {
        Some("12:00".to_string())
    } else if expr.contains("저녁") {
        Some("18:00".to_string())
    } else if expr.contains("아침") {
        Some("09:00".to_string())
    } else {
        None
    }
}

/// AM/PM inference for a bare numeral hour.
///
/// 1–6 read as afternoon; 7–11 go by keywords in the expression or activity
/// (evening words push PM, morning words keep AM); 12 and up are unchanged.
pub fn infer_am_pm(hour: u32, expr: &str, activity: Option<&str>) -> u32 {
    if expr.contains('밤') || expr.contains("저녁") {
        return if hour < 12 { hour + 12 } else { hour };
    }
    if (1..=6).contains(&hour) {
        return hour + 12;
    }
    if (7..=11).contains(&hour) {
        let haystack = format!("{} {}", activity.unwrap_or("").to_lowercase(), expr);
        if EVENING_ACTIVITY_WORDS.iter().any(|k| haystack.contains(k)) {
            return hour + 12;
        }
        if MORNING_ACTIVITY_WORDS.iter().any(|k| haystack.contains(k)) {
            return hour;
        }
        return hour;
    }
    hour
}

fn normalize_hhmm(s: &str) -> String {
    match RE_HHMM.captures(s) {
        Some(caps) => format!(
            "{:02}:{:02}",
            caps[1].parse::<u32>().unwrap_or(0).min(23),
            caps[2].parse::<u32>().unwrap_or(0).min(59)
        ),
        None => s.to_string(),
    }
}

/// Resolve a proposal's date/time strings into a civil instant.
///
/// Accepts `YYYY-MM-DD`, `MM-DD` (current year) and "M월 D일" dates; `HH:MM`
/// and "N시" times with 오전/오후 qualifiers.
pub fn parse_proposal_datetime(
    proposal: &Proposal,
    now: DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    let date_str = proposal.date.as_str();
    let time_str = proposal.time.as_str();
    let current_year = now.year();

    let date = if let Some(d) = parse_civil_date(date_str) {
        d
    } else if RE_MONTH_DAY_DASH.is_match(date_str) {
        NaiveDate::parse_from_str(&format!("{}-{}", current_year, date_str), "%Y-%m-%d").ok()?
    } else if let Some(caps) = RE_KR_MONTH_DAY.captures(date_str) {
        NaiveDate::from_ymd_opt(current_year, caps[1].parse().ok()?, caps[2].parse().ok()?)?
    } else {
        return None;
    };

    let (hour, minute) = if let Some(caps) = RE_HHMM.captures(time_str) {
        (caps[1].parse().ok()?, caps[2].parse().ok()?)
    } else if let Some(caps) = RE_KR_HOUR.captures(time_str) {
        let mut hour: u32 = caps[1].parse().ok()?;
        if time_str.contains("오후") && hour < 12 {
            hour += 12;
        } else if time_str.contains("오전") && hour == 12 {
            hour = 0;
        }
        (hour, 0)
    } else {
        return None;
    };

    if hour > 23 || minute > 59 {
        return None;
    }
    Some(kst_datetime(date, hour, minute))
}

/// Parse a chat date expression, falling back to tomorrow when nothing
/// matches (a personal schedule without a date is almost always "soon").
pub fn parse_chat_date(expr: &str, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let today = now.date_naive();
    let s = expr.trim();

    if let Some(m) = RE_ISO_DATE_ANY.find(s) {
        if let Ok(date) = NaiveDate::parse_from_str(m.as_str(), "%Y-%m-%d") {
            return kst_datetime(date, 0, 0);
        }
    }

    let date = if s.contains("오늘") {
        today
    } else if s.contains("내일") {
        today + Duration::days(1)
    } else if s.contains("모레") {
        today + Duration::days(2)
    } else if s.contains("다음주") {
        today + Duration::days(7)
    } else if s.contains("이번주") {
        let days_until_sat = (5 - today.weekday().num_days_from_monday() as i64).rem_euclid(7);
        today + Duration::days(days_until_sat)
    } else if let Some(caps) = RE_KR_MONTH_DAY.captures(s) {
        let month: u32 = caps[1].parse().unwrap_or(today.month());
        let day: u32 = caps[2].parse().unwrap_or(today.day());
        let candidate = NaiveDate::from_ymd_opt(today.year(), month, day);
        match candidate {
            Some(c) if c < today => NaiveDate::from_ymd_opt(today.year() + 1, month, day)
                .unwrap_or(today + Duration::days(1)),
            Some(c) => c,
            None => today + Duration::days(1),
        }
    } else if let Some(caps) = RE_KR_DAY_ONLY.captures(s) {
        let day: u32 = caps[1].parse().unwrap_or(today.day());
        let candidate = NaiveDate::from_ymd_opt(today.year(), today.month(), day);
        match candidate {
            Some(c) if c < today => {
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, day).unwrap_or(today + Duration::days(1))
            }
            Some(c) => c,
            None => today + Duration::days(1),
        }
    } else {
        today + Duration::days(1)
    };

    kst_datetime(date, 0, 0)
}

fn has_pm_word(text: &str) -> bool {
    PM_WORDS.iter().any(|w| text.contains(w))
}

fn has_am_word(text: &str) -> bool {
    AM_WORDS.iter().any(|w| text.contains(w))
}

fn contextual_hour(mut hour: u32, context: &str) -> u32 {
    if has_pm_word(context) && (1..=11).contains(&hour) {
        hour += 12;
    } else if has_am_word(context) {
        if hour == 12 {
            hour = 0;
        }
    } else if (1..=6).contains(&hour) {
        hour += 12;
    }
    hour.min(23)
}

/// Parse a chat time expression into a `(start, end)` pair on the given day.
///
/// Ranges ("오후 7시부터 9시까지") yield distinct endpoints. A single time
/// yields `start == end`; the caller decides whether to widen it (approval
/// parsing adds an hour, personal writes keep the zero-length interval when
/// the user asked for start-only registration).
pub fn parse_time_range(
    time_str: &str,
    context_text: &str,
    date: NaiveDate,
) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    let t = time_str.trim();
    let ctx = format!("{} {}", t, context_text);

    if let Some(caps) = RE_RANGE_PM.captures(&ctx) {
        let start_h: u32 = caps[1].parse().unwrap_or(6);
        let end_h: u32 = caps[2].parse().unwrap_or(start_h + 2);
        return (
            kst_datetime(date, (start_h + 12).min(23), 0),
            kst_datetime(date, (end_h + 12).min(23), 0),
        );
    }
    if let Some(caps) = RE_RANGE_AM.captures(&ctx) {
        let start_h: u32 = caps[1].parse().unwrap_or(9);
        let end_h: u32 = caps[2].parse().unwrap_or(start_h + 2);
        return (kst_datetime(date, start_h, 0), kst_datetime(date, end_h, 0));
    }
    if let Some(caps) = RE_RANGE_BARE.captures(&ctx) {
        let mut start_h: u32 = caps[1].parse().unwrap_or(2);
        let mut end_h: u32 = caps[2].parse().unwrap_or(start_h + 2);
        // Without a qualifier, daytime meeting ranges read as afternoon.
        if start_h <= 12 {
            start_h += 12;
        }
        if end_h <= 12 {
            end_h += 12;
        }
        return (
            kst_datetime(date, start_h.min(23), 0),
            kst_datetime(date, end_h.min(23), 0),
        );
    }

    if let Some(caps) = RE_HHMM_ANY.captures(t) {
        let hour = contextual_hour(caps[1].parse().unwrap_or(14), &ctx);
        let minute: u32 = caps[2].parse().unwrap_or(0);
        let start = kst_datetime(date, hour, minute.min(59));
        return (start, start);
    }

    if let Some(caps) = RE_KR_HOUR.captures(t) {
        let hour = contextual_hour(caps[1].parse().unwrap_or(14), &ctx);
        let minute = if t.contains('반') {
            30
        } else {
            RE_KR_MINUTE
                .captures(t)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0)
        };
        let start = kst_datetime(date, hour, minute);
        return (start, start);
    }

    let hour = if ctx.contains("새벽") {
        2
    } else if ctx.contains("아침") || ctx.contains("오전") {
        9
    } else if ctx.contains("점심") {
        12
    } else if has_pm_word(&ctx) {
        18
    } else {
        14
    };
    let start = kst_datetime(date, hour, 0);
    (start, start)
}

/// Parse a time string along with its surrounding context into a concrete
/// `(start, end)` pair, widening a single instant to one hour.
pub fn parse_time_string(
    time_str: &str,
    context_text: &str,
    now: DateTime<FixedOffset>,
) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    let date = parse_chat_date(context_text, now).date_naive();
    let (start, mut end) = parse_time_range(time_str, context_text, date);
    if start == end {
        end = start + Duration::hours(1);
    }
    (start, end)
}
