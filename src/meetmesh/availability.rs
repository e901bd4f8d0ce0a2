//! Availability derivation: from raw calendar events to free slots.
//!
//! Free time is computed per (user, date range) by merging the user's busy
//! intervals and sweeping each day's working hours (09:00–22:00 by default):
//! a slot is emitted wherever the gap between busies is at least the required
//! duration. All-day events block their whole civil day(s). Slots that start
//! in the past are suppressed on the current day.
//!
//! [`AvailabilityProvider`] is the read-through front: it asks the credential
//! provider for a token, lists events, and degrades to "fully free" when the
//! user has no working credentials — a broken participant weakens the result
//! but never halts the negotiation.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::meetmesh::calendar::{CalendarClient, CredentialProvider};
use crate::meetmesh::config::CoordinatorConfig;
use crate::meetmesh::protocol::TimeSlot;
use crate::meetmesh::timeparse::kst_datetime;

/// A read-only external calendar event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub all_day: bool,
}

impl CalendarEvent {
    /// Busy-overlap test against a candidate interval:
    /// `candidate.start < event.end && candidate.end > event.start`.
    pub fn overlaps(&self, start: DateTime<FixedOffset>, end: DateTime<FixedOffset>) -> bool {
        start < self.end && end > self.start
    }
}

/// Merge overlapping or touching busy intervals into a sorted disjoint list.
pub fn merge_busy(
    mut intervals: Vec<(DateTime<FixedOffset>, DateTime<FixedOffset>)>,
) -> Vec<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
    intervals.sort_by_key(|(start, _)| *start);
    let mut merged: Vec<(DateTime<FixedOffset>, DateTime<FixedOffset>)> = Vec::new();
    for (start, end) in intervals {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end => {
                if end > *last_end {
                    *last_end = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Compute free slots within working hours over a date range.
///
/// `busy` must be merged (see [`merge_busy`]). Slots shorter than
/// `duration_minutes` are dropped; on the day containing `now`, slots whose
/// start is not strictly after `now` are dropped too.
pub fn compute_free_slots(
    busy: &[(DateTime<FixedOffset>, DateTime<FixedOffset>)],
    range_start: DateTime<FixedOffset>,
    range_end: DateTime<FixedOffset>,
    duration_minutes: i64,
    now: DateTime<FixedOffset>,
    work_start_hour: u32,
    work_end_hour: u32,
) -> Vec<TimeSlot> {
    let mut slots = Vec::new();
    let today = now.date_naive();

    let mut day = range_start.date_naive();
    let last_day = range_end.date_naive();
    while day <= last_day {
        let day_start = kst_datetime(day, work_start_hour, 0);
        let day_end = kst_datetime(day, work_end_hour, 0);

        // Clip busies to this day's working window.
        let mut day_busy: Vec<(DateTime<FixedOffset>, DateTime<FixedOffset>)> = busy
            .iter()
            .filter(|(s, e)| *s < day_end && *e > day_start)
            .map(|(s, e)| ((*s).max(day_start), (*e).min(day_end)))
            .collect();
        day_busy.sort_by_key(|(s, _)| *s);

        let mut cursor = day_start;
        for (busy_start, busy_end) in day_busy {
            if cursor < busy_start
                && (busy_start - cursor).num_minutes() >= duration_minutes
                && (day != today || cursor > now)
            {
                slots.push(TimeSlot::new(cursor, busy_start));
            }
            if busy_end > cursor {
                cursor = busy_end;
            }
        }
        if cursor < day_end
            && (day_end - cursor).num_minutes() >= duration_minutes
            && (day != today || cursor > now)
        {
            slots.push(TimeSlot::new(cursor, day_end));
        }

        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    slots
}

/// Per-user read-through access to calendar events and derived free slots.
pub struct AvailabilityProvider {
    calendar: Arc<dyn CalendarClient>,
    credentials: Arc<dyn CredentialProvider>,
    config: CoordinatorConfig,
}

impl AvailabilityProvider {
    pub fn new(
        calendar: Arc<dyn CalendarClient>,
        credentials: Arc<dyn CredentialProvider>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            calendar,
            credentials,
            config,
        }
    }

    /// Raw events for a user over a range.
    ///
    /// `None` means the user has no working credentials (or the provider
    /// errored); downstream treats that as a fully free calendar.
    pub async fn events_for(
        &self,
        user_id: &str,
        range_start: DateTime<FixedOffset>,
        range_end: DateTime<FixedOffset>,
    ) -> Option<Vec<CalendarEvent>> {
        let token = match self.credentials.access_token(user_id).await {
            Some(token) => token,
            None => {
                warn!("[availability] {}: no calendar credentials, treating as fully free", user_id);
                return None;
            }
        };
        match self.calendar.list_events(&token, range_start, range_end).await {
            Ok(events) => Some(events),
            Err(err) => {
                warn!("[availability] {}: event listing failed ({}), treating as fully free", user_id, err);
                None
            }
        }
    }

    /// Free slots plus the raw events they were derived from.
    pub async fn availability(
        &self,
        user_id: &str,
        range_start: DateTime<FixedOffset>,
        range_end: DateTime<FixedOffset>,
        duration_minutes: i64,
        now: DateTime<FixedOffset>,
    ) -> (Vec<TimeSlot>, Vec<CalendarEvent>) {
        let events = self.events_for(user_id, range_start, range_end).await;
        let (busy, events) = match events {
            Some(events) => {
                let busy = merge_busy(events.iter().map(|e| (e.start, e.end)).collect());
                (busy, events)
            }
            None => (Vec::new(), Vec::new()),
        };
        let slots = compute_free_slots(
            &busy,
            range_start,
            range_end,
            duration_minutes,
            now,
            self.config.work_start_hour,
            self.config.work_end_hour,
        );
        info!("[availability] {}: {} free slots over {}..{}", user_id, slots.len(), range_start, range_end);
        (slots, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, d).unwrap()
    }

    fn dt(d: u32, h: u32) -> DateTime<FixedOffset> {
        kst_datetime(day(d), h, 0)
    }

    #[test]
    fn test_merge_busy_coalesces_overlaps() {
        let merged = merge_busy(vec![(dt(17, 13), dt(17, 15)), (dt(17, 14), dt(17, 16)), (dt(17, 18), dt(17, 19))]);
        assert_eq!(merged, vec![(dt(17, 13), dt(17, 16)), (dt(17, 18), dt(17, 19))]);
    }

    #[test]
    fn test_free_slots_sweep_around_busy() {
        let busy = vec![(dt(17, 12), dt(17, 14))];
        let now = dt(16, 10);
        let slots = compute_free_slots(&busy, dt(17, 0), dt(17, 23), 60, now, 9, 22);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].start, dt(17, 9));
        assert_eq!(slots[0].end, dt(17, 12));
        assert_eq!(slots[1].start, dt(17, 14));
        assert_eq!(slots[1].end, dt(17, 22));
    }

    #[test]
    fn test_short_gaps_are_dropped() {
        let busy = vec![(dt(17, 9), dt(17, 12)), (dt(17, 12, ), dt(17, 21))];
        let now = dt(16, 10);
        let slots = compute_free_slots(&busy, dt(17, 0), dt(17, 23), 90, now, 9, 22);
        // Only 21:00–22:00 remains and it is shorter than 90 minutes.
        assert!(slots.is_empty());
    }

    #[test]
    fn test_past_slots_suppressed_today() {
        let now = dt(17, 20);
        let slots = compute_free_slots(&[], dt(17, 0), dt(17, 23), 60, now, 9, 22);
        // The 09:00 start is in the past; nothing qualifies except nothing —
        // the whole-day slot starts at 09:00 which is <= now.
        assert!(slots.is_empty());

        let now_early = dt(17, 8);
        let slots = compute_free_slots(&[], dt(17, 0), dt(17, 23), 60, now_early, 9, 22);
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_all_day_event_blocks_whole_day() {
        let busy = vec![(dt(17, 0), dt(18, 0))];
        let now = dt(16, 10);
        let slots = compute_free_slots(&busy, dt(17, 0), dt(17, 23), 60, now, 9, 22);
        assert!(slots.is_empty());
    }
}
