use crate::domain::date_range::DateRange;
use crate::domain::models::{BlockedDay, ExternalCalendar, SyncEvent};
use crate::infrastructure::ics_parser::{EventBoundary, RawEvent};
use chrono::{Days, NaiveDate};
use chrono_tz::Tz;

const DEFAULT_SUMMARY: &str = "Blocked";

/// Calendar day of an event boundary. UTC instants are read in the property's time
/// zone; floating and TZID-qualified times keep their wall-clock date.
pub fn boundary_date(boundary: &EventBoundary, time_zone: Tz) -> NaiveDate {
    match boundary {
        EventBoundary::Date(date) => *date,
        EventBoundary::Utc(date_time) => date_time.with_timezone(&time_zone).date_naive(),
        EventBoundary::Floating(date_time) => date_time.date(),
        EventBoundary::Zoned { date_time, .. } => date_time.date(),
    }
}

/// Inclusive blocked range of an event. `DTEND` is exclusive, so the last blocked
/// day is the one before it; a missing or non-advancing end blocks the start day only.
pub fn event_range(event: &RawEvent, time_zone: Tz) -> DateRange {
    let start = boundary_date(&event.start, time_zone);
    match &event.end {
        Some(end) => DateRange::from_exclusive_end(start, boundary_date(end, time_zone)),
        None => DateRange::single(start),
    }
}

pub fn to_sync_event(
    calendar: &ExternalCalendar,
    event: &RawEvent,
    time_zone: Tz,
) -> Option<SyncEvent> {
    if event.is_cancelled() {
        return None;
    }
    Some(SyncEvent {
        calendar_id: calendar.id,
        calendar_name: calendar.name.clone(),
        range: event_range(event, time_zone),
        summary: event
            .summary
            .as_deref()
            .map(str::trim)
            .filter(|summary| !summary.is_empty())
            .unwrap_or(DEFAULT_SUMMARY)
            .to_string(),
        description: event.description.clone(),
    })
}

pub fn to_sync_events(
    calendar: &ExternalCalendar,
    events: &[RawEvent],
    time_zone: Tz,
) -> Vec<SyncEvent> {
    events
        .iter()
        .filter_map(|event| to_sync_event(calendar, event, time_zone))
        .collect()
}

/// Days synced events may cover: `horizon_days` either side of `today`, saturating
/// at the ends of the supported calendar.
pub fn sync_window(today: NaiveDate, horizon_days: u32) -> DateRange {
    let span = Days::new(u64::from(horizon_days));
    let start = today.checked_sub_days(span).unwrap_or(NaiveDate::MIN);
    let end = today.checked_add_days(span).unwrap_or(NaiveDate::MAX);
    DateRange::new(start, end).unwrap_or(DateRange::single(today))
}

/// Cuts every event down to `window`. Events wholly outside it are dropped and
/// counted in the second value.
pub fn clamp_to_window(events: Vec<SyncEvent>, window: &DateRange) -> (Vec<SyncEvent>, u32) {
    let mut skipped = 0u32;
    let kept = events
        .into_iter()
        .filter_map(|mut event| match event.range.intersection(window) {
            Some(range) => {
                event.range = range;
                Some(event)
            }
            None => {
                skipped = skipped.saturating_add(1);
                None
            }
        })
        .collect();
    (kept, skipped)
}

/// Blocked days for one synced event: arrival night is check-in, last occupied
/// night is check-out. The calendar name is the reason.
pub fn to_blocked_days(event: &SyncEvent) -> Vec<BlockedDay> {
    let start = event.range.start();
    let end = event.range.end();
    event
        .range
        .days()
        .map(|date| BlockedDay {
            date,
            reason: Some(event.calendar_name.clone()),
            is_check_in: date == start,
            is_check_out: date == end,
            source_calendar_id: Some(event.calendar_id),
        })
        .collect()
}
