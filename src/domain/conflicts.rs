use crate::domain::models::{CalendarId, Conflict, SyncEvent};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashSet};

/// Returns one entry per day claimed by at least two distinct calendars, in date
/// order. Each entry lists every contributing event in input order.
pub fn find_conflicts(events: &[SyncEvent]) -> Vec<Conflict> {
    let mut claims: BTreeMap<NaiveDate, Vec<&SyncEvent>> = BTreeMap::new();
    for event in events {
        for day in event.range.days() {
            claims.entry(day).or_default().push(event);
        }
    }

    claims
        .into_iter()
        .filter(|(_, claimants)| distinct_calendars(claimants) >= 2)
        .map(|(date, claimants)| Conflict {
            date,
            conflicting_calendars: claimants.into_iter().cloned().collect(),
        })
        .collect()
}

fn distinct_calendars(claimants: &[&SyncEvent]) -> usize {
    claimants
        .iter()
        .map(|event| event.calendar_id)
        .collect::<HashSet<CalendarId>>()
        .len()
}
