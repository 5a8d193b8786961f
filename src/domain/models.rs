use crate::domain::date_range::DateRange;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub type PropertyId = i64;
pub type CalendarId = i64;

const ICS_URL_SCHEMES: [&str; 3] = ["http", "https", "webcal"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedDay {
    pub date: NaiveDate,
    pub reason: Option<String>,
    pub is_check_in: bool,
    pub is_check_out: bool,
    pub source_calendar_id: Option<CalendarId>,
}

impl BlockedDay {
    pub fn manual(date: NaiveDate, reason: Option<String>) -> Self {
        Self {
            date,
            reason,
            is_check_in: false,
            is_check_out: false,
            source_calendar_id: None,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.source_calendar_id.is_none()
    }
}

/// One external calendar's hold on a day. Several calendars may claim the same day;
/// the visible [`BlockedDay`] is resolved from the manual entry and every claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalendarClaim {
    pub calendar_id: CalendarId,
    pub date: NaiveDate,
    pub reason: Option<String>,
    pub is_check_in: bool,
    pub is_check_out: bool,
}

impl CalendarClaim {
    pub fn from_day(calendar_id: CalendarId, day: &BlockedDay) -> Self {
        Self {
            calendar_id,
            date: day.date,
            reason: day.reason.clone(),
            is_check_in: day.is_check_in,
            is_check_out: day.is_check_out,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DayStatus {
    pub blocked: bool,
    pub check_in: bool,
    pub check_out: bool,
    pub reason: Option<String>,
    pub source_calendar_id: Option<CalendarId>,
}

impl From<&BlockedDay> for DayStatus {
    fn from(day: &BlockedDay) -> Self {
        Self {
            blocked: true,
            check_in: day.is_check_in,
            check_out: day.is_check_out,
            reason: day.reason.clone(),
            source_calendar_id: day.source_calendar_id,
        }
    }
}

/// Outcome of an add-period or add-days request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AddResult {
    Committed { dates: Vec<NaiveDate> },
    /// Nothing was written; resend with `force` to overwrite these dates.
    Conflict { dates: Vec<NaiveDate> },
}

impl AddResult {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        match self {
            Self::Committed { dates } | Self::Conflict { dates } => dates,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub reason: Option<String>,
    pub dates: Vec<NaiveDate>,
}

impl Period {
    pub fn range(&self) -> DateRange {
        DateRange::from_exclusive_end(self.start, self.end.succ_opt().unwrap_or(self.end))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalCalendar {
    pub id: CalendarId,
    pub property_id: PropertyId,
    pub name: String,
    pub ics_url: String,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub total_events: u32,
}

impl ExternalCalendar {
    pub fn validate(&self) -> Result<(), String> {
        validate_calendar_source(&self.name, &self.ics_url)?;
        if self.last_sync_at.is_none() && self.total_events > 0 {
            return Err("calendar.total_events requires a completed sync".to_string());
        }
        Ok(())
    }
}

/// Checks the operator-supplied fields of a new external calendar. Reachability is
/// left to the first sync.
pub fn validate_calendar_source(name: &str, ics_url: &str) -> Result<(), String> {
    validate_non_empty(name, "calendar.name")?;
    validate_non_empty(ics_url, "calendar.ics_url")?;
    let parsed = Url::parse(ics_url.trim())
        .map_err(|error| format!("calendar.ics_url is not a valid URL: {error}"))?;
    if !ICS_URL_SCHEMES.contains(&parsed.scheme()) {
        return Err(format!(
            "calendar.ics_url scheme '{}' is not supported",
            parsed.scheme()
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncEvent {
    pub calendar_id: CalendarId,
    pub calendar_name: String,
    pub range: DateRange,
    pub summary: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Conflict {
    pub date: NaiveDate,
    pub conflicting_calendars: Vec<SyncEvent>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalendarSyncStatus {
    /// `skipped_events` fell wholly outside the sync horizon.
    Synced { events: u32, skipped_events: u32 },
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CalendarSyncOutcome {
    pub calendar_id: CalendarId,
    pub calendar_name: String,
    pub status: CalendarSyncStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub synced_calendars: u32,
    pub failed_calendars: u32,
    pub skipped_calendars: u32,
    pub total_events: u32,
    pub skipped_events: u32,
    pub outcomes: Vec<CalendarSyncOutcome>,
}

impl SyncReport {
    pub fn record(&mut self, outcome: CalendarSyncOutcome) {
        match &outcome.status {
            CalendarSyncStatus::Synced {
                events,
                skipped_events,
            } => {
                self.synced_calendars += 1;
                self.total_events += events;
                self.skipped_events += skipped_events;
            }
            CalendarSyncStatus::Failed { .. } => self.failed_calendars += 1,
            CalendarSyncStatus::Skipped => self.skipped_calendars += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failed_calendars > 0 && self.synced_calendars > 0
    }
}

pub(crate) fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
