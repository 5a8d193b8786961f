use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use icalendar::parser::{read_calendar, unfold, Component, Property};
use icalendar::{CalendarDateTime, DatePerhapsTime};

/// One side of an event, as written in the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBoundary {
    Date(NaiveDate),
    Utc(DateTime<Utc>),
    Floating(NaiveDateTime),
    Zoned { date_time: NaiveDateTime, tzid: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub start: EventBoundary,
    pub end: Option<EventBoundary>,
}

impl RawEvent {
    pub fn is_cancelled(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| status.trim().eq_ignore_ascii_case("CANCELLED"))
    }
}

pub trait IcsParser: Send + Sync {
    fn parse(&self, payload: &str) -> Result<Vec<RawEvent>, InfraError>;
}

/// Reads VEVENTs with the `icalendar` crate's parser. Events without a usable
/// DTSTART are skipped rather than failing the whole feed.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcalendarParser;

impl IcalendarParser {
    pub fn new() -> Self {
        Self
    }

    fn collect_events<'a>(components: &'a [Component<'a>], events: &mut Vec<&'a Component<'a>>) {
        for component in components {
            if component.name == "VEVENT" {
                events.push(component);
            } else {
                Self::collect_events(&component.components, events);
            }
        }
    }

    fn to_raw_event(vevent: &Component<'_>) -> Option<RawEvent> {
        let uid = text_prop(vevent, "UID");
        let Some(start) = vevent.find_prop("DTSTART").and_then(boundary) else {
            tracing::warn!(uid = uid.as_deref().unwrap_or("-"), "skipping VEVENT without a usable DTSTART");
            return None;
        };
        Some(RawEvent {
            uid,
            summary: text_prop(vevent, "SUMMARY"),
            description: text_prop(vevent, "DESCRIPTION"),
            status: text_prop(vevent, "STATUS"),
            start,
            end: vevent.find_prop("DTEND").and_then(boundary),
        })
    }
}

impl IcsParser for IcalendarParser {
    fn parse(&self, payload: &str) -> Result<Vec<RawEvent>, InfraError> {
        if !payload.to_ascii_uppercase().contains("BEGIN:VCALENDAR") {
            return Err(InfraError::Parse("payload is not an iCalendar document".to_string()));
        }

        let unfolded = unfold(payload);
        let calendar = read_calendar(&unfolded)
            .map_err(|error| InfraError::Parse(format!("invalid iCalendar payload: {error}")))?;

        let mut vevents = Vec::new();
        Self::collect_events(&calendar.components, &mut vevents);
        Ok(vevents.into_iter().filter_map(Self::to_raw_event).collect())
    }
}

fn text_prop(component: &Component<'_>, name: &str) -> Option<String> {
    component
        .find_prop(name)
        .map(|property| unescape_text(property.val.as_ref()))
        .filter(|value| !value.trim().is_empty())
}

fn boundary(property: &Property<'_>) -> Option<EventBoundary> {
    match DatePerhapsTime::try_from(property) {
        Ok(DatePerhapsTime::Date(date)) => Some(EventBoundary::Date(date)),
        Ok(DatePerhapsTime::DateTime(CalendarDateTime::Utc(date_time))) => {
            Some(EventBoundary::Utc(date_time))
        }
        Ok(DatePerhapsTime::DateTime(CalendarDateTime::Floating(date_time))) => {
            Some(EventBoundary::Floating(date_time))
        }
        Ok(DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid })) => {
            Some(EventBoundary::Zoned { date_time, tzid })
        }
        // Some feeds send bare dates without VALUE=DATE.
        Err(_) => NaiveDate::parse_from_str(property.val.as_ref().trim(), "%Y%m%d")
            .ok()
            .map(EventBoundary::Date),
    }
}

fn unescape_text(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(character) = chars.next() {
        if character != '\\' {
            output.push(character);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => output.push('\n'),
            Some(escaped) => output.push(escaped),
            None => output.push('\\'),
        }
    }
    output
}
