use chrono::{Duration, NaiveDate};
use serde::Serialize;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Inclusive range of calendar days. Time of day never takes part in comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if end < start {
            return Err(format!(
                "range end {} must not be before start {}",
                end.format(DATE_FORMAT),
                start.format(DATE_FORMAT)
            ));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Builds an inclusive range from an exclusive end bound, as used by iCalendar
    /// `DTEND`. An end at or before `start` collapses to the single day `start`.
    pub fn from_exclusive_end(start: NaiveDate, end_exclusive: NaiveDate) -> Self {
        let end = end_exclusive
            .pred_opt()
            .filter(|last| *last >= start)
            .unwrap_or(start);
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        Self::new(normalize_date(start)?, normalize_date(end)?)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// The day after `end`, i.e. the iCalendar `DTEND` of this range.
    pub fn exclusive_end(&self) -> NaiveDate {
        self.end + Duration::days(1)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersection(&self, other: &DateRange) -> Option<DateRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }
}

/// Parses a calendar day, dropping any trailing time-of-day component.
///
/// Persisted rows and upstream payloads sometimes carry `2024-06-01T00:00:00` or
/// `2024-06-01 00:00:00` where a plain date is expected; both normalize to
/// `2024-06-01`.
pub fn normalize_date(value: &str) -> Result<NaiveDate, String> {
    let trimmed = value.trim();
    let date_part = trimmed
        .split(['T', ' '])
        .next()
        .unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, DATE_FORMAT)
        .map_err(|_| format!("invalid date '{trimmed}': expected YYYY-MM-DD"))
}
