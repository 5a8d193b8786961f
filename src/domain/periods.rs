use crate::domain::blocked_dates::BlockedDateStore;
use crate::domain::models::{BlockedDay, Period};

/// Collapses blocked days into contiguous runs that share a reason.
pub struct PeriodMerger;

impl PeriodMerger {
    pub fn merge(store: &BlockedDateStore) -> Vec<Period> {
        Self::merge_days(store.iter())
    }

    /// Sorts, then sweeps once: a day extends the open period only when it falls on
    /// the next calendar day and carries the same reason (`None == None`).
    pub fn merge_days<'a>(days: impl IntoIterator<Item = &'a BlockedDay>) -> Vec<Period> {
        let mut sorted: Vec<&BlockedDay> = days.into_iter().collect();
        sorted.sort_by_key(|day| day.date);

        let mut periods: Vec<Period> = Vec::new();
        for day in sorted {
            if let Some(current) = periods.last_mut() {
                let is_next_day = current.end.succ_opt() == Some(day.date);
                if is_next_day && current.reason == day.reason {
                    current.end = day.date;
                    current.dates.push(day.date);
                    continue;
                }
            }
            periods.push(Period {
                start: day.date,
                end: day.date,
                reason: day.reason.clone(),
                dates: vec![day.date],
            });
        }
        periods
    }
}
