use crate::application::property_calendar::AvailabilityEditor;
use crate::domain::blocked_dates::BlockedDateStore;
use crate::domain::date_range::DateRange;
use crate::domain::models::{AddResult, DayStatus, Period};
use crate::domain::periods::PeriodMerger;
use crate::infrastructure::error::InfraError;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedOperation {
    AddPeriod {
        range: DateRange,
        reason: Option<String>,
        force: bool,
    },
    AddDays {
        dates: Vec<NaiveDate>,
        reason: Option<String>,
        force: bool,
    },
    RemoveDates {
        dates: Vec<NaiveDate>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub replayed_operations: usize,
    /// Dates a replayed add could not claim because the target already had them.
    pub conflicts: Vec<NaiveDate>,
}

/// Availability edits made before the property exists. Edits run against a local
/// store with the usual conflict rules and are logged so they can be replayed once
/// the property is saved.
#[derive(Debug, Default)]
pub struct StagingAdapter {
    store: BlockedDateStore,
    log: VecDeque<StagedOperation>,
}

impl StagingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_operations(&self) -> usize {
        self.log.len()
    }

    pub fn store(&self) -> &BlockedDateStore {
        &self.store
    }

    /// Replays the log against `target` in order. An operation leaves the log only
    /// once `target` has accepted it, so a failed flush can be retried.
    pub fn flush(&mut self, target: &mut dyn AvailabilityEditor) -> Result<FlushReport, InfraError> {
        let mut report = FlushReport::default();
        while let Some(operation) = self.log.front().cloned() {
            let result = match operation {
                StagedOperation::AddPeriod { range, reason, force } => {
                    Some(target.add_period(range, reason, force)?)
                }
                StagedOperation::AddDays { dates, reason, force } => {
                    Some(target.add_days(&dates, reason, force)?)
                }
                StagedOperation::RemoveDates { dates } => {
                    target.remove_dates(&dates)?;
                    None
                }
            };
            if let Some(AddResult::Conflict { dates }) = result {
                report.conflicts.extend(dates);
            }
            self.log.pop_front();
            report.replayed_operations += 1;
        }

        self.store = BlockedDateStore::new();
        tracing::info!(
            replayed = report.replayed_operations,
            conflicts = report.conflicts.len(),
            "staged availability flushed"
        );
        Ok(report)
    }
}

impl AvailabilityEditor for StagingAdapter {
    fn add_period(
        &mut self,
        range: DateRange,
        reason: Option<String>,
        force: bool,
    ) -> Result<AddResult, InfraError> {
        let outcome = self.store.add_period(range, reason.clone(), force);
        if !outcome.result.is_conflict() {
            self.log.push_back(StagedOperation::AddPeriod { range, reason, force });
        }
        Ok(outcome.result)
    }

    fn add_days(
        &mut self,
        dates: &[NaiveDate],
        reason: Option<String>,
        force: bool,
    ) -> Result<AddResult, InfraError> {
        let outcome = self.store.add_days(dates, reason.clone(), force);
        if !outcome.result.is_conflict() {
            self.log.push_back(StagedOperation::AddDays {
                dates: outcome.result.dates().to_vec(),
                reason,
                force,
            });
        }
        Ok(outcome.result)
    }

    fn remove_dates(&mut self, dates: &[NaiveDate]) -> Result<Vec<NaiveDate>, InfraError> {
        let change = self.store.remove_dates(dates);
        if !change.removed.is_empty() {
            self.log.push_back(StagedOperation::RemoveDates {
                dates: change.removed.clone(),
            });
        }
        Ok(change.removed)
    }

    fn status(&self, date: NaiveDate) -> DayStatus {
        self.store.status(date)
    }

    fn periods(&self) -> Vec<Period> {
        PeriodMerger::merge(&self.store)
    }
}
