use crate::domain::blocked_dates::{BlockedDateStore, StoreChange};
use crate::domain::date_range::DateRange;
use crate::domain::models::{AddResult, BlockedDay, CalendarId, DayStatus, Period, PropertyId};
use crate::domain::periods::PeriodMerger;
use crate::infrastructure::calendar_repository::CalendarRepository;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::ics_export::ExportTrigger;
use chrono::NaiveDate;
use std::sync::Arc;

/// Operations available on a property's availability, whether or not the property
/// has been saved yet.
pub trait AvailabilityEditor: Send {
    fn add_period(
        &mut self,
        range: DateRange,
        reason: Option<String>,
        force: bool,
    ) -> Result<AddResult, InfraError>;

    fn add_days(
        &mut self,
        dates: &[NaiveDate],
        reason: Option<String>,
        force: bool,
    ) -> Result<AddResult, InfraError>;

    /// Returns the dates that were actually blocked before the call.
    fn remove_dates(&mut self, dates: &[NaiveDate]) -> Result<Vec<NaiveDate>, InfraError>;

    fn status(&self, date: NaiveDate) -> DayStatus;

    fn periods(&self) -> Vec<Period>;
}

/// Persisted blocked-date store of one property.
///
/// Every mutation is applied to the in-memory store first, then written through the
/// repository. A failed write restores the store to its state before the mutation,
/// and only committed, non-empty changes reach the export trigger.
pub struct PropertyCalendar<R: CalendarRepository + ?Sized> {
    property_id: PropertyId,
    repository: Arc<R>,
    store: BlockedDateStore,
    export: Arc<dyn ExportTrigger>,
}

impl<R: CalendarRepository + ?Sized> PropertyCalendar<R> {
    pub fn load(
        property_id: PropertyId,
        repository: Arc<R>,
        export: Arc<dyn ExportTrigger>,
    ) -> Result<Self, InfraError> {
        let store = Self::restore_store(repository.as_ref(), property_id)?;
        Ok(Self {
            property_id,
            repository,
            store,
            export,
        })
    }

    pub fn property_id(&self) -> PropertyId {
        self.property_id
    }

    pub fn store(&self) -> &BlockedDateStore {
        &self.store
    }

    /// Discards the in-memory store and rebuilds it from the repository.
    pub fn reload(&mut self) -> Result<(), InfraError> {
        self.store = Self::restore_store(self.repository.as_ref(), self.property_id)?;
        Ok(())
    }

    fn restore_store(repository: &R, property_id: PropertyId) -> Result<BlockedDateStore, InfraError> {
        Ok(BlockedDateStore::restore(
            repository.load_blocked_days(property_id)?,
            repository.load_calendar_claims(property_id)?,
        ))
    }

    pub fn replace_calendar_days(
        &mut self,
        calendar_id: CalendarId,
        days: Vec<BlockedDay>,
    ) -> Result<StoreChange, InfraError> {
        self.commit("replace_calendar_days", |store| {
            let change = store.replace_calendar_days(calendar_id, days);
            (change.clone(), change)
        })
    }

    pub fn remove_calendar_days(&mut self, calendar_id: CalendarId) -> Result<StoreChange, InfraError> {
        self.commit("remove_calendar_days", |store| {
            let change = store.remove_calendar_days(calendar_id);
            (change.clone(), change)
        })
    }

    fn commit<T>(
        &mut self,
        operation: &str,
        mutate: impl FnOnce(&mut BlockedDateStore) -> (T, StoreChange),
    ) -> Result<T, InfraError> {
        let snapshot = self.store.clone();
        let (value, change) = mutate(&mut self.store);
        if change.is_empty() {
            return Ok(value);
        }

        if let Err(error) = self.repository.save_store_change(self.property_id, &change) {
            self.store = snapshot;
            tracing::error!(
                property_id = self.property_id,
                operation,
                %error,
                "blocked days write failed; store rolled back"
            );
            return Err(error);
        }

        tracing::debug!(
            property_id = self.property_id,
            operation,
            added = change.added.len(),
            removed = change.removed.len(),
            claimed = change.claimed.len(),
            released = change.released.len(),
            "blocked days committed"
        );
        self.export.blocked_days_changed(self.property_id, &self.store);
        Ok(value)
    }
}

impl<R: CalendarRepository + ?Sized> AvailabilityEditor for PropertyCalendar<R> {
    fn add_period(
        &mut self,
        range: DateRange,
        reason: Option<String>,
        force: bool,
    ) -> Result<AddResult, InfraError> {
        self.commit("add_period", |store| {
            let outcome = store.add_period(range, reason, force);
            (outcome.result, outcome.change)
        })
    }

    fn add_days(
        &mut self,
        dates: &[NaiveDate],
        reason: Option<String>,
        force: bool,
    ) -> Result<AddResult, InfraError> {
        self.commit("add_days", |store| {
            let outcome = store.add_days(dates, reason, force);
            (outcome.result, outcome.change)
        })
    }

    fn remove_dates(&mut self, dates: &[NaiveDate]) -> Result<Vec<NaiveDate>, InfraError> {
        self.commit("remove_dates", |store| {
            let change = store.remove_dates(dates);
            (change.removed.clone(), change)
        })
    }

    fn status(&self, date: NaiveDate) -> DayStatus {
        self.store.status(date)
    }

    fn periods(&self) -> Vec<Period> {
        PeriodMerger::merge(&self.store)
    }
}
