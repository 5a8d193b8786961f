use crate::application::property_calendar::PropertyCalendar;
use crate::domain::models::{validate_calendar_source, CalendarId, ExternalCalendar, PropertyId};
use crate::infrastructure::calendar_repository::CalendarRepository;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// External ICS calendars subscribed by one property.
pub struct ExternalCalendarRegistry<R: CalendarRepository + ?Sized> {
    property_id: PropertyId,
    repository: Arc<R>,
}

impl<R: CalendarRepository + ?Sized> ExternalCalendarRegistry<R> {
    pub fn new(property_id: PropertyId, repository: Arc<R>) -> Self {
        Self {
            property_id,
            repository,
        }
    }

    pub fn property_id(&self) -> PropertyId {
        self.property_id
    }

    pub fn add(&self, name: &str, ics_url: &str) -> Result<ExternalCalendar, InfraError> {
        validate_calendar_source(name, ics_url).map_err(InfraError::Validation)?;
        let calendar =
            self.repository
                .insert_external_calendar(self.property_id, name.trim(), ics_url.trim())?;
        tracing::info!(
            property_id = self.property_id,
            calendar_id = calendar.id,
            name = %calendar.name,
            "external calendar added"
        );
        Ok(calendar)
    }

    /// Deletes the subscription. With `also_remove_blocked_days`, days imported from
    /// it are removed first; manual days and days of other calendars are kept.
    pub fn remove(
        &self,
        calendar: &mut PropertyCalendar<R>,
        calendar_id: CalendarId,
        also_remove_blocked_days: bool,
    ) -> Result<(), InfraError> {
        self.get(calendar_id)?;
        if also_remove_blocked_days {
            calendar.remove_calendar_days(calendar_id)?;
        }
        self.repository
            .delete_external_calendar(self.property_id, calendar_id)?;
        tracing::info!(
            property_id = self.property_id,
            calendar_id,
            also_remove_blocked_days,
            "external calendar removed"
        );
        Ok(())
    }

    pub fn toggle(&self, calendar_id: CalendarId, enabled: bool) -> Result<ExternalCalendar, InfraError> {
        let mut calendar = self.get(calendar_id)?;
        calendar.enabled = enabled;
        self.repository.save_external_calendar(&calendar)?;
        Ok(calendar)
    }

    pub fn list(&self) -> Result<Vec<ExternalCalendar>, InfraError> {
        self.repository.load_external_calendars(self.property_id)
    }

    pub fn enabled(&self) -> Result<Vec<ExternalCalendar>, InfraError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|calendar| calendar.enabled)
            .collect())
    }

    pub fn get(&self, calendar_id: CalendarId) -> Result<ExternalCalendar, InfraError> {
        self.list()?
            .into_iter()
            .find(|calendar| calendar.id == calendar_id)
            .ok_or_else(|| {
                InfraError::NotFound(format!(
                    "external calendar {calendar_id} of property {}",
                    self.property_id
                ))
            })
    }

    pub fn record_sync_success(
        &self,
        calendar_id: CalendarId,
        total_events: u32,
        synced_at: DateTime<Utc>,
    ) -> Result<ExternalCalendar, InfraError> {
        let mut calendar = self.get(calendar_id)?;
        calendar.sync_error = None;
        calendar.last_sync_at = Some(synced_at);
        calendar.total_events = total_events;
        self.repository.save_external_calendar(&calendar)?;
        Ok(calendar)
    }

    /// Keeps `last_sync_at` and `total_events` from the last good sync.
    pub fn record_sync_failure(
        &self,
        calendar_id: CalendarId,
        error: &str,
    ) -> Result<ExternalCalendar, InfraError> {
        let mut calendar = self.get(calendar_id)?;
        calendar.sync_error = Some(error.to_string());
        self.repository.save_external_calendar(&calendar)?;
        Ok(calendar)
    }
}
