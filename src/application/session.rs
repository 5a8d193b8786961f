use crate::application::property_calendar::{AvailabilityEditor, PropertyCalendar};
use crate::application::staging::{FlushReport, StagingAdapter};
use crate::domain::models::PropertyId;
use crate::infrastructure::calendar_repository::CalendarRepository;
use crate::infrastructure::error::InfraError;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

pub type SharedCalendar<R> = Arc<AsyncMutex<PropertyCalendar<R>>>;

/// Availability editing context: staged until the property has an id, persisted
/// afterwards.
pub enum CalendarSession<R: CalendarRepository + ?Sized> {
    Staging(StagingAdapter),
    Persisted(SharedCalendar<R>),
}

impl<R: CalendarRepository + ?Sized> CalendarSession<R> {
    pub fn staging() -> Self {
        Self::Staging(StagingAdapter::new())
    }

    pub fn persisted(calendar: PropertyCalendar<R>) -> Self {
        Self::Persisted(Arc::new(AsyncMutex::new(calendar)))
    }

    pub fn is_staging(&self) -> bool {
        matches!(self, Self::Staging(_))
    }

    /// Runs `edit` against whichever store backs this session.
    pub async fn with_editor<T>(&mut self, edit: impl FnOnce(&mut dyn AvailabilityEditor) -> T) -> T {
        match self {
            Self::Staging(adapter) => edit(adapter),
            Self::Persisted(calendar) => {
                let mut calendar = calendar.lock().await;
                edit(&mut *calendar)
            }
        }
    }

    /// Capabilities that need a saved property (external calendars, sync, export).
    pub fn ensure_persisted(&self) -> Result<SharedCalendar<R>, InfraError> {
        match self {
            Self::Staging(_) => Err(InfraError::StagingUnsupported(
                "external calendars can be managed once the property is saved".to_string(),
            )),
            Self::Persisted(calendar) => Ok(Arc::clone(calendar)),
        }
    }

    /// Replays staged edits into `calendar` and switches the session to it. On error
    /// the session stays staged with the operations that were not yet accepted.
    pub async fn property_created(
        &mut self,
        mut calendar: PropertyCalendar<R>,
    ) -> Result<FlushReport, InfraError> {
        let Self::Staging(adapter) = self else {
            return Err(InfraError::Validation(format!(
                "session already belongs to property {}",
                property_id_of(self).await.unwrap_or_default()
            )));
        };

        let report = adapter.flush(&mut calendar)?;
        tracing::info!(
            property_id = calendar.property_id(),
            replayed = report.replayed_operations,
            "staging session promoted to property"
        );
        *self = Self::persisted(calendar);
        Ok(report)
    }

    pub async fn property_id(&self) -> Option<PropertyId> {
        property_id_of(self).await
    }
}

async fn property_id_of<R: CalendarRepository + ?Sized>(
    session: &CalendarSession<R>,
) -> Option<PropertyId> {
    match session {
        CalendarSession::Staging(_) => None,
        CalendarSession::Persisted(calendar) => Some(calendar.lock().await.property_id()),
    }
}
