use crate::application::ics_sync::IcsSyncEngine;
use crate::application::registry::ExternalCalendarRegistry;
use crate::domain::conflicts::find_conflicts;
use crate::domain::models::{CalendarId, Conflict};
use crate::infrastructure::calendar_repository::CalendarRepository;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::ics_client::IcsFetcher;
use crate::infrastructure::ics_parser::IcsParser;
use std::collections::HashSet;

/// Reports days that two or more external calendars both claim, straight from
/// their live feeds. Nothing is written.
pub struct ConflictAnalyzer<'a, F, P>
where
    F: IcsFetcher + ?Sized,
    P: IcsParser + ?Sized,
{
    engine: &'a IcsSyncEngine<F, P>,
}

impl<'a, F, P> ConflictAnalyzer<'a, F, P>
where
    F: IcsFetcher + ?Sized + 'static,
    P: IcsParser + ?Sized,
{
    pub fn new(engine: &'a IcsSyncEngine<F, P>) -> Self {
        Self { engine }
    }

    pub async fn analyze<R>(
        &self,
        registry: &ExternalCalendarRegistry<R>,
        calendar_ids: &[CalendarId],
    ) -> Result<Vec<Conflict>, InfraError>
    where
        R: CalendarRepository + ?Sized,
    {
        let mut seen = HashSet::new();
        let unique_ids = calendar_ids
            .iter()
            .copied()
            .filter(|calendar_id| seen.insert(*calendar_id))
            .collect::<Vec<_>>();
        if unique_ids.len() < 2 {
            return Ok(Vec::new());
        }

        let calendars = unique_ids
            .into_iter()
            .map(|calendar_id| registry.get(calendar_id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut events = Vec::new();
        for calendar in &calendars {
            events.extend(self.engine.fetch_events(calendar).await?);
        }

        let conflicts = find_conflicts(&events);
        tracing::info!(
            property_id = registry.property_id(),
            calendars = calendar_ids.len(),
            conflicts = conflicts.len(),
            "calendar conflicts analyzed"
        );
        Ok(conflicts)
    }
}
