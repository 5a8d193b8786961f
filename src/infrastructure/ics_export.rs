use crate::domain::blocked_dates::BlockedDateStore;
use crate::domain::models::PropertyId;
use crate::domain::periods::PeriodMerger;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use icalendar::{Calendar, Component, EventLike, Property, ValueType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_SUMMARY: &str = "Blocked";
const UID_DOMAIN: &str = "rentcal";

/// Notified after every committed change to a property's blocked days.
pub trait ExportTrigger: Send + Sync {
    fn blocked_days_changed(&self, property_id: PropertyId, store: &BlockedDateStore);
}

/// Renders a property's blocked days as an iCalendar feed: one all-day VEVENT per
/// merged period, `DTEND` exclusive.
#[derive(Clone)]
pub struct IcsExporter {
    now_provider: NowProvider,
}

impl Default for IcsExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IcsExporter {
    pub fn new() -> Self {
        Self {
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn export(
        &self,
        property_id: PropertyId,
        property_name: &str,
        store: &BlockedDateStore,
    ) -> String {
        let dtstamp = (self.now_provider)().format("%Y%m%dT%H%M%SZ").to_string();
        let mut calendar = Calendar::new();
        calendar.name(property_name);

        for period in PeriodMerger::merge(store) {
            let range = period.range();
            let mut event = icalendar::Event::new();
            event.uid(&format!(
                "{property_id}-{}-{}@{UID_DOMAIN}",
                range.start().format("%Y%m%d"),
                range.end().format("%Y%m%d")
            ));
            event.summary(period.reason.as_deref().unwrap_or(DEFAULT_SUMMARY));
            event.add_property("DTSTAMP", &dtstamp);

            let mut start = Property::new("DTSTART", range.start().format("%Y%m%d").to_string());
            start.append_parameter(ValueType::Date);
            event.append_property(start);
            let mut end = Property::new("DTEND", range.exclusive_end().format("%Y%m%d").to_string());
            end.append_parameter(ValueType::Date);
            event.append_property(end);

            calendar.push(event.done());
        }

        calendar.done().to_string()
    }
}

/// Keeps the latest rendered feed per property so it can be served without
/// re-rendering.
pub struct CachedIcsFeed {
    exporter: IcsExporter,
    base_url: Option<String>,
    feeds: Mutex<HashMap<PropertyId, String>>,
}

impl CachedIcsFeed {
    pub fn new(exporter: IcsExporter, base_url: Option<String>) -> Self {
        Self {
            exporter,
            base_url: base_url
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty()),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub fn feed(&self, property_id: PropertyId) -> Result<Option<String>, InfraError> {
        let feeds = self
            .feeds
            .lock()
            .map_err(|error| InfraError::Persistence(format!("export feed lock poisoned: {error}")))?;
        Ok(feeds.get(&property_id).cloned())
    }

    /// Renders and caches the feed for `store` right away.
    pub fn refresh(
        &self,
        property_id: PropertyId,
        store: &BlockedDateStore,
    ) -> Result<String, InfraError> {
        let rendered = self
            .exporter
            .export(property_id, &format!("Property {property_id}"), store);
        let mut feeds = self
            .feeds
            .lock()
            .map_err(|error| InfraError::Persistence(format!("export feed lock poisoned: {error}")))?;
        feeds.insert(property_id, rendered.clone());
        Ok(rendered)
    }

    pub fn feed_url(&self, property_id: PropertyId) -> Option<String> {
        self.base_url
            .as_deref()
            .map(|base| format!("{base}/properties/{property_id}/calendar.ics"))
    }
}

impl ExportTrigger for CachedIcsFeed {
    fn blocked_days_changed(&self, property_id: PropertyId, store: &BlockedDateStore) {
        match self.refresh(property_id, store) {
            Ok(_) => tracing::debug!(property_id, days = store.len(), "export feed refreshed"),
            Err(error) => tracing::error!(property_id, %error, "export feed refresh failed"),
        }
    }
}
