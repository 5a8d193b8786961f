use crate::application::registry::ExternalCalendarRegistry;
use crate::application::session::SharedCalendar;
use crate::domain::models::{
    CalendarSyncOutcome, CalendarSyncStatus, ExternalCalendar, PropertyId, SyncEvent, SyncReport,
};
use crate::infrastructure::calendar_repository::CalendarRepository;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{clamp_to_window, sync_window, to_blocked_days, to_sync_events};
use crate::infrastructure::ics_parser::RawEvent;
use crate::infrastructure::ics_client::IcsFetcher;
use crate::infrastructure::ics_parser::IcsParser;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const DEFAULT_HORIZON_DAYS: u32 = 730;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

/// Pulls every enabled external calendar of a property and replaces the days each
/// one owns with what its feed currently says.
pub struct IcsSyncEngine<F, P>
where
    F: IcsFetcher + ?Sized,
    P: IcsParser + ?Sized,
{
    fetcher: Arc<F>,
    parser: Arc<P>,
    retry_policy: RetryPolicy,
    fetch_timeout: Duration,
    max_concurrent_fetches: usize,
    time_zone: Tz,
    horizon_days: u32,
    now_provider: NowProvider,
    in_flight: Arc<Mutex<HashSet<PropertyId>>>,
}

struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<PropertyId>>>,
    property_id: PropertyId,
}

impl InFlightGuard {
    fn acquire(
        in_flight: &Arc<Mutex<HashSet<PropertyId>>>,
        property_id: PropertyId,
    ) -> Result<Self, InfraError> {
        let mut running = in_flight
            .lock()
            .map_err(|error| InfraError::Persistence(format!("sync registry lock poisoned: {error}")))?;
        if !running.insert(property_id) {
            return Err(InfraError::SyncInProgress(property_id));
        }
        Ok(Self {
            in_flight: Arc::clone(in_flight),
            property_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.in_flight.lock() {
            running.remove(&self.property_id);
        }
    }
}

type FetchResult = (ExternalCalendar, Result<String, InfraError>);

impl<F, P> IcsSyncEngine<F, P>
where
    F: IcsFetcher + ?Sized + 'static,
    P: IcsParser + ?Sized,
{
    pub fn new(fetcher: Arc<F>, parser: Arc<P>) -> Self {
        Self {
            fetcher,
            parser,
            retry_policy: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(30),
            max_concurrent_fetches: 4,
            time_zone: chrono_tz::UTC,
            horizon_days: DEFAULT_HORIZON_DAYS,
            now_provider: Arc::new(Utc::now),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn with_max_concurrent_fetches(mut self, max_concurrent_fetches: usize) -> Self {
        self.max_concurrent_fetches = max_concurrent_fetches.max(1);
        self
    }

    pub fn with_time_zone(mut self, time_zone: Tz) -> Self {
        self.time_zone = time_zone;
        self
    }

    pub fn with_horizon_days(mut self, horizon_days: u32) -> Self {
        self.horizon_days = horizon_days;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Syncs every enabled calendar of `registry`'s property.
    ///
    /// A calendar that fails to fetch or parse keeps its previous days and gets its
    /// `sync_error` set; the rest of the batch carries on. The same failure status
    /// is reported when the days were replaced but the calendar row could not be
    /// updated afterwards. Writes happen one at a
    /// time in fetch completion order. After `cancel` fires no new fetch starts,
    /// in-flight fetches are dropped and counted as skipped.
    pub async fn sync_all<R>(
        &self,
        registry: &ExternalCalendarRegistry<R>,
        calendar: &SharedCalendar<R>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, InfraError>
    where
        R: CalendarRepository + ?Sized,
    {
        let property_id = registry.property_id();
        let _guard = InFlightGuard::acquire(&self.in_flight, property_id)?;

        let mut pending: VecDeque<ExternalCalendar> = registry.enabled()?.into();
        let mut report = SyncReport::default();
        let mut join_set: JoinSet<FetchResult> = JoinSet::new();
        tracing::info!(property_id, calendars = pending.len(), "calendar sync started");

        loop {
            while join_set.len() < self.max_concurrent_fetches && !cancel.is_cancelled() {
                let Some(next) = pending.pop_front() else {
                    break;
                };
                self.spawn_fetch(&mut join_set, next, cancel.clone());
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((external, Ok(payload))) => {
                    let outcome = self
                        .apply_payload(registry, calendar, &external, &payload)
                        .await?;
                    report.record(outcome);
                }
                Ok((external, Err(InfraError::Cancelled))) => {
                    report.record(skipped(&external));
                }
                Ok((external, Err(error))) => {
                    report.record(self.record_failure(registry, &external, &error));
                }
                Err(join_error) => {
                    tracing::error!(property_id, %join_error, "calendar fetch task failed");
                    return Err(InfraError::Fetch(format!("calendar fetch task failed: {join_error}")));
                }
            }
        }

        for external in pending {
            report.record(skipped(&external));
        }

        tracing::info!(
            property_id,
            synced = report.synced_calendars,
            failed = report.failed_calendars,
            skipped = report.skipped_calendars,
            events = report.total_events,
            skipped_events = report.skipped_events,
            "calendar sync finished"
        );
        Ok(report)
    }

    /// Fetches and normalizes one calendar without touching any stored state.
    pub async fn fetch_events(&self, calendar: &ExternalCalendar) -> Result<Vec<SyncEvent>, InfraError> {
        let payload = fetch_with_retry(
            Arc::clone(&self.fetcher),
            &calendar.ics_url,
            &self.retry_policy,
            self.fetch_timeout,
        )
        .await?;
        let events = self.parser.parse(&payload)?;
        let (events, _) = self.within_horizon(calendar, &events);
        Ok(events)
    }

    /// Normalizes `raw_events` and cuts them to the sync horizon around today in
    /// the property time zone. Returns the kept events and how many were dropped.
    fn within_horizon(&self, external: &ExternalCalendar, raw_events: &[RawEvent]) -> (Vec<SyncEvent>, u32) {
        let today = (self.now_provider)().with_timezone(&self.time_zone).date_naive();
        let window = sync_window(today, self.horizon_days);
        let (events, skipped) = clamp_to_window(to_sync_events(external, raw_events, self.time_zone), &window);
        if skipped > 0 {
            tracing::warn!(
                property_id = external.property_id,
                calendar_id = external.id,
                skipped,
                window_start = %window.start(),
                window_end = %window.end(),
                "events outside the sync horizon skipped"
            );
        }
        (events, skipped)
    }

    fn spawn_fetch(
        &self,
        join_set: &mut JoinSet<FetchResult>,
        external: ExternalCalendar,
        cancel: CancellationToken,
    ) {
        let fetcher = Arc::clone(&self.fetcher);
        let retry_policy = self.retry_policy.clone();
        let fetch_timeout = self.fetch_timeout;
        join_set.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(InfraError::Cancelled),
                result = fetch_with_retry(fetcher, &external.ics_url, &retry_policy, fetch_timeout) => result,
            };
            (external, result)
        });
    }

    async fn apply_payload<R>(
        &self,
        registry: &ExternalCalendarRegistry<R>,
        calendar: &SharedCalendar<R>,
        external: &ExternalCalendar,
        payload: &str,
    ) -> Result<CalendarSyncOutcome, InfraError>
    where
        R: CalendarRepository + ?Sized,
    {
        let raw_events = match self.parser.parse(payload) {
            Ok(raw_events) => raw_events,
            Err(error) => return Ok(self.record_failure(registry, external, &error)),
        };
        let (events, skipped_events) = self.within_horizon(external, &raw_events);
        let days = events.iter().flat_map(to_blocked_days).collect();
        let event_count = u32::try_from(events.len()).unwrap_or(u32::MAX);

        calendar
            .lock()
            .await
            .replace_calendar_days(external.id, days)?;
        if let Err(error) = registry.record_sync_success(external.id, event_count, (self.now_provider)()) {
            tracing::error!(
                property_id = external.property_id,
                calendar_id = external.id,
                %error,
                "blocked days replaced but sync metadata was not saved"
            );
            return Ok(self.record_failure(registry, external, &error));
        }

        tracing::info!(
            property_id = external.property_id,
            calendar_id = external.id,
            events = event_count,
            skipped_events,
            "external calendar synced"
        );
        Ok(CalendarSyncOutcome {
            calendar_id: external.id,
            calendar_name: external.name.clone(),
            status: CalendarSyncStatus::Synced {
                events: event_count,
                skipped_events,
            },
        })
    }

    /// Marks `external` as failed. A calendar whose error cannot be stored is still
    /// reported as failed so the rest of the batch carries on.
    fn record_failure<R>(
        &self,
        registry: &ExternalCalendarRegistry<R>,
        external: &ExternalCalendar,
        error: &InfraError,
    ) -> CalendarSyncOutcome
    where
        R: CalendarRepository + ?Sized,
    {
        tracing::warn!(
            property_id = external.property_id,
            calendar_id = external.id,
            %error,
            "external calendar sync failed"
        );
        if let Err(record_error) = registry.record_sync_failure(external.id, &error.to_string()) {
            tracing::error!(
                property_id = external.property_id,
                calendar_id = external.id,
                error = %record_error,
                "sync error could not be recorded"
            );
        }
        CalendarSyncOutcome {
            calendar_id: external.id,
            calendar_name: external.name.clone(),
            status: CalendarSyncStatus::Failed {
                error: error.to_string(),
            },
        }
    }
}

fn skipped(external: &ExternalCalendar) -> CalendarSyncOutcome {
    CalendarSyncOutcome {
        calendar_id: external.id,
        calendar_name: external.name.clone(),
        status: CalendarSyncStatus::Skipped,
    }
}

async fn fetch_with_retry<F>(
    fetcher: Arc<F>,
    url: &str,
    retry_policy: &RetryPolicy,
    fetch_timeout: Duration,
) -> Result<String, InfraError>
where
    F: IcsFetcher + ?Sized,
{
    let max_attempts = retry_policy.max_attempts.max(1);
    let mut attempt: u8 = 0;

    loop {
        let result = match tokio::time::timeout(fetch_timeout, fetcher.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(InfraError::Timeout(fetch_timeout.as_millis() as u64)),
        };
        match result {
            Ok(payload) => return Ok(payload),
            Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                let delay = retry_policy
                    .base_delay_ms
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                sleep(Duration::from_millis(delay)).await;
                attempt = attempt.saturating_add(1);
            }
            Err(error) => return Err(error),
        }
    }
}
