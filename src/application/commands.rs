use crate::application::bootstrap::bootstrap_workspace;
use crate::application::conflicts::ConflictAnalyzer;
use crate::application::ics_sync::{IcsSyncEngine, RetryPolicy};
use crate::application::property_calendar::{AvailabilityEditor, PropertyCalendar};
use crate::application::registry::ExternalCalendarRegistry;
use crate::application::session::{CalendarSession, SharedCalendar};
use crate::application::staging::FlushReport;
use crate::domain::date_range::{normalize_date, DateRange};
use crate::domain::models::{
    AddResult, CalendarId, Conflict, DayStatus, ExternalCalendar, Period, PropertyId, SyncReport,
};
use crate::infrastructure::calendar_repository::{CalendarRepository, SqliteCalendarRepository};
use crate::infrastructure::config::{load_sync_settings, read_export_base_url, read_timezone};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::ics_client::{IcsFetcher, ReqwestIcsFetcher};
use crate::infrastructure::ics_export::{CachedIcsFeed, IcsExporter};
use crate::infrastructure::ics_parser::IcalendarParser;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

type Session = CalendarSession<dyn CalendarRepository>;

/// Which availability calendar a command edits: a draft that has no property yet,
/// keyed by the caller, or a saved property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CalendarTarget {
    Draft(String),
    Property(PropertyId),
}

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    repository: Arc<dyn CalendarRepository>,
    engine: IcsSyncEngine<dyn IcsFetcher, IcalendarParser>,
    feeds: Arc<CachedIcsFeed>,
    sessions: AsyncMutex<HashMap<CalendarTarget, Session>>,
    sync_tokens: Mutex<HashMap<PropertyId, CancellationToken>>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let settings = load_sync_settings(&bootstrap.config_dir)?;
        let fetcher = ReqwestIcsFetcher::new(settings.fetch_timeout())?;
        Self::with_fetcher(workspace_root, Arc::new(fetcher))
    }

    pub fn with_fetcher(workspace_root: PathBuf, fetcher: Arc<dyn IcsFetcher>) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let settings = load_sync_settings(&bootstrap.config_dir)?;
        let time_zone = read_timezone(&bootstrap.config_dir)?;
        let export_base_url = read_export_base_url(&bootstrap.config_dir)?;

        let engine = IcsSyncEngine::new(fetcher, Arc::new(IcalendarParser::new()))
            .with_retry_policy(RetryPolicy {
                max_attempts: settings.retry_max_attempts,
                base_delay_ms: settings.retry_base_delay_ms,
            })
            .with_fetch_timeout(settings.fetch_timeout())
            .with_max_concurrent_fetches(settings.max_concurrent_fetches)
            .with_horizon_days(settings.horizon_days)
            .with_time_zone(time_zone);
        let repository: Arc<dyn CalendarRepository> =
            Arc::new(SqliteCalendarRepository::new(&bootstrap.database_path));

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            repository,
            engine,
            feeds: Arc::new(CachedIcsFeed::new(IcsExporter::new(), export_base_url)),
            sessions: AsyncMutex::new(HashMap::new()),
            sync_tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        tracing::error!(command, %error, "command failed");
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        tracing::info!(command, detail = message, "command succeeded");
    }

    fn registry(&self, property_id: PropertyId) -> ExternalCalendarRegistry<dyn CalendarRepository> {
        ExternalCalendarRegistry::new(property_id, Arc::clone(&self.repository))
    }

    fn load_calendar(&self, property_id: PropertyId) -> Result<PropertyCalendar<dyn CalendarRepository>, InfraError> {
        PropertyCalendar::load(property_id, Arc::clone(&self.repository), self.feeds.clone())
    }

    fn open_session(&self, target: &CalendarTarget) -> Result<Session, InfraError> {
        match target {
            CalendarTarget::Draft(key) if key.trim().is_empty() => {
                Err(InfraError::Validation("draft key must not be empty".to_string()))
            }
            CalendarTarget::Draft(_) => Ok(CalendarSession::staging()),
            CalendarTarget::Property(property_id) => {
                Ok(CalendarSession::persisted(self.load_calendar(*property_id)?))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportFeedResponse {
    pub property_id: PropertyId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,
    pub ics: String,
}

fn session_entry<'a>(
    state: &AppState,
    sessions: &'a mut HashMap<CalendarTarget, Session>,
    target: &CalendarTarget,
) -> Result<&'a mut Session, InfraError> {
    match sessions.entry(target.clone()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => Ok(entry.insert(state.open_session(target)?)),
    }
}

async fn with_editor<T>(
    state: &AppState,
    target: &CalendarTarget,
    edit: impl FnOnce(&mut dyn AvailabilityEditor) -> T,
) -> Result<T, InfraError> {
    let mut sessions = state.sessions.lock().await;
    let session = session_entry(state, &mut sessions, target)?;
    Ok(session.with_editor(edit).await)
}

async fn persisted_calendar(
    state: &AppState,
    target: &CalendarTarget,
) -> Result<(PropertyId, SharedCalendar<dyn CalendarRepository>), InfraError> {
    let calendar = {
        let mut sessions = state.sessions.lock().await;
        session_entry(state, &mut sessions, target)?.ensure_persisted()?
    };
    let property_id = calendar.lock().await.property_id();
    Ok((property_id, calendar))
}

fn parse_date(value: &str) -> Result<NaiveDate, InfraError> {
    normalize_date(value).map_err(InfraError::Validation)
}

fn parse_dates(values: &[String]) -> Result<Vec<NaiveDate>, InfraError> {
    if values.is_empty() {
        return Err(InfraError::Validation("dates must not be empty".to_string()));
    }
    values.iter().map(|value| parse_date(value)).collect()
}

fn normalize_reason(reason: Option<String>) -> Option<String> {
    reason
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lock_sync_tokens(
    state: &AppState,
) -> Result<MutexGuard<'_, HashMap<PropertyId, CancellationToken>>, InfraError> {
    state
        .sync_tokens
        .lock()
        .map_err(|error| InfraError::Persistence(format!("sync token lock poisoned: {error}")))
}

fn log_add_result(state: &AppState, command: &str, target: &CalendarTarget, result: &AddResult) {
    let message = match result {
        AddResult::Committed { dates } => format!("blocked {} day(s) for {target:?}", dates.len()),
        AddResult::Conflict { dates } => {
            format!("conflict on {} day(s) for {target:?}; nothing written", dates.len())
        }
    };
    state.log_info(command, &message);
}

pub async fn add_period_impl(
    state: &AppState,
    target: CalendarTarget,
    start: String,
    end: String,
    reason: Option<String>,
    force: bool,
) -> Result<AddResult, InfraError> {
    let range = DateRange::parse(&start, &end).map_err(InfraError::Validation)?;
    let reason = normalize_reason(reason);
    let result = with_editor(state, &target, |editor| editor.add_period(range, reason, force)).await??;
    log_add_result(state, "add_period", &target, &result);
    Ok(result)
}

pub async fn add_days_impl(
    state: &AppState,
    target: CalendarTarget,
    dates: Vec<String>,
    reason: Option<String>,
    force: bool,
) -> Result<AddResult, InfraError> {
    let dates = parse_dates(&dates)?;
    let reason = normalize_reason(reason);
    let result = with_editor(state, &target, |editor| editor.add_days(&dates, reason, force)).await??;
    log_add_result(state, "add_days", &target, &result);
    Ok(result)
}

pub async fn remove_dates_impl(
    state: &AppState,
    target: CalendarTarget,
    dates: Vec<String>,
) -> Result<Vec<NaiveDate>, InfraError> {
    let dates = parse_dates(&dates)?;
    let removed = with_editor(state, &target, |editor| editor.remove_dates(&dates)).await??;
    state.log_info(
        "remove_dates",
        &format!("unblocked {} of {} day(s) for {target:?}", removed.len(), dates.len()),
    );
    Ok(removed)
}

pub async fn get_day_status_impl(
    state: &AppState,
    target: CalendarTarget,
    date: String,
) -> Result<DayStatus, InfraError> {
    let date = parse_date(&date)?;
    with_editor(state, &target, |editor| editor.status(date)).await
}

pub async fn list_periods_impl(state: &AppState, target: CalendarTarget) -> Result<Vec<Period>, InfraError> {
    with_editor(state, &target, |editor| editor.periods()).await
}

/// Promotes the draft `draft_key` to the saved property `property_id`, replaying
/// every staged edit into it. A draft that was never edited just opens the property.
pub async fn property_created_impl(
    state: &AppState,
    draft_key: String,
    property_id: PropertyId,
) -> Result<FlushReport, InfraError> {
    let draft = CalendarTarget::Draft(draft_key);
    let mut sessions = state.sessions.lock().await;
    let calendar = state.load_calendar(property_id)?;

    let Some(mut session) = sessions.remove(&draft) else {
        sessions.insert(CalendarTarget::Property(property_id), CalendarSession::persisted(calendar));
        return Ok(FlushReport::default());
    };

    match session.property_created(calendar).await {
        Ok(report) => {
            sessions.insert(CalendarTarget::Property(property_id), session);
            state.log_info(
                "property_created",
                &format!(
                    "property_id={property_id} replayed={} conflicts={}",
                    report.replayed_operations,
                    report.conflicts.len()
                ),
            );
            Ok(report)
        }
        Err(error) => {
            sessions.insert(draft, session);
            Err(error)
        }
    }
}

pub async fn add_external_calendar_impl(
    state: &AppState,
    target: CalendarTarget,
    name: String,
    ics_url: String,
) -> Result<ExternalCalendar, InfraError> {
    let (property_id, _) = persisted_calendar(state, &target).await?;
    let calendar = state.registry(property_id).add(&name, &ics_url)?;
    state.log_info(
        "add_external_calendar",
        &format!("property_id={property_id} calendar_id={}", calendar.id),
    );
    Ok(calendar)
}

pub async fn remove_external_calendar_impl(
    state: &AppState,
    target: CalendarTarget,
    calendar_id: CalendarId,
    also_remove_blocked_days: bool,
) -> Result<(), InfraError> {
    let (property_id, calendar) = persisted_calendar(state, &target).await?;
    let mut calendar = calendar.lock().await;
    state
        .registry(property_id)
        .remove(&mut calendar, calendar_id, also_remove_blocked_days)?;
    state.log_info(
        "remove_external_calendar",
        &format!("property_id={property_id} calendar_id={calendar_id} also_remove_blocked_days={also_remove_blocked_days}"),
    );
    Ok(())
}

pub async fn toggle_external_calendar_impl(
    state: &AppState,
    target: CalendarTarget,
    calendar_id: CalendarId,
    enabled: bool,
) -> Result<ExternalCalendar, InfraError> {
    let (property_id, _) = persisted_calendar(state, &target).await?;
    state.registry(property_id).toggle(calendar_id, enabled)
}

pub async fn list_external_calendars_impl(
    state: &AppState,
    target: CalendarTarget,
) -> Result<Vec<ExternalCalendar>, InfraError> {
    let (property_id, _) = persisted_calendar(state, &target).await?;
    state.registry(property_id).list()
}

pub async fn sync_calendars_impl(state: &AppState, target: CalendarTarget) -> Result<SyncReport, InfraError> {
    let (property_id, calendar) = persisted_calendar(state, &target).await?;
    let token = {
        let mut tokens = lock_sync_tokens(state)?;
        if tokens.contains_key(&property_id) {
            return Err(InfraError::SyncInProgress(property_id));
        }
        let token = CancellationToken::new();
        tokens.insert(property_id, token.clone());
        token
    };

    let result = state
        .engine
        .sync_all(&state.registry(property_id), &calendar, &token)
        .await;
    lock_sync_tokens(state)?.remove(&property_id);

    let report = result?;
    state.log_info(
        "sync_calendars",
        &format!(
            "property_id={property_id} synced={} failed={} skipped={} events={} skipped_events={}",
            report.synced_calendars,
            report.failed_calendars,
            report.skipped_calendars,
            report.total_events,
            report.skipped_events
        ),
    );
    Ok(report)
}

/// Returns `false` when no sync is running for the property.
pub fn cancel_sync_impl(state: &AppState, property_id: PropertyId) -> Result<bool, InfraError> {
    let tokens = lock_sync_tokens(state)?;
    let Some(token) = tokens.get(&property_id) else {
        return Ok(false);
    };
    token.cancel();
    state.log_info("cancel_sync", &format!("property_id={property_id}"));
    Ok(true)
}

pub async fn analyze_conflicts_impl(
    state: &AppState,
    target: CalendarTarget,
    calendar_ids: Vec<CalendarId>,
) -> Result<Vec<Conflict>, InfraError> {
    let (property_id, _) = persisted_calendar(state, &target).await?;
    ConflictAnalyzer::new(&state.engine)
        .analyze(&state.registry(property_id), &calendar_ids)
        .await
}

pub async fn export_feed_impl(state: &AppState, target: CalendarTarget) -> Result<ExportFeedResponse, InfraError> {
    let (property_id, calendar) = persisted_calendar(state, &target).await?;
    let ics = match state.feeds.feed(property_id)? {
        Some(ics) => ics,
        None => state.feeds.refresh(property_id, calendar.lock().await.store())?,
    };
    Ok(ExportFeedResponse {
        property_id,
        feed_url: state.feeds.feed_url(property_id),
        ics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ics_sync::tests::{feed, FakeIcsFetcher, FakeResponse};
    use crate::infrastructure::ics_parser::IcsParser;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "rentcal-command-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp workspace");
            Self { path }
        }

        /// Test feeds carry fixed 2024 dates, so the horizon is widened to keep them
        /// in range whatever today is.
        fn app_state(&self, fetcher: FakeIcsFetcher) -> AppState {
            let config_dir = self.path.join("config");
            fs::create_dir_all(&config_dir).expect("create config dir");
            fs::write(
                config_dir.join("sync.json"),
                serde_json::json!({"schema": 1, "horizonDays": 36500, "retry": {"maxAttempts": 1}}).to_string(),
            )
            .expect("write sync.json");
            AppState::with_fetcher(self.path.clone(), Arc::new(fetcher)).expect("initialize app state")
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn draft() -> CalendarTarget {
        CalendarTarget::Draft("new-listing".to_string())
    }

    #[tokio::test]
    async fn draft_edits_are_persisted_when_the_property_is_created() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state(FakeIcsFetcher::new());

        add_period_impl(&state, draft(), "2024-06-01".into(), "2024-06-03".into(), Some(" Owner ".into()), false)
            .await
            .expect("add period");
        add_days_impl(&state, draft(), vec!["2024-06-10T00:00:00".into()], None, false)
            .await
            .expect("add days");

        let report = property_created_impl(&state, "new-listing".into(), 7)
            .await
            .expect("property created");
        assert_eq!(report.replayed_operations, 2);

        let reopened = workspace.app_state(FakeIcsFetcher::new());
        let periods = list_periods_impl(&reopened, CalendarTarget::Property(7))
            .await
            .expect("periods");
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].reason.as_deref(), Some("Owner"));
        let status = get_day_status_impl(&reopened, CalendarTarget::Property(7), "2024-06-01".into())
            .await
            .expect("status");
        assert!(status.blocked && status.check_in);
    }

    #[tokio::test]
    async fn drafts_cannot_manage_external_calendars() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state(FakeIcsFetcher::new());

        let result =
            add_external_calendar_impl(&state, draft(), "Airbnb".into(), "https://a.test/cal.ics".into()).await;
        assert!(matches!(result, Err(InfraError::StagingUnsupported(_))));
        assert!(matches!(
            sync_calendars_impl(&state, draft()).await,
            Err(InfraError::StagingUnsupported(_))
        ));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_touching_the_calendar() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state(FakeIcsFetcher::new());
        let property = CalendarTarget::Property(1);

        let reversed = add_period_impl(&state, property.clone(), "2024-06-05".into(), "2024-06-01".into(), None, false).await;
        assert!(matches!(reversed, Err(InfraError::Validation(_))));
        let garbage = remove_dates_impl(&state, property.clone(), vec!["06/01/2024".into()]).await;
        assert!(matches!(garbage, Err(InfraError::Validation(_))));
        let empty_draft = list_periods_impl(&state, CalendarTarget::Draft("  ".into())).await;
        assert!(matches!(empty_draft, Err(InfraError::Validation(_))));
        assert!(list_periods_impl(&state, property).await.expect("periods").is_empty());
    }

    #[tokio::test]
    async fn sync_then_export_publishes_manual_and_imported_days() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state(
            FakeIcsFetcher::new()
                .respond("https://airbnb.test/cal.ics", vec![FakeResponse::Feed(feed(&[("20240601", "20240604")]))])
                .respond("https://booking.test/cal.ics", vec![FakeResponse::Feed(feed(&[("20240603", "20240605")]))]),
        );
        let property = CalendarTarget::Property(3);
        let airbnb = add_external_calendar_impl(&state, property.clone(), "Airbnb".into(), "https://airbnb.test/cal.ics".into())
            .await
            .expect("add airbnb");
        let booking = add_external_calendar_impl(&state, property.clone(), "Booking".into(), "https://booking.test/cal.ics".into())
            .await
            .expect("add booking");

        let conflicts = analyze_conflicts_impl(&state, property.clone(), vec![airbnb.id, booking.id])
            .await
            .expect("analyze");
        assert_eq!(conflicts.len(), 1);

        let report = sync_calendars_impl(&state, property.clone()).await.expect("sync");
        assert_eq!(report.synced_calendars, 2);
        add_period_impl(&state, property.clone(), "2024-07-01".into(), "2024-07-02".into(), Some("Owner".into()), false)
            .await
            .expect("manual period");

        let export = export_feed_impl(&state, property.clone()).await.expect("export");
        let events = IcalendarParser::new().parse(&export.ics).expect("parse export");
        let periods = list_periods_impl(&state, property).await.expect("periods");
        assert_eq!(events.len(), periods.len());
        assert_eq!(export.feed_url, None);

        let listed = list_external_calendars_impl(&state, CalendarTarget::Property(3))
            .await
            .expect("list");
        assert!(listed.iter().all(|calendar| calendar.last_sync_at.is_some()));
    }

    #[tokio::test]
    async fn removing_a_calendar_can_drop_its_days() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state(
            FakeIcsFetcher::new()
                .respond("https://airbnb.test/cal.ics", vec![FakeResponse::Feed(feed(&[("20240601", "20240604")]))]),
        );
        let property = CalendarTarget::Property(5);
        let airbnb = add_external_calendar_impl(&state, property.clone(), "Airbnb".into(), "https://airbnb.test/cal.ics".into())
            .await
            .expect("add");
        sync_calendars_impl(&state, property.clone()).await.expect("sync");
        toggle_external_calendar_impl(&state, property.clone(), airbnb.id, false)
            .await
            .expect("toggle");

        remove_external_calendar_impl(&state, property.clone(), airbnb.id, true)
            .await
            .expect("remove");

        assert!(list_periods_impl(&state, property.clone()).await.expect("periods").is_empty());
        assert!(list_external_calendars_impl(&state, property).await.expect("list").is_empty());
    }

    #[test]
    fn cancel_without_running_sync_reports_false() {
        let workspace = TempWorkspace::new();
        let state = workspace.app_state(FakeIcsFetcher::new());

        assert!(!cancel_sync_impl(&state, 9).expect("cancel"));
    }

    #[test]
    fn calendar_target_serializes_with_kind_tag() {
        let json = serde_json::to_value(CalendarTarget::Property(4)).expect("serialize");
        assert_eq!(json, serde_json::json!({"kind": "property", "id": 4}));
        let draft: CalendarTarget =
            serde_json::from_value(serde_json::json!({"kind": "draft", "id": "abc"})).expect("deserialize");
        assert_eq!(draft, CalendarTarget::Draft("abc".to_string()));
    }
}
