pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::commands::{
    add_days_impl, add_external_calendar_impl, add_period_impl, analyze_conflicts_impl,
    cancel_sync_impl, export_feed_impl, get_day_status_impl, list_external_calendars_impl,
    list_periods_impl, property_created_impl, remove_dates_impl, remove_external_calendar_impl,
    sync_calendars_impl, toggle_external_calendar_impl, AppState, CalendarTarget,
    ExportFeedResponse,
};
pub use domain::date_range::DateRange;
pub use application::staging::FlushReport;
pub use domain::models::{
    AddResult, BlockedDay, CalendarId, Conflict, DayStatus, ExternalCalendar, Period, PropertyId,
    SyncReport,
};
pub use infrastructure::error::InfraError;

use infrastructure::logging::init_logging;
use chrono::NaiveDate;
use std::path::PathBuf;

/// Prepares the workspace under `workspace_root` (or the current directory),
/// installs JSON logging into its `logs/` and returns the state every command
/// function runs against.
pub fn run(workspace_root: Option<PathBuf>) -> Result<AppState, InfraError> {
    let workspace_root = match workspace_root {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let installed = init_logging(&workspace_root.join("logs"))?;
    let state = AppState::new(workspace_root.clone())?;
    tracing::info!(
        workspace_root = %workspace_root.display(),
        database_path = %state.database_path().display(),
        subscriber_installed = installed,
        "rentcal started"
    );
    Ok(state)
}

pub async fn add_period(
    state: &AppState,
    target: CalendarTarget,
    start: String,
    end: String,
    reason: Option<String>,
    force: bool,
) -> Result<AddResult, String> {
    add_period_impl(state, target, start, end, reason, force)
        .await
        .map_err(|error| state.command_error("add_period", &error))
}

pub async fn add_days(
    state: &AppState,
    target: CalendarTarget,
    dates: Vec<String>,
    reason: Option<String>,
    force: bool,
) -> Result<AddResult, String> {
    add_days_impl(state, target, dates, reason, force)
        .await
        .map_err(|error| state.command_error("add_days", &error))
}

pub async fn remove_dates(
    state: &AppState,
    target: CalendarTarget,
    dates: Vec<String>,
) -> Result<Vec<NaiveDate>, String> {
    remove_dates_impl(state, target, dates)
        .await
        .map_err(|error| state.command_error("remove_dates", &error))
}

pub async fn get_day_status(state: &AppState, target: CalendarTarget, date: String) -> Result<DayStatus, String> {
    get_day_status_impl(state, target, date)
        .await
        .map_err(|error| state.command_error("get_day_status", &error))
}

pub async fn list_periods(state: &AppState, target: CalendarTarget) -> Result<Vec<Period>, String> {
    list_periods_impl(state, target)
        .await
        .map_err(|error| state.command_error("list_periods", &error))
}

pub async fn property_created(
    state: &AppState,
    draft_key: String,
    property_id: PropertyId,
) -> Result<FlushReport, String> {
    property_created_impl(state, draft_key, property_id)
        .await
        .map_err(|error| state.command_error("property_created", &error))
}

pub async fn add_external_calendar(
    state: &AppState,
    target: CalendarTarget,
    name: String,
    ics_url: String,
) -> Result<ExternalCalendar, String> {
    add_external_calendar_impl(state, target, name, ics_url)
        .await
        .map_err(|error| state.command_error("add_external_calendar", &error))
}

pub async fn remove_external_calendar(
    state: &AppState,
    target: CalendarTarget,
    calendar_id: CalendarId,
    also_remove_blocked_days: bool,
) -> Result<(), String> {
    remove_external_calendar_impl(state, target, calendar_id, also_remove_blocked_days)
        .await
        .map_err(|error| state.command_error("remove_external_calendar", &error))
}

pub async fn toggle_external_calendar(
    state: &AppState,
    target: CalendarTarget,
    calendar_id: CalendarId,
    enabled: bool,
) -> Result<ExternalCalendar, String> {
    toggle_external_calendar_impl(state, target, calendar_id, enabled)
        .await
        .map_err(|error| state.command_error("toggle_external_calendar", &error))
}

pub async fn list_external_calendars(
    state: &AppState,
    target: CalendarTarget,
) -> Result<Vec<ExternalCalendar>, String> {
    list_external_calendars_impl(state, target)
        .await
        .map_err(|error| state.command_error("list_external_calendars", &error))
}

pub async fn sync_calendars(state: &AppState, target: CalendarTarget) -> Result<SyncReport, String> {
    sync_calendars_impl(state, target)
        .await
        .map_err(|error| state.command_error("sync_calendars", &error))
}

pub fn cancel_sync(state: &AppState, property_id: PropertyId) -> Result<bool, String> {
    cancel_sync_impl(state, property_id).map_err(|error| state.command_error("cancel_sync", &error))
}

pub async fn analyze_conflicts(
    state: &AppState,
    target: CalendarTarget,
    calendar_ids: Vec<CalendarId>,
) -> Result<Vec<Conflict>, String> {
    analyze_conflicts_impl(state, target, calendar_ids)
        .await
        .map_err(|error| state.command_error("analyze_conflicts", &error))
}

pub async fn export_feed(state: &AppState, target: CalendarTarget) -> Result<ExportFeedResponse, String> {
    export_feed_impl(state, target)
        .await
        .map_err(|error| state.command_error("export_feed", &error))
}
