use crate::domain::blocked_dates::StoreChange;
use crate::domain::date_range::{normalize_date, DATE_FORMAT};
use crate::domain::models::{BlockedDay, CalendarClaim, CalendarId, ExternalCalendar, PropertyId};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage for blocked days and external calendar rows, scoped by property.
pub trait CalendarRepository: Send + Sync {
    fn load_blocked_days(&self, property_id: PropertyId) -> Result<Vec<BlockedDay>, InfraError>;

    /// Deletes `removed` first, then upserts `added`, atomically.
    fn save_blocked_days(
        &self,
        property_id: PropertyId,
        added: &[BlockedDay],
        removed: &[NaiveDate],
    ) -> Result<(), InfraError>;

    fn load_calendar_claims(&self, property_id: PropertyId) -> Result<Vec<CalendarClaim>, InfraError>;

    /// Deletes `released` first, then upserts `claimed`, atomically.
    fn save_calendar_claims(
        &self,
        property_id: PropertyId,
        claimed: &[CalendarClaim],
        released: &[(CalendarId, NaiveDate)],
    ) -> Result<(), InfraError>;

    /// Writes the claims and rows of one store mutation.
    fn save_store_change(&self, property_id: PropertyId, change: &StoreChange) -> Result<(), InfraError> {
        if change.touches_claims() {
            self.save_calendar_claims(property_id, &change.claimed, &change.released)?;
        }
        self.save_blocked_days(property_id, &change.added, &change.removed)
    }

    fn load_external_calendars(
        &self,
        property_id: PropertyId,
    ) -> Result<Vec<ExternalCalendar>, InfraError>;

    fn insert_external_calendar(
        &self,
        property_id: PropertyId,
        name: &str,
        ics_url: &str,
    ) -> Result<ExternalCalendar, InfraError>;

    fn save_external_calendar(&self, calendar: &ExternalCalendar) -> Result<(), InfraError>;

    fn delete_external_calendar(
        &self,
        property_id: PropertyId,
        calendar_id: CalendarId,
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteCalendarRepository {
    db_path: PathBuf,
}

impl SqliteCalendarRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }

    fn calendar_from_row(row: &Row<'_>) -> rusqlite::Result<RawCalendarRow> {
        Ok(RawCalendarRow {
            id: row.get(0)?,
            property_id: row.get(1)?,
            name: row.get(2)?,
            ics_url: row.get(3)?,
            enabled: row.get(4)?,
            last_sync_at: row.get(5)?,
            sync_error: row.get(6)?,
            total_events: row.get(7)?,
        })
    }
}

struct RawCalendarRow {
    id: CalendarId,
    property_id: PropertyId,
    name: String,
    ics_url: String,
    enabled: bool,
    last_sync_at: Option<String>,
    sync_error: Option<String>,
    total_events: u32,
}

impl RawCalendarRow {
    fn into_calendar(self) -> Result<ExternalCalendar, InfraError> {
        let last_sync_at = match self.last_sync_at {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|error| {
                        InfraError::Persistence(format!(
                            "invalid external_calendars.last_sync_at '{raw}': {error}"
                        ))
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(ExternalCalendar {
            id: self.id,
            property_id: self.property_id,
            name: self.name,
            ics_url: self.ics_url,
            enabled: self.enabled,
            last_sync_at,
            sync_error: self.sync_error,
            total_events: self.total_events,
        })
    }
}

const CALENDAR_COLUMNS: &str =
    "id, property_id, name, ics_url, enabled, last_sync_at, sync_error, total_events";

impl CalendarRepository for SqliteCalendarRepository {
    fn load_blocked_days(&self, property_id: PropertyId) -> Result<Vec<BlockedDay>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT date, reason, is_check_in, is_check_out, source_calendar_id
             FROM blocked_days WHERE property_id = ?1 ORDER BY date",
        )?;
        let rows = statement.query_map(params![property_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, Option<CalendarId>>(4)?,
            ))
        })?;

        let mut days = Vec::new();
        for row in rows {
            let (raw_date, reason, is_check_in, is_check_out, source_calendar_id) = row?;
            let date = normalize_date(&raw_date).map_err(|error| {
                InfraError::Persistence(format!("blocked_days.date for property {property_id}: {error}"))
            })?;
            days.push(BlockedDay {
                date,
                reason,
                is_check_in,
                is_check_out,
                source_calendar_id,
            });
        }
        Ok(days)
    }

    fn save_blocked_days(
        &self,
        property_id: PropertyId,
        added: &[BlockedDay],
        removed: &[NaiveDate],
    ) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        write_blocked_days(&transaction, property_id, added, removed)?;
        transaction.commit()?;
        Ok(())
    }

    fn load_calendar_claims(&self, property_id: PropertyId) -> Result<Vec<CalendarClaim>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT date, calendar_id, reason, is_check_in, is_check_out
             FROM calendar_claims WHERE property_id = ?1 ORDER BY date, calendar_id",
        )?;
        let rows = statement.query_map(params![property_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, CalendarId>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;

        let mut claims = Vec::new();
        for row in rows {
            let (raw_date, calendar_id, reason, is_check_in, is_check_out) = row?;
            let date = normalize_date(&raw_date).map_err(|error| {
                InfraError::Persistence(format!("calendar_claims.date for property {property_id}: {error}"))
            })?;
            claims.push(CalendarClaim {
                calendar_id,
                date,
                reason,
                is_check_in,
                is_check_out,
            });
        }
        Ok(claims)
    }

    fn save_calendar_claims(
        &self,
        property_id: PropertyId,
        claimed: &[CalendarClaim],
        released: &[(CalendarId, NaiveDate)],
    ) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        write_calendar_claims(&transaction, property_id, claimed, released)?;
        transaction.commit()?;
        Ok(())
    }

    fn save_store_change(&self, property_id: PropertyId, change: &StoreChange) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        write_calendar_claims(&transaction, property_id, &change.claimed, &change.released)?;
        write_blocked_days(&transaction, property_id, &change.added, &change.removed)?;
        transaction.commit()?;
        Ok(())
    }

    fn load_external_calendars(
        &self,
        property_id: PropertyId,
    ) -> Result<Vec<ExternalCalendar>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {CALENDAR_COLUMNS} FROM external_calendars WHERE property_id = ?1 ORDER BY id"
        ))?;
        let rows = statement.query_map(params![property_id], Self::calendar_from_row)?;

        let mut calendars = Vec::new();
        for row in rows {
            calendars.push(row?.into_calendar()?);
        }
        Ok(calendars)
    }

    fn insert_external_calendar(
        &self,
        property_id: PropertyId,
        name: &str,
        ics_url: &str,
    ) -> Result<ExternalCalendar, InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO external_calendars (property_id, name, ics_url, enabled, total_events)
             VALUES (?1, ?2, ?3, 1, 0)",
            params![property_id, name, ics_url],
        )?;
        let id = connection.last_insert_rowid();
        let row = connection
            .query_row(
                &format!("SELECT {CALENDAR_COLUMNS} FROM external_calendars WHERE id = ?1"),
                params![id],
                Self::calendar_from_row,
            )
            .optional()?
            .ok_or_else(|| {
                InfraError::Persistence(format!("external calendar {id} vanished after insert"))
            })?;
        row.into_calendar()
    }

    fn save_external_calendar(&self, calendar: &ExternalCalendar) -> Result<(), InfraError> {
        let connection = self.connect()?;
        let updated = connection.execute(
            "UPDATE external_calendars SET
               name = ?3, ics_url = ?4, enabled = ?5, last_sync_at = ?6,
               sync_error = ?7, total_events = ?8
             WHERE id = ?1 AND property_id = ?2",
            params![
                calendar.id,
                calendar.property_id,
                calendar.name,
                calendar.ics_url,
                calendar.enabled,
                calendar.last_sync_at.map(|value| value.to_rfc3339()),
                calendar.sync_error,
                calendar.total_events,
            ],
        )?;
        if updated == 0 {
            return Err(InfraError::NotFound(format!(
                "external calendar {} of property {}",
                calendar.id, calendar.property_id
            )));
        }
        Ok(())
    }

    fn delete_external_calendar(
        &self,
        property_id: PropertyId,
        calendar_id: CalendarId,
    ) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "DELETE FROM external_calendars WHERE id = ?1 AND property_id = ?2",
            params![calendar_id, property_id],
        )?;
        Ok(())
    }
}

/// Rows are matched on their first ten characters: older rows may carry a time
/// suffix after the date, and those must be replaced rather than duplicated.
fn write_blocked_days(
    transaction: &Transaction<'_>,
    property_id: PropertyId,
    added: &[BlockedDay],
    removed: &[NaiveDate],
) -> Result<(), InfraError> {
    let mut delete = transaction
        .prepare("DELETE FROM blocked_days WHERE property_id = ?1 AND substr(date, 1, 10) = ?2")?;
    for date in removed.iter().chain(added.iter().map(|day| &day.date)) {
        delete.execute(params![property_id, date.format(DATE_FORMAT).to_string()])?;
    }

    let mut insert = transaction.prepare(
        "INSERT INTO blocked_days
           (property_id, date, reason, is_check_in, is_check_out, source_calendar_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for day in added {
        insert.execute(params![
            property_id,
            day.date.format(DATE_FORMAT).to_string(),
            day.reason,
            day.is_check_in,
            day.is_check_out,
            day.source_calendar_id,
        ])?;
    }
    Ok(())
}

fn write_calendar_claims(
    transaction: &Transaction<'_>,
    property_id: PropertyId,
    claimed: &[CalendarClaim],
    released: &[(CalendarId, NaiveDate)],
) -> Result<(), InfraError> {
    let mut delete = transaction.prepare(
        "DELETE FROM calendar_claims WHERE property_id = ?1 AND calendar_id = ?2 AND date = ?3",
    )?;
    for (calendar_id, date) in released {
        delete.execute(params![property_id, calendar_id, date.format(DATE_FORMAT).to_string()])?;
    }

    let mut upsert = transaction.prepare(
        "INSERT INTO calendar_claims
           (property_id, date, calendar_id, reason, is_check_in, is_check_out)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(property_id, date, calendar_id) DO UPDATE SET
           reason = excluded.reason,
           is_check_in = excluded.is_check_in,
           is_check_out = excluded.is_check_out",
    )?;
    for claim in claimed {
        upsert.execute(params![
            property_id,
            claim.date.format(DATE_FORMAT).to_string(),
            claim.calendar_id,
            claim.reason,
            claim.is_check_in,
            claim.is_check_out,
        ])?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct InMemoryState {
    blocked_days: HashMap<PropertyId, BTreeMap<NaiveDate, BlockedDay>>,
    claims: HashMap<PropertyId, BTreeMap<(NaiveDate, CalendarId), CalendarClaim>>,
    calendars: BTreeMap<CalendarId, ExternalCalendar>,
    next_calendar_id: CalendarId,
}

#[derive(Debug, Default)]
pub struct InMemoryCalendarRepository {
    state: Mutex<InMemoryState>,
}

impl InMemoryCalendarRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::Persistence(format!("calendar repository lock poisoned: {error}")))
    }
}

impl CalendarRepository for InMemoryCalendarRepository {
    fn load_blocked_days(&self, property_id: PropertyId) -> Result<Vec<BlockedDay>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .blocked_days
            .get(&property_id)
            .map(|days| days.values().cloned().collect())
            .unwrap_or_default())
    }

    fn save_blocked_days(
        &self,
        property_id: PropertyId,
        added: &[BlockedDay],
        removed: &[NaiveDate],
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let days = state.blocked_days.entry(property_id).or_default();
        for date in removed {
            days.remove(date);
        }
        for day in added {
            days.insert(day.date, day.clone());
        }
        Ok(())
    }

    fn load_calendar_claims(&self, property_id: PropertyId) -> Result<Vec<CalendarClaim>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .claims
            .get(&property_id)
            .map(|claims| claims.values().cloned().collect())
            .unwrap_or_default())
    }

    fn save_calendar_claims(
        &self,
        property_id: PropertyId,
        claimed: &[CalendarClaim],
        released: &[(CalendarId, NaiveDate)],
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let claims = state.claims.entry(property_id).or_default();
        for (calendar_id, date) in released {
            claims.remove(&(*date, *calendar_id));
        }
        for claim in claimed {
            claims.insert((claim.date, claim.calendar_id), claim.clone());
        }
        Ok(())
    }

    fn load_external_calendars(
        &self,
        property_id: PropertyId,
    ) -> Result<Vec<ExternalCalendar>, InfraError> {
        let state = self.lock()?;
        Ok(state
            .calendars
            .values()
            .filter(|calendar| calendar.property_id == property_id)
            .cloned()
            .collect())
    }

    fn insert_external_calendar(
        &self,
        property_id: PropertyId,
        name: &str,
        ics_url: &str,
    ) -> Result<ExternalCalendar, InfraError> {
        let mut state = self.lock()?;
        state.next_calendar_id += 1;
        let calendar = ExternalCalendar {
            id: state.next_calendar_id,
            property_id,
            name: name.to_string(),
            ics_url: ics_url.to_string(),
            enabled: true,
            last_sync_at: None,
            sync_error: None,
            total_events: 0,
        };
        state.calendars.insert(calendar.id, calendar.clone());
        Ok(calendar)
    }

    fn save_external_calendar(&self, calendar: &ExternalCalendar) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        match state.calendars.get_mut(&calendar.id) {
            Some(existing) if existing.property_id == calendar.property_id => {
                *existing = calendar.clone();
                Ok(())
            }
            _ => Err(InfraError::NotFound(format!(
                "external calendar {} of property {}",
                calendar.id, calendar.property_id
            ))),
        }
    }

    fn delete_external_calendar(
        &self,
        property_id: PropertyId,
        calendar_id: CalendarId,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        if state
            .calendars
            .get(&calendar_id)
            .is_some_and(|calendar| calendar.property_id == property_id)
        {
            state.calendars.remove(&calendar_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_DB: AtomicUsize = AtomicUsize::new(0);

    struct TempDatabase {
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let sequence = NEXT_DB.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "rentcal-repository-tests-{}-{}.sqlite",
                std::process::id(),
                sequence
            ));
            let _ = std::fs::remove_file(&path);
            initialize_database(&path).expect("initialize database");
            Self { path }
        }

        fn repository(&self) -> SqliteCalendarRepository {
            SqliteCalendarRepository::new(&self.path)
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn day(value: &str, source_calendar_id: Option<CalendarId>) -> BlockedDay {
        BlockedDay {
            date: date(value),
            reason: Some("Reserved".to_string()),
            is_check_in: true,
            is_check_out: false,
            source_calendar_id,
        }
    }

    fn exercise_blocked_days(repository: &dyn CalendarRepository) {
        repository
            .save_blocked_days(42, &[day("2024-06-01", None), day("2024-06-02", Some(3))], &[])
            .expect("save");
        repository
            .save_blocked_days(7, &[day("2024-06-01", None)], &[])
            .expect("save other property");
        repository
            .save_blocked_days(42, &[day("2024-06-03", None)], &[date("2024-06-01")])
            .expect("save with removal");

        let loaded = repository.load_blocked_days(42).expect("load");
        let dates = loaded.iter().map(|day| day.date).collect::<Vec<_>>();
        assert_eq!(dates, vec![date("2024-06-02"), date("2024-06-03")]);
        assert_eq!(loaded[0].source_calendar_id, Some(3));
        assert!(loaded[0].is_check_in);
        assert_eq!(repository.load_blocked_days(7).expect("load other").len(), 1);
    }

    fn exercise_calendars(repository: &dyn CalendarRepository) {
        let mut created = repository
            .insert_external_calendar(42, "Airbnb", "https://example.com/a.ics")
            .expect("insert");
        repository
            .insert_external_calendar(7, "Other", "https://example.com/b.ics")
            .expect("insert other property");
        assert!(created.enabled);
        assert_eq!(created.total_events, 0);

        created.enabled = false;
        created.total_events = 4;
        created.sync_error = Some("boom".to_string());
        created.last_sync_at = Some(
            DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
                .expect("valid datetime")
                .with_timezone(&Utc),
        );
        repository.save_external_calendar(&created).expect("update");

        let listed = repository.load_external_calendars(42).expect("list");
        assert_eq!(listed, vec![created.clone()]);

        repository
            .delete_external_calendar(42, created.id)
            .expect("delete");
        assert!(repository.load_external_calendars(42).expect("list").is_empty());
        assert!(matches!(
            repository.save_external_calendar(&created),
            Err(InfraError::NotFound(_))
        ));
    }

    #[test]
    fn sqlite_repository_persists_blocked_days() {
        let database = TempDatabase::new();
        exercise_blocked_days(&database.repository());
    }

    #[test]
    fn sqlite_repository_persists_external_calendars() {
        let database = TempDatabase::new();
        exercise_calendars(&database.repository());
    }

    #[test]
    fn in_memory_repository_matches_sqlite_behavior() {
        let repository = InMemoryCalendarRepository::default();
        exercise_blocked_days(&repository);
        exercise_calendars(&repository);
    }

    #[test]
    fn sqlite_repository_normalizes_timestamped_dates() {
        let database = TempDatabase::new();
        let connection = open_connection(&database.path).expect("open");
        connection
            .execute(
                "INSERT INTO blocked_days (property_id, date, reason, is_check_in, is_check_out)
                 VALUES (42, '2024-06-01T00:00:00', NULL, 0, 0)",
                [],
            )
            .expect("insert timestamped row");

        let loaded = database.repository().load_blocked_days(42).expect("load");

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].date, date("2024-06-01"));
    }

    fn insert_timestamped_row(database: &TempDatabase) {
        open_connection(&database.path)
            .expect("open")
            .execute(
                "INSERT INTO blocked_days (property_id, date, reason, is_check_in, is_check_out)
                 VALUES (42, '2024-06-01T00:00:00', 'legacy', 1, 0)",
                [],
            )
            .expect("insert timestamped row");
    }

    fn row_count(database: &TempDatabase) -> i64 {
        open_connection(&database.path)
            .expect("open")
            .query_row("SELECT count(*) FROM blocked_days WHERE property_id = 42", [], |row| {
                row.get(0)
            })
            .expect("count rows")
    }

    #[test]
    fn sqlite_repository_removes_and_overwrites_timestamped_rows() {
        let database = TempDatabase::new();
        let repository = database.repository();

        insert_timestamped_row(&database);
        repository
            .save_blocked_days(42, &[], &[date("2024-06-01")])
            .expect("remove");
        assert!(repository.load_blocked_days(42).expect("load").is_empty());

        insert_timestamped_row(&database);
        let mut replacement = day("2024-06-01", None);
        replacement.reason = Some("Owner".to_string());
        replacement.is_check_in = false;
        replacement.is_check_out = true;
        repository
            .save_blocked_days(42, &[replacement.clone()], &[])
            .expect("overwrite");

        assert_eq!(row_count(&database), 1);
        assert_eq!(repository.load_blocked_days(42).expect("load"), vec![replacement]);
    }

    fn claim(value: &str, calendar_id: CalendarId) -> CalendarClaim {
        CalendarClaim {
            calendar_id,
            date: date(value),
            reason: Some(format!("calendar {calendar_id}")),
            is_check_in: false,
            is_check_out: true,
        }
    }

    fn exercise_claims(repository: &dyn CalendarRepository) {
        let mut change = StoreChange {
            added: vec![day("2024-06-10", Some(1))],
            claimed: vec![claim("2024-06-10", 1), claim("2024-06-10", 2), claim("2024-06-11", 2)],
            ..StoreChange::default()
        };
        repository.save_store_change(42, &change).expect("save claims");

        change = StoreChange {
            released: vec![(2, date("2024-06-11"))],
            ..StoreChange::default()
        };
        repository.save_store_change(42, &change).expect("release claim");

        let claims = repository.load_calendar_claims(42).expect("load claims");
        assert_eq!(claims, vec![claim("2024-06-10", 1), claim("2024-06-10", 2)]);
        assert!(repository.load_calendar_claims(7).expect("load other").is_empty());
        assert_eq!(repository.load_blocked_days(42).expect("load").len(), 1);
    }

    #[test]
    fn sqlite_repository_persists_calendar_claims() {
        let database = TempDatabase::new();
        exercise_claims(&database.repository());
    }

    #[test]
    fn in_memory_repository_persists_calendar_claims() {
        exercise_claims(&InMemoryCalendarRepository::default());
    }
}
