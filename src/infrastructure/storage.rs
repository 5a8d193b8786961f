use crate::infrastructure::error::InfraError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn open_connection(path: &Path) -> Result<Connection, InfraError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = open_connection(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_database_is_repeatable_and_creates_tables() {
        let path = std::env::temp_dir().join(format!(
            "rentcal-storage-test-{}.sqlite",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        initialize_database(&path).expect("first initialization");
        initialize_database(&path).expect("second initialization");

        let connection = open_connection(&path).expect("open");
        let tables: Vec<String> = connection
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("collect");
        assert_eq!(
            tables,
            vec![
                "blocked_days".to_string(),
                "calendar_claims".to_string(),
                "external_calendars".to_string()
            ]
        );

        let _ = std::fs::remove_file(&path);
    }
}
