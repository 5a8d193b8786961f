use crate::infrastructure::error::InfraError;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const COMMAND_LOG: &str = "commands.log";
const DEFAULT_FILTER: &str = "info";

pub fn command_log_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(COMMAND_LOG)
}

/// Installs the process-wide subscriber: one JSON object per line appended to
/// `logs/commands.log`, filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` when a subscriber was already installed; the existing one is
/// kept.
pub fn init_logging(logs_dir: &Path) -> Result<bool, InfraError> {
    fs::create_dir_all(logs_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(command_log_path(logs_dir))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_current_span(false)
        .with_target(true)
        .try_init()
        .is_ok();
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_log_lives_in_logs_dir() {
        let logs_dir = Path::new("/tmp/rentcal/logs");
        assert_eq!(command_log_path(logs_dir), logs_dir.join("commands.log"));
    }

    #[test]
    fn init_logging_creates_the_log_file() {
        let logs_dir = std::env::temp_dir().join(format!("rentcal-logging-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&logs_dir);

        init_logging(&logs_dir).expect("init logging");
        let second = init_logging(&logs_dir).expect("second init");

        assert!(command_log_path(&logs_dir).exists());
        assert!(!second);
        let _ = fs::remove_dir_all(&logs_dir);
    }
}
