//! Loading scheduler configuration and seed schedules from JSON files.

use std::path::{Path, PathBuf};

use cadence_scheduler::{Schedule, SchedulerConfig, SchedulerError};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] SchedulerError),
}

/// Read a JSON file, or `None` if it does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "file not found");
            return Ok(None);
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Load and validate the scheduler config. A missing file means defaults.
pub fn load_config(
    path: Option<&Path>,
    user_id: Option<&str>,
) -> Result<SchedulerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => read_json(path)?.unwrap_or_else(|| {
            info!(path = %path.display(), "config file missing, using defaults");
            SchedulerConfig::default()
        }),
        None => SchedulerConfig::default(),
    };
    if let Some(user_id) = user_id {
        config.user_id = user_id.to_string();
    }
    config.validate()?;
    Ok(config)
}

/// Load seed schedules. A missing file means none.
pub fn load_schedules(path: Option<&Path>) -> Result<Vec<Schedule>, ConfigError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    Ok(read_json(path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json")), None).unwrap();
        assert_eq!(config.utc_offset_minutes, 330);
        assert_eq!(config.queue.batch_size, 5);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let file = write_file(r#"{"user_id": "alice", "queue": {"batch_size": 2}}"#);
        let config = load_config(Some(file.path()), None).unwrap();
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.queue.batch_size, 2);
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.content_hour, 0);
    }

    #[test]
    fn test_user_override_wins() {
        let file = write_file(r#"{"user_id": "alice"}"#);
        let config = load_config(Some(file.path()), Some("bob")).unwrap();
        assert_eq!(config.user_id, "bob");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let file = write_file(r#"{"content_hour": 24}"#);
        let err = load_config(Some(file.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_json_reports_path() {
        let file = write_file("{not json");
        let err = load_config(Some(file.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_load_schedules() {
        let file = write_file(
            r#"[{
                "user_id": "alice",
                "platform": "devto",
                "max_posts_per_day": 2,
                "preferred_times": ["09:00", "14:00"],
                "days_of_week": [1, 3, 5],
                "is_active": true
            }]"#,
        );
        let schedules = load_schedules(Some(file.path())).unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].platform, "devto");
        assert_eq!(schedules[0].days_of_week, vec![1, 3, 5]);

        assert!(load_schedules(None).unwrap().is_empty());
    }
}
