use am_core::{HolidayCalendar, ManagerPolicy, WorkCalendar};
use am_storage::StoreContext;
use chrono::{FixedOffset, NaiveDate, NaiveTime};
use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8310";
pub const DEFAULT_DATABASE: &str = "assignment_manager.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Parser, Debug, Default)]
#[command(name = "am-hub")]
pub struct Args {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long)]
    pub database: Option<PathBuf>,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long)]
    pub foreground_task_limit: Option<usize>,
    #[arg(long)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub addr: String,
    pub database: PathBuf,
    pub log_dir: String,
    pub debug: bool,
    pub foreground_task_limit: usize,
    pub allow_partial_assignments: bool,
    pub enable_cdc: bool,
    pub cdc_topic: String,
    pub work_open: String,
    pub work_close: String,
    pub utc_offset_minutes: Option<i32>,
    pub extra_holidays: Vec<String>,
    /// Candidate keys per protocol for key-source projects.
    pub key_file: Option<PathBuf>,
    /// Bearer token to user name.
    pub authorized: BTreeMap<String, String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        let policy = ManagerPolicy::default();
        Self {
            addr: DEFAULT_ADDR.to_string(),
            database: PathBuf::from(DEFAULT_DATABASE),
            log_dir: String::new(),
            debug: false,
            foreground_task_limit: policy.foreground_task_limit,
            allow_partial_assignments: policy.allow_partial_assignments,
            enable_cdc: policy.enable_cdc,
            cdc_topic: policy.cdc_topic,
            work_open: "06:00".to_string(),
            work_close: "18:00".to_string(),
            utc_offset_minutes: None,
            extra_holidays: Vec::new(),
            key_file: None,
            authorized: BTreeMap::new(),
        }
    }
}

impl HubConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Flags win over `AM_*` variables, which win over the file.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        Self::resolve(args, |key| std::env::var(key).ok())
    }

    pub fn resolve<F>(args: &Args, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        let file = args
            .config
            .clone()
            .or_else(|| env("AM_CONFIG").map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::from_toml_file(&path)?,
            None => Self::default(),
        };

        if let Some(value) = env("AM_ADDR") {
            config.addr = value;
        }
        if let Some(value) = env("AM_DATABASE") {
            config.database = PathBuf::from(value);
        }
        if let Some(value) = env("AM_LOG_DIR") {
            config.log_dir = value;
        }
        if let Some(value) = env("AM_KEY_FILE") {
            config.key_file = Some(PathBuf::from(value));
        }
        if let Some(value) = env("AM_FOREGROUND_TASK_LIMIT") {
            config.foreground_task_limit =
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: "AM_FOREGROUND_TASK_LIMIT",
                    message: format!("{value} is not a number"),
                })?;
        }
        config.debug |= env("AM_HUB_DEBUG").is_some_and(|value| truthy(&value));
        config.allow_partial_assignments |=
            env("AM_ALLOW_PARTIAL_ASSIGNMENTS").is_some_and(|value| truthy(&value));
        config.enable_cdc |= env("AM_ENABLE_CDC").is_some_and(|value| truthy(&value));

        if !args.addr.trim().is_empty() {
            config.addr = args.addr.clone();
        }
        if let Some(database) = &args.database {
            config.database = database.clone();
        }
        if !args.log_dir.trim().is_empty() {
            config.log_dir = args.log_dir.clone();
        }
        if let Some(limit) = args.foreground_task_limit {
            config.foreground_task_limit = limit;
        }
        if let Some(key_file) = &args.key_file {
            config.key_file = Some(key_file.clone());
        }
        config.debug |= args.debug;
        Ok(config)
    }

    pub fn policy(&self) -> ManagerPolicy {
        ManagerPolicy {
            allow_partial_assignments: self.allow_partial_assignments,
            foreground_task_limit: self.foreground_task_limit,
            enable_cdc: self.enable_cdc,
            cdc_topic: self.cdc_topic.clone(),
        }
    }

    pub fn calendar(&self) -> Result<WorkCalendar, ConfigError> {
        let open = parse_time("work_open", &self.work_open)?;
        let close = parse_time("work_close", &self.work_close)?;
        let mut extra = Vec::with_capacity(self.extra_holidays.len());
        for date in &self.extra_holidays {
            extra.push(NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|err| {
                ConfigError::Invalid {
                    key: "extra_holidays",
                    message: format!("{date}: {err}"),
                }
            })?);
        }
        let offset = match self.utc_offset_minutes {
            Some(minutes) => Some(FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
                ConfigError::Invalid {
                    key: "utc_offset_minutes",
                    message: format!("{minutes} is out of range"),
                }
            })?),
            None => None,
        };
        WorkCalendar::new(open, close, HolidayCalendar::us_federal().with_extra(extra), offset).map_err(
            |err| ConfigError::Invalid {
                key: "work_close",
                message: err.to_string(),
            },
        )
    }

    pub fn store_context(&self) -> Result<StoreContext, ConfigError> {
        Ok(StoreContext::default()
            .with_policy(self.policy())
            .with_calendar(self.calendar()?))
    }

    pub fn user_for_token(&self, token: &str) -> Option<&str> {
        self.authorized.get(token).map(String::as_str)
    }
}

fn parse_time(key: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|err| ConfigError::Invalid {
        key,
        message: format!("{value}: {err}"),
    })
}

pub fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_apply_without_file_env_or_flags() {
        let config = HubConfig::resolve(&Args::default(), no_env).expect("config");
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.foreground_task_limit, 1000);
        let calendar = config.calendar().expect("calendar");
        assert_eq!(calendar.open(), NaiveTime::from_hms_opt(6, 0, 0).expect("time"));
    }

    #[test]
    fn flags_beat_env_which_beats_file() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "addr = \"127.0.0.1:9000\"\ndatabase = \"from-file.db\"\nforeground_task_limit = 10\n\
             extra_holidays = [\"2024-03-13\"]\n[authorized]\nsecret = \"amy\""
        )
        .expect("write config");

        let args = Args {
            config: Some(file.path().to_path_buf()),
            database: Some(PathBuf::from("from-flag.db")),
            ..Args::default()
        };
        let env = |key: &str| match key {
            "AM_ADDR" => Some("127.0.0.1:9100".to_string()),
            "AM_DATABASE" => Some("from-env.db".to_string()),
            "AM_ENABLE_CDC" => Some("yes".to_string()),
            _ => None,
        };
        let config = HubConfig::resolve(&args, env).expect("config");
        assert_eq!(config.addr, "127.0.0.1:9100");
        assert_eq!(config.database, PathBuf::from("from-flag.db"));
        assert_eq!(config.foreground_task_limit, 10);
        assert!(config.enable_cdc);
        assert_eq!(config.user_for_token("secret"), Some("amy"));
        assert!(config.policy().enable_cdc);

        let calendar = config.calendar().expect("calendar");
        let holiday = NaiveDate::from_ymd_opt(2024, 3, 13).expect("date");
        assert!(!calendar.is_working_day(holiday));
    }

    #[test]
    fn malformed_settings_are_reported() {
        let config = HubConfig {
            work_open: "18:00".to_string(),
            work_close: "06:00".to_string(),
            ..HubConfig::default()
        };
        assert!(matches!(config.calendar(), Err(ConfigError::Invalid { .. })));

        let env = |key: &str| (key == "AM_FOREGROUND_TASK_LIMIT").then(|| "lots".to_string());
        let err = HubConfig::resolve(&Args::default(), env).expect_err("bad limit");
        assert!(err.to_string().contains("AM_FOREGROUND_TASK_LIMIT"));
    }
}
