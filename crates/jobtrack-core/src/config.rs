//! Environment + profile configuration, read once at startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },

    #[error("tracker profile {path}: {reason}")]
    Profile { path: PathBuf, reason: String },
}

#[derive(Clone)]
pub struct AppConfig {
    pub notion_api_key: String,
    pub notion_database_id: String,
    pub notion_api_base: String,
    pub notion_version: String,
    pub board_api_base: String,
    pub board_token: String,
    pub profile_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub summary_chars: usize,
    pub reports_dir: Option<PathBuf>,
    pub log_level: String,
}

impl AppConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("notion_api_key", &"[redacted]")
            .field("notion_database_id", &self.notion_database_id)
            .field("notion_api_base", &self.notion_api_base)
            .field("notion_version", &self.notion_version)
            .field("board_api_base", &self.board_api_base)
            .field("board_token", &self.board_token)
            .field("profile_path", &self.profile_path)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("summary_chars", &self.summary_chars)
            .field("reports_dir", &self.reports_dir)
            .field("log_level", &self.log_level)
            .finish()
    }
}

/// Load configuration, reading a `.env` file first when one exists.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_app_config_from_env()
}

/// Load configuration from the variables already in the process environment.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_app_config_from_env() -> Result<AppConfig, ConfigError> {
    build_app_config(|key| std::env::var(key))
}

/// Build configuration from an arbitrary lookup, so tests can feed a map.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn build_app_config<F>(lookup: F) -> Result<AppConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let require = |var: &str| -> Result<String, ConfigError> {
        lookup(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
    };

    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    let optional_path = |var: &str| -> Option<PathBuf> {
        lookup(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    };

    let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
        or_default(var, default)
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidEnvVar {
                var: var.to_string(),
                reason: e.to_string(),
            })
    };

    let parse_usize = |var: &str, default: &str| -> Result<usize, ConfigError> {
        or_default(var, default)
            .parse::<usize>()
            .map_err(|e| ConfigError::InvalidEnvVar {
                var: var.to_string(),
                reason: e.to_string(),
            })
    };

    let notion_api_key = require("NOTION_API_KEY")?;
    let notion_database_id = require("NOTION_DATABASE_ID")?;
    if notion_database_id.trim().is_empty() {
        return Err(ConfigError::InvalidEnvVar {
            var: "NOTION_DATABASE_ID".to_string(),
            reason: "must not be blank".to_string(),
        });
    }

    let http_timeout_secs = parse_u64("JOBTRACK_HTTP_TIMEOUT_SECS", "60")?;
    if http_timeout_secs == 0 {
        return Err(ConfigError::InvalidEnvVar {
            var: "JOBTRACK_HTTP_TIMEOUT_SECS".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }

    let summary_chars = parse_usize("JOBTRACK_SUMMARY_CHARS", "2000")?;
    if !(1..=2000).contains(&summary_chars) {
        return Err(ConfigError::InvalidEnvVar {
            var: "JOBTRACK_SUMMARY_CHARS".to_string(),
            reason: "must be between 1 and 2000".to_string(),
        });
    }

    Ok(AppConfig {
        notion_api_key,
        notion_database_id: notion_database_id.trim().to_string(),
        notion_api_base: or_default("NOTION_API_BASE", "https://api.notion.com/v1"),
        notion_version: or_default("NOTION_VERSION", "2022-06-28"),
        board_api_base: or_default(
            "JOBTRACK_BOARD_API_BASE",
            "https://boards-api.greenhouse.io/v1/boards",
        ),
        board_token: or_default("JOBTRACK_BOARD_TOKEN", "andurilindustries"),
        profile_path: optional_path("JOBTRACK_PROFILE_PATH"),
        http_timeout_secs,
        user_agent: or_default("JOBTRACK_USER_AGENT", "jobtrack/0.1"),
        summary_chars,
        reports_dir: optional_path("JOBTRACK_REPORTS_DIR"),
        log_level: or_default("JOBTRACK_LOG_LEVEL", "info"),
    })
}

/// The fixed set of offices to track plus department clean-up rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrackerProfile {
    pub offices: Vec<OfficeProfile>,
    #[serde(default)]
    pub department_rules: Vec<DepartmentRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OfficeProfile {
    /// Label written to the store's office column.
    pub label: String,
    /// Case-insensitive needles matched against location and office names.
    pub keywords: Vec<String>,
    /// Optional department needles; empty keeps every department.
    #[serde(default)]
    pub departments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepartmentRule {
    pub contains_any: Vec<String>,
    pub normalize_to: String,
}

impl OfficeProfile {
    pub fn matches_location(&self, names: &[&str]) -> bool {
        names.iter().any(|name| {
            let lower = name.to_lowercase();
            self.keywords
                .iter()
                .any(|k| !k.trim().is_empty() && lower.contains(&k.to_lowercase()))
        })
    }

    pub fn accepts_department(&self, department: &str) -> bool {
        if self.departments.is_empty() {
            return true;
        }
        let lower = department.to_lowercase();
        self.departments
            .iter()
            .any(|d| lower.contains(&d.to_lowercase()))
    }
}

impl TrackerProfile {
    /// Offices tracked when no profile file is configured.
    pub fn builtin() -> Self {
        Self {
            offices: vec![
                OfficeProfile {
                    label: "Taipei Taiwan".to_string(),
                    keywords: vec!["taipei".to_string(), "taiwan".to_string()],
                    departments: Vec::new(),
                },
                OfficeProfile {
                    label: "Tokyo Japan".to_string(),
                    keywords: vec!["tokyo".to_string(), "japan".to_string()],
                    departments: Vec::new(),
                },
            ],
            department_rules: vec![
                DepartmentRule {
                    contains_any: vec!["test".to_string(), "electrical".to_string()],
                    normalize_to: "Electrical Test Engineering".to_string(),
                },
                DepartmentRule {
                    contains_any: vec!["business".to_string(), "bd".to_string()],
                    normalize_to: "Business Development".to_string(),
                },
            ],
        }
    }

    pub fn office(&self, label: &str) -> Option<&OfficeProfile> {
        self.offices
            .iter()
            .find(|o| o.label.eq_ignore_ascii_case(label))
    }

    /// The one office a posting belongs to: the first profile office whose
    /// location and department filters both accept it.
    pub fn home_office(&self, place_names: &[&str], department: &str) -> Option<&OfficeProfile> {
        self.offices
            .iter()
            .find(|o| o.matches_location(place_names) && o.accepts_department(department))
    }

    /// Apply the first matching rule, falling back to the raw department name.
    pub fn normalize_department(&self, department: &str) -> String {
        let lower = department.to_lowercase();
        self.department_rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| lower.contains(&needle.to_lowercase()))
            })
            .map(|rule| rule.normalize_to.clone())
            .unwrap_or_else(|| department.to_string())
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Profile {
            path: path.to_path_buf(),
            reason,
        };
        if self.offices.is_empty() {
            return Err(invalid("at least one office is required".to_string()));
        }
        for office in &self.offices {
            if office.label.trim().is_empty() {
                return Err(invalid("office label must not be blank".to_string()));
            }
            if office.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(invalid(format!("office {} has no keywords", office.label)));
            }
        }
        Ok(())
    }
}

/// Load the tracker profile from `path`, or the built-in one when unset.
///
/// # Errors
///
/// Returns `ConfigError::Profile` if the file cannot be read, parsed, or validated.
pub fn load_profile(path: Option<&Path>) -> Result<TrackerProfile, ConfigError> {
    let Some(path) = path else {
        return Ok(TrackerProfile::builtin());
    };
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Profile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let profile: TrackerProfile =
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Profile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    profile.validate(path)?;
    Ok(profile)
}
