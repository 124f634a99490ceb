use crate::error::AppError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "usage-report";
pub const ENV_PREFIX: &str = "USAGE_REPORT";

pub fn normalize_dimension_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("USAGE_REPORT_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("org", "nectar", APP_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".usage-report"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Reporting API base URL.
    pub endpoint: String,
    /// Sent verbatim as `x-auth-token` when present.
    pub token: Option<String>,
    pub timeout_seconds: u64,
    pub dimensions: Vec<String>,
    pub custom_dimensions: Vec<CustomDimension>,
    /// Currency charged per service-unit hour.
    pub su_price: f64,
    /// Availability zone => service unit scaling factor.
    pub su_scale: HashMap<String, f64>,
    pub history_months: u32,
}

/// Dimension defined in config as a scaled sum of record fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomDimension {
    pub key: String,
    pub fields: Vec<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9495".into(),
            token: None,
            timeout_seconds: 30,
            dimensions: vec!["vcpus".into(), "memory".into(), "local".into()],
            custom_dimensions: vec![],
            su_price: 0.0,
            su_scale: HashMap::new(),
            history_months: 6,
        }
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    Ok(())
}

fn dedupe_keys(keys: &mut Vec<String>) -> bool {
    let mut changed = false;
    let mut unique: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys.iter() {
        let normalized = normalize_dimension_key(key);
        if normalized != *key {
            changed = true;
        }
        if normalized.is_empty() || unique.contains(&normalized) {
            changed = true;
            continue;
        }
        unique.push(normalized);
    }
    *keys = unique;
    changed
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = dedupe_keys(&mut config.dimensions);

    for custom in &mut config.custom_dimensions {
        let normalized = normalize_dimension_key(&custom.key);
        if normalized != custom.key {
            custom.key = normalized;
            changed = true;
        }
    }

    let mut scale = HashMap::with_capacity(config.su_scale.len());
    for (zone, factor) in std::mem::take(&mut config.su_scale) {
        let normalized = normalize_dimension_key(&zone);
        if normalized != zone {
            changed = true;
        }
        scale.insert(normalized, factor);
    }
    config.su_scale = scale;

    let endpoint = config.endpoint.trim_end_matches('/').to_string();
    if endpoint != config.endpoint {
        config.endpoint = endpoint;
        changed = true;
    }

    changed
}

/// Loads the config file (if any) and layers `USAGE_REPORT_*` environment
/// variables over it.
pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    let settings = ::config::Config::builder()
        .add_source(::config::File::from(path.as_path()).required(false))
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("dimensions"),
        )
        .build()?;

    let mut parsed: AppConfig = settings.try_deserialize()?;
    if normalize_config(&mut parsed) {
        tracing::debug!(path = %path.display(), "normalized config values");
    }
    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

pub fn ensure_initialized() -> Result<PathBuf, AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(cfg_path)
}
