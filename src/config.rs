use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: "./data/crawler.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub interval_secs: u64,
    pub auto_crawl_enabled: bool,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub concurrency: u32,
    pub wechat_concurrency: u32,
    pub sources_dir: String,
    pub session_file: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            auto_crawl_enabled: true,
            request_timeout_secs: 30,
            max_retries: 3,
            concurrency: 5,
            wechat_concurrency: 3,
            sources_dir: "config/sources".to_string(),
            session_file: "cfg/session.json".to_string(),
        }
    }
}

/// OCR stays disabled until `command` names a runnable tesseract binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub command: String,
    pub tessdata_dir: String,
    pub languages: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            tessdata_dir: String::new(),
            languages: "chi_sim+eng".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: String,
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: "logs/harvester.log".to_string(),
            level: Some("info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub crawler: CrawlerConfig,
    pub ocr: OcrConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let explicit_path = std::env::var("CONFIG_FILE").ok();
        let config = if let Some(path) = explicit_path {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(anyhow!("config file {:?} not found", path));
            }
            Self::load_from_file(&path)?
        } else {
            let path = locate_default_config();
            if let Some(path) = path {
                Self::load_from_file(&path)?
            } else {
                AppConfig::default()
            }
        };

        Self::apply_env_overrides(config)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        Ok(config)
    }

    fn apply_env_overrides(mut config: AppConfig) -> anyhow::Result<AppConfig> {
        if let Ok(bind) = std::env::var("SERVER_BIND") {
            config.server.bind = bind;
        }

        if let Ok(path) = std::env::var("CRAWLER_DB_PATH") {
            config.db.path = path;
        }

        if let Some(max_conn) = parse_optional_env("DB_MAX_CONNECTIONS")? {
            config.db.max_connections = max_conn;
        }

        if let Some(interval) = parse_optional_env("CRAWL_INTERVAL")? {
            config.crawler.interval_secs = interval;
        }

        if let Some(enabled) = parse_bool_env("AUTO_CRAWL_ENABLED") {
            config.crawler.auto_crawl_enabled = enabled;
        }

        if let Some(concurrency) = parse_optional_env("CRAWL_CONCURRENCY")? {
            config.crawler.concurrency = concurrency;
        }

        if let Ok(command) = std::env::var("OCR_COMMAND") {
            config.ocr.command = command;
        }

        if let Ok(dir) = std::env::var("TESSDATA_DIR") {
            config.ocr.tessdata_dir = dir;
        }

        if let Ok(log_file) = std::env::var("LOG_FILE_PATH") {
            config.logging.file = log_file;
        }

        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.logging.level = Some(log_level);
        }

        if config.db.path.trim().is_empty() {
            return Err(anyhow!(
                "database path missing; set CRAWLER_DB_PATH env var or db.path in config file"
            ));
        }

        Ok(config)
    }
}

fn parse_optional_env<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => Ok(Some(
            v.parse::<T>()
                .with_context(|| format!("{key} must be a valid value"))?,
        )),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Truthy forms are 1/true/yes/on; any other present value counts as false.
fn parse_bool_env(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    Some(matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

fn locate_default_config() -> Option<PathBuf> {
    let candidates = [
        PathBuf::from("config/config.yaml"),
        PathBuf::from("../config/config.yaml"),
    ];

    for path in candidates {
        if path.exists() {
            return Some(path);
        }
    }

    None
}
