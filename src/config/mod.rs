//! Configuration loading
//!
//! JSON5 file with `${VAR}` environment substitution in string values.
//! `$${VAR}` produces a literal `${VAR}`. A missing file yields
//! [`Config::default`].

pub mod types;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::media::fetch::MAX_FETCH_TIMEOUT_MS;

pub use types::{Config, LoggingConfig, MediaConfig, StorageBackend, StorageConfig};

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "MEDIAGATE_CONFIG_PATH";

const CONFIG_FILE_NAME: &str = "mediagate.json5";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid configuration: {}", format_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

/// One problem found by [`validate_config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Get the config file path.
/// Priority: MEDIAGATE_CONFIG_PATH > ~/.config/mediagate/mediagate.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mediagate")
        .join(CONFIG_FILE_NAME)
}

/// Load the configuration from [`get_config_path`].
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load, substitute and validate the configuration at `path`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let config = parse_config(&content, path)?;

    let issues = validate_config(&config);
    if !issues.is_empty() {
        return Err(ConfigError::Invalid(issues));
    }

    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Parse JSON5 text into a [`Config`] without validating it.
pub fn parse_config(content: &str, path: &Path) -> Result<Config, ConfigError> {
    let parse_err = |message: String| ConfigError::ParseError {
        path: path.display().to_string(),
        message,
    };

    let mut value: Value = json5::from_str(content).map_err(|e| parse_err(e.to_string()))?;
    substitute_env_vars(&mut value)?;
    serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))
}

/// Substitute environment variables in every string value.
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

static ENV_VAR_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}"));

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    let pattern = ENV_VAR_PATTERN
        .as_ref()
        .map_err(|e| ConfigError::ParseError {
            path: "<env pattern>".to_string(),
            message: e.to_string(),
        })?;

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in pattern.captures_iter(s) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        result.push_str(&s[last_end..whole.start()]);

        if whole.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", name.as_str()));
        } else {
            let value = env::var(name.as_str()).map_err(|_| ConfigError::MissingEnvVar {
                var: name.as_str().to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = whole.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

/// Check a parsed configuration for values the pipeline cannot run with.
/// Returns every issue found (empty if valid).
pub fn validate_config(config: &Config) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let media = &config.media;
    if media.max_file_size == 0 {
        issues.push(ValidationIssue::new(".media.maxFileSize", "must be greater than 0"));
    }
    if media.allowed_formats.is_empty() {
        issues.push(ValidationIssue::new(
            ".media.allowedFormats",
            "must list at least one MIME prefix",
        ));
    }
    for (i, prefix) in media.allowed_formats.iter().enumerate() {
        if prefix.trim().is_empty() {
            issues.push(ValidationIssue::new(
                &format!(".media.allowedFormats[{}]", i),
                "must not be empty",
            ));
        }
    }
    if media.image_max_width == 0 {
        issues.push(ValidationIssue::new(".media.imageMaxWidth", "must be greater than 0"));
    }
    if media.image_max_height == 0 {
        issues.push(ValidationIssue::new(".media.imageMaxHeight", "must be greater than 0"));
    }

    let storage = &config.storage;
    if storage.bucket.trim().is_empty() {
        issues.push(ValidationIssue::new(".storage.bucket", "must not be empty"));
    } else if storage.bucket.contains('/') || storage.bucket.contains("..") {
        issues.push(ValidationIssue::new(
            ".storage.bucket",
            "must not contain '/' or '..'",
        ));
    }
    if let Some(base) = &storage.public_base_url {
        if url::Url::parse(base).is_err() {
            issues.push(ValidationIssue::new(".storage.publicBaseUrl", "must be an absolute URL"));
        }
    }
    if let Some(endpoint) = &storage.endpoint {
        if url::Url::parse(endpoint).is_err() {
            issues.push(ValidationIssue::new(".storage.endpoint", "must be an absolute URL"));
        }
    }

    if config.fetch.timeout_ms == 0 || config.fetch.timeout_ms > MAX_FETCH_TIMEOUT_MS {
        issues.push(ValidationIssue::new(
            ".fetch.timeoutMs",
            format!("must be between 1 and {}", MAX_FETCH_TIMEOUT_MS),
        ));
    }

    if tracing_subscriber::EnvFilter::try_new(&config.logging.level).is_err() {
        issues.push(ValidationIssue::new(
            ".logging.level",
            format!("invalid filter directive: {}", config.logging.level),
        ));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serializes tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn parse(content: &str) -> Result<Config, ConfigError> {
        parse_config(content, Path::new("test.json5"))
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.media.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.media.allowed_formats, vec!["image/", "audio/", "video/"]);
        assert_eq!(config.storage.bucket, "media");
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_parse_json5_sections() {
        let config = parse(
            r#"{
                // comments and unquoted keys are fine
                media: { maxFileSize: 2048, imageMaxWidth: 800, imageMaxHeight: 600 },
                storage: { backend: "s3", bucket: "tours", forcePathStyle: true },
                fetch: { allowHttp: true },
                logging: { level: "debug", format: "json" },
            }"#,
        )
        .unwrap();

        assert_eq!(config.media.max_file_size, 2048);
        assert_eq!(config.media.image_max_width, 800);
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert!(config.storage.force_path_style);
        assert!(config.fetch.allow_http);
        assert_eq!(config.logging.format, LogFormat::Json);

        let settings = config.ingest_settings();
        assert_eq!(settings.bucket, "tours");
        assert_eq!((settings.image_max_width, settings.image_max_height), (800, 600));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let result = parse("{ gateway: { port: 1 } }");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse("{ media: "), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_var_substitution() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("MEDIAGATE_TEST_BUCKET", "from-env");
        let config = parse(r#"{ storage: { bucket: "${MEDIAGATE_TEST_BUCKET}" } }"#).unwrap();
        env::remove_var("MEDIAGATE_TEST_BUCKET");
        assert_eq!(config.storage.bucket, "from-env");
    }

    #[test]
    fn test_env_var_partial_and_escaped() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("MEDIAGATE_TEST_HOST", "cdn.example.com");
        let result = substitute_env_in_string("https://${MEDIAGATE_TEST_HOST}/m and $${KEEP}");
        env::remove_var("MEDIAGATE_TEST_HOST");
        assert_eq!(result.unwrap(), "https://cdn.example.com/m and ${KEEP}");
    }

    #[test]
    fn test_env_var_missing() {
        let result = substitute_env_in_string("${MEDIAGATE_DOES_NOT_EXIST_42}");
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar { var }) if var == "MEDIAGATE_DOES_NOT_EXIST_42")
        );
    }

    #[test]
    fn test_validation_reports_every_issue() {
        let mut config = Config::default();
        config.media.max_file_size = 0;
        config.media.allowed_formats = vec!["image/".into(), " ".into()];
        config.storage.bucket = String::new();
        config.fetch.timeout_ms = 0;

        let paths: Vec<String> = validate_config(&config).into_iter().map(|i| i.path).collect();
        assert_eq!(
            paths,
            vec![
                ".media.maxFileSize",
                ".media.allowedFormats[1]",
                ".storage.bucket",
                ".fetch.timeoutMs",
            ]
        );
    }

    #[test]
    fn test_validation_empty_allow_list() {
        let mut config = Config::default();
        config.media.allowed_formats.clear();
        let issues = validate_config(&config);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, ".media.allowedFormats");
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mediagate.json5");
        fs::write(&path, "{ media: { imageMaxWidth: 0 } }").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains(".media.imageMaxWidth"));
    }

    #[test]
    fn test_get_config_path_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var(CONFIG_PATH_ENV, "/tmp/custom.json5");
        let path = get_config_path();
        env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(path, PathBuf::from("/tmp/custom.json5"));
    }

    #[test]
    fn test_get_config_path_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var(CONFIG_PATH_ENV);
        assert!(get_config_path().ends_with(".config/mediagate/mediagate.json5"));
    }
}
