//! Configuration types.
//!
//! Every value has a default; `from_env()` overrides them from `OUTREACH_*`
//! environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;

/// Default recipients per generation batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default per-file attachment ceiling (20 MB).
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

/// Pipeline tuning: batch sizing, pacing, and attachment limits.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Recipients submitted to the generator per call.
    pub batch_size: usize,
    /// Sleep between generation batches.
    pub batch_pacing: Duration,
    /// Sleep between enrichment calls.
    pub enrichment_pacing: Duration,
    /// Sleep between immediate sends.
    pub send_pacing: Duration,
    /// Per-file attachment ceiling in bytes.
    pub max_attachment_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pacing: Duration::from_secs(1),
            enrichment_pacing: Duration::from_millis(500),
            send_pacing: Duration::from_millis(400),
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

impl PipelineConfig {
    /// Config with all pacing disabled (tests, local dry runs).
    pub fn unpaced() -> Self {
        Self {
            batch_pacing: Duration::ZERO,
            enrichment_pacing: Duration::ZERO,
            send_pacing: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            batch_size: env_parse("OUTREACH_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            batch_pacing: env_millis("OUTREACH_BATCH_PACING_MS")?
                .unwrap_or(defaults.batch_pacing),
            enrichment_pacing: env_millis("OUTREACH_ENRICHMENT_PACING_MS")?
                .unwrap_or(defaults.enrichment_pacing),
            send_pacing: env_millis("OUTREACH_SEND_PACING_MS")?.unwrap_or(defaults.send_pacing),
            max_attachment_bytes: env_parse("OUTREACH_MAX_ATTACHMENT_BYTES")?
                .unwrap_or(defaults.max_attachment_bytes),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.max_attachment_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OUTREACH_MAX_ATTACHMENT_BYTES".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Connection settings for the external content generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Batch generation endpoint.
    pub endpoint: String,
    /// Cover letter endpoint for the enrichment pass, if enabled.
    pub enrich_endpoint: Option<String>,
    /// Bearer token of the current user session.
    pub token: SecretString,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl GeneratorConfig {
    /// Build from `OUTREACH_GENERATOR_URL` and friends.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = std::env::var("OUTREACH_GENERATOR_URL")
            .map_err(|_| ConfigError::MissingEnvVar("OUTREACH_GENERATOR_URL".into()))?;
        let token = std::env::var("OUTREACH_SESSION_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("OUTREACH_SESSION_TOKEN".into()))?;
        let enrich_endpoint = std::env::var("OUTREACH_ENRICH_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let timeout_secs: u64 = env_parse("OUTREACH_GENERATOR_TIMEOUT_SECS")?.unwrap_or(120);

        Ok(Self {
            endpoint,
            enrich_endpoint,
            token: SecretString::from(token),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// SMTP settings for immediate delivery.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl MailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `OUTREACH_SMTP_HOST` is not set (delivery disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("OUTREACH_SMTP_HOST").ok()?;

        let smtp_port: u16 = std::env::var("OUTREACH_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("OUTREACH_SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("OUTREACH_SMTP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("OUTREACH_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

/// Per-invocation inputs of the binary.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// JSON file holding an array of manually entered addresses.
    pub manual_file: Option<PathBuf>,
    /// Files attached to every dispatched message.
    pub attachments: Vec<PathBuf>,
    pub template: Option<String>,
    pub profile: Option<String>,
    /// Run the cover letter pass.
    pub enrich: bool,
    /// Discard previously generated content.
    pub force: bool,
    /// Dispatch at this time instead of immediately.
    pub schedule_at: Option<DateTime<Utc>>,
    pub notify_on_sent: bool,
}

impl RunConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let schedule_at = match env_text("OUTREACH_SCHEDULE_AT") {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "OUTREACH_SCHEDULE_AT".into(),
                        message: e.to_string(),
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(Self {
            manual_file: env_text("OUTREACH_MANUAL_FILE").map(PathBuf::from),
            attachments: env_text("OUTREACH_ATTACHMENTS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            template: env_text("OUTREACH_TEMPLATE"),
            profile: env_text("OUTREACH_PROFILE"),
            enrich: env_parse("OUTREACH_ENRICH")?.unwrap_or(false),
            force: env_parse("OUTREACH_FORCE")?.unwrap_or(false),
            schedule_at,
            notify_on_sent: env_parse("OUTREACH_NOTIFY_ON_SENT")?.unwrap_or(false),
        })
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub generator: GeneratorConfig,
    pub mail: Option<MailConfig>,
    pub run: RunConfig,
    pub db_path: PathBuf,
    pub attachment_dir: PathBuf,
    pub progress_port: u16,
    pub due_check_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pipeline: PipelineConfig::from_env()?,
            generator: GeneratorConfig::from_env()?,
            mail: MailConfig::from_env(),
            run: RunConfig::from_env()?,
            db_path: std::env::var("OUTREACH_DB_PATH")
                .unwrap_or_else(|_| "./data/outreach.db".to_string())
                .into(),
            attachment_dir: std::env::var("OUTREACH_ATTACHMENT_DIR")
                .unwrap_or_else(|_| "./data/attachments".to_string())
                .into(),
            progress_port: env_parse("OUTREACH_PROGRESS_PORT")?.unwrap_or(8080),
            due_check_interval: Duration::from_secs(
                env_parse("OUTREACH_DUE_CHECK_SECS")?.unwrap_or(60),
            ),
        })
    }
}

/// Parse an optional environment variable, failing on malformed values.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

fn env_text(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_pacing, Duration::from_secs(1));
        assert_eq!(config.enrichment_pacing, Duration::from_millis(500));
        assert_eq!(config.max_attachment_bytes, 20 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unpaced_keeps_limits() {
        let config = PipelineConfig::unpaced();
        assert_eq!(config.batch_pacing, Duration::ZERO);
        assert_eq!(config.send_pacing, Duration::ZERO);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
