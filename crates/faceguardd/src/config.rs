//! Daemon configuration: TOML file, `FACEGUARD_*` overrides, validation.

use faceguard_core::{MissingDistancePolicy, VerifyParams, DEFAULT_THRESHOLD};
use faceguard_hw::SourceOptions;
use secrecy::SecretString;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CAMERA_INDEX: u32 = 0;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 30;
pub const DEFAULT_DEGRADED_AFTER_SECS: u64 = 5;
pub const DEFAULT_GALLERY_PATH: &str = "known_faces";
pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_MODEL_NAME: &str = "ArcFace";
pub const DEFAULT_DETECTOR_BACKEND: &str = "skip";
pub const DEFAULT_DISTANCE_METRIC: &str = "cosine";

const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// On-disk configuration; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub camera_index: Option<u32>,
    pub frame_interval_ms: Option<u64>,
    pub degraded_after_secs: Option<u64>,
    pub gallery_path: Option<PathBuf>,
    pub distance_threshold: Option<f32>,
    pub missing_distance: Option<MissingDistancePolicy>,
    pub verifier: Option<VerifierKind>,
    pub model_dir: Option<PathBuf>,
    pub verifier_command: Option<Vec<String>>,
    pub model_name: Option<String>,
    pub detector_backend: Option<String>,
    pub distance_metric: Option<String>,
    pub recipients: Option<Vec<String>>,
    pub sender: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub resource_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    #[default]
    Onnx,
    Command,
}

/// Which verification adapter to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierBackend {
    /// In-process ArcFace; `detector_path` is set for `detector_backend = "scrfd"`.
    Onnx {
        model_path: PathBuf,
        detector_path: Option<PathBuf>,
    },
    /// External matcher: program followed by its fixed arguments.
    Command { program: String, args: Vec<String> },
}

/// Outbound mail settings.
#[derive(Debug)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub sender: String,
}

/// Daemon configuration. Built once at startup and never mutated.
#[derive(Debug)]
pub struct Config {
    pub camera_index: u32,
    pub source: SourceOptions,
    pub gallery_path: PathBuf,
    pub distance_threshold: f32,
    pub missing_distance: MissingDistancePolicy,
    pub verifier: VerifierBackend,
    pub verify_params: VerifyParams,
    pub recipients: Vec<String>,
    pub smtp: SmtpSettings,
    /// Opened after every grant; nothing is opened when unset.
    pub resource_path: Option<PathBuf>,
}

impl Config {
    /// Load the TOML file (explicit path, or the per-user default if it
    /// exists) and apply `FACEGUARD_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) => read_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => read_file(&path)?,
                _ => ConfigFile::default(),
            },
        };
        Self::resolve(raw, |key| std::env::var(key).ok())
    }

    /// Merge `raw` with environment overrides from `env`, fill defaults, validate.
    pub fn resolve(
        mut raw: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        apply_env(&mut raw, &env)?;

        let distance_threshold = raw.distance_threshold.unwrap_or(DEFAULT_THRESHOLD);
        if !distance_threshold.is_finite() || distance_threshold < 0.0 {
            return Err(ConfigError::Invalid {
                key: "distance_threshold",
                message: format!("{distance_threshold} is not a non-negative number"),
            });
        }

        let detector_backend = raw
            .detector_backend
            .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string());

        let verifier = match raw.verifier.unwrap_or_default() {
            VerifierKind::Onnx => {
                let model_dir = raw.model_dir.unwrap_or_else(default_model_dir);
                let detector_path = match detector_backend.to_ascii_lowercase().as_str() {
                    "skip" => None,
                    "scrfd" => Some(model_dir.join(SCRFD_MODEL_FILE)),
                    other => {
                        return Err(ConfigError::Invalid {
                            key: "detector_backend",
                            message: format!(
                                "{other} needs verifier = \"command\"; the onnx verifier supports skip or scrfd"
                            ),
                        })
                    }
                };
                VerifierBackend::Onnx {
                    model_path: model_dir.join(ARCFACE_MODEL_FILE),
                    detector_path,
                }
            }
            VerifierKind::Command => {
                let mut command = raw.verifier_command.unwrap_or_default().into_iter();
                let program = command.next().ok_or(ConfigError::Missing("verifier_command"))?;
                VerifierBackend::Command {
                    program,
                    args: command.collect(),
                }
            }
        };

        let recipients = raw.recipients.unwrap_or_default();
        if recipients.is_empty() {
            return Err(ConfigError::Missing("recipients"));
        }

        let sender = raw.sender.ok_or(ConfigError::Missing("sender"))?;
        let port = raw.smtp_port.unwrap_or(DEFAULT_SMTP_PORT);
        if port == 0 {
            return Err(ConfigError::Invalid {
                key: "smtp_port",
                message: "port must be non-zero".into(),
            });
        }
        let smtp = SmtpSettings {
            host: raw.smtp_host.ok_or(ConfigError::Missing("smtp_host"))?,
            port,
            username: raw.smtp_username.unwrap_or_else(|| sender.clone()),
            password: SecretString::from(
                raw.smtp_password.ok_or(ConfigError::Missing("smtp_password"))?,
            ),
            sender,
        };

        Ok(Self {
            camera_index: raw.camera_index.unwrap_or(DEFAULT_CAMERA_INDEX),
            source: SourceOptions {
                interval: Duration::from_millis(
                    raw.frame_interval_ms.unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
                ),
                degraded_after: Duration::from_secs(
                    raw.degraded_after_secs
                        .unwrap_or(DEFAULT_DEGRADED_AFTER_SECS)
                        .max(1),
                ),
            },
            gallery_path: raw
                .gallery_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GALLERY_PATH)),
            distance_threshold,
            missing_distance: raw.missing_distance.unwrap_or_default(),
            verifier,
            verify_params: VerifyParams {
                model_name: raw
                    .model_name
                    .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
                detector_backend,
                distance_metric: raw
                    .distance_metric
                    .unwrap_or_else(|| DEFAULT_DISTANCE_METRIC.to_string()),
            },
            recipients,
            smtp,
            resource_path: raw.resource_path,
        })
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn apply_env(
    raw: &mut ConfigFile,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(v) = env_parse(env, "FACEGUARD_CAMERA_INDEX", "camera_index")? {
        raw.camera_index = Some(v);
    }
    if let Some(v) = env_parse(env, "FACEGUARD_DISTANCE_THRESHOLD", "distance_threshold")? {
        raw.distance_threshold = Some(v);
    }
    if let Some(v) = env_parse(env, "FACEGUARD_SMTP_PORT", "smtp_port")? {
        raw.smtp_port = Some(v);
    }
    if let Some(v) = env("FACEGUARD_GALLERY_PATH") {
        raw.gallery_path = Some(PathBuf::from(v));
    }
    if let Some(v) = env("FACEGUARD_MODEL_DIR") {
        raw.model_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = env("FACEGUARD_RESOURCE_PATH") {
        raw.resource_path = Some(PathBuf::from(v));
    }
    if let Some(v) = env("FACEGUARD_RECIPIENTS") {
        raw.recipients = Some(
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        );
    }
    for (key, slot) in [
        ("FACEGUARD_SENDER", &mut raw.sender),
        ("FACEGUARD_SMTP_HOST", &mut raw.smtp_host),
        ("FACEGUARD_SMTP_USERNAME", &mut raw.smtp_username),
        ("FACEGUARD_SMTP_PASSWORD", &mut raw.smtp_password),
    ] {
        if let Some(v) = env(key) {
            *slot = Some(v);
        }
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &str,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env(var)
        .map(|v| {
            v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                message: format!("{var}={v}: {e}"),
            })
        })
        .transpose()
}

fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(base.join("faceguard/config.toml"))
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceguard/models")
}
