//! Verification service seam and the external-command adapter.

use crate::types::MatchCandidate;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Substrings that mark a result column as a distance.
const DISTANCE_COLUMN_HINTS: [&str; 4] = ["cosine", "distance", "l2", "euclidean"];

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("gallery unreachable: {path}: {source}")]
    Gallery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read probe {path}: {message}")]
    Probe { path: PathBuf, message: String },
    #[error("unsupported {option} '{value}' for this verifier")]
    Unsupported { option: &'static str, value: String },
    #[error("embedding failed: {0}")]
    Recognizer(#[from] crate::recognizer::RecognizerError),
    #[error("face detection failed: {0}")]
    Detector(#[from] crate::detector::DetectorError),
    #[error("verification service failed: {0}")]
    Service(String),
    #[error("malformed verification result: {0}")]
    Malformed(String),
}

/// Opaque options forwarded to the service unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyParams {
    pub model_name: String,
    pub detector_backend: String,
    pub distance_metric: String,
}

/// Matches a probe image against a gallery directory.
///
/// Implementations may block for hundreds of milliseconds. Detection is
/// never enforced: a probe without a detectable face yields an empty result
/// rather than an error.
pub trait VerificationService: Send {
    fn find(
        &mut self,
        probe: &Path,
        gallery: &Path,
        params: &VerifyParams,
    ) -> Result<Vec<MatchCandidate>, VerifyError>;
}

/// Runs an external matcher and parses the JSON rows it prints.
///
/// The program receives `--img-path`, `--db-path`, `--model-name`,
/// `--detector-backend`, `--distance-metric` and `--enforce-detection false`
/// after its configured arguments, and must print either an array of row
/// objects or an array of such arrays (only the first is used).
pub struct CommandVerifier {
    program: String,
    args: Vec<String>,
}

impl CommandVerifier {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl VerificationService for CommandVerifier {
    fn find(
        &mut self,
        probe: &Path,
        gallery: &Path,
        params: &VerifyParams,
    ) -> Result<Vec<MatchCandidate>, VerifyError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--img-path")
            .arg(probe)
            .arg("--db-path")
            .arg(gallery)
            .args(["--model-name", params.model_name.as_str()])
            .args(["--detector-backend", params.detector_backend.as_str()])
            .args(["--distance-metric", params.distance_metric.as_str()])
            .args(["--enforce-detection", "false"])
            .output()
            .map_err(|e| VerifyError::Service(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VerifyError::Service(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let rows: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| VerifyError::Malformed(format!("invalid JSON: {e}")))?;
        let candidates = parse_rows(&rows)?;
        tracing::debug!(program = %self.program, candidates = candidates.len(), "command verifier finished");
        Ok(candidates)
    }
}

/// Turn result rows into candidates.
///
/// The distance column is picked once, from the first row: the first key
/// whose lowercase name contains a distance hint and whose value is a
/// number. If there is none, every candidate carries `distance = None`.
pub fn parse_rows(rows: &Value) -> Result<Vec<MatchCandidate>, VerifyError> {
    let mut rows = rows
        .as_array()
        .ok_or_else(|| VerifyError::Malformed("expected a JSON array".into()))?;

    // A list of per-face result sets; like a single probe, use the first.
    if let Some(Value::Array(first)) = rows.first() {
        rows = first;
    }

    let distance_column = rows
        .first()
        .and_then(Value::as_object)
        .and_then(|row| {
            row.iter()
                .find(|(key, value)| {
                    let key = key.to_ascii_lowercase();
                    value.is_number() && DISTANCE_COLUMN_HINTS.iter().any(|h| key.contains(h))
                })
                .map(|(key, _)| key.clone())
        });

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let row = row
                .as_object()
                .ok_or_else(|| VerifyError::Malformed(format!("row {i} is not an object")))?;
            let identity = row
                .get("identity")
                .and_then(Value::as_str)
                .ok_or_else(|| VerifyError::Malformed(format!("row {i} has no identity")))?;
            let distance = distance_column
                .as_ref()
                .and_then(|col| row.get(col))
                .and_then(Value::as_f64)
                .map(|d| d as f32);
            Ok(MatchCandidate {
                identity: identity.to_owned(),
                distance,
            })
        })
        .collect()
}
