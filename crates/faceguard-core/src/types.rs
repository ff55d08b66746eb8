use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Distance under `metric`. Lower = more similar; never negative.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => (1.0 - self.similarity(other)).max(0.0),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self.l2_normalized().euclidean_distance(&other.l2_normalized()),
        }
    }

    fn l2_normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// Distance function named by the `distance_metric` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl DistanceMetric {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cosine" => Some(Self::Cosine),
            "euclidean" => Some(Self::Euclidean),
            "euclidean_l2" => Some(Self::EuclideanL2),
            _ => None,
        }
    }
}

/// A detected face in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// One row of a verification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Gallery reference as reported by the service (usually a file path).
    pub identity: String,
    /// `None` when the service reported no usable distance for this row.
    pub distance: Option<f32>,
}

impl MatchCandidate {
    pub fn new(identity: impl Into<String>, distance: f32) -> Self {
        Self {
            identity: identity.into(),
            distance: Some(distance),
        }
    }

    pub fn label(&self) -> String {
        identity_label(&self.identity)
    }
}

/// Bare identity label for a gallery reference: directory and extension stripped.
///
/// `known_faces/alice.jpg` → `alice`. A reference with no file stem is
/// returned unchanged.
pub fn identity_label(identity: &str) -> String {
    Path::new(identity)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_owned)
        .unwrap_or_else(|| identity.to_owned())
}

/// Result of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "label", rename_all = "lowercase")]
pub enum AttemptOutcome {
    Granted(String),
    Denied,
}

impl AttemptOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Granted(_) => "granted",
            Self::Denied => "denied",
        }
    }
}

/// Everything an alert needs about one attempt. Built once, sent once.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub outcome: AttemptOutcome,
    /// JPEG-encoded probe; empty if the snapshot could not be encoded.
    pub image: Vec<u8>,
    pub timestamp: DateTime<Local>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_distance() {
        let a = emb(&[1.0, 0.0]);
        assert!(a.distance(&a, DistanceMetric::Cosine).abs() < 1e-6);
        assert!((a.distance(&emb(&[0.0, 1.0]), DistanceMetric::Cosine) - 1.0).abs() < 1e-6);
        assert!((a.distance(&emb(&[-1.0, 0.0]), DistanceMetric::Cosine) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_ignores_magnitude() {
        let a = emb(&[3.0, 0.0]);
        let b = emb(&[10.0, 0.0]);
        assert!((a.distance(&b, DistanceMetric::Euclidean) - 7.0).abs() < 1e-6);
        assert!(a.distance(&b, DistanceMetric::EuclideanL2).abs() < 1e-6);
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(DistanceMetric::parse("cosine"), Some(DistanceMetric::Cosine));
        assert_eq!(DistanceMetric::parse("Euclidean_L2"), Some(DistanceMetric::EuclideanL2));
        assert_eq!(DistanceMetric::parse("manhattan"), None);
    }

    #[test]
    fn test_identity_label_strips_path_and_extension() {
        assert_eq!(identity_label("known_faces/alice.jpg"), "alice");
        assert_eq!(identity_label("/srv/gallery/bob/bob.smith.png"), "bob.smith");
        assert_eq!(identity_label("carol"), "carol");
    }

    #[test]
    fn test_outcome_serializes_with_label() {
        let json = serde_json::to_value(AttemptOutcome::Granted("alice".into())).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "granted", "label": "alice"}));
        let json = serde_json::to_value(AttemptOutcome::Denied).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "denied"}));
    }
}
