//! faceguard-core: Identity verification and the access decision.
//!
//! Defines the verification service seam with two adapters (in-process
//! ArcFace over a gallery directory, or an external matcher command) and
//! the pure threshold policy that turns candidates into an outcome.

pub mod alignment;
pub mod decision;
pub mod detector;
pub mod gallery;
pub mod recognizer;
pub mod types;
pub mod verifier;

pub use decision::{DecisionEngine, MissingDistancePolicy, DEFAULT_THRESHOLD};
pub use detector::FaceDetector;
pub use gallery::{FaceEncoder, FaceLocator, GalleryVerifier};
pub use recognizer::FaceEmbedder;
pub use types::{
    identity_label, AlertRecord, BoundingBox, AttemptOutcome, DistanceMetric, Embedding, MatchCandidate,
};
pub use verifier::{CommandVerifier, VerificationService, VerifyError, VerifyParams};
