//! Authentication session: one attempt at a time on a dedicated thread.
//!
//! An attempt snapshots the current frame, writes it to a temporary JPEG,
//! asks the verification service about it, decides, sends exactly one
//! alert, and opens the protected resource on a grant. Verification
//! failures are fail-closed: they deny and still alert.

use crate::alert::AlertDispatcher;
use crate::opener::ResourceOpener;
use chrono::Local;
use faceguard_core::{
    AlertRecord, AttemptOutcome, DecisionEngine, VerificationService, VerifyError, VerifyParams,
};
use faceguard_hw::{FrameError, FrameProvider, SourceError};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const PROBE_JPEG_QUALITY: u8 = 90;

/// Shown for every denial, whatever the reason.
pub const DENIED_MESSAGE: &str = "Face not recognized or not authorized";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("an authentication attempt is already in progress")]
    Busy,
    #[error("no camera frame available: {0}")]
    NoFrame(#[from] SourceError),
    #[error("session thread exited")]
    ChannelClosed,
    #[error("failed to spawn session thread: {0}")]
    Spawn(std::io::Error),
}

/// Why an attempt could not be verified. Always ends in a denial.
#[derive(Error, Debug)]
enum AttemptFailure {
    #[error("probe encoding failed: {0}")]
    Encode(#[from] FrameError),
    #[error("probe file could not be written: {0}")]
    ProbeFile(#[from] std::io::Error),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Idle,
    SnapshotTaken,
    Verifying,
    Deciding,
    Errored,
    Alerting,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub phase: AttemptPhase,
    pub attempts: u64,
    pub last_outcome: Option<&'static str>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            phase: AttemptPhase::Idle,
            attempts: 0,
            last_outcome: None,
        }
    }
}

/// What the caller learns about a completed attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    /// The attempt could not be verified and was denied fail-closed.
    pub errored: bool,
    /// Set when the alert could not be delivered.
    pub alert_error: Option<String>,
    /// Set when the resource could not be opened after a grant.
    pub open_error: Option<String>,
}

impl AttemptReport {
    pub fn message(&self) -> String {
        match &self.outcome {
            AttemptOutcome::Granted(label) => format!("Welcome, {label}!"),
            AttemptOutcome::Denied => DENIED_MESSAGE.to_string(),
        }
    }
}

/// Everything an attempt needs. Owned by the session thread.
pub struct SessionContext {
    pub frames: Arc<dyn FrameProvider>,
    pub verifier: Box<dyn VerificationService>,
    pub decision: DecisionEngine,
    pub alerts: AlertDispatcher,
    pub opener: Box<dyn ResourceOpener>,
    pub gallery: PathBuf,
    pub params: VerifyParams,
    pub resource: Option<PathBuf>,
}

/// Held from the moment a trigger is accepted until its attempt finishes.
struct BusyClaim(Arc<AtomicBool>);

impl BusyClaim {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct AttemptRequest {
    claim: BusyClaim,
    reply: oneshot::Sender<Result<AttemptReport, SessionError>>,
}

/// Clone-safe handle to the session thread.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<AttemptRequest>,
    busy: Arc<AtomicBool>,
    status: Arc<Mutex<SessionStatus>>,
}

impl SessionHandle {
    /// Run one attempt. Rejected with [`SessionError::Busy`] while another is in flight.
    pub async fn authenticate(&self) -> Result<AttemptReport, SessionError> {
        let claim = BusyClaim::acquire(&self.busy).ok_or(SessionError::Busy)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AttemptRequest {
                claim,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.status).clone()
    }
}

/// Spawn the session on a dedicated OS thread.
pub fn spawn_session(ctx: SessionContext) -> Result<SessionHandle, SessionError> {
    let (tx, mut rx) = mpsc::channel::<AttemptRequest>(1);
    let status = Arc::new(Mutex::new(SessionStatus::default()));
    let thread_status = Arc::clone(&status);

    std::thread::Builder::new()
        .name("faceguard-session".into())
        .spawn(move || {
            tracing::info!("session thread started");
            let mut ctx = ctx;
            while let Some(AttemptRequest { claim, reply }) = rx.blocking_recv() {
                let result = run_attempt(&mut ctx, &thread_status);
                drop(claim);
                let _ = reply.send(result);
            }
            tracing::info!("session thread exiting");
        })
        .map_err(SessionError::Spawn)?;

    Ok(SessionHandle {
        tx,
        busy: Arc::new(AtomicBool::new(false)),
        status,
    })
}

struct PhaseTracker<'a> {
    status: &'a Mutex<SessionStatus>,
}

impl PhaseTracker<'_> {
    fn enter(&self, phase: AttemptPhase) {
        lock(self.status).phase = phase;
        tracing::debug!(?phase, "attempt phase");
    }

    fn complete(&self, outcome: &AttemptOutcome) {
        let mut status = lock(self.status);
        status.phase = AttemptPhase::Completed;
        status.attempts += 1;
        status.last_outcome = Some(outcome.kind());
    }
}

fn run_attempt(
    ctx: &mut SessionContext,
    status: &Mutex<SessionStatus>,
) -> Result<AttemptReport, SessionError> {
    let tracker = PhaseTracker { status };
    tracker.enter(AttemptPhase::Idle);

    let frame = ctx.frames.snapshot().map_err(|e| {
        tracing::warn!(error = %e, "attempt rejected: no frame");
        SessionError::NoFrame(e)
    })?;
    tracker.enter(AttemptPhase::SnapshotTaken);
    let timestamp = frame.captured_at.with_timezone(&Local);

    let (image, verified) = match frame.encode_jpeg(PROBE_JPEG_QUALITY) {
        Ok(jpeg) => {
            let verified = verify_probe(ctx, &jpeg, &tracker);
            (jpeg, verified)
        }
        Err(e) => (Vec::new(), Err(AttemptFailure::from(e))),
    };
    drop(frame);

    let (outcome, errored) = match verified {
        Ok(outcome) => (outcome, false),
        Err(e) => {
            tracker.enter(AttemptPhase::Errored);
            tracing::warn!(error = %e, "attempt could not be verified; denying");
            (AttemptOutcome::Denied, true)
        }
    };

    tracker.enter(AttemptPhase::Alerting);
    let record = AlertRecord {
        outcome: outcome.clone(),
        image,
        timestamp,
    };
    let alert_error = ctx.alerts.notify(&record).err().map(|e| {
        tracing::warn!(error = %e, "alert not delivered");
        e.to_string()
    });
    drop(record);

    let open_error = match (&outcome, &ctx.resource) {
        (AttemptOutcome::Granted(_), Some(resource)) => {
            ctx.opener.open(resource).err().map(|e| {
                tracing::warn!(error = %e, resource = %resource.display(), "resource open failed");
                e.to_string()
            })
        }
        _ => None,
    };

    tracker.complete(&outcome);
    tracing::info!(
        outcome = outcome.kind(),
        errored,
        alert_delivered = alert_error.is_none(),
        "attempt completed"
    );

    Ok(AttemptReport {
        outcome,
        errored,
        alert_error,
        open_error,
    })
}

/// Verify one encoded probe. The temporary file is removed before returning.
fn verify_probe(
    ctx: &mut SessionContext,
    jpeg: &[u8],
    tracker: &PhaseTracker<'_>,
) -> Result<AttemptOutcome, AttemptFailure> {
    let probe = write_probe(jpeg)?;
    tracker.enter(AttemptPhase::Verifying);
    let candidates = ctx.verifier.find(probe.path(), &ctx.gallery, &ctx.params)?;
    drop(probe);

    tracker.enter(AttemptPhase::Deciding);
    let outcome = ctx.decision.decide(&candidates);
    let best_distance = DecisionEngine::best_distance(&candidates);
    if best_distance.is_none() && !candidates.is_empty() {
        tracing::warn!(
            candidates = candidates.len(),
            outcome = outcome.kind(),
            "verification result has no distance; missing-distance policy applied"
        );
    }
    tracing::debug!(
        candidates = candidates.len(),
        best_distance,
        threshold = ctx.decision.threshold(),
        outcome = outcome.kind(),
        "decision made"
    );
    Ok(outcome)
}

fn write_probe(jpeg: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("faceguard-probe-")
        .suffix(".jpg")
        .tempfile()?;
    file.write_all(jpeg)?;
    file.flush()?;
    Ok(file)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
