use crate::session::{SessionError, SessionHandle};
use faceguard_hw::FrameSource;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the FaceGuard daemon.
///
/// Bus name: org.faceguard.FaceGuard1
/// Object path: /org/faceguard/FaceGuard1
pub struct FaceGuardService {
    pub session: SessionHandle,
    pub frames: Arc<FrameSource>,
}

#[interface(name = "org.faceguard.FaceGuard1")]
impl FaceGuardService {
    /// Run one authentication attempt against the current camera frame.
    async fn authenticate(&self) -> zbus::fdo::Result<String> {
        tracing::info!("authenticate requested");
        let report = self.session.authenticate().await.map_err(|e| {
            if matches!(e, SessionError::ChannelClosed | SessionError::Spawn(_)) {
                tracing::error!(error = %e, "session unavailable");
            }
            zbus::fdo::Error::Failed(e.to_string())
        })?;

        let warnings: Vec<&str> = [report.alert_error.as_deref(), report.open_error.as_deref()]
            .into_iter()
            .flatten()
            .collect();

        Ok(serde_json::json!({
            "outcome": report.outcome.kind(),
            "message": report.message(),
            "errored": report.errored,
            "warnings": warnings,
        })
        .to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.frames.state().as_str(),
            "session": self.session.status(),
        })
        .to_string())
    }
}
