//! Opening the protected resource after a grant.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("resource not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit {
        program: &'static str,
        status: std::process::ExitStatus,
    },
}

pub trait ResourceOpener: Send {
    fn open(&self, path: &Path) -> Result<(), OpenError>;
}

/// Hands the path to the desktop's default handler.
pub struct DesktopOpener;

impl DesktopOpener {
    fn program() -> &'static str {
        if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        }
    }
}

impl ResourceOpener for DesktopOpener {
    fn open(&self, path: &Path) -> Result<(), OpenError> {
        if !path.exists() {
            return Err(OpenError::NotFound(path.to_path_buf()));
        }
        let program = Self::program();
        let status = Command::new(program)
            .arg(path)
            .status()
            .map_err(|source| OpenError::Launch { program, source })?;
        if !status.success() {
            return Err(OpenError::Exit { program, status });
        }
        tracing::info!(path = %path.display(), program, "resource opened");
        Ok(())
    }
}
