use anyhow::{Context, Result};
use clap::Parser;
use faceguard_core::{
    CommandVerifier, DecisionEngine, FaceDetector, FaceEmbedder, GalleryVerifier,
    VerificationService,
};
use faceguard_hw::{Camera, FrameSource};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod alert;
mod config;
mod dbus_interface;
mod opener;
mod session;

use alert::{AlertDispatcher, SmtpNotifier};
use config::{Config, VerifierBackend};
use dbus_interface::FaceGuardService;
use opener::DesktopOpener;
use session::SessionContext;

const BUS_NAME: &str = "org.faceguard.FaceGuard1";
const OBJECT_PATH: &str = "/org/faceguard/FaceGuard1";

#[derive(Parser)]
#[command(name = "faceguardd", about = "FaceGuard face authentication daemon")]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/faceguard/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn build_verifier(backend: &VerifierBackend) -> Result<Box<dyn VerificationService>> {
    match backend {
        VerifierBackend::Onnx {
            model_path,
            detector_path,
        } => {
            let embedder = FaceEmbedder::load(model_path)
                .with_context(|| format!("loading ArcFace model {}", model_path.display()))?;
            let mut verifier = GalleryVerifier::new(embedder);
            if let Some(detector_path) = detector_path {
                let detector = FaceDetector::load(detector_path)
                    .with_context(|| format!("loading SCRFD model {}", detector_path.display()))?;
                verifier = verifier.with_locator(detector);
            }
            tracing::info!(
                model = %model_path.display(),
                detection = detector_path.is_some(),
                "in-process verifier ready"
            );
            Ok(Box::new(verifier))
        }
        VerifierBackend::Command { program, args } => {
            tracing::info!(program = %program, "external verifier configured");
            Ok(Box::new(CommandVerifier::new(program.clone(), args.clone())))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!("faceguardd starting");

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    let camera = Camera::open(config.camera_index)
        .with_context(|| format!("opening camera {}", config.camera_index))?;
    let frames = Arc::new(FrameSource::new(camera, config.source));
    frames.start().context("starting frame source")?;

    let verifier = build_verifier(&config.verifier)?;
    let notifier = SmtpNotifier::new(&config.smtp).context("configuring SMTP notifier")?;
    let alerts = AlertDispatcher::new(config.recipients.clone(), Box::new(notifier));

    let session = session::spawn_session(SessionContext {
        frames: frames.clone(),
        verifier,
        decision: DecisionEngine::new(config.distance_threshold, config.missing_distance),
        alerts,
        opener: Box::new(DesktopOpener),
        gallery: config.gallery_path.clone(),
        params: config.verify_params.clone(),
        resource: config.resource_path.clone(),
    })?;

    let service = FaceGuardService {
        session,
        frames: Arc::clone(&frames),
    };
    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(
        bus = BUS_NAME,
        gallery = %config.gallery_path.display(),
        threshold = config.distance_threshold,
        "faceguardd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceguardd shutting down");
    frames.stop();

    Ok(())
}
