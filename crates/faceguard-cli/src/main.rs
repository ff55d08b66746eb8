use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[zbus::proxy(
    interface = "org.faceguard.FaceGuard1",
    default_service = "org.faceguard.FaceGuard1",
    default_path = "/org/faceguard/FaceGuard1"
)]
trait FaceGuard {
    fn authenticate(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "faceguard", about = "FaceGuard face authentication CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate the face currently in front of the camera
    Authenticate,
    /// Show daemon status
    Status,
}

/// Exit status for a denied attempt.
const EXIT_DENIED: i32 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = FaceGuardProxy::new(&connection)
        .await
        .context("faceguardd is not reachable")?;

    match cli.command {
        Commands::Authenticate => {
            let reply = proxy.authenticate().await?;
            tracing::debug!(%reply, "authenticate reply");
            let report: Value = serde_json::from_str(&reply).context("malformed daemon reply")?;

            println!("{}", report["message"].as_str().unwrap_or_default());
            if let Some(warnings) = report["warnings"].as_array() {
                for warning in warnings.iter().filter_map(Value::as_str) {
                    eprintln!("warning: {warning}");
                }
            }
            if report["outcome"] != "granted" {
                std::process::exit(EXIT_DENIED);
            }
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            let status: Value = serde_json::from_str(&reply).context("malformed daemon reply")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
