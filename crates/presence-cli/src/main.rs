use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    fn enroll(&self, name: &str, paths: Vec<String>) -> zbus::Result<String>;
    fn verify(&self, paths: Vec<String>) -> zbus::Result<String>;
    fn detect_blink(&self, path: &str) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    fn attendance(&self, identity_id: &str, since: &str, until: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from face images
    Enroll {
        /// Display name of the person
        #[arg(short, long)]
        name: String,
        /// Enrollment shots (the daemon requires an exact count, 3 by default)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Verify face images against enrolled identities and record attendance
    Verify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Run the eye-aspect-ratio blink check on one image
    Blink { image: PathBuf },
    /// List enrolled identities
    List,
    /// Remove an identity and its attendance history
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show recorded attendance, newest first
    Attendance {
        /// Only events for this identity ID
        #[arg(long)]
        identity: Option<String>,
        /// Earliest timestamp (RFC 3339)
        #[arg(long)]
        since: Option<String>,
        /// Latest timestamp (RFC 3339)
        #[arg(long)]
        until: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("creating presenced proxy")?;

    match cli.command {
        Commands::Enroll { name, images } => {
            let paths = absolute_paths(&images)?;
            tracing::debug!(name, shots = paths.len(), "enrolling");
            print_json(&proxy.enroll(&name, paths).await.context("enroll failed")?)?;
        }
        Commands::Verify { images } => {
            let paths = absolute_paths(&images)?;
            print_json(&proxy.verify(paths).await.context("verify failed")?)?;
        }
        Commands::Blink { image } => {
            let path = absolute_path(&image)?;
            print_json(&proxy.detect_blink(&path).await.context("blink check failed")?)?;
        }
        Commands::List => {
            print_json(&proxy.list_identities().await.context("listing identities failed")?)?;
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(&id).await.context("remove failed")? {
                println!("Removed identity {id}");
            } else {
                println!("No identity with id {id}");
            }
        }
        Commands::Attendance { identity, since, until } => {
            let events = proxy
                .attendance(
                    identity.as_deref().unwrap_or(""),
                    since.as_deref().unwrap_or(""),
                    until.as_deref().unwrap_or(""),
                )
                .await
                .context("attendance query failed")?;
            print_json(&events)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await.context("presenced not reachable")?)?;
        }
    }

    Ok(())
}

/// The daemon resolves paths from its own working directory.
fn absolute_path(path: &Path) -> Result<String> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("cannot access {}", path.display()))?;
    Ok(canonical.to_string_lossy().into_owned())
}

fn absolute_paths(paths: &[PathBuf]) -> Result<Vec<String>> {
    paths.iter().map(|p| absolute_path(p)).collect()
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
