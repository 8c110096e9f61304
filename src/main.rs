//! IAM Fan-out Agent - Standalone Binary
//!
//! Reconciles one cross-project IAM integration per invocation: the
//! desired-state spec comes from a JSON file and the integration record is
//! persisted back to disk for the next run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iam_fanout::provider::gcp::GcpProvider;
use iam_fanout::{IntegrationEngine, IntegrationRecord, IntegrationSpec};

/// IAM Fan-out Agent - cross-project service identity reconciliation
#[derive(Parser, Debug)]
#[command(name = "iam-fanout-agent", version, about)]
struct Args {
    /// Path to the desired-state spec (JSON)
    #[arg(long, env = "IAM_FANOUT_SPEC")]
    spec: PathBuf,

    /// Path to the persisted integration record (JSON)
    #[arg(long, env = "IAM_FANOUT_RECORD")]
    record: PathBuf,

    /// Seconds to wait for a freshly created identity to propagate
    #[arg(long, default_value = "30", env = "IAM_FANOUT_PROPAGATION_WAIT")]
    propagation_wait: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision the integration and write its record
    Create,
    /// Refresh the record from live state; removes it if the identity is gone
    Read,
    /// Reconcile the integration against a changed spec
    Update,
    /// Tear the integration down
    Delete,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .json()
        .init();

    let args = Args::parse();
    let provider = GcpProvider::from_env().await?;
    let engine = IntegrationEngine::new(provider)
        .with_propagation_wait(Duration::from_secs(args.propagation_wait));

    match args.command {
        Command::Create => {
            let spec = load_spec(&args.spec)?;
            let record = engine.create(&spec).await?;
            record.store(&args.record)?;
            info!(email = %record.email, record = %args.record.display(), "record written");
        }
        Command::Read => {
            let record = IntegrationRecord::load(&args.record)?;
            match engine.read(&record).await? {
                Some(refreshed) => {
                    refreshed.store(&args.record)?;
                    info!(
                        email = %refreshed.email,
                        bound_scopes = refreshed.bound_projects.len(),
                        "record refreshed"
                    );
                }
                None => {
                    std::fs::remove_file(&args.record).with_context(|| {
                        format!("failed to remove record file {}", args.record.display())
                    })?;
                    info!(email = %record.email, "identity gone, record removed");
                }
            }
        }
        Command::Update => {
            let spec = load_spec(&args.spec)?;
            let record = IntegrationRecord::load(&args.record)?;
            let updated = engine.update(&record, &spec).await?;
            updated.store(&args.record)?;
            info!(email = %updated.email, "record updated");
        }
        Command::Delete => {
            let record = IntegrationRecord::load(&args.record)?;
            let deleted = engine.delete(&record).await?;
            deleted.store(&args.record)?;
            info!(email = %deleted.email, "integration torn down");
        }
    }

    Ok(())
}

fn load_spec(path: &Path) -> Result<IntegrationSpec> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read spec file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse spec file {}", path.display()))
}
