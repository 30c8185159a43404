//! Flotilla Provisioner
//!
//! Elastic spot-fleet provisioning for task backlogs.
//!
//! ## Usage
//!
//! ```bash
//! # Start the reconciliation loop
//! flotilla-provisioner run --config provisioner.json --worker-types worker-types.json
//!
//! # Run a single iteration (operator smoke test)
//! flotilla-provisioner once --config provisioner.json --worker-types worker-types.json
//!
//! # Remove every resource not in the configured worker-type set
//! flotilla-provisioner sweep-rogues --config provisioner.json --worker-types worker-types.json
//! ```

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flotilla_core::{CoreError, TaskQueue, WorkerType, WorkerTypeStore};
use flotilla_provisioner::{Ec2Adapter, LogEventSink, ProvisionerConfig, Reconciler};

#[derive(Parser)]
#[command(name = "flotilla-provisioner")]
#[command(about = "Flotilla - elastic spot-fleet provisioning for task backlogs", long_about = None)]
struct Cli {
    /// Provisioner configuration file (JSON)
    #[arg(long, default_value = "provisioner.json")]
    config: PathBuf,

    /// Worker-type definitions file (JSON)
    #[arg(long, default_value = "worker-types.json")]
    worker_types: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the reconciliation loop
    Run,

    /// Run a single reconciliation iteration and exit
    Once,

    /// Remove every resource belonging to unconfigured worker types
    SweepRogues {
        /// Treat the configured set as empty and remove everything
        #[arg(long)]
        stop_all: bool,
    },

    /// Ensure key pairs exist for every configured worker type
    EnsureKeys,
}

/// Worker-type definitions plus a static backlog, read from one JSON file.
///
/// Deployments point the provisioner at the definition service instead;
/// the file form exists for operators and smoke tests.
#[derive(Debug, Deserialize)]
struct DefinitionFile {
    worker_types: Vec<WorkerType>,

    #[serde(default)]
    pending_tasks: HashMap<String, u64>,
}

struct FileStore {
    file: DefinitionFile,
}

impl FileStore {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading worker types from {}", path.display()))?;
        let file = serde_json::from_str(&raw)
            .with_context(|| format!("parsing worker types from {}", path.display()))?;
        Ok(Self { file })
    }
}

#[async_trait]
impl WorkerTypeStore for FileStore {
    async fn list_worker_types(&self) -> flotilla_core::Result<Vec<String>> {
        Ok(self
            .file
            .worker_types
            .iter()
            .map(|w| w.name.clone())
            .collect())
    }

    async fn load_worker_type(&self, name: &str) -> flotilla_core::Result<WorkerType> {
        self.file
            .worker_types
            .iter()
            .find(|w| w.name == name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownWorkerType(name.to_string()))
    }
}

#[async_trait]
impl TaskQueue for FileStore {
    async fn pending_tasks(&self, worker_type: &str) -> flotilla_core::Result<u64> {
        Ok(self
            .file
            .pending_tasks
            .get(worker_type)
            .copied()
            .unwrap_or(0))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flotilla_provisioner=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = ProvisionerConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let store = Arc::new(FileStore::load(&cli.worker_types)?);

    let adapter = Arc::new(Ec2Adapter::new(&config.allowed_regions, config.api_timeout()).await);
    let reconciler = Arc::new(Reconciler::new(
        config,
        adapter,
        store.clone(),
        store,
        None,
        Arc::new(LogEventSink),
    ));

    match cli.command {
        Commands::Run => {
            let runner = {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.run().await })
            };

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            reconciler.stop();
            runner.await??;
        }
        Commands::Once => {
            reconciler.run_iteration().await?;
        }
        Commands::SweepRogues { stop_all } => {
            reconciler.sweep_rogues(stop_all).await?;
        }
        Commands::EnsureKeys => {
            reconciler.ensure_keys().await?;
        }
    }

    Ok(())
}
