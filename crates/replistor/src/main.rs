use clap::{Args, Parser, Subcommand};
use replistor_core::{DriverConfig, SnapshotRecord, SnapshotReference, VolumeRecord};
use replistor_driver::{HttpConnector, VolumeDriver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "replistor", about = "Replistor block-storage volume driver")]
struct Cli {
    /// Path to the driver configuration (YAML)
    #[arg(long, env = "REPLISTOR_CONFIG")]
    config: Option<PathBuf>,
    /// Backend endpoint, overriding the configuration
    #[arg(long, env = "REPLISTOR_ENDPOINT")]
    endpoint: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct VolumeArgs {
    /// Volume id
    #[arg(long)]
    id: String,
    /// Volume size in GiB
    #[arg(long, default_value_t = 1)]
    size: u64,
}

impl VolumeArgs {
    fn record(&self) -> VolumeRecord {
        VolumeRecord::new(&self.id, self.size)
    }
}

#[derive(Args)]
struct SnapshotArgs {
    /// Snapshot id
    #[arg(long)]
    id: String,
    /// Id of the volume the snapshot belongs to
    #[arg(long)]
    volume_id: String,
}

impl SnapshotArgs {
    fn record(&self) -> SnapshotRecord {
        SnapshotRecord::new(&self.id, &self.volume_id)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create and deploy a volume
    CreateVolume {
        #[command(flatten)]
        volume: VolumeArgs,
        /// Owning project
        #[arg(long)]
        project: Option<String>,
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete a volume
    DeleteVolume {
        #[command(flatten)]
        volume: VolumeArgs,
    },
    /// Resize a volume
    ExtendVolume {
        #[command(flatten)]
        volume: VolumeArgs,
        /// New size in GiB
        #[arg(long)]
        new_size: u64,
    },
    /// Print the local device path of a volume
    LocalPath {
        #[command(flatten)]
        volume: VolumeArgs,
    },
    /// Snapshot a volume
    CreateSnapshot {
        #[command(flatten)]
        snapshot: SnapshotArgs,
    },
    /// Delete a snapshot
    DeleteSnapshot {
        #[command(flatten)]
        snapshot: SnapshotArgs,
    },
    /// Clone a volume through a transient snapshot
    CloneVolume {
        #[command(flatten)]
        volume: VolumeArgs,
        /// Source volume id
        #[arg(long)]
        source_id: String,
        /// Source volume size in GiB
        #[arg(long, default_value_t = 1)]
        source_size: u64,
    },
    /// Create a volume from a snapshot
    VolumeFromSnapshot {
        #[command(flatten)]
        volume: VolumeArgs,
        /// Snapshot id
        #[arg(long)]
        snapshot_id: String,
        /// Id of the volume the snapshot was taken from
        #[arg(long)]
        snapshot_volume_id: String,
    },
    /// Take over an existing backend snapshot
    ManageSnapshot {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        /// Backend resource holding the snapshot
        #[arg(long)]
        resource: String,
        /// Backend snapshot name
        #[arg(long)]
        backend_snapshot: String,
    },
    /// Print backend capacity as JSON
    Stats,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.endpoint)?;
    let driver = build_driver(config);
    driver.setup().await?;

    match cli.command {
        Commands::CreateVolume {
            volume,
            project,
            name,
        } => {
            let mut record = volume.record();
            if let Some(project) = project {
                record = record.with_project(project);
            }
            if let Some(name) = name {
                record = record.with_display_name(name);
            }
            let resource = driver.create_volume(&record).await?;
            println!("{}", resource);
        }
        Commands::DeleteVolume { volume } => {
            driver.delete_volume(&volume.record()).await?;
        }
        Commands::ExtendVolume { volume, new_size } => {
            driver.extend_volume(&volume.record(), new_size).await?;
        }
        Commands::LocalPath { volume } => {
            println!("{}", driver.local_path(&volume.record()).await?);
        }
        Commands::CreateSnapshot { snapshot } => {
            println!("{}", driver.create_snapshot(&snapshot.record()).await?);
        }
        Commands::DeleteSnapshot { snapshot } => {
            driver.delete_snapshot(&snapshot.record()).await?;
        }
        Commands::CloneVolume {
            volume,
            source_id,
            source_size,
        } => {
            let source = VolumeRecord::new(source_id, source_size);
            let resource = driver
                .create_cloned_volume(&volume.record(), &source)
                .await?;
            println!("{}", resource);
        }
        Commands::VolumeFromSnapshot {
            volume,
            snapshot_id,
            snapshot_volume_id,
        } => {
            let snapshot = SnapshotRecord::new(snapshot_id, snapshot_volume_id);
            let resource = driver
                .create_volume_from_snapshot(&volume.record(), &snapshot)
                .await?;
            println!("{}", resource);
        }
        Commands::ManageSnapshot {
            snapshot,
            resource,
            backend_snapshot,
        } => {
            let reference = SnapshotReference {
                resource,
                snapshot: backend_snapshot,
            };
            let name = driver
                .manage_existing_snapshot(&snapshot.record(), &reference)
                .await?;
            println!("{}", name);
        }
        Commands::Stats => {
            let stats = driver.volume_stats().await?;
            let json = serde_json::to_string_pretty(&stats)
                .map_err(|e| miette::miette!("Failed to encode stats: {}", e))?;
            println!("{}", json);
        }
    }

    Ok(())
}

/// Load the configuration file if given, then apply command-line overrides
fn load_config(
    path: Option<&std::path::Path>,
    endpoint: Option<String>,
) -> miette::Result<DriverConfig> {
    let mut config = match path {
        Some(path) => DriverConfig::from_yaml_file(path)?,
        None => DriverConfig::default(),
    };
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    info!("Using backend endpoint {}", config.endpoint);
    Ok(config)
}

fn build_driver(config: DriverConfig) -> VolumeDriver {
    let connector = HttpConnector::new(&config.endpoint, config.reconnect.connect_timeout());
    VolumeDriver::new(config, Arc::new(connector))
}
