//! # Inkposter CLI
//!
//! Command-line host for one linked frame.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            CLI Host                                     │
//! │                                                                         │
//! │  inkposter.toml ──► InkposterConfig ──► SessionManager ──► cloud API   │
//! │                            │                                            │
//! │  inkposter.db  ──► StateStore ─────► SyncAgent ──► DeviceSession ──► BLE│
//! │                                          │                              │
//! │                      `run`: loops until Ctrl+C                          │
//! │                      others: one command, print JSON, exit              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inkposter_core::{Credentials, DeviceSnapshot, DeviceStatusFrame, SettingsUpdate};
use inkposter_db::{Database, DbConfig};
use inkposter_sync::store::{session_key, snapshot_key};
use inkposter_sync::{
    CloudApi, FrameCommands, FrameContext, FrameLink, InkposterConfig, PresenceEvent,
    SessionManager, StateStore, SyncAgent, SyncEventEmitter, UploadOutcome,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "inkposter")]
#[command(about = "Sync and control an Inkposter e-ink frame")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true, env = "INKPOSTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file to fill in
    Init,
    /// Refresh and print the cloud snapshot
    Status,
    /// Read the device status over the local link
    Poll,
    /// Ask the frame to fetch its images
    Fetch,
    /// Reboot the frame
    Reboot,
    /// Run the ghosting cleanup cycle
    CleanGhosting,
    /// Factory-reset the frame
    FactoryReset {
        /// Required to actually send the command
        #[arg(long)]
        yes: bool,
    },
    /// Push account or network settings over the local link
    ApplySettings {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        api_env_type: Option<String>,
        #[arg(long)]
        ssid: Option<String>,
        #[arg(long)]
        passwd: Option<String>,
    },
    /// Ask the frame to report to the cloud, then refresh
    RefreshStatus,
    /// Ask the cloud to check for a firmware update
    CheckFirmware,
    /// Download an image and upload it for conversion
    UploadUrl { url: String },
    /// Upload base64 image data (a data: URL is accepted)
    UploadData {
        data: String,
        #[arg(long)]
        mime: Option<String>,
    },
    /// Upload an image file
    UploadFile {
        path: PathBuf,
        #[arg(long)]
        mime: Option<String>,
    },
    /// Run the cloud and presence loops until Ctrl+C
    Run,
    /// Forget the stored tokens and cached snapshot
    Logout,
    /// List the frames registered to the account
    Frames,
    /// Show the account profile
    Profile,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        let path = cli
            .config
            .or_else(InkposterConfig::default_config_path)
            .ok_or("no config directory available")?;
        if path.exists() {
            return Err(format!("{} already exists", path.display()).into());
        }
        InkposterConfig::default().save(Some(path.clone()))?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config = InkposterConfig::load(cli.config)?;
    info!(
        frame = %config.frame.uuid,
        link = %config.device_link(),
        "Configuration loaded"
    );

    let host = Host::open(&config).await?;
    let commands = FrameCommands::new(host.agent.clone())?;

    match cli.command {
        Commands::Init => {}
        Commands::Status => {
            let snapshot = match commands.agent().refresh_cloud().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(?e, "Cloud refresh failed, showing cached snapshot");
                    commands.agent().snapshot().await
                }
            };
            print_snapshot(&snapshot)?;
        }
        Commands::Poll => print_status(&commands.agent().poll_local().await?)?,
        Commands::Fetch => print_status(&commands.trigger_fetch().await?)?,
        Commands::Reboot => print_status(&commands.reboot().await?)?,
        Commands::CleanGhosting => print_status(&commands.clean_ghosting().await?)?,
        Commands::FactoryReset { yes } => {
            if !yes {
                return Err("factory reset erases the frame; pass --yes to confirm".into());
            }
            print_status(&commands.factory_reset().await?)?;
        }
        Commands::ApplySettings {
            user,
            token,
            api_env_type,
            ssid,
            passwd,
        } => {
            let settings = SettingsUpdate {
                user,
                token,
                api_env_type,
                ssid,
                passwd,
            };
            print_status(&commands.apply_settings(settings).await?)?;
        }
        Commands::RefreshStatus => print_snapshot(&*commands.refresh_status().await?)?,
        Commands::CheckFirmware => {
            let response = commands.check_firmware_update().await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::UploadUrl { url } => {
            print_upload(&commands.upload_image_by_url(&url).await?)?;
        }
        Commands::UploadData { data, mime } => {
            let outcome = commands
                .upload_image_by_inline_data(&data, mime.as_deref())
                .await?;
            print_upload(&outcome)?;
        }
        Commands::UploadFile { path, mime } => {
            let bytes = std::fs::read(&path)?;
            let outcome = commands
                .upload_image_bytes(bytes, mime.as_deref())
                .await?;
            print_upload(&outcome)?;
        }
        Commands::Run => host.run().await?,
        Commands::Frames => {
            for frame in host.cloud.user_frames().await? {
                println!("{}", serde_json::to_string(&frame)?);
            }
        }
        Commands::Profile => {
            let profile = host.cloud.user_profile().await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::Logout => {
            host.forget(&config).await?;
            println!("Cleared stored session for {}", config.link_id());
        }
    }

    Ok(())
}

// =============================================================================
// Host Wiring
// =============================================================================

struct Host {
    agent: SyncAgent,
    cloud: Arc<SessionManager>,
    store: Arc<dyn StateStore>,
    #[cfg(feature = "ble")]
    transport: Option<inkposter_sync::BtleplugTransport>,
}

impl Host {
    async fn open(config: &InkposterConfig) -> CliResult<Self> {
        let db_path = config
            .database_path()
            .ok_or("no data directory available for the state database")?;
        let database = Database::new(DbConfig::new(db_path)).await?;
        let store: Arc<dyn StateStore> = Arc::new(database);

        let credentials = Credentials::new(
            config.account.email.clone(),
            config.account.password.clone(),
        );
        let cloud = Arc::new(SessionManager::new(
            config.cloud.clone(),
            credentials,
            config.link_id(),
            Arc::clone(&store),
        )?);

        let context = FrameContext::from_config(config)?;

        #[cfg(feature = "ble")]
        let (link, transport) = match config.device_link().local_address() {
            Some(address) => {
                let transport = inkposter_sync::BtleplugTransport::first_adapter(address).await?;
                let device = inkposter_sync::DeviceSession::new(
                    Arc::new(transport.clone()),
                    inkposter_sync::LinkTimings::from(&config.local),
                );
                (FrameLink::CloudPlusLocal(device), Some(transport))
            }
            None => (FrameLink::CloudOnly, None),
        };

        #[cfg(not(feature = "ble"))]
        let link = {
            if let Some(address) = config.device_link().local_address() {
                warn!(
                    address = %address,
                    "Built without the `ble` feature, local link disabled"
                );
            }
            FrameLink::CloudOnly
        };

        let agent = SyncAgent::new(context, cloud.clone(), Arc::clone(&store), link)
            .with_emitter(Arc::new(LogEmitter));

        if agent.restore_cached_snapshot().await? {
            info!("Restored cached snapshot");
        }

        Ok(Host {
            agent,
            cloud,
            store,
            #[cfg(feature = "ble")]
            transport,
        })
    }

    async fn forget(&self, config: &InkposterConfig) -> CliResult<()> {
        let link_id = config.link_id();
        self.store.delete_record(&session_key(link_id)).await?;
        self.store.delete_record(&snapshot_key(link_id)).await?;
        Ok(())
    }

    /// Runs both loops until Ctrl+C or SIGTERM.
    async fn run(self) -> CliResult<()> {
        let (presence_tx, presence_rx) = mpsc::channel::<PresenceEvent>(32);

        #[cfg(feature = "ble")]
        let scan = match &self.transport {
            Some(transport) => Some(transport.start_presence(presence_tx).await?),
            None => None,
        };
        #[cfg(not(feature = "ble"))]
        drop(presence_tx);

        let handle = self.agent.start(presence_rx).await;
        shutdown_signal().await;

        #[cfg(feature = "ble")]
        if let Some(scan) = scan {
            scan.abort();
        }

        let status = handle.status().await;
        handle.shutdown().await;
        info!(
            cloud_failures = status.cloud_failures,
            local_failures = status.local_failures,
            "Shutdown complete"
        );
        Ok(())
    }
}

/// Logs agent events.
struct LogEmitter;

impl SyncEventEmitter for LogEmitter {
    fn emit_snapshot(&self, snapshot: &DeviceSnapshot) {
        info!(
            battery = ?snapshot.battery_capacity(),
            updated_at = ?snapshot.updated_at,
            "Snapshot updated"
        );
    }

    fn emit_local_status(&self, status: &DeviceStatusFrame) {
        info!(
            model = %status.model,
            capacity = status.capacity,
            flags = ?status.flags(),
            "Local status"
        );
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        warn!(retryable, "Sync error: {}", message);
    }
}

// =============================================================================
// Output
// =============================================================================

fn print_snapshot(snapshot: &DeviceSnapshot) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

fn print_status(status: &DeviceStatusFrame) -> CliResult<()> {
    let out = json!({
        "status": status,
        "flags": status.flags(),
        "firmware": status.firmware_version(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_upload(outcome: &UploadOutcome) -> CliResult<()> {
    let out = json!({
        "conversion": outcome.conversion,
        "fetched": outcome.fetch_status.is_some(),
        "refreshed": outcome.snapshot.is_some(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

// =============================================================================
// Process Setup
// =============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,inkposter=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping sync loops");
}
