/// for CLI: runs a Director, a Primary or a Secondary in this process
///

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use update_engine::config::{EcuConfig, EcuRole};
use update_engine::crypto::EcuKey;
use update_engine::crypto::keys::{PublicKey, public_key_path};
use update_engine::director::Director;
use update_engine::jail::confine;
use update_engine::logging::init_logging;
use update_engine::orchestrator::{FirmwareOutcome, PrimaryEcu, SecondaryEcu};
use update_engine::registry::RegistrationPolicy;
use update_engine::repository::{MemoryRepository, Updater};
use update_engine::timeserver::LocalTimeServer;
use update_engine::types::{EcuSerial, FileInfo, TargetInfo, Vin};
use update_engine::UpdateError;
use update_server::{DirectorService, PrimaryService, RpcListener, SecondaryService, TcpTransport};

#[derive(Parser)]
#[command(name = "ecu", version = "0.1", about = "Uptane-style update client and Director")]
struct Cli {
    #[arg(long, default_value = "logs", help = "Directory for the rolling log file")]
    log_dir: String,
    #[arg(long, help = "Write the log file as JSON lines")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve ECU registration and vehicle manifests
    Director {
        #[arg(long, help = "Listen address (default from UPTANE_DIRECTOR_ADDR or 127.0.0.1:30501)")]
        listen: Option<SocketAddr>,
        #[arg(long, help = "first-wins | overwrite")]
        policy: Option<RegistrationPolicy>,
    },
    /// Run the vehicle's gateway ECU
    Primary {
        #[command(flatten)]
        ecu: EcuArgs,
        #[arg(long, help = "Listen address for Secondaries")]
        listen: Option<SocketAddr>,
    },
    /// Run a Secondary ECU attached to a Primary
    Secondary {
        #[command(flatten)]
        ecu: EcuArgs,
        #[arg(long, help = "Listen address for relays from the Primary")]
        listen: Option<SocketAddr>,
        #[arg(long, help = "Address of the Primary")]
        primary: Option<SocketAddr>,
    },
}

#[derive(Args)]
struct EcuArgs {
    #[arg(long)]
    vin: Option<String>,
    #[arg(long)]
    serial: Option<String>,
    #[arg(long, help = "Client directory holding targets/ and keys/")]
    client_dir: Option<PathBuf>,
    #[arg(long, help = "Address of the Director")]
    director: Option<SocketAddr>,
    #[arg(long, help = "Director repository snapshot (JSON)")]
    director_repo: Option<PathBuf>,
    #[arg(long, help = "Image repository snapshot (JSON)")]
    image_repo: Option<PathBuf>,
    #[arg(long, default_value = "keys/timeserver", help = "Time server key, shared by the Primary and its Secondaries")]
    timeserver_key: PathBuf,
    #[arg(long, help = "Generate a fresh ECU key instead of reusing the stored one")]
    new_key: bool,
    #[arg(long, help = "Seconds between update rounds; run once if omitted")]
    interval: Option<u64>,
}

impl EcuArgs {
    fn apply(&self, config: &mut EcuConfig) {
        if let Some(vin) = &self.vin {
            config.vin = Vin(vin.clone());
        }
        if let Some(serial) = &self.serial {
            config.ecu_serial = EcuSerial(serial.clone());
        }
        if let Some(dir) = &self.client_dir {
            config.client_dir = dir.clone();
        }
        if let Some(addr) = self.director {
            config.director_addr = addr;
        }
    }

    fn repositories(&self) -> Result<(Arc<dyn Updater>, Arc<dyn Updater>)> {
        Ok((
            load_repository("director", self.director_repo.as_deref())?,
            load_repository("imagerepo", self.image_repo.as_deref())?,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments using clap (see `Cli` and `Commands` structs)
    let cli = Cli::parse();

    // Log to stdout and a daily file under --log-dir; RUST_LOG filters.
    let _guard = init_logging(&cli.log_dir, cli.json);

    match cli.command {
        Commands::Director { listen, policy } => run_director(listen, policy).await,
        Commands::Primary { ecu, listen } => run_primary(ecu, listen).await,
        Commands::Secondary { ecu, listen, primary } => run_secondary(ecu, listen, primary).await,
    }
}

async fn run_director(listen: Option<SocketAddr>, policy: Option<RegistrationPolicy>) -> Result<()> {
    let mut config = EcuConfig::from_env(EcuRole::Director)?;
    if let Some(policy) = policy {
        config.registration_policy = policy;
    }
    if config.registration_policy == RegistrationPolicy::Overwrite {
        warn!("registration policy is overwrite: any caller can replace a registered ECU key");
    }

    let director = Arc::new(Director::new(config.registration_policy));
    let listener = RpcListener::new(
        listen.unwrap_or(config.director_addr),
        Arc::new(DirectorService::new(director)),
    );
    listener.start().await?;

    tokio::signal::ctrl_c().await?;
    listener.stop().await;
    Ok(())
}

async fn run_primary(args: EcuArgs, listen: Option<SocketAddr>) -> Result<()> {
    let mut config = EcuConfig::from_env(EcuRole::Primary)?;
    args.apply(&mut config);
    if let Some(addr) = listen {
        config.primary_addr = addr;
    }

    let key = EcuKey::load_or_generate(&config.keys_dir().join("primary"), args.new_key)?;
    let timeserver = LocalTimeServer::new(
        EcuKey::load_or_generate(&args.timeserver_key, false).context("loading the time server key")?,
    );
    let (director_repo, image_repo) = args.repositories()?;
    let to_director = TcpTransport::new(config.director_addr, config.rpc_timeout);

    let primary = Arc::new(PrimaryEcu::new(
        config.clone(),
        key,
        director_repo,
        image_repo,
        Arc::new(timeserver),
    ));
    let listener = RpcListener::new(config.primary_addr, Arc::new(PrimaryService::new(primary.clone())));
    listener.start().await?;

    primary
        .register_with_director(&to_director)
        .await
        .context("registering with the Director")?;

    let (primary_ref, director_ref) = (&primary, &to_director);
    run_rounds(args.interval, || async move {
        let report = primary_ref.update_cycle().await?;
        if let FirmwareOutcome::Rejected { filepath, .. } = &report.firmware {
            error!(%filepath, "firmware rejected, not installed");
        }
        primary_ref.generate_signed_vehicle_manifest().await?;
        primary_ref.submit_vehicle_manifest(director_ref).await?;
        Ok::<(), UpdateError>(())
    })
    .await?;

    listener.stop().await;
    Ok(())
}

async fn run_secondary(args: EcuArgs, listen: Option<SocketAddr>, primary: Option<SocketAddr>) -> Result<()> {
    let mut config = EcuConfig::from_env(EcuRole::Secondary)?;
    args.apply(&mut config);
    if let Some(addr) = listen {
        config.secondary_addr = addr;
    }
    if let Some(addr) = primary {
        config.primary_addr = addr;
    }

    let key = EcuKey::load_or_generate(&config.keys_dir().join("secondary"), args.new_key)?;
    let timeserver_key = PublicKey::load(&public_key_path(&args.timeserver_key))
        .context("reading the time server public key (start the Primary first)")?;
    let (director_repo, image_repo) = args.repositories()?;
    let factory_firmware = install_factory_firmware(&config)?;

    let secondary = Arc::new(SecondaryEcu::new(
        config.clone(),
        key,
        timeserver_key,
        director_repo,
        image_repo,
        factory_firmware,
    ));
    let listener = RpcListener::new(config.secondary_addr, Arc::new(SecondaryService::new(secondary.clone())));
    listener.start().await?;

    let to_primary = TcpTransport::new(config.primary_addr, config.rpc_timeout);
    let to_director = TcpTransport::new(config.director_addr, config.rpc_timeout);
    secondary
        .clean_slate(&to_primary, &to_director)
        .await
        .context("registering with the Primary and the Director")?;

    let (secondary_ref, primary_ref) = (&secondary, &to_primary);
    run_rounds(args.interval, || async move {
        secondary_ref.update_cycle().await?;
        secondary_ref.update_time(primary_ref).await?;
        secondary_ref.generate_and_submit(primary_ref).await?;
        Ok::<(), UpdateError>(())
    })
    .await?;

    listener.stop().await;
    Ok(())
}

/// Runs `round` once, or every `interval` seconds until ctrl-c. A failed
/// round is logged and the next one still runs.
async fn run_rounds<F, Fut>(interval: Option<u64>, round: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), UpdateError>>,
{
    let Some(secs) = interval else {
        if let Err(e) = round().await {
            error!(error = %e, "update round failed");
        }
        info!("round complete; serving until ctrl-c");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = round().await {
                    error!(error = %e, "update round failed");
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn load_repository(name: &str, snapshot: Option<&Path>) -> Result<Arc<dyn Updater>> {
    match snapshot {
        Some(path) => {
            let repository = MemoryRepository::from_snapshot_file(path)
                .with_context(|| format!("loading {name} snapshot {}", path.display()))?;
            Ok(Arc::new(repository))
        }
        None => Ok(Arc::new(MemoryRepository::new(name))),
    }
}

/// The image the Secondary reports before any update: whatever is at its
/// firmware path, or a factory image written there on first run.
fn install_factory_firmware(config: &EcuConfig) -> Result<TargetInfo> {
    let path = confine(&config.firmware_filename, &config.targets_dir())?;
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("Factory firmware for ECU {}\n", config.ecu_serial))?;
    }
    let content = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(TargetInfo::new(
        format!("/{}", config.firmware_filename.trim_start_matches('/')),
        FileInfo::from_bytes(&content),
    ))
}
