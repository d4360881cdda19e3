use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use vdcconf::VdcConfig;
use vdcd::{Server, Store, VdcHost};

/// The vDC host daemon.
///
/// Accepts one controller session over the vDC API and exposes virtual
/// devices to it. Configuration is loaded from (in order, later wins):
/// compiled defaults, /etc/vdcd/config.toml, ~/.config/vdcd/config.toml,
/// ./vdcd.toml (or --config), environment variables (VDCD_*).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./vdcd.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = VdcConfig::load_with_sources_from(cli.config.as_deref())
        .context("failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {var}");
            }
        }
        println!();
        println!("{}", config.to_toml().context("failed to serialize configuration")?);
        return Ok(());
    }

    vdcd::telemetry::init(&config.telemetry.log_level);

    info!("configuration loaded from:");
    for path in &sources.files {
        info!("  - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("  environment overrides: {:?}", sources.env_overrides);
    }

    // Persistence first: a double load failure (primary and backup) is fatal.
    let store =
        Store::open(&config.paths.state_file).context("failed to load persistence store")?;
    info!(path = %config.paths.state_file.display(), "persistence ready");

    let mut host = VdcHost::new(&config, store);
    host.load_persisted();
    let host_dsuid = host.dsuid();
    let host = Arc::new(Mutex::new(host));

    let listener = TcpListener::bind(("0.0.0.0", config.bind.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.bind.port))?;
    info!(port = config.bind.port, "listening for vdSM");

    let announcer = if config.bind.announce {
        match vdcd::discovery::Announcer::announce(&config.host.name, &host_dsuid, config.bind.port)
        {
            Ok(announcer) => Some(announcer),
            Err(e) => {
                tracing::warn!(error = %e, "mDNS announcement failed, continuing without");
                None
            }
        }
    } else {
        None
    };

    let server = Server::new(host.clone(), listener);
    let shutdown = server.shutdown_token();

    let mut server_task = tokio::spawn(server.run());
    tokio::select! {
        _ = &mut server_task => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.cancel();
            let _ = server_task.await;
        }
    }

    if let Some(announcer) = announcer {
        announcer.shutdown();
    }

    // Flush state on the way out.
    let host = host.lock().await;
    host.session_disconnected();
    host.persist_all();
    host.store().flush().context("final persistence flush failed")?;
    info!("vdcd stopped");
    Ok(())
}
