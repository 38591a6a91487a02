//! RADDI node daemon
//!
//! Opens the database for writing, starts the coordinator with its
//! listeners, local discovery and source-directory intake, then drives
//! the 1 Hz scheduling loop until interrupted.

use clap::Parser;
use raddi::net::bootstrap;
use raddi::{
    Access, Address, CipherMode, Coordinator, CoordinatorSettings, Db, DbSettings, Level, Source,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "raddi-node", version, about = "RADDI network node")]
struct Args {
    /// Database directory
    #[arg(short, long, default_value = "./db")]
    database: PathBuf,

    /// TCP listening port
    #[arg(short, long, default_value = "44303")]
    port: u16,

    /// Local peer discovery UDP port, 0 disables
    #[arg(long, default_value = "44302")]
    discovery_port: u16,

    /// Source directory watched for client entries and commands
    #[arg(short, long, default_value = "./source")]
    source: PathBuf,

    /// Bootstrap peers, comma-separated IP[:port]
    #[arg(long)]
    seeds: Option<String>,

    /// DNS bootstrap URIs (dns:name[:port][?type=A|AAAA])
    #[arg(long)]
    dns_seeds: Option<String>,

    /// SOCKS5 proxy for outbound connections (i.e. Tor)
    #[arg(long)]
    proxy: Option<Address>,

    /// Cipher policy: disabled, automatic, forced, force-gcm, force-aegis
    #[arg(long, default_value = "automatic")]
    aes: String,

    /// Average number of connections to maintain
    #[arg(long, default_value = "8")]
    connections: usize,

    /// Store every valid entry regardless of subscriptions (core node)
    #[arg(long)]
    store_everything: bool,

    /// Do not forward entries between peers (leaf node)
    #[arg(long)]
    leaf: bool,

    /// Answer full database download requests (core nodes only)
    #[arg(long)]
    allow_full_downloads: bool,
}

fn cipher_mode(name: &str) -> Option<CipherMode> {
    Some(match name {
        "disabled" => CipherMode::Disabled,
        "automatic" => CipherMode::Automatic,
        "forced" => CipherMode::Forced,
        "force-gcm" => CipherMode::ForceGcm,
        "force-aegis" => CipherMode::ForceAegis,
        _ => return None,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let (filter, reload_handle) =
        tracing_subscriber::reload::Layer::new(EnvFilter::from_default_env().add_directive(
            "raddi=info".parse().expect("static directive is well formed"),
        ));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("RADDI node v{VERSION}");

    let Some(mode) = cipher_mode(&args.aes) else {
        error!(mode = args.aes, "unknown cipher mode");
        return ExitCode::FAILURE;
    };

    let db_settings = DbSettings {
        store_everything: args.store_everything,
        ..DbSettings::default()
    };
    let database = match Db::open(Access::ReadWrite, &args.database, db_settings) {
        Ok(database) => Arc::new(database),
        Err(e) => {
            error!(error = %e, path = %args.database.display(), "cannot open database");
            return ExitCode::FAILURE;
        }
    };

    let settings = CoordinatorSettings {
        cipher_mode: mode,
        proxy: args.proxy,
        connections: args.connections,
        network_propagation_participation: !args.leaf,
        full_database_downloads_allowed: args.allow_full_downloads,
        ..CoordinatorSettings::default()
    };
    let coordinator = Coordinator::new(database, settings);

    if let Err(e) = coordinator.listen(args.port).await {
        error!(error = %e, port = args.port, "cannot listen");
        return ExitCode::FAILURE;
    }
    if args.discovery_port != 0
        && let Err(e) = coordinator.discover(args.discovery_port).await
    {
        warn!(error = %e, port = args.discovery_port, "local discovery unavailable");
    }

    // bootstrap peers
    if let Some(seeds) = &args.seeds {
        for address in bootstrap::parse_seed_list(&seeds.replace(',', "\n")) {
            coordinator.add(Level::Announced, address);
        }
    }
    if let Some(uris) = &args.dns_seeds {
        for uri in uris.split(',') {
            match uri.trim().parse::<bootstrap::DnsSeed>() {
                Ok(seed) => match seed.resolve().await {
                    Ok(addresses) => {
                        for address in addresses {
                            coordinator.add(Level::Announced, address);
                        }
                    }
                    Err(e) => warn!(seed = uri, error = %e, "dns seed resolution failed"),
                },
                Err(e) => warn!(seed = uri, error = %e, "bad dns seed"),
            }
        }
    }

    // source directory intake
    match Source::new(&args.source) {
        Ok(source) => {
            let handle = reload_handle.clone();
            let source = source.on_set_log_level(move |level| {
                let directive = match level {
                    0 => "raddi=error",
                    1 => "raddi=warn",
                    2 => "raddi=info",
                    3 => "raddi=debug",
                    _ => "raddi=trace",
                };
                if let Ok(filter) = directive.parse::<EnvFilter>() {
                    let _ = handle.reload(filter);
                    info!(directive, "log level changed");
                }
            });
            let coordinator = coordinator.clone();
            tokio::spawn(async move { source.run(coordinator).await });
        }
        Err(e) => {
            error!(error = %e, path = %args.source.display(), "cannot open source directory");
            return ExitCode::FAILURE;
        }
    }

    info!(port = args.port, "node running");

    // 1 Hz scheduling loop until ctrl-c
    let scheduler = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                coordinator.tick().await;
            }
        })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    scheduler.abort();
    coordinator.terminate().await;
    ExitCode::SUCCESS
}
