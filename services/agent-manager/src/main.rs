// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent Manager Service
//!
//! Runs one management server node. It:
//!
//! - Accepts agent connections and keeps one attache per agent
//! - Watches agent liveness and moves hosts through their status
//! - Claims and loads unowned direct hosts
//! - When clustered, forwards commands to peers and rebalances agents

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use agent_manager::AgentManager;
use agent_manager::cluster::ClusterManager;
use agent_manager::cluster::tls::PeerTls;
use agent_manager::config::{DEFAULT_AGENT_BIND_ADDRESS, ManagerConfig};
use agent_manager::host::{Collaborators, MemoryHostStore};
use agent_manager::metrics;

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

fn print_help(program: &str) {
    print_version();
    println!("Usage: {} [OPTIONS]", program);
    println!();
    println!("Options:");
    println!("  -h, --help       Display this information");
    println!("  -V, --version    Display the program's version number");
    println!();
    println!("Environment variables:");
    println!("  MANAGEMENT_SERVER_ID             Identifier of this node (required)");
    println!(
        "  AGENT_BIND_ADDRESS               Agent listener address (default: {})",
        DEFAULT_AGENT_BIND_ADDRESS
    );
    println!("  CLUSTER_BIND_ADDRESS             Peer listener address, enables clustering");
    println!("  CLUSTER_PEERS                    Peers as id=host:port, comma separated");
    println!("  PEER_TLS_CA, PEER_TLS_CERT, PEER_TLS_KEY");
    println!("                                   PEM files for mutual TLS between peers");
    println!("  HOSTS_FILE                       JSON host records to start from");
    println!("  AGENT_WAIT_SECS                  Default send wait (default: 1800)");
    println!("  READY_WAIT_SECS                  Wait for the ready answer (default: 60)");
    println!("  CHECK_HEALTH_WAIT_SECS           Wait for a health check (default: 50)");
    println!("  PING_INTERVAL_SECS               Expected agent ping interval (default: 60)");
    println!("  PING_TIMEOUT_MULTIPLIER          Missed-ping factor (default: 2.5)");
    println!("  ALERT_WAIT_SECS                  Grace before alerting (default: 1800)");
    println!("  DIRECT_AGENT_LOAD_SIZE           Direct hosts claimed per scan (default: 16)");
    println!("  DIRECT_AGENT_POOL_SIZE           Direct request workers (default: 500)");
    println!("  DIRECT_AGENT_THREAD_CAP          Direct backlog factor (default: 1.0)");
    println!("  DIRECT_AGENT_SCAN_INTERVAL_SECS  Unowned host scan period (default: 90)");
    println!("  LIVENESS_WORKERS                 Concurrent stale-agent checks (default: 32)");
    println!("  AGENT_LB_ENABLED                 Ask peers for agents (default: false)");
    println!("  AGENT_LOAD_THRESHOLD             Managed share that triggers it (default: 0.7)");
    println!("  LOAD_BALANCER_INTERVAL_SECS      Load check period (default: 60)");
    println!("  REBALANCE_WAIT_SECS              Transfer lifetime bound (default: 300)");
    println!("  PEER_REQUEST_TIMEOUT_SECS        Wait for a peer answer (default: 60)");
    println!("  MAINTENANCE_ALLOWED_COMMANDS     Commands allowed in maintenance");
    println!("  CONNECTING_DENIED_COMMANDS       Commands refused while connecting");
    println!("  CONFIG_FILE                      JSON config file for SIGUSR1 reloading (optional)");
    println!(
        "  RUST_LOG                         Log filter (default: agent_manager=info,agent_wire=info)"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_help(&args[0]);
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "agent_manager=info,agent_wire=info".to_string()),
        ))
        .init();

    print_version();

    // Load configuration
    let config = ManagerConfig::from_env().context("Failed to load configuration")?;
    info!(
        ms_id = config.ms_id,
        agent_bind_address = %config.agent_bind_address,
        clustered = config.is_clustered(),
        "configuration loaded"
    );
    let (config_tx, config_rx) = watch::channel(config.clone());

    // Start config file watcher if CONFIG_FILE is set (Unix only)
    #[cfg(unix)]
    if let Ok(config_file) = std::env::var("CONFIG_FILE") {
        use std::path::PathBuf;

        let config_path = PathBuf::from(&config_file);
        if tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            tokio::spawn(ManagerConfig::start_config_watcher(
                config_path,
                config.clone(),
                config_tx,
            ));
            info!(
                config_file = %config_file,
                "Config watcher started - send SIGUSR1 to reload"
            );
        } else {
            tracing::warn!(
                config_file = %config_file,
                "CONFIG_FILE specified but file does not exist, config reloading disabled"
            );
        }
    }
    #[cfg(not(unix))]
    drop(config_tx);

    // Host records
    let store = match &config.hosts_file {
        Some(path) => MemoryHostStore::from_file(path).await?,
        None => MemoryHostStore::default(),
    };
    let collab = Collaborators::standalone(Arc::new(store));

    metrics::register_metrics();
    let manager = AgentManager::new(config_rx, collab);

    let agent_listener = TcpListener::bind(&config.agent_bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.agent_bind_address))?;

    let cluster = match &config.cluster_bind_address {
        Some(address) => {
            let tls = match &config.peer_tls {
                Some(files) => Some(Arc::new(
                    PeerTls::load(files).context("Failed to load peer TLS material")?,
                )),
                None => {
                    tracing::warn!("PEER_TLS_* not set, peer traffic is not encrypted");
                    None
                }
            };
            let cluster = ClusterManager::new(manager.clone(), tls);
            let peer_listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind {}", address))?;
            tokio::spawn(cluster.clone().run_peer_acceptor(peer_listener));
            tokio::spawn(cluster.clone().run_rebalance_tasks());
            Some(cluster)
        }
        None => None,
    };

    // Started once the cluster hooks are in place, so that the first
    // claims and handshakes already see ownership and transfers.
    tokio::spawn(manager.clone().run_agent_acceptor(agent_listener));
    tokio::spawn(manager.clone().run_monitor());
    tokio::spawn(manager.clone().run_direct_scan());

    info!(ms_id = manager.ms_id(), "Agent manager running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("shutdown requested");

    match cluster {
        Some(cluster) => cluster.stop().await,
        None => manager.stop().await,
    }
    debug!(metrics = %metrics::gather_metrics(), "final metrics");
    Ok(())
}
