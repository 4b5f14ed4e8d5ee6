// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Configuration for the agent manager

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agent_manager_types::{DEFAULT_CONNECTING_DENIED, DEFAULT_MAINTENANCE_ALLOWED, MsId};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::sync::watch;

/// Default address agents connect to.
pub const DEFAULT_AGENT_BIND_ADDRESS: &str = "0.0.0.0:8250";

/// A cooperating management server and the address of its peer listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub ms_id: MsId,
    pub address: String,
}

/// PEM files used to secure peer connections with mutual TLS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerTlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Manager configuration loaded from environment variables or JSON file
///
/// Configuration can be loaded from:
/// 1. Environment variables (primary method, see `from_env()`)
/// 2. JSON config file (for SIGUSR1-based reloading, see `from_file()`)
///
/// The JSON config file only carries the tunables that are safe to change
/// while agents are connected. Identity, listen addresses and pool sizes
/// are fixed at startup.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Identifier of this management server
    #[serde(skip)]
    pub ms_id: MsId,

    /// Address the agent acceptor binds to
    #[serde(skip)]
    pub agent_bind_address: String,

    /// Address the peer acceptor binds to, None when running standalone
    #[serde(skip)]
    pub cluster_bind_address: Option<String>,

    /// Other management servers in the cluster
    #[serde(skip)]
    pub cluster_peers: Vec<PeerAddress>,

    /// Mutual TLS material for peer links, plain TCP when unset
    #[serde(skip)]
    pub peer_tls: Option<PeerTlsFiles>,

    /// JSON file seeding the in-memory host store
    #[serde(skip)]
    pub hosts_file: Option<PathBuf>,

    /// Default wait for a synchronous send that names no timeout
    pub wait_secs: u64,

    /// How long the agent gets to answer the ready command, and to send
    /// its startup command on a fresh connection
    pub ready_wait_secs: u64,

    /// Wait for the health check during investigation
    pub check_health_wait_secs: u64,

    /// Interval agents are told to ping at
    pub ping_interval_secs: u64,

    /// A ping older than `ping_interval_secs * ping_timeout_multiplier`
    /// is stale
    pub ping_timeout_multiplier: f64,

    /// How long an inconclusive investigation waits before alerting
    pub alert_wait_secs: u64,

    /// Largest batch of unowned direct hosts claimed per scan
    pub direct_agent_load_size: usize,

    /// Size of the direct-agent worker pool
    #[serde(skip)]
    pub direct_agent_pool_size: usize,

    /// Fraction of the pool one direct agent may keep busy
    #[serde(skip)]
    pub direct_agent_thread_cap: f64,

    pub direct_agent_scan_interval_secs: u64,

    /// Stale agents the liveness monitor investigates at once
    #[serde(skip)]
    pub liveness_workers: usize,

    /// Whether this node proactively asks overloaded peers for agents
    pub agent_lb_enabled: bool,

    /// Share of all hosts that must have an owner before this node asks
    /// peers to rebalance
    pub agent_load_threshold: f64,

    pub load_balancer_interval_secs: u64,

    /// Upper bound on the lifetime of a transfer-map entry
    pub rebalance_wait_secs: u64,

    /// Wait for a peer to answer a control command
    pub peer_request_timeout_secs: u64,

    /// Commands still accepted by an agent in maintenance
    pub maintenance_allowed: Vec<String>,

    /// Commands refused while an agent is still connecting
    pub connecting_denied: Vec<String>,
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ms_id: 0,
            agent_bind_address: DEFAULT_AGENT_BIND_ADDRESS.to_string(),
            cluster_bind_address: None,
            cluster_peers: Vec::new(),
            peer_tls: None,
            hosts_file: None,
            wait_secs: 1800,
            ready_wait_secs: 60,
            check_health_wait_secs: 50,
            ping_interval_secs: 60,
            ping_timeout_multiplier: 2.5,
            alert_wait_secs: 1800,
            direct_agent_load_size: 16,
            direct_agent_pool_size: 500,
            direct_agent_thread_cap: 1.0,
            direct_agent_scan_interval_secs: 90,
            liveness_workers: 32,
            agent_lb_enabled: false,
            agent_load_threshold: 0.7,
            load_balancer_interval_secs: 60,
            rebalance_wait_secs: 300,
            peer_request_timeout_secs: 60,
            maintenance_allowed: to_strings(DEFAULT_MAINTENANCE_ALLOWED),
            connecting_denied: to_strings(DEFAULT_CONNECTING_DENIED),
        }
    }
}

/// Parse a comma-separated list, dropping empty entries.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `CLUSTER_PEERS`: `id=host:port,id=host:port`.
pub fn parse_peers(value: &str) -> Result<Vec<PeerAddress>> {
    parse_list(value)
        .into_iter()
        .map(|entry| {
            let Some((id, address)) = entry.split_once('=') else {
                bail!("Invalid CLUSTER_PEERS entry {entry:?}, expected id=host:port");
            };
            let ms_id = id
                .trim()
                .parse()
                .with_context(|| format!("Invalid peer id in CLUSTER_PEERS entry {entry:?}"))?;
            Ok(PeerAddress {
                ms_id,
                address: address.trim().to_string(),
            })
        })
        .collect()
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let ms_id = std::env::var("MANAGEMENT_SERVER_ID")
            .context("MANAGEMENT_SERVER_ID environment variable required")?
            .parse()
            .context("Invalid MANAGEMENT_SERVER_ID")?;

        let agent_bind_address = env_or("AGENT_BIND_ADDRESS", DEFAULT_AGENT_BIND_ADDRESS);
        agent_bind_address
            .parse::<SocketAddr>()
            .context("Invalid AGENT_BIND_ADDRESS")?;

        let cluster_bind_address = std::env::var("CLUSTER_BIND_ADDRESS").ok();
        if let Some(addr) = &cluster_bind_address {
            addr.parse::<SocketAddr>()
                .context("Invalid CLUSTER_BIND_ADDRESS")?;
        }

        let cluster_peers = match std::env::var("CLUSTER_PEERS") {
            Ok(v) => parse_peers(&v)?,
            Err(_) => Vec::new(),
        };

        // All three files or none.
        let peer_tls = match (
            std::env::var("PEER_TLS_CA"),
            std::env::var("PEER_TLS_CERT"),
            std::env::var("PEER_TLS_KEY"),
        ) {
            (Ok(ca), Ok(cert), Ok(key)) => Some(PeerTlsFiles {
                ca: ca.into(),
                cert: cert.into(),
                key: key.into(),
            }),
            (Err(_), Err(_), Err(_)) => None,
            _ => bail!("PEER_TLS_CA, PEER_TLS_CERT and PEER_TLS_KEY must be set together"),
        };

        let hosts_file = std::env::var("HOSTS_FILE").ok().map(PathBuf::from);

        let wait_secs = env_or("AGENT_WAIT_SECS", "1800")
            .parse()
            .context("Invalid AGENT_WAIT_SECS")?;

        let ready_wait_secs = env_or("READY_WAIT_SECS", "60")
            .parse()
            .context("Invalid READY_WAIT_SECS")?;

        let check_health_wait_secs = env_or("CHECK_HEALTH_WAIT_SECS", "50")
            .parse()
            .context("Invalid CHECK_HEALTH_WAIT_SECS")?;

        let ping_interval_secs = env_or("PING_INTERVAL_SECS", "60")
            .parse()
            .context("Invalid PING_INTERVAL_SECS")?;

        let ping_timeout_multiplier = env_or("PING_TIMEOUT_MULTIPLIER", "2.5")
            .parse()
            .context("Invalid PING_TIMEOUT_MULTIPLIER")?;

        let alert_wait_secs = env_or("ALERT_WAIT_SECS", "1800")
            .parse()
            .context("Invalid ALERT_WAIT_SECS")?;

        let direct_agent_load_size = env_or("DIRECT_AGENT_LOAD_SIZE", "16")
            .parse()
            .context("Invalid DIRECT_AGENT_LOAD_SIZE")?;

        let direct_agent_pool_size = env_or("DIRECT_AGENT_POOL_SIZE", "500")
            .parse()
            .context("Invalid DIRECT_AGENT_POOL_SIZE")?;

        let direct_agent_thread_cap = env_or("DIRECT_AGENT_THREAD_CAP", "1.0")
            .parse()
            .context("Invalid DIRECT_AGENT_THREAD_CAP")?;

        let direct_agent_scan_interval_secs = env_or("DIRECT_AGENT_SCAN_INTERVAL_SECS", "90")
            .parse()
            .context("Invalid DIRECT_AGENT_SCAN_INTERVAL_SECS")?;

        let liveness_workers = env_or("LIVENESS_WORKERS", "32")
            .parse()
            .context("Invalid LIVENESS_WORKERS")?;

        // Accepts "true", "1", "yes" (case-insensitive) as true
        let agent_lb_enabled = std::env::var("AGENT_LB_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let agent_load_threshold = env_or("AGENT_LOAD_THRESHOLD", "0.7")
            .parse()
            .context("Invalid AGENT_LOAD_THRESHOLD")?;

        let load_balancer_interval_secs = env_or("LOAD_BALANCER_INTERVAL_SECS", "60")
            .parse()
            .context("Invalid LOAD_BALANCER_INTERVAL_SECS")?;

        let rebalance_wait_secs = env_or("REBALANCE_WAIT_SECS", "300")
            .parse()
            .context("Invalid REBALANCE_WAIT_SECS")?;

        let peer_request_timeout_secs = env_or("PEER_REQUEST_TIMEOUT_SECS", "60")
            .parse()
            .context("Invalid PEER_REQUEST_TIMEOUT_SECS")?;

        let maintenance_allowed = std::env::var("MAINTENANCE_ALLOWED_COMMANDS")
            .map(|v| parse_list(&v))
            .unwrap_or(defaults.maintenance_allowed);

        let connecting_denied = std::env::var("CONNECTING_DENIED_COMMANDS")
            .map(|v| parse_list(&v))
            .unwrap_or(defaults.connecting_denied);

        Ok(Self {
            ms_id,
            agent_bind_address,
            cluster_bind_address,
            cluster_peers,
            peer_tls,
            hosts_file,
            wait_secs,
            ready_wait_secs,
            check_health_wait_secs,
            ping_interval_secs,
            ping_timeout_multiplier,
            alert_wait_secs,
            direct_agent_load_size,
            direct_agent_pool_size,
            direct_agent_thread_cap,
            direct_agent_scan_interval_secs,
            liveness_workers,
            agent_lb_enabled,
            agent_load_threshold,
            load_balancer_interval_secs,
            rebalance_wait_secs,
            peer_request_timeout_secs,
            maintenance_allowed,
            connecting_denied,
        })
    }

    /// Load configuration from a JSON file
    ///
    /// This is used for runtime configuration reloading via SIGUSR1.
    /// Identity and addresses cannot be reloaded and come back defaulted.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Merge runtime-reloadable fields from another config
    pub fn merge_reloadable(&mut self, other: &ManagerConfig) {
        self.wait_secs = other.wait_secs;
        self.ready_wait_secs = other.ready_wait_secs;
        self.check_health_wait_secs = other.check_health_wait_secs;
        self.ping_interval_secs = other.ping_interval_secs;
        self.ping_timeout_multiplier = other.ping_timeout_multiplier;
        self.alert_wait_secs = other.alert_wait_secs;
        self.direct_agent_load_size = other.direct_agent_load_size;
        self.direct_agent_scan_interval_secs = other.direct_agent_scan_interval_secs;
        self.agent_lb_enabled = other.agent_lb_enabled;
        self.agent_load_threshold = other.agent_load_threshold;
        self.load_balancer_interval_secs = other.load_balancer_interval_secs;
        self.rebalance_wait_secs = other.rebalance_wait_secs;
        self.peer_request_timeout_secs = other.peer_request_timeout_secs;
        self.maintenance_allowed = other.maintenance_allowed.clone();
        self.connecting_denied = other.connecting_denied.clone();
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_secs(self.ready_wait_secs)
    }

    pub fn check_health_wait(&self) -> Duration {
        Duration::from_secs(self.check_health_wait_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Age beyond which a ping timestamp is stale.
    pub fn ping_timeout(&self) -> Duration {
        let secs = (self.ping_interval_secs as f64 * self.ping_timeout_multiplier).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn alert_wait(&self) -> Duration {
        Duration::from_secs(self.alert_wait_secs)
    }

    pub fn rebalance_wait(&self) -> Duration {
        Duration::from_secs(self.rebalance_wait_secs)
    }

    pub fn peer_request_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_request_timeout_secs)
    }

    pub fn direct_agent_scan_interval(&self) -> Duration {
        Duration::from_secs(self.direct_agent_scan_interval_secs.max(1))
    }

    pub fn load_balancer_interval(&self) -> Duration {
        Duration::from_secs(self.load_balancer_interval_secs.max(1))
    }

    /// Cap on outstanding work per direct agent, always at least one.
    pub fn direct_agent_cap(&self) -> usize {
        let scaled = (self.direct_agent_pool_size as f64 * self.direct_agent_thread_cap).round();
        scaled.max(0.0) as usize + 1
    }

    /// Whether a peer listener is configured.
    pub fn is_clustered(&self) -> bool {
        self.cluster_bind_address.is_some()
    }

    /// Start watching for SIGUSR1 to reload config from file
    ///
    /// When SIGUSR1 is received, the config file is re-read and the new
    /// configuration is sent to subscribers via the watch channel.
    #[cfg(unix)]
    pub async fn start_config_watcher(
        config_file: PathBuf,
        current_config: Self,
        config_tx: watch::Sender<Self>,
    ) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register SIGUSR1 handler");
                return;
            }
        };

        let mut config = current_config;

        loop {
            sigusr1.recv().await;
            tracing::info!(
                config_file = %config_file.display(),
                "Received SIGUSR1, reloading config"
            );

            match Self::from_file(&config_file).await {
                Ok(new_config) => {
                    config.merge_reloadable(&new_config);

                    if config_tx.send(config.clone()).is_err() {
                        tracing::warn!("No config subscribers, reload had no effect");
                    } else {
                        tracing::info!(
                            wait_secs = config.wait_secs,
                            ping_interval_secs = config.ping_interval_secs,
                            agent_lb_enabled = config.agent_lb_enabled,
                            "Config reloaded successfully"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        config_file = %config_file.display(),
                        "Failed to reload config"
                    );
                }
            }
        }
    }
}
