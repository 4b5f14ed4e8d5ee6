// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Periodic tasks: the liveness monitor and the unmanaged direct host scan.

use std::sync::Arc;
use std::time::Duration;

use agent_manager_types::{HostEvent, HostId, HostStatus};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::AgentManager;
use crate::config::ManagerConfig;

impl AgentManager {
    /// Agents whose last ping is older than the ping timeout.
    fn agents_behind_on_ping(&self) -> Vec<HostId> {
        let timeout = self.cfg(ManagerConfig::ping_timeout);
        let now = Instant::now();
        self.pings
            .iter()
            .filter(|e| now.saturating_duration_since(*e.value()) > timeout)
            .map(|e| *e.key())
            .collect()
    }

    /// Check every agent that stopped pinging and wait for the checks to
    /// finish. Each agent gets its own task, at most `liveness_workers` of
    /// them running at once. An agent whose check is still running from an
    /// earlier sweep is left alone.
    pub async fn check_liveness(&self) {
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        let mut checks = JoinSet::new();
        for host_id in self.agents_behind_on_ping() {
            if !self.investigating.insert(host_id) {
                debug!(host_id, "agent behind on ping is already being checked");
                continue;
            }
            let me = me.clone();
            let workers = self.liveness_workers.clone();
            checks.spawn(async move {
                if let Ok(_permit) = workers.acquire_owned().await {
                    me.check_stale_agent(host_id).await;
                }
                me.investigating.remove(&host_id);
            });
        }
        while let Some(joined) = checks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "liveness check task failed");
            }
        }
    }

    /// Hosts taken out of service and infrastructure VMs are disconnected
    /// outright; anything else is investigated first.
    async fn check_stale_agent(&self, host_id: HostId) {
        let attache = match self.find_attache(host_id) {
            Some(attache) if !attache.forwards() => attache,
            _ => {
                self.pings.remove(&host_id);
                return;
            }
        };

        let host = match self.collab.store.find(host_id).await {
            Ok(host) => host,
            Err(e) => {
                warn!(host_id, error = %e, "unable to look up host behind on ping");
                return;
            }
        };

        let skip_investigation = host.as_ref().is_some_and(|h| {
            h.resource_state.is_out_of_service() || h.host_type.is_infrastructure()
        });
        info!(host_id, skip_investigation, "agent is behind on ping");

        let result = if skip_investigation {
            self.disconnect_attache_without_investigation(
                &attache,
                HostEvent::ShutdownRequested,
                true,
            )
            .await
        } else {
            self.disconnect_attache_with_investigation(&attache, HostEvent::PingTimeout)
                .await
        };
        if let Err(e) = result {
            warn!(host_id, error = %e, "unable to disconnect agent behind on ping");
        }
    }

    pub async fn run_monitor(self: Arc<Self>) {
        info!("liveness monitor started");
        loop {
            let period = self
                .cfg(ManagerConfig::ping_interval)
                .max(Duration::from_secs(1));
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            // A sweep can outlast the period while health checks wait.
            let me = self.clone();
            tokio::spawn(async move { me.check_liveness().await });
        }
        info!("liveness monitor stopped");
    }

    /// Claim a batch of unowned direct hosts and start loading them.
    /// Returns how many loads were started.
    pub async fn scan_direct_agents(&self) -> usize {
        let limit = self.cfg(|c| c.direct_agent_load_size);
        let hosts = match self.collab.store.claim_unowned(self.ms_id, limit).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "unable to claim unowned hosts");
                return 0;
            }
        };
        if hosts.is_empty() {
            return 0;
        }
        debug!(claimed = hosts.len(), "claimed unowned direct hosts");

        let Some(me) = self.self_ref.upgrade() else {
            return 0;
        };
        let hooks = self.hooks();
        let mut started = 0;
        for host in hosts {
            if hooks.as_ref().is_some_and(|h| h.is_transferring(host.id)) {
                debug!(host_id = host.id, "host is being transferred, not loading");
                continue;
            }
            if let Some(existing) = self.find_attache(host.id) {
                if !existing.forwards() {
                    debug!(host_id = host.id, "host already connected");
                    continue;
                }
                self.remove_agent(&existing, HostStatus::Disconnected);
            }

            let me = me.clone();
            tokio::spawn(async move {
                if let Err(e) = me.load_direct_host(&host, false).await {
                    warn!(host_id = host.id, error = %e, "unable to load direct host");
                    if let Err(e) = me.collab.store.set_owner(host.id, None).await {
                        warn!(host_id = host.id, error = %e, "unable to release host");
                    }
                }
            });
            started += 1;
        }
        started
    }

    pub async fn run_direct_scan(self: Arc<Self>) {
        info!("direct host scan started");
        loop {
            self.scan_direct_agents().await;
            let period = self.cfg(|c| c.direct_agent_scan_interval());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        info!("direct host scan stopped");
    }
}
