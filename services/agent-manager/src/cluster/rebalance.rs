// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent rebalancing between management servers.
//!
//! A node that finds itself short of agents asks overloaded peers for some
//! of theirs with a `TransferAgent` request. The current owner checks the
//! agent is idle, swaps its attache for a forwarding one in transfer mode,
//! and tells the future owner to load the agent. Requests issued while the
//! agent moves are held and sent to the new owner once it has loaded it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use agent_manager_types::{
    HostEvent, HostId, HostRecord, HostStatus, MsId, TransferAgentPayload, TransferPhase, names,
};
use dashmap::mapref::entry::Entry;
use strum::{Display, IntoStaticStr};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ClusterManager, control_command};
use crate::config::ManagerConfig;
use crate::error::{AgentError, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransferState {
    /// A peer asked for the agent; nothing has changed yet
    Requested,
    /// The local attache was swapped for a forwarding one
    Started,
    Completed,
    Failed,
}

/// An ownership handoff in progress.
#[derive(Debug, Clone)]
pub struct HostTransfer {
    pub host_id: HostId,
    pub current_owner: MsId,
    pub future_owner: MsId,
    pub state: TransferState,
    pub created: Instant,
}

impl HostTransfer {
    pub(crate) fn new(payload: &TransferAgentPayload, state: TransferState) -> Self {
        HostTransfer {
            host_id: payload.host_id,
            current_owner: payload.current_owner,
            future_owner: payload.future_owner,
            state,
            created: Instant::now(),
        }
    }
}

/// Pick the agents `ms_id` should ask its peers for.
///
/// Only direct hosts that are up take part. Every node is expected to
/// hold the average; each peer above it gives up its excess until this
/// node reaches the average. Returns `(host, current owner)` pairs.
pub fn plan_rebalance(ms_id: MsId, peers: &[MsId], hosts: &[HostRecord]) -> Vec<(HostId, MsId)> {
    let mut by_owner: BTreeMap<MsId, Vec<HostId>> = BTreeMap::new();
    for host in hosts {
        if !host.direct || host.status != HostStatus::Up {
            continue;
        }
        if let Some(owner) = host.owner {
            if owner == ms_id || peers.contains(&owner) {
                by_owner.entry(owner).or_default().push(host.id);
            }
        }
    }

    let total: usize = by_owner.values().map(Vec::len).sum();
    let average = total / (peers.len() + 1);
    let mine = by_owner.get(&ms_id).map_or(0, Vec::len);
    let mut deficit = average.saturating_sub(mine);

    let mut plan = Vec::new();
    for peer in peers {
        if deficit == 0 {
            break;
        }
        let Some(owned) = by_owner.get(peer) else {
            continue;
        };
        let take = owned.len().saturating_sub(average).min(deficit);
        plan.extend(owned.iter().take(take).map(|&host_id| (host_id, *peer)));
        deficit -= take;
    }
    plan
}

impl ClusterManager {
    /// Ask overloaded peers for agents once the share of owned hosts
    /// crosses the configured threshold. Fires at most once in the life of
    /// this node. Returns how many transfers were requested.
    pub async fn check_load(self: &Arc<Self>) -> usize {
        let (enabled, threshold) = self
            .manager
            .cfg(|c| (c.agent_lb_enabled, c.agent_load_threshold));
        if !enabled || self.lb_triggered.load(Ordering::Acquire) {
            return 0;
        }

        let hosts = match self.manager.store().list_all().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(error = %e, "unable to list hosts for load check");
                return 0;
            }
        };
        let active: Vec<HostRecord> = hosts
            .into_iter()
            .filter(|h| h.status != HostStatus::Removed)
            .collect();
        if active.is_empty() {
            return 0;
        }
        let managed = active.iter().filter(|h| h.owner.is_some()).count();
        let load = managed as f64 / active.len() as f64;
        if load < threshold {
            debug!(load, threshold, "agent load below threshold");
            return 0;
        }
        if self.lb_triggered.swap(true, Ordering::AcqRel) {
            return 0;
        }

        info!(load, threshold, "agent load crossed threshold, rebalancing");
        let plan = plan_rebalance(self.ms_id(), &self.pool.peer_ids(), &active);
        let mut requested = 0;
        for (host_id, owner) in plan {
            match self.request_transfer(host_id, owner).await {
                Ok(()) => requested += 1,
                Err(e) => warn!(host_id, owner, error = %e, "transfer request refused"),
            }
        }
        requested
    }

    /// Ask `owner` to hand `host_id` over to this node.
    pub async fn request_transfer(&self, host_id: HostId, owner: MsId) -> Result<()> {
        let cmd = control_command(
            names::TRANSFER_AGENT,
            &TransferAgentPayload {
                host_id,
                current_owner: owner,
                future_owner: self.ms_id(),
                phase: TransferPhase::Request,
            },
        );
        let answer = self.call(owner, host_id, cmd).await?;
        if answer.result {
            info!(host_id, owner, "transfer requested");
            Ok(())
        } else {
            Err(AgentError::unavailable(
                host_id,
                answer
                    .details
                    .unwrap_or_else(|| format!("Owner {owner} refused the transfer")),
            ))
        }
    }

    /// A peer asked for one of our agents. Record the transfer and run it
    /// in the background.
    pub(super) fn accept_transfer(self: &Arc<Self>, payload: &TransferAgentPayload) -> Result<()> {
        let host_id = payload.host_id;
        if payload.current_owner != self.ms_id() {
            return Err(AgentError::unavailable(
                host_id,
                format!("Agent is not owned by management server {}", self.ms_id()),
            ));
        }
        match self.transfers.entry(host_id) {
            Entry::Occupied(_) => {
                return Err(AgentError::unavailable(
                    host_id,
                    "Agent is already being transferred",
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(HostTransfer::new(payload, TransferState::Requested));
            }
        }

        info!(host_id, future_owner = payload.future_owner, "transfer requested by peer");
        let me = self.clone();
        let future_owner = payload.future_owner;
        tokio::spawn(async move {
            me.rebalance_host(host_id, future_owner).await;
        });
        Ok(())
    }

    /// Swap the local attache for a forwarding one in transfer mode.
    ///
    /// Returns false, changing nothing, unless this node holds the agent
    /// and the agent has neither held requests nor outstanding
    /// non-recurring listeners.
    pub async fn start_rebalance(&self, host_id: HostId, future_owner: MsId) -> Result<bool> {
        let host = self
            .manager
            .store()
            .find(host_id)
            .await?
            .ok_or(AgentError::HostNotFound(host_id))?;
        if !host.direct {
            debug!(host_id, "only direct agents are rebalanced");
            return Ok(false);
        }

        // No await from the idle check until the forwarding attache is
        // installed, or a send could land on the local attache and be
        // dropped with it.
        let Some(local) = self
            .manager
            .find_attache(host_id)
            .filter(|attache| !attache.forwards())
        else {
            debug!(host_id, "agent not held here, not rebalancing");
            return Ok(false);
        };
        let (queued, listening, forwarded) = (
            local.queue_size(),
            local.non_recurring_listener_count(),
            self.forwarded_in_flight(host_id),
        );
        if queued > 0 || listening > 0 || forwarded > 0 {
            info!(host_id, queued, listening, forwarded, "agent is busy, not rebalancing");
            return Ok(false);
        }

        // Sends issued from here on are held instead of failing.
        let forwarding = self.forwarding_attache(&host);
        forwarding.set_transfer_mode(true);
        self.manager.install(forwarding);
        self.manager
            .disconnect_attache_without_investigation(&local, HostEvent::StartAgentRebalance, true)
            .await?;

        if let Some(mut transfer) = self.transfers.get_mut(&host_id) {
            transfer.state = TransferState::Started;
        }
        info!(host_id, future_owner, "agent handed to forwarding attache");
        Ok(true)
    }

    /// Run the current owner's side of a transfer.
    pub(super) async fn rebalance_host(self: &Arc<Self>, host_id: HostId, future_owner: MsId) {
        let transfer = match self.transfer(host_id) {
            Some(transfer) => transfer,
            None => return,
        };
        match self.start_rebalance(host_id, future_owner).await {
            Ok(true) => {}
            Ok(false) => {
                self.fail_rebalance(&transfer).await;
                return;
            }
            Err(e) => {
                warn!(host_id, error = %e, "unable to start rebalance");
                let started = HostTransfer {
                    state: TransferState::Started,
                    ..transfer
                };
                self.fail_rebalance(&started).await;
                return;
            }
        }

        let cmd = control_command(
            names::TRANSFER_AGENT,
            &TransferAgentPayload {
                host_id,
                current_owner: self.ms_id(),
                future_owner,
                phase: TransferPhase::Start,
            },
        );
        let outcome = match self.call(future_owner, host_id, cmd).await {
            Ok(answer) if answer.result => Ok(()),
            Ok(answer) => Err(answer.details.unwrap_or_default()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => self.complete_rebalance(host_id).await,
            Err(reason) => {
                warn!(host_id, future_owner, %reason, "future owner did not load the agent");
                let started = HostTransfer {
                    state: TransferState::Started,
                    ..transfer
                };
                self.fail_rebalance(&started).await;
            }
        }
    }

    /// The future owner has the agent: send it the held requests.
    async fn complete_rebalance(&self, host_id: HostId) {
        if let Some(forwarding) = self
            .manager
            .find_attache(host_id)
            .filter(|attache| attache.forwards())
        {
            forwarding.end_transfer().await;
        }
        self.transfers.remove(&host_id);
        metrics::record_rebalance(TransferState::Completed.into());
        info!(host_id, "rebalance completed");
    }

    /// Give up on a transfer. If this node already let the agent go, it
    /// takes the agent back the normal way. The transfer entry goes last,
    /// so the host is not claimed from under the recovery.
    pub(super) async fn fail_rebalance(&self, transfer: &HostTransfer) {
        let host_id = transfer.host_id;
        warn!(host_id, state = %transfer.state, "rebalance failed");
        if transfer.current_owner == self.ms_id() && transfer.state != TransferState::Requested {
            self.take_back(host_id).await;
        }
        self.transfers.remove(&host_id);
        metrics::record_rebalance(TransferState::Failed.into());
    }

    async fn take_back(&self, host_id: HostId) {
        if let Some(forwarding) = self
            .manager
            .find_attache(host_id)
            .filter(|attache| attache.forwards())
        {
            self.manager
                .remove_agent(&forwarding, HostStatus::Disconnected);
        }

        match self.manager.store().find(host_id).await {
            Ok(Some(host)) if host.status == HostStatus::Rebalancing => {}
            Ok(_) => return,
            Err(e) => {
                warn!(host_id, error = %e, "unable to look up host after failed rebalance");
                return;
            }
        }
        if let Err(e) = self
            .manager
            .transition_host(host_id, HostEvent::RebalanceFailed)
            .await
        {
            warn!(host_id, error = %e, "unable to mark rebalance failed");
            return;
        }
        if let Err(e) = self.reload(host_id).await {
            warn!(host_id, error = %e, "unable to reconnect agent after failed rebalance");
            if let Err(e) = self.manager.store().set_owner(host_id, None).await {
                warn!(host_id, error = %e, "unable to release host");
            }
        }
    }

    async fn reload(&self, host_id: HostId) -> Result<()> {
        let store = self.manager.store();
        store.set_owner(host_id, Some(self.ms_id())).await?;
        let host = store
            .find(host_id)
            .await?
            .ok_or(AgentError::HostNotFound(host_id))?;
        self.manager.load_direct_host(&host, true).await
    }

    /// Run the future owner's side of a transfer: load the agent here.
    pub(super) async fn load_transferred_host(&self, payload: &TransferAgentPayload) -> Result<()> {
        let host_id = payload.host_id;
        if payload.future_owner != self.ms_id() {
            return Err(AgentError::unavailable(
                host_id,
                format!("Transfer is meant for management server {}", payload.future_owner),
            ));
        }
        let host = self
            .manager
            .store()
            .find(host_id)
            .await?
            .ok_or(AgentError::HostNotFound(host_id))?;
        if !host.direct {
            return Err(AgentError::unavailable(
                host_id,
                "Only direct agents can be transferred",
            ));
        }

        self.transfers
            .insert(host_id, HostTransfer::new(payload, TransferState::Started));
        if let Some(existing) = self.manager.find_attache(host_id) {
            self.manager
                .remove_agent(&existing, HostStatus::Disconnected);
        }
        info!(host_id, from = payload.current_owner, "loading transferred agent");
        let result = self.manager.load_direct_host(&host, true).await;
        self.transfers.remove(&host_id);
        result
    }

    /// Fail transfers that have been running for longer than allowed.
    pub async fn sweep_stale_transfers(&self) -> usize {
        let wait = self.manager.cfg(ManagerConfig::rebalance_wait);
        let stale: Vec<HostTransfer> = self
            .transfers
            .iter()
            .filter(|e| e.created.elapsed() > wait)
            .map(|e| e.value().clone())
            .collect();
        for transfer in &stale {
            warn!(host_id = transfer.host_id, ?wait, "transfer timed out");
            self.fail_rebalance(transfer).await;
        }
        stale.len()
    }

    /// The load balancer and the transfer sweep, until the manager stops.
    pub async fn run_rebalance_tasks(self: Arc<Self>) {
        info!("rebalance tasks started");
        let shutdown = self.manager.shutdown_token();
        loop {
            let period = self.manager.cfg(ManagerConfig::load_balancer_interval);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            self.check_load().await;
            self.sweep_stale_transfers().await;
        }
        info!("rebalance tasks stopped");
    }
}
