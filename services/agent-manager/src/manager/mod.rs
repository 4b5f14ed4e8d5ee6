// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Single-node agent manager
//!
//! [`AgentManager`] owns the table of attaches for the agents this node
//! talks to, the ping map used by the liveness monitor, and the listener
//! registry. It runs the connect handshake, answers requests agents send
//! on their own, and applies the disconnect policy that moves hosts
//! through the status state machine.
//!
//! When the node is part of a cluster the [`ClusterHooks`] installed by
//! [`crate::cluster::ClusterManager`] let the manager create forwarding
//! attaches, route answers back to the node a request came from and tell
//! peers about disconnects.

mod connection;
mod monitor;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use agent_manager_types::{
    Answer, Command, Commands, HostEvent, HostId, HostRecord, HostStatus, MsId, ResourceEvent,
    names,
};
use agent_wire::{Request, Response};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attache::{
    Attache, AttacheContext, AttacheEvents, AttacheKind, AvailabilityPolicy, DirectAgentPools,
    ServerResource,
};
use crate::config::ManagerConfig;
use crate::error::{AgentError, ConnectionError, Result};
use crate::host::{AlertKind, Collaborators, HostStore};
use crate::listener::{Dispatch, Listener, ListenerHandle, ListenerRegistry};
use crate::metrics;
use crate::status;
use crate::timer::TimerService;

/// What the single-node manager needs from the cluster layer.
#[async_trait]
pub trait ClusterHooks: Send + Sync {
    /// Build and install a forwarding attache for a host owned by a peer.
    fn create_forwarding_attache(&self, host: &HostRecord) -> Arc<Attache>;

    /// Send an answer for a forwarded request back to the node it came
    /// from.
    async fn route_answer(&self, resp: Response);

    /// Tell every peer that this node dropped its connection to an agent.
    async fn agent_disconnected(&self, host_id: HostId, event: HostEvent);

    /// Ask the owner of `host` to apply a resource event.
    async fn propagate_resource_event(&self, host: &HostRecord, event: ResourceEvent)
    -> Result<()>;

    /// Whether ownership of the host is being handed over right now.
    fn is_transferring(&self, host_id: HostId) -> bool;
}

/// Where a resource event for a host has to be applied.
enum Target {
    Local(Arc<Attache>),
    Remote(HostRecord, Arc<dyn ClusterHooks>),
    Absent,
}

pub struct AgentManager {
    ms_id: MsId,
    config: watch::Receiver<ManagerConfig>,
    agents: DashMap<HostId, Arc<Attache>>,
    pings: DashMap<HostId, Instant>,
    /// Agents the liveness monitor is checking right now
    investigating: DashSet<HostId>,
    liveness_workers: Arc<Semaphore>,
    listeners: ListenerRegistry,
    collab: Collaborators,
    timers: TimerService,
    direct_pools: DirectAgentPools,
    cluster: OnceLock<Weak<dyn ClusterHooks>>,
    shutdown: CancellationToken,
    self_ref: Weak<AgentManager>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("ms_id", &self.ms_id)
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl AgentManager {
    pub fn new(config: watch::Receiver<ManagerConfig>, collab: Collaborators) -> Arc<Self> {
        let (ms_id, direct_pools, liveness_workers) = {
            let current = config.borrow();
            (
                current.ms_id,
                DirectAgentPools::from_config(&current),
                current.liveness_workers.max(1),
            )
        };
        Arc::new_cyclic(|me| AgentManager {
            ms_id,
            config,
            agents: DashMap::new(),
            pings: DashMap::new(),
            investigating: DashSet::new(),
            liveness_workers: Arc::new(Semaphore::new(liveness_workers)),
            listeners: ListenerRegistry::new(),
            collab,
            timers: TimerService::new(),
            direct_pools,
            cluster: OnceLock::new(),
            shutdown: CancellationToken::new(),
            self_ref: me.clone(),
        })
    }

    pub(crate) fn cfg<T>(&self, read: impl FnOnce(&ManagerConfig) -> T) -> T {
        read(&self.config.borrow())
    }

    pub fn ms_id(&self) -> MsId {
        self.ms_id
    }

    pub fn config(&self) -> ManagerConfig {
        self.config.borrow().clone()
    }

    pub fn store(&self) -> &Arc<dyn HostStore> {
        &self.collab.store
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Agents this node holds the live connection to.
    pub fn local_agent_count(&self) -> usize {
        self.agents.iter().filter(|e| !e.value().forwards()).count()
    }

    pub fn last_ping(&self, host_id: HostId) -> Option<Instant> {
        self.pings.get(&host_id).map(|e| *e.value())
    }

    /// Collaborators for a new attache, with the availability policy as
    /// currently configured.
    pub(crate) fn attache_context(&self) -> AttacheContext {
        let events: Weak<dyn AttacheEvents> = self.self_ref.clone();
        AttacheContext {
            ms_id: self.ms_id,
            timers: self.timers.clone(),
            events,
            policy: Arc::new(self.cfg(AvailabilityPolicy::from_config)),
        }
    }

    pub(crate) fn set_cluster_hooks(&self, hooks: Weak<dyn ClusterHooks>) {
        if self.cluster.set(hooks).is_err() {
            warn!("cluster hooks already installed");
        }
    }

    fn hooks(&self) -> Option<Arc<dyn ClusterHooks>> {
        self.cluster.get().and_then(Weak::upgrade)
    }

    pub fn register_for_host_events(
        &self,
        listener: Arc<dyn Listener>,
        want_connections: bool,
        want_commands: bool,
        priority: bool,
    ) -> ListenerHandle {
        self.listeners
            .register(listener, want_connections, want_commands, priority)
    }

    pub fn unregister_for_host_events(&self, handle: ListenerHandle) {
        self.listeners.unregister(handle);
    }

    // ------------------------------------------------------------------
    // Attache table
    // ------------------------------------------------------------------

    fn refresh_gauges(&self) {
        let (mut connected, mut direct, mut forwarding) = (0, 0, 0);
        for entry in self.agents.iter() {
            match entry.value().kind() {
                AttacheKind::Connected => connected += 1,
                AttacheKind::Direct => direct += 1,
                AttacheKind::Forwarding => forwarding += 1,
            }
        }
        metrics::set_attaches(AttacheKind::Connected.into(), connected);
        metrics::set_attaches(AttacheKind::Direct.into(), direct);
        metrics::set_attaches(AttacheKind::Forwarding.into(), forwarding);
    }

    /// Make `attache` the one attache for its agent. The attache it
    /// replaces, if any, is disconnected.
    pub fn install(&self, attache: Arc<Attache>) {
        let host_id = attache.id();
        let old = self.agents.insert(host_id, attache.clone());
        if let Some(old) = old {
            if !Arc::ptr_eq(&old, &attache) {
                info!(
                    host_id,
                    old = ?old.kind(),
                    new = ?attache.kind(),
                    "replacing attache"
                );
                old.disconnect(HostStatus::Disconnected);
            }
        }
        self.refresh_gauges();
    }

    /// Remove `attache` from the table if it is still the installed one.
    pub(crate) fn remove_attache(&self, attache: &Arc<Attache>) -> bool {
        self.agents
            .remove_if(&attache.id(), |_, current| Arc::ptr_eq(current, attache))
            .is_some()
    }

    pub fn find_attache(&self, host_id: HostId) -> Option<Arc<Attache>> {
        self.agents.get(&host_id).map(|e| e.value().clone())
    }

    /// The attache to send to. On a clustered node a host owned by a peer
    /// gets a forwarding attache.
    pub async fn get_attache(&self, host_id: HostId) -> Result<Arc<Attache>> {
        let local = self.find_attache(host_id);
        if let Some(attache) = &local {
            if attache.forwards() {
                return Ok(attache.clone());
            }
        }

        if let Some(hooks) = self.hooks() {
            if let Some(host) = self.collab.store.find(host_id).await? {
                if host.owner.is_some_and(|owner| owner != self.ms_id) {
                    debug!(host_id, owner = ?host.owner, "host owned by a peer");
                    return Ok(hooks.create_forwarding_attache(&host));
                }
            }
        }

        local.ok_or_else(|| AgentError::unavailable(host_id, "Unable to find the agent"))
    }

    pub(crate) fn remove_agent(&self, attache: &Arc<Attache>, next: HostStatus) {
        let host_id = attache.id();
        let removed = self.remove_attache(attache);
        if removed {
            info!(host_id, %next, kind = ?attache.kind(), "removing attache");
            self.pings.remove(&host_id);
        }
        attache.disconnect(next);
        if !attache.forwards() {
            self.listeners.notify_disconnect(host_id, next);
        }
        self.refresh_gauges();
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send commands and wait for the answers. A zero `timeout` uses the
    /// configured default wait; a longer per-command wait wins.
    pub async fn send(
        &self,
        host_id: HostId,
        commands: Commands,
        timeout: Duration,
    ) -> Result<Vec<Answer>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut wait = if timeout.is_zero() {
            self.cfg(ManagerConfig::wait)
        } else {
            timeout
        };
        wait = wait.max(Duration::from_secs(commands.max_wait_secs()));

        let attache = self.get_attache(host_id).await?;
        let req = Request::new(host_id, self.ms_id, attache.next_sequence(), commands);
        attache.send_sync(req, wait).await
    }

    /// Send commands without waiting. The listener receives the answers;
    /// the sequence number is returned.
    pub async fn send_with_listener(
        &self,
        host_id: HostId,
        commands: Commands,
        listener: Arc<dyn Listener>,
    ) -> Result<u64> {
        let attache = self.get_attache(host_id).await?;
        let seq = attache.next_sequence();
        let req = Request::new(host_id, self.ms_id, seq, commands);
        attache.send(req, Some(listener)).await?;
        Ok(seq)
    }

    /// Best-effort send of one command. Any failure, including a failed
    /// answer, is logged and reported as None.
    pub async fn easy_send(&self, host_id: HostId, command: Command) -> Option<Answer> {
        let name = command.name.clone();
        match self.collab.store.find(host_id).await {
            Ok(Some(host)) if matches!(host.status, HostStatus::Up | HostStatus::Connecting) => {}
            Ok(Some(host)) => {
                debug!(host_id, status = %host.status, command = %name, "not sending to host");
                return None;
            }
            Ok(None) => return None,
            Err(e) => {
                warn!(host_id, error = %e, "unable to look up host");
                return None;
            }
        }

        let timeout = Duration::from_secs(command.wait_secs);
        match self
            .send(host_id, Commands::single(command), timeout)
            .await
        {
            Ok(answers) => {
                let answer = answers.into_iter().next()?;
                if answer.result {
                    Some(answer)
                } else {
                    warn!(
                        host_id,
                        command = %name,
                        details = answer.details.as_deref().unwrap_or(""),
                        "command failed"
                    );
                    None
                }
            }
            Err(e) => {
                warn!(host_id, command = %name, error = %e, "unable to send command");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Resource operations
    // ------------------------------------------------------------------

    async fn resolve(&self, host_id: HostId) -> Result<Target> {
        if let Some(attache) = self.find_attache(host_id) {
            if !attache.forwards() {
                return Ok(Target::Local(attache));
            }
        }
        if let Some(hooks) = self.hooks() {
            if let Some(host) = self.collab.store.find(host_id).await? {
                if host.owner.is_some_and(|owner| owner != self.ms_id) {
                    return Ok(Target::Remote(host, hooks));
                }
            }
        }
        Ok(Target::Absent)
    }

    /// Drop the agent's connection so that it connects again.
    pub async fn reconnect(&self, host_id: HostId) -> Result<()> {
        let host = self
            .collab
            .store
            .find(host_id)
            .await?
            .ok_or(AgentError::HostNotFound(host_id))?;

        match host.status {
            HostStatus::Disconnected => {
                debug!(host_id, "host already disconnected");
                return Ok(());
            }
            HostStatus::Up | HostStatus::Alert | HostStatus::Rebalancing => {}
            status => {
                return Err(AgentError::InvalidHostState {
                    host_id,
                    status,
                    action: "reconnect",
                });
            }
        }

        let attache = match self.resolve(host_id).await? {
            Target::Remote(host, hooks) => {
                return hooks
                    .propagate_resource_event(&host, ResourceEvent::Reconnect)
                    .await;
            }
            Target::Local(attache) => attache,
            Target::Absent => {
                return Err(AgentError::unavailable(
                    host_id,
                    "Unable to disconnect host because it is not connected to this server",
                ));
            }
        };

        info!(host_id, "reconnecting agent");
        self.disconnect_attache_without_investigation(&attache, HostEvent::ShutdownRequested, true)
            .await?;

        if host.direct {
            self.collab.store.set_owner(host_id, Some(self.ms_id)).await?;
            let host = self
                .collab
                .store
                .find(host_id)
                .await?
                .ok_or(AgentError::HostNotFound(host_id))?;
            self.load_direct_host(&host, true).await?;
        }
        Ok(())
    }

    /// Restrict the agent to maintenance commands and release its held
    /// requests.
    pub async fn pull_agent_to_maintenance(&self, host_id: HostId) -> Result<()> {
        match self.resolve(host_id).await? {
            Target::Local(attache) => {
                info!(host_id, "agent entering maintenance");
                attache.set_maintenance(true);
                attache.cancel_all_commands(HostStatus::Disconnected, false);
                Ok(())
            }
            Target::Remote(host, hooks) => {
                hooks
                    .propagate_resource_event(&host, ResourceEvent::EnterMaintenance)
                    .await
            }
            Target::Absent => Ok(()),
        }
    }

    pub async fn pull_agent_out_of_maintenance(&self, host_id: HostId) -> Result<()> {
        match self.resolve(host_id).await? {
            Target::Local(attache) => {
                info!(host_id, "agent leaving maintenance");
                attache.set_maintenance(false);
                Ok(())
            }
            Target::Remote(host, hooks) => {
                hooks
                    .propagate_resource_event(&host, ResourceEvent::ExitMaintenance)
                    .await
            }
            Target::Absent => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Host status
    // ------------------------------------------------------------------

    /// Apply `event` to the stored host status. The update is conditional
    /// on the status read, and retried once if the host changed meanwhile.
    pub async fn transition_host(&self, host_id: HostId, event: HostEvent) -> Result<HostStatus> {
        for _ in 0..2 {
            let host = self
                .collab
                .store
                .find(host_id)
                .await?
                .ok_or(AgentError::HostNotFound(host_id))?;
            let next = status::transition(host_id, host.status, event)?;
            let owner = status::owner_after(next, self.ms_id);
            if self
                .collab
                .store
                .update_status(host_id, host.status, next, owner)
                .await?
            {
                if host.status != next {
                    info!(host_id, from = %host.status, to = %next, %event, "host status changed");
                }
                return Ok(next);
            }
            debug!(host_id, %event, "host changed concurrently, retrying transition");
        }
        Err(AgentError::Store(format!(
            "host {host_id} kept changing while applying {event}"
        )))
    }

    /// Disconnect the local attache for a host and apply `event` as is.
    pub async fn disconnect_without_investigation(
        &self,
        host_id: HostId,
        event: HostEvent,
    ) -> Result<()> {
        match self.find_attache(host_id) {
            Some(attache) => {
                self.disconnect_attache_without_investigation(&attache, event, true)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Disconnect the local attache for a host, investigating first when
    /// the event would put the host in Alert.
    pub async fn disconnect_with_investigation(
        &self,
        host_id: HostId,
        event: HostEvent,
    ) -> Result<()> {
        match self.find_attache(host_id) {
            Some(attache) => {
                self.disconnect_attache_with_investigation(&attache, event)
                    .await
            }
            None => Ok(()),
        }
    }

    pub(crate) async fn disconnect_attache_without_investigation(
        &self,
        attache: &Arc<Attache>,
        event: HostEvent,
        transit: bool,
    ) -> Result<()> {
        let host_id = attache.id();
        if attache.forwards() {
            self.remove_agent(attache, HostStatus::Disconnected);
            return Ok(());
        }

        // A removed host has no status left to move.
        let host = match self.collab.store.find(host_id).await? {
            Some(host) if host.status != HostStatus::Removed => host,
            _ => {
                debug!(host_id, %event, "host is removed, dropping its attache");
                self.remove_agent(attache, HostStatus::Removed);
                return Ok(());
            }
        };
        let next = match host.status {
            HostStatus::Down | HostStatus::Alert => host.status,
            current => match status::transition(host_id, current, event) {
                Ok(next) => next,
                Err(e) => {
                    error!(host_id, error = %e, "unable to disconnect agent");
                    self.remove_agent(attache, current);
                    return Err(e);
                }
            },
        };

        info!(host_id, %event, %next, "disconnecting agent");
        self.remove_agent(attache, next);
        metrics::record_disconnect(&event.to_string());

        if transit {
            self.transition_host(host_id, event).await?;
        }

        if transit && event != HostEvent::StartAgentRebalance {
            if let Some(hooks) = self.hooks() {
                tokio::spawn(async move {
                    hooks.agent_disconnected(host_id, event).await;
                });
            }
        }
        Ok(())
    }

    /// Decide what really happened to an agent that stopped answering.
    async fn investigate(&self, host: &HostRecord) -> Option<HostStatus> {
        if host.host_type.is_virtual() {
            return Some(HostStatus::Alert);
        }
        let wait = self.cfg(|c| c.check_health_wait_secs);
        let check = Command::check_health().with_wait(wait);
        if self.easy_send(host.id, check).await.is_some() {
            return Some(HostStatus::Up);
        }
        self.collab.ha.investigate(host).await
    }

    async fn alert(&self, host: &HostRecord, subject: String, body: &str) {
        self.collab
            .alerts
            .send_alert(AlertKind::Host, host.zone_id, host.pod_id, &subject, body)
            .await;
    }

    pub(crate) async fn disconnect_attache_with_investigation(
        &self,
        attache: &Arc<Attache>,
        mut event: HostEvent,
    ) -> Result<()> {
        let host_id = attache.id();
        if let Some(host) = self.collab.store.find(host_id).await? {
            if status::next_status(host.status, event) == Some(HostStatus::Alert) {
                let alert_wait = self.cfg(|c| c.alert_wait_secs) as i64;
                let waited_too_long = now_secs() - host.last_ping > alert_wait;

                let determined = match self.investigate(&host).await {
                    Some(status) => status,
                    None if waited_too_long => HostStatus::Alert,
                    None => {
                        debug!(host_id, "investigation inconclusive, waiting");
                        return Ok(());
                    }
                };
                info!(host_id, %determined, "investigation finished");

                match determined {
                    HostStatus::Down => {
                        if !host.host_type.is_virtual() {
                            self.alert(
                                &host,
                                format!("Host is down, name: {} (id:{host_id})", host.name),
                                "Host is down",
                            )
                            .await;
                        }
                        event = HostEvent::HostDown;
                    }
                    HostStatus::Up => {
                        self.transition_host(host_id, HostEvent::Ping).await?;
                        return Ok(());
                    }
                    HostStatus::Disconnected => {
                        let preparing = host.resource_state
                            == agent_manager_types::ResourceState::PrepareForMaintenance;
                        if host.status == HostStatus::Disconnected
                            || (host.status == HostStatus::Up && preparing)
                        {
                            if !waited_too_long {
                                return Ok(());
                            }
                            event = HostEvent::WaitedTooLong;
                        } else if host.status == HostStatus::Up {
                            self.alert(
                                &host,
                                format!("Host disconnected, name: {} (id:{host_id})", host.name),
                                "Host disconnected",
                            )
                            .await;
                            event = HostEvent::AgentDisconnected;
                        }
                    }
                    _ => {
                        self.alert(
                            &host,
                            format!("Host in ALERT state, name: {} (id:{host_id})", host.name),
                            "Host in ALERT state",
                        )
                        .await;
                    }
                }
            } else {
                debug!(host_id, %event, "next status is not Alert, no investigation");
            }
        }

        self.disconnect_attache_without_investigation(attache, event, true)
            .await?;

        if let Some(host) = self.collab.store.find(host_id).await? {
            if host.status == HostStatus::Down {
                self.collab.ha.schedule_restart(&host, true).await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connecting agents
    // ------------------------------------------------------------------

    /// Build the resource for a direct host and connect it.
    pub async fn load_direct_host(&self, host: &HostRecord, force: bool) -> Result<()> {
        let resource = self.collab.resources.load(host).await?;
        self.connect_direct(host, resource, force).await
    }

    /// Connect a direct host through an already built resource.
    pub async fn connect_direct(
        &self,
        host: &HostRecord,
        resource: Arc<dyn ServerResource>,
        force: bool,
    ) -> Result<()> {
        let startup = resource.initialize().await?;
        let attache = Attache::direct(
            host.id,
            host.name.clone(),
            self.attache_context(),
            resource,
            self.direct_pools.clone(),
        );
        attache.set_maintenance(host.resource_state.is_maintenance());
        self.install(attache.clone());
        self.finish_connect(&attache, &startup, force).await
    }

    /// The part of the handshake that follows installing the attache:
    /// mark the host connecting, consult the connect listeners, then send
    /// the ready command.
    pub(crate) async fn finish_connect(
        &self,
        attache: &Arc<Attache>,
        startup: &Command,
        force: bool,
    ) -> Result<()> {
        let host_id = attache.id();
        if let Err(e) = self
            .transition_host(host_id, HostEvent::AgentConnected)
            .await
        {
            warn!(host_id, error = %e, "unable to mark host connecting");
            self.remove_agent(attache, HostStatus::Disconnected);
            return Err(e);
        }
        self.pings.insert(host_id, Instant::now());

        let host = self
            .collab
            .store
            .find(host_id)
            .await?
            .ok_or(AgentError::HostNotFound(host_id))?;

        if let Err(refusal) = self.listeners.notify_connect(&host, startup, force).await {
            let event = match refusal {
                ConnectionError::Setup(_) => HostEvent::AgentDisconnected,
                ConnectionError::Declined(_) => HostEvent::ShutdownRequested,
            };
            warn!(host_id, error = %refusal, "connection refused by listener");
            if let Err(e) = self
                .disconnect_attache_without_investigation(attache, event, true)
                .await
            {
                warn!(host_id, error = %e, "unable to disconnect refused agent");
            }
            return Err(AgentError::ConnectionSetup {
                host_id,
                source: refusal,
            });
        }

        let wait = self.cfg(|c| c.ready_wait_secs);
        let ready = Command::ready(host_id, self.ms_id).with_wait(wait);
        if self.easy_send(host_id, ready).await.is_none() {
            warn!(host_id, "agent did not acknowledge ready");
            self.disconnect_attache_without_investigation(
                attache,
                HostEvent::AgentDisconnected,
                true,
            )
            .await?;
            return Err(AgentError::unavailable(
                host_id,
                "agent did not acknowledge the ready command",
            ));
        }

        attache.ready();
        self.transition_host(host_id, HostEvent::Ready).await?;
        info!(host_id, name = attache.name(), kind = ?attache.kind(), "agent is up");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agent-originated requests
    // ------------------------------------------------------------------

    async fn handle_ping(&self, host_id: HostId) {
        self.pings.insert(host_id, Instant::now());
        if let Err(e) = self.collab.store.record_ping(host_id, now_secs()).await {
            warn!(host_id, error = %e, "unable to record ping");
            return;
        }
        match self.collab.store.find(host_id).await {
            Ok(Some(host)) if matches!(host.status, HostStatus::Alert | HostStatus::Disconnected) => {
                if let Err(e) = self.transition_host(host_id, HostEvent::Ping).await {
                    warn!(host_id, error = %e, "unable to recover host on ping");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(host_id, error = %e, "unable to look up pinging host"),
        }
    }

    /// Answer the commands of a request an agent sent us.
    pub(crate) async fn handle_agent_commands(
        &self,
        attache: &Arc<Attache>,
        req: &Request,
    ) -> Vec<Answer> {
        let host_id = attache.id();
        let mut answers = Vec::with_capacity(req.commands.len());
        for cmd in &req.commands {
            let answer = match cmd.name.as_str() {
                names::PING => {
                    self.handle_ping(host_id).await;
                    Answer::success(cmd)
                }
                names::SHUTDOWN => {
                    info!(host_id, "agent is shutting down");
                    if let Some(me) = self.self_ref.upgrade() {
                        let attache = attache.clone();
                        tokio::spawn(async move {
                            if let Err(e) = me
                                .disconnect_attache_without_investigation(
                                    &attache,
                                    HostEvent::ShutdownRequested,
                                    true,
                                )
                                .await
                            {
                                warn!(host_id, error = %e, "unable to disconnect agent on shutdown");
                            }
                        });
                    }
                    Answer::success(cmd)
                }
                _ => match self
                    .listeners
                    .notify_commands(host_id, req.seq, std::slice::from_ref(cmd))
                {
                    Dispatch::Handled => Answer::success(cmd),
                    Dispatch::Veto => Answer::failure(cmd, "Command was refused"),
                    Dispatch::NotHandled => Answer::unsupported(cmd),
                },
            };
            answers.push(answer);
        }
        answers
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop the background loops, let go of every agent, and hand the
    /// hosts this node owns back through ManagementServerDown.
    pub async fn stop(&self) {
        info!(ms_id = self.ms_id, "stopping agent manager");
        self.shutdown.cancel();
        self.timers.shutdown();

        let attaches: Vec<Arc<Attache>> = self.agents.iter().map(|e| e.value().clone()).collect();
        for attache in attaches {
            if let Err(e) = self
                .disconnect_attache_without_investigation(
                    &attache,
                    HostEvent::ManagementServerDown,
                    true,
                )
                .await
            {
                warn!(host_id = attache.id(), error = %e, "unable to disconnect agent on stop");
            }
        }

        match self.collab.store.list_by_owner(self.ms_id).await {
            Ok(hosts) => {
                for host in hosts {
                    if let Err(e) = self
                        .transition_host(host.id, HostEvent::ManagementServerDown)
                        .await
                    {
                        warn!(host_id = host.id, error = %e, "unable to release host");
                    }
                }
            }
            Err(e) => warn!(error = %e, "unable to list owned hosts"),
        }
    }
}

#[async_trait]
impl AttacheEvents for AgentManager {
    fn answers_received(&self, host_id: HostId, resp: &Response) {
        self.listeners.notify_answers(host_id, resp.seq, &resp.answers);
        if resp.mgmt_id != self.ms_id {
            if let Some(hooks) = self.hooks() {
                let resp = resp.clone();
                tokio::spawn(async move {
                    hooks.route_answer(resp).await;
                });
            } else {
                debug!(host_id, seq = resp.seq, origin = resp.mgmt_id, "answer for another node dropped");
            }
        }
    }

    async fn commands_received(&self, attache: Arc<Attache>, req: Request) -> Vec<Answer> {
        self.handle_agent_commands(&attache, &req).await
    }
}
