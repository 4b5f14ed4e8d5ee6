// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Clustered agent manager
//!
//! [`ClusterManager`] sits on top of an [`AgentManager`] and connects it to
//! the other management servers. It installs forwarding attaches for hosts
//! owned by a peer, executes requests peers forward to agents owned here,
//! answers the node-to-node control commands and runs the rebalance
//! protocol.
//!
//! Peers talk over the same framed codec agents use. Every connection
//! carries traffic both ways: control requests are answered on the link
//! they arrived on, while answers to forwarded requests travel back over
//! this node's outbound link to the origin.

mod peer;
mod rebalance;
pub mod tls;

pub use peer::PeerPool;
pub use rebalance::{HostTransfer, TransferState, plan_rebalance};

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use agent_manager_types::{
    Answer, CancelPayload, ChangeAgentPayload, Command, HostEvent, HostId, HostRecord, HostStatus,
    MsId, PropagateResourceEventPayload, ResourceEvent, TransferAgentPayload, TransferPhase,
    names,
};
use agent_wire::{AgentCodec, Frame, Request, Response};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use self::peer::{PeerLink, PeerStream};
use self::tls::PeerTls;
use crate::attache::{Attache, FORWARD_ATTEMPTS, PeerRouter, run_writer};
use crate::config::ManagerConfig;
use crate::error::{AgentError, Result};
use crate::manager::{AgentManager, ClusterHooks};

/// A control command carrying a typed payload.
fn control_command<T: Serialize>(name: &str, payload: &T) -> Command {
    Command::new(name, serde_json::to_value(payload).unwrap_or_default())
}

fn decode<T: DeserializeOwned>(cmd: &Command) -> std::result::Result<T, Answer> {
    cmd.payload_as()
        .map_err(|e| Answer::failure(cmd, format!("Invalid {} payload: {e}", cmd.name)))
}

fn answer_from(cmd: &Command, result: Result<()>) -> Answer {
    match result {
        Ok(()) => Answer::success(cmd),
        Err(e) => Answer::failure(cmd, e.to_string()),
    }
}

/// Node and sequence number a forwarded request arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ForwardedOrigin {
    ms_id: MsId,
    seq: u64,
}

pub struct ClusterManager {
    manager: Arc<AgentManager>,
    pool: PeerPool,
    transfers: DashMap<HostId, HostTransfer>,
    /// Forwarded requests running on local attaches, keyed by agent and
    /// the local sequence number they were given
    forwarded: DashMap<(HostId, u64), ForwardedOrigin>,
    lb_triggered: AtomicBool,
    self_ref: Weak<ClusterManager>,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("ms_id", &self.manager.ms_id())
            .field("pool", &self.pool)
            .field("transfers", &self.transfers.len())
            .finish_non_exhaustive()
    }
}

impl ClusterManager {
    /// Wrap `manager` and install the cluster hooks on it.
    pub fn new(manager: Arc<AgentManager>, tls: Option<Arc<PeerTls>>) -> Arc<Self> {
        let peers = manager.cfg(|c| c.cluster_peers.clone());
        let cluster = Arc::new_cyclic(|me| ClusterManager {
            manager: manager.clone(),
            pool: PeerPool::new(&peers, tls),
            transfers: DashMap::new(),
            forwarded: DashMap::new(),
            lb_triggered: AtomicBool::new(false),
            self_ref: me.clone(),
        });
        let hooks: Weak<dyn ClusterHooks> = Arc::downgrade(&cluster) as Weak<dyn ClusterHooks>;
        manager.set_cluster_hooks(hooks);
        info!(ms_id = manager.ms_id(), peers = ?cluster.pool.peer_ids(), "cluster manager ready");
        cluster
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    pub fn ms_id(&self) -> MsId {
        self.manager.ms_id()
    }

    pub fn peer_ids(&self) -> Vec<MsId> {
        self.pool.peer_ids()
    }

    pub fn transfer(&self, host_id: HostId) -> Option<HostTransfer> {
        self.transfers.get(&host_id).map(|e| e.value().clone())
    }

    // ------------------------------------------------------------------
    // Peer connections
    // ------------------------------------------------------------------

    /// Start the writer and reader tasks for a peer connection and return
    /// its sending half.
    fn attach_stream(self: &Arc<Self>, stream: PeerStream, peer: Option<MsId>) -> PeerLink {
        let (sink, mut frames) = AgentCodec::default().framed(stream).split();
        let closed = self.manager.shutdown_token().child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(sink, rx, closed.clone()));
        let link = PeerLink::new(tx, closed.clone());

        let me = self.clone();
        let reader_link = link.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = frames.next() => frame,
                };
                match frame {
                    None => break,
                    Some(Err(e)) => {
                        warn!(?peer, error = %e, "unable to read from peer");
                        break;
                    }
                    Some(Ok(frame)) => me.handle_frame(frame, &reader_link).await,
                }
            }
            debug!(?peer, "peer connection closed");
            closed.cancel();
        });
        link
    }

    /// The live link to `peer`, dialing it if there is none.
    async fn link_to(self: &Arc<Self>, peer: MsId) -> Result<PeerLink> {
        if let Some(link) = self.pool.cached(peer) {
            return Ok(link);
        }
        debug!(peer, "connecting to peer");
        let stream = self.pool.dial(peer).await?;
        let link = self.attach_stream(stream, Some(peer));
        Ok(self.pool.insert(peer, link))
    }

    async fn send_to_peer(self: &Arc<Self>, peer: MsId, frame: Frame) -> Result<()> {
        let link = self.link_to(peer).await?;
        if link.send(frame) {
            Ok(())
        } else {
            self.pool.drop_link(peer);
            Err(AgentError::peer_io(peer, "peer link closed"))
        }
    }

    /// Send a control command about `host_id` to `peer` and wait for its
    /// answer. Connection failures are retried on a fresh link; a peer
    /// that does not answer in time is not asked again.
    pub async fn call(&self, peer: MsId, host_id: HostId, command: Command) -> Result<Answer> {
        let Some(me) = self.self_ref.upgrade() else {
            return Err(AgentError::peer_io(peer, "cluster manager is shutting down"));
        };
        let wait = self.manager.cfg(ManagerConfig::peer_request_timeout);
        let mut last_error = String::new();

        for attempt in 1..=FORWARD_ATTEMPTS {
            let link = match me.link_to(peer).await {
                Ok(link) => link,
                Err(e) => {
                    debug!(peer, attempt, error = %e, "unable to reach peer");
                    last_error = e.to_string();
                    continue;
                }
            };

            let seq = self.pool.next_seq();
            let reply = self.pool.expect_reply(seq);
            let req = Request::control(host_id, self.ms_id(), seq, command.clone());
            if !link.send(Frame::Request(req)) {
                self.pool.forget(seq);
                self.pool.drop_link(peer);
                last_error = "peer link closed".to_string();
                continue;
            }

            return match tokio::time::timeout(wait, reply).await {
                Ok(Ok(resp)) => resp
                    .answer()
                    .cloned()
                    .ok_or_else(|| AgentError::peer_io(peer, "control reply without an answer")),
                Ok(Err(_)) => Err(AgentError::peer_io(peer, "control reply dropped")),
                Err(_) => {
                    self.pool.forget(seq);
                    Err(AgentError::peer_io(
                        peer,
                        format!("no answer to {} within {wait:?}", command.name),
                    ))
                }
            };
        }

        Err(AgentError::peer_io(
            peer,
            format!("unreachable after {FORWARD_ATTEMPTS} attempts: {last_error}"),
        ))
    }

    /// Accept peer connections until the manager is stopped.
    pub async fn run_peer_acceptor(self: Arc<Self>, listener: TcpListener) {
        info!(address = ?listener.local_addr().ok(), "accepting peer connections");
        let shutdown = self.manager.shutdown_token();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (socket, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "unable to accept peer connection");
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                debug!(%addr, error = %e, "unable to set TCP_NODELAY");
            }

            let me = self.clone();
            tokio::spawn(async move {
                let stream: PeerStream = match me.pool.tls() {
                    Some(tls) => match tls.accept(socket).await {
                        Ok(stream) => Box::new(stream),
                        Err(e) => {
                            warn!(%addr, error = %e, "peer TLS handshake failed");
                            return;
                        }
                    },
                    None => Box::new(socket),
                };
                debug!(%addr, "peer connection accepted");
                me.attach_stream(stream, None);
            });
        }
        info!("peer acceptor stopped");
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_frame(self: &Arc<Self>, frame: Frame, link: &PeerLink) {
        match frame {
            Frame::Response(resp) if resp.control => {
                if !self.pool.complete(resp) {
                    debug!("control reply nobody is waiting for");
                }
            }
            Frame::Response(resp) => self.deliver_forwarded_answer(&resp),
            Frame::Request(req) if req.control => {
                // Control commands can take a while (a transfer start loads
                // the agent), so they must not hold up the reader.
                let me = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    let answer = me.dispatch_control(&req).await;
                    if !link.send(Frame::Response(Response::for_request(&req, vec![answer]))) {
                        debug!(host_id = req.agent_id, seq = req.seq, "unable to answer peer");
                    }
                });
            }
            // Forwarded requests run inline to keep their arrival order.
            Frame::Request(req) => self.execute_forwarded(req, link).await,
        }
    }

    /// Run a request a peer forwarded for an agent connected here. A
    /// request that cannot be delivered is answered with failures on the
    /// link it came in on; it is never relayed again.
    async fn execute_forwarded(&self, req: Request, link: &PeerLink) {
        let host_id = req.agent_id;
        let local = self
            .manager
            .find_attache(host_id)
            .filter(|attache| !attache.forwards());
        let result = match local {
            Some(attache) => self.run_forwarded(&attache, &req).await,
            None => Err(AgentError::unavailable(
                host_id,
                "Agent is not connected to this management server",
            )),
        };

        if let Err(e) = result {
            info!(host_id, seq = req.seq, error = %e, "forwarded request failed");
            let answers = req
                .commands
                .iter()
                .map(|cmd| Answer::failure(cmd, e.to_string()))
                .collect();
            if !link.send(Frame::Response(Response::for_request(&req, answers))) {
                debug!(host_id, seq = req.seq, "unable to report forward failure");
            }
        }
    }

    /// Send a forwarded request under a number from the local attache's
    /// own counter, so it cannot collide with requests from this node or
    /// other peers. The answer is numbered back in `route_answer`.
    async fn run_forwarded(&self, attache: &Arc<Attache>, req: &Request) -> Result<()> {
        let host_id = req.agent_id;
        let origin = ForwardedOrigin {
            ms_id: req.mgmt_id,
            seq: req.seq,
        };
        if self.local_seq(host_id, origin).is_some() {
            return Err(AgentError::unavailable(
                host_id,
                format!(
                    "Request {} from management server {} is already running",
                    origin.seq, origin.ms_id
                ),
            ));
        }

        let mut local = req.clone();
        local.seq = attache.next_sequence();
        self.forwarded.insert((host_id, local.seq), origin);
        debug!(
            host_id,
            seq = local.seq,
            origin = origin.ms_id,
            origin_seq = origin.seq,
            "executing forwarded request"
        );
        let seq = local.seq;
        let result = attache.send(local, None).await;
        if result.is_err() {
            self.forwarded.remove(&(host_id, seq));
        }
        result
    }

    fn local_seq(&self, host_id: HostId, origin: ForwardedOrigin) -> Option<u64> {
        self.forwarded
            .iter()
            .find(|e| e.key().0 == host_id && *e.value() == origin)
            .map(|e| e.key().1)
    }

    /// Renumber an answer for a forwarded request with the origin's
    /// sequence number.
    fn answer_for_origin(&self, mut resp: Response) -> Response {
        if let Some((_, origin)) = self.forwarded.remove(&(resp.agent_id, resp.seq)) {
            resp.seq = origin.seq;
        }
        resp
    }

    /// Forwarded requests for `host_id` still waiting for their answer.
    fn forwarded_in_flight(&self, host_id: HostId) -> usize {
        self.forwarded
            .iter()
            .filter(|e| e.key().0 == host_id)
            .count()
    }

    fn deliver_forwarded_answer(&self, resp: &Response) {
        match self.manager.find_attache(resp.agent_id) {
            Some(attache) if attache.forwards() => attache.deliver(resp),
            _ => debug!(
                host_id = resp.agent_id,
                seq = resp.seq,
                "answer for an agent with no forwarding attache"
            ),
        }
    }

    /// Answer one node-to-node control command.
    pub async fn dispatch_control(self: &Arc<Self>, req: &Request) -> Answer {
        let Some(cmd) = req.first_command() else {
            return Answer::failure(&Command::new("", Value::Null), "Empty control request");
        };
        debug!(host_id = req.agent_id, command = %cmd.name, origin = req.mgmt_id, "control command");

        match cmd.name.as_str() {
            names::CANCEL => {
                let payload: CancelPayload = match decode(cmd) {
                    Ok(p) => p,
                    Err(answer) => return answer,
                };
                let origin = ForwardedOrigin {
                    ms_id: req.mgmt_id,
                    seq: payload.seq,
                };
                let Some(seq) = self.local_seq(req.agent_id, origin) else {
                    debug!(host_id = req.agent_id, seq = payload.seq, "nothing to cancel");
                    return Answer::success(cmd);
                };
                self.forwarded.remove(&(req.agent_id, seq));
                if let Some(attache) = self.manager.find_attache(req.agent_id) {
                    if !attache.forwards() {
                        info!(host_id = req.agent_id, seq, origin_seq = payload.seq, reason = %payload.reason, "peer cancelled request");
                        attache.cancel(seq);
                    }
                }
                Answer::success(cmd)
            }
            names::CHANGE_AGENT => {
                let payload: ChangeAgentPayload = match decode(cmd) {
                    Ok(p) => p,
                    Err(answer) => return answer,
                };
                self.on_agent_changed(payload.host_id, payload.event);
                Answer::success(cmd)
            }
            names::TRANSFER_AGENT => {
                let payload: TransferAgentPayload = match decode(cmd) {
                    Ok(p) => p,
                    Err(answer) => return answer,
                };
                match payload.phase {
                    TransferPhase::Request => answer_from(cmd, self.accept_transfer(&payload)),
                    TransferPhase::Start => {
                        answer_from(cmd, self.load_transferred_host(&payload).await)
                    }
                }
            }
            names::PROPAGATE_RESOURCE_EVENT => {
                let payload: PropagateResourceEventPayload = match decode(cmd) {
                    Ok(p) => p,
                    Err(answer) => return answer,
                };
                answer_from(
                    cmd,
                    self.apply_resource_event(payload.host_id, payload.event)
                        .await,
                )
            }
            _ => Answer::unsupported(cmd),
        }
    }

    /// A peer dropped its connection to an agent. Forget the forwarding
    /// attache so the next send looks the owner up again.
    fn on_agent_changed(&self, host_id: HostId, event: HostEvent) {
        if self.transfers.contains_key(&host_id) {
            debug!(host_id, %event, "agent is being transferred, ignoring change");
            return;
        }
        match self.manager.find_attache(host_id) {
            Some(attache) if attache.forwards() => {
                info!(host_id, %event, "peer lost agent, dropping forwarding attache");
                self.manager
                    .remove_agent(&attache, HostStatus::Disconnected);
            }
            _ => {}
        }
    }

    async fn apply_resource_event(&self, host_id: HostId, event: ResourceEvent) -> Result<()> {
        let held_here = self
            .manager
            .find_attache(host_id)
            .is_some_and(|attache| !attache.forwards());
        if !held_here {
            return Err(AgentError::unavailable(
                host_id,
                "Agent is not connected to this management server",
            ));
        }
        info!(host_id, %event, "applying resource event from peer");
        match event {
            ResourceEvent::EnterMaintenance => self.manager.pull_agent_to_maintenance(host_id).await,
            ResourceEvent::ExitMaintenance => {
                self.manager.pull_agent_out_of_maintenance(host_id).await
            }
            ResourceEvent::Reconnect => self.manager.reconnect(host_id).await,
        }
    }

    // ------------------------------------------------------------------
    // Peer departure and shutdown
    // ------------------------------------------------------------------

    /// Release everything tied to a peer that left the cluster: its link,
    /// transfers it took part in, forwarding attaches pointing at it, and
    /// ownership of its hosts.
    pub async fn on_peer_left(&self, peer: MsId) {
        info!(peer, "peer left the cluster");
        self.pool.drop_link(peer);
        self.forwarded.retain(|_, origin| origin.ms_id != peer);

        let stale: Vec<HostTransfer> = self
            .transfers
            .iter()
            .filter(|e| e.current_owner == peer || e.future_owner == peer)
            .map(|e| e.value().clone())
            .collect();
        for transfer in stale {
            warn!(host_id = transfer.host_id, peer, "transfer failed, peer left");
            self.fail_rebalance(&transfer).await;
        }

        let hosts = match self.manager.store().list_by_owner(peer).await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!(peer, error = %e, "unable to list hosts of departed peer");
                return;
            }
        };
        for host in hosts {
            if let Some(attache) = self.manager.find_attache(host.id) {
                if attache.forwards() {
                    self.manager
                        .remove_agent(&attache, HostStatus::Disconnected);
                }
            }
            if let Err(e) = self
                .manager
                .transition_host(host.id, HostEvent::ManagementServerDown)
                .await
            {
                warn!(host_id = host.id, peer, error = %e, "unable to release host of departed peer");
            }
        }
    }

    /// A forwarding attache for `host`, not yet installed.
    fn forwarding_attache(&self, host: &HostRecord) -> Arc<Attache> {
        let router = Arc::new(ClusterRouter {
            cluster: self.self_ref.clone(),
        });
        Attache::forwarding(
            host.id,
            host.name.clone(),
            self.manager.attache_context(),
            router,
        )
    }

    /// Stop the manager and close every peer link.
    pub async fn stop(&self) {
        self.manager.stop().await;
        self.pool.close_all();
    }
}

#[async_trait]
impl ClusterHooks for ClusterManager {
    fn create_forwarding_attache(&self, host: &HostRecord) -> Arc<Attache> {
        if let Some(existing) = self.manager.find_attache(host.id) {
            if existing.forwards() {
                return existing;
            }
        }
        let attache = self.forwarding_attache(host);
        debug!(host_id = host.id, owner = ?host.owner, "installing forwarding attache");
        self.manager.install(attache.clone());
        attache
    }

    async fn route_answer(&self, resp: Response) {
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        let resp = self.answer_for_origin(resp);
        let (origin, host_id, seq) = (resp.mgmt_id, resp.agent_id, resp.seq);
        if let Err(e) = me.send_to_peer(origin, Frame::Response(resp)).await {
            warn!(host_id, seq, origin, error = %e, "unable to route answer to origin");
        }
    }

    async fn agent_disconnected(&self, host_id: HostId, event: HostEvent) {
        self.forwarded.retain(|(id, _), _| *id != host_id);
        let cmd = control_command(names::CHANGE_AGENT, &ChangeAgentPayload { host_id, event });
        let calls = self
            .pool
            .peer_ids()
            .into_iter()
            .map(|peer| {
                let cmd = cmd.clone();
                async move { (peer, self.call(peer, host_id, cmd).await) }
            })
            .collect::<Vec<_>>();
        for (peer, result) in futures::future::join_all(calls).await {
            if let Err(e) = result {
                debug!(host_id, peer, error = %e, "unable to tell peer about disconnect");
            }
        }
    }

    async fn propagate_resource_event(&self, host: &HostRecord, event: ResourceEvent) -> Result<()> {
        let Some(owner) = host.owner else {
            return Err(AgentError::unavailable(host.id, "Host has no owner"));
        };
        info!(host_id = host.id, owner, %event, "propagating resource event to owner");
        let cmd = control_command(
            names::PROPAGATE_RESOURCE_EVENT,
            &PropagateResourceEventPayload {
                host_id: host.id,
                event,
            },
        );
        let answer = self.call(owner, host.id, cmd).await.map_err(|e| {
            AgentError::unavailable(host.id, format!("Unable to reach owner {owner}: {e}"))
        })?;
        if answer.result {
            Ok(())
        } else {
            Err(AgentError::unavailable(
                host.id,
                answer
                    .details
                    .unwrap_or_else(|| format!("Owner {owner} refused {event}")),
            ))
        }
    }

    fn is_transferring(&self, host_id: HostId) -> bool {
        self.transfers.contains_key(&host_id)
    }
}

/// How forwarding attaches reach the peers, through the cluster manager.
struct ClusterRouter {
    cluster: Weak<ClusterManager>,
}

#[async_trait]
impl PeerRouter for ClusterRouter {
    async fn find_owner(&self, host_id: HostId) -> Option<MsId> {
        let cluster = self.cluster.upgrade()?;
        match cluster.manager.store().find(host_id).await {
            Ok(host) => host.and_then(|h| h.owner),
            Err(e) => {
                warn!(host_id, error = %e, "unable to look up owner");
                None
            }
        }
    }

    async fn route_to_peer(&self, peer: MsId, frame: Frame) -> Result<()> {
        let cluster = self
            .cluster
            .upgrade()
            .ok_or_else(|| AgentError::peer_io(peer, "cluster manager is shutting down"))?;
        cluster.send_to_peer(peer, frame).await
    }

    async fn cancel_on_peer(&self, peer: MsId, host_id: HostId, seq: u64, reason: &str) {
        let Some(cluster) = self.cluster.upgrade() else {
            return;
        };
        let cmd = control_command(
            names::CANCEL,
            &CancelPayload {
                seq,
                reason: reason.to_string(),
            },
        );
        if let Err(e) = cluster.call(peer, host_id, cmd).await {
            debug!(host_id, seq, peer, error = %e, "unable to cancel on peer");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::attache::ConnectedLink;
    use crate::config::PeerAddress;
    use crate::host::{Collaborators, MemoryHostStore};
    use agent_manager_types::{Commands, HostType};
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    /// Node 1 of a two-node cluster whose peer, node 2, is not running.
    pub(crate) fn test_config() -> ManagerConfig {
        ManagerConfig {
            ms_id: 1,
            // Nothing listens on the discard port, dials fail fast.
            cluster_peers: vec![PeerAddress {
                ms_id: 2,
                address: "127.0.0.1:9".to_string(),
            }],
            peer_request_timeout_secs: 1,
            ..Default::default()
        }
    }

    pub(crate) fn cluster_with(
        config: ManagerConfig,
        hosts: Vec<HostRecord>,
    ) -> (Arc<ClusterManager>, Arc<MemoryHostStore>) {
        let (_tx, rx) = watch::channel(config);
        let store = Arc::new(MemoryHostStore::new(hosts));
        let manager = AgentManager::new(rx, Collaborators::standalone(store.clone()));
        (ClusterManager::new(manager, None), store)
    }

    pub(crate) fn cluster(hosts: Vec<HostRecord>) -> (Arc<ClusterManager>, Arc<MemoryHostStore>) {
        cluster_with(test_config(), hosts)
    }

    pub(crate) fn host(id: HostId, status: HostStatus, owner: Option<MsId>) -> HostRecord {
        let mut host = HostRecord::new(id, format!("host-{id}"), HostType::Routing);
        host.status = status;
        host.owner = owner;
        host
    }

    pub(crate) fn connected(
        cluster: &ClusterManager,
        id: HostId,
    ) -> (Arc<Attache>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ConnectedLink::new(tx, CancellationToken::new(), None);
        let attache = Attache::connected(
            id,
            format!("host-{id}"),
            cluster.manager.attache_context(),
            link,
        );
        attache.ready();
        cluster.manager.install(attache.clone());
        (attache, rx)
    }

    fn control(host_id: HostId, cmd: Command) -> Request {
        Request::control(host_id, 2, 1, cmd)
    }

    #[tokio::test]
    async fn test_scan_leaves_host_under_transfer_alone() {
        let mut moving = host(8, HostStatus::Disconnected, None);
        moving.direct = true;
        let (cluster, _store) = cluster(vec![moving]);
        let payload = TransferAgentPayload {
            host_id: 8,
            current_owner: 1,
            future_owner: 2,
            phase: TransferPhase::Request,
        };
        cluster.transfers.insert(
            8,
            HostTransfer::new(&payload, TransferState::Requested),
        );

        assert_eq!(cluster.manager.scan_direct_agents().await, 0);
        assert!(cluster.manager.find_attache(8).is_none());
    }

    #[tokio::test]
    async fn test_host_owned_by_peer_gets_forwarding_attache() {
        let (cluster, _store) = cluster(vec![host(7, HostStatus::Up, Some(2))]);
        let attache = cluster.manager.get_attache(7).await.unwrap();
        assert!(attache.forwards());

        // The same attache is reused for later sends.
        let again = cluster.manager.get_attache(7).await.unwrap();
        assert!(Arc::ptr_eq(&attache, &again));
    }

    #[tokio::test]
    async fn test_unknown_control_command_is_unsupported() {
        let (cluster, _store) = cluster(vec![]);
        let answer = cluster
            .dispatch_control(&control(1, Command::new("Reboot", Value::Null)))
            .await;
        assert!(!answer.result);
        assert!(answer.details.unwrap().contains("Reboot"));
    }

    #[tokio::test]
    async fn test_bad_control_payload_fails() {
        let (cluster, _store) = cluster(vec![]);
        let answer = cluster
            .dispatch_control(&control(1, Command::new(names::CANCEL, Value::Null)))
            .await;
        assert!(!answer.result);
        assert!(answer.details.unwrap().starts_with("Invalid Cancel payload"));
    }

    fn forwarded(host_id: HostId, origin_seq: u64) -> Request {
        let mut req = Request::new(
            host_id,
            2,
            origin_seq,
            Commands::single(Command::new(names::STOP, Value::Null).in_sequence()),
        );
        req.forwarded = true;
        req
    }

    #[tokio::test]
    async fn test_peer_cancel_releases_local_request() {
        let (cluster, _store) = cluster(vec![host(4, HostStatus::Up, Some(1))]);
        let (attache, mut rx) = connected(&cluster, 4);
        let (tx, _peer) = mpsc::unbounded_channel();
        let link = PeerLink::new(tx, CancellationToken::new());

        cluster.handle_frame(Frame::Request(forwarded(4, 300)), &link).await;
        let sent = match rx.try_recv().unwrap() {
            Frame::Request(req) => req,
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(attache.current_sequence(), Some(sent.seq));
        assert_eq!(cluster.forwarded_in_flight(4), 1);

        let cmd = control_command(
            names::CANCEL,
            &CancelPayload {
                seq: 300,
                reason: "Timed Out".to_string(),
            },
        );
        let answer = cluster.dispatch_control(&control(4, cmd)).await;
        assert!(answer.result);
        assert_eq!(attache.current_sequence(), None);
        assert_eq!(cluster.forwarded_in_flight(4), 0);
    }

    #[tokio::test]
    async fn test_forwarded_requests_sharing_a_seq_do_not_collide() {
        let (cluster, _store) = cluster(vec![host(4, HostStatus::Up, Some(1))]);
        let (attache, mut agent) = connected(&cluster, 4);
        let (tx, mut peer) = mpsc::unbounded_channel();
        let link = PeerLink::new(tx, CancellationToken::new());

        // A local request holds the in-sequence slot, so forwards queue up.
        let local = Request::new(
            4,
            1,
            attache.next_sequence(),
            Commands::single(Command::new(names::STOP, Value::Null).in_sequence()),
        );
        attache.send(local.clone(), None).await.unwrap();
        assert!(agent.try_recv().is_ok());

        cluster.handle_frame(Frame::Request(forwarded(4, 500)), &link).await;
        cluster.handle_frame(Frame::Request(forwarded(4, 500)), &link).await;

        // The repeat is refused on the link it came in on.
        match peer.try_recv().unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.seq, 500);
                assert!(!resp.answers[0].result);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(peer.try_recv().is_err());
        assert_eq!(attache.queue_size(), 1);

        // A request from node 2 numbered like the local one is kept apart.
        cluster
            .handle_frame(Frame::Request(forwarded(4, local.seq)), &link)
            .await;
        assert!(peer.try_recv().is_err());
        assert_eq!(attache.queue_size(), 2);
        assert_eq!(cluster.forwarded_in_flight(4), 2);

        // Finish the local request; the first forward goes out renumbered.
        let answers = local.commands.iter().map(Answer::success).collect();
        attache.deliver(&Response::for_request(&local, answers));
        let sent = match agent.try_recv().unwrap() {
            Frame::Request(req) => req,
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(sent.mgmt_id, 2);
        assert_ne!(sent.seq, 500);
        assert_ne!(sent.seq, local.seq);

        // Its answer goes back under the number node 2 chose.
        let answers = sent.commands.iter().map(Answer::success).collect();
        let back = cluster.answer_for_origin(Response::for_request(&sent, answers));
        assert_eq!(back.seq, 500);
        assert_eq!(back.mgmt_id, 2);
        assert_eq!(cluster.forwarded_in_flight(4), 1);
    }

    #[tokio::test]
    async fn test_change_agent_drops_forwarding_attache_only() {
        let (cluster, _store) = cluster(vec![
            host(7, HostStatus::Up, Some(2)),
            host(8, HostStatus::Up, Some(1)),
        ]);
        let forwarding = cluster.manager.get_attache(7).await.unwrap();
        let (local, _rx) = connected(&cluster, 8);

        for host_id in [7, 8] {
            let cmd = control_command(
                names::CHANGE_AGENT,
                &ChangeAgentPayload {
                    host_id,
                    event: HostEvent::AgentDisconnected,
                },
            );
            assert!(cluster.dispatch_control(&control(host_id, cmd)).await.result);
        }

        assert!(forwarding.is_closed());
        assert!(cluster.manager.find_attache(7).is_none());
        assert!(!local.is_closed());
        assert!(cluster.manager.find_attache(8).is_some());
    }

    #[tokio::test]
    async fn test_resource_event_for_agent_not_held_here_fails() {
        let (cluster, _store) = cluster(vec![host(5, HostStatus::Up, Some(2))]);
        let cmd = control_command(
            names::PROPAGATE_RESOURCE_EVENT,
            &PropagateResourceEventPayload {
                host_id: 5,
                event: ResourceEvent::EnterMaintenance,
            },
        );
        let answer = cluster.dispatch_control(&control(5, cmd)).await;
        assert!(!answer.result);
        assert!(answer.details.unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_resource_event_applied_to_local_agent() {
        let (cluster, _store) = cluster(vec![host(5, HostStatus::Up, Some(1))]);
        let (attache, _rx) = connected(&cluster, 5);
        let cmd = control_command(
            names::PROPAGATE_RESOURCE_EVENT,
            &PropagateResourceEventPayload {
                host_id: 5,
                event: ResourceEvent::EnterMaintenance,
            },
        );
        assert!(cluster.dispatch_control(&control(5, cmd)).await.result);
        assert!(attache.in_maintenance());
    }

    #[tokio::test]
    async fn test_forwarded_request_without_local_agent_is_answered_with_failure() {
        let (cluster, _store) = cluster(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = PeerLink::new(tx, CancellationToken::new());
        let mut req = Request::new(
            12,
            2,
            900,
            Commands::single(Command::new(names::STOP, Value::Null)),
        );
        req.forwarded = true;

        cluster.handle_frame(Frame::Request(req), &link).await;
        match rx.try_recv().unwrap() {
            Frame::Response(resp) => {
                assert_eq!(resp.seq, 900);
                assert_eq!(resp.mgmt_id, 2);
                assert!(!resp.answers[0].result);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_left_releases_its_hosts() {
        let (cluster, store) = cluster(vec![
            host(7, HostStatus::Up, Some(2)),
            host(8, HostStatus::Alert, Some(2)),
            host(9, HostStatus::Up, Some(1)),
        ]);
        let forwarding = cluster.manager.get_attache(7).await.unwrap();

        cluster.on_peer_left(2).await;

        assert!(forwarding.is_closed());
        assert!(cluster.manager.find_attache(7).is_none());
        let released = store.get(7).unwrap();
        assert_eq!(released.status, HostStatus::Disconnected);
        assert_eq!(released.owner, None);
        assert_eq!(store.get(8).unwrap().status, HostStatus::Alert);
        assert_eq!(store.get(8).unwrap().owner, None);
        assert_eq!(store.get(9).unwrap().owner, Some(1));
    }

    #[tokio::test]
    async fn test_propagation_to_unreachable_owner_is_unavailable() {
        let (cluster, _store) = cluster(vec![host(7, HostStatus::Up, Some(2))]);
        let err = cluster.manager.pull_agent_to_maintenance(7).await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { host_id: 7, .. }));
    }
}
