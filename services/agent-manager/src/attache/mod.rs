// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-agent session objects
//!
//! An [`Attache`] owns everything this node knows about talking to one
//! agent: the sequence counter, the held in-sequence requests, and the
//! listeners waiting on answers. How bytes reach the agent is delegated to
//! a [`Link`]:
//!
//! - [`ConnectedLink`]: the agent holds a socket open to this node
//! - [`DirectLink`]: the agent is driven in-process through a
//!   [`ServerResource`]
//! - [`ForwardingLink`]: another management server owns the agent and
//!   requests are relayed to it
//!
//! At most one in-sequence request per attache is on the wire at a time.
//! Later in-sequence requests wait in a queue sorted by sequence number and
//! go out, lowest first, when the current one is answered, cancelled or
//! times out. Requests that are not in-sequence skip the queue.

mod connected;
mod direct;
mod forward;
mod queue;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use agent_manager_types::{
    Answer, Command, DEFAULT_CONNECTING_DENIED, DEFAULT_MAINTENANCE_ALLOWED, HostId, HostStatus,
    MsId,
};
use agent_wire::{Frame, Request, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use strum::IntoStaticStr;
use tracing::{debug, warn};

pub use connected::{ConnectedLink, run_writer};
pub use direct::{DirectAgentPools, ServerResource};
pub use forward::{FORWARD_ATTEMPTS, PeerRouter};

pub(crate) use direct::DirectLink;
pub(crate) use forward::ForwardingLink;

use crate::config::ManagerConfig;
use crate::error::{AgentError, Result, TimeoutKind};
use crate::listener::{Dispatch, Listener};
use crate::metrics;
use crate::sync_listener::SynchronousListener;
use crate::timer::TimerService;
use queue::{Registration, RequestQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum AttacheKind {
    Connected,
    Direct,
    Forwarding,
}

/// Which commands an attache accepts while in maintenance or while its
/// agent is still connecting.
#[derive(Debug, Clone)]
pub struct AvailabilityPolicy {
    maintenance_allowed: HashSet<String>,
    connecting_denied: HashSet<String>,
}

impl Default for AvailabilityPolicy {
    fn default() -> Self {
        AvailabilityPolicy {
            maintenance_allowed: DEFAULT_MAINTENANCE_ALLOWED
                .iter()
                .map(|s| s.to_string())
                .collect(),
            connecting_denied: DEFAULT_CONNECTING_DENIED
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl AvailabilityPolicy {
    pub fn from_config(config: &ManagerConfig) -> Self {
        AvailabilityPolicy {
            maintenance_allowed: config.maintenance_allowed.iter().cloned().collect(),
            connecting_denied: config.connecting_denied.iter().cloned().collect(),
        }
    }
}

/// Callbacks from an attache into whoever installed it.
#[async_trait]
pub trait AttacheEvents: Send + Sync {
    /// A response arrived and has been offered to the request's own
    /// listener.
    fn answers_received(&self, host_id: HostId, resp: &Response);

    /// The agent sent requests of its own; returns one answer per command.
    async fn commands_received(&self, attache: Arc<Attache>, req: Request) -> Vec<Answer>;
}

/// Collaborators handed to every attache at construction.
#[derive(Clone)]
pub struct AttacheContext {
    pub ms_id: MsId,
    pub timers: TimerService,
    pub events: Weak<dyn AttacheEvents>,
    pub policy: Arc<AvailabilityPolicy>,
}

pub(crate) enum Link {
    Connected(ConnectedLink),
    Direct(DirectLink),
    Forwarding(ForwardingLink),
}

pub struct Attache {
    id: HostId,
    name: String,
    ctx: AttacheContext,
    link: Link,
    queue: Mutex<RequestQueue>,
    next_seq: AtomicU64,
    ready: AtomicBool,
    maintenance: AtomicBool,
    closed: AtomicBool,
    self_ref: Weak<Attache>,
}

/// Advances the in-sequence queue when dropped, so a panicking listener
/// cannot wedge the agent.
struct AdvanceGuard<'a> {
    attache: &'a Attache,
    seq: u64,
}

impl Drop for AdvanceGuard<'_> {
    fn drop(&mut self) {
        self.attache.send_next(self.seq);
    }
}

impl std::fmt::Debug for Attache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attache")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl Attache {
    fn build(id: HostId, name: String, ctx: AttacheContext, link: Link, ready: bool) -> Arc<Self> {
        // High bits seeded randomly so a restarted node does not reuse the
        // sequence numbers of its previous life.
        let seed = u64::from(rand::random::<u16>() & 0x7fff) << 48;
        Arc::new_cyclic(|me| Attache {
            id,
            name,
            ctx,
            link,
            queue: Mutex::new(RequestQueue::default()),
            next_seq: AtomicU64::new(seed),
            ready: AtomicBool::new(ready),
            maintenance: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            self_ref: me.clone(),
        })
    }

    pub fn connected(
        id: HostId,
        name: impl Into<String>,
        ctx: AttacheContext,
        link: ConnectedLink,
    ) -> Arc<Self> {
        Self::build(id, name.into(), ctx, Link::Connected(link), false)
    }

    /// An in-process attache. Starts the periodic status ping.
    pub fn direct(
        id: HostId,
        name: impl Into<String>,
        ctx: AttacheContext,
        resource: Arc<dyn ServerResource>,
        pools: DirectAgentPools,
    ) -> Arc<Self> {
        let attache = Self::build(
            id,
            name.into(),
            ctx,
            Link::Direct(DirectLink::new(resource, pools)),
            false,
        );
        if let Link::Direct(link) = &attache.link {
            link.start_ping(&attache);
        }
        attache
    }

    /// A relay to the management server that owns the agent. The owner
    /// enforces readiness, so forwarding attaches start ready.
    pub fn forwarding(
        id: HostId,
        name: impl Into<String>,
        ctx: AttacheContext,
        router: Arc<dyn PeerRouter>,
    ) -> Arc<Self> {
        Self::build(
            id,
            name.into(),
            ctx,
            Link::Forwarding(ForwardingLink::new(router)),
            true,
        )
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttacheKind {
        match self.link {
            Link::Connected(_) => AttacheKind::Connected,
            Link::Direct(_) => AttacheKind::Direct,
            Link::Forwarding(_) => AttacheKind::Forwarding,
        }
    }

    pub fn forwards(&self) -> bool {
        matches!(self.link, Link::Forwarding(_))
    }

    pub(crate) fn ms_id(&self) -> MsId {
        self.ctx.ms_id
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        match &self.link {
            Link::Connected(link) => link.is_closed(),
            Link::Direct(link) => link.is_stopped(),
            Link::Forwarding(_) => false,
        }
    }

    pub fn ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_connecting(&self) -> bool {
        !self.is_ready()
    }

    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::Release);
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    /// Number of in-sequence requests held behind the current one.
    pub fn queue_size(&self) -> usize {
        self.queue.lock().pending_len()
    }

    pub fn non_recurring_listener_count(&self) -> usize {
        self.queue.lock().non_recurring_count()
    }

    pub fn current_sequence(&self) -> Option<u64> {
        self.queue.lock().current()
    }

    /// Refuse commands the agent must not receive in its present state.
    pub fn check_availability(&self, commands: &[Command]) -> Result<()> {
        if self.in_maintenance() {
            if let Some(cmd) = commands
                .iter()
                .find(|c| !self.ctx.policy.maintenance_allowed.contains(&c.name))
            {
                return Err(AgentError::unavailable(
                    self.id,
                    format!(
                        "Unable to send {} because agent {} is in maintenance mode",
                        cmd.name, self.name
                    ),
                ));
            }
        }

        if self.is_connecting() {
            if let Some(cmd) = commands
                .iter()
                .find(|c| self.ctx.policy.connecting_denied.contains(&c.name))
            {
                return Err(AgentError::unavailable(
                    self.id,
                    format!(
                        "Unable to send {} because agent {} is in connecting mode",
                        cmd.name, self.name
                    ),
                ));
            }
        }

        Ok(())
    }

    fn register_listener(&self, queue: &mut RequestQueue, seq: u64, listener: Arc<dyn Listener>) {
        let alarm = listener.timeout().map(|after| {
            let me = self.self_ref.clone();
            self.ctx.timers.schedule(after, move || async move {
                if let Some(attache) = me.upgrade() {
                    attache.on_alarm(seq);
                }
            })
        });
        queue.register(
            seq,
            Registration {
                recurring: listener.is_recurring(),
                listener,
                alarm,
                peer: None,
            },
        );
    }

    /// Send a request, optionally registering a listener for its answer.
    ///
    /// Returns once the request is on the wire, held behind the current
    /// in-sequence request, or held in the transfer queue.
    pub async fn send(&self, req: Request, listener: Option<Arc<dyn Listener>>) -> Result<()> {
        self.check_availability(&req.commands)?;

        let seq = req.seq;
        let in_sequence = req.in_sequence;
        let now = {
            let mut queue = self.queue.lock();
            if self.is_closed() {
                return Err(AgentError::unavailable(
                    self.id,
                    "The link to the agent has been closed",
                ));
            }
            if queue.in_use(seq) {
                return Err(AgentError::unavailable(
                    self.id,
                    format!("Request {seq} is already queued for the agent"),
                ));
            }
            if let Some(listener) = listener {
                self.register_listener(&mut queue, seq, listener);
            }

            match &self.link {
                Link::Forwarding(link) => link.hold_if_transferring(req),
                _ if in_sequence => {
                    if queue.current().is_some() {
                        debug!(host_id = self.id, seq, "holding in-sequence request");
                        queue.insert_pending(req);
                        None
                    } else {
                        queue.set_current(Some(seq));
                        Some(req)
                    }
                }
                _ => Some(req),
            }
        };

        metrics::record_request(in_sequence);
        if let Some(req) = now {
            if let Err(e) = self.transmit(req).await {
                self.abandon(seq, false);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn transmit(&self, req: Request) -> Result<()> {
        match &self.link {
            Link::Forwarding(link) => link.forward(self, req).await,
            _ => self.transmit_local(req),
        }
    }

    fn transmit_local(&self, req: Request) -> Result<()> {
        debug!(host_id = self.id, seq = req.seq, "sending request");
        match &self.link {
            Link::Connected(link) => link.send(Frame::Request(req)).map_err(|_| {
                AgentError::unavailable(self.id, "The link to the agent has been closed")
            }),
            Link::Direct(link) => match self.self_ref.upgrade() {
                Some(me) => {
                    link.submit(&me, req);
                    Ok(())
                }
                None => Err(AgentError::unavailable(self.id, "attache is shutting down")),
            },
            Link::Forwarding(_) => Err(AgentError::unavailable(
                self.id,
                "forwarded requests are sent asynchronously",
            )),
        }
    }

    /// Give up on a request whose transmission failed.
    fn abandon(&self, seq: u64, notify: bool) {
        let (registration, was_current) = {
            let mut queue = self.queue.lock();
            (queue.unregister(seq), queue.current() == Some(seq))
        };
        if notify {
            if let Some(reg) = registration {
                reg.listener
                    .process_disconnect(self.id, HostStatus::Disconnected);
            }
        }
        if was_current {
            self.send_next(seq);
        }
    }

    /// If `seq` is the current in-sequence request, clear it and send the
    /// lowest held request.
    fn send_next(&self, seq: u64) {
        let next = {
            let mut queue = self.queue.lock();
            if queue.current() != Some(seq) {
                return;
            }
            let next = queue.pop_lowest();
            queue.set_current(next.as_ref().map(|r| r.seq));
            next
        };

        let Some(req) = next else {
            return;
        };
        let next_seq = req.seq;
        debug!(host_id = self.id, seq = next_seq, "advancing in-sequence queue");

        if self.forwards() {
            let Some(me) = self.self_ref.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(e) = me.transmit(req).await {
                    warn!(host_id = me.id, seq = next_seq, error = %e, "held request failed");
                    me.abandon(next_seq, true);
                }
            });
        } else if let Err(e) = self.transmit_local(req) {
            warn!(host_id = self.id, seq = next_seq, error = %e, "held request failed");
            self.abandon(next_seq, true);
        }
    }

    /// Hand a response to the listener registered for its sequence.
    pub fn process_answers(&self, resp: &Response) -> Dispatch {
        let _advance = resp.in_sequence.then(|| AdvanceGuard {
            attache: self,
            seq: resp.seq,
        });

        let listener = self.queue.lock().take_for_answer(resp.seq);
        match listener {
            Some(listener) => listener.process_answers(self.id, resp.seq, &resp.answers),
            None => {
                debug!(host_id = self.id, seq = resp.seq, "no listener for answer");
                Dispatch::NotHandled
            }
        }
    }

    /// Route a response through this attache and then to the manager.
    pub(crate) fn deliver(&self, resp: &Response) {
        self.process_answers(resp);
        if let Some(events) = self.ctx.events.upgrade() {
            events.answers_received(self.id, resp);
        }
    }

    /// Drop the listener and any held request for `seq`. Safe to call more
    /// than once.
    pub fn cancel(&self, seq: u64) {
        self.cancel_request(seq, None);
    }

    /// `known_peer` stands in for the registration's peer tag once a
    /// disconnect has drained the registrations.
    fn cancel_request(&self, seq: u64, known_peer: Option<MsId>) {
        let (peer, was_current) = {
            let mut queue = self.queue.lock();
            let peer = queue.peer(seq).or(known_peer);
            queue.unregister(seq);
            queue.remove_pending(seq);
            (peer, queue.current() == Some(seq))
        };
        debug!(host_id = self.id, seq, "cancelled request");

        if let (Link::Forwarding(link), Some(peer)) = (&self.link, peer) {
            link.propagate_cancel(peer, self.id, seq, "cancelled by origin");
        }
        if was_current {
            self.send_next(seq);
        }
    }

    fn on_alarm(&self, seq: u64) {
        let listener = self.queue.lock().listener(seq);
        if let Some(listener) = listener {
            warn!(host_id = self.id, seq, "listener alarm fired, cancelling request");
            self.cancel(seq);
            listener.process_timeout(self.id, seq);
        }
    }

    /// Send and wait for the answers.
    ///
    /// Waits up to `wait`. If no answer came and no other in-sequence
    /// request is current, the agent is assumed to still be working on
    /// this one and one more `wait` is granted. On final timeout the
    /// request is cancelled, which also unblocks the in-sequence queue.
    pub async fn send_sync(&self, req: Request, wait: Duration) -> Result<Vec<Answer>> {
        let seq = req.seq;
        let commands = req.commands.clone();
        let listener = Arc::new(SynchronousListener::new());
        self.send(req, Some(listener.clone())).await?;

        let kind = match self.wait_answers(seq, &listener, wait).await {
            Ok(answers) => return Ok(answers),
            Err(kind) => kind,
        };

        self.cancel_request(seq, listener.peer());
        metrics::record_timeout(kind.into());
        warn!(host_id = self.id, seq, %kind, "timed out waiting for answers");
        Err(AgentError::TimedOut {
            host_id: self.id,
            seq,
            wait: match kind {
                TimeoutKind::Soft => wait * 2,
                TimeoutKind::Hard => wait,
            },
            commands,
            kind,
        })
    }

    async fn wait_answers(
        &self,
        seq: u64,
        listener: &SynchronousListener,
        wait: Duration,
    ) -> std::result::Result<Vec<Answer>, TimeoutKind> {
        let mut kind = TimeoutKind::Hard;
        for round in 0..2 {
            if let Some(answers) = listener.wait_for(wait).await {
                return Ok(answers);
            }
            // The answer may have landed between the wake-up and here.
            if let Some(answers) = listener.answers() {
                return Ok(answers);
            }
            if listener.is_disconnected() {
                return Err(TimeoutKind::Hard);
            }
            if round == 1 {
                break;
            }
            let current = self.current_sequence();
            if current.is_some_and(|c| c != seq) {
                return Err(TimeoutKind::Hard);
            }
            debug!(host_id = self.id, seq, "still current, waiting once more");
            kind = TimeoutKind::Soft;
        }
        Err(kind)
    }

    /// Tear down the link and release every waiting listener.
    pub fn disconnect(&self, status: HostStatus) {
        self.closed.store(true, Ordering::Release);
        let listeners = {
            let mut queue = self.queue.lock();
            queue.drain_pending();
            queue.set_current(None);
            queue.drain_listeners()
        };
        debug!(host_id = self.id, %status, listeners = listeners.len(), "attache disconnected");

        for listener in listeners {
            listener.process_disconnect(self.id, status);
        }

        match &self.link {
            Link::Connected(link) => link.close(),
            Link::Direct(link) => link.stop(),
            Link::Forwarding(link) => {
                link.take_transfer_queue();
            }
        }
    }

    /// Drop every held request, notifying its listener. With
    /// `cancel_active` the outstanding requests are released too.
    pub fn cancel_all_commands(&self, status: HostStatus, cancel_active: bool) {
        let released = {
            let mut queue = self.queue.lock();
            let mut released = Vec::new();
            for req in queue.drain_pending() {
                if let Some(reg) = queue.unregister(req.seq) {
                    released.push(reg.listener);
                }
            }
            if cancel_active {
                released.extend(queue.drain_non_recurring().into_iter().map(|(_, l)| l));
                queue.set_current(None);
            }
            released
        };
        for listener in released {
            listener.process_disconnect(self.id, status);
        }
    }

    pub(crate) fn tag_peer(&self, seq: u64, peer: MsId) {
        self.queue.lock().tag_peer(seq, peer);
    }

    /// Answer a request the agent sent over a socket link.
    pub(crate) fn send_response(&self, resp: Response) -> Result<()> {
        match &self.link {
            Link::Connected(link) => link.send(Frame::Response(resp)).map_err(|_| {
                AgentError::unavailable(self.id, "The link to the agent has been closed")
            }),
            _ => Ok(()),
        }
    }

    /// Hold outbound requests instead of forwarding them. Only meaningful
    /// on a forwarding attache.
    pub fn set_transfer_mode(&self, transfer: bool) {
        if let Link::Forwarding(link) = &self.link {
            link.set_transfer_mode(transfer);
        }
    }

    pub fn in_transfer_mode(&self) -> bool {
        match &self.link {
            Link::Forwarding(link) => link.in_transfer_mode(),
            _ => false,
        }
    }

    pub fn transfer_queue_len(&self) -> usize {
        match &self.link {
            Link::Forwarding(link) => link.transfer_queue_len(),
            _ => 0,
        }
    }

    /// Requests held while in transfer mode, oldest first.
    pub fn take_transfer_queue(&self) -> Vec<Request> {
        match &self.link {
            Link::Forwarding(link) => link.take_transfer_queue(),
            _ => Vec::new(),
        }
    }

    /// Forward the requests held during a transfer, oldest first, then
    /// leave transfer mode. Sequence numbers are kept so the answers
    /// still find their listeners.
    pub async fn end_transfer(&self) {
        let Link::Forwarding(link) = &self.link else {
            return;
        };
        loop {
            let held = link.drain_or_release();
            if held.is_empty() {
                break;
            }
            debug!(host_id = self.id, held = held.len(), "releasing transfer queue");
            for req in held {
                let seq = req.seq;
                if let Err(e) = link.forward(self, req).await {
                    warn!(host_id = self.id, seq, error = %e, "held request failed after transfer");
                    self.abandon(seq, true);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use agent_manager_types::{Commands, ResourceEvent, names};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    pub(crate) struct NoEvents;

    #[async_trait]
    impl AttacheEvents for NoEvents {
        fn answers_received(&self, _: HostId, _: &Response) {}
        async fn commands_received(&self, _: Arc<Attache>, req: Request) -> Vec<Answer> {
            req.commands.iter().map(Answer::success).collect()
        }
    }

    pub(crate) fn context() -> AttacheContext {
        let events: Weak<dyn AttacheEvents> = Weak::<NoEvents>::new();
        AttacheContext {
            ms_id: 1,
            timers: TimerService::new(),
            events,
            policy: Arc::new(AvailabilityPolicy::default()),
        }
    }

    /// A socket-backed attache whose outbound frames land in a channel.
    pub(crate) fn connected() -> (Arc<Attache>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ConnectedLink::new(tx, CancellationToken::new(), None);
        let attache = Attache::connected(7, "host-7", context(), link);
        attache.ready();
        (attache, rx)
    }

    fn in_seq(attache: &Attache, name: &str) -> Request {
        let seq = attache.next_sequence();
        Request::new(
            attache.id(),
            1,
            seq,
            Commands::single(Command::new(name, Value::Null).in_sequence()),
        )
    }

    fn plain(attache: &Attache, name: &str) -> Request {
        let seq = attache.next_sequence();
        Request::new(
            attache.id(),
            1,
            seq,
            Commands::single(Command::new(name, Value::Null)),
        )
    }

    fn answer(req: &Request) -> Response {
        Response::for_request(req, req.commands.iter().map(Answer::success).collect())
    }

    fn sent_seqs(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<u64> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.seq())
            .collect()
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let (attache, _rx) = connected();
        let mut last = attache.next_sequence();
        assert!(last < 1 << 63);
        for _ in 0..1000 {
            let next = attache.next_sequence();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_in_sequence_request_waits_for_current_answer() {
        let (attache, mut rx) = connected();
        let r1 = in_seq(&attache, names::STOP);
        let r2 = in_seq(&attache, names::STOP);

        attache.send(r1.clone(), None).await.unwrap();
        attache.send(r2.clone(), None).await.unwrap();
        assert_eq!(sent_seqs(&mut rx), vec![r1.seq]);
        assert_eq!(attache.queue_size(), 1);
        assert_eq!(attache.current_sequence(), Some(r1.seq));

        attache.process_answers(&answer(&r1));
        assert_eq!(sent_seqs(&mut rx), vec![r2.seq]);
        assert_eq!(attache.current_sequence(), Some(r2.seq));
        assert_eq!(attache.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_sequence_in_use_is_refused() {
        let (attache, mut rx) = connected();
        let r1 = in_seq(&attache, names::STOP);
        let r2 = in_seq(&attache, names::STOP);
        attache.send(r1.clone(), None).await.unwrap();
        attache.send(r2.clone(), None).await.unwrap();

        for again in [r1.clone(), r2.clone()] {
            let err = attache.send(again, None).await.unwrap_err();
            assert!(matches!(err, AgentError::Unavailable { host_id: 7, .. }));
        }
        assert_eq!(sent_seqs(&mut rx), vec![r1.seq]);
        assert_eq!(attache.queue_size(), 1);
        assert_eq!(attache.current_sequence(), Some(r1.seq));
    }

    #[tokio::test]
    async fn test_cancel_advances_queue_and_is_idempotent() {
        let (attache, mut rx) = connected();
        let r1 = in_seq(&attache, names::STOP);
        let r2 = in_seq(&attache, names::STOP);
        let r3 = in_seq(&attache, names::STOP);
        attache.send(r1.clone(), None).await.unwrap();
        attache.send(r3.clone(), None).await.unwrap();
        attache.send(r2.clone(), None).await.unwrap();
        assert_eq!(sent_seqs(&mut rx), vec![r1.seq]);

        attache.cancel(r1.seq);
        attache.cancel(r1.seq);
        assert_eq!(sent_seqs(&mut rx), vec![r2.seq]);
        assert_eq!(attache.queue_size(), 1);

        // Cancelling a held request removes it without sending anything.
        attache.cancel(r3.seq);
        attache.cancel(r3.seq);
        assert_eq!(attache.queue_size(), 0);
        assert!(sent_seqs(&mut rx).is_empty());
        assert_eq!(attache.current_sequence(), Some(r2.seq));
    }

    #[tokio::test]
    async fn test_plain_request_bypasses_queue() {
        let (attache, mut rx) = connected();
        let r1 = in_seq(&attache, names::STOP);
        let r2 = plain(&attache, names::CHECK_VIRTUAL_MACHINE);
        attache.send(r1.clone(), None).await.unwrap();
        attache.send(r2.clone(), None).await.unwrap();

        assert_eq!(sent_seqs(&mut rx), vec![r1.seq, r2.seq]);
        assert_eq!(attache.current_sequence(), Some(r1.seq));
    }

    #[tokio::test]
    async fn test_maintenance_refuses_commands_not_allowed() {
        let (attache, mut rx) = connected();
        attache.set_maintenance(true);

        let err = attache
            .send(plain(&attache, names::START), None)
            .await
            .unwrap_err();
        match err {
            AgentError::Unavailable { host_id, reason } => {
                assert_eq!(host_id, 7);
                assert!(reason.contains("Start"), "{reason}");
                assert!(reason.contains("maintenance"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }

        attache
            .send(plain(&attache, names::MIGRATE), None)
            .await
            .unwrap();
        assert_eq!(sent_seqs(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_connecting_agent_refuses_denied_commands() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = ConnectedLink::new(tx, CancellationToken::new(), None);
        let attache = Attache::connected(3, "host-3", context(), link);
        assert!(attache.is_connecting());

        let err = attache
            .send(plain(&attache, names::CREATE), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connecting mode"));

        attache
            .send(plain(&attache, names::READY), None)
            .await
            .unwrap();
        attache.ready();
        attache
            .send(plain(&attache, names::CREATE), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_link_is_unavailable() {
        let (attache, rx) = connected();
        drop(rx);
        let err = attache
            .send(plain(&attache, names::STOP), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { host_id: 7, .. }));
        assert_eq!(attache.non_recurring_listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_sync_returns_answers() {
        let (attache, mut rx) = connected();
        let responder = {
            let attache = attache.clone();
            tokio::spawn(async move {
                let Some(Frame::Request(req)) = rx.recv().await else {
                    panic!("expected a request");
                };
                tokio::time::sleep(Duration::from_secs(5)).await;
                attache.process_answers(&answer(&req));
            })
        };

        let req = in_seq(&attache, names::STOP);
        let answers = attache
            .send_sync(req, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(answers.len(), 1);
        assert!(answers[0].result);
        assert_eq!(attache.current_sequence(), None);
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_wait_is_hard_timeout_with_requested_wait() {
        let (attache, _rx) = connected();
        let req = in_seq(&attache, names::STOP);
        let seq = req.seq;

        let dropper = {
            let attache = attache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                attache.disconnect(HostStatus::Alert);
            })
        };

        let err = attache
            .send_sync(req, Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            AgentError::TimedOut {
                host_id,
                seq: got,
                wait,
                commands,
                kind,
            } => {
                assert_eq!(host_id, 7);
                assert_eq!(got, seq);
                assert_eq!(wait, Duration::from_secs(10));
                assert_eq!(commands[0].name, names::STOP);
                assert_eq!(kind, TimeoutKind::Hard);
            }
            other => panic!("unexpected error: {other}"),
        }
        dropper.await.unwrap();
        assert!(attache.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_request_gets_one_grace_window() {
        let (attache, _rx) = connected();
        let req = in_seq(&attache, names::STOP);
        let seq = req.seq;
        let start = tokio::time::Instant::now();

        let err = attache
            .send_sync(req, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(20));
        match err {
            AgentError::TimedOut { kind, wait, .. } => {
                assert_eq!(kind, TimeoutKind::Soft);
                assert_eq!(wait, Duration::from_secs(20));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The stuck request no longer blocks the queue.
        assert_eq!(attache.current_sequence(), None);
        assert_eq!(attache.non_recurring_listener_count(), 0);
        attache.cancel(seq);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_request_times_out_hard_and_leaves_queue() {
        let (attache, mut rx) = connected();
        let r1 = in_seq(&attache, names::STOP);
        attache.send(r1.clone(), None).await.unwrap();

        let r2 = in_seq(&attache, names::STOP);
        let start = tokio::time::Instant::now();
        let err = attache
            .send_sync(r2, Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(11));
        assert!(matches!(
            err,
            AgentError::TimedOut {
                kind: TimeoutKind::Hard,
                ..
            }
        ));
        assert_eq!(attache.queue_size(), 0);
        assert_eq!(sent_seqs(&mut rx), vec![r1.seq]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_alarm_cancels_and_notifies() {
        struct Timed(Mutex<Vec<u64>>);
        impl Listener for Timed {
            fn timeout(&self) -> Option<Duration> {
                Some(Duration::from_secs(3))
            }
            fn process_timeout(&self, _: HostId, seq: u64) -> Dispatch {
                self.0.lock().push(seq);
                Dispatch::Handled
            }
        }

        let (attache, mut rx) = connected();
        let r1 = in_seq(&attache, names::STOP);
        let r2 = in_seq(&attache, names::STOP);
        let timed = Arc::new(Timed(Mutex::new(Vec::new())));
        attache.send(r1.clone(), Some(timed.clone())).await.unwrap();
        attache.send(r2.clone(), None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(*timed.0.lock(), vec![r1.seq]);
        assert_eq!(sent_seqs(&mut rx), vec![r1.seq, r2.seq]);
        assert_eq!(attache.current_sequence(), Some(r2.seq));
    }

    #[tokio::test]
    async fn test_cancel_all_commands_keeps_active_unless_asked() {
        let (attache, _rx) = connected();
        let r1 = in_seq(&attache, names::STOP);
        let r2 = in_seq(&attache, names::STOP);
        let l1 = Arc::new(SynchronousListener::new());
        let l2 = Arc::new(SynchronousListener::new());
        attache.send(r1.clone(), Some(l1.clone())).await.unwrap();
        attache.send(r2, Some(l2.clone())).await.unwrap();

        attache.cancel_all_commands(HostStatus::Disconnected, false);
        assert!(l2.is_disconnected());
        assert!(!l1.is_disconnected());
        assert_eq!(attache.current_sequence(), Some(r1.seq));

        attache.cancel_all_commands(HostStatus::Disconnected, true);
        assert!(l1.is_disconnected());
        assert_eq!(attache.current_sequence(), None);
    }

    #[tokio::test]
    async fn test_writer_drains_channel_into_sink() {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (sink_tx, sink_rx) = futures::channel::mpsc::unbounded::<Frame>();
        let sink = futures::SinkExt::sink_map_err(sink_tx, |_| {
            agent_wire::WireError::Io(std::io::Error::other("closed"))
        });
        let writer = tokio::spawn(run_writer(sink, rx, shutdown.clone()));

        let req = Request::control(
            1,
            1,
            9,
            Command::with_payload(
                names::PROPAGATE_RESOURCE_EVENT,
                &agent_manager_types::PropagateResourceEventPayload {
                    host_id: 1,
                    event: ResourceEvent::Reconnect,
                },
            )
            .unwrap(),
        );
        tx.send(Frame::Request(req.clone())).unwrap();
        drop(tx);
        writer.await.unwrap();

        let frames: Vec<Frame> = sink_rx.collect().await;
        assert_eq!(frames, vec![Frame::Request(req)]);
    }
}
