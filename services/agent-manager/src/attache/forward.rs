// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Relay to the management server that owns an agent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_manager_types::{HostId, MsId};
use agent_wire::{Frame, Request};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::Attache;
use crate::error::{AgentError, Result};
use crate::metrics;

/// Attempts made to reach the owner before a forward fails.
pub const FORWARD_ATTEMPTS: usize = 5;

/// How a forwarding attache reaches other management servers.
#[async_trait]
pub trait PeerRouter: Send + Sync {
    /// Management server currently recorded as owning `host_id`.
    async fn find_owner(&self, host_id: HostId) -> Option<MsId>;

    /// Send a frame to a peer, opening a connection if needed.
    async fn route_to_peer(&self, peer: MsId, frame: Frame) -> Result<()>;

    /// Ask `peer` to drop a request it is running for us. Best effort.
    async fn cancel_on_peer(&self, peer: MsId, host_id: HostId, seq: u64, reason: &str);
}

pub(crate) struct ForwardingLink {
    router: Arc<dyn PeerRouter>,
    transfer_mode: AtomicBool,
    transfer_queue: Mutex<VecDeque<Request>>,
}

impl ForwardingLink {
    pub fn new(router: Arc<dyn PeerRouter>) -> Self {
        ForwardingLink {
            router,
            transfer_mode: AtomicBool::new(false),
            transfer_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Keep `req` back while a transfer is in progress. Returns the
    /// request if it should go out now.
    pub fn hold_if_transferring(&self, req: Request) -> Option<Request> {
        let mut queue = self.transfer_queue.lock();
        if self.transfer_mode.load(Ordering::Acquire) {
            debug!(host_id = req.agent_id, seq = req.seq, "holding request during transfer");
            queue.push_back(req);
            None
        } else {
            Some(req)
        }
    }

    pub fn set_transfer_mode(&self, transfer: bool) {
        let _queue = self.transfer_queue.lock();
        self.transfer_mode.store(transfer, Ordering::Release);
    }

    pub fn in_transfer_mode(&self) -> bool {
        self.transfer_mode.load(Ordering::Acquire)
    }

    pub fn transfer_queue_len(&self) -> usize {
        self.transfer_queue.lock().len()
    }

    pub fn take_transfer_queue(&self) -> Vec<Request> {
        self.transfer_queue.lock().drain(..).collect()
    }

    /// Hand back the held requests, or leave transfer mode once none are
    /// left. Requests arriving meanwhile keep being held until the queue
    /// is seen empty.
    pub fn drain_or_release(&self) -> Vec<Request> {
        let mut queue = self.transfer_queue.lock();
        if queue.is_empty() {
            self.transfer_mode.store(false, Ordering::Release);
        }
        queue.drain(..).collect()
    }

    /// Send `req` to the owner, retrying with a fresh owner lookup and
    /// connection each time.
    pub async fn forward(&self, attache: &Attache, mut req: Request) -> Result<()> {
        req.forwarded = true;
        let host_id = attache.id();
        let seq = req.seq;
        let mut last_error = String::from("no owner recorded");

        for attempt in 1..=FORWARD_ATTEMPTS {
            let Some(owner) = self.router.find_owner(host_id).await else {
                debug!(host_id, seq, attempt, "no owner to forward to");
                continue;
            };
            if owner == attache.ms_id() {
                return Err(AgentError::unavailable(
                    host_id,
                    "agent is owned by this node but has no local connection",
                ));
            }

            attache.tag_peer(seq, owner);
            match self.router.route_to_peer(owner, Frame::Request(req.clone())).await {
                Ok(()) => {
                    debug!(host_id, seq, peer = owner, "forwarded request");
                    return Ok(());
                }
                Err(e) => {
                    info!(host_id, seq, peer = owner, attempt, error = %e, "forward failed, retrying");
                    last_error = e.to_string();
                }
            }
        }

        metrics::record_forward_failure();
        warn!(host_id, seq, error = %last_error, "giving up forwarding request");
        Err(AgentError::unavailable(
            host_id,
            format!("Unable to forward request after {FORWARD_ATTEMPTS} attempts: {last_error}"),
        ))
    }

    pub fn propagate_cancel(&self, peer: MsId, host_id: HostId, seq: u64, reason: &'static str) {
        let router = self.router.clone();
        tokio::spawn(async move {
            router.cancel_on_peer(peer, host_id, seq, reason).await;
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::attache::tests::context;
    use crate::error::AgentError;
    use crate::sync_listener::SynchronousListener;
    use agent_manager_types::{Answer, Command, Commands, HostStatus, names};
    use agent_wire::Response;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Router {
        owner: Option<MsId>,
        failures_left: AtomicUsize,
        routed: Mutex<Vec<(MsId, u64)>>,
        cancels: Mutex<Vec<(MsId, u64)>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl PeerRouter for Router {
        async fn find_owner(&self, _: HostId) -> Option<MsId> {
            self.owner
        }

        async fn route_to_peer(&self, peer: MsId, frame: Frame) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(AgentError::peer_io(peer, "connection refused"));
            }
            match &frame {
                Frame::Request(r) => assert!(r.forwarded),
                Frame::Response(_) => panic!("forwarded a response"),
            }
            self.routed.lock().push((peer, frame.seq()));
            Ok(())
        }

        async fn cancel_on_peer(&self, peer: MsId, _: HostId, seq: u64, _: &str) {
            self.cancels.lock().push((peer, seq));
        }
    }

    fn forwarding(router: Arc<Router>) -> Arc<Attache> {
        Attache::forwarding(11, "host-11", context(), router)
    }

    fn request(a: &Attache) -> Request {
        Request::new(
            a.id(),
            1,
            a.next_sequence(),
            Commands::single(Command::new(names::STOP, Value::Null).in_sequence()),
        )
    }

    #[tokio::test]
    async fn test_forwards_to_owner() {
        let router = Arc::new(Router {
            owner: Some(2),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        let r1 = request(&a);
        let r2 = request(&a);
        a.send(r1.clone(), None).await.unwrap();
        a.send(r2.clone(), None).await.unwrap();

        // The owner enforces ordering, so both go out at once.
        assert_eq!(*router.routed.lock(), vec![(2, r1.seq), (2, r2.seq)]);
        assert_eq!(a.current_sequence(), None);
    }

    #[tokio::test]
    async fn test_transfer_mode_holds_requests() {
        let router = Arc::new(Router {
            owner: Some(2),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        a.set_transfer_mode(true);

        let r1 = request(&a);
        let r2 = request(&a);
        a.send(r1.clone(), Some(Arc::new(SynchronousListener::new())))
            .await
            .unwrap();
        a.send(r2.clone(), None).await.unwrap();
        assert!(router.routed.lock().is_empty());
        assert_eq!(a.transfer_queue_len(), 2);

        a.set_transfer_mode(false);
        let held: Vec<u64> = a.take_transfer_queue().iter().map(|r| r.seq).collect();
        assert_eq!(held, vec![r1.seq, r2.seq]);
        assert_eq!(a.non_recurring_listener_count(), 1);
    }

    #[tokio::test]
    async fn test_end_transfer_forwards_held_requests_in_order() {
        let router = Arc::new(Router {
            owner: Some(4),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        a.set_transfer_mode(true);
        let r1 = request(&a);
        let r2 = request(&a);
        a.send(r1.clone(), None).await.unwrap();
        a.send(r2.clone(), None).await.unwrap();

        a.end_transfer().await;
        assert!(!a.in_transfer_mode());
        assert_eq!(*router.routed.lock(), vec![(4, r1.seq), (4, r2.seq)]);

        let r3 = request(&a);
        a.send(r3.clone(), None).await.unwrap();
        assert_eq!(router.routed.lock().last(), Some(&(4, r3.seq)));
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let router = Arc::new(Router {
            owner: Some(2),
            failures_left: AtomicUsize::new(100),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        let before = metrics::FORWARD_FAILURES.get();

        let err = a.send(request(&a), None).await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { host_id: 11, .. }));
        assert_eq!(router.attempts.load(Ordering::SeqCst), FORWARD_ATTEMPTS);
        assert!(metrics::FORWARD_FAILURES.get() > before);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_peer_failure() {
        let router = Arc::new(Router {
            owner: Some(3),
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        let r = request(&a);
        a.send(r.clone(), None).await.unwrap();
        assert_eq!(router.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*router.routed.lock(), vec![(3, r.seq)]);
    }

    #[tokio::test]
    async fn test_cancel_is_propagated_to_peer() {
        let router = Arc::new(Router {
            owner: Some(2),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        let r = request(&a);
        a.send(r.clone(), Some(Arc::new(SynchronousListener::new())))
            .await
            .unwrap();

        a.cancel(r.seq);
        a.cancel(r.seq);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*router.cancels.lock(), vec![(2, r.seq)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_disconnect_still_reaches_peer() {
        let router = Arc::new(Router {
            owner: Some(2),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        let r = request(&a);

        let dropper = {
            let a = a.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                a.disconnect(HostStatus::Disconnected);
            })
        };
        let err = a
            .send_sync(r.clone(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TimedOut { .. }));
        dropper.await.unwrap();

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*router.cancels.lock(), vec![(2, r.seq)]);
    }

    #[tokio::test]
    async fn test_answer_from_peer_reaches_listener() {
        let router = Arc::new(Router {
            owner: Some(2),
            ..Default::default()
        });
        let a = forwarding(router);
        let r = request(&a);
        let listener = Arc::new(SynchronousListener::new());
        a.send(r.clone(), Some(listener.clone())).await.unwrap();

        let answers = r.commands.iter().map(Answer::success).collect();
        a.process_answers(&Response::for_request(&r, answers));
        assert_eq!(listener.answers().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_owned_by_self_is_unavailable() {
        let router = Arc::new(Router {
            owner: Some(1),
            ..Default::default()
        });
        let a = forwarding(router.clone());
        assert!(a.send(request(&a), None).await.is_err());
        assert_eq!(router.attempts.load(Ordering::SeqCst), 0);
    }
}
