// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Connections to the other management servers.
//!
//! The pool keeps at most one outbound link per peer. Control requests
//! sent on a link are matched to their replies by sequence number through
//! the pending table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use agent_manager_types::MsId;
use agent_wire::{Frame, Response};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::tls::PeerTls;
use crate::config::PeerAddress;
use crate::error::{AgentError, Result};

/// Byte stream to a peer, plain or TLS.
pub(crate) trait PeerIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerIo for T {}

pub(crate) type PeerStream = Box<dyn PeerIo>;

/// Sending half of a peer connection. The writer task drains the channel.
#[derive(Clone, Debug)]
pub(crate) struct PeerLink {
    tx: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

impl PeerLink {
    pub fn new(tx: mpsc::UnboundedSender<Frame>, closed: CancellationToken) -> Self {
        PeerLink { tx, closed }
    }

    pub fn send(&self, frame: Frame) -> bool {
        !self.closed.is_cancelled() && self.tx.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

pub struct PeerPool {
    peers: HashMap<MsId, String>,
    tls: Option<Arc<PeerTls>>,
    links: Mutex<HashMap<MsId, PeerLink>>,
    pending: DashMap<u64, oneshot::Sender<Response>>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("peers", &self.peers)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl PeerPool {
    pub fn new(peers: &[PeerAddress], tls: Option<Arc<PeerTls>>) -> Self {
        PeerPool {
            peers: peers
                .iter()
                .map(|p| (p.ms_id, p.address.clone()))
                .collect(),
            tls,
            links: Mutex::new(HashMap::new()),
            pending: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn peer_ids(&self) -> Vec<MsId> {
        let mut ids: Vec<MsId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn knows(&self, peer: MsId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub(crate) fn tls(&self) -> Option<&Arc<PeerTls>> {
        self.tls.as_ref()
    }

    /// Open a new connection to `peer`.
    pub(crate) async fn dial(&self, peer: MsId) -> Result<PeerStream> {
        let address = self
            .peers
            .get(&peer)
            .ok_or_else(|| AgentError::peer_io(peer, "unknown peer"))?;
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| AgentError::peer_io(peer, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer, error = %e, "unable to set TCP_NODELAY");
        }
        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connect(address, stream)
                    .await
                    .map_err(|e| AgentError::peer_io(peer, e))?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// The live link to `peer`, if there is one.
    pub(crate) fn cached(&self, peer: MsId) -> Option<PeerLink> {
        let mut links = self.links.lock();
        match links.get(&peer) {
            Some(link) if !link.is_closed() => Some(link.clone()),
            Some(_) => {
                links.remove(&peer);
                None
            }
            None => None,
        }
    }

    /// Keep `link` as the link to `peer` unless a live one raced in first,
    /// in which case that one is returned and `link` is closed.
    pub(crate) fn insert(&self, peer: MsId, link: PeerLink) -> PeerLink {
        let mut links = self.links.lock();
        if let Some(existing) = links.get(&peer) {
            if !existing.is_closed() {
                link.close();
                return existing.clone();
            }
        }
        links.insert(peer, link.clone());
        link
    }

    pub(crate) fn drop_link(&self, peer: MsId) {
        if let Some(link) = self.links.lock().remove(&peer) {
            debug!(peer, "dropping peer link");
            link.close();
        }
    }

    pub(crate) fn close_all(&self) {
        for (_, link) in self.links.lock().drain() {
            link.close();
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn expect_reply(&self, seq: u64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        rx
    }

    pub(crate) fn forget(&self, seq: u64) {
        self.pending.remove(&seq);
    }

    /// Hand a control reply to whoever is waiting for it.
    pub(crate) fn complete(&self, resp: Response) -> bool {
        match self.pending.remove(&resp.seq) {
            Some((_, waiter)) => waiter.send(resp).is_ok(),
            None => false,
        }
    }
}
