// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Inbound agent connections.

use std::net::SocketAddr;
use std::sync::Arc;

use agent_manager_types::{Answer, HostEvent, HostStatus, StartupAck, StartupPayload, names};
use agent_wire::{AgentCodec, Frame, Request, Response};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use super::AgentManager;
use crate::attache::{Attache, ConnectedLink, run_writer};
use crate::config::ManagerConfig;
use crate::error::Result;

impl AgentManager {
    /// Accept agent connections until the manager is stopped.
    pub async fn run_agent_acceptor(self: Arc<Self>, listener: TcpListener) {
        info!(address = ?listener.local_addr().ok(), "accepting agent connections");
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "agent connection accepted");
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(%peer, error = %e, "unable to set TCP_NODELAY");
                    }
                    let me = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = me.serve_agent(socket, Some(peer)).await {
                            warn!(%peer, error = %e, "agent connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "unable to accept agent connection"),
            }
        }
        info!("agent acceptor stopped");
    }

    /// Run one agent connection: the startup handshake, then the reader
    /// loop. Writes go through a separate writer task fed by the attache.
    pub async fn serve_agent<S>(self: Arc<Self>, socket: S, peer: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = AgentCodec::default().framed(socket).split();

        let wait = self.cfg(ManagerConfig::ready_wait);
        let req = match tokio::time::timeout(wait, stream.next()).await {
            Ok(Some(frame)) => match frame? {
                Frame::Request(req)
                    if req
                        .first_command()
                        .is_some_and(|c| c.name == names::STARTUP) =>
                {
                    req
                }
                other => {
                    warn!(?peer, seq = other.seq(), "first frame is not a startup command");
                    return Ok(());
                }
            },
            Ok(None) => {
                debug!(?peer, "connection closed before startup");
                return Ok(());
            }
            Err(_) => {
                warn!(?peer, "no startup command received in time");
                return Ok(());
            }
        };

        let startup = req.commands[0].clone();
        let payload: StartupPayload = match startup.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                let answer = Answer::failure(&startup, format!("Invalid startup command: {e}"));
                sink.send(Frame::Response(Response::for_request(&req, vec![answer])))
                    .await?;
                return Ok(());
            }
        };

        let host = match self.collab.store.find(payload.host_id).await? {
            Some(host) if host.status != HostStatus::Removed => host,
            _ => {
                warn!(?peer, host_id = payload.host_id, "startup from unknown host");
                let answer = Answer::failure(
                    &startup,
                    format!("Unable to find host {}", payload.host_id),
                );
                sink.send(Frame::Response(Response::for_request(&req, vec![answer])))
                    .await?;
                return Ok(());
            }
        };
        let host_id = host.id;
        info!(host_id, ?peer, version = %payload.version, "agent startup");

        // Answer at once so the agent is not held up by the rest of the
        // handshake.
        let ack = StartupAck {
            host_id,
            ping_interval_secs: self.cfg(|c| c.ping_interval_secs),
        };
        let answers = req
            .commands
            .iter()
            .enumerate()
            .map(|(i, cmd)| {
                let answer = Answer::success(cmd);
                if i == 0 {
                    answer.with_payload(serde_json::to_value(&ack).unwrap_or_default())
                } else {
                    answer
                }
            })
            .collect();
        sink.send(Frame::Response(Response::for_request(&req, answers)))
            .await?;

        let closed = self.shutdown.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(sink, rx, closed.clone()));

        let link = ConnectedLink::new(tx, closed.clone(), peer);
        let attache = Attache::connected(host_id, host.name.clone(), self.attache_context(), link);
        attache.set_maintenance(host.resource_state.is_maintenance());
        self.install(attache.clone());

        {
            let me = self.clone();
            let attache = attache.clone();
            tokio::spawn(async move {
                if let Err(e) = me.finish_connect(&attache, &startup, false).await {
                    warn!(host_id, error = %e, "agent handshake failed");
                }
            });
        }

        loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break,
                frame = stream.next() => frame,
            };
            match frame {
                None => break,
                Some(Err(e)) => {
                    warn!(host_id, error = %e, "unable to read from agent");
                    break;
                }
                Some(Ok(Frame::Response(resp))) => {
                    debug!(host_id, seq = resp.seq, "answers received");
                    attache.deliver(&resp);
                }
                Some(Ok(Frame::Request(req))) => self.spawn_agent_request(&attache, req),
            }
        }

        closed.cancel();
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let still_installed = self
            .find_attache(host_id)
            .is_some_and(|current| Arc::ptr_eq(&current, &attache));
        if still_installed {
            info!(host_id, "agent connection closed");
            self.disconnect_attache_with_investigation(&attache, HostEvent::AgentDisconnected)
                .await?;
        }
        Ok(())
    }

    fn spawn_agent_request(self: &Arc<Self>, attache: &Arc<Attache>, req: Request) {
        let me = self.clone();
        let attache = attache.clone();
        tokio::spawn(async move {
            let answers = me.handle_agent_commands(&attache, &req).await;
            if let Err(e) = attache.send_response(Response::for_request(&req, answers)) {
                debug!(host_id = attache.id(), seq = req.seq, error = %e, "unable to answer agent");
            }
        });
    }
}
