// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Observers of agent lifecycle and command traffic
//!
//! Listeners are kept in two ordered lists, one for connect/disconnect
//! events and one for command/answer passthrough. Priority registrations go
//! to the front so they can observe or veto before ordinary listeners.
//! Broadcasts iterate over a snapshot taken outside the registry lock, so a
//! listener may see one more event after it unregisters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agent_manager_types::{Answer, Command, HostId, HostRecord, HostStatus, MsId};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::ConnectionError;

/// Outcome of offering an event to one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The listener consumed the event; later listeners still see it
    Handled,
    /// The listener is not interested
    NotHandled,
    /// The listener refuses the event; later listeners do not see it
    Veto,
}

/// Callbacks for subsystems that observe agent traffic.
///
/// Every method has a no-op default so implementations only override what
/// they care about.
#[async_trait]
pub trait Listener: Send + Sync {
    fn process_answers(&self, _host_id: HostId, _seq: u64, _answers: &[Answer]) -> Dispatch {
        Dispatch::NotHandled
    }

    fn process_commands(&self, _host_id: HostId, _seq: u64, _commands: &[Command]) -> Dispatch {
        Dispatch::NotHandled
    }

    /// Called once an agent's handshake has been accepted and before it is
    /// told it is ready. Returning an error refuses the connection.
    async fn process_connect(
        &self,
        _host: &HostRecord,
        _startup: &Command,
        _force_reconnect: bool,
    ) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn process_disconnect(&self, _host_id: HostId, _status: HostStatus) -> Dispatch {
        Dispatch::NotHandled
    }

    fn process_timeout(&self, _host_id: HostId, _seq: u64) -> Dispatch {
        Dispatch::NotHandled
    }

    /// Recurring listeners stay registered after their first answer.
    fn is_recurring(&self) -> bool {
        false
    }

    /// Alarm after which the registration is cancelled.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Record the peer a forwarded request went to.
    fn set_peer(&self, _peer: MsId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type Entry = (ListenerHandle, Arc<dyn Listener>);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    connection: RwLock<Vec<Entry>>,
    command: RwLock<Vec<Entry>>,
}

fn insert(list: &RwLock<Vec<Entry>>, entry: Entry, priority: bool) {
    let mut list = list.write();
    if priority {
        list.insert(0, entry);
    } else {
        list.push(entry);
    }
}

fn snapshot(list: &RwLock<Vec<Entry>>) -> Vec<Arc<dyn Listener>> {
    list.read().iter().map(|(_, l)| l.clone()).collect()
}

/// Offer an event to each listener in order, stopping at the first veto.
fn dispatch_all<F>(listeners: Vec<Arc<dyn Listener>>, mut offer: F) -> Dispatch
where
    F: FnMut(&dyn Listener) -> Dispatch,
{
    let mut outcome = Dispatch::NotHandled;
    for listener in listeners {
        match offer(listener.as_ref()) {
            Dispatch::Veto => return Dispatch::Veto,
            Dispatch::Handled => outcome = Dispatch::Handled,
            Dispatch::NotHandled => {}
        }
    }
    outcome
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        listener: Arc<dyn Listener>,
        want_connections: bool,
        want_commands: bool,
        priority: bool,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        if want_connections {
            insert(&self.connection, (handle, listener.clone()), priority);
        }
        if want_commands {
            insert(&self.command, (handle, listener), priority);
        }
        handle
    }

    pub fn unregister(&self, handle: ListenerHandle) {
        self.connection.write().retain(|(h, _)| *h != handle);
        self.command.write().retain(|(h, _)| *h != handle);
    }

    /// Offer a new connection to every connection listener. The first
    /// refusal wins and later listeners are not consulted.
    pub async fn notify_connect(
        &self,
        host: &HostRecord,
        startup: &Command,
        force_reconnect: bool,
    ) -> Result<(), ConnectionError> {
        for listener in snapshot(&self.connection) {
            listener
                .process_connect(host, startup, force_reconnect)
                .await?;
        }
        Ok(())
    }

    pub fn notify_disconnect(&self, host_id: HostId, status: HostStatus) {
        for listener in snapshot(&self.connection) {
            listener.process_disconnect(host_id, status);
        }
    }

    pub fn notify_answers(&self, host_id: HostId, seq: u64, answers: &[Answer]) -> Dispatch {
        dispatch_all(snapshot(&self.command), |l| {
            l.process_answers(host_id, seq, answers)
        })
    }

    pub fn notify_commands(&self, host_id: HostId, seq: u64, commands: &[Command]) -> Dispatch {
        dispatch_all(snapshot(&self.command), |l| {
            l.process_commands(host_id, seq, commands)
        })
    }

    pub fn connection_listener_count(&self) -> usize {
        self.connection.read().len()
    }

    pub fn command_listener_count(&self) -> usize {
        self.command.read().len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use agent_manager_types::HostType;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        reply: Dispatch,
        refuse: Option<ConnectionError>,
    }

    #[async_trait]
    impl Listener for Recording {
        fn process_commands(&self, _: HostId, _: u64, _: &[Command]) -> Dispatch {
            self.log.lock().push(self.name);
            self.reply
        }

        async fn process_connect(
            &self,
            _: &HostRecord,
            _: &Command,
            _: bool,
        ) -> Result<(), ConnectionError> {
            self.log.lock().push(self.name);
            match &self.refuse {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn process_disconnect(&self, _: HostId, _: HostStatus) -> Dispatch {
            self.log.lock().push(self.name);
            Dispatch::Handled
        }
    }

    fn recording(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        reply: Dispatch,
    ) -> Arc<Recording> {
        Arc::new(Recording {
            name,
            log: log.clone(),
            reply,
            refuse: None,
        })
    }

    fn startup() -> Command {
        Command::new("Startup", Value::Null)
    }

    #[test]
    fn test_priority_listeners_run_first() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording("a", &log, Dispatch::NotHandled), false, true, false);
        registry.register(recording("b", &log, Dispatch::NotHandled), false, true, false);
        registry.register(recording("p", &log, Dispatch::NotHandled), false, true, true);

        let outcome = registry.notify_commands(1, 1, &[]);
        assert_eq!(outcome, Dispatch::NotHandled);
        assert_eq!(*log.lock(), vec!["p", "a", "b"]);
    }

    #[test]
    fn test_veto_short_circuits_and_handled_continues() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording("h", &log, Dispatch::Handled), false, true, false);
        registry.register(recording("v", &log, Dispatch::Veto), false, true, false);
        registry.register(recording("late", &log, Dispatch::Handled), false, true, false);

        assert_eq!(registry.notify_commands(1, 1, &[]), Dispatch::Veto);
        assert_eq!(*log.lock(), vec!["h", "v"]);
    }

    #[test]
    fn test_unregister_removes_from_both_lists() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle =
            registry.register(recording("x", &log, Dispatch::Handled), true, true, false);
        assert_eq!(registry.connection_listener_count(), 1);
        assert_eq!(registry.command_listener_count(), 1);

        registry.unregister(handle);
        registry.notify_disconnect(1, HostStatus::Alert);
        assert_eq!(registry.notify_commands(1, 1, &[]), Dispatch::NotHandled);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_first_connect_refusal_wins() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(recording("ok", &log, Dispatch::Handled), true, false, false);
        registry.register(
            Arc::new(Recording {
                name: "no",
                log: log.clone(),
                reply: Dispatch::Handled,
                refuse: Some(ConnectionError::Declined("not today".into())),
            }),
            true,
            false,
            false,
        );
        registry.register(recording("never", &log, Dispatch::Handled), true, false, false);

        let host = HostRecord::new(9, "h9", HostType::Routing);
        let err = registry
            .notify_connect(&host, &startup(), false)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::Declined("not today".into()));
        assert_eq!(*log.lock(), vec!["ok", "no"]);
    }
}
