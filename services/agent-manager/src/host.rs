// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Collaborators the manager consumes: host records, HA, alerting and
//! direct-agent resources, plus the in-memory implementations the binary
//! runs with.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use agent_manager_types::{HostId, HostRecord, HostStatus, MsId};
use async_trait::async_trait;
use parking_lot::Mutex;
use strum::Display;
use tracing::{info, warn};

use crate::attache::ServerResource;
use crate::error::{AgentError, Result};

/// Host records as seen by the agent manager.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn find(&self, host_id: HostId) -> Result<Option<HostRecord>>;

    /// Move a host from `expected` to `next` and record `owner`. Returns
    /// false without changing anything if the host is no longer in
    /// `expected`.
    async fn update_status(
        &self,
        host_id: HostId,
        expected: HostStatus,
        next: HostStatus,
        owner: Option<MsId>,
    ) -> Result<bool>;

    async fn record_ping(&self, host_id: HostId, at: i64) -> Result<()>;

    /// Atomically take ownership of up to `limit` direct hosts that have
    /// no owner.
    async fn claim_unowned(&self, ms_id: MsId, limit: usize) -> Result<Vec<HostRecord>>;

    async fn list_by_owner(&self, ms_id: MsId) -> Result<Vec<HostRecord>>;

    async fn list_all(&self) -> Result<Vec<HostRecord>>;

    async fn set_owner(&self, host_id: HostId, owner: Option<MsId>) -> Result<()>;
}

/// Higher-level investigation of hosts that stopped answering.
#[async_trait]
pub trait HighAvailability: Send + Sync {
    /// Decide whether the host is up or down. None when undetermined.
    async fn investigate(&self, host: &HostRecord) -> Option<HostStatus>;

    /// Restart the guests of a host found to be down.
    async fn schedule_restart(&self, host: &HostRecord, investigate: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AlertKind {
    Host,
    ManagementNode,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(
        &self,
        kind: AlertKind,
        zone_id: u64,
        pod_id: Option<u64>,
        subject: &str,
        body: &str,
    );
}

/// Builds the in-process resource for a direct host.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, host: &HostRecord) -> Result<Arc<dyn ServerResource>>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn HostStore>,
    pub ha: Arc<dyn HighAvailability>,
    pub alerts: Arc<dyn AlertSink>,
    pub resources: Arc<dyn ResourceLoader>,
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryHostStore {
    hosts: Mutex<BTreeMap<HostId, HostRecord>>,
}

impl MemoryHostStore {
    pub fn new(hosts: impl IntoIterator<Item = HostRecord>) -> Self {
        MemoryHostStore {
            hosts: Mutex::new(hosts.into_iter().map(|h| (h.id, h)).collect()),
        }
    }

    /// Load a JSON array of host records.
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read hosts file: {}", path.display()))?;
        let hosts: Vec<HostRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse hosts file: {}", path.display()))?;
        info!(hosts = hosts.len(), path = %path.display(), "loaded host records");
        Ok(Self::new(hosts))
    }

    pub fn insert(&self, host: HostRecord) {
        self.hosts.lock().insert(host.id, host);
    }

    pub fn get(&self, host_id: HostId) -> Option<HostRecord> {
        self.hosts.lock().get(&host_id).cloned()
    }
}

fn missing(host_id: HostId) -> AgentError {
    AgentError::HostNotFound(host_id)
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn find(&self, host_id: HostId) -> Result<Option<HostRecord>> {
        Ok(self.get(host_id))
    }

    async fn update_status(
        &self,
        host_id: HostId,
        expected: HostStatus,
        next: HostStatus,
        owner: Option<MsId>,
    ) -> Result<bool> {
        let mut hosts = self.hosts.lock();
        let host = hosts.get_mut(&host_id).ok_or_else(|| missing(host_id))?;
        if host.status != expected {
            return Ok(false);
        }
        host.status = next;
        host.owner = owner;
        Ok(true)
    }

    async fn record_ping(&self, host_id: HostId, at: i64) -> Result<()> {
        let mut hosts = self.hosts.lock();
        let host = hosts.get_mut(&host_id).ok_or_else(|| missing(host_id))?;
        host.last_ping = at;
        Ok(())
    }

    async fn claim_unowned(&self, ms_id: MsId, limit: usize) -> Result<Vec<HostRecord>> {
        let mut hosts = self.hosts.lock();
        let claimed = hosts
            .values_mut()
            .filter(|h| h.direct && h.owner.is_none() && h.status != HostStatus::Removed)
            .take(limit)
            .map(|h| {
                h.owner = Some(ms_id);
                h.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn list_by_owner(&self, ms_id: MsId) -> Result<Vec<HostRecord>> {
        Ok(self
            .hosts
            .lock()
            .values()
            .filter(|h| h.owner == Some(ms_id))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<HostRecord>> {
        Ok(self.hosts.lock().values().cloned().collect())
    }

    async fn set_owner(&self, host_id: HostId, owner: Option<MsId>) -> Result<()> {
        let mut hosts = self.hosts.lock();
        let host = hosts.get_mut(&host_id).ok_or_else(|| missing(host_id))?;
        host.owner = owner;
        Ok(())
    }
}

/// HA investigator that never reaches a verdict.
#[derive(Debug, Default)]
pub struct NoopHighAvailability;

#[async_trait]
impl HighAvailability for NoopHighAvailability {
    async fn investigate(&self, _host: &HostRecord) -> Option<HostStatus> {
        None
    }

    async fn schedule_restart(&self, host: &HostRecord, _investigate: bool) {
        info!(host_id = host.id, "no HA configured, not restarting guests");
    }
}

/// Alert sink that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_alert(
        &self,
        kind: AlertKind,
        zone_id: u64,
        pod_id: Option<u64>,
        subject: &str,
        body: &str,
    ) {
        warn!(%kind, zone_id, ?pod_id, body, "ALERT: {subject}");
    }
}

/// Loader for deployments without direct hosts.
#[derive(Debug, Default)]
pub struct NoDirectResources;

#[async_trait]
impl ResourceLoader for NoDirectResources {
    async fn load(&self, host: &HostRecord) -> Result<Arc<dyn ServerResource>> {
        Err(AgentError::unavailable(
            host.id,
            "no resource loader configured for direct hosts",
        ))
    }
}

impl Collaborators {
    /// Standalone collaborators over the given store.
    pub fn standalone(store: Arc<dyn HostStore>) -> Self {
        Collaborators {
            store,
            ha: Arc::new(NoopHighAvailability),
            alerts: Arc::new(LogAlertSink),
            resources: Arc::new(NoDirectResources),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use agent_manager_types::HostType;
    use std::io::Write;

    fn direct(id: HostId) -> HostRecord {
        HostRecord {
            direct: true,
            status: HostStatus::Disconnected,
            ..HostRecord::new(id, format!("h{id}"), HostType::Routing)
        }
    }

    #[tokio::test]
    async fn test_conditional_status_update() {
        let store = MemoryHostStore::new([direct(1)]);
        assert!(
            !store
                .update_status(1, HostStatus::Up, HostStatus::Alert, None)
                .await
                .unwrap()
        );
        assert!(
            store
                .update_status(1, HostStatus::Disconnected, HostStatus::Connecting, Some(4))
                .await
                .unwrap()
        );
        let host = store.get(1).unwrap();
        assert_eq!(host.status, HostStatus::Connecting);
        assert_eq!(host.owner, Some(4));
        assert!(store.update_status(9, HostStatus::Up, HostStatus::Up, None).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_bounded() {
        let mut removed = direct(3);
        removed.status = HostStatus::Removed;
        let mut socket = direct(4);
        socket.direct = false;
        let store = MemoryHostStore::new([direct(1), direct(2), removed, socket, direct(5)]);

        let first = store.claim_unowned(7, 2).await.unwrap();
        assert_eq!(first.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2]);
        let second = store.claim_unowned(8, 10).await.unwrap();
        assert_eq!(second.iter().map(|h| h.id).collect::<Vec<_>>(), vec![5]);
        assert!(store.claim_unowned(9, 10).await.unwrap().is_empty());
        assert_eq!(store.list_by_owner(7).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": 1, "name": "cn1", "status": "Up", "owner": 2}},
                {{"id": 2, "name": "cn2", "status": "Disconnected", "direct": true}}]"#
        )
        .unwrap();

        let store = MemoryHostStore::from_file(file.path()).await.unwrap();
        assert_eq!(store.get(1).unwrap().owner, Some(2));
        assert!(store.get(2).unwrap().direct);
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }
}
