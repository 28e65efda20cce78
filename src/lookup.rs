//! Topology and name-resolution contracts consumed by query planning.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::query::id::Id;
use crate::storage::reader::{ReadError, ReadResult, Reader};

/// Discovers the storage hosts a query may be sent to
pub trait HostLookup: Send + Sync {
    fn hosts(&self) -> Vec<String>;

    /// Returns a receiver that is notified when the host list may have
    /// changed, or `None` when it never changes.
    fn watch(&self) -> Option<watch::Receiver<()>>;
}

/// Waits until the host list of `lookup` may have changed.
///
/// Never completes for lookups without change notification.
pub async fn changed(lookup: &dyn HostLookup) {
    match lookup.watch() {
        Some(mut rx) => {
            if rx.changed().await.is_err() {
                // sender dropped; the list can no longer change
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// A fixed host list
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    hosts: Vec<String>,
}

impl StaticLookup {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

impl HostLookup for StaticLookup {
    fn hosts(&self) -> Vec<String> {
        self.hosts.clone()
    }

    fn watch(&self) -> Option<watch::Receiver<()>> {
        None
    }
}

/// A host list that can be replaced at runtime, notifying watchers
#[derive(Debug)]
pub struct WatchedLookup {
    hosts: RwLock<Vec<String>>,
    notify: watch::Sender<()>,
}

impl WatchedLookup {
    pub fn new(hosts: Vec<String>) -> Self {
        let (notify, _) = watch::channel(());
        Self {
            hosts: RwLock::new(hosts),
            notify,
        }
    }

    /// Replaces the host list and signals every watcher
    pub fn set_hosts(&self, hosts: Vec<String>) {
        debug!("Host list changed: {:?}", hosts);
        match self.hosts.write() {
            Ok(mut guard) => *guard = hosts,
            Err(poisoned) => *poisoned.into_inner() = hosts,
        }
        self.notify.send_replace(());
    }
}

impl HostLookup for WatchedLookup {
    fn hosts(&self) -> Vec<String> {
        match self.hosts.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn watch(&self) -> Option<watch::Receiver<()>> {
        Some(self.notify.subscribe())
    }
}

/// Resolves bucket names within an organization
#[async_trait]
pub trait BucketLookup: Send + Sync {
    /// Returns `Ok(None)` when no bucket has that name
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        organization_id: Id,
        name: &str,
    ) -> ReadResult<Option<Id>>;
}

/// Resolves organization names
#[async_trait]
pub trait OrganizationLookup: Send + Sync {
    /// Returns `Ok(None)` when no organization has that name
    async fn lookup(&self, cancel: &CancellationToken, name: &str) -> ReadResult<Option<Id>>;
}

/// Map-backed bucket lookup
#[derive(Debug, Default)]
pub struct MemBucketLookup {
    buckets: HashMap<(Id, String), Id>,
}

impl MemBucketLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, organization_id: Id, name: impl Into<String>, id: Id) {
        self.buckets.insert((organization_id, name.into()), id);
    }
}

#[async_trait]
impl BucketLookup for MemBucketLookup {
    async fn lookup(
        &self,
        cancel: &CancellationToken,
        organization_id: Id,
        name: &str,
    ) -> ReadResult<Option<Id>> {
        if cancel.is_cancelled() {
            return Err(ReadError::Cancelled);
        }
        Ok(self.buckets.get(&(organization_id, name.to_string())).copied())
    }
}

/// Map-backed organization lookup
#[derive(Debug, Default)]
pub struct MemOrganizationLookup {
    organizations: HashMap<String, Id>,
}

impl MemOrganizationLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, id: Id) {
        self.organizations.insert(name.into(), id);
    }
}

#[async_trait]
impl OrganizationLookup for MemOrganizationLookup {
    async fn lookup(&self, cancel: &CancellationToken, name: &str) -> ReadResult<Option<Id>> {
        if cancel.is_cancelled() {
            return Err(ReadError::Cancelled);
        }
        Ok(self.organizations.get(name).copied())
    }
}

/// A collaborator the query engine needs wired in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Reader,
    BucketLookup,
    OrganizationLookup,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dependency::Reader => "reader",
            Dependency::BucketLookup => "bucket lookup",
            Dependency::OrganizationLookup => "organization lookup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {} dependency", join(.0))]
    MissingDependency(Vec<Dependency>),
}

fn join(deps: &[Dependency]) -> String {
    deps.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Collaborators the storage layer needs, validated together at wiring time
#[derive(Clone, Default)]
pub struct Dependencies {
    pub reader: Option<Arc<dyn Reader>>,
    pub bucket_lookup: Option<Arc<dyn BucketLookup>>,
    pub organization_lookup: Option<Arc<dyn OrganizationLookup>>,
}

impl Dependencies {
    /// Fails naming every collaborator that is not set
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.reader.is_none() {
            missing.push(Dependency::Reader);
        }
        if self.bucket_lookup.is_none() {
            missing.push(Dependency::BucketLookup);
        }
        if self.organization_lookup.is_none() {
            missing.push(Dependency::OrganizationLookup);
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingDependency(missing))
        }
    }
}
