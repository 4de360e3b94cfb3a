/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The remote-runtime seam.
//!
//! Monitors and peers consume runtimes through [`RemoteRuntime`], a
//! small async trait carrying exactly what observation needs: a
//! liveness probe, snapshots, and kill. [`Runtime`] implements it
//! directly; a transport binding would implement it over the wire.
//! [`RuntimeDirectory`] is the in-process expose/lookup registry that
//! stands in for the remote-object layer.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;

use crate::reference::BodyId;
use crate::reference::HostUrl;
use crate::reference::NodeUrl;
use crate::reference::RuntimeUrl;
use crate::reference::VmId;
use crate::runtime::Runtime;

/// Errors surfaced by calls across the remote seam.
#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    /// The peer cannot be reached or refused the call. The caller's
    /// current pass gives up on this peer; the next pass retries.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The requested entity does not exist on the peer.
    #[error("not found: {0}")]
    NotFound(String),
}

/// A point-in-time description of a runtime: its identity and the
/// urls of its local nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// The runtime's url.
    pub url: RuntimeUrl,
    /// The runtime's vm id.
    pub vm_id: VmId,
    /// The runtime's vm name.
    pub vm_name: String,
    /// The operating system the runtime's process runs on.
    pub os_name: String,
    /// The processor architecture the runtime's process runs on.
    pub os_arch: String,
    /// The urls of the runtime's local nodes, sorted.
    pub node_urls: Vec<NodeUrl>,
}

/// A point-in-time description of one node and its live bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// The node's url.
    pub url: NodeUrl,
    /// The node's name.
    pub name: String,
    /// The virtual node the node was deployed under, if any.
    pub virtual_node_name: Option<String>,
    /// The node's live bodies, sorted by id.
    pub bodies: Vec<BodySnapshot>,
}

/// A point-in-time description of one body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodySnapshot {
    /// The body's identifier.
    pub id: BodyId,
    /// The class name of the computation the body runs.
    pub class_name: String,
    /// The number of requests waiting to be served.
    pub request_queue_length: usize,
}

/// The observation surface of a runtime, local or remote.
#[async_trait]
pub trait RemoteRuntime: Send + Sync + Debug {
    /// The runtime's url.
    fn url(&self) -> RuntimeUrl;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Describe the runtime and its nodes.
    async fn snapshot(&self) -> Result<RuntimeSnapshot, RemoteError>;

    /// Describe one node and its live bodies.
    async fn node_snapshot(&self, node_url: &NodeUrl) -> Result<NodeSnapshot, RemoteError>;

    /// Kill the runtime.
    async fn kill(&self, softly: bool) -> Result<(), RemoteError>;
}

#[async_trait]
impl RemoteRuntime for Runtime {
    fn url(&self) -> RuntimeUrl {
        Runtime::url(self).clone()
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        if self.is_terminated() {
            return Err(RemoteError::Unavailable(Runtime::url(self).to_string()));
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<RuntimeSnapshot, RemoteError> {
        if self.is_terminated() {
            return Err(RemoteError::Unavailable(Runtime::url(self).to_string()));
        }
        Ok(Runtime::snapshot(self))
    }

    async fn node_snapshot(&self, node_url: &NodeUrl) -> Result<NodeSnapshot, RemoteError> {
        if self.is_terminated() {
            return Err(RemoteError::Unavailable(Runtime::url(self).to_string()));
        }
        if node_url.host_url() != self.host_url() {
            return Err(RemoteError::NotFound(node_url.to_string()));
        }
        Runtime::node_snapshot(self, node_url.node_name())
            .ok_or_else(|| RemoteError::NotFound(node_url.to_string()))
    }

    async fn kill(&self, softly: bool) -> Result<(), RemoteError> {
        Runtime::kill(self, softly);
        Ok(())
    }
}

/// The in-process expose/lookup registry. Cheaply cloneable; clones
/// share the same table. A runtime exposed here withdraws itself on
/// kill.
#[derive(Clone, Debug, Default)]
pub struct RuntimeDirectory {
    state: Arc<DirectoryState>,
}

#[derive(Debug, Default)]
pub(crate) struct DirectoryState {
    runtimes: DashMap<String, Runtime>,
}

impl RuntimeDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> Weak<DirectoryState> {
        Arc::downgrade(&self.state)
    }

    pub(crate) fn upgrade(state: &Weak<DirectoryState>) -> Option<Self> {
        state.upgrade().map(|state| Self { state })
    }

    /// Make `runtime` reachable through this directory. Re-exposing
    /// the same url replaces the entry.
    pub fn expose(&self, runtime: &Runtime) {
        runtime.set_exposure(self);
        self.state
            .runtimes
            .insert(Runtime::url(runtime).to_string(), runtime.clone());
        tracing::info!(url = %Runtime::url(runtime), "runtime exposed");
    }

    /// Withdraw the runtime at `url`. Unknown urls are ignored.
    pub fn unexpose(&self, url: &RuntimeUrl) {
        if let Some((_, runtime)) = self.state.runtimes.remove(&url.to_string()) {
            runtime.clear_exposure();
            tracing::info!(url = %url, "runtime unexposed");
        }
    }

    /// Withdraw every exposed runtime.
    pub fn unexpose_all(&self) {
        let urls: Vec<RuntimeUrl> = self
            .state
            .runtimes
            .iter()
            .map(|entry| Runtime::url(entry.value()).clone())
            .collect();
        for url in urls {
            self.unexpose(&url);
        }
    }

    /// Resolve a runtime url to its observation surface.
    pub fn lookup(&self, url: &RuntimeUrl) -> Result<Arc<dyn RemoteRuntime>, RemoteError> {
        self.state
            .runtimes
            .get(&url.to_string())
            .map(|entry| Arc::new(entry.value().clone()) as Arc<dyn RemoteRuntime>)
            .ok_or_else(|| RemoteError::NotFound(url.to_string()))
    }

    /// Resolve a runtime url to the concrete in-process runtime.
    /// Migration ground truth moves through this, not the trait.
    pub fn lookup_local(&self, url: &RuntimeUrl) -> Option<Runtime> {
        self.state
            .runtimes
            .get(&url.to_string())
            .map(|entry| entry.value().clone())
    }

    /// The urls of the exposed runtimes advertising themselves on
    /// `host`, sorted. This is the host-level scan monitors discover
    /// runtimes with.
    pub fn runtimes_on(&self, host: &HostUrl) -> Vec<RuntimeUrl> {
        let mut urls: Vec<RuntimeUrl> = self
            .state
            .runtimes
            .iter()
            .filter(|entry| Runtime::url(entry.value()).host_url() == host)
            .map(|entry| Runtime::url(entry.value()).clone())
            .collect();
        urls.sort();
        urls
    }

    /// The number of exposed runtimes.
    pub fn len(&self) -> usize {
        self.state.runtimes.len()
    }

    /// Whether no runtime is exposed.
    pub fn is_empty(&self) -> bool {
        self.state.runtimes.is_empty()
    }
}
