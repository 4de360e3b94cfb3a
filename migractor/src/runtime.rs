/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The process-scoped runtime.
//!
//! A [`Runtime`] owns the ground truth for one process: its local
//! nodes, the body store, the registry of peer runtimes, and the
//! virtual-node name registry. It publishes lifecycle events through a
//! typed observer bus. All state is injected at construction from a
//! [`RuntimeConfig`]; there is no process-global instance, so tests
//! can run any number of isolated runtimes side by side.
//!
//! `Runtime` is a cheap-clone handle; clones share the same state.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::DashSet;
use dashmap::mapref::entry::Entry;

use crate::body::BodyHandle;
use crate::body::BodyRef;
use crate::body::BodyStore;
use crate::body::ConstructorCall;
use crate::body::SpawnedBody;
use crate::config::RuntimeConfig;
use crate::event::RuntimeEvent;
use crate::event::RuntimeEventKind;
use crate::event::RuntimeRegistration;
use crate::node::LocalNode;
use crate::node::TerminationReport;
use crate::observer::Observers;
use crate::reference::BodyId;
use crate::reference::HostUrl;
use crate::reference::NodeUrl;
use crate::reference::RuntimeUrl;
use crate::reference::VmId;
use crate::reference::is_half_bodies_node;
use crate::remote::BodySnapshot;
use crate::remote::DirectoryState;
use crate::remote::NodeSnapshot;
use crate::remote::RuntimeDirectory;
use crate::remote::RuntimeSnapshot;

/// Errors from node creation.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    /// The node name is taken and replacement was not requested.
    #[error("node {0} is already bound")]
    AlreadyBound(String),

    /// The runtime has been killed; no further nodes can be created.
    #[error("runtime {0} is terminated")]
    Terminated(RuntimeUrl),
}

/// Errors from body creation and migration arrival.
#[derive(thiserror::Error, Debug)]
pub enum BodyCreationError {
    /// The named node is reserved and accepts no user bodies.
    #[error("node {0} is reserved")]
    ReservedNode(String),

    /// No local node has the given name.
    #[error("no local node named {0}")]
    UnknownNode(String),

    /// The body's constructor call failed.
    #[error("body construction failed: {0}")]
    ConstructionFailed(#[source] anyhow::Error),

    /// The runtime has been killed; no further bodies can be created.
    #[error("runtime {0} is terminated")]
    Terminated(RuntimeUrl),
}

/// Errors from moving a body to another node.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    /// The body to migrate is not registered in this runtime.
    #[error("no body {0} in this runtime")]
    UnknownBody(BodyId),

    /// The destination refused the body. The body stays fully
    /// registered at its source.
    #[error("destination refused body: {0}")]
    Destination(#[from] BodyCreationError),

    /// The source runtime has been killed.
    #[error("runtime {0} is terminated")]
    Terminated(RuntimeUrl),
}

/// A process-scoped runtime. See the module documentation.
#[derive(Clone, Debug)]
pub struct Runtime {
    state: Arc<RuntimeState>,
}

#[derive(Debug)]
struct RuntimeState {
    config: RuntimeConfig,
    vm_id: VmId,
    vm_name: String,
    url: RuntimeUrl,
    nodes: DashMap<String, LocalNode>,
    store: BodyStore,
    peers: DashMap<String, RuntimeRegistration>,
    virtual_nodes: DashSet<String>,
    next_body_seq: AtomicU64,
    events: Observers<RuntimeEvent>,
    terminated: AtomicBool,
    exposure: Mutex<Option<Weak<DirectoryState>>>,
}

impl Runtime {
    /// Start a runtime from `config`. The runtime's name is minted
    /// from a fresh random vm id, so every construction yields a
    /// distinct url even with identical configs.
    pub fn new(config: RuntimeConfig) -> Self {
        let vm_id = VmId::random();
        let vm_name = format!("PA_JVM{}", vm_id.0 % 1_000_000);
        let host_url = HostUrl::new(config.protocol, config.host.clone(), config.port);
        let url = host_url.runtime_url(vm_name.clone());
        tracing::info!(url = %url, vm_id = %vm_id, "runtime started");
        Self {
            state: Arc::new(RuntimeState {
                config,
                vm_id,
                vm_name,
                url,
                nodes: DashMap::new(),
                store: BodyStore::new(),
                peers: DashMap::new(),
                virtual_nodes: DashSet::new(),
                next_body_seq: AtomicU64::new(1),
                events: Observers::new(),
                terminated: AtomicBool::new(false),
                exposure: Mutex::new(None),
            }),
        }
    }

    /// The runtime's url.
    pub fn url(&self) -> &RuntimeUrl {
        &self.state.url
    }

    /// The url of the host this runtime advertises itself on.
    pub fn host_url(&self) -> &HostUrl {
        self.state.url.host_url()
    }

    /// The runtime's vm id.
    pub fn vm_id(&self) -> VmId {
        self.state.vm_id
    }

    /// The runtime's vm name (the `PA_JVM<n>` tag).
    pub fn vm_name(&self) -> &str {
        &self.state.vm_name
    }

    /// The configuration the runtime was built from.
    pub fn config(&self) -> &RuntimeConfig {
        &self.state.config
    }

    /// Whether [`Self::kill`] has run.
    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    /// The runtime's lifecycle event bus.
    pub fn events(&self) -> &Observers<RuntimeEvent> {
        &self.state.events
    }

    /// The registration payload peers record for this runtime.
    pub fn registration(&self) -> RuntimeRegistration {
        RuntimeRegistration {
            creator_id: self.state.vm_id,
            runtime_url: self.state.url.clone(),
            protocol: self.state.config.protocol,
            vm_name: self.state.vm_name.clone(),
        }
    }

    /// Mint a body identifier. Identifiers are unique for the life of
    /// the process and never reused.
    pub fn next_body_id(&self) -> BodyId {
        BodyId(
            self.state.vm_id,
            self.state.next_body_seq.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn emit(&self, kind: RuntimeEventKind) {
        let event = RuntimeEvent::new(self.state.url.clone(), kind);
        self.state.events.notify(&event);
    }

    /// Create (or replace) the local node `name`. With `replace`
    /// false, an existing binding is an [`NodeError::AlreadyBound`]
    /// failure. With `replace` true, the new node takes over the
    /// previous node's resident body list; the bodies themselves are
    /// untouched.
    pub fn create_local_node(
        &self,
        name: &str,
        replace: bool,
        virtual_node_name: Option<&str>,
    ) -> Result<LocalNode, NodeError> {
        if self.is_terminated() {
            return Err(NodeError::Terminated(self.state.url.clone()));
        }
        let node = LocalNode::new(self.host_url().node_url(name));
        if let Some(vn_name) = virtual_node_name {
            node.set_virtual_node_name(Some(vn_name.to_string()));
        }
        let inherited = match self.state.nodes.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if !replace {
                    return Err(NodeError::AlreadyBound(name.to_string()));
                }
                let previous = entry.insert(node.clone());
                tracing::debug!(node = %node.url(), "replaced existing node binding");
                previous.body_ids()
            }
            Entry::Vacant(entry) => {
                entry.insert(node.clone());
                Vec::new()
            }
        };
        for id in inherited {
            node.register_body(id);
        }
        tracing::info!(node = %node.url(), "node created");
        self.emit(RuntimeEventKind::NodeCreated {
            node_url: node.url().clone(),
        });
        Ok(node)
    }

    /// Create the runtime's capacity nodes, one per configured slot,
    /// named `<vm name>_GCM_NODE_<i>`. Existing bindings with those
    /// names are replaced.
    pub fn create_capacity_nodes(&self) -> Result<Vec<LocalNode>, NodeError> {
        let mut nodes = Vec::with_capacity(self.state.config.capacity);
        for i in 0..self.state.config.capacity {
            let name = format!("{}_GCM_NODE_{}", self.state.vm_name, i);
            nodes.push(self.create_local_node(&name, true, None)?);
        }
        Ok(nodes)
    }

    /// Look up a local node by name.
    pub fn local_node(&self, name: &str) -> Option<LocalNode> {
        self.state.nodes.get(name).map(|entry| entry.value().clone())
    }

    /// The local nodes, sorted by name.
    pub fn local_nodes(&self) -> Vec<LocalNode> {
        let mut nodes: Vec<LocalNode> = self
            .state
            .nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// The local node names, sorted.
    pub fn local_node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Set a deployment property on a local node, returning the
    /// previous value. `None` when the node does not exist or the key
    /// was unset.
    pub fn set_local_node_property(
        &self,
        node_name: &str,
        key: String,
        value: String,
    ) -> Option<String> {
        self.local_node(node_name)
            .and_then(|node| node.set_property(key, value))
    }

    /// Read a deployment property off a local node.
    pub fn local_node_property(&self, node_name: &str, key: &str) -> Option<String> {
        self.local_node(node_name).and_then(|node| node.property(key))
    }

    /// Create a body on the local node `node_name` by running
    /// `constructor_call` with a freshly minted identifier. Returns
    /// the body itself for in-process callers (`is_local`), a
    /// rebindable remote reference otherwise.
    pub fn create_body(
        &self,
        node_name: &str,
        constructor_call: ConstructorCall,
        is_local: bool,
    ) -> Result<SpawnedBody, BodyCreationError> {
        if self.is_terminated() {
            return Err(BodyCreationError::Terminated(self.state.url.clone()));
        }
        if is_half_bodies_node(node_name) {
            return Err(BodyCreationError::ReservedNode(node_name.to_string()));
        }
        let node = self
            .local_node(node_name)
            .ok_or_else(|| BodyCreationError::UnknownNode(node_name.to_string()))?;
        let body =
            constructor_call(self.next_body_id()).map_err(BodyCreationError::ConstructionFailed)?;
        let id = body.id();
        let class_name = body.class_name().to_string();
        self.state.store.register(Arc::clone(&body));
        node.register_body(id);
        tracing::info!(body = %id, class_name = %class_name, node = %node.url(), "body created");
        self.emit(RuntimeEventKind::BodyCreated {
            node_url: node.url().clone(),
            id,
            class_name,
        });
        Ok(if is_local {
            SpawnedBody::Local(body)
        } else {
            SpawnedBody::Adapter(BodyRef::new(id, node.url().clone()))
        })
    }

    /// Register a half body (a client-side proxy with no hosting
    /// node). Half bodies never show up in node scans; they are
    /// terminated with everything else when the runtime is killed.
    pub fn register_half_body(&self, body: BodyHandle) -> Result<(), BodyCreationError> {
        if self.is_terminated() {
            return Err(BodyCreationError::Terminated(self.state.url.clone()));
        }
        if !self.state.store.register_half(body) {
            tracing::debug!("half body already registered");
        }
        Ok(())
    }

    /// Accept a body migrating in from another runtime: register it
    /// in the store and on the named node, and announce the finished
    /// migration. Idempotent against re-delivery.
    pub fn receive_body(&self, node_name: &str, body: BodyHandle) -> Result<(), BodyCreationError> {
        if self.is_terminated() {
            return Err(BodyCreationError::Terminated(self.state.url.clone()));
        }
        if is_half_bodies_node(node_name) {
            return Err(BodyCreationError::ReservedNode(node_name.to_string()));
        }
        let node = self
            .local_node(node_name)
            .ok_or_else(|| BodyCreationError::UnknownNode(node_name.to_string()))?;
        let id = body.id();
        self.state.store.register(body);
        node.register_body(id);
        tracing::info!(body = %id, node = %node.url(), "body received");
        self.emit(RuntimeEventKind::MigrationFinished {
            id,
            destination_runtime_url: self.state.url.clone(),
        });
        Ok(())
    }

    /// Move the body `id` to `destination_node` on `destination`,
    /// which may be this runtime. The body keeps its identifier. On
    /// failure the body stays fully registered at its source.
    pub fn migrate_body(
        &self,
        id: &BodyId,
        destination: &Runtime,
        destination_node: &str,
    ) -> Result<(), MigrationError> {
        if self.is_terminated() {
            return Err(MigrationError::Terminated(self.state.url.clone()));
        }
        let body = self
            .state
            .store
            .get(id)
            .ok_or(MigrationError::UnknownBody(*id))?;
        let source_node = self
            .state
            .nodes
            .iter()
            .find(|entry| entry.value().body_ids().contains(id))
            .map(|entry| entry.value().clone());
        let destination_node_url = destination.host_url().node_url(destination_node);
        self.emit(RuntimeEventKind::MigrationAboutToStart {
            id: *id,
            destination_node_url: destination_node_url.clone(),
        });
        destination.receive_body(destination_node, body)?;

        let same_runtime = Arc::ptr_eq(&self.state, &destination.state);
        if let Some(node) = source_node {
            if !(same_runtime && node.name() == destination_node) {
                node.unregister_body(id);
            }
        }
        if !same_runtime {
            self.state.store.unregister(id);
        }
        tracing::info!(body = %id, destination = %destination_node_url, "body migrated");
        Ok(())
    }

    /// Terminate one body and drop it from the ground truth. Returns
    /// whether the body was present. A failing termination is logged;
    /// the body is dropped all the same.
    pub fn terminate_body(&self, id: &BodyId) -> bool {
        let Some(body) = self.state.store.unregister(id) else {
            return false;
        };
        let node_url = self
            .state
            .nodes
            .iter()
            .find(|entry| entry.value().body_ids().contains(id))
            .map(|entry| {
                let node = entry.value().clone();
                node.unregister_body(id);
                node.url().clone()
            });
        if let Err(err) = body.terminate() {
            tracing::warn!(body = %id, error = %err, "body termination failed; dropping anyway");
        }
        match node_url {
            Some(node_url) => {
                self.emit(RuntimeEventKind::BodyDestroyed { node_url, id: *id });
            }
            None => {
                tracing::debug!(body = %id, "terminated body was resident on no node");
            }
        }
        true
    }

    /// Kill the local node `name`: terminate its bodies best effort
    /// and drop the binding. A missing name is a no-op, as is the
    /// whole call once the runtime is terminated.
    pub fn kill_node(&self, name: &str) -> TerminationReport {
        if self.is_terminated() {
            return TerminationReport::default();
        }
        let Some((_, node)) = self.state.nodes.remove(name) else {
            tracing::debug!(node = name, "kill of unknown node ignored");
            return TerminationReport::default();
        };
        let node_url = node.url().clone();
        let report = node.terminate(&self.state.store);
        if report.all_failed() {
            tracing::warn!(node = %node_url, "every body termination on this node failed");
        }
        for id in report.removed() {
            self.emit(RuntimeEventKind::BodyDestroyed {
                node_url: node_url.clone(),
                id,
            });
        }
        tracing::info!(node = %node_url, "node killed");
        self.emit(RuntimeEventKind::NodeDestroyed { node_url });
        report
    }

    /// Kill every local node present when the call starts.
    pub fn kill_all_nodes(&self) -> TerminationReport {
        let names: Vec<String> = self
            .state
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut report = TerminationReport::default();
        for name in names {
            report.merge(self.kill_node(&name));
        }
        report
    }

    /// Record a peer runtime. Re-registration replaces the stored
    /// payload. Announced on the event bus either way.
    pub fn register_peer(&self, registration: RuntimeRegistration) {
        if self.is_terminated() {
            tracing::debug!(
                peer = %registration.runtime_url,
                "peer registration on terminated runtime ignored"
            );
            return;
        }
        let key = registration.runtime_url.to_string();
        self.state.peers.insert(key, registration.clone());
        tracing::info!(peer = %registration.runtime_url, "peer registered");
        self.emit(RuntimeEventKind::RuntimeRegistered(registration));
    }

    /// Drop a peer runtime. Unknown peers are ignored.
    pub fn unregister_peer(&self, url: &RuntimeUrl) {
        match self.state.peers.remove(&url.to_string()) {
            Some((_, registration)) => {
                tracing::info!(peer = %url, "peer unregistered");
                self.emit(RuntimeEventKind::RuntimeUnregistered(registration));
            }
            None => {
                tracing::debug!(peer = %url, "deregistration of unknown peer ignored");
            }
        }
    }

    /// Look up a peer registration by url.
    pub fn peer(&self, url: &RuntimeUrl) -> Option<RuntimeRegistration> {
        self.state
            .peers
            .get(&url.to_string())
            .map(|entry| entry.value().clone())
    }

    /// The registered peers, sorted by url.
    pub fn peers(&self) -> Vec<RuntimeRegistration> {
        let mut peers: Vec<RuntimeRegistration> = self
            .state
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by(|a, b| a.runtime_url.cmp(&b.runtime_url));
        peers
    }

    /// Register a virtual node name. With `replace` false, an
    /// existing registration is an [`NodeError::AlreadyBound`]
    /// failure.
    pub fn register_virtual_node(&self, name: &str, replace: bool) -> Result<(), NodeError> {
        if self.is_terminated() {
            return Err(NodeError::Terminated(self.state.url.clone()));
        }
        if !replace && self.state.virtual_nodes.contains(name) {
            return Err(NodeError::AlreadyBound(name.to_string()));
        }
        self.state.virtual_nodes.insert(name.to_string());
        Ok(())
    }

    /// Drop a virtual node name. Unknown names are ignored.
    pub fn unregister_virtual_node(&self, name: &str) {
        if self.state.virtual_nodes.remove(name).is_none() {
            tracing::debug!(virtual_node = name, "deregistration of unknown virtual node ignored");
        }
    }

    /// Drop every registered virtual node name.
    pub fn unregister_all_virtual_nodes(&self) {
        self.state.virtual_nodes.clear();
    }

    /// Whether the virtual node name is registered.
    pub fn virtual_node_registered(&self, name: &str) -> bool {
        self.state.virtual_nodes.contains(name)
    }

    /// The registered virtual node names, sorted.
    pub fn virtual_node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .virtual_nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Announce that `target` served a request sent by `source`.
    /// Feeds communication tracking in whoever observes this runtime.
    pub fn notify_request(&self, source: BodyId, target: BodyId) {
        if self.is_terminated() {
            return;
        }
        self.emit(RuntimeEventKind::RequestReceived { source, target });
    }

    /// Announce a body's new pending-request count.
    pub fn notify_request_queue(&self, id: BodyId, length: usize) {
        if self.is_terminated() {
            return;
        }
        self.emit(RuntimeEventKind::RequestQueueChanged { id, length });
    }

    /// Look up a live body by id.
    pub fn body(&self, id: &BodyId) -> Option<BodyHandle> {
        self.state.store.get(id)
    }

    /// The number of live bodies, half bodies excluded.
    pub fn body_count(&self) -> usize {
        self.state.store.local_count()
    }

    /// The number of registered half bodies.
    pub fn half_body_count(&self) -> usize {
        self.state.store.half_count()
    }

    /// A point-in-time description of this runtime: its identity and
    /// the urls of its nodes, sorted.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let mut node_urls: Vec<NodeUrl> = self
            .state
            .nodes
            .iter()
            .map(|entry| entry.value().url().clone())
            .collect();
        node_urls.sort();
        RuntimeSnapshot {
            url: self.state.url.clone(),
            vm_id: self.state.vm_id,
            vm_name: self.state.vm_name.clone(),
            os_name: std::env::consts::OS.to_string(),
            os_arch: std::env::consts::ARCH.to_string(),
            node_urls,
        }
    }

    /// A point-in-time description of one local node and its live
    /// bodies, sorted by id. `None` when the node does not exist.
    pub fn node_snapshot(&self, name: &str) -> Option<NodeSnapshot> {
        let node = self.local_node(name)?;
        let mut bodies: Vec<BodySnapshot> = node
            .bodies(&self.state.store)
            .into_iter()
            .map(|body| BodySnapshot {
                id: body.id(),
                class_name: body.class_name().to_string(),
                request_queue_length: body.request_queue_length(),
            })
            .collect();
        bodies.sort_by_key(|snapshot| snapshot.id);
        Some(NodeSnapshot {
            url: node.url().clone(),
            name: node.name().to_string(),
            virtual_node_name: node.virtual_node_name(),
            bodies,
        })
    }

    pub(crate) fn set_exposure(&self, directory: &RuntimeDirectory) {
        *self.state.exposure.lock().unwrap() = Some(directory.downgrade());
    }

    pub(crate) fn clear_exposure(&self) {
        self.state.exposure.lock().unwrap().take();
    }

    /// Kill the runtime: announce the death, tear down every node,
    /// terminate every remaining body (half bodies included) best
    /// effort, and withdraw from the directory it was exposed in.
    /// `softly` is recorded for operators; the teardown sequence is
    /// the same either way. Idempotent.
    pub fn kill(&self, softly: bool) -> TerminationReport {
        if self.state.terminated.swap(true, Ordering::SeqCst) {
            return TerminationReport::default();
        }
        tracing::info!(url = %self.state.url, softly, "killing runtime");
        self.emit(RuntimeEventKind::RuntimeDestroyed);
        let names: Vec<String> = self
            .state
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut report = TerminationReport::default();
        for name in names {
            if let Some((_, node)) = self.state.nodes.remove(&name) {
                report.merge(node.terminate(&self.state.store));
            }
        }
        for body in self.state.store.drain_all() {
            let id = body.id();
            match body.terminate() {
                Ok(()) => report.terminated.push(id),
                Err(err) => {
                    tracing::warn!(body = %id, error = %err, "body termination failed; continuing");
                    report.failed.push(id);
                }
            }
        }
        self.state.peers.clear();
        self.state.virtual_nodes.clear();
        let exposure = self.state.exposure.lock().unwrap().take();
        if let Some(directory) = exposure.as_ref().and_then(RuntimeDirectory::upgrade) {
            directory.unexpose(&self.state.url);
        }
        tracing::info!(
            url = %self.state.url,
            terminated = report.terminated.len(),
            failed = report.failed.len(),
            "runtime killed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBody;
    use crate::test_utils::constructor;

    fn test_config(port: u16) -> RuntimeConfig {
        RuntimeConfig::default().with_port(port).with_capacity(2)
    }

    fn collect_events(runtime: &Runtime) -> Arc<Mutex<Vec<RuntimeEventKind>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        runtime.events().attach(move |event: &RuntimeEvent| {
            sink.lock().unwrap().push(event.kind.clone());
        });
        collected
    }

    #[test]
    fn test_capacity_nodes_take_generated_names() {
        let runtime = Runtime::new(test_config(4000));
        let nodes = runtime.create_capacity_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        for (i, node) in nodes.iter().enumerate() {
            assert_eq!(node.name(), format!("{}_GCM_NODE_{}", runtime.vm_name(), i));
            assert_eq!(node.url().host_url(), runtime.host_url());
        }
        assert_eq!(runtime.local_node_names().len(), 2);
    }

    #[test]
    fn test_create_local_node_already_bound() {
        let runtime = Runtime::new(test_config(4001));
        runtime.create_local_node("n0", false, None).unwrap();
        let err = runtime.create_local_node("n0", false, None).unwrap_err();
        assert!(matches!(err, NodeError::AlreadyBound(name) if name == "n0"));
    }

    #[test]
    fn test_replace_inherits_resident_bodies() {
        let runtime = Runtime::new(test_config(4002));
        runtime.create_local_node("n0", false, None).unwrap();
        let spawned = runtime.create_body("n0", constructor("Worker"), true).unwrap();
        let id = spawned.id();

        let replacement = runtime.create_local_node("n0", true, Some("workers")).unwrap();
        assert_eq!(replacement.body_ids(), vec![id]);
        let snapshot = runtime.node_snapshot("n0").unwrap();
        assert_eq!(snapshot.bodies.len(), 1);
        assert_eq!(snapshot.bodies[0].id, id);
        assert_eq!(snapshot.virtual_node_name.as_deref(), Some("workers"));
    }

    #[test]
    fn test_create_body_failure_modes() {
        let runtime = Runtime::new(test_config(4003));
        runtime.create_local_node("n0", false, None).unwrap();

        let err = runtime
            .create_body("missing", constructor("Worker"), true)
            .unwrap_err();
        assert!(matches!(err, BodyCreationError::UnknownNode(_)));

        let err = runtime
            .create_body(
                crate::reference::HALF_BODIES_NODE_NAME,
                constructor("Worker"),
                true,
            )
            .unwrap_err();
        assert!(matches!(err, BodyCreationError::ReservedNode(_)));

        let failing: ConstructorCall = Box::new(|_| anyhow::bail!("no capacity"));
        let err = runtime.create_body("n0", failing, true).unwrap_err();
        assert!(matches!(err, BodyCreationError::ConstructionFailed(_)));
        assert_eq!(runtime.body_count(), 0);
    }

    #[test]
    fn test_create_body_local_and_adapter() {
        let runtime = Runtime::new(test_config(4004));
        let node = runtime.create_local_node("n0", false, None).unwrap();

        let local = runtime.create_body("n0", constructor("Worker"), true).unwrap();
        assert!(local.is_local());

        let adapter = runtime.create_body("n0", constructor("Worker"), false).unwrap();
        let body_ref = adapter.as_adapter().unwrap();
        assert_eq!(body_ref.node_url(), node.url());
        assert_ne!(local.id(), adapter.id());
        assert_eq!(runtime.body_count(), 2);
    }

    #[test]
    fn test_lifecycle_events_are_published() {
        let runtime = Runtime::new(test_config(4005));
        let events = collect_events(&runtime);
        let node = runtime.create_local_node("n0", false, None).unwrap();
        let spawned = runtime.create_body("n0", constructor("Worker"), true).unwrap();
        runtime.kill_node("n0");

        let recorded = events.lock().unwrap();
        assert_eq!(
            *recorded,
            vec![
                RuntimeEventKind::NodeCreated {
                    node_url: node.url().clone()
                },
                RuntimeEventKind::BodyCreated {
                    node_url: node.url().clone(),
                    id: spawned.id(),
                    class_name: "Worker".to_string()
                },
                RuntimeEventKind::BodyDestroyed {
                    node_url: node.url().clone(),
                    id: spawned.id()
                },
                RuntimeEventKind::NodeDestroyed {
                    node_url: node.url().clone()
                },
            ]
        );
    }

    #[test]
    fn test_migrate_between_local_nodes() {
        let runtime = Runtime::new(test_config(4006));
        runtime.create_local_node("n0", false, None).unwrap();
        runtime.create_local_node("n1", false, None).unwrap();
        let spawned = runtime.create_body("n0", constructor("Worker"), true).unwrap();
        let id = spawned.id();
        let events = collect_events(&runtime);

        runtime.migrate_body(&id, &runtime, "n1").unwrap();

        assert!(runtime.node_snapshot("n0").unwrap().bodies.is_empty());
        let moved = runtime.node_snapshot("n1").unwrap().bodies;
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, id);
        assert_eq!(runtime.body_count(), 1);

        let recorded = events.lock().unwrap();
        assert_eq!(
            *recorded,
            vec![
                RuntimeEventKind::MigrationAboutToStart {
                    id,
                    destination_node_url: runtime.host_url().node_url("n1")
                },
                RuntimeEventKind::MigrationFinished {
                    id,
                    destination_runtime_url: runtime.url().clone()
                },
            ]
        );
    }

    #[test]
    fn test_migrate_between_runtimes() {
        let source = Runtime::new(test_config(4007));
        let destination = Runtime::new(test_config(4008));
        source.create_local_node("n0", false, None).unwrap();
        destination.create_local_node("n1", false, None).unwrap();
        let spawned = source.create_body("n0", constructor("Worker"), true).unwrap();
        let id = spawned.id();

        source.migrate_body(&id, &destination, "n1").unwrap();

        assert_eq!(source.body_count(), 0);
        assert_eq!(destination.body_count(), 1);
        assert!(source.node_snapshot("n0").unwrap().bodies.is_empty());
        assert_eq!(destination.node_snapshot("n1").unwrap().bodies[0].id, id);
        // The identifier survives the move.
        assert_eq!(destination.body(&id).unwrap().id(), id);
    }

    #[test]
    fn test_migrate_to_unknown_node_leaves_source_intact() {
        let source = Runtime::new(test_config(4009));
        let destination = Runtime::new(test_config(4010));
        source.create_local_node("n0", false, None).unwrap();
        let spawned = source.create_body("n0", constructor("Worker"), true).unwrap();
        let id = spawned.id();

        let err = source.migrate_body(&id, &destination, "missing").unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Destination(BodyCreationError::UnknownNode(_))
        ));
        assert_eq!(source.body_count(), 1);
        assert_eq!(source.node_snapshot("n0").unwrap().bodies.len(), 1);
        assert_eq!(destination.body_count(), 0);
    }

    #[test]
    fn test_terminate_body_purges_and_announces() {
        let runtime = Runtime::new(test_config(4011));
        let node = runtime.create_local_node("n0", false, None).unwrap();
        let spawned = runtime.create_body("n0", constructor("Worker"), true).unwrap();
        let id = spawned.id();
        let events = collect_events(&runtime);

        assert!(runtime.terminate_body(&id));
        assert!(!runtime.terminate_body(&id));
        assert_eq!(runtime.body_count(), 0);
        assert!(node.body_ids().is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![RuntimeEventKind::BodyDestroyed {
                node_url: node.url().clone(),
                id
            }]
        );
    }

    #[test]
    fn test_peer_registry() {
        let runtime = Runtime::new(test_config(4012));
        let peer = Runtime::new(test_config(4013));
        let events = collect_events(&runtime);

        runtime.register_peer(peer.registration());
        assert_eq!(runtime.peers().len(), 1);
        assert_eq!(runtime.peer(peer.url()).unwrap().vm_name, peer.vm_name());

        runtime.unregister_peer(peer.url());
        assert!(runtime.peers().is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                RuntimeEventKind::RuntimeRegistered(peer.registration()),
                RuntimeEventKind::RuntimeUnregistered(peer.registration()),
            ]
        );
    }

    #[test]
    fn test_virtual_node_registry() {
        let runtime = Runtime::new(test_config(4014));
        runtime.register_virtual_node("workers", false).unwrap();
        assert!(runtime.virtual_node_registered("workers"));
        let err = runtime.register_virtual_node("workers", false).unwrap_err();
        assert!(matches!(err, NodeError::AlreadyBound(_)));
        runtime.register_virtual_node("workers", true).unwrap();

        runtime.register_virtual_node("collectors", false).unwrap();
        assert_eq!(runtime.virtual_node_names(), vec!["collectors", "workers"]);
        runtime.unregister_virtual_node("workers");
        assert!(!runtime.virtual_node_registered("workers"));
        runtime.unregister_all_virtual_nodes();
        assert!(runtime.virtual_node_names().is_empty());
    }

    #[test]
    fn test_kill_terminates_everything_once() {
        let runtime = Runtime::new(test_config(4015));
        runtime.create_local_node("n0", false, None).unwrap();
        runtime.create_body("n0", constructor("Worker"), true).unwrap();
        let half = TestBody::new(runtime.next_body_id(), "HalfBody");
        runtime.register_half_body(half.clone()).unwrap();
        let events = collect_events(&runtime);

        let report = runtime.kill(true);
        assert_eq!(report.terminated.len(), 2);
        assert!(report.failed.is_empty());
        assert!(half.is_terminated());
        assert!(runtime.is_terminated());
        assert_eq!(runtime.body_count(), 0);
        assert_eq!(runtime.half_body_count(), 0);
        assert!(runtime.local_node_names().is_empty());

        // Killed runtimes refuse creation and ignore repeat kills.
        assert!(matches!(
            runtime.create_local_node("n1", false, None),
            Err(NodeError::Terminated(_))
        ));
        let repeat = runtime.kill(false);
        assert!(repeat.terminated.is_empty() && repeat.failed.is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![RuntimeEventKind::RuntimeDestroyed]
        );
    }

    #[test]
    fn test_request_notifications() {
        let runtime = Runtime::new(test_config(4016));
        let events = collect_events(&runtime);
        let source = runtime.next_body_id();
        let target = runtime.next_body_id();
        runtime.notify_request(source, target);
        runtime.notify_request_queue(target, 3);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                RuntimeEventKind::RequestReceived { source, target },
                RuntimeEventKind::RequestQueueChanged { id: target, length: 3 },
            ]
        );
    }
}
