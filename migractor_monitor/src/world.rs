/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The root of the monitor tree.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use migractor::event::RuntimeEvent;
use migractor::event::RuntimeEventKind;
use migractor::observer::Observers;
use migractor::observer::Subscription;
use migractor::reference::BodyId;
use migractor::reference::HostUrl;
use migractor::reference::NodeUrl;
use migractor::reference::RuntimeUrl;
use migractor::reference::is_half_bodies_node;
use migractor::remote::RuntimeDirectory;

use crate::active_object::ActiveObjectView;
use crate::host::HostView;
use crate::node::NodeView;
use crate::notification::MonitorNotification;
use crate::runtime::RuntimeView;
use crate::state::State;
use crate::tree::TreeItem;
use crate::tree::TreeItemKind;
use crate::virtual_node::VirtualNodeView;

/// The root of the monitor tree.
///
/// The world owns the host views, a world-wide index of every active
/// object view by identifier, and the virtual node groupings. The
/// index is what keeps an object's view unique: a scan that
/// rediscovers a known identifier under another node leaves the first
/// registration in place.
///
/// The world is a cheap handle; clones share the same tree.
#[derive(Clone, Debug)]
pub struct World {
    state: Arc<WorldState>,
}

#[derive(Debug)]
pub(crate) struct WorldState {
    directory: RuntimeDirectory,
    hosts: DashMap<String, Arc<HostView>>,
    index: DashMap<String, Arc<ActiveObjectView>>,
    virtual_nodes: DashMap<String, Arc<VirtualNodeView>>,
    next_name: AtomicU64,
    hidden_prefixes: Mutex<Vec<String>>,
    hidden_prefixes_enabled: AtomicBool,
    communication_handling: AtomicBool,
    monitored: AtomicBool,
    observers: Observers<MonitorNotification>,
}

impl World {
    /// Create an empty world discovering runtimes through `directory`.
    pub fn new(directory: RuntimeDirectory) -> Self {
        Self {
            state: Arc::new(WorldState {
                directory,
                hosts: DashMap::new(),
                index: DashMap::new(),
                virtual_nodes: DashMap::new(),
                next_name: AtomicU64::new(0),
                hidden_prefixes: Mutex::new(Vec::new()),
                hidden_prefixes_enabled: AtomicBool::new(true),
                communication_handling: AtomicBool::new(true),
                monitored: AtomicBool::new(true),
                observers: Observers::new(),
            }),
        }
    }

    /// The directory the world discovers runtimes through.
    pub fn directory(&self) -> &RuntimeDirectory {
        &self.state.directory
    }

    pub(crate) fn downgrade(&self) -> Weak<WorldState> {
        Arc::downgrade(&self.state)
    }

    pub(crate) fn upgrade(state: &Weak<WorldState>) -> Option<Self> {
        state.upgrade().map(|state| Self { state })
    }

    /// Start monitoring a host. Returns the existing view when the
    /// host is already monitored.
    pub fn add_host(&self, url: HostUrl) -> Arc<HostView> {
        let key = url.to_string();
        let (host, created) = match self.state.hosts.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let host = HostView::new(self, url);
                entry.insert(Arc::clone(&host));
                (host, true)
            }
        };
        if created {
            tracing::info!(host = %key, "monitoring host");
            self.state
                .observers
                .notify(&MonitorNotification::ChildAdded(key));
        }
        host
    }

    /// Stop monitoring a host, dropping its whole subtree. Returns
    /// false when no such host is monitored.
    pub fn remove_host(&self, key: &str) -> bool {
        let host = self.state.hosts.get(key).map(|entry| entry.value().clone());
        match host {
            Some(host) => {
                host.destroy();
                true
            }
            None => false,
        }
    }

    /// The view of the host with the given key.
    pub fn host(&self, key: &str) -> Option<Arc<HostView>> {
        self.state.hosts.get(key).map(|entry| entry.value().clone())
    }

    /// The monitored hosts, ordered by url.
    pub fn hosts(&self) -> Vec<Arc<HostView>> {
        let mut hosts: Vec<_> = self
            .state
            .hosts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        hosts.sort_by(|a, b| a.key().cmp(b.key()));
        hosts
    }

    /// The number of monitored hosts.
    pub fn host_count(&self) -> usize {
        self.state.hosts.len()
    }

    /// Find an active object view anywhere in the world by its key.
    pub fn find_active_object(&self, key: &str) -> Option<Arc<ActiveObjectView>> {
        self.state.index.get(key).map(|entry| entry.value().clone())
    }

    /// The number of active object views tracked world-wide.
    pub fn active_object_count(&self) -> usize {
        self.state.index.len()
    }

    pub(crate) fn add_active_object(&self, view: &Arc<ActiveObjectView>) -> bool {
        match self.state.index.entry(view.key().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(view));
                true
            }
        }
    }

    pub(crate) fn remove_active_object(&self, key: &str) -> bool {
        self.state.index.remove(key).is_some()
    }

    pub(crate) fn allocate_short_name(&self) -> String {
        format!(
            "ao#{}",
            self.state.next_name.fetch_add(1, Ordering::SeqCst) + 1
        )
    }

    /// The virtual node grouping with the given name, if any node
    /// advertises it.
    pub fn virtual_node(&self, name: &str) -> Option<Arc<VirtualNodeView>> {
        self.state
            .virtual_nodes
            .get(name)
            .map(|entry| entry.value().clone())
    }

    /// The virtual node groupings, ordered by name.
    pub fn virtual_nodes(&self) -> Vec<Arc<VirtualNodeView>> {
        let mut virtual_nodes: Vec<_> = self
            .state
            .virtual_nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        virtual_nodes.sort_by(|a, b| a.name().cmp(b.name()));
        virtual_nodes
    }

    /// Create an empty virtual node grouping, or return the existing
    /// one.
    pub fn add_virtual_node(&self, name: &str) -> Arc<VirtualNodeView> {
        let (virtual_node, created) = match self.state.virtual_nodes.entry(name.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let virtual_node = VirtualNodeView::new(self, name);
                entry.insert(Arc::clone(&virtual_node));
                (virtual_node, true)
            }
        };
        if created {
            self.state
                .observers
                .notify(&MonitorNotification::ChildAdded(name.to_string()));
        }
        virtual_node
    }

    /// Drop a virtual node grouping. The grouped nodes stay. Returns
    /// false when no such grouping exists.
    pub fn remove_virtual_node(&self, name: &str) -> bool {
        let virtual_node = self
            .state
            .virtual_nodes
            .get(name)
            .map(|entry| entry.value().clone());
        match virtual_node {
            Some(virtual_node) => {
                virtual_node.destroy();
                true
            }
            None => false,
        }
    }

    pub(crate) fn release_virtual_node(&self, name: &str) {
        if self.state.virtual_nodes.remove(name).is_some() {
            self.state
                .observers
                .notify(&MonitorNotification::ChildRemoved(name.to_string()));
        }
    }

    pub(crate) fn bind_virtual_node(&self, name: &str, node: &Arc<NodeView>) {
        let virtual_node = self.add_virtual_node(name);
        virtual_node.adopt_node(node);
        node.set_virtual_node(&virtual_node);
    }

    pub(crate) fn release_host(&self, key: &str) {
        if self.state.hosts.remove(key).is_some() {
            self.state
                .observers
                .notify(&MonitorNotification::ChildRemoved(key.to_string()));
        }
    }

    /// Hide every node whose name starts with `prefix` from
    /// discovery.
    pub fn register_hidden_prefix(&self, prefix: &str) {
        self.state
            .hidden_prefixes
            .lock()
            .unwrap()
            .push(prefix.to_string());
    }

    /// Turn the hidden-prefix filter on or off. The reserved
    /// half-bodies node is filtered regardless.
    pub fn set_hidden_prefixes_enabled(&self, enabled: bool) {
        self.state
            .hidden_prefixes_enabled
            .store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn node_hidden(&self, name: &str) -> bool {
        if is_half_bodies_node(name) {
            return true;
        }
        if !self.state.hidden_prefixes_enabled.load(Ordering::SeqCst) {
            return false;
        }
        self.state
            .hidden_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// Whether observed calls are currently turned into graph edges.
    pub fn communication_handling_enabled(&self) -> bool {
        self.state.communication_handling.load(Ordering::SeqCst)
    }

    /// Resume turning observed calls into graph edges.
    pub fn enable_communication_handling(&self) {
        self.state.communication_handling.store(true, Ordering::SeqCst);
    }

    /// Stop turning observed calls into graph edges. Calls observed
    /// while disabled are dropped, not queued.
    pub fn disable_communication_handling(&self) {
        self.state.communication_handling.store(false, Ordering::SeqCst);
    }

    /// Record one observed call between two monitored objects.
    pub fn record_call(&self, source: BodyId, target: BodyId) {
        if !self.communication_handling_enabled() {
            return;
        }
        let Some(source_view) = self.find_active_object(&source.to_string()) else {
            tracing::debug!(
                source = %source,
                target = %target,
                "dropping call record: unknown source"
            );
            return;
        };
        source_view.record_call_to(target);
    }

    /// Drop every call edge in the world. Call handling is suspended
    /// for the duration of the sweep and restored afterwards.
    pub fn reset_communications(&self) {
        let was_enabled = self.state.communication_handling.swap(false, Ordering::SeqCst);
        let views: Vec<_> = self
            .state
            .index
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for view in views {
            view.remove_all_communications(false);
        }
        self.state
            .communication_handling
            .store(was_enabled, Ordering::SeqCst);
        tracing::debug!("communication graph reset");
    }

    /// Run one discovery pass over every monitored host. Host
    /// subtrees reconcile independently of each other.
    pub async fn explore_all(&self) {
        if !self.is_monitored() {
            return;
        }
        let hosts: Vec<_> = self
            .state
            .hosts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let passes = hosts.iter().map(|host| host.explore());
        futures::future::join_all(passes).await;
    }

    /// Apply one runtime lifecycle event as a monitoring hint.
    ///
    /// Body creation and destruction, migration announcements and
    /// confirmations, queue changes and observed calls take effect
    /// ahead of the next poll. Everything else is left to the poll
    /// loop, which stays the source of truth for the tree's shape.
    pub fn apply_event(&self, event: &RuntimeEvent) {
        match &event.kind {
            RuntimeEventKind::BodyCreated {
                node_url,
                id,
                class_name,
            } => {
                if let Some(node) = self.resolve_node(&event.origin, node_url) {
                    node.observe_body(*id, class_name);
                }
            }
            RuntimeEventKind::BodyDestroyed { id, .. } => {
                if let Some(view) = self.find_active_object(&id.to_string()) {
                    view.destroy();
                }
            }
            RuntimeEventKind::MigrationAboutToStart {
                id,
                destination_node_url,
            } => {
                if let Some(view) = self.find_active_object(&id.to_string()) {
                    view.prepare_to_migrate(destination_node_url.clone());
                }
            }
            RuntimeEventKind::MigrationFinished {
                id,
                destination_runtime_url,
            } => {
                if let Some(view) = self.find_active_object(&id.to_string()) {
                    view.finish_migration(destination_runtime_url);
                }
            }
            RuntimeEventKind::RequestQueueChanged { id, length } => {
                if let Some(view) = self.find_active_object(&id.to_string()) {
                    view.set_request_queue_length(*length as i64);
                }
            }
            RuntimeEventKind::RequestReceived { source, target } => {
                self.record_call(*source, *target);
            }
            RuntimeEventKind::RuntimeDestroyed => {
                if let Some(runtime) = self.resolve_runtime(&event.origin) {
                    runtime.runtime_killed();
                }
            }
            RuntimeEventKind::NodeCreated { .. }
            | RuntimeEventKind::NodeDestroyed { .. }
            | RuntimeEventKind::RuntimeRegistered(_)
            | RuntimeEventKind::RuntimeUnregistered(_) => {
                tracing::debug!(event = %event, "leaving event to the next poll");
            }
        }
    }

    /// Feed a runtime's lifecycle events into [`World::apply_event`],
    /// off the publishing thread. Must be called within a tokio
    /// runtime. Returns the subscription to detach with.
    pub fn observe_runtime(&self, runtime: &migractor::Runtime) -> Subscription {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let subscription = runtime.events().attach(move |event: &RuntimeEvent| {
            let _ = sender.send(event.clone());
        });
        let world = self.downgrade();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(world) = World::upgrade(&world) else {
                    break;
                };
                world.apply_event(&event);
            }
        });
        subscription
    }

    fn resolve_runtime(&self, url: &RuntimeUrl) -> Option<Arc<RuntimeView>> {
        self.host(&url.host_url().to_string())?
            .runtime(&url.to_string())
    }

    fn resolve_node(&self, runtime_url: &RuntimeUrl, node_url: &NodeUrl) -> Option<Arc<NodeView>> {
        self.resolve_runtime(runtime_url)?
            .node(&node_url.to_string())
    }
}

#[async_trait]
impl TreeItem for World {
    fn key(&self) -> &str {
        "world"
    }

    fn kind(&self) -> TreeItemKind {
        TreeItemKind::World
    }

    fn observers(&self) -> &Observers<MonitorNotification> {
        &self.state.observers
    }

    fn is_monitored(&self) -> bool {
        self.state.monitored.load(Ordering::SeqCst)
    }

    async fn set_monitored(&self) {
        if self.state.monitored.swap(true, Ordering::SeqCst) {
            return;
        }
        self.explore_all().await;
    }

    fn set_unmonitored(&self) {
        if !self.state.monitored.swap(false, Ordering::SeqCst) {
            return;
        }
        let hosts: Vec<_> = self
            .state
            .hosts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for host in hosts {
            host.destroy();
        }
        self.state
            .observers
            .notify(&MonitorNotification::StateChanged(State::NotMonitored));
    }

    async fn explore(&self) {
        self.explore_all().await;
    }

    fn destroy(&self) {
        let hosts: Vec<_> = self
            .state
            .hosts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for host in hosts {
            host.destroy();
        }
    }
}
