/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Views of one runtime process and its nodes.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use migractor::observer::Observers;
use migractor::reference::RuntimeUrl;
use migractor::remote::RemoteRuntime;

use crate::host::HostView;
use crate::node::NodeView;
use crate::notification::MonitorNotification;
use crate::state::State;
use crate::tree::TreeItem;
use crate::tree::TreeItemKind;
use crate::tree::diff_keys;
use crate::world::World;
use crate::world::WorldState;

/// How long a killed runtime's view lingers before it is dropped.
pub const RUNTIME_KILL_GRACE: Duration = Duration::from_secs(3);

/// The view of one runtime process, holding a child view per node it
/// reports.
///
/// Discovery costs one snapshot call on the remote runtime plus one
/// call per reported node. A pass that cannot reach the runtime logs
/// and leaves the views it already built in place.
#[derive(Debug)]
pub struct RuntimeView {
    this: Weak<Self>,
    key: String,
    url: RuntimeUrl,
    vm_name: Mutex<Option<String>>,
    world: Weak<WorldState>,
    parent: Weak<HostView>,
    remote: Arc<dyn RemoteRuntime>,
    nodes: DashMap<String, Arc<NodeView>>,
    seeded: AtomicBool,
    responding: AtomicBool,
    exploring: AtomicBool,
    monitored: AtomicBool,
    destroyed: AtomicBool,
    observers: Observers<MonitorNotification>,
}

impl RuntimeView {
    pub(crate) fn new(
        world: &World,
        parent: &Arc<HostView>,
        url: RuntimeUrl,
        remote: Arc<dyn RemoteRuntime>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            key: url.to_string(),
            url,
            vm_name: Mutex::new(None),
            world: world.downgrade(),
            parent: Arc::downgrade(parent),
            remote,
            nodes: DashMap::new(),
            seeded: AtomicBool::new(false),
            responding: AtomicBool::new(true),
            exploring: AtomicBool::new(false),
            monitored: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            observers: Observers::new(),
        })
    }

    /// The runtime's url.
    pub fn url(&self) -> &RuntimeUrl {
        &self.url
    }

    /// The runtime's vm name, once a snapshot reported it.
    pub fn vm_name(&self) -> Option<String> {
        self.vm_name.lock().unwrap().clone()
    }

    /// Whether the runtime answered its most recent snapshot call.
    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::SeqCst)
    }

    /// The view of the node with the given key, if reported by this
    /// runtime.
    pub fn node(&self, key: &str) -> Option<Arc<NodeView>> {
        self.nodes.get(key).map(|entry| entry.value().clone())
    }

    /// The node views under this runtime, ordered by url.
    pub fn nodes(&self) -> Vec<Arc<NodeView>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by(|a, b| a.key().cmp(b.key()));
        nodes
    }

    /// The number of node views under this runtime.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ask the runtime to shut down, then drop its view.
    ///
    /// The kill runs on a detached task and this call returns
    /// immediately; the view lingers for [`RUNTIME_KILL_GRACE`]
    /// before it is destroyed.
    pub fn kill_runtime(&self, softly: bool) {
        let remote = Arc::clone(&self.remote);
        let url = self.url.clone();
        let this = self.this.upgrade();
        tracing::info!(runtime = %url, softly = softly, "killing runtime");
        self.observers.notify(&MonitorNotification::RuntimeKilled);
        tokio::spawn(async move {
            if let Err(error) = remote.kill(softly).await {
                tracing::warn!(runtime = %url, error = %error, "runtime kill failed");
            }
            tokio::time::sleep(RUNTIME_KILL_GRACE).await;
            if let Some(this) = this {
                this.destroy();
            }
        });
    }

    /// React to the runtime announcing its own shutdown: announce it
    /// to observers and drop the view after the grace period.
    pub fn runtime_killed(&self) {
        let this = self.this.upgrade();
        tracing::info!(runtime = %self.url, "runtime announced shutdown");
        self.observers.notify(&MonitorNotification::RuntimeKilled);
        tokio::spawn(async move {
            tokio::time::sleep(RUNTIME_KILL_GRACE).await;
            if let Some(this) = this {
                this.destroy();
            }
        });
    }

    pub(crate) fn release_child(&self, key: &str) {
        if self.nodes.remove(key).is_some() {
            self.observers
                .notify(&MonitorNotification::ChildRemoved(key.to_string()));
        }
    }

    /// Fetch one node's snapshot and push it down into its view.
    pub(crate) async fn refresh_node(&self, node: &Arc<NodeView>) {
        match self.remote.node_snapshot(node.url()).await {
            Ok(snapshot) => node.reconcile_bodies(&snapshot.bodies),
            Err(error) => {
                tracing::warn!(
                    runtime = %self.url,
                    node = %node.url(),
                    error = %error,
                    "node snapshot failed"
                );
            }
        }
    }

    async fn explore_once(&self) {
        let Some(world) = World::upgrade(&self.world) else {
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let snapshot = match self.remote.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                if self.responding.swap(false, Ordering::SeqCst) {
                    self.observers
                        .notify(&MonitorNotification::StateChanged(State::NotResponding));
                }
                tracing::warn!(
                    runtime = %self.url,
                    error = %error,
                    "runtime snapshot failed, keeping known views"
                );
                return;
            }
        };
        if !self.responding.swap(true, Ordering::SeqCst) {
            tracing::debug!(runtime = %self.url, "runtime answering again");
        }
        if !self.seeded.swap(true, Ordering::SeqCst) {
            *self.vm_name.lock().unwrap() = Some(snapshot.vm_name.clone());
            if let Some(parent) = self.parent.upgrade() {
                parent.record_runtime_attributes(&snapshot);
            }
        }

        let mut discovered = Vec::new();
        let mut urls_by_key = std::collections::HashMap::new();
        for node_url in &snapshot.node_urls {
            if world.node_hidden(node_url.node_name()) {
                continue;
            }
            let key = node_url.to_string();
            urls_by_key.insert(key.clone(), node_url.clone());
            discovered.push(key);
        }
        let known: Vec<String> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        let (added, removed) = diff_keys(&known, &discovered);

        let mut attached = Vec::new();
        for key in &added {
            let Some(node_url) = urls_by_key.get(key) else {
                continue;
            };
            let node = NodeView::new(&world, &this, node_url.clone());
            self.nodes.insert(key.clone(), node);
            attached.push(key.clone());
        }
        if self.observers.count() != 0 {
            match attached.as_slice() {
                [] => {}
                [key] => self
                    .observers
                    .notify(&MonitorNotification::ChildAdded(key.clone())),
                _ => self
                    .observers
                    .notify(&MonitorNotification::ChildrenAdded(attached.clone())),
            }
        }
        for key in &removed {
            let node = self.nodes.get(key).map(|entry| entry.value().clone());
            if let Some(node) = node {
                node.destroy();
            }
        }

        for key in &discovered {
            let node = self.nodes.get(key).map(|entry| entry.value().clone());
            let Some(node) = node else {
                continue;
            };
            let node_snapshot = match self.remote.node_snapshot(node.url()).await {
                Ok(node_snapshot) => node_snapshot,
                Err(error) => {
                    tracing::warn!(
                        runtime = %self.url,
                        node = %node.url(),
                        error = %error,
                        "node snapshot failed"
                    );
                    continue;
                }
            };
            if let Some(virtual_node_name) = &node_snapshot.virtual_node_name {
                world.bind_virtual_node(virtual_node_name, &node);
            }
            node.reconcile_bodies(&node_snapshot.bodies);
        }
    }
}

#[async_trait]
impl TreeItem for RuntimeView {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TreeItemKind {
        TreeItemKind::Runtime
    }

    fn observers(&self) -> &Observers<MonitorNotification> {
        &self.observers
    }

    fn is_monitored(&self) -> bool {
        self.monitored.load(Ordering::SeqCst)
    }

    async fn set_monitored(&self) {
        if self.monitored.swap(true, Ordering::SeqCst) {
            return;
        }
        self.explore().await;
    }

    fn set_unmonitored(&self) {
        if !self.monitored.swap(false, Ordering::SeqCst) {
            return;
        }
        let nodes: Vec<_> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        for node in nodes {
            node.destroy();
        }
        self.observers
            .notify(&MonitorNotification::StateChanged(State::NotMonitored));
    }

    async fn explore(&self) {
        if !self.is_monitored() || self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if self.exploring.swap(true, Ordering::SeqCst) {
            return;
        }
        self.explore_once().await;
        self.exploring.store(false, Ordering::SeqCst);
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(runtime = %self.url, "dropping runtime view");
        let nodes: Vec<_> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        for node in nodes {
            node.destroy();
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.release_child(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use migractor::Runtime;
    use migractor::reference::NodeUrl;
    use migractor::remote::NodeSnapshot;
    use migractor::remote::RemoteError;
    use migractor::remote::RuntimeDirectory;
    use migractor::remote::RuntimeSnapshot;
    use migractor::test_utils::constructor;
    use tokio::sync::Notify;

    use super::*;
    use crate::world::testing::collect;
    use crate::world::testing::explored_world;
    use crate::world::testing::node_name;
    use crate::world::testing::test_runtime;

    #[derive(Debug)]
    struct FlakyRemote {
        inner: Runtime,
        failing: AtomicBool,
    }

    #[async_trait]
    impl RemoteRuntime for FlakyRemote {
        fn url(&self) -> RuntimeUrl {
            self.inner.url().clone()
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            <Runtime as RemoteRuntime>::ping(&self.inner).await
        }

        async fn snapshot(&self) -> Result<RuntimeSnapshot, RemoteError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RemoteError::Unavailable(self.inner.url().to_string()));
            }
            <Runtime as RemoteRuntime>::snapshot(&self.inner).await
        }

        async fn node_snapshot(&self, node_url: &NodeUrl) -> Result<NodeSnapshot, RemoteError> {
            <Runtime as RemoteRuntime>::node_snapshot(&self.inner, node_url).await
        }

        async fn kill(&self, softly: bool) -> Result<(), RemoteError> {
            <Runtime as RemoteRuntime>::kill(&self.inner, softly).await
        }
    }

    #[derive(Debug)]
    struct BlockingRemote {
        inner: Runtime,
        release: Notify,
        snapshots: AtomicUsize,
    }

    #[async_trait]
    impl RemoteRuntime for BlockingRemote {
        fn url(&self) -> RuntimeUrl {
            self.inner.url().clone()
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            <Runtime as RemoteRuntime>::ping(&self.inner).await
        }

        async fn snapshot(&self) -> Result<RuntimeSnapshot, RemoteError> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            <Runtime as RemoteRuntime>::snapshot(&self.inner).await
        }

        async fn node_snapshot(&self, node_url: &NodeUrl) -> Result<NodeSnapshot, RemoteError> {
            <Runtime as RemoteRuntime>::node_snapshot(&self.inner, node_url).await
        }

        async fn kill(&self, softly: bool) -> Result<(), RemoteError> {
            <Runtime as RemoteRuntime>::kill(&self.inner, softly).await
        }
    }

    fn view_over(
        world: &World,
        runtime: &Runtime,
        remote: Arc<dyn RemoteRuntime>,
    ) -> Arc<RuntimeView> {
        world.add_host(runtime.host_url().clone());
        let host = world.host(&runtime.host_url().to_string()).unwrap();
        RuntimeView::new(world, &host, runtime.url().clone(), remote)
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_known_views() {
        let runtime = test_runtime(7301);
        runtime.create_capacity_nodes().unwrap();
        let id = runtime
            .create_body(&node_name(&runtime, 0), constructor("Worker"), true)
            .unwrap()
            .id();
        let world = World::new(RuntimeDirectory::new());
        let remote = Arc::new(FlakyRemote {
            inner: runtime.clone(),
            failing: AtomicBool::new(false),
        });
        let view = view_over(
            &world,
            &runtime,
            Arc::clone(&remote) as Arc<dyn RemoteRuntime>,
        );

        view.explore().await;
        assert_eq!(view.node_count(), 2);
        assert!(view.is_responding());
        let events = collect(view.observers());

        remote.failing.store(true, Ordering::SeqCst);
        view.explore().await;
        view.explore().await;
        assert!(!view.is_responding());
        assert_eq!(view.node_count(), 2);
        assert!(world.find_active_object(&id.to_string()).is_some());
        assert_eq!(
            *events.lock().unwrap(),
            vec![MonitorNotification::StateChanged(State::NotResponding)]
        );

        remote.failing.store(false, Ordering::SeqCst);
        view.explore().await;
        assert!(view.is_responding());
    }

    #[tokio::test]
    async fn test_overlapping_scans_are_dropped() {
        let runtime = test_runtime(7302);
        runtime.create_capacity_nodes().unwrap();
        let world = World::new(RuntimeDirectory::new());
        let remote = Arc::new(BlockingRemote {
            inner: runtime.clone(),
            release: Notify::new(),
            snapshots: AtomicUsize::new(0),
        });
        let view = view_over(
            &world,
            &runtime,
            Arc::clone(&remote) as Arc<dyn RemoteRuntime>,
        );

        let first = tokio::spawn({
            let view = Arc::clone(&view);
            async move { view.explore().await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.snapshots.load(Ordering::SeqCst), 1);

        view.explore().await;
        assert_eq!(remote.snapshots.load(Ordering::SeqCst), 1);

        remote.release.notify_one();
        first.await.unwrap();
        assert_eq!(view.node_count(), 2);

        remote.release.notify_one();
        view.explore().await;
        assert_eq!(remote.snapshots.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_runtime_detaches_after_grace() {
        let runtime = test_runtime(7303);
        runtime.create_capacity_nodes().unwrap();
        let id = runtime
            .create_body(&node_name(&runtime, 0), constructor("Worker"), true)
            .unwrap()
            .id();
        let world = explored_world(&[&runtime]).await;
        let host = world.host(&runtime.host_url().to_string()).unwrap();
        let view = host.runtime(&runtime.url().to_string()).unwrap();
        let events = collect(view.observers());

        view.kill_runtime(true);
        assert_eq!(
            *events.lock().unwrap(),
            vec![MonitorNotification::RuntimeKilled]
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(runtime.is_terminated());
        assert!(host.runtime(&runtime.url().to_string()).is_some());

        tokio::time::sleep(RUNTIME_KILL_GRACE).await;
        assert!(host.runtime(&runtime.url().to_string()).is_none());
        assert!(world.find_active_object(&id.to_string()).is_none());
    }

    #[tokio::test]
    async fn test_vanished_node_views_are_dropped() {
        let runtime = test_runtime(7304);
        runtime.create_local_node("ephemeral", false, None).unwrap();
        let world = explored_world(&[&runtime]).await;
        let host = world.host(&runtime.host_url().to_string()).unwrap();
        let view = host.runtime(&runtime.url().to_string()).unwrap();
        assert_eq!(view.node_count(), 1);
        let events = collect(view.observers());

        runtime.kill_node("ephemeral");
        world.explore_all().await;

        assert_eq!(view.node_count(), 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec![MonitorNotification::ChildRemoved(
                runtime.host_url().node_url("ephemeral").to_string()
            )]
        );
    }
}
