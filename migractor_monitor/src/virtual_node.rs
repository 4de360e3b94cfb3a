/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Views grouping nodes by the virtual node they were deployed under.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use migractor::observer::Observers;

use crate::node::NodeView;
use crate::notification::MonitorNotification;
use crate::state::State;
use crate::tree::TreeItem;
use crate::tree::TreeItemKind;
use crate::world::World;
use crate::world::WorldState;

/// A deployment-time grouping of nodes, cutting across hosts and
/// runtimes.
///
/// The grouping is secondary: the node views it collects are owned by
/// their runtime views. Destroying a virtual node view only drops the
/// grouping, never the nodes. The world removes the view as soon as
/// its last node is released.
#[derive(Debug)]
pub struct VirtualNodeView {
    name: String,
    world: Weak<WorldState>,
    children: DashMap<String, Arc<NodeView>>,
    monitored: AtomicBool,
    destroyed: AtomicBool,
    observers: Observers<MonitorNotification>,
}

impl VirtualNodeView {
    pub(crate) fn new(world: &World, name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            world: world.downgrade(),
            children: DashMap::new(),
            monitored: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            observers: Observers::new(),
        })
    }

    /// The virtual node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node views deployed under this virtual node, ordered by
    /// url.
    pub fn nodes(&self) -> Vec<Arc<NodeView>> {
        let mut nodes: Vec<_> = self
            .children
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        nodes.sort_by(|a, b| a.key().cmp(b.key()));
        nodes
    }

    /// The number of nodes in the grouping.
    pub fn node_count(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn adopt_node(&self, node: &Arc<NodeView>) {
        let key = node.key().to_string();
        let added = self.children.insert(key.clone(), Arc::clone(node)).is_none();
        if added {
            self.observers.notify(&MonitorNotification::ChildAdded(key));
        }
    }

    pub(crate) fn release_node(&self, key: &str) {
        if self.children.remove(key).is_some() {
            self.observers
                .notify(&MonitorNotification::ChildRemoved(key.to_string()));
        }
        if self.children.is_empty() {
            if let Some(world) = World::upgrade(&self.world) {
                world.release_virtual_node(&self.name);
            }
        }
    }
}

#[async_trait]
impl TreeItem for VirtualNodeView {
    fn key(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TreeItemKind {
        TreeItemKind::VirtualNode
    }

    fn observers(&self) -> &Observers<MonitorNotification> {
        &self.observers
    }

    fn is_monitored(&self) -> bool {
        self.monitored.load(Ordering::SeqCst)
    }

    async fn set_monitored(&self) {
        self.monitored.store(true, Ordering::SeqCst);
    }

    fn set_unmonitored(&self) {
        if !self.monitored.swap(false, Ordering::SeqCst) {
            return;
        }
        self.observers
            .notify(&MonitorNotification::StateChanged(State::NotMonitored));
    }

    async fn explore(&self) {}

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children: Vec<_> = self
            .children
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (key, node) in children {
            node.clear_virtual_node();
            self.children.remove(&key);
            self.observers.notify(&MonitorNotification::ChildRemoved(key));
        }
        if let Some(world) = World::upgrade(&self.world) {
            world.release_virtual_node(&self.name);
        }
    }
}
