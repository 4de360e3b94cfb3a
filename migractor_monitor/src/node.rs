/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Views of one deployment slot and the objects resident on it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use migractor::observer::Observers;
use migractor::reference::BodyId;
use migractor::reference::NodeUrl;
use migractor::remote::BodySnapshot;

use crate::active_object::ActiveObjectView;
use crate::notification::MonitorNotification;
use crate::runtime::RuntimeView;
use crate::state::State;
use crate::tree::TreeItem;
use crate::tree::TreeItemKind;
use crate::tree::diff_keys;
use crate::virtual_node::VirtualNodeView;
use crate::world::World;
use crate::world::WorldState;

/// The view of one node of a runtime, holding a child view per active
/// object resident on it.
///
/// A node view does not talk to the runtime itself: its parent
/// [`RuntimeView`] fetches node snapshots and pushes them down
/// through [`NodeView::reconcile_bodies`].
#[derive(Debug)]
pub struct NodeView {
    this: Weak<Self>,
    key: String,
    url: NodeUrl,
    name: String,
    world: Weak<WorldState>,
    parent: Weak<RuntimeView>,
    virtual_node: Mutex<Option<Arc<VirtualNodeView>>>,
    children: DashMap<String, Arc<ActiveObjectView>>,
    monitored: AtomicBool,
    destroyed: AtomicBool,
    observers: Observers<MonitorNotification>,
}

impl NodeView {
    pub(crate) fn new(world: &World, parent: &Arc<RuntimeView>, url: NodeUrl) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            key: url.to_string(),
            name: url.node_name().to_string(),
            url,
            world: world.downgrade(),
            parent: Arc::downgrade(parent),
            virtual_node: Mutex::new(None),
            children: DashMap::new(),
            monitored: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            observers: Observers::new(),
        })
    }

    /// The node's url.
    pub fn url(&self) -> &NodeUrl {
        &self.url
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The virtual node this node was deployed under, if any.
    pub fn virtual_node(&self) -> Option<Arc<VirtualNodeView>> {
        self.virtual_node.lock().unwrap().clone()
    }

    /// The view of the active object with the given key, if resident
    /// here.
    pub fn active_object(&self, key: &str) -> Option<Arc<ActiveObjectView>> {
        self.children.get(key).map(|entry| entry.value().clone())
    }

    /// The views of the objects resident on this node, ordered by
    /// identifier.
    pub fn active_objects(&self) -> Vec<Arc<ActiveObjectView>> {
        let mut children: Vec<_> = self
            .children
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        children.sort_by_key(|child| child.id());
        children
    }

    /// The number of object views under this node.
    pub fn active_object_count(&self) -> usize {
        self.children.len()
    }

    /// Reconcile this node's children against a reported snapshot.
    ///
    /// Unknown identifiers become new child views; a single new child
    /// is announced individually, several in one batch. Identifiers
    /// already tracked anywhere in the world are left with their
    /// first registration. Children absent from the snapshot are
    /// destroyed one by one.
    pub fn reconcile_bodies(&self, bodies: &[BodySnapshot]) {
        if !self.is_monitored() || self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(world) = World::upgrade(&self.world) else {
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let known: Vec<String> = self.children.iter().map(|entry| entry.key().clone()).collect();
        let discovered: Vec<String> = bodies.iter().map(|body| body.id.to_string()).collect();
        let (_, removed) = diff_keys(&known, &discovered);

        let mut attached = Vec::new();
        for body in bodies {
            if let Some(key) = self.create_child(&world, &this, body.id, &body.class_name) {
                attached.push(key);
            }
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

        for body in bodies {
            let child = self
                .children
                .get(&body.id.to_string())
                .map(|entry| entry.value().clone());
            if let Some(child) = child {
                child.set_request_queue_length(body.request_queue_length as i64);
            }
        }

        for key in removed {
            let child = self.children.get(&key).map(|entry| entry.value().clone());
            if let Some(child) = child {
                child.destroy();
            }
        }
    }

    /// Attach a view for a body reported by a lifecycle event, ahead
    /// of the next poll.
    pub(crate) fn observe_body(&self, id: BodyId, class_name: &str) {
        if !self.is_monitored() || self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let Some(world) = World::upgrade(&self.world) else {
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        if let Some(key) = self.create_child(&world, &this, id, class_name) {
            self.observers.notify(&MonitorNotification::ChildAdded(key));
        }
    }

    fn create_child(
        &self,
        world: &World,
        this: &Arc<Self>,
        id: BodyId,
        class_name: &str,
    ) -> Option<String> {
        let key = id.to_string();
        if self.children.contains_key(&key) {
            return None;
        }
        if world.find_active_object(&key).is_some() {
            tracing::debug!(
                node = %self.url,
                id = %id,
                "keeping first registration for rediscovered body"
            );
            return None;
        }
        let child = ActiveObjectView::new(world, this, id, class_name);
        if !world.add_active_object(&child) {
            return None;
        }
        self.children.insert(key.clone(), child);
        Some(key)
    }

    pub(crate) fn adopt_child(&self, child: Arc<ActiveObjectView>) {
        let key = child.key().to_string();
        self.children.insert(key.clone(), child);
        self.observers.notify(&MonitorNotification::ChildAdded(key));
    }

    pub(crate) fn release_child(&self, key: &str) -> Option<Arc<ActiveObjectView>> {
        self.children.remove(key).map(|(key, child)| {
            self.observers.notify(&MonitorNotification::ChildRemoved(key));
            child
        })
    }

    pub(crate) fn set_virtual_node(&self, virtual_node: &Arc<VirtualNodeView>) {
        *self.virtual_node.lock().unwrap() = Some(Arc::clone(virtual_node));
    }

    pub(crate) fn clear_virtual_node(&self) {
        self.virtual_node.lock().unwrap().take();
    }
}

#[async_trait]
impl TreeItem for NodeView {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TreeItemKind {
        TreeItemKind::Node
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
        let children: Vec<_> = self
            .children
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for child in children {
            child.destroy();
        }
        self.observers
            .notify(&MonitorNotification::StateChanged(State::NotMonitored));
    }

    async fn explore(&self) {
        if !self.is_monitored() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        parent.refresh_node(&this).await;
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(node = %self.url, "dropping node view");
        let children: Vec<_> = self
            .children
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for child in children {
            child.destroy();
        }
        let virtual_node = self.virtual_node.lock().unwrap().take();
        if let Some(virtual_node) = virtual_node {
            virtual_node.release_node(&self.key);
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.release_child(&self.key);
        }
    }
}
