/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Views of one machine and the runtimes it hosts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use migractor::observer::Observers;
use migractor::reference::HostUrl;
use migractor::remote::RuntimeSnapshot;

use crate::notification::MonitorNotification;
use crate::runtime::RuntimeView;
use crate::state::State;
use crate::tree::TreeItem;
use crate::tree::TreeItemKind;
use crate::tree::diff_keys;
use crate::world::World;
use crate::world::WorldState;

/// The view of one machine, holding a child view per runtime exposed
/// on it.
///
/// Runtimes are discovered by scanning the directory for the host's
/// url. Overlapping passes are not queued: a pass that finds another
/// one still running returns at once and leaves the work to it.
#[derive(Debug)]
pub struct HostView {
    this: Weak<Self>,
    key: String,
    url: HostUrl,
    world: Weak<WorldState>,
    attributes: Mutex<HashMap<String, String>>,
    runtimes: DashMap<String, Arc<RuntimeView>>,
    exploring: AtomicBool,
    monitored: AtomicBool,
    destroyed: AtomicBool,
    observers: Observers<MonitorNotification>,
}

impl HostView {
    pub(crate) fn new(world: &World, url: HostUrl) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            key: url.to_string(),
            url,
            world: world.downgrade(),
            attributes: Mutex::new(HashMap::new()),
            runtimes: DashMap::new(),
            exploring: AtomicBool::new(false),
            monitored: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            observers: Observers::new(),
        })
    }

    /// The host's url.
    pub fn url(&self) -> &HostUrl {
        &self.url
    }

    /// The host's descriptive attributes, as far as its runtimes have
    /// reported them.
    pub fn attributes(&self) -> HashMap<String, String> {
        self.attributes.lock().unwrap().clone()
    }

    /// One descriptive attribute by name.
    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.lock().unwrap().get(name).cloned()
    }

    /// The view of the runtime with the given key, if exposed on this
    /// host.
    pub fn runtime(&self, key: &str) -> Option<Arc<RuntimeView>> {
        self.runtimes.get(key).map(|entry| entry.value().clone())
    }

    /// The runtime views under this host, ordered by url.
    pub fn runtimes(&self) -> Vec<Arc<RuntimeView>> {
        let mut runtimes: Vec<_> = self
            .runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        runtimes.sort_by(|a, b| a.key().cmp(b.key()));
        runtimes
    }

    /// The number of runtime views under this host.
    pub fn runtime_count(&self) -> usize {
        self.runtimes.len()
    }

    pub(crate) fn record_runtime_attributes(&self, snapshot: &RuntimeSnapshot) {
        let changed = {
            let mut attributes = self.attributes.lock().unwrap();
            let previous_name = attributes.insert("os.name".to_string(), snapshot.os_name.clone());
            let previous_arch = attributes.insert("os.arch".to_string(), snapshot.os_arch.clone());
            previous_name.as_deref() != Some(&snapshot.os_name)
                || previous_arch.as_deref() != Some(&snapshot.os_arch)
        };
        if changed {
            self.observers
                .notify(&MonitorNotification::HostAttributesUpdated);
        }
    }

    pub(crate) fn release_child(&self, key: &str) {
        if self.runtimes.remove(key).is_some() {
            self.observers
                .notify(&MonitorNotification::ChildRemoved(key.to_string()));
        }
    }

    async fn explore_once(&self) {
        let Some(world) = World::upgrade(&self.world) else {
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let directory = world.directory();

        let mut discovered = Vec::new();
        let mut urls_by_key = HashMap::new();
        for url in directory.runtimes_on(&self.url) {
            let key = url.to_string();
            urls_by_key.insert(key.clone(), url);
            discovered.push(key);
        }
        let known: Vec<String> = self.runtimes.iter().map(|entry| entry.key().clone()).collect();
        let (added, removed) = diff_keys(&known, &discovered);

        let mut attached = Vec::new();
        for key in &added {
            let Some(url) = urls_by_key.get(key) else {
                continue;
            };
            let remote = match directory.lookup(url) {
                Ok(remote) => remote,
                Err(error) => {
                    tracing::warn!(runtime = %url, error = %error, "runtime lookup failed");
                    continue;
                }
            };
            let runtime = RuntimeView::new(&world, &this, url.clone(), remote);
            self.runtimes.insert(key.clone(), runtime);
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
            let runtime = self.runtimes.get(key).map(|entry| entry.value().clone());
            if let Some(runtime) = runtime {
                runtime.destroy();
            }
        }

        let runtimes: Vec<_> = self
            .runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for runtime in runtimes {
            runtime.explore().await;
        }
    }
}

#[async_trait]
impl TreeItem for HostView {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TreeItemKind {
        TreeItemKind::Host
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
        let runtimes: Vec<_> = self
            .runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for runtime in runtimes {
            runtime.destroy();
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
        tracing::debug!(host = %self.url, "dropping host view");
        let runtimes: Vec<_> = self
            .runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for runtime in runtimes {
            runtime.destroy();
        }
        if let Some(world) = World::upgrade(&self.world) {
            world.release_host(&self.key);
        }
    }
}
