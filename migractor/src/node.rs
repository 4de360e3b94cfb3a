/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Local nodes: named deployment slots for bodies within a runtime.
//!
//! A node does not own its bodies; it keeps a list of resident body
//! ids while the runtime's [`BodyStore`] owns the bodies themselves.
//! The list is allowed to go stale (bodies terminate and migrate
//! without telling the node) and is purged lazily on every scan.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::body::BodyHandle;
use crate::body::BodyStore;
use crate::reference::BodyId;
use crate::reference::NodeUrl;

/// A named slot for bodies within a runtime. Cheaply cloneable;
/// clones share state.
#[derive(Clone, Debug)]
pub struct LocalNode {
    state: Arc<NodeState>,
}

#[derive(Debug)]
struct NodeState {
    name: String,
    url: NodeUrl,
    virtual_node_name: Mutex<Option<String>>,
    properties: Mutex<HashMap<String, String>>,
    resident: Mutex<Vec<BodyId>>,
}

impl LocalNode {
    /// Create an empty node addressed by `url`.
    pub fn new(url: NodeUrl) -> Self {
        let name = url.node_name().to_string();
        Self {
            state: Arc::new(NodeState {
                name,
                url,
                virtual_node_name: Mutex::new(None),
                properties: Mutex::new(HashMap::new()),
                resident: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The node's name, the last component of its url.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The node's url.
    pub fn url(&self) -> &NodeUrl {
        &self.state.url
    }

    /// The name of the virtual node this node was deployed under, if
    /// any.
    pub fn virtual_node_name(&self) -> Option<String> {
        self.state.virtual_node_name.lock().unwrap().clone()
    }

    /// Record the virtual node this node belongs to. `None` detaches
    /// it.
    pub fn set_virtual_node_name(&self, name: Option<String>) {
        *self.state.virtual_node_name.lock().unwrap() = name;
    }

    /// Look up a deployment property.
    pub fn property(&self, key: &str) -> Option<String> {
        self.state.properties.lock().unwrap().get(key).cloned()
    }

    /// Set a deployment property, returning the previous value.
    pub fn set_property(&self, key: String, value: String) -> Option<String> {
        self.state.properties.lock().unwrap().insert(key, value)
    }

    /// Record `id` as resident on this node. Recording an id twice
    /// leaves a single entry.
    pub fn register_body(&self, id: BodyId) {
        let mut resident = self.state.resident.lock().unwrap();
        if !resident.contains(&id) {
            resident.push(id);
        }
    }

    /// Drop `id` from the resident list. Unknown ids are ignored.
    pub fn unregister_body(&self, id: &BodyId) {
        self.state.resident.lock().unwrap().retain(|r| r != id);
    }

    /// A snapshot of the resident body ids, stale entries included.
    pub fn body_ids(&self) -> Vec<BodyId> {
        self.state.resident.lock().unwrap().clone()
    }

    /// The resident bodies. Stale ids (no live body in `store`) are
    /// purged from the list in place and skipped.
    pub fn bodies(&self, store: &BodyStore) -> Vec<BodyHandle> {
        let mut resident = self.state.resident.lock().unwrap();
        let mut live: Vec<BodyHandle> = Vec::new();
        resident.retain(|id| match store.get(id) {
            Some(body) => {
                live.push(body);
                true
            }
            None => false,
        });
        live
    }

    /// The resident bodies whose class name is `class_name`.
    pub fn bodies_of_class(&self, store: &BodyStore, class_name: &str) -> Vec<BodyHandle> {
        self.bodies(store)
            .into_iter()
            .filter(|body| body.class_name() == class_name)
            .collect()
    }

    /// Terminate every resident body, unregister each from `store`,
    /// and clear the list. One failing termination does not stop the
    /// sweep; failures are logged and reported. Every swept body is
    /// removed from the store whether or not its termination
    /// succeeded.
    pub fn terminate(&self, store: &BodyStore) -> TerminationReport {
        let ids: Vec<BodyId> = {
            let mut resident = self.state.resident.lock().unwrap();
            std::mem::take(&mut *resident)
        };
        let mut report = TerminationReport::default();
        for id in ids {
            let Some(body) = store.unregister(&id) else {
                continue;
            };
            match body.terminate() {
                Ok(()) => {
                    tracing::debug!(body = %id, node = %self.state.url, "body terminated");
                    report.terminated.push(id);
                }
                Err(err) => {
                    tracing::warn!(
                        body = %id,
                        node = %self.state.url,
                        error = %err,
                        "body termination failed; continuing"
                    );
                    report.failed.push(id);
                }
            }
        }
        report
    }
}

/// The outcome of a bulk termination sweep. The sweep is best effort:
/// it reports failures rather than aborting on them.
#[derive(Debug, Default)]
pub struct TerminationReport {
    /// Bodies that terminated cleanly.
    pub terminated: Vec<BodyId>,
    /// Bodies whose termination returned an error. They are removed
    /// from the ground truth all the same.
    pub failed: Vec<BodyId>,
}

impl TerminationReport {
    /// Every id the sweep removed.
    pub fn removed(&self) -> Vec<BodyId> {
        let mut removed = self.terminated.clone();
        removed.extend_from_slice(&self.failed);
        removed
    }

    /// Whether the sweep had work to do and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        self.terminated.is_empty() && !self.failed.is_empty()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: TerminationReport) {
        self.terminated.extend(other.terminated);
        self.failed.extend(other.failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::VmId;
    use crate::test_utils::TestBody;

    fn node(url: &str) -> LocalNode {
        LocalNode::new(url.parse().unwrap())
    }

    #[test]
    fn test_register_body_is_idempotent() {
        let node = node("pamr://h:1/n0");
        let id = BodyId(VmId(1), 1);
        node.register_body(id);
        node.register_body(id);
        assert_eq!(node.body_ids(), vec![id]);
    }

    #[test]
    fn test_scan_purges_stale_ids() {
        let store = BodyStore::new();
        let node = node("pamr://h:1/n0");
        let live = BodyId(VmId(1), 1);
        let stale = BodyId(VmId(1), 2);
        store.register(TestBody::new(live, "A"));
        store.register(TestBody::new(stale, "A"));
        node.register_body(live);
        node.register_body(stale);

        store.unregister(&stale);
        let scanned = node.bodies(&store);
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].id(), live);
        // The stale entry is gone for good, not just filtered.
        store.register(TestBody::new(stale, "A"));
        assert_eq!(node.body_ids(), vec![live]);
    }

    #[test]
    fn test_bodies_of_class_filters() {
        let store = BodyStore::new();
        let node = node("pamr://h:1/n0");
        let a = BodyId(VmId(1), 1);
        let b = BodyId(VmId(1), 2);
        store.register(TestBody::new(a, "Worker"));
        store.register(TestBody::new(b, "Collector"));
        node.register_body(a);
        node.register_body(b);

        let workers = node.bodies_of_class(&store, "Worker");
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id(), a);
    }

    #[test]
    fn test_terminate_sweeps_all_and_survives_failures() {
        let store = BodyStore::new();
        let node = node("pamr://h:1/n0");
        let ok_id = BodyId(VmId(1), 1);
        let bad_id = BodyId(VmId(1), 2);
        let ok = TestBody::new(ok_id, "A");
        store.register(ok.clone());
        store.register(TestBody::failing(bad_id, "B"));
        node.register_body(ok_id);
        node.register_body(bad_id);

        let report = node.terminate(&store);
        assert_eq!(report.terminated, vec![ok_id]);
        assert_eq!(report.failed, vec![bad_id]);
        assert!(!report.all_failed());
        assert!(ok.is_terminated());
        assert_eq!(store.local_count(), 0);
        assert!(node.body_ids().is_empty());
    }

    #[test]
    fn test_terminate_reports_total_failure() {
        let store = BodyStore::new();
        let node = node("pamr://h:1/n0");
        let bad_id = BodyId(VmId(1), 9);
        store.register(TestBody::failing(bad_id, "B"));
        node.register_body(bad_id);

        let report = node.terminate(&store);
        assert!(report.all_failed());
        assert_eq!(report.removed(), vec![bad_id]);
        // Empty sweeps are a success, not a failure.
        assert!(!node.terminate(&store).all_failed());
    }

    #[test]
    fn test_properties_and_virtual_node_name() {
        let node = node("pamr://h:1/n0");
        assert_eq!(node.virtual_node_name(), None);
        node.set_virtual_node_name(Some("workers".to_string()));
        assert_eq!(node.virtual_node_name(), Some("workers".to_string()));

        assert_eq!(
            node.set_property("os".to_string(), "linux".to_string()),
            None
        );
        assert_eq!(node.property("os"), Some("linux".to_string()));
        assert_eq!(node.property("arch"), None);
    }
}
