/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bodies and the per-runtime body store.
//!
//! A body is the live execution state of an active object. This core
//! treats it as opaque: something with a stable identifier, a class
//! name, and a way to be terminated. Everything else (request queue,
//! service thread) belongs to the implementation behind the trait.

use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

use crate::reference::BodyId;
use crate::reference::NodeUrl;

/// The live execution state of an active object, opaque to the
/// runtime. Implementations are free to fail termination; callers
/// continue with their remaining work and log the failure.
pub trait Body: Send + Sync + Debug {
    /// The body's stable identifier, assigned at creation and
    /// preserved across migration.
    fn id(&self) -> BodyId;

    /// The class name of the computation this body runs.
    fn class_name(&self) -> &str;

    /// The number of requests waiting to be served.
    fn request_queue_length(&self) -> usize {
        0
    }

    /// Stop the body's activity and release its resources.
    fn terminate(&self) -> Result<(), anyhow::Error>;
}

/// A shared handle to a body.
pub type BodyHandle = Arc<dyn Body>;

/// A constructor for the body of a new active object. It receives the
/// identifier the runtime minted for the body.
pub type ConstructorCall = Box<dyn FnOnce(BodyId) -> Result<BodyHandle, anyhow::Error> + Send>;

/// A location-transparent remote reference to a body: the identifier
/// plus the url of the node currently hosting it. Migration rebinds
/// the node url; the identifier never changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRef {
    id: BodyId,
    node_url: NodeUrl,
}

impl BodyRef {
    /// Create a reference to the body `id` hosted on `node_url`.
    pub fn new(id: BodyId, node_url: NodeUrl) -> Self {
        Self { id, node_url }
    }

    /// The referenced body's identifier.
    pub fn id(&self) -> BodyId {
        self.id
    }

    /// The url of the node currently believed to host the body.
    pub fn node_url(&self) -> &NodeUrl {
        &self.node_url
    }

    /// Point the reference at the body's new hosting node.
    pub fn rebind(&mut self, node_url: NodeUrl) {
        self.node_url = node_url;
    }
}

impl fmt::Display for BodyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.node_url)
    }
}

/// The result of creating a body: the caller either lives in the same
/// process and gets the body itself, or gets a rebindable remote
/// reference.
#[derive(Debug, EnumAsInner)]
pub enum SpawnedBody {
    /// The body itself, for in-process callers.
    Local(BodyHandle),
    /// A remote reference, for callers in other processes.
    Adapter(BodyRef),
}

impl SpawnedBody {
    /// The identifier of the spawned body.
    pub fn id(&self) -> BodyId {
        match self {
            Self::Local(body) => body.id(),
            Self::Adapter(body_ref) => body_ref.id(),
        }
    }
}

/// The bodies resident in one runtime. Half bodies (client-side
/// proxies with no hosting node) are tracked separately: they never
/// appear in node scans but are terminated with everything else when
/// the runtime is killed.
#[derive(Debug, Default)]
pub struct BodyStore {
    bodies: DashMap<BodyId, BodyHandle>,
    half_bodies: DashMap<BodyId, BodyHandle>,
}

impl BodyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body. Registering an already-present id leaves the
    /// store unchanged; returns whether the body was newly inserted.
    pub fn register(&self, body: BodyHandle) -> bool {
        let id = body.id();
        match self.bodies.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(body);
                true
            }
        }
    }

    /// Register a half body.
    pub fn register_half(&self, body: BodyHandle) -> bool {
        let id = body.id();
        match self.half_bodies.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(body);
                true
            }
        }
    }

    /// Look up a body by id. A miss is an ordinary outcome, not an
    /// error: ids go stale when bodies migrate away or terminate.
    pub fn get(&self, id: &BodyId) -> Option<BodyHandle> {
        self.bodies.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove and return a body.
    pub fn unregister(&self, id: &BodyId) -> Option<BodyHandle> {
        self.bodies.remove(id).map(|(_, body)| body)
    }

    /// The number of registered (full) bodies.
    pub fn local_count(&self) -> usize {
        self.bodies.len()
    }

    /// The number of registered half bodies.
    pub fn half_count(&self) -> usize {
        self.half_bodies.len()
    }

    /// Remove and return every body, full and half. Used by runtime
    /// kill, which terminates each one best effort.
    pub fn drain_all(&self) -> Vec<BodyHandle> {
        let mut drained: Vec<BodyHandle> = Vec::new();
        let ids: Vec<BodyId> = self.bodies.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, body)) = self.bodies.remove(&id) {
                drained.push(body);
            }
        }
        let half_ids: Vec<BodyId> = self.half_bodies.iter().map(|entry| *entry.key()).collect();
        for id in half_ids {
            if let Some((_, body)) = self.half_bodies.remove(&id) {
                drained.push(body);
            }
        }
        drained
    }
}
