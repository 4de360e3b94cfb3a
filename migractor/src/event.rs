/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lifecycle events published by a runtime.
//!
//! Events are push hints for monitors: they can short-circuit waiting
//! for the next poll, but polling remains the source of truth for the
//! monitored state. Delivery is fire and forget through the runtime's
//! observer list; a runtime never waits for, or learns about, its
//! observers.

use std::fmt;
use std::time::SystemTime;

use chrono::DateTime;
use chrono::offset::Local;
use derivative::Derivative;
use serde::Deserialize;
use serde::Serialize;

use crate::reference::BodyId;
use crate::reference::NodeUrl;
use crate::reference::Protocol;
use crate::reference::RuntimeUrl;
use crate::reference::VmId;

/// The payload carried by peer registration and deregistration events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeRegistration {
    /// The vm id of the runtime that created the registered runtime.
    pub creator_id: VmId,
    /// The url of the registered runtime.
    pub runtime_url: RuntimeUrl,
    /// The protocol the registered runtime speaks.
    pub protocol: Protocol,
    /// The vm name of the registered runtime.
    pub vm_name: String,
}

/// A timestamped lifecycle event. Equality ignores the timestamp so
/// tests can compare against expected events directly.
#[derive(Clone, Debug, Derivative, Serialize, Deserialize)]
#[derivative(PartialEq, Eq)]
pub struct RuntimeEvent {
    /// The url of the runtime that published the event.
    pub origin: RuntimeUrl,
    /// The time at which the event was published.
    #[derivative(PartialEq = "ignore")]
    pub occurred_at: SystemTime,
    /// What happened.
    pub kind: RuntimeEventKind,
}

impl RuntimeEvent {
    /// Create a new event stamped with the current time.
    pub fn new(origin: RuntimeUrl, kind: RuntimeEventKind) -> Self {
        Self {
            origin,
            occurred_at: SystemTime::now(),
            kind,
        }
    }
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} at {}",
            self.origin,
            self.kind,
            DateTime::<Local>::from(self.occurred_at)
        )
    }
}

/// The kinds of lifecycle event a runtime publishes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEventKind {
    /// A local node was created.
    NodeCreated {
        /// The new node's url.
        node_url: NodeUrl,
    },
    /// A local node was killed.
    NodeDestroyed {
        /// The killed node's url.
        node_url: NodeUrl,
    },
    /// A body was registered on a local node.
    BodyCreated {
        /// The hosting node's url.
        node_url: NodeUrl,
        /// The body's identifier.
        id: BodyId,
        /// The class name of the computation the body runs.
        class_name: String,
    },
    /// A body resident on a local node was terminated.
    BodyDestroyed {
        /// The hosting node's url.
        node_url: NodeUrl,
        /// The body's identifier.
        id: BodyId,
    },
    /// A peer runtime registered itself with this runtime.
    RuntimeRegistered(RuntimeRegistration),
    /// A peer runtime deregistered itself from this runtime.
    RuntimeUnregistered(RuntimeRegistration),
    /// This runtime was killed.
    RuntimeDestroyed,
    /// A body is about to migrate away from this runtime.
    MigrationAboutToStart {
        /// The migrating body's identifier.
        id: BodyId,
        /// The url of the node the body is migrating to.
        destination_node_url: NodeUrl,
    },
    /// A body finished migrating; published by the destination runtime.
    MigrationFinished {
        /// The migrated body's identifier.
        id: BodyId,
        /// The url of the runtime the body now lives in.
        destination_runtime_url: RuntimeUrl,
    },
    /// A body's pending-request count changed.
    RequestQueueChanged {
        /// The body's identifier.
        id: BodyId,
        /// The new queue length.
        length: usize,
    },
    /// A call from one body to another was served.
    RequestReceived {
        /// The calling body.
        source: BodyId,
        /// The called body.
        target: BodyId,
    },
}

impl fmt::Display for RuntimeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeCreated { node_url } => write!(f, "node created: {}", node_url),
            Self::NodeDestroyed { node_url } => write!(f, "node destroyed: {}", node_url),
            Self::BodyCreated {
                node_url,
                id,
                class_name,
            } => write!(f, "body created: {} ({}) on {}", id, class_name, node_url),
            Self::BodyDestroyed { node_url, id } => {
                write!(f, "body destroyed: {} on {}", id, node_url)
            }
            Self::RuntimeRegistered(registration) => {
                write!(f, "runtime registered: {}", registration.runtime_url)
            }
            Self::RuntimeUnregistered(registration) => {
                write!(f, "runtime unregistered: {}", registration.runtime_url)
            }
            Self::RuntimeDestroyed => write!(f, "runtime destroyed"),
            Self::MigrationAboutToStart {
                id,
                destination_node_url,
            } => write!(f, "{} about to migrate to {}", id, destination_node_url),
            Self::MigrationFinished {
                id,
                destination_runtime_url,
            } => write!(f, "{} migrated to {}", id, destination_runtime_url),
            Self::RequestQueueChanged { id, length } => {
                write!(f, "request queue of {} now {}", id, length)
            }
            Self::RequestReceived { source, target } => {
                write!(f, "request from {} served by {}", source, target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> RuntimeUrl {
        "pamr://localhost:1099/PA_JVM1".parse().unwrap()
    }

    #[test]
    fn test_equality_ignores_timestamp() {
        let node_url: NodeUrl = "pamr://localhost:1099/n0".parse().unwrap();
        let a = RuntimeEvent::new(
            origin(),
            RuntimeEventKind::NodeCreated {
                node_url: node_url.clone(),
            },
        );
        let mut b = RuntimeEvent::new(origin(), RuntimeEventKind::NodeCreated { node_url });
        b.occurred_at = SystemTime::UNIX_EPOCH;
        assert_eq!(a, b);
    }

    #[test]
    fn test_display() {
        let event = RuntimeEvent::new(
            origin(),
            RuntimeEventKind::BodyCreated {
                node_url: "pamr://localhost:1099/n0".parse().unwrap(),
                id: BodyId(VmId(0xab), 7),
                class_name: "Worker".to_string(),
            },
        );
        let rendered = event.to_string();
        assert!(rendered.contains("00000000000000ab[7]"), "{}", rendered);
        assert!(rendered.contains("Worker"), "{}", rendered);
    }
}
