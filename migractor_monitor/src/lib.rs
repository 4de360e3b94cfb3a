/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A polling monitor for migractor runtimes.
//!
//! # Data model
//!
//! Monitoring is a tree of views mirroring the deployment:
//! [`world::World`] at the root, then [`host::HostView`],
//! [`runtime::RuntimeView`], [`node::NodeView`] and finally one
//! [`active_object::ActiveObjectView`] per live object.
//! [`virtual_node::VirtualNodeView`]s group nodes by deployment tag,
//! across hosts and runtimes, without owning them.
//!
//! Runtimes never push their structure: a [`poller::Poller`] drives
//! periodic discovery passes that reconcile each view's children
//! against snapshots fetched through
//! [`migractor::remote::RemoteRuntime`]. A pass that cannot reach its
//! counterpart logs and leaves the stale views standing; overlapping
//! passes bounce off per-view guards instead of queueing. Runtime
//! lifecycle events, where available, are applied in between polls as
//! hints ([`world::World::apply_event`]); the poll remains the source
//! of truth.
//!
//! An active object view is tracked by identity: the world-wide index
//! guarantees one view per identifier, wherever scans rediscover it,
//! and migration moves that one view between node views. Observed
//! calls between objects build a graph of
//! [`communication::Communication`] edges with saturating call
//! counters.
//!
//! Every view announces its changes as
//! [`notification::MonitorNotification`]s on its own observer bus;
//! delivery is inline on the announcing thread.

#![deny(missing_docs)]

pub mod active_object;
pub mod communication;
pub mod host;
pub mod node;
pub mod notification;
pub mod poller;
pub mod runtime;
pub mod state;
pub mod tree;
pub mod virtual_node;
pub mod world;

pub use active_object::ActiveObjectView;
pub use active_object::MigrationTicket;
pub use communication::Communication;
pub use communication::MAX_COMMUNICATION_CALLS;
pub use host::HostView;
pub use node::NodeView;
pub use notification::MonitorNotification;
pub use poller::Poller;
pub use poller::PollerHandle;
pub use runtime::RUNTIME_KILL_GRACE;
pub use runtime::RuntimeView;
pub use state::State;
pub use tree::TreeItem;
pub use tree::TreeItemKind;
pub use virtual_node::VirtualNodeView;
pub use world::World;
