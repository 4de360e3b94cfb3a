/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The common shape of monitor tree views.

use std::collections::HashSet;

use async_trait::async_trait;
use migractor::observer::Observers;

use crate::notification::MonitorNotification;

/// The level of the monitor tree a view sits at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TreeItemKind {
    /// The root of the tree.
    World,
    /// A machine, keyed by host url.
    Host,
    /// One runtime process on a host.
    Runtime,
    /// One deployment slot of a runtime.
    Node,
    /// A deployment grouping of nodes across runtimes.
    VirtualNode,
    /// One active object.
    ActiveObject,
}

/// What every view of the monitor tree can do, whatever its level.
///
/// Discovery itself is not part of the trait: each level finds its
/// children differently and [`explore`](TreeItem::explore) hides the
/// difference. A pass that cannot reach its remote counterpart logs
/// and gives up; the views it already built stay in place until a
/// later pass contradicts them.
#[async_trait]
pub trait TreeItem: Send + Sync {
    /// The view's stable key among its siblings.
    fn key(&self) -> &str;

    /// The level of the tree the view sits at.
    fn kind(&self) -> TreeItemKind;

    /// The view's notification bus.
    fn observers(&self) -> &Observers<MonitorNotification>;

    /// Whether discovery passes visit this view.
    fn is_monitored(&self) -> bool;

    /// Start monitoring the view and run one discovery pass right
    /// away. No-op when already monitored.
    async fn set_monitored(&self);

    /// Stop monitoring the view: every child view is destroyed and a
    /// single state change is published. No-op when already
    /// unmonitored.
    fn set_unmonitored(&self);

    /// Reconcile the view's children against the live system.
    async fn explore(&self);

    /// Drop the view's subtree, children before parents.
    fn destroy(&self);
}

/// Split discovered child keys against known ones.
///
/// Returns the keys to add (discovered but not yet known, in
/// discovery order) and the keys to remove (known but no longer
/// discovered).
pub fn diff_keys(known: &[String], discovered: &[String]) -> (Vec<String>, Vec<String>) {
    let known_set: HashSet<&str> = known.iter().map(String::as_str).collect();
    let discovered_set: HashSet<&str> = discovered.iter().map(String::as_str).collect();
    let added = discovered
        .iter()
        .filter(|key| !known_set.contains(key.as_str()))
        .cloned()
        .collect();
    let removed = known
        .iter()
        .filter(|key| !discovered_set.contains(key.as_str()))
        .cloned()
        .collect();
    (added, removed)
}
