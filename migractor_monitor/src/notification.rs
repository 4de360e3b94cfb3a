/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Change notifications published by tree views.

use enum_as_inner::EnumAsInner;
use migractor::reference::BodyId;

use crate::state::State;

/// A change one view announces to its observers.
///
/// Child keys are the keys the children go by in their parent's map:
/// a url string for hosts, runtimes and nodes, an identifier string
/// for active objects, a plain name for virtual nodes.
#[derive(Clone, Debug, PartialEq, Eq, EnumAsInner)]
pub enum MonitorNotification {
    /// One child view was attached.
    ChildAdded(String),
    /// Several child views were attached in a single pass.
    ChildrenAdded(Vec<String>),
    /// A child view was detached.
    ChildRemoved(String),
    /// The view's observed state changed.
    StateChanged(State),
    /// A call edge towards the given target was attached.
    OutgoingEdgeAdded(BodyId),
    /// A call edge towards the given target was detached.
    OutgoingEdgeRemoved(BodyId),
    /// A call edge from the given source was attached.
    IncomingEdgeAdded(BodyId),
    /// A call edge from the given source was detached.
    IncomingEdgeRemoved(BodyId),
    /// Every outgoing call edge was dropped at once.
    AllOutgoingCleared,
    /// Every incoming call edge was dropped at once.
    AllIncomingCleared,
    /// The view's pending-request count changed.
    RequestQueueChanged(i64),
    /// The host's descriptive attributes were updated.
    HostAttributesUpdated,
    /// The runtime behind the view is shutting down.
    RuntimeKilled,
}
