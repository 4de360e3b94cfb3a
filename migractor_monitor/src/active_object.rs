/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Leaf views: one monitored active object each.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use enum_as_inner::EnumAsInner;
use migractor::body::BodyRef;
use migractor::observer::Observers;
use migractor::reference::BodyId;
use migractor::reference::NodeUrl;
use migractor::reference::RuntimeUrl;

use crate::communication::Communication;
use crate::node::NodeView;
use crate::notification::MonitorNotification;
use crate::state;
use crate::state::State;
use crate::tree::TreeItem;
use crate::tree::TreeItemKind;
use crate::world::World;
use crate::world::WorldState;

/// Where a view stands in the two-phase migration protocol.
#[derive(Clone, Debug, PartialEq, Eq, EnumAsInner)]
pub enum MigrationTicket {
    /// No migration is underway.
    Idle,
    /// Departure was announced; the destination stays recorded until
    /// the confirmation arrives.
    Pending {
        /// The node the object is moving to.
        destination: NodeUrl,
    },
    /// The last announced migration was reported failed.
    Failed {
        /// The reported failure.
        reason: String,
    },
}

impl MigrationTicket {
    /// Record a departure announcement. A repeated announcement
    /// replaces the previous one, confirmed or not.
    pub fn begin(&mut self, destination: NodeUrl) {
        *self = Self::Pending { destination };
    }

    /// Consume the pending destination, leaving the ticket idle.
    /// A ticket that is not pending is left untouched.
    pub fn take_pending(&mut self) -> Option<NodeUrl> {
        match self {
            Self::Pending { destination } => {
                let destination = destination.clone();
                *self = Self::Idle;
                Some(destination)
            }
            _ => None,
        }
    }

    /// Record a failure report.
    pub fn fail(&mut self, reason: impl Into<String>) {
        *self = Self::Failed {
            reason: reason.into(),
        };
    }
}

/// The leaf of the monitor tree: one active object, tracked by
/// identity for as long as it lives, across any number of moves
/// between nodes.
///
/// A view hangs under the [`NodeView`] currently hosting its object
/// and is indexed once, world-wide, under its identifier string. The
/// short display name (`ao#<n>`) is allocated in discovery order and
/// never reused.
#[derive(Debug)]
pub struct ActiveObjectView {
    this: Weak<Self>,
    id: BodyId,
    key: String,
    short_name: String,
    class_name: String,
    world: Weak<WorldState>,
    parent: Mutex<Weak<NodeView>>,
    reference: Mutex<BodyRef>,
    state: Mutex<State>,
    request_queue_length: AtomicI64,
    outgoing: Mutex<Vec<Arc<Communication>>>,
    incoming: Mutex<Vec<Arc<Communication>>>,
    ticket: Mutex<MigrationTicket>,
    monitored: AtomicBool,
    destroyed: AtomicBool,
    observers: Observers<MonitorNotification>,
}

impl ActiveObjectView {
    pub(crate) fn new(
        world: &World,
        parent: &Arc<NodeView>,
        id: BodyId,
        class_name: &str,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            id,
            key: id.to_string(),
            short_name: world.allocate_short_name(),
            class_name: class_name.to_string(),
            world: world.downgrade(),
            parent: Mutex::new(Arc::downgrade(parent)),
            reference: Mutex::new(BodyRef::new(id, parent.url().clone())),
            state: Mutex::new(State::Unknown),
            request_queue_length: AtomicI64::new(-1),
            outgoing: Mutex::new(Vec::new()),
            incoming: Mutex::new(Vec::new()),
            ticket: Mutex::new(MigrationTicket::Idle),
            monitored: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            observers: Observers::new(),
        })
    }

    /// The identifier of the monitored object.
    pub fn id(&self) -> BodyId {
        self.id
    }

    /// The short display name allocated at discovery.
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// The class name of the computation the object runs.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The view's observed state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// The last observed pending-request count, `-1` before the first
    /// observation.
    pub fn request_queue_length(&self) -> i64 {
        self.request_queue_length.load(Ordering::SeqCst)
    }

    /// The node view the object currently hangs under.
    pub fn parent(&self) -> Option<Arc<NodeView>> {
        self.parent.lock().unwrap().upgrade()
    }

    /// The rebindable reference tracking where the object lives.
    pub fn reference(&self) -> BodyRef {
        self.reference.lock().unwrap().clone()
    }

    /// A copy of the view's migration ticket.
    pub fn ticket(&self) -> MigrationTicket {
        self.ticket.lock().unwrap().clone()
    }

    /// The call edges leaving this object.
    pub fn outgoing(&self) -> Vec<Arc<Communication>> {
        self.outgoing.lock().unwrap().clone()
    }

    /// The call edges arriving at this object.
    pub fn incoming(&self) -> Vec<Arc<Communication>> {
        self.incoming.lock().unwrap().clone()
    }

    /// Record an observed state signal.
    ///
    /// A signal equal to the current state is dropped. Raw signals
    /// are refined through [`state::apply`] before being recorded and
    /// announced.
    pub fn set_state(&self, incoming: State) {
        let resolved = {
            let mut current = self.state.lock().unwrap();
            if *current == incoming {
                return;
            }
            *current = state::apply(*current, incoming);
            *current
        };
        self.observers
            .notify(&MonitorNotification::StateChanged(resolved));
    }

    /// Count a request entering the object's queue.
    pub fn add_request(&self) {
        let length = self.request_queue_length.fetch_add(1, Ordering::SeqCst) + 1;
        self.observers
            .notify(&MonitorNotification::RequestQueueChanged(length));
    }

    /// Count a request leaving the object's queue.
    pub fn remove_request(&self) {
        let length = self.request_queue_length.fetch_sub(1, Ordering::SeqCst) - 1;
        self.observers
            .notify(&MonitorNotification::RequestQueueChanged(length));
    }

    /// Record an observed queue length. Nothing is announced when the
    /// length did not change.
    pub fn set_request_queue_length(&self, length: i64) {
        if self.request_queue_length.swap(length, Ordering::SeqCst) != length {
            self.observers
                .notify(&MonitorNotification::RequestQueueChanged(length));
        }
    }

    /// Record one call from this object to `target`.
    ///
    /// An existing edge only has its counter bumped. A new edge is
    /// created only when the target is known somewhere in the world
    /// and both endpoint views have at least one observer attached;
    /// otherwise the call is dropped.
    pub fn record_call_to(&self, target: BodyId) {
        let Some(world) = World::upgrade(&self.world) else {
            return;
        };
        if !world.communication_handling_enabled() {
            return;
        }
        if let Some(edge) = self.outgoing_edge_to(target) {
            edge.add_one_call();
            return;
        }
        let Some(peer) = world.find_active_object(&target.to_string()) else {
            tracing::debug!(
                source = %self.id,
                target = %target,
                "dropping call record: unknown target"
            );
            return;
        };
        if self.observers.count() == 0 || peer.observers.count() == 0 {
            return;
        }
        let edge = Arc::new(Communication::new(self.id, target));
        self.attach_outgoing(Arc::clone(&edge));
        peer.attach_incoming(edge);
    }

    /// Record one call arriving at this object from `source`. The
    /// mirror image of [`ActiveObjectView::record_call_to`].
    pub fn record_call_from(&self, source: BodyId) {
        let Some(world) = World::upgrade(&self.world) else {
            return;
        };
        if !world.communication_handling_enabled() {
            return;
        }
        if let Some(edge) = self.incoming_edge_from(source) {
            edge.add_one_call();
            return;
        }
        let Some(peer) = world.find_active_object(&source.to_string()) else {
            tracing::debug!(
                source = %source,
                target = %self.id,
                "dropping call record: unknown source"
            );
            return;
        };
        if self.observers.count() == 0 || peer.observers.count() == 0 {
            return;
        }
        let edge = Arc::new(Communication::new(source, self.id));
        peer.attach_outgoing(Arc::clone(&edge));
        self.attach_incoming(edge);
    }

    /// Drop every call edge attached to this view.
    ///
    /// `softly` detaches edge by edge, removing each one from the
    /// peer's list as well, with per-edge notifications on both
    /// sides. Otherwise both lists are bulk-cleared, peers keep their
    /// entries, and exactly two notifications are published.
    pub fn remove_all_communications(&self, softly: bool) {
        if softly {
            let outgoing = std::mem::take(&mut *self.outgoing.lock().unwrap());
            for edge in outgoing {
                let target = edge.target();
                if let Some(peer) = self.find_peer(target) {
                    peer.detach_incoming(self.id);
                }
                self.observers
                    .notify(&MonitorNotification::OutgoingEdgeRemoved(target));
            }
            let incoming = std::mem::take(&mut *self.incoming.lock().unwrap());
            for edge in incoming {
                let source = edge.source();
                if let Some(peer) = self.find_peer(source) {
                    peer.detach_outgoing(self.id);
                }
                self.observers
                    .notify(&MonitorNotification::IncomingEdgeRemoved(source));
            }
        } else {
            self.outgoing.lock().unwrap().clear();
            self.incoming.lock().unwrap().clear();
            self.observers.notify(&MonitorNotification::AllOutgoingCleared);
            self.observers.notify(&MonitorNotification::AllIncomingCleared);
        }
    }

    /// Record a departure announcement: the destination is remembered
    /// and the view turns [`State::Migrating`]. A repeated
    /// announcement replaces the remembered destination.
    pub fn prepare_to_migrate(&self, destination: NodeUrl) {
        tracing::debug!(id = %self.id, destination = %destination, "migration announced");
        self.ticket.lock().unwrap().begin(destination);
        self.set_state(State::Migrating);
    }

    /// Confirm a migration: rebind the view under the destination
    /// node.
    ///
    /// A confirmation without a matching announcement, or one
    /// arriving again after the move was applied, is dropped. When
    /// the destination host, runtime, or node is not part of the
    /// monitor tree, the confirmation is abandoned and the
    /// announcement stays recorded for a later attempt.
    pub fn finish_migration(&self, destination_runtime_url: &RuntimeUrl) {
        if self.state() != State::Migrating {
            return;
        }
        let destination_node_url = {
            let ticket = self.ticket.lock().unwrap();
            match ticket.as_pending() {
                Some(destination) => destination.clone(),
                None => return,
            }
        };
        let Some(world) = World::upgrade(&self.world) else {
            return;
        };
        let host_key = destination_runtime_url.host_url().to_string();
        let Some(host) = world.host(&host_key) else {
            tracing::warn!(
                id = %self.id,
                host = %host_key,
                "abandoning migration confirmation: unknown host"
            );
            return;
        };
        let runtime_key = destination_runtime_url.to_string();
        let Some(runtime) = host.runtime(&runtime_key) else {
            tracing::warn!(
                id = %self.id,
                runtime = %runtime_key,
                "abandoning migration confirmation: unknown runtime"
            );
            return;
        };
        let node_key = destination_node_url.to_string();
        let Some(node) = runtime.node(&node_key) else {
            tracing::warn!(
                id = %self.id,
                node = %node_key,
                "abandoning migration confirmation: unknown node"
            );
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };

        self.ticket.lock().unwrap().take_pending();
        let previous = {
            let mut parent = self.parent.lock().unwrap();
            std::mem::replace(&mut *parent, Arc::downgrade(&node))
        };
        if let Some(previous) = previous.upgrade() {
            previous.release_child(&self.key);
        }
        self.reference
            .lock()
            .unwrap()
            .rebind(destination_node_url.clone());
        node.adopt_child(this);
        tracing::info!(
            id = %self.id,
            destination = %destination_node_url,
            "migration confirmed"
        );
        self.set_state(State::WaitingForRequest);
    }

    /// Record that an announced migration failed. The view keeps its
    /// current state; a retry starts with a fresh announcement.
    pub fn migration_failed(&self, reason: &str) {
        tracing::warn!(id = %self.id, reason = %reason, "migration failed");
        self.ticket.lock().unwrap().fail(reason);
    }

    fn outgoing_edge_to(&self, target: BodyId) -> Option<Arc<Communication>> {
        self.outgoing
            .lock()
            .unwrap()
            .iter()
            .find(|edge| edge.target() == target)
            .cloned()
    }

    fn incoming_edge_from(&self, source: BodyId) -> Option<Arc<Communication>> {
        self.incoming
            .lock()
            .unwrap()
            .iter()
            .find(|edge| edge.source() == source)
            .cloned()
    }

    fn find_peer(&self, id: BodyId) -> Option<Arc<ActiveObjectView>> {
        World::upgrade(&self.world)?.find_active_object(&id.to_string())
    }

    pub(crate) fn attach_outgoing(&self, edge: Arc<Communication>) {
        let target = edge.target();
        self.outgoing.lock().unwrap().push(edge);
        self.observers
            .notify(&MonitorNotification::OutgoingEdgeAdded(target));
    }

    pub(crate) fn attach_incoming(&self, edge: Arc<Communication>) {
        let source = edge.source();
        self.incoming.lock().unwrap().push(edge);
        self.observers
            .notify(&MonitorNotification::IncomingEdgeAdded(source));
    }

    pub(crate) fn detach_outgoing(&self, target: BodyId) {
        let removed = {
            let mut outgoing = self.outgoing.lock().unwrap();
            let before = outgoing.len();
            outgoing.retain(|edge| edge.target() != target);
            before != outgoing.len()
        };
        if removed {
            self.observers
                .notify(&MonitorNotification::OutgoingEdgeRemoved(target));
        }
    }

    pub(crate) fn detach_incoming(&self, source: BodyId) {
        let removed = {
            let mut incoming = self.incoming.lock().unwrap();
            let before = incoming.len();
            incoming.retain(|edge| edge.source() != source);
            before != incoming.len()
        };
        if removed {
            self.observers
                .notify(&MonitorNotification::IncomingEdgeRemoved(source));
        }
    }
}

#[async_trait]
impl TreeItem for ActiveObjectView {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TreeItemKind {
        TreeItemKind::ActiveObject
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
        *self.state.lock().unwrap() = State::NotMonitored;
        self.observers
            .notify(&MonitorNotification::StateChanged(State::NotMonitored));
    }

    async fn explore(&self) {}

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(id = %self.id, "dropping active object view");
        if let Some(world) = World::upgrade(&self.world) {
            world.remove_active_object(&self.key);
        }
        self.remove_all_communications(false);
        let parent = self.parent.lock().unwrap().upgrade();
        if let Some(parent) = parent {
            parent.release_child(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use migractor::Runtime;
    use migractor::test_utils::constructor;

    use super::*;
    use crate::world::testing::collect;
    use crate::world::testing::explored_world;
    use crate::world::testing::node_key;
    use crate::world::testing::node_name;
    use crate::world::testing::test_runtime;

    async fn world_with_bodies(
        port: u16,
        class_names: &[&str],
    ) -> (Runtime, World, Vec<Arc<ActiveObjectView>>) {
        let runtime = test_runtime(port);
        runtime.create_capacity_nodes().unwrap();
        let ids: Vec<BodyId> = class_names
            .iter()
            .map(|class_name| {
                runtime
                    .create_body(&node_name(&runtime, 0), constructor(class_name), true)
                    .unwrap()
                    .id()
            })
            .collect();
        let world = explored_world(&[&runtime]).await;
        let views = ids
            .iter()
            .map(|id| world.find_active_object(&id.to_string()).unwrap())
            .collect();
        (runtime, world, views)
    }

    #[test]
    fn test_ticket_lifecycle() {
        let first: NodeUrl = "pamr://somewhere:8000/a".parse().unwrap();
        let second: NodeUrl = "pamr://somewhere:8000/b".parse().unwrap();

        let mut ticket = MigrationTicket::Idle;
        assert!(ticket.take_pending().is_none());
        ticket.begin(first.clone());
        ticket.begin(second.clone());
        assert_eq!(ticket.take_pending(), Some(second));
        assert_eq!(ticket, MigrationTicket::Idle);

        ticket.fail("lost");
        assert!(ticket.is_failed());
        assert!(ticket.take_pending().is_none());
        ticket.begin(first);
        assert!(ticket.is_pending());
    }

    #[tokio::test]
    async fn test_state_signals_are_refined() {
        let (_runtime, _world, views) = world_with_bodies(7101, &["Worker"]).await;
        let view = &views[0];
        let events = collect(view.observers());

        view.set_state(State::Active);
        view.set_state(State::WaitingByNecessity);
        view.set_state(State::WaitingByNecessity);
        view.set_state(State::ReceivedFutureResult);
        view.set_state(State::ServingRequest);
        view.set_state(State::WaitingByNecessity);
        view.set_state(State::ReceivedFutureResult);
        view.set_state(State::ServingRequest);

        assert_eq!(view.state(), State::ServingRequest);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                MonitorNotification::StateChanged(State::Active),
                MonitorNotification::StateChanged(State::WaitingByNecessityWhileActive),
                MonitorNotification::StateChanged(State::WaitingByNecessityWhileActive),
                MonitorNotification::StateChanged(State::Active),
                MonitorNotification::StateChanged(State::ServingRequest),
                MonitorNotification::StateChanged(State::WaitingByNecessityWhileServing),
                MonitorNotification::StateChanged(State::ServingRequest),
            ]
        );
    }

    #[tokio::test]
    async fn test_call_recording_rules() {
        let (runtime, _world, views) = world_with_bodies(7102, &["Caller", "Target"]).await;
        let caller = &views[0];
        let target = &views[1];

        caller.record_call_to(runtime.next_body_id());
        assert!(caller.outgoing().is_empty());

        caller.record_call_to(target.id());
        assert!(caller.outgoing().is_empty());

        let caller_events = collect(caller.observers());
        let target_events = collect(target.observers());
        caller.record_call_to(target.id());
        assert_eq!(caller.outgoing()[0].target(), target.id());
        assert_eq!(target.incoming()[0].source(), caller.id());

        caller.record_call_to(target.id());
        target.record_call_from(caller.id());
        assert_eq!(caller.outgoing().len(), 1);
        assert_eq!(caller.outgoing()[0].calls(), 3);
        assert_eq!(
            *caller_events.lock().unwrap(),
            vec![MonitorNotification::OutgoingEdgeAdded(target.id())]
        );
        assert_eq!(
            *target_events.lock().unwrap(),
            vec![MonitorNotification::IncomingEdgeAdded(caller.id())]
        );
    }

    #[tokio::test]
    async fn test_edges_survive_peer_destruction() {
        let (_runtime, world, views) = world_with_bodies(7103, &["Caller", "Target"]).await;
        let caller = &views[0];
        let target = &views[1];
        let _caller_events = collect(caller.observers());
        let _target_events = collect(target.observers());

        caller.record_call_to(target.id());
        target.destroy();
        assert!(world.find_active_object(&target.id().to_string()).is_none());
        assert!(target.incoming().is_empty());

        caller.record_call_to(target.id());
        assert_eq!(caller.outgoing().len(), 1);
        assert_eq!(caller.outgoing()[0].calls(), 2);
    }

    #[tokio::test]
    async fn test_soft_and_rough_edge_removal() {
        let (_runtime, _world, views) =
            world_with_bodies(7104, &["Hub", "Callee", "Upstream"]).await;
        let hub = &views[0];
        let callee = &views[1];
        let upstream = &views[2];
        let hub_events = collect(hub.observers());
        let callee_events = collect(callee.observers());
        let upstream_events = collect(upstream.observers());

        hub.record_call_to(callee.id());
        upstream.record_call_to(hub.id());
        hub.remove_all_communications(true);
        assert!(hub.outgoing().is_empty());
        assert!(hub.incoming().is_empty());
        assert!(callee.incoming().is_empty());
        assert!(upstream.outgoing().is_empty());

        hub.record_call_to(callee.id());
        hub.remove_all_communications(false);
        assert!(hub.outgoing().is_empty());
        assert_eq!(callee.incoming().len(), 1);

        assert_eq!(
            *hub_events.lock().unwrap(),
            vec![
                MonitorNotification::OutgoingEdgeAdded(callee.id()),
                MonitorNotification::IncomingEdgeAdded(upstream.id()),
                MonitorNotification::OutgoingEdgeRemoved(callee.id()),
                MonitorNotification::IncomingEdgeRemoved(upstream.id()),
                MonitorNotification::OutgoingEdgeAdded(callee.id()),
                MonitorNotification::AllOutgoingCleared,
                MonitorNotification::AllIncomingCleared,
            ]
        );
        assert_eq!(
            *callee_events.lock().unwrap(),
            vec![
                MonitorNotification::IncomingEdgeAdded(hub.id()),
                MonitorNotification::IncomingEdgeRemoved(hub.id()),
                MonitorNotification::IncomingEdgeAdded(hub.id()),
            ]
        );
        assert_eq!(
            *upstream_events.lock().unwrap(),
            vec![
                MonitorNotification::OutgoingEdgeAdded(hub.id()),
                MonitorNotification::OutgoingEdgeRemoved(hub.id()),
            ]
        );
    }

    #[tokio::test]
    async fn test_queue_length_signals() {
        let (_runtime, _world, views) = world_with_bodies(7105, &["Worker"]).await;
        let view = &views[0];
        assert_eq!(view.request_queue_length(), 0);
        let events = collect(view.observers());

        view.add_request();
        view.add_request();
        view.remove_request();
        view.set_request_queue_length(1);
        view.set_request_queue_length(4);

        assert_eq!(view.request_queue_length(), 4);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                MonitorNotification::RequestQueueChanged(1),
                MonitorNotification::RequestQueueChanged(2),
                MonitorNotification::RequestQueueChanged(1),
                MonitorNotification::RequestQueueChanged(4),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_the_ticket() {
        let (runtime, _world, views) = world_with_bodies(7106, &["Traveler"]).await;
        let view = &views[0];
        let destination: NodeUrl = runtime.host_url().node_url(node_name(&runtime, 1));

        view.prepare_to_migrate(destination);
        assert_eq!(view.state(), State::Migrating);
        view.migration_failed("no route to destination");
        assert_eq!(
            view.ticket(),
            MigrationTicket::Failed {
                reason: "no route to destination".to_string()
            }
        );
        assert_eq!(view.state(), State::Migrating);

        view.finish_migration(runtime.url());
        assert_eq!(view.parent().unwrap().key(), node_key(&runtime, 0));
    }

    #[tokio::test]
    async fn test_confirmation_without_announcement_is_dropped() {
        let (runtime, _world, views) = world_with_bodies(7107, &["Worker"]).await;
        let view = &views[0];

        view.finish_migration(runtime.url());
        assert_eq!(view.state(), State::Unknown);
        assert_eq!(view.ticket(), MigrationTicket::Idle);
        assert_eq!(view.parent().unwrap().key(), node_key(&runtime, 0));
    }
}
