/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Timer-driven discovery.

use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::world::World;

/// The delay between discovery passes when the caller does not pick
/// one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Drives a world with periodic discovery passes.
///
/// The poller never queues passes: a tick that fires while the
/// previous pass is still running starts a pass that bounces off the
/// per-view guards, and missed ticks are skipped outright.
pub struct Poller;

impl Poller {
    /// Start polling `world` at a fixed interval. The first pass runs
    /// immediately.
    pub fn spawn(world: World, interval: Duration) -> PollerHandle {
        let (stop, mut stopped) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        world.explore_all().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("poller stopped");
        });
        PollerHandle { stop, task }
    }
}

/// Stops its poller when asked.
#[derive(Debug)]
pub struct PollerHandle {
    stop: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the polling loop and wait for it to wind down. A pass in
    /// flight completes first.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use migractor::remote::RuntimeDirectory;
    use migractor::test_utils::constructor;

    use super::*;
    use crate::world::testing::node_name;
    use crate::world::testing::test_runtime;

    #[tokio::test(start_paused = true)]
    async fn test_poller_discovers_on_a_schedule() {
        let runtime = test_runtime(7501);
        runtime.create_capacity_nodes().unwrap();
        let directory = RuntimeDirectory::new();
        directory.expose(&runtime);
        let world = World::new(directory);
        world.add_host(runtime.host_url().clone());

        let poller = Poller::spawn(world.clone(), Duration::from_secs(5));
        tokio::task::yield_now().await;
        let host = world.host(&runtime.host_url().to_string()).unwrap();
        assert_eq!(host.runtime_count(), 1);

        let id = runtime
            .create_body(&node_name(&runtime, 0), constructor("Worker"), true)
            .unwrap()
            .id();
        assert!(world.find_active_object(&id.to_string()).is_none());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(world.find_active_object(&id.to_string()).is_some());

        poller.stop().await;
        let second = runtime
            .create_body(&node_name(&runtime, 0), constructor("Worker"), true)
            .unwrap()
            .id();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(world.find_active_object(&second.to_string()).is_none());
    }
}
