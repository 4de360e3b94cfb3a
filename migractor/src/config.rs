/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime construction parameters.
//!
//! Every knob lives here and is passed to [`crate::runtime::Runtime`]
//! at construction; nothing is read from process-global state after
//! that point.

use std::thread::available_parallelism;

use serde::Deserialize;
use serde::Serialize;

use crate::reference::Protocol;

/// Parameters for constructing a runtime. `Default` yields a usable
/// local configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// The protocol the runtime's urls advertise.
    pub protocol: Protocol,
    /// The host name advertised in urls.
    pub host: String,
    /// The port advertised in urls.
    pub port: u16,
    /// The number of nodes `create_capacity_nodes` creates. Defaults
    /// to the machine's available parallelism.
    pub capacity: usize,
    /// The deployment this runtime belongs to, `-1` when undeployed.
    pub deployment_id: i64,
    /// The topology slot within the deployment, `-1` when undeployed.
    pub topology_id: i64,
    /// Whether the runtime should stay alive once its last node is
    /// gone.
    pub stay_alive: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            host: "localhost".to_string(),
            port: 1099,
            capacity: available_parallelism().map_or(1, |n| n.get()),
            deployment_id: -1,
            topology_id: -1,
            stay_alive: true,
        }
    }
}

impl RuntimeConfig {
    /// Replace the advertised protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Replace the advertised host name.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Replace the advertised port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replace the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Replace the deployment and topology ids.
    pub fn with_deployment(mut self, deployment_id: i64, topology_id: i64) -> Self {
        self.deployment_id = deployment_id;
        self.topology_id = topology_id;
        self
    }

    /// Replace the stay-alive flag.
    pub fn with_stay_alive(mut self, stay_alive: bool) -> Self {
        self.stay_alive = stay_alive;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_local_and_undeployed() {
        let config = RuntimeConfig::default();
        assert_eq!(config.protocol, Protocol::Pamr);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1099);
        assert!(config.capacity >= 1);
        assert_eq!(config.deployment_id, -1);
        assert_eq!(config.topology_id, -1);
        assert!(config.stay_alive);
    }

    #[test]
    fn test_builders_replace_fields() {
        let config = RuntimeConfig::default()
            .with_protocol(Protocol::Pnp)
            .with_host("worker7")
            .with_port(4100)
            .with_capacity(2)
            .with_deployment(12, 3)
            .with_stay_alive(false);
        assert_eq!(config.protocol, Protocol::Pnp);
        assert_eq!(config.host, "worker7");
        assert_eq!(config.port, 4100);
        assert_eq!(config.capacity, 2);
        assert_eq!(config.deployment_id, 12);
        assert_eq!(config.topology_id, 3);
        assert!(!config.stay_alive);
    }
}
