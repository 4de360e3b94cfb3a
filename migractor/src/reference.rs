/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! References for the resources managed by a runtime.
//!
//! Every addressable entity has a stable string form that round-trips
//! through [`std::str::FromStr`]:
//!
//! - `pamr://host:port/` names a host,
//! - `pamr://host:port/PA_JVM<tag>` names a runtime,
//! - `pamr://host:port/<node>` names a node, and
//! - `<vm>[<seq>]` names a body, where `<vm>` is the hex tag of the
//!   runtime that minted the identifier.
//!
//! References implement a total ordering so that collections of them sort
//! with the hierarchy implied by host, runtime and node. Body identifiers
//! survive migration: the body keeps the identifier minted at creation no
//! matter how many times it changes nodes.

use std::cmp::Ord;
use std::cmp::PartialOrd;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// The name of the node reserved for half bodies (client-side proxies
/// without a hosting node). It never accepts user bodies and is hidden
/// from discovery.
pub const HALF_BODIES_NODE_NAME: &str = "__PA_HALFBODIES_NODE";

/// Tells whether `name` is the reserved half-bodies node name.
pub fn is_half_bodies_node(name: &str) -> bool {
    name == HALF_BODIES_NODE_NAME
}

/// The type of error that can occur when parsing a reference.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ReferenceParseError {
    /// The input does not have the expected shape.
    #[error("invalid reference {0:?}")]
    Invalid(String),

    /// The protocol component is not one we know.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    /// The port component is not a valid port number.
    #[error("invalid port in {0:?}")]
    InvalidPort(String),

    /// A reference of one kind was parsed where another was expected.
    #[error("expected a {0} reference")]
    WrongType(&'static str),
}

/// The wire protocols a url can name. The concrete transport behind a
/// protocol is provided by the remote-object layer; the core only
/// carries the tag.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString
)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    /// Message routing, the default.
    #[default]
    Pamr,
    /// Point to point.
    Pnp,
    /// Legacy registry based transport.
    Rmi,
    /// Plain http.
    Http,
}

/// VmId tags the runtime (one per process) that minted an identifier.
/// It is drawn at random when the runtime is constructed; a collision
/// between two live runtimes is out of model.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct VmId(pub u64);

impl VmId {
    /// Draw a fresh random vm id.
    pub fn random() -> Self {
        Self(rand::thread_rng().r#gen::<u64>())
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for VmId {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 {
            return Err(ReferenceParseError::Invalid(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ReferenceParseError::Invalid(s.to_string()))
    }
}

/// Bodies are identified by the vm that created them and a sequence
/// number unique within that vm. The identifier is stable across
/// migration; ordering is by vm, then sequence.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct BodyId(pub VmId, pub u64);

impl BodyId {
    /// The id of the vm that minted this identifier.
    pub fn vm_id(&self) -> VmId {
        self.0
    }

    /// The sequence number within the minting vm.
    pub fn seq(&self) -> u64 {
        self.1
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let BodyId(vm, seq) = self;
        write!(f, "{}[{}]", vm, seq)
    }
}

impl FromStr for BodyId {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vm, rest) = s
            .split_once('[')
            .ok_or_else(|| ReferenceParseError::Invalid(s.to_string()))?;
        let seq = rest
            .strip_suffix(']')
            .ok_or_else(|| ReferenceParseError::Invalid(s.to_string()))?;
        Ok(Self(
            vm.parse()?,
            seq.parse()
                .map_err(|_| ReferenceParseError::Invalid(s.to_string()))?,
        ))
    }
}

/// A host url: `proto://host:port/`. Hosts are the roots under which
/// runtimes and nodes are addressed; the trailing slash is part of the
/// canonical form.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct HostUrl {
    protocol: Protocol,
    host: String,
    port: u16,
}

impl HostUrl {
    /// Create a host url from its components.
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    /// The url's protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The url of the runtime named `name` on this host.
    pub fn runtime_url(&self, name: impl Into<String>) -> RuntimeUrl {
        RuntimeUrl {
            host: self.clone(),
            name: name.into(),
        }
    }

    /// The url of the node named `name` on this host.
    pub fn node_url(&self, name: impl Into<String>) -> NodeUrl {
        NodeUrl {
            host: self.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for HostUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}/", self.protocol, self.host, self.port)
    }
}

impl FromStr for HostUrl {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (url, rest) = split_url(s)?;
        if rest.is_empty() {
            Ok(url)
        } else {
            Err(ReferenceParseError::WrongType("host"))
        }
    }
}

/// A runtime url: `proto://host:port/<runtime name>`. The name segment
/// is the runtime's vm name (`PA_JVM<tag>`).
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct RuntimeUrl {
    host: HostUrl,
    name: String,
}

impl RuntimeUrl {
    /// The host prefix of this url, i.e. everything up to and including
    /// the last `/` of the string form.
    pub fn host_url(&self) -> &HostUrl {
        &self.host
    }

    /// The runtime name segment.
    pub fn runtime_name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RuntimeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.name)
    }
}

impl FromStr for RuntimeUrl {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, rest) = split_url(s)?;
        if rest.is_empty() {
            return Err(ReferenceParseError::WrongType("runtime"));
        }
        Ok(host.runtime_url(rest))
    }
}

/// A node url: `proto://host:port/<node name>`. Nodes are addressed at
/// host level, not nested under their runtime's url.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash
)]
pub struct NodeUrl {
    host: HostUrl,
    name: String,
}

impl NodeUrl {
    /// The host prefix of this url.
    pub fn host_url(&self) -> &HostUrl {
        &self.host
    }

    /// The node name segment.
    pub fn node_name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.name)
    }
}

impl FromStr for NodeUrl {
    type Err = ReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, rest) = split_url(s)?;
        if rest.is_empty() {
            return Err(ReferenceParseError::WrongType("node"));
        }
        Ok(host.node_url(rest))
    }
}

/// Split `proto://host:port/rest` into its host url and the (possibly
/// empty) remainder after the authority's slash.
fn split_url(s: &str) -> Result<(HostUrl, &str), ReferenceParseError> {
    let (proto, after) = s
        .split_once("://")
        .ok_or_else(|| ReferenceParseError::Invalid(s.to_string()))?;
    let protocol: Protocol = proto
        .parse()
        .map_err(|_| ReferenceParseError::UnknownProtocol(proto.to_string()))?;
    let (authority, rest) = match after.split_once('/') {
        Some((authority, rest)) => (authority, rest),
        None => (after, ""),
    };
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| ReferenceParseError::Invalid(s.to_string()))?;
    if host.is_empty() {
        return Err(ReferenceParseError::Invalid(s.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ReferenceParseError::InvalidPort(s.to_string()))?;
    Ok((HostUrl::new(protocol, host, port), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_id_parse() {
        let cases: Vec<(&str, BodyId)> = vec![
            ("0000000000000000[0]", BodyId(VmId(0), 0)),
            ("00000000000000ff[42]", BodyId(VmId(255), 42)),
            (
                "deadbeefdeadbeef[18446744073709551615]",
                BodyId(VmId(0xdead_beef_dead_beef), u64::MAX),
            ),
        ];
        for (s, expected) in cases {
            assert_eq!(s.parse::<BodyId>().unwrap(), expected, "for {}", s);
            assert_eq!(expected.to_string(), s, "for {}", s);
        }
    }

    #[test]
    fn test_body_id_parse_error() {
        let cases: Vec<&str> = vec!["", "zzzz[1]", "00ff", "00ff[1", "00ff[x]", "[1]"];
        for s in cases {
            assert!(s.parse::<BodyId>().is_err(), "for {}", s);
        }
    }

    #[test]
    fn test_url_parse() {
        let host: HostUrl = "pamr://localhost:1099/".parse().unwrap();
        assert_eq!(host.protocol(), Protocol::Pamr);
        assert_eq!(host.host(), "localhost");
        assert_eq!(host.port(), 1099);
        assert_eq!(host.to_string(), "pamr://localhost:1099/");
        // The trailing slash is optional on input.
        assert_eq!("pamr://localhost:1099".parse::<HostUrl>().unwrap(), host);

        let runtime: RuntimeUrl = "pnp://node12:64738/PA_JVM1234".parse().unwrap();
        assert_eq!(runtime.runtime_name(), "PA_JVM1234");
        assert_eq!(runtime.host_url().to_string(), "pnp://node12:64738/");
        assert_eq!(runtime.to_string(), "pnp://node12:64738/PA_JVM1234");

        let node: NodeUrl = "rmi://host:1099/PA_JVM77_GCM_NODE_0".parse().unwrap();
        assert_eq!(node.node_name(), "PA_JVM77_GCM_NODE_0");
        assert_eq!(node.host_url(), &HostUrl::new(Protocol::Rmi, "host", 1099));
    }

    #[test]
    fn test_url_parse_error() {
        assert_eq!(
            "nope://h:1/x".parse::<RuntimeUrl>().unwrap_err(),
            ReferenceParseError::UnknownProtocol("nope".to_string())
        );
        assert_eq!(
            "pamr://h:x/y".parse::<NodeUrl>().unwrap_err(),
            ReferenceParseError::InvalidPort("pamr://h:x/y".to_string())
        );
        assert!("pamr://h:1/".parse::<RuntimeUrl>().is_err());
        assert!("pamr://h:1/extra".parse::<HostUrl>().is_err());
        assert!("h:1/x".parse::<NodeUrl>().is_err());
        assert!("pamr://:1/x".parse::<NodeUrl>().is_err());
    }

    #[test]
    fn test_host_prefix_of_runtime_url() {
        // The host url is the runtime url truncated after its last '/'.
        let runtime: RuntimeUrl = "pamr://host:4000/PA_JVM1".parse().unwrap();
        let s = runtime.to_string();
        let prefix = &s[0..s.rfind('/').unwrap() + 1];
        assert_eq!(runtime.host_url().to_string(), prefix);
    }

    #[test]
    fn test_ordering() {
        let mut urls: Vec<RuntimeUrl> = vec![
            "pamr://b:1/PA_JVM2".parse().unwrap(),
            "pamr://a:2/PA_JVM9".parse().unwrap(),
            "pamr://a:1/PA_JVM3".parse().unwrap(),
            "pamr://a:1/PA_JVM1".parse().unwrap(),
        ];
        urls.sort();
        let sorted: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            sorted,
            vec![
                "pamr://a:1/PA_JVM1",
                "pamr://a:1/PA_JVM3",
                "pamr://a:2/PA_JVM9",
                "pamr://b:1/PA_JVM2",
            ]
        );

        assert!(BodyId(VmId(1), 5) < BodyId(VmId(2), 0));
        assert!(BodyId(VmId(1), 5) < BodyId(VmId(1), 6));
    }

    #[test]
    fn test_random_vm_ids_are_distinct() {
        let a = VmId::random();
        let b = VmId::random();
        assert_ne!(a, b);
        let s = a.to_string();
        assert_eq!(s.parse::<VmId>().unwrap(), a);
    }

    #[test]
    fn test_half_bodies_node() {
        assert!(is_half_bodies_node(HALF_BODIES_NODE_NAME));
        assert!(!is_half_bodies_node("PA_JVM1_GCM_NODE_0"));
    }
}
