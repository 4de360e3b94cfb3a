/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Migractor is a runtime for migratory active objects.
//!
//! # Data model
//!
//! A process hosts exactly one [`runtime::Runtime`]. The runtime owns
//! named [`node::LocalNode`]s, deployment slots that bodies are
//! created into. A body ([`body::Body`]) is the live execution state
//! of an active object; it carries an identifier minted at creation
//! that never changes, no matter how many times the body migrates
//! between nodes or between runtimes.
//!
//! Nodes do not own bodies. The runtime's body store does; nodes keep
//! lists of resident body ids that are allowed to go stale and are
//! purged lazily on every scan. This is what makes migration cheap:
//! moving a body is one store registration on the destination and one
//! list edit on each side.
//!
//! Runtimes learn about each other through peer registration and are
//! observed from outside through the [`remote::RemoteRuntime`] trait,
//! resolved via a [`remote::RuntimeDirectory`]. Lifecycle transitions
//! are announced on a typed observer bus ([`event::RuntimeEvent`]);
//! consumers treat those events as hints and re-poll for truth.
//!
//! | Entity  | Identifier                   |
//! |---------|------------------------------|
//! | Host    | `pamr://host:port/`          |
//! | Runtime | `pamr://host:port/PA_JVM<n>` |
//! | Node    | `pamr://host:port/<node>`    |
//! | Body    | `<vm>[<seq>]`                |
//!
//! The `migractord` binary starts a runtime, pre-creates its capacity
//! nodes, and parks until interrupted.

#![deny(missing_docs)]

pub mod body;
pub mod config;
pub mod event;
pub mod node;
pub mod observer;
pub mod reference;
pub mod remote;
pub mod runtime;
pub mod test_utils;

pub use body::Body;
pub use body::BodyHandle;
pub use body::BodyRef;
pub use config::RuntimeConfig;
pub use event::RuntimeEvent;
pub use node::LocalNode;
pub use reference::BodyId;
pub use reference::HostUrl;
pub use reference::NodeUrl;
pub use reference::RuntimeUrl;
pub use remote::RemoteRuntime;
pub use remote::RuntimeDirectory;
pub use runtime::Runtime;
