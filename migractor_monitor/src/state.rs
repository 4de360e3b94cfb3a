/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Observed execution states of monitored objects.

use serde::Deserialize;
use serde::Serialize;

/// The execution state of an active object as a monitor sees it.
///
/// `WaitingByNecessity` and `ReceivedFutureResult` are raw signals a
/// view never rests in: [`apply`] refines them against the state the
/// view is already in. Entering a wait on a future remembers whether
/// the object was serving a request at the time, so the future's
/// arrival can restore `ServingRequest` rather than collapsing both
/// cases into `Active`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Nothing has been observed yet.
    Unknown,
    /// Idle, waiting for a request to serve.
    WaitingForRequest,
    /// Serving a request.
    ServingRequest,
    /// Running outside of any request.
    Active,
    /// Raw signal: blocked on an unresolved future.
    WaitingByNecessity,
    /// Blocked on a future while running outside of any request.
    WaitingByNecessityWhileActive,
    /// Blocked on a future while serving a request.
    WaitingByNecessityWhileServing,
    /// Raw signal: a future the object was blocked on resolved.
    ReceivedFutureResult,
    /// Moving to another node.
    Migrating,
    /// The object stopped answering the monitor.
    NotResponding,
    /// The view is not monitored.
    NotMonitored,
}

/// Refine an incoming state signal against the current state.
pub fn apply(current: State, incoming: State) -> State {
    match incoming {
        State::WaitingByNecessity => {
            if current == State::ServingRequest {
                State::WaitingByNecessityWhileServing
            } else {
                State::WaitingByNecessityWhileActive
            }
        }
        State::ReceivedFutureResult => {
            if current == State::WaitingByNecessityWhileServing {
                State::ServingRequest
            } else {
                State::Active
            }
        }
        _ => incoming,
    }
}
