/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Call edges of the communication graph.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use migractor::reference::BodyId;

/// The value a call edge's counter saturates at.
pub const MAX_COMMUNICATION_CALLS: u32 = 100;

/// One directed call edge between two monitored active objects.
///
/// An edge carries plain identifiers, never view references; the two
/// endpoint views share a single edge through their outgoing and
/// incoming lists. The edge survives migration of either endpoint
/// unchanged.
#[derive(Debug)]
pub struct Communication {
    source: BodyId,
    target: BodyId,
    calls: AtomicU32,
}

impl Communication {
    /// Create an edge with its first call already counted.
    pub fn new(source: BodyId, target: BodyId) -> Self {
        Self {
            source,
            target,
            calls: AtomicU32::new(1),
        }
    }

    /// The calling object.
    pub fn source(&self) -> BodyId {
        self.source
    }

    /// The called object.
    pub fn target(&self) -> BodyId {
        self.target
    }

    /// The number of calls counted on this edge.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Count one more call, saturating at [`MAX_COMMUNICATION_CALLS`].
    /// Returns the counter after the call.
    pub fn add_one_call(&self) -> u32 {
        self.calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |calls| {
                (calls < MAX_COMMUNICATION_CALLS).then_some(calls + 1)
            })
            .map_or(MAX_COMMUNICATION_CALLS, |previous| previous + 1)
    }
}

#[cfg(test)]
mod tests {
    use migractor::reference::VmId;

    use super::*;

    #[test]
    fn test_first_call_is_counted_at_creation() {
        let edge = Communication::new(BodyId(VmId(1), 1), BodyId(VmId(1), 2));
        assert_eq!(edge.calls(), 1);
        assert_eq!(edge.add_one_call(), 2);
        assert_eq!(edge.calls(), 2);
    }

    #[test]
    fn test_counter_saturates() {
        let edge = Communication::new(BodyId(VmId(1), 1), BodyId(VmId(1), 2));
        for _ in 0..2 * MAX_COMMUNICATION_CALLS {
            edge.add_one_call();
        }
        assert_eq!(edge.calls(), MAX_COMMUNICATION_CALLS);
        assert_eq!(edge.add_one_call(), MAX_COMMUNICATION_CALLS);
    }
}
