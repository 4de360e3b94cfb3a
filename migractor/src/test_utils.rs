/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Scriptable bodies for tests.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::body::Body;
use crate::body::BodyHandle;
use crate::body::ConstructorCall;
use crate::reference::BodyId;

/// A body that records termination and can be made to fail it.
#[derive(Debug)]
pub struct TestBody {
    id: BodyId,
    class_name: String,
    queue_length: AtomicUsize,
    fail_termination: bool,
    terminated: AtomicBool,
}

impl TestBody {
    /// A body that terminates cleanly.
    pub fn new(id: BodyId, class_name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            class_name: class_name.to_string(),
            queue_length: AtomicUsize::new(0),
            fail_termination: false,
            terminated: AtomicBool::new(false),
        })
    }

    /// A body that refuses to terminate.
    pub fn failing(id: BodyId, class_name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            class_name: class_name.to_string(),
            queue_length: AtomicUsize::new(0),
            fail_termination: true,
            terminated: AtomicBool::new(false),
        })
    }

    /// Whether [`Body::terminate`] has run successfully.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Script the queue length the body reports.
    pub fn set_queue_length(&self, length: usize) {
        self.queue_length.store(length, Ordering::SeqCst);
    }
}

impl Body for TestBody {
    fn id(&self) -> BodyId {
        self.id
    }

    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn request_queue_length(&self) -> usize {
        self.queue_length.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> Result<(), anyhow::Error> {
        if self.fail_termination {
            anyhow::bail!("refusing to terminate");
        }
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A constructor call producing a [`TestBody`] of the given class.
pub fn constructor(class_name: &str) -> ConstructorCall {
    let class_name = class_name.to_string();
    Box::new(move |id| {
        let body: BodyHandle = TestBody::new(id, &class_name);
        Ok(body)
    })
}
