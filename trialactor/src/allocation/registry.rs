/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A registry of live allocations, for callers outside the trial that
//! need to find an allocation by id (for example, to signal it).
//!
//! The registry is created once per process and passed by reference to
//! whatever needs it. Supervisors register on start and deregister on
//! teardown; reads never take the write lock.

use std::collections::HashMap;
use std::sync::RwLock;

use super::AllocationRef;
use crate::reference::AllocationId;

/// Live allocations by id.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    allocations: RwLock<HashMap<AllocationId, AllocationRef>>,
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocation, replacing any previous entry for its id.
    pub fn register(&self, allocation: AllocationRef) {
        self.allocations
            .write()
            .expect("allocation registry poisoned")
            .insert(allocation.allocation_id().clone(), allocation);
    }

    /// Remove an allocation, returning its entry.
    pub fn deregister(&self, allocation_id: &AllocationId) -> Option<AllocationRef> {
        self.allocations
            .write()
            .expect("allocation registry poisoned")
            .remove(allocation_id)
    }

    /// Look up an allocation.
    pub fn get(&self, allocation_id: &AllocationId) -> Option<AllocationRef> {
        self.allocations
            .read()
            .expect("allocation registry poisoned")
            .get(allocation_id)
            .cloned()
    }

    pub fn contains(&self, allocation_id: &AllocationId) -> bool {
        self.allocations
            .read()
            .expect("allocation registry poisoned")
            .contains_key(allocation_id)
    }

    pub fn len(&self) -> usize {
        self.allocations
            .read()
            .expect("allocation registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all live allocations, sorted.
    pub fn allocation_ids(&self) -> Vec<AllocationId> {
        let mut ids: Vec<_> = self
            .allocations
            .read()
            .expect("allocation registry poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
