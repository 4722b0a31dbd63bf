/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-process resource manager that counts slots per pool. Requests
//! are granted in arrival order as capacity allows.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::AllocateRequest;
use super::ContainerResources;
use super::ResourceEvent;
use super::ResourceGrant;
use super::ResourceManager;
use super::ResourceManagerError;
use crate::allocation::ExitError;
use crate::mailbox::PortHandle;
use crate::reference::AllocationId;
use crate::reference::JobId;
use crate::reference::TaskId;

/// How many of the most recent requests [`LocalResourceManager::requests`]
/// keeps.
const REQUEST_HISTORY: usize = 1024;

#[derive(Debug)]
struct Pool {
    capacity: usize,
    used: usize,
}

#[derive(Debug)]
struct Request {
    request: AllocateRequest,
    events: PortHandle<ResourceEvent>,
}

#[derive(Debug, Default)]
struct State {
    pools: HashMap<String, Pool>,
    pending: VecDeque<Request>,
    granted: HashMap<AllocationId, Request>,
    /// Forgotten when the owning job is deleted.
    task_names: HashMap<TaskId, String>,
    task_jobs: HashMap<TaskId, JobId>,
    history: VecDeque<AllocateRequest>,
}

impl State {
    fn pool(&self, name: &str) -> Result<&Pool, ResourceManagerError> {
        self.pools
            .get(name)
            .ok_or_else(|| ResourceManagerError::UnknownResourcePool(name.to_string()))
    }

    fn schedule(&mut self) {
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(pending) = self.pending.pop_front() {
            let needed = pending.request.slots_needed;
            let Some(pool) = self.pools.get_mut(&pending.request.resource_pool) else {
                waiting.push_back(pending);
                continue;
            };
            if pool.capacity - pool.used < needed {
                waiting.push_back(pending);
                continue;
            }
            pool.used += needed;
            let grant = ResourceGrant {
                allocation_id: pending.request.allocation_id.clone(),
                resource_pool: pending.request.resource_pool.clone(),
                resources: vec![ContainerResources {
                    agent_id: format!("{}-agent", pending.request.resource_pool),
                    slots: needed,
                }],
            };
            tracing::debug!(
                allocation_id = %grant.allocation_id,
                pool = %grant.resource_pool,
                slots = needed,
                "granting resources"
            );
            if let Err(err) = pending.events.send(ResourceEvent::Granted(grant)) {
                tracing::debug!("grant undeliverable: {}", err);
            }
            self.granted
                .insert(pending.request.allocation_id.clone(), pending);
        }
        self.pending = waiting;
    }
}

/// A slot-counting resource manager.
#[derive(Debug, Default)]
pub struct LocalResourceManager {
    state: Mutex<State>,
}

impl LocalResourceManager {
    /// A manager with no pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool with the given number of slots.
    pub fn with_pool(self, name: &str, slots: usize) -> Self {
        self.lock().pools.insert(
            name.to_string(),
            Pool {
                capacity: slots,
                used: 0,
            },
        );
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("resource manager state poisoned")
    }

    /// Ask the holder of a granted allocation to give its resources
    /// back. Returns false if the allocation holds no resources.
    pub fn preempt(&self, allocation_id: &AllocationId) -> bool {
        let state = self.lock();
        match state.granted.get(allocation_id) {
            Some(granted) => {
                let _ = granted.events.send(ResourceEvent::Preempted);
                true
            }
            None => false,
        }
    }

    /// Free slots of a pool.
    pub fn available_slots(&self, pool: &str) -> Option<usize> {
        self.lock()
            .pools
            .get(pool)
            .map(|pool| pool.capacity - pool.used)
    }

    /// Whether an allocation currently holds resources.
    pub fn is_granted(&self, allocation_id: &AllocationId) -> bool {
        self.lock().granted.contains_key(allocation_id)
    }

    /// Ids of requests waiting for resources, in arrival order.
    pub fn pending(&self) -> Vec<AllocationId> {
        self.lock()
            .pending
            .iter()
            .map(|pending| pending.request.allocation_id.clone())
            .collect()
    }

    /// The most recent requests received, in arrival order.
    pub fn requests(&self) -> Vec<AllocateRequest> {
        self.lock().history.iter().cloned().collect()
    }

    /// The display name of a task, if one was set.
    pub fn task_name(&self, task_id: &TaskId) -> Option<String> {
        self.lock().task_names.get(task_id).cloned()
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    async fn allocate(
        &self,
        request: AllocateRequest,
        events: PortHandle<ResourceEvent>,
    ) -> Result<(), ResourceManagerError> {
        let mut state = self.lock();
        let pool = state.pool(&request.resource_pool)?;
        if request.slots_needed > pool.capacity {
            return Err(ResourceManagerError::NotEnoughResources {
                pool: request.resource_pool.clone(),
                needed: request.slots_needed,
                capacity: pool.capacity,
            });
        }
        if state.history.len() == REQUEST_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back(request.clone());
        state
            .task_jobs
            .insert(request.task_id.clone(), request.job_id.clone());
        state.pending.push_back(Request { request, events });
        state.schedule();
        Ok(())
    }

    async fn release(&self, allocation_id: &AllocationId) -> Result<(), ResourceManagerError> {
        let mut state = self.lock();
        if let Some(granted) = state.granted.remove(allocation_id) {
            if let Some(pool) = state.pools.get_mut(&granted.request.resource_pool) {
                pool.used -= granted.request.slots_needed;
            }
            state.schedule();
        } else {
            state
                .pending
                .retain(|pending| &pending.request.allocation_id != allocation_id);
        }
        Ok(())
    }

    async fn change_resource_pool(
        &self,
        task_id: &TaskId,
        resource_pool: &str,
    ) -> Result<(), ResourceManagerError> {
        let mut state = self.lock();
        state.pool(resource_pool)?;
        for pending in state
            .pending
            .iter_mut()
            .filter(|pending| &pending.request.task_id == task_id)
        {
            pending.request.resource_pool = resource_pool.to_string();
        }
        state.schedule();
        Ok(())
    }

    async fn set_task_name(
        &self,
        task_id: &TaskId,
        name: &str,
    ) -> Result<(), ResourceManagerError> {
        self.lock()
            .task_names
            .insert(task_id.clone(), name.to_string());
        Ok(())
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<(), ResourceManagerError> {
        let mut state = self.lock();
        let (deleted, kept): (VecDeque<_>, VecDeque<_>) = state
            .pending
            .drain(..)
            .partition(|pending| &pending.request.job_id == job_id);
        state.pending = kept;
        for pending in deleted {
            let _ = pending.events.send(ResourceEvent::Failed(ExitError::unrecoverable(
                format!("job {} was deleted", job_id),
            )));
        }
        for granted in state
            .granted
            .values()
            .filter(|granted| &granted.request.job_id == job_id)
        {
            let _ = granted.events.send(ResourceEvent::Preempted);
        }
        let State {
            task_jobs,
            task_names,
            ..
        } = &mut *state;
        task_jobs.retain(|task_id, owner| {
            if *owner == *job_id {
                task_names.remove(task_id);
                return false;
            }
            true
        });
        Ok(())
    }
}
