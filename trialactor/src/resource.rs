/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The resource manager contract.
//!
//! Allocation supervisors request resources with [`ResourceManager::allocate`]
//! and learn the outcome asynchronously: the manager delivers
//! [`ResourceEvent`]s to the port supplied with the request, so a
//! supervisor never blocks its own mailbox while waiting for a grant.

pub mod local;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

use crate::allocation::ExitError;
use crate::mailbox::PortHandle;
use crate::reference::AllocationId;
use crate::reference::JobId;
use crate::reference::TaskId;

/// Placement constraints of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FittingRequirements {
    /// Whether all slots must come from a single agent.
    pub single_agent: bool,
}

/// A request for the resources of one allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub job_submission_time: DateTime<Utc>,
    pub is_user_visible: bool,
    /// Display name of the task.
    pub name: String,
    pub slots_needed: usize,
    /// Scheduling label constraining which agents may be used.
    pub label: String,
    pub resource_pool: String,
    pub fitting_requirements: FittingRequirements,
    /// Whether the manager may take the resources back.
    pub preemptible: bool,
    /// Whether this request reattaches to an allocation that survived a
    /// restart, rather than starting a fresh one.
    pub restore: bool,
}

/// Resources on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    pub agent_id: String,
    pub slots: usize,
}

/// The resources granted to an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub allocation_id: AllocationId,
    pub resource_pool: String,
    pub resources: Vec<ContainerResources>,
}

impl ResourceGrant {
    /// The total number of granted slots.
    pub fn slots(&self) -> usize {
        self.resources.iter().map(|r| r.slots).sum()
    }
}

/// Events delivered by the resource manager about a request.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum ResourceEvent {
    /// The request was satisfied.
    Granted(ResourceGrant),
    /// The manager wants the resources back; the allocation should stop
    /// gracefully and release them.
    Preempted,
    /// The request can no longer be satisfied.
    Failed(ExitError),
}

/// Errors returned by [`ResourceManager`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum ResourceManagerError {
    #[error("unknown resource pool: {0}")]
    UnknownResourcePool(String),

    #[error("pool {pool} can never fit {needed} slots (capacity {capacity})")]
    NotEnoughResources {
        pool: String,
        needed: usize,
        capacity: usize,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The resource manager, as seen by trials and their allocations.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Request resources. The outcome is delivered to `events`.
    async fn allocate(
        &self,
        request: AllocateRequest,
        events: PortHandle<ResourceEvent>,
    ) -> Result<(), ResourceManagerError>;

    /// Release the resources of an allocation, or withdraw its pending
    /// request. Releasing an unknown allocation is not an error.
    async fn release(&self, allocation_id: &AllocationId) -> Result<(), ResourceManagerError>;

    /// Move a task's pending requests to another pool.
    async fn change_resource_pool(
        &self,
        task_id: &TaskId,
        resource_pool: &str,
    ) -> Result<(), ResourceManagerError>;

    /// Set the display name of a task.
    async fn set_task_name(&self, task_id: &TaskId, name: &str)
        -> Result<(), ResourceManagerError>;

    /// Remove a job: its pending requests fail and its granted
    /// allocations are preempted.
    async fn delete_job(&self, job_id: &JobId) -> Result<(), ResourceManagerError>;
}
