/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Allocations: run attempts of a trial's task.
//!
//! A trial never drives an allocation directly. It asks an [`Allocator`]
//! for one, and receives back an [`AllocationRef`] through which it can
//! signal the allocation. Everything the allocation needs from its
//! trial, and the single exit report it owes it, travel through the
//! ports of an [`AllocationOwner`].

pub mod launcher;
pub mod registry;
pub mod supervisor;

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::logging::TaskLog;
use crate::mailbox::MailboxSenderError;
use crate::mailbox::PortHandle;
use crate::reference::AllocationId;
use crate::resource::AllocateRequest;
use crate::task_spec::BuildTaskSpec;

/// Signals a trial may send to its live allocation.
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
#[strum(serialize_all = "snake_case")]
pub enum AllocationSignal {
    /// Ask the workload to stop, allowing it to clean up.
    Terminate,
    /// Stop the workload immediately.
    Kill,
}

/// How an allocation failure should be treated by its trial. Decided
/// where the failure originates.
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
#[strum(serialize_all = "snake_case")]
pub enum ExitKind {
    /// A system failure that retrying cannot fix.
    Unrecoverable,
    /// A system failure that does not count against the restart budget.
    Transient,
    /// A failure of the workload itself.
    Ordinary,
}

/// The error an allocation exited with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct ExitError {
    pub kind: ExitKind,
    pub message: String,
}

impl ExitError {
    /// A failure that retrying cannot fix.
    pub fn unrecoverable(message: impl fmt::Display) -> Self {
        Self {
            kind: ExitKind::Unrecoverable,
            message: message.to_string(),
        }
    }

    /// A failure that does not count against the restart budget.
    pub fn transient(message: impl fmt::Display) -> Self {
        Self {
            kind: ExitKind::Transient,
            message: message.to_string(),
        }
    }

    /// A failure of the workload.
    pub fn ordinary(message: impl fmt::Display) -> Self {
        Self {
            kind: ExitKind::Ordinary,
            message: message.to_string(),
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.kind == ExitKind::Unrecoverable
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ExitKind::Transient
    }
}

/// The single exit report of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationExited {
    /// The run the allocation belonged to.
    pub run_id: u32,
    /// The failure, if the allocation did not exit cleanly.
    pub err: Option<ExitError>,
    /// Whether the workload stopped because its user asked it to.
    pub user_requested_stop: bool,
}

impl AllocationExited {
    /// A clean exit.
    pub fn clean(run_id: u32) -> Self {
        Self {
            run_id,
            err: None,
            user_requested_stop: false,
        }
    }

    /// An exit with an error.
    pub fn failed(run_id: u32, err: ExitError) -> Self {
        Self {
            run_id,
            err: Some(err),
            user_requested_stop: false,
        }
    }
}

/// Moves an allocation's task to another resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeResourcePool {
    pub resource_pool: String,
}

/// A reference to a live allocation.
#[derive(Debug, Clone)]
pub struct AllocationRef {
    allocation_id: AllocationId,
    signals: PortHandle<AllocationSignal>,
    pool_changes: PortHandle<ChangeResourcePool>,
}

impl AllocationRef {
    /// Create a reference from the allocation's ports.
    pub fn new(
        allocation_id: AllocationId,
        signals: PortHandle<AllocationSignal>,
        pool_changes: PortHandle<ChangeResourcePool>,
    ) -> Self {
        Self {
            allocation_id,
            signals,
            pool_changes,
        }
    }

    pub fn allocation_id(&self) -> &AllocationId {
        &self.allocation_id
    }

    /// Signal the allocation.
    pub fn signal(&self, signal: AllocationSignal) -> Result<(), MailboxSenderError> {
        self.signals.send(signal)
    }

    /// Tell the allocation its task moved to another pool.
    pub fn change_resource_pool(&self, resource_pool: &str) -> Result<(), MailboxSenderError> {
        self.pool_changes.send(ChangeResourcePool {
            resource_pool: resource_pool.to_string(),
        })
    }
}

/// The ports through which an allocation talks to its trial.
#[derive(Debug, Clone)]
pub struct AllocationOwner {
    /// Receives the allocation's exit report.
    pub exited: PortHandle<AllocationExited>,
    /// Builds the spec of the task to launch.
    pub build_task_spec: PortHandle<BuildTaskSpec>,
    /// Receives output of the task.
    pub logs: PortHandle<TaskLog>,
}

/// Errors starting an allocation.
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("failed to spawn allocation {0}: {1:#}")]
    Spawn(AllocationId, anyhow::Error),
}

/// Starts allocations.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Start an allocation for `request`, belonging to run `run_id`.
    /// The allocation reports its exit to `owner.exited` exactly once.
    async fn allocate(
        &self,
        request: AllocateRequest,
        run_id: u32,
        owner: AllocationOwner,
    ) -> Result<AllocationRef, AllocatorError>;
}
