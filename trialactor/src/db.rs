/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Persistence of trials, tasks, allocations and checkpoints.
//!
//! The [`Persistence`] trait is the contract the trial and allocation
//! actors consume. State-transition writes (trial state, run ID,
//! restarts) are awaited by the actors and abort the transition on
//! failure; allocation bookkeeping is best-effort.

pub mod memory;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::reference::AllocationId;
use crate::reference::ExperimentId;
use crate::reference::JobId;
use crate::reference::RequestId;
use crate::reference::TaskId;
use crate::reference::TrialId;
use crate::state::TrialState;

/// The current version of the task log format.
pub const CURRENT_TASK_LOG_VERSION: i32 = 1;

/// Errors returned by [`Persistence`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No trial with the given id exists.
    #[error("trial {0} not found")]
    TrialNotFound(TrialId),

    /// The requested state change is not in the transition table.
    #[error("illegal transition for trial {trial_id}: {from} -> {to}")]
    IllegalTransition {
        /// The trial being updated.
        trial_id: TrialId,
        /// Its persisted state.
        from: TrialState,
        /// The requested state.
        to: TrialState,
    },

    /// No allocation with the given id exists.
    #[error("allocation {0} not found")]
    AllocationNotFound(AllocationId),

    /// Any other backend failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A persisted trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: TrialId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub request_id: RequestId,
    pub experiment_id: ExperimentId,
    pub state: TrialState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub hparams: serde_json::Value,
    pub warm_start_checkpoint: Option<String>,
    pub seed: u64,
    pub run_id: u32,
    pub restarts: u32,
}

/// A trial that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTrial {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub request_id: RequestId,
    pub experiment_id: ExperimentId,
    pub state: TrialState,
    pub hparams: serde_json::Value,
    /// UUID of the checkpoint the trial warm-starts from.
    pub warm_start_checkpoint: Option<String>,
    pub seed: u64,
}

/// The kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Trial,
}

/// A persisted task: the unit the trial's allocations run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub job_id: Option<JobId>,
    pub log_version: i32,
}

/// A persisted allocation. An allocation is _open_ while it has a
/// start time but no end time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub resource_pool: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AllocationRecord {
    /// Whether the allocation was started and never finished.
    pub fn is_open(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none()
    }
}

/// A completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub uuid: String,
    pub trial_id: TrialId,
    pub steps_completed: u64,
    pub report_time: DateTime<Utc>,
}

/// The persistence operations used by trials and their allocations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Persist a new trial, returning its durable id.
    async fn add_trial(&self, trial: NewTrial) -> Result<TrialId, DbError>;

    /// Look up a trial.
    async fn trial_by_id(&self, id: TrialId) -> Result<TrialRecord, DbError>;

    /// Update a trial's state. Fails with [`DbError::IllegalTransition`]
    /// if the change is not a legal transition. Entering a terminal
    /// state sets the trial's (and its task's) end time.
    async fn update_trial(&self, id: TrialId, state: TrialState) -> Result<(), DbError>;

    /// The persisted `(run_id, restarts)` of a trial.
    async fn trial_run_id_and_restarts(&self, id: TrialId) -> Result<(u32, u32), DbError>;

    /// Record the run ID of a trial's current allocation.
    async fn update_trial_run_id(&self, id: TrialId, run_id: u32) -> Result<(), DbError>;

    /// Record a trial's failure count.
    async fn update_trial_restarts(&self, id: TrialId, restarts: u32) -> Result<(), DbError>;

    /// The latest completed checkpoint of a trial, if any.
    async fn latest_checkpoint_for_trial(&self, id: TrialId)
        -> Result<Option<Checkpoint>, DbError>;

    /// Persist a task unless it already exists.
    async fn add_task(&self, task: TaskRecord) -> Result<(), DbError>;

    /// Persist an allocation.
    async fn add_allocation(&self, allocation: AllocationRecord) -> Result<(), DbError>;

    /// Set an allocation's end time.
    async fn complete_allocation(
        &self,
        allocation_id: AllocationId,
        end_time: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// The open allocations of a task.
    async fn open_allocations(&self, task_id: TaskId) -> Result<Vec<AllocationRecord>, DbError>;
}
