/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An in-memory [`Persistence`] implementation, used by tests and by
//! single-process deployments that do not need durability.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use super::AllocationRecord;
use super::Checkpoint;
use super::DbError;
use super::NewTrial;
use super::Persistence;
use super::TaskRecord;
use super::TrialRecord;
use crate::reference::AllocationId;
use crate::reference::TaskId;
use crate::reference::TrialId;
use crate::state::TrialState;

#[derive(Debug, Default)]
struct Tables {
    next_trial_id: i64,
    trials: BTreeMap<TrialId, TrialRecord>,
    tasks: HashMap<TaskId, TaskRecord>,
    allocations: BTreeMap<AllocationId, AllocationRecord>,
    checkpoints: Vec<Checkpoint>,
}

/// An in-memory database.
#[derive(Debug, Default)]
pub struct MemoryDb {
    tables: Mutex<Tables>,
}

impl MemoryDb {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().expect("memory db poisoned");
        f(&mut tables)
    }

    /// Record a completed checkpoint.
    pub fn add_checkpoint(&self, checkpoint: Checkpoint) {
        self.with_tables(|tables| tables.checkpoints.push(checkpoint));
    }

    /// A snapshot of a trial record.
    pub fn trial(&self, id: TrialId) -> Option<TrialRecord> {
        self.with_tables(|tables| tables.trials.get(&id).cloned())
    }

    /// A snapshot of a task record.
    pub fn task(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.with_tables(|tables| tables.tasks.get(task_id).cloned())
    }

    /// Snapshots of all allocation records of a task, ordered by id.
    pub fn allocations(&self, task_id: &TaskId) -> Vec<AllocationRecord> {
        self.with_tables(|tables| {
            tables
                .allocations
                .values()
                .filter(|allocation| &allocation.task_id == task_id)
                .cloned()
                .collect()
        })
    }
}

#[async_trait]
impl Persistence for MemoryDb {
    async fn add_trial(&self, trial: NewTrial) -> Result<TrialId, DbError> {
        Ok(self.with_tables(|tables| {
            tables.next_trial_id += 1;
            let id = TrialId(tables.next_trial_id);
            tables.trials.insert(
                id,
                TrialRecord {
                    id,
                    task_id: trial.task_id,
                    job_id: trial.job_id,
                    request_id: trial.request_id,
                    experiment_id: trial.experiment_id,
                    state: trial.state,
                    start_time: Utc::now(),
                    end_time: None,
                    hparams: trial.hparams,
                    warm_start_checkpoint: trial.warm_start_checkpoint,
                    seed: trial.seed,
                    run_id: 0,
                    restarts: 0,
                },
            );
            id
        }))
    }

    async fn trial_by_id(&self, id: TrialId) -> Result<TrialRecord, DbError> {
        self.trial(id).ok_or(DbError::TrialNotFound(id))
    }

    async fn update_trial(&self, id: TrialId, state: TrialState) -> Result<(), DbError> {
        self.with_tables(|tables| {
            let trial = tables
                .trials
                .get_mut(&id)
                .ok_or(DbError::TrialNotFound(id))?;
            if !trial.state.can_transition_to(state) {
                return Err(DbError::IllegalTransition {
                    trial_id: id,
                    from: trial.state,
                    to: state,
                });
            }
            trial.state = state;
            if state.is_terminal() {
                let now = Utc::now();
                trial.end_time = Some(now);
                if let Some(task) = tables.tasks.get_mut(&trial.task_id) {
                    task.end_time = Some(now);
                }
            }
            Ok(())
        })
    }

    async fn trial_run_id_and_restarts(&self, id: TrialId) -> Result<(u32, u32), DbError> {
        let trial = self.trial_by_id(id).await?;
        Ok((trial.run_id, trial.restarts))
    }

    async fn update_trial_run_id(&self, id: TrialId, run_id: u32) -> Result<(), DbError> {
        self.with_tables(|tables| {
            let trial = tables
                .trials
                .get_mut(&id)
                .ok_or(DbError::TrialNotFound(id))?;
            trial.run_id = run_id;
            Ok(())
        })
    }

    async fn update_trial_restarts(&self, id: TrialId, restarts: u32) -> Result<(), DbError> {
        self.with_tables(|tables| {
            let trial = tables
                .trials
                .get_mut(&id)
                .ok_or(DbError::TrialNotFound(id))?;
            trial.restarts = restarts;
            Ok(())
        })
    }

    async fn latest_checkpoint_for_trial(
        &self,
        id: TrialId,
    ) -> Result<Option<Checkpoint>, DbError> {
        Ok(self.with_tables(|tables| {
            tables
                .checkpoints
                .iter()
                .filter(|checkpoint| checkpoint.trial_id == id)
                .max_by_key(|checkpoint| (checkpoint.report_time, checkpoint.steps_completed))
                .cloned()
        }))
    }

    async fn add_task(&self, task: TaskRecord) -> Result<(), DbError> {
        self.with_tables(|tables| {
            tables.tasks.entry(task.task_id.clone()).or_insert(task);
        });
        Ok(())
    }

    async fn add_allocation(&self, allocation: AllocationRecord) -> Result<(), DbError> {
        self.with_tables(|tables| {
            tables
                .allocations
                .insert(allocation.allocation_id.clone(), allocation);
        });
        Ok(())
    }

    async fn complete_allocation(
        &self,
        allocation_id: AllocationId,
        end_time: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.with_tables(|tables| {
            let allocation = tables
                .allocations
                .get_mut(&allocation_id)
                .ok_or_else(|| DbError::AllocationNotFound(allocation_id.clone()))?;
            allocation.end_time = Some(end_time);
            Ok(())
        })
    }

    async fn open_allocations(&self, task_id: TaskId) -> Result<Vec<AllocationRecord>, DbError> {
        Ok(self
            .allocations(&task_id)
            .into_iter()
            .filter(AllocationRecord::is_open)
            .collect())
    }
}
