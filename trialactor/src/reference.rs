/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Identifiers for the entities that make up a trial's lifecycle.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

macro_rules! string_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// The id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! numeric_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifies the task a trial runs as. A trial keeps the same task
    /// across all of its allocations.
    TaskId
);

string_id!(
    /// Identifies the job (experiment-level scheduling unit) that owns a
    /// trial's task.
    JobId
);

string_id!(
    /// The searcher's identifier for a trial; known before the trial is
    /// persisted.
    RequestId
);

string_id!(
    /// Identifies one run attempt of a task.
    AllocationId
);

numeric_id!(
    /// The persisted trial id.
    TrialId
);

numeric_id!(
    /// The id of the experiment a trial belongs to.
    ExperimentId
);

impl AllocationId {
    /// The allocation id of the `run_id`th attempt of `task_id`.
    pub fn new(task_id: &TaskId, run_id: u32) -> Self {
        Self(format!("{}.{}", task_id, run_id))
    }
}
