/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Trial states and the legal transitions between them.

use serde::Deserialize;
use serde::Serialize;

/// The lifecycle state of a trial.
///
/// `Stopping*` states are transient: the trial stays in them only while
/// an allocation is still live, and leaves them for the matching terminal
/// state once it has exited.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialState {
    /// Runnable; an allocation is requested whenever none is live.
    Active,
    /// Not runnable; a live allocation is asked to terminate.
    Paused,
    /// Stopping in order to become [`TrialState::Canceled`].
    StoppingCanceled,
    /// Stopping in order to become [`TrialState::Canceled`], forcibly.
    StoppingKilled,
    /// Stopping in order to become [`TrialState::Completed`].
    StoppingCompleted,
    /// Stopping in order to become [`TrialState::Errored`].
    StoppingError,
    /// Terminal: the trial finished its work.
    Completed,
    /// Terminal: the trial was canceled or killed.
    Canceled,
    /// Terminal: the trial failed.
    #[serde(rename = "ERROR")]
    #[strum(to_string = "ERROR")]
    Errored,
}

impl TrialState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Errored)
    }

    /// Whether this is one of the `Stopping*` states.
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            Self::StoppingCanceled
                | Self::StoppingKilled
                | Self::StoppingCompleted
                | Self::StoppingError
        )
    }

    /// The terminal state a `Stopping*` state resolves to.
    pub fn terminal_state(self) -> Option<TrialState> {
        match self {
            Self::StoppingCanceled | Self::StoppingKilled => Some(Self::Canceled),
            Self::StoppingCompleted => Some(Self::Completed),
            Self::StoppingError => Some(Self::Errored),
            _ => None,
        }
    }

    /// The states reachable from this one in a single transition.
    pub fn legal_transitions(self) -> &'static [TrialState] {
        use TrialState::*;
        match self {
            Active => &[
                Paused,
                StoppingCanceled,
                StoppingKilled,
                StoppingCompleted,
                StoppingError,
                Completed,
                Errored,
            ],
            Paused => &[
                Active,
                StoppingCanceled,
                StoppingKilled,
                StoppingCompleted,
                StoppingError,
                Completed,
                Errored,
            ],
            StoppingCompleted => &[
                Completed,
                StoppingCanceled,
                StoppingKilled,
                StoppingError,
                Errored,
            ],
            StoppingCanceled => &[Canceled, StoppingKilled, StoppingError, Errored],
            StoppingKilled => &[Canceled, StoppingError, Errored],
            StoppingError => &[Errored],
            Completed | Canceled | Errored => &[],
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: TrialState) -> bool {
        self.legal_transitions().contains(&next)
    }
}

/// Reasons a workload may give for exiting early.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExitedReason {
    /// The workload failed.
    Errored,
    /// The user canceled the workload from within it.
    UserCanceled,
    /// The workload found its hyperparameters to be invalid.
    InvalidHp,
    /// The workload found its hyperparameters to be invalid while
    /// initializing.
    InitInvalidHp,
}
