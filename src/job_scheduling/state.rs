//! Job states and the legal transition table

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use super::counters::Stage;

/// Lifecycle state of a job
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum State {
    Pending,
    TQueued,
    PriorityTQueued,
    Running,
    RetryWait,
    AsyncWait,
    RQueued,
    Ready,
    Transferring,
    RunningWithoutThread,
    Restored,
    Done,
    Canceled,
    Failed,
}

impl State {
    /// DONE, CANCELED and FAILED have no way out
    pub fn is_final(self) -> bool {
        matches!(self, State::Done | State::Canceled | State::Failed)
    }

    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;

        if self.is_final() {
            return false;
        }
        if matches!(to, Canceled | Failed) {
            return true;
        }
        match self {
            Pending | Restored => to == TQueued,
            TQueued | PriorityTQueued => to == Running,
            Running => matches!(
                to,
                Done | RQueued | RetryWait | AsyncWait | RunningWithoutThread
            ),
            AsyncWait | RunningWithoutThread => matches!(to, PriorityTQueued | Done),
            RetryWait => to == PriorityTQueued,
            RQueued => matches!(to, Ready | Transferring),
            Ready => matches!(to, Transferring | Done),
            Transferring => to == Done,
            Done | Canceled | Failed => false,
        }
    }

    /// Counter stage a job in this state is accounted under
    pub fn stage(self) -> Option<Stage> {
        match self {
            State::TQueued => Some(Stage::ThreadQueued),
            State::PriorityTQueued => Some(Stage::PriorityQueued),
            State::Running => Some(Stage::Running),
            State::RunningWithoutThread => Some(Stage::RunningWithoutThread),
            State::RQueued => Some(Stage::ReadyQueued),
            State::Ready | State::Transferring => Some(Stage::Ready),
            State::AsyncWait => Some(Stage::AsyncWait),
            State::RetryWait => Some(Stage::RetryWait),
            State::Restored => Some(Stage::Restored),
            State::Pending | State::Done | State::Canceled | State::Failed => None,
        }
    }
}
