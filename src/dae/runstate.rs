//! Run-state enumeration of the DAE.
//!
//! The state is observed through a channel; the stable states are SETUP,
//! RUNNING, PAUSED and WAITING/VETOING, everything else is a transient the
//! transition verbs wait out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Setup,
    Running,
    Paused,
    Waiting,
    Vetoing,
    Pausing,
    Ending,
    Aborting,
    Updating,
    Storing,
    Saving,
    Resuming,
    Beginning,
}

impl RunState {
    pub const ALL: [RunState; 13] = [
        RunState::Setup,
        RunState::Running,
        RunState::Paused,
        RunState::Waiting,
        RunState::Vetoing,
        RunState::Pausing,
        RunState::Ending,
        RunState::Aborting,
        RunState::Updating,
        RunState::Storing,
        RunState::Saving,
        RunState::Resuming,
        RunState::Beginning,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RunState::Setup => "SETUP",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Waiting => "WAITING",
            RunState::Vetoing => "VETOING",
            RunState::Pausing => "PAUSING",
            RunState::Ending => "ENDING",
            RunState::Aborting => "ABORTING",
            RunState::Updating => "UPDATING",
            RunState::Storing => "STORING",
            RunState::Saving => "SAVING",
            RunState::Resuming => "RESUMING",
            RunState::Beginning => "BEGINNING",
        }
    }

    /// True for the short-lived states between stable ones.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            RunState::Pausing
                | RunState::Ending
                | RunState::Aborting
                | RunState::Updating
                | RunState::Storing
                | RunState::Saving
                | RunState::Resuming
                | RunState::Beginning
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        RunState::ALL
            .into_iter()
            .find(|state| state.label().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("unknown run state '{s}'"))
    }
}
