//! File lifecycle states and the transition table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Uploaded,
    Parsing,
    Parsed,
    Validating,
    Validated,
    AwaitingApproval,
    Approved,
    Loading,
    Loaded,
    Failed,
    Cancelled,
}

impl FileState {
    pub const ALL: [FileState; 11] = [
        FileState::Uploaded,
        FileState::Parsing,
        FileState::Parsed,
        FileState::Validating,
        FileState::Validated,
        FileState::AwaitingApproval,
        FileState::Approved,
        FileState::Loading,
        FileState::Loaded,
        FileState::Failed,
        FileState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Uploaded => "uploaded",
            FileState::Parsing => "parsing",
            FileState::Parsed => "parsed",
            FileState::Validating => "validating",
            FileState::Validated => "validated",
            FileState::AwaitingApproval => "awaiting_approval",
            FileState::Approved => "approved",
            FileState::Loading => "loading",
            FileState::Loaded => "loaded",
            FileState::Failed => "failed",
            FileState::Cancelled => "cancelled",
        }
    }

    pub fn allowed_transitions(&self) -> &'static [FileState] {
        use FileState::*;
        match self {
            Uploaded => &[Parsing, Cancelled],
            Parsing => &[Parsed, Failed],
            Parsed => &[Validating, Cancelled],
            Validating => &[Validated, Failed],
            Validated => &[AwaitingApproval, Loading, Cancelled],
            AwaitingApproval => &[Approved, Cancelled],
            Approved => &[Loading, Cancelled],
            Loading => &[Loaded, Failed],
            Loaded => &[],
            Failed => &[Parsing],
            Cancelled => &[Parsing],
        }
    }

    pub fn can_transition_to(&self, to: FileState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// States in which a worker holds the file's lease.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            FileState::Parsing | FileState::Validating | FileState::Loading
        )
    }

    /// States that end a run.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            FileState::Loaded | FileState::Failed | FileState::Cancelled
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Unknown file state: {}", s))
    }
}

/// One entry of a file's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: FileState,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(FileState::Uploaded.can_transition_to(FileState::Parsing));
        assert!(!FileState::Uploaded.can_transition_to(FileState::Loaded));
        assert!(FileState::Validated.can_transition_to(FileState::Loading));
        assert!(FileState::Failed.can_transition_to(FileState::Parsing));
        assert!(!FileState::Failed.can_transition_to(FileState::Cancelled));
        assert!(FileState::Cancelled.can_transition_to(FileState::Parsing));
    }

    #[test]
    fn test_loaded_has_no_outgoing_transitions() {
        assert!(FileState::Loaded.allowed_transitions().is_empty());
        for to in FileState::ALL {
            assert!(!FileState::Loaded.can_transition_to(to));
        }
    }

    #[test]
    fn test_every_target_is_a_known_state() {
        for from in FileState::ALL {
            for to in from.allowed_transitions() {
                assert_ne!(from, *to, "{} has a self-transition", from);
            }
        }
    }

    #[test]
    fn test_str_round_trip() {
        for state in FileState::ALL {
            assert_eq!(state.as_str().parse::<FileState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("done".parse::<FileState>().is_err());
    }
}
