use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the active embed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Preparing,
    Authenticating,
    Validating,
    Configuring,
    Rendering,
    Ready,
    Error,
}

/// Progress reported when the SDK signals `loaded` but has not rendered yet.
pub const LOADED_PERCENT: u8 = 85;

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Authenticating => "authenticating",
            Phase::Validating => "validating",
            Phase::Configuring => "configuring",
            Phase::Rendering => "rendering",
            Phase::Ready => "ready",
            Phase::Error => "error",
        }
    }

    /// `preparing` through `rendering`: the container belongs to this cycle.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Phase::Preparing
                | Phase::Authenticating
                | Phase::Validating
                | Phase::Configuring
                | Phase::Rendering
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ready | Phase::Error)
    }

    /// `None` for `error`, which keeps whatever percent was last reported.
    pub fn percent(self) -> Option<u8> {
        match self {
            Phase::Idle => Some(0),
            Phase::Preparing => Some(10),
            Phase::Authenticating => Some(25),
            Phase::Validating => Some(40),
            Phase::Configuring => Some(55),
            Phase::Rendering => Some(70),
            Phase::Ready => Some(100),
            Phase::Error => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
