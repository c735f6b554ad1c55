//! Session states shared with the hook layer and streamer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session. The numeric values are part of the wire
/// contract with the streamer; 3..=8 are unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SessionState {
    Initializing = 0,
    Handshaking = 1,
    Ready = 2,
    Disconnecting = 9,
}

impl SessionState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Initializing => "Initializing",
            SessionState::Handshaking => "Handshaking",
            SessionState::Ready => "Ready",
            SessionState::Disconnecting => "Disconnecting",
        }
    }
}

impl From<SessionState> for u8 {
    fn from(state: SessionState) -> u8 {
        state.as_u8()
    }
}

impl TryFrom<u8> for SessionState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SessionState::Initializing),
            1 => Ok(SessionState::Handshaking),
            2 => Ok(SessionState::Ready),
            9 => Ok(SessionState::Disconnecting),
            other => Err(format!("unknown session state {}", other)),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
