pub mod audio;
pub mod error;
pub mod protocol;
pub mod session;

pub use error::VoiceError;
pub use protocol::{ClientMessage, ServerMessage, TranscriptMessage};
pub use session::{SessionEvent, SessionMachine};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The conversational state of a voice session, as reported by the remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// No active turn.
    #[default]
    Waiting,
    /// The user's turn has begun and microphone audio is streaming.
    Listening,
    /// Speech-to-text is in progress; interim transcripts may arrive.
    Transcribing,
    /// The transcript is final and the agent is preparing a response.
    Thinking,
    /// Agent audio is streaming back.
    Speaking,
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceState::Waiting => write!(f, "waiting"),
            VoiceState::Listening => write!(f, "listening"),
            VoiceState::Transcribing => write!(f, "transcribing"),
            VoiceState::Thinking => write!(f, "thinking"),
            VoiceState::Speaking => write!(f, "speaking"),
        }
    }
}

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

/// One turn (or interim hypothesis of a turn) in the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub is_final: bool,
}

/// Sample width of an inbound audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Unsigned 8-bit PCM, delivered as raw binary WebSocket frames.
    U8,
    /// Signed 16-bit little-endian PCM, delivered base64-wrapped in JSON.
    Pcm16,
}

/// Agent audio received from the remote service, not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Only present on the JSON path; used for ordering diagnostics.
    pub sequence: Option<u64>,
    pub encoding: SampleEncoding,
    pub data: Vec<u8>,
}
