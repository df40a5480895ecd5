/// Errors surfaced by a voice session.
///
/// Permission and exhausted-connection failures end the session. Protocol and
/// playback failures concern a single message or chunk and are contained.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoiceError {
    #[error("Microphone unavailable: {0}")]
    Permission(String),
    #[error("Could not reach the voice service after {attempts} attempt(s): {reason}")]
    Connection { attempts: u32, reason: String },
    #[error("Malformed message from the voice service: {0}")]
    Protocol(String),
    #[error("Audio playback failed: {0}")]
    Playback(String),
    #[error("A voice session is already active")]
    AlreadyActive,
    #[error("No voice session has been started")]
    NoSession,
}

impl VoiceError {
    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceError::Permission(_) | VoiceError::Connection { .. })
    }

    /// Text suitable for showing to the end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            VoiceError::Permission(_) => {
                "Microphone access is blocked or no microphone was found. Allow microphone access and check that an input device is connected, then try again."
            }
            VoiceError::Connection { .. } => {
                "The voice assistant is unavailable right now. Please try again in a moment."
            }
            VoiceError::Protocol(_) | VoiceError::Playback(_) => {
                "Part of the response could not be processed."
            }
            VoiceError::AlreadyActive => "A voice conversation is already in progress.",
            VoiceError::NoSession => "Start a voice conversation first.",
        }
    }
}
