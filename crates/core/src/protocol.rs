//! Defines the WebSocket message protocol between the voice client and the remote agent.
//!
//! Control traffic is JSON discriminated by a `type` field. Microphone audio goes
//! out as bare binary frames; agent audio comes back either as bare binary frames
//! or wrapped in an `agent_audio_chunk` message.

use crate::{Role, VoiceError, VoiceState};
use serde::{Deserialize, Serialize};

/// Messages sent from the client to the remote agent.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens a conversation. Sent once per connected socket.
    StartSession {
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    /// Asks the agent to stop speaking (barge-in).
    Interrupt,
    /// Ends the conversation.
    EndSession,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The transcript payload carried by `transcript_update`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    pub role: Role,
    pub text: String,
    /// Milliseconds since the Unix epoch; filled in locally when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub is_final: bool,
}

/// Messages sent from the remote agent to the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the conversation has begun.
    SessionStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Authoritative conversational state.
    StateChange { state: VoiceState },
    /// An interim or final transcript for one side of the conversation.
    TranscriptUpdate { message: TranscriptMessage },
    /// Base64-encoded PCM16 agent audio.
    AgentAudioChunk { data: String, sequence: u64 },
    /// The agent acknowledged a barge-in and stopped speaking.
    Interrupt,
}

impl ServerMessage {
    /// Decodes one text frame. Unknown `type` values and missing fields fail closed.
    pub fn parse(text: &str) -> Result<Self, VoiceError> {
        serde_json::from_str(text).map_err(|e| VoiceError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_serialization() {
        let start = ClientMessage::StartSession {
            user_id: Some("u-42".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({"type": "start_session", "userId": "u-42"})
        );

        let anonymous = ClientMessage::StartSession { user_id: None };
        assert_eq!(
            anonymous.to_json().unwrap(),
            r#"{"type":"start_session"}"#
        );

        assert_eq!(
            ClientMessage::Interrupt.to_json().unwrap(),
            r#"{"type":"interrupt"}"#
        );
        assert_eq!(
            ClientMessage::EndSession.to_json().unwrap(),
            r#"{"type":"end_session"}"#
        );
    }

    #[test]
    fn test_parse_session_started() {
        let msg = ServerMessage::parse(r#"{"type":"session_started","sessionId":"abc123"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::SessionStarted {
                session_id: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_parse_state_change() {
        let msg = ServerMessage::parse(r#"{"type":"state_change","state":"thinking"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::StateChange {
                state: VoiceState::Thinking
            }
        );
    }

    #[test]
    fn test_parse_transcript_update() {
        let msg = ServerMessage::parse(
            r#"{"type":"transcript_update","message":{"role":"user","text":"hel","timestamp":1700000000000,"isFinal":false}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::TranscriptUpdate { message } => {
                assert_eq!(message.role, Role::User);
                assert_eq!(message.text, "hel");
                assert_eq!(message.timestamp, Some(1_700_000_000_000));
                assert!(!message.is_final);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_audio_chunk_and_interrupt() {
        let msg =
            ServerMessage::parse(r#"{"type":"agent_audio_chunk","data":"AAA=","sequence":7}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::AgentAudioChunk {
                data: "AAA=".to_string(),
                sequence: 7
            }
        );

        // Extra fields on an otherwise empty message are tolerated.
        let msg = ServerMessage::parse(r#"{"type":"interrupt","reason":"barge-in"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Interrupt);
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        for bad in [
            r#"{"type":"telemetry","cpu":3}"#,
            r#"{"state":"thinking"}"#,
            r#"{"type":"state_change","state":"dancing"}"#,
            r#"{"type":"session_started"}"#,
            "not json at all",
        ] {
            match ServerMessage::parse(bad) {
                Err(VoiceError::Protocol(_)) => {}
                other => panic!("Expected protocol error for {bad}, got {:?}", other),
            }
        }
    }
}
