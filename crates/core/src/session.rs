//! The conversational state machine of a voice session.
//!
//! `SessionMachine` is a pure reducer: it folds inbound [`ServerMessage`]s into
//! the current [`VoiceState`], session id and transcript, and reports what
//! changed as a list of [`SessionEvent`]s for the transport to fan out.

use crate::{
    AudioChunk, Role, SampleEncoding, TranscriptEntry, VoiceError, VoiceState, audio,
    protocol::{ServerMessage, TranscriptMessage},
};
use tracing::{debug, warn};

/// A change produced by applying one server message.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionStarted(String),
    StateChanged(VoiceState),
    /// The entry as it now stands in the transcript.
    Transcript(TranscriptEntry),
    AudioChunk(AudioChunk),
    Interrupted,
}

/// Holds the conversation as seen by the client.
#[derive(Debug, Default)]
pub struct SessionMachine {
    session_id: Option<String>,
    state: VoiceState,
    transcript: Vec<TranscriptEntry>,
    /// Set once an authoritative `state_change` has arrived for this session.
    state_confirmed: bool,
    last_sequence: Option<u64>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    /// Applies one inbound control message.
    ///
    /// Fails only when a well-formed message carries an undecodable payload;
    /// in that case nothing is changed.
    pub fn apply(&mut self, msg: ServerMessage) -> Result<Vec<SessionEvent>, VoiceError> {
        let mut events = Vec::new();
        match msg {
            ServerMessage::SessionStarted { session_id } => {
                debug!(%session_id, "Session started");
                self.session_id = Some(session_id.clone());
                events.push(SessionEvent::SessionStarted(session_id));
                // Optimistic default until the server says otherwise.
                if !self.state_confirmed {
                    self.set_state(VoiceState::Listening, &mut events);
                }
            }
            ServerMessage::StateChange { state } => {
                self.state_confirmed = true;
                self.set_state(state, &mut events);
            }
            ServerMessage::TranscriptUpdate { message } => {
                events.push(SessionEvent::Transcript(self.record_transcript(message)));
            }
            ServerMessage::AgentAudioChunk { data, sequence } => {
                let bytes = audio::decode_base64(&data)?;
                if let Some(last) = self.last_sequence {
                    if sequence <= last {
                        warn!(sequence, last, "Agent audio chunk arrived out of sequence");
                    }
                }
                self.last_sequence = Some(sequence);
                events.push(SessionEvent::AudioChunk(AudioChunk {
                    sequence: Some(sequence),
                    encoding: SampleEncoding::Pcm16,
                    data: bytes,
                }));
            }
            ServerMessage::Interrupt => {
                events.push(SessionEvent::Interrupted);
                self.set_state(VoiceState::Listening, &mut events);
            }
        }
        Ok(events)
    }

    /// Prepares for a fresh socket within the same conversation. The transcript
    /// is kept; the session id is reassigned by the next `session_started`.
    pub fn begin_connection(&mut self) {
        self.session_id = None;
        self.state_confirmed = false;
        self.last_sequence = None;
    }

    /// Clears everything after the conversation ends. Returns the state change
    /// to report, if any.
    pub fn reset(&mut self) -> Option<SessionEvent> {
        let previous = self.state;
        *self = Self::default();
        (previous != VoiceState::Waiting).then_some(SessionEvent::StateChanged(VoiceState::Waiting))
    }

    fn set_state(&mut self, state: VoiceState, events: &mut Vec<SessionEvent>) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Voice state changed");
            self.state = state;
            events.push(SessionEvent::StateChanged(state));
        }
    }

    /// An interim hypothesis for a role is replaced by whatever comes next for
    /// that role; a settled entry is never overwritten.
    fn record_transcript(&mut self, message: TranscriptMessage) -> TranscriptEntry {
        let entry = TranscriptEntry {
            role: message.role,
            text: message.text,
            timestamp: message
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            is_final: message.is_final,
        };

        match self.last_index_for(entry.role) {
            Some(idx) if !self.transcript[idx].is_final => {
                self.transcript[idx] = entry.clone();
            }
            _ => self.transcript.push(entry.clone()),
        }
        entry
    }

    fn last_index_for(&self, role: Role) -> Option<usize> {
        self.transcript.iter().rposition(|e| e.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(role: Role, text: &str, is_final: bool) -> ServerMessage {
        ServerMessage::TranscriptUpdate {
            message: TranscriptMessage {
                role,
                text: text.to_string(),
                timestamp: Some(1_000),
                is_final,
            },
        }
    }

    fn state(state: VoiceState) -> ServerMessage {
        ServerMessage::StateChange { state }
    }

    #[test]
    fn test_session_started_defaults_to_listening() {
        let mut machine = SessionMachine::new();
        let events = machine
            .apply(ServerMessage::SessionStarted {
                session_id: "abc123".into(),
            })
            .unwrap();

        assert_eq!(
            events,
            vec![
                SessionEvent::SessionStarted("abc123".into()),
                SessionEvent::StateChanged(VoiceState::Listening),
            ]
        );
        assert_eq!(machine.session_id(), Some("abc123"));
        assert_eq!(machine.state(), VoiceState::Listening);
    }

    #[test]
    fn test_authoritative_state_wins_over_optimistic_default() {
        let mut machine = SessionMachine::new();
        machine.apply(state(VoiceState::Thinking)).unwrap();
        let events = machine
            .apply(ServerMessage::SessionStarted {
                session_id: "s-1".into(),
            })
            .unwrap();

        assert_eq!(events, vec![SessionEvent::SessionStarted("s-1".into())]);
        assert_eq!(machine.state(), VoiceState::Thinking);
    }

    #[test]
    fn test_state_tracks_most_recent_message() {
        let mut machine = SessionMachine::new();
        let sequence = [
            VoiceState::Listening,
            VoiceState::Transcribing,
            VoiceState::Transcribing,
            VoiceState::Thinking,
            VoiceState::Speaking,
            VoiceState::Waiting,
            VoiceState::Speaking,
        ];
        for s in sequence {
            machine.apply(state(s)).unwrap();
            assert_eq!(machine.state(), s);
        }
    }

    #[test]
    fn test_repeated_state_is_not_reported_twice() {
        let mut machine = SessionMachine::new();
        assert_eq!(machine.apply(state(VoiceState::Speaking)).unwrap().len(), 1);
        assert!(machine.apply(state(VoiceState::Speaking)).unwrap().is_empty());
    }

    #[test]
    fn test_interim_transcript_is_replaced_by_final() {
        let mut machine = SessionMachine::new();
        machine.apply(transcript(Role::User, "hel", false)).unwrap();
        let events = machine.apply(transcript(Role::User, "hello", true)).unwrap();

        assert_eq!(machine.transcript().len(), 1);
        let entry = &machine.transcript()[0];
        assert_eq!(entry.text, "hello");
        assert!(entry.is_final);
        assert_eq!(events, vec![SessionEvent::Transcript(entry.clone())]);
    }

    #[test]
    fn test_final_entries_are_appended() {
        let mut machine = SessionMachine::new();
        machine.apply(transcript(Role::User, "hello", true)).unwrap();
        machine.apply(transcript(Role::Agent, "Hi! How can", false)).unwrap();
        machine.apply(transcript(Role::Agent, "Hi! How can I help?", true)).unwrap();
        machine.apply(transcript(Role::User, "book a demo", false)).unwrap();

        let texts: Vec<_> = machine.transcript().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "Hi! How can I help?", "book a demo"]);
    }

    #[test]
    fn test_interim_replacement_is_per_role() {
        let mut machine = SessionMachine::new();
        machine.apply(transcript(Role::User, "wait", false)).unwrap();
        machine.apply(transcript(Role::Agent, "Sure", true)).unwrap();
        machine.apply(transcript(Role::User, "wait a second", true)).unwrap();

        let texts: Vec<_> = machine.transcript().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["wait a second", "Sure"]);
    }

    #[test]
    fn test_missing_timestamp_uses_local_clock() {
        let mut machine = SessionMachine::new();
        machine
            .apply(ServerMessage::TranscriptUpdate {
                message: TranscriptMessage {
                    role: Role::Agent,
                    text: "hi".into(),
                    timestamp: None,
                    is_final: true,
                },
            })
            .unwrap();
        assert!(machine.transcript()[0].timestamp > 0);
    }

    #[test]
    fn test_audio_chunk_decoding() {
        let mut machine = SessionMachine::new();
        let events = machine
            .apply(ServerMessage::AgentAudioChunk {
                data: audio::encode_base64(&[1, 2, 3, 4]),
                sequence: 1,
            })
            .unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::AudioChunk(AudioChunk {
                sequence: Some(1),
                encoding: SampleEncoding::Pcm16,
                data: vec![1, 2, 3, 4],
            })]
        );

        // Out-of-order chunks are still delivered, never reordered.
        let events = machine
            .apply(ServerMessage::AgentAudioChunk {
                data: audio::encode_base64(&[5, 6]),
                sequence: 0,
            })
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_bad_audio_payload_leaves_state_untouched() {
        let mut machine = SessionMachine::new();
        machine.apply(state(VoiceState::Speaking)).unwrap();
        let result = machine.apply(ServerMessage::AgentAudioChunk {
            data: "%%%".into(),
            sequence: 3,
        });
        assert!(matches!(result, Err(VoiceError::Protocol(_))));
        assert_eq!(machine.state(), VoiceState::Speaking);
    }

    #[test]
    fn test_interrupt_returns_to_listening() {
        let mut machine = SessionMachine::new();
        machine.apply(state(VoiceState::Speaking)).unwrap();
        let events = machine.apply(ServerMessage::Interrupt).unwrap();
        assert_eq!(
            events,
            vec![
                SessionEvent::Interrupted,
                SessionEvent::StateChanged(VoiceState::Listening)
            ]
        );
    }

    #[test]
    fn test_begin_connection_keeps_transcript() {
        let mut machine = SessionMachine::new();
        machine
            .apply(ServerMessage::SessionStarted {
                session_id: "first".into(),
            })
            .unwrap();
        machine.apply(transcript(Role::User, "hello", true)).unwrap();
        machine.apply(state(VoiceState::Thinking)).unwrap();

        machine.begin_connection();
        assert_eq!(machine.session_id(), None);
        assert_eq!(machine.transcript().len(), 1);

        // A new session_started may apply the optimistic default again.
        let events = machine
            .apply(ServerMessage::SessionStarted {
                session_id: "second".into(),
            })
            .unwrap();
        assert!(events.contains(&SessionEvent::StateChanged(VoiceState::Listening)));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut machine = SessionMachine::new();
        machine
            .apply(ServerMessage::SessionStarted {
                session_id: "abc".into(),
            })
            .unwrap();
        machine.apply(transcript(Role::User, "hello", true)).unwrap();

        assert_eq!(
            machine.reset(),
            Some(SessionEvent::StateChanged(VoiceState::Waiting))
        );
        assert_eq!(machine.session_id(), None);
        assert!(machine.transcript().is_empty());
        assert_eq!(machine.reset(), None);
    }
}
