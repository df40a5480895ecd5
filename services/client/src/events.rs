//! The consumer-facing side of a voice session: a callback bundle and a typed
//! event channel built on top of it.

use tokio::sync::mpsc;
use voicelink_core::{AudioChunk, TranscriptEntry, VoiceError, VoiceState};

/// Callbacks invoked by a [`VoiceClient`](crate::VoiceClient).
///
/// All methods default to no-ops so consumers implement only what they show.
/// Callbacks run on the client's tasks and should return quickly.
pub trait VoiceEvents: Send + Sync {
    fn on_state_change(&self, _state: VoiceState) {}
    fn on_transcript(&self, _entry: &TranscriptEntry) {}
    fn on_audio_chunk(&self, _chunk: &AudioChunk) {}
    fn on_interrupt(&self) {}
    fn on_session_started(&self, _session_id: &str) {}
    fn on_error(&self, _error: &VoiceError) {}
    fn on_connection_open(&self) {}
    fn on_connection_close(&self, _code: u16, _reason: &str) {}
}

/// Ignores every event.
pub struct NoopEvents;

impl VoiceEvents for NoopEvents {}

/// One callback invocation, as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    StateChange(VoiceState),
    Transcript(TranscriptEntry),
    AudioChunk(AudioChunk),
    Interrupt,
    SessionStarted(String),
    Error(VoiceError),
    ConnectionOpen,
    ConnectionClose { code: u16, reason: String },
}

/// Forwards callbacks into an unbounded channel.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<VoiceEvent>,
}

/// Creates a callback bundle whose events can be consumed as a stream.
pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<VoiceEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    fn emit(&self, event: VoiceEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl VoiceEvents for EventSender {
    fn on_state_change(&self, state: VoiceState) {
        self.emit(VoiceEvent::StateChange(state));
    }

    fn on_transcript(&self, entry: &TranscriptEntry) {
        self.emit(VoiceEvent::Transcript(entry.clone()));
    }

    fn on_audio_chunk(&self, chunk: &AudioChunk) {
        self.emit(VoiceEvent::AudioChunk(chunk.clone()));
    }

    fn on_interrupt(&self) {
        self.emit(VoiceEvent::Interrupt);
    }

    fn on_session_started(&self, session_id: &str) {
        self.emit(VoiceEvent::SessionStarted(session_id.to_string()));
    }

    fn on_error(&self, error: &VoiceError) {
        self.emit(VoiceEvent::Error(error.clone()));
    }

    fn on_connection_open(&self) {
        self.emit(VoiceEvent::ConnectionOpen);
    }

    fn on_connection_close(&self, code: u16, reason: &str) {
        self.emit(VoiceEvent::ConnectionClose {
            code,
            reason: reason.to_string(),
        });
    }
}
