pub mod capture;
pub mod client;
pub mod config;
pub mod events;
pub mod health;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod playback;

pub use capture::{CaptureConstraints, Microphone, NoMicrophone, PcmFileMicrophone};
pub use client::{ConnectionState, SessionSnapshot, VoiceClient, VoiceClientBuilder};
pub use config::{ClientConfig, ConfigError};
pub use events::{EventSender, NoopEvents, VoiceEvent, VoiceEvents, event_channel};
pub use health::{HealthCheck, HttpHealthCheck};
pub use playback::{NullSpeaker, PcmFileSpeaker, Speaker};
pub use voicelink_core::{
    AudioChunk, Role, SampleEncoding, TranscriptEntry, VoiceError, VoiceState,
};

use std::sync::Arc;

/// The system microphone when built with `native-audio`, otherwise none.
pub fn default_microphone() -> Arc<dyn Microphone> {
    #[cfg(feature = "native-audio")]
    {
        Arc::new(native::CpalMicrophone::default())
    }
    #[cfg(not(feature = "native-audio"))]
    {
        Arc::new(NoMicrophone)
    }
}

/// The system speaker when built with `native-audio`, otherwise a sink that
/// discards audio.
pub fn default_speaker() -> Arc<dyn Speaker> {
    #[cfg(feature = "native-audio")]
    {
        Arc::new(native::CpalSpeaker::default())
    }
    #[cfg(not(feature = "native-audio"))]
    {
        Arc::new(NullSpeaker)
    }
}
