//! The voice session client: owns the WebSocket to the remote agent, the
//! microphone and the speaker, and keeps the conversation state in sync.
//!
//! One [`VoiceClient`] runs at most one session at a time. Inbound messages are
//! handled by a reader task per socket, in arrival order; microphone frames are
//! forwarded by the capture pipeline's own task. Start, reconnect and end are
//! serialised against each other.

use crate::{
    capture::{CaptureConstraints, CapturePipeline, Microphone},
    config::ClientConfig,
    events::{NoopEvents, VoiceEvents},
    health::{HealthCheck, HttpHealthCheck},
    playback::{PlaybackPipeline, Speaker},
};
use futures_util::{
    SinkExt, StreamExt,
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
};
use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpStream, sync::watch, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tracing::{debug, error, info, instrument, warn};
use voicelink_core::{
    AudioChunk, ClientMessage, SampleEncoding, ServerMessage, SessionEvent, SessionMachine,
    TranscriptEntry, VoiceError, VoiceState,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close codes after which the client reconnects on its own.
pub fn is_abnormal_close(code: u16) -> bool {
    matches!(code, CLOSE_NO_STATUS | CLOSE_ABNORMAL | CLOSE_INTERNAL_ERROR)
}

/// Lifecycle of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    /// An attempt failed and another one is scheduled.
    Retrying { attempt: u32, max: u32 },
    Open,
    Reconnecting,
    /// Every attempt failed; the session is over.
    Failed,
}

/// Everything a UI needs to render the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub state: VoiceState,
    pub session_id: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Link {
    sink: SplitSink<WsStream, Message>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
}

/// Writes one message, giving up after `limit`.
async fn write_bounded(
    sink: &mut SplitSink<WsStream, Message>,
    msg: Message,
    limit: Duration,
) -> Result<(), String> {
    match tokio::time::timeout(limit, sink.send(msg)).await {
        Ok(sent) => sent.map_err(|e| e.to_string()),
        Err(_) => Err(format!("write timed out after {}ms", limit.as_millis())),
    }
}

/// Why a socket is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closing {
    /// The conversation is over: say goodbye and wait for the handshake.
    End,
    /// A new socket takes over the same conversation.
    Replace,
}

#[derive(Default)]
struct Media {
    capture: Option<CapturePipeline>,
    playback: Option<Arc<PlaybackPipeline>>,
}

struct Shared {
    config: ClientConfig,
    events: Arc<dyn VoiceEvents>,
    microphone: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    health: Option<Arc<dyn HealthCheck>>,
    constraints: CaptureConstraints,
    lifecycle: tokio::sync::Mutex<()>,
    link: tokio::sync::Mutex<Option<Link>>,
    /// Bumped for every new socket and on explicit end, so stale readers can
    /// tell their connection is no longer the current one.
    generation: AtomicU64,
    /// A conversation exists and has not been explicitly ended.
    active: AtomicBool,
    media: Mutex<Media>,
    session: Mutex<SessionMachine>,
    snapshot: watch::Sender<SessionSnapshot>,
}

/// Builds a [`VoiceClient`].
pub struct VoiceClientBuilder {
    config: ClientConfig,
    events: Arc<dyn VoiceEvents>,
    microphone: Option<Arc<dyn Microphone>>,
    speaker: Option<Arc<dyn Speaker>>,
    health: Option<Option<Arc<dyn HealthCheck>>>,
    constraints: CaptureConstraints,
}

impl VoiceClientBuilder {
    pub fn events(mut self, events: Arc<dyn VoiceEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn microphone(mut self, microphone: Arc<dyn Microphone>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    pub fn speaker(mut self, speaker: Arc<dyn Speaker>) -> Self {
        self.speaker = Some(speaker);
        self
    }

    /// Replaces the HTTP health check derived from the configuration. `None` disables it.
    pub fn health_check(mut self, health: Option<Arc<dyn HealthCheck>>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn build(self) -> VoiceClient {
        let health = self.health.unwrap_or_else(|| {
            self.config.health_url.clone().map(|url| {
                Arc::new(HttpHealthCheck::new(url, self.config.connect_timeout)) as Arc<dyn HealthCheck>
            })
        });
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        VoiceClient {
            shared: Arc::new(Shared {
                microphone: self.microphone.unwrap_or_else(crate::default_microphone),
                speaker: self.speaker.unwrap_or_else(crate::default_speaker),
                config: self.config,
                events: self.events,
                health,
                constraints: self.constraints,
                lifecycle: tokio::sync::Mutex::new(()),
                link: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                active: AtomicBool::new(false),
                media: Mutex::new(Media::default()),
                session: Mutex::new(SessionMachine::new()),
                snapshot,
            }),
        }
    }
}

/// A handle to one voice conversation. Cloning shares the same session.
#[derive(Clone)]
pub struct VoiceClient {
    shared: Arc<Shared>,
}

impl VoiceClient {
    pub fn builder(config: ClientConfig) -> VoiceClientBuilder {
        VoiceClientBuilder {
            config,
            events: Arc::new(NoopEvents),
            microphone: None,
            speaker: None,
            health: None,
            constraints: CaptureConstraints::default(),
        }
    }

    /// A client for `ws_url` with default settings and devices.
    pub fn new(ws_url: &str, events: Arc<dyn VoiceEvents>) -> Result<Self, crate::ConfigError> {
        Ok(Self::builder(ClientConfig::new(ws_url)?).events(events).build())
    }

    /// Starts a conversation.
    ///
    /// Resolves once the socket is open, `start_session` has been sent and
    /// microphone frames are flowing. The microphone is acquired before any
    /// connection attempt, so a permission failure never touches the network.
    #[instrument(name = "start_session", skip(self), fields(url = %self.shared.config.ws_url))]
    pub async fn start_session(&self) -> Result<(), VoiceError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;

        match self.connection_state() {
            ConnectionState::Idle | ConnectionState::Failed => {}
            other => {
                warn!(connection = ?other, "Ignoring start_session: a session is already active");
                return Err(VoiceError::AlreadyActive);
            }
        }

        shared.set_connection(ConnectionState::Connecting);
        shared.check_health().await;

        let acquired =
            CapturePipeline::acquire(shared.microphone.as_ref(), &shared.constraints).await;
        let mut capture = match acquired {
            Ok(capture) => capture,
            Err(e) => {
                error!(error = %e, "Microphone acquisition failed");
                shared.set_connection(ConnectionState::Idle);
                shared.events.on_error(&e);
                return Err(e);
            }
        };
        let playback = shared.open_playback().await;
        lock(&shared.media).playback = Some(playback);
        let reset = lock(&shared.session).reset();
        if let Some(event) = reset {
            shared.emit(event);
        }
        shared.publish_session();

        if let Err(e) = Shared::open_link(shared).await {
            capture.release();
            shared.teardown_media();
            shared.set_connection(ConnectionState::Failed);
            error!(error = %e, "Could not start voice session");
            shared.events.on_error(&e);
            return Err(e);
        }

        capture.start(Shared::frame_sink(shared));
        lock(&shared.media).capture = Some(capture);
        shared.active.store(true, Ordering::SeqCst);
        info!("Voice session started");
        Ok(())
    }

    /// Opens a fresh socket for the current conversation, reusing the
    /// microphone and speaker when they are still live.
    #[instrument(name = "reconnect_session", skip(self))]
    pub async fn reconnect_session(&self) -> Result<(), VoiceError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        Shared::reconnect_locked(&self.shared).await
    }

    /// Ends the conversation and releases every resource. Idempotent.
    ///
    /// Sends `end_session` if the socket is still open, closes it (waiting a
    /// bounded time for the close handshake), then stops the microphone and
    /// releases the speaker. Every step runs regardless of earlier failures.
    #[instrument(name = "end_session", skip(self))]
    pub async fn end_session(&self) {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        shared.generation.fetch_add(1, Ordering::SeqCst);

        let link = shared.link.lock().await.take();
        if let Some(link) = link {
            shared.close_link(link, Closing::End).await;
            shared.events.on_connection_close(CLOSE_NORMAL, "session ended");
        }

        shared.teardown_media();
        let was_active = shared.active.swap(false, Ordering::SeqCst);
        let reset = lock(&shared.session).reset();
        if let Some(event) = reset {
            shared.emit(event);
        }
        shared.publish_session();
        shared.set_connection(ConnectionState::Idle);
        if was_active {
            info!("Voice session ended");
        }
    }

    /// Asks the agent to stop speaking. Advisory: audio already in flight may
    /// still arrive. Returns whether the request was sent.
    pub async fn interrupt(&self) -> bool {
        self.shared.send_control(ClientMessage::Interrupt).await
    }

    /// Sends one binary audio frame if the socket is open; otherwise drops it.
    pub async fn send(&self, frame: Vec<u8>) -> bool {
        self.shared.send_frame(frame).await
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn state(&self) -> VoiceState {
        self.shared.snapshot.borrow().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.snapshot.borrow().session_id.clone()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.snapshot.borrow().transcript.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.snapshot.borrow().connection
    }
}

impl Shared {
    fn set_connection(&self, connection: ConnectionState) {
        self.snapshot.send_modify(|s| s.connection = connection);
    }

    fn connection(&self) -> ConnectionState {
        self.snapshot.borrow().connection
    }

    fn publish_session(&self) {
        let session = lock(&self.session);
        self.snapshot.send_modify(|s| {
            s.state = session.state();
            s.session_id = session.session_id().map(str::to_string);
            s.transcript = session.transcript().to_vec();
        });
    }

    /// Opens the speaker off the async workers; device setup may block.
    async fn open_playback(&self) -> Arc<PlaybackPipeline> {
        let speaker = self.speaker.clone();
        let rate = self.config.playback_sample_rate;
        let opened =
            tokio::task::spawn_blocking(move || PlaybackPipeline::open(speaker.as_ref(), rate))
                .await;
        match opened {
            Ok(playback) => Arc::new(playback),
            Err(e) => {
                error!(error = %e, "Speaker setup panicked; playback disabled");
                Arc::new(PlaybackPipeline::disabled(rate))
            }
        }
    }

    async fn check_health(&self) {
        let Some(health) = &self.health else {
            return;
        };
        match health.check().await {
            Ok(()) => debug!("Voice service health check passed"),
            Err(e) => warn!(error = %e, "Voice service reports degraded health; connecting anyway"),
        }
    }

    fn frame_sink(
        shared: &Arc<Shared>,
    ) -> impl FnMut(Vec<u8>) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static
    {
        let weak = Arc::downgrade(shared);
        move |frame| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.send_frame(frame).await;
                }
            })
        }
    }

    /// Connects with linear backoff and installs the new socket.
    async fn open_link(shared: &Arc<Shared>) -> Result<(), VoiceError> {
        let config = &shared.config;
        let max = config.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max {
            debug!(attempt, max, "Connecting to voice service");
            let outcome =
                tokio::time::timeout(config.connect_timeout, connect_async(config.ws_url.as_str()))
                    .await;
            match outcome {
                Ok(Ok((stream, _response))) => match Shared::attach(shared, stream).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last_error = e,
                },
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connection attempt timed out".to_string(),
            }
            warn!(attempt, max, error = %last_error, "Voice service connection attempt failed");

            if attempt < max {
                shared.set_connection(ConnectionState::Retrying { attempt, max });
                tokio::time::sleep(config.backoff_for(attempt)).await;
            }
        }

        Err(VoiceError::Connection {
            attempts: max,
            reason: last_error,
        })
    }

    async fn attach(shared: &Arc<Shared>, stream: WsStream) -> Result<(), String> {
        let (mut sink, stream) = stream.split();
        let start = ClientMessage::StartSession {
            user_id: shared.config.user_id.clone(),
        }
        .to_json()
        .map_err(|e| e.to_string())?;
        write_bounded(&mut sink, Message::Text(start), shared.config.send_timeout).await?;

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&shared.session).begin_connection();
        shared.publish_session();
        *shared.link.lock().await = Some(Link {
            sink,
            reader: None,
            generation,
        });
        shared.set_connection(ConnectionState::Open);
        info!(generation, "Voice connection open");
        shared.events.on_connection_open();

        let reader = tokio::spawn(read_loop(Arc::downgrade(shared), stream, generation));
        if let Some(link) = shared.link.lock().await.as_mut() {
            if link.generation == generation {
                link.reader = Some(reader);
            }
        }
        Ok(())
    }

    /// Closes the socket. Ending a conversation first sends a best-effort
    /// `end_session` and then waits up to the configured timeout for the close
    /// handshake; replacing the socket does neither.
    async fn close_link(&self, mut link: Link, closing: Closing) {
        let limit = self.config.send_timeout;
        let reason = match closing {
            Closing::End => {
                if let Ok(end) = ClientMessage::EndSession.to_json() {
                    if let Err(e) = write_bounded(&mut link.sink, Message::Text(end), limit).await {
                        debug!(error = %e, "end_session not delivered");
                    }
                }
                "session ended"
            }
            Closing::Replace => "reconnecting",
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        };
        if let Err(e) = write_bounded(&mut link.sink, Message::Close(Some(frame)), limit).await {
            debug!(error = %e, "Close frame not delivered");
        }
        if let Some(mut reader) = link.reader.take() {
            if closing == Closing::End
                && tokio::time::timeout(self.config.end_timeout, &mut reader)
                    .await
                    .is_err()
            {
                warn!("Timed out waiting for the server to acknowledge close");
            }
            reader.abort();
        }
    }

    fn teardown_media(&self) {
        let (capture, playback) = {
            let mut media = lock(&self.media);
            (media.capture.take(), media.playback.take())
        };
        if let Some(mut capture) = capture {
            capture.release();
        }
        if let Some(playback) = playback {
            playback.release();
        }
    }

    /// Boxed: a reconnect spawns a reader that may itself trigger a reconnect.
    fn reconnect_locked(shared: &Arc<Shared>) -> BoxFuture<'_, Result<(), VoiceError>> {
        Box::pin(Shared::reconnect_inner(shared))
    }

    async fn reconnect_inner(shared: &Arc<Shared>) -> Result<(), VoiceError> {
        if !shared.active.load(Ordering::SeqCst) {
            return Err(VoiceError::NoSession);
        }
        shared.set_connection(ConnectionState::Reconnecting);

        let stale = shared.link.lock().await.take();
        if let Some(link) = stale {
            shared.close_link(link, Closing::Replace).await;
        }

        // Recreate whatever was torn down since the session started.
        let existing = lock(&shared.media).capture.take();
        let capture = match existing {
            Some(capture) if capture.is_live() => capture,
            stale => {
                drop(stale);
                let acquired =
                    CapturePipeline::acquire(shared.microphone.as_ref(), &shared.constraints).await;
                match acquired {
                    Ok(mut capture) => {
                        capture.start(Shared::frame_sink(shared));
                        capture
                    }
                    Err(e) => {
                        shared.fail(&e);
                        return Err(e);
                    }
                }
            }
        };
        lock(&shared.media).capture = Some(capture);

        let playback_live = lock(&shared.media)
            .playback
            .as_ref()
            .is_some_and(|p| p.is_live());
        if !playback_live {
            let playback = shared.open_playback().await;
            lock(&shared.media).playback = Some(playback);
        }

        match Shared::open_link(shared).await {
            Ok(()) => {
                info!("Voice session reconnected");
                Ok(())
            }
            Err(e) => {
                shared.fail(&e);
                Err(e)
            }
        }
    }

    /// Terminal failure: release everything, clear the conversation and report.
    fn fail(&self, error: &VoiceError) {
        error!(error = %error, "Voice session failed");
        self.active.store(false, Ordering::SeqCst);
        self.teardown_media();
        let reset = lock(&self.session).reset();
        if let Some(event) = reset {
            self.emit(event);
        }
        self.publish_session();
        self.set_connection(ConnectionState::Failed);
        self.events.on_error(error);
    }

    async fn after_remote_close(shared: Arc<Shared>, generation: u64, code: u16) {
        let _lifecycle = shared.lifecycle.lock().await;
        if shared.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Connection close already handled");
            return;
        }

        if is_abnormal_close(code) {
            warn!(code, "Voice connection dropped; attempting to reconnect");
            if let Err(e) = Shared::reconnect_locked(&shared).await {
                warn!(error = %e, "Reconnect failed");
            }
        } else {
            info!(code, "Voice service closed the session");
            shared.teardown_media();
            shared.active.store(false, Ordering::SeqCst);
            let reset = lock(&shared.session).reset();
            if let Some(event) = reset {
                shared.emit(event);
            }
            shared.publish_session();
            shared.set_connection(ConnectionState::Idle);
        }
    }

    async fn send_frame(&self, frame: Vec<u8>) -> bool {
        let mut link = self.link.lock().await;
        let Some(link) = link.as_mut() else {
            return false;
        };
        if self.connection() != ConnectionState::Open {
            return false;
        }
        match write_bounded(&mut link.sink, Message::Binary(frame), self.config.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Dropping audio frame");
                false
            }
        }
    }

    async fn send_control(&self, msg: ClientMessage) -> bool {
        let payload = match msg.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode control message");
                return false;
            }
        };
        let mut link = self.link.lock().await;
        let Some(link) = link.as_mut() else {
            debug!(?msg, "Not connected; control message dropped");
            return false;
        };
        if self.connection() != ConnectionState::Open {
            return false;
        }
        match write_bounded(&mut link.sink, Message::Text(payload), self.config.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, ?msg, "Failed to send control message");
                false
            }
        }
    }

    fn dispatch_text(&self, text: &str) {
        let msg = match ServerMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                self.events.on_error(&e);
                return;
            }
        };

        let applied = lock(&self.session).apply(msg);
        match applied {
            Ok(events) => {
                self.publish_session();
                for event in events {
                    self.emit(event);
                }
            }
            Err(e) => {
                warn!(error = %e, "Dropping message with undecodable payload");
                self.events.on_error(&e);
            }
        }
    }

    fn dispatch_audio(&self, chunk: AudioChunk) {
        let playback = lock(&self.media).playback.clone();
        match playback {
            Some(playback) => playback.play(&chunk),
            None => debug!("No playback context; dropping audio chunk"),
        }
        self.events.on_audio_chunk(&chunk);
    }

    fn emit(&self, event: SessionEvent) {
        match event {
            SessionEvent::SessionStarted(id) => {
                info!(session_id = %id, "Session started by voice service");
                self.events.on_session_started(&id);
            }
            SessionEvent::StateChanged(state) => self.events.on_state_change(state),
            SessionEvent::Transcript(entry) => self.events.on_transcript(&entry),
            SessionEvent::AudioChunk(chunk) => self.dispatch_audio(chunk),
            SessionEvent::Interrupted => self.events.on_interrupt(),
        }
    }
}

/// Reads one socket until it closes, dispatching messages in order.
async fn read_loop(weak: Weak<Shared>, mut stream: SplitStream<WsStream>, generation: u64) {
    let (code, reason) = loop {
        let Some(next) = stream.next().await else {
            break (CLOSE_ABNORMAL, "connection dropped".to_string());
        };
        let Some(shared) = weak.upgrade() else {
            return;
        };
        match next {
            Ok(Message::Text(text)) => shared.dispatch_text(&text),
            Ok(Message::Binary(data)) => shared.dispatch_audio(AudioChunk {
                sequence: None,
                encoding: SampleEncoding::U8,
                data,
            }),
            Ok(Message::Close(frame)) => {
                break match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                    None => (CLOSE_NO_STATUS, String::new()),
                };
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Voice connection read failed");
                break (CLOSE_ABNORMAL, e.to_string());
            }
        }
    };

    let Some(shared) = weak.upgrade() else {
        return;
    };
    {
        let mut link = shared.link.lock().await;
        match link.as_ref() {
            Some(current) if current.generation == generation => {
                link.take();
            }
            // Closed by us, or superseded by a newer socket.
            _ => return,
        }
        // Under the link lock, so a concurrent end_session settles on Idle.
        if is_abnormal_close(code) {
            shared.set_connection(ConnectionState::Reconnecting);
        }
    }
    info!(code, %reason, "Voice connection closed by remote");
    shared.events.on_connection_close(code, &reason);
    tokio::spawn(Shared::after_remote_close(shared, generation, code));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::{CaptureDevice, CaptureStream, MockMicrophone},
        events::{VoiceEvent, event_channel},
        health::MockHealthCheck,
        playback::{MockSpeaker, NullSpeaker},
    };
    use tokio::net::TcpListener;

    struct IdleDevice;

    impl CaptureDevice for IdleDevice {
        fn stop(&mut self) {}

        fn is_live(&self) -> bool {
            true
        }
    }

    fn config_for(url: &str) -> ClientConfig {
        let mut config = ClientConfig::new(url).unwrap();
        config.health_url = None;
        config.connect_attempts = 2;
        config.backoff_step = Duration::from_millis(10);
        config.connect_timeout = Duration::from_secs(2);
        config.end_timeout = Duration::from_millis(200);
        config
    }

    #[test]
    fn test_abnormal_close_codes() {
        assert!(is_abnormal_close(1005));
        assert!(is_abnormal_close(1006));
        assert!(is_abnormal_close(1011));
        assert!(!is_abnormal_close(1000));
        assert!(!is_abnormal_close(1001));
        assert!(!is_abnormal_close(4000));
    }

    #[tokio::test]
    async fn test_permission_denied_never_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let mut mic = MockMicrophone::new();
        mic.expect_acquire()
            .times(1)
            .returning(|_| Err(VoiceError::Permission("denied by user".into())));
        let (events, mut rx) = event_channel();
        let client = VoiceClient::builder(config_for(&url))
            .events(Arc::new(events))
            .microphone(Arc::new(mic))
            .speaker(Arc::new(NullSpeaker))
            .build();

        let result = client.start_session().await;
        assert!(matches!(result, Err(VoiceError::Permission(_))));
        assert_eq!(
            rx.recv().await.unwrap(),
            VoiceEvent::Error(VoiceError::Permission("denied by user".into()))
        );
        assert_eq!(client.connection_state(), ConnectionState::Idle);

        let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(accepted.is_err(), "no connection should have been attempted");
    }

    #[tokio::test]
    async fn test_connection_failure_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let mut health = MockHealthCheck::new();
        health
            .expect_check()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("503")));
        let mut mic = MockMicrophone::new();
        mic.expect_acquire().times(1).returning(|_| {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(CaptureStream {
                frames: rx,
                device: Box::new(IdleDevice),
            })
        });
        let (events, mut rx) = event_channel();
        let client = VoiceClient::builder(config_for(&url))
            .events(Arc::new(events))
            .microphone(Arc::new(mic))
            .speaker(Arc::new(NullSpeaker))
            .health_check(Some(Arc::new(health)))
            .build();

        let mut states = client.subscribe();
        states.borrow_and_update();
        let result = client.start_session().await;
        match result {
            Err(VoiceError::Connection { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected connection error, got {:?}", other),
        }
        assert_eq!(client.connection_state(), ConnectionState::Failed);
        assert!(states.has_changed().unwrap());
        assert_eq!(states.borrow().connection, ConnectionState::Failed);

        match rx.recv().await.unwrap() {
            VoiceEvent::Error(e) => assert!(e.is_fatal()),
            other => panic!("Expected error event, got {:?}", other),
        }

        // Ending a session that never started is harmless.
        client.end_session().await;
        client.end_session().await;
        assert_eq!(client.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_speaker_opens_off_the_async_thread() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let mut mic = MockMicrophone::new();
        mic.expect_acquire().returning(|_| {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(CaptureStream {
                frames: rx,
                device: Box::new(IdleDevice),
            })
        });
        let opened_on = Arc::new(Mutex::new(None));
        let record = opened_on.clone();
        let mut speaker = MockSpeaker::new();
        speaker.expect_open().times(1).returning(move || {
            *record.lock().unwrap() = Some(std::thread::current().id());
            Err(VoiceError::Playback("no output device".into()))
        });
        let client = VoiceClient::builder(config_for(&url))
            .microphone(Arc::new(mic))
            .speaker(Arc::new(speaker))
            .build();

        assert!(client.start_session().await.is_err());
        let opened_on = *opened_on.lock().unwrap();
        assert!(opened_on.is_some());
        assert_ne!(opened_on, Some(std::thread::current().id()));
    }

    #[tokio::test]
    async fn test_reconnect_without_session() {
        let client = VoiceClient::builder(config_for("ws://127.0.0.1:9/ws"))
            .speaker(Arc::new(NullSpeaker))
            .build();
        assert!(matches!(
            client.reconnect_session().await,
            Err(VoiceError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_send_and_interrupt_without_connection_are_dropped() {
        let client = VoiceClient::builder(config_for("ws://127.0.0.1:9/ws"))
            .speaker(Arc::new(NullSpeaker))
            .build();
        assert!(!client.send(vec![0, 0]).await);
        assert!(!client.interrupt().await);
        assert_eq!(client.state(), VoiceState::Waiting);
        assert_eq!(client.session_id(), None);
        assert!(client.transcript().is_empty());
    }
}
