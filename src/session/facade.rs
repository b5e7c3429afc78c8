//! Live call facade.
//!
//! [`LiveCallHandler`] is the single entry point UI code talks to. It is
//! composed once with its collaborators injected and coordinates them for
//! the lifetime of each call: the realtime channel, microphone capture,
//! the playback scheduler, the text coordinator and the session manager.
//! Inbound channel traffic arrives as [`ChannelEvent`]s pumped by a tokio
//! task, so the ordering of barge-in and teardown handling is explicit.

use crate::audio_toolkit::audio::{
    CaptureErrorCallback, CpalMicInput, CpalSpeakerOutput, MicrophoneInput, SpeakerOutput,
};
use crate::audio_toolkit::text::sanitize_spoken_text;
use crate::channel::{
    AudioFormatHint, ChannelConnector, ChannelEvent, RealtimeChannel, TextDirection,
};
use crate::error::LiveCallError;
use crate::history::SessionStore;
use crate::recap::RecapGenerator;
use crate::session::text_coordinator::TextCoordinator;
use crate::session::{CallOutcome, PersonaProfile, SessionKind, SessionManager, Speaker, TurnType};
use crate::settings::CallSettings;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Optional status surface for the UI collaborator.
pub trait UiNotifier: Send + Sync {
    fn call_status(&self, status: &str, is_error: bool);
}

struct ActiveCall {
    channel: Arc<dyn RealtimeChannel>,
    text: Arc<TextCoordinator>,
    persona: PersonaProfile,
}

/// Coordinates one live voice call at a time. Cheap to clone; clones share
/// all state.
#[derive(Clone)]
pub struct LiveCallHandler {
    session: Arc<SessionManager>,
    connector: Arc<dyn ChannelConnector>,
    mic: Arc<dyn MicrophoneInput>,
    speaker: Arc<dyn SpeakerOutput>,
    notifier: Arc<Mutex<Option<Arc<dyn UiNotifier>>>>,
    settings: CallSettings,
    mic_muted: Arc<AtomicBool>,
    speaker_muted: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveCall>>>,
}

impl LiveCallHandler {
    /// Compose the pipeline with cpal-backed audio endpoints.
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        recap: Arc<dyn RecapGenerator>,
        store: Arc<dyn SessionStore>,
        settings: CallSettings,
    ) -> Self {
        let mic_muted = Arc::new(AtomicBool::new(true));
        let speaker_muted = Arc::new(AtomicBool::new(false));
        let mic = Arc::new(CpalMicInput::new(&settings, mic_muted.clone()));
        let speaker = Arc::new(CpalSpeakerOutput::new(&settings, speaker_muted.clone()));
        Self::with_audio(
            connector,
            recap,
            store,
            settings,
            mic,
            speaker,
            mic_muted,
            speaker_muted,
        )
    }

    /// Compose the pipeline with injected audio endpoints. The mute flags
    /// must be the same ones the endpoints poll.
    #[allow(clippy::too_many_arguments)]
    pub fn with_audio(
        connector: Arc<dyn ChannelConnector>,
        recap: Arc<dyn RecapGenerator>,
        store: Arc<dyn SessionStore>,
        settings: CallSettings,
        mic: Arc<dyn MicrophoneInput>,
        speaker: Arc<dyn SpeakerOutput>,
        mic_muted: Arc<AtomicBool>,
        speaker_muted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session: Arc::new(SessionManager::new(recap, store)),
            connector,
            mic,
            speaker,
            notifier: Arc::new(Mutex::new(None)),
            settings,
            mic_muted,
            speaker_muted,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn attach_notifier(&self, notifier: Arc<dyn UiNotifier>) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    fn notify(&self, status: &str, is_error: bool) {
        if let Some(notifier) = self.notifier.lock().unwrap().as_ref() {
            notifier.call_status(status, is_error);
        }
    }

    /// Start a call with `persona`. Resolves once the channel connection is
    /// initiated; the session goes active when the channel reports open.
    pub async fn start_call(
        &self,
        persona: PersonaProfile,
        kind: SessionKind,
    ) -> Result<String, LiveCallError> {
        let session_id = self.session.begin(persona.clone(), kind)?;
        info!("Starting live call {} with {}", session_id, persona.name);
        self.notify("Calling...", false);

        // Fresh calls open with a live mic and audible speaker.
        self.mic_muted.store(false, Ordering::SeqCst);
        self.speaker_muted.store(false, Ordering::SeqCst);

        match self.connector.connect(&persona, &self.settings).await {
            Ok((channel, mut events)) => {
                let text = Arc::new(TextCoordinator::new(self.session.clone(), &self.settings));
                *self.active.lock().unwrap() = Some(ActiveCall {
                    channel,
                    text,
                    persona,
                });

                let handler = self.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        handler.handle_channel_event(event).await;
                    }
                    debug!("Channel event stream ended");
                });

                Ok(session_id)
            }
            Err(err) => {
                error!("Failed to open realtime channel: {}", err);
                self.notify("Connection Failed", true);
                self.session.cancel();
                Err(err)
            }
        }
    }

    /// Dispatch one inbound channel event.
    pub async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.on_channel_opened(),
            ChannelEvent::AudioChunk { bytes, format } => {
                let format = format
                    .unwrap_or_else(|| AudioFormatHint::pcm(self.settings.playback_sample_rate));
                self.speaker.enqueue_chunk(&bytes, &format);
            }
            ChannelEvent::TextFragment {
                text,
                is_final,
                direction,
            } => {
                let coordinator = self
                    .active
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|call| call.text.clone());
                match coordinator {
                    Some(coordinator) => coordinator.handle_fragment(direction, &text, is_final),
                    None => debug!("Text fragment with no active call, dropped"),
                }
            }
            ChannelEvent::Interrupted => self.on_interrupted(),
            ChannelEvent::Closed { clean, reason } => self.on_channel_closed(clean, reason).await,
            ChannelEvent::Error(message) => self.on_channel_error(message).await,
        }
    }

    fn on_channel_opened(&self) {
        let call_parts = self
            .active
            .lock()
            .unwrap()
            .as_ref()
            .map(|call| (call.channel.clone(), call.persona.clone()));
        let Some((channel, persona)) = call_parts else {
            warn!("Channel opened with no active call");
            return;
        };

        if !self.session.mark_started() {
            warn!("Channel opened but the session could not be marked started");
        }
        self.notify("Live Call Connected", false);

        // Capture errors surface on the audio thread; hop back onto the
        // runtime before touching the session.
        let handler = self.clone();
        let runtime = tokio::runtime::Handle::current();
        let on_error: CaptureErrorCallback = Box::new(move |err| {
            let handler = handler.clone();
            runtime.spawn(async move {
                handler.on_capture_failure(err).await;
            });
        });

        if let Err(err) = self.mic.start_capture(channel.clone(), on_error) {
            error!("Microphone capture failed to start: {}", err);
            self.notify(&err.status_line(), true);
            // Nothing was exchanged yet; tear down without a recap.
            self.cancel_pending_call();
            return;
        }

        if let Some(greeting) = persona.greeting_call {
            self.session
                .add_turn(Speaker::System, &greeting, TurnType::Message);
            let spoken = sanitize_spoken_text(&greeting);
            if !spoken.is_empty() {
                if let Err(err) = channel.send_text(&spoken) {
                    warn!("Failed to send greeting: {}", err);
                }
            }
        }
    }

    /// Barge-in: the user's speech must not compete with stale AI audio,
    /// and the cut-off utterance never reaches the transcript.
    fn on_interrupted(&self) {
        debug!("AI speech interrupted");
        self.speaker.stop_current();
        self.speaker.clear_queue();
        if let Some(call) = self.active.lock().unwrap().as_ref() {
            call.text.discard_partial(TextDirection::Ai);
        }
    }

    async fn on_channel_closed(&self, clean: bool, reason: Option<String>) {
        if self.active.lock().unwrap().is_none() {
            debug!("Close event after teardown, nothing to do");
            return;
        }

        let reason_text = reason.unwrap_or_else(|| "connection closed".to_string());
        warn!(
            "Channel closed mid-call (clean: {}): {}",
            clean, reason_text
        );
        self.notify(&format!("Call ended: {}", reason_text), !clean);

        let outcome = if clean {
            CallOutcome::Completed
        } else {
            CallOutcome::ChannelLost(reason_text)
        };
        self.finish_call(outcome).await;
    }

    async fn on_channel_error(&self, message: String) {
        error!("Realtime channel error: {}", message);
        self.notify(
            &LiveCallError::Channel(message.clone()).status_line(),
            true,
        );
        self.finish_call(CallOutcome::ChannelLost(message)).await;
    }

    async fn on_capture_failure(&self, err: LiveCallError) {
        warn!("Capture failed mid-call: {}", err);
        self.notify(&err.status_line(), true);
        self.finish_call(CallOutcome::ChannelLost(format!("capture failed: {}", err)))
            .await;
    }

    /// Shared teardown + finalization path. Resource release is ordered:
    /// capture first, playback next, then the text buffers, then the
    /// channel, so no component can observe a half-dead neighbour.
    async fn finish_call(&self, outcome: CallOutcome) {
        let taken = self.active.lock().unwrap().take();
        let Some(call) = taken else {
            warn!("finish_call with no active call");
            return;
        };

        self.mic.stop_capture();
        self.speaker.cleanup();
        call.text.flush_all();
        call.channel.close();

        if let Err(err) = self.session.finalize(outcome).await {
            error!("Session close completed but persistence failed: {}", err);
            self.notify(&err.status_line(), true);
        }
    }

    /// End the call normally, flushing buffers and generating a recap.
    pub async fn end_call(&self) -> Result<(), LiveCallError> {
        if self.active.lock().unwrap().is_none() {
            return Err(LiveCallError::NoActiveCall);
        }
        info!("Ending live call");
        self.finish_call(CallOutcome::Completed).await;
        Ok(())
    }

    /// Abandon a call that never got going: same teardown as finalizing,
    /// no recap.
    pub fn cancel_pending_call(&self) {
        let taken = self.active.lock().unwrap().take();
        if let Some(call) = taken {
            call.channel.close();
        }
        self.mic.stop_capture();
        self.speaker.cleanup();
        if self.session.cancel() {
            info!("Pending call cancelled");
        }
    }

    pub fn set_mic_muted(&self, muted: bool) {
        self.mic_muted.store(muted, Ordering::SeqCst);
        info!("Microphone {}", if muted { "muted" } else { "live" });
        if muted {
            if let Some(call) = self.active.lock().unwrap().as_ref() {
                call.channel.signal_audio_stream_end();
            }
        }
    }

    pub fn is_mic_muted(&self) -> bool {
        self.mic_muted.load(Ordering::SeqCst)
    }

    /// Muting the speaker also silences what is already sounding or queued;
    /// unmuting only affects chunks that arrive afterwards.
    pub fn set_speaker_muted(&self, muted: bool) {
        self.speaker_muted.store(muted, Ordering::SeqCst);
        info!("Speaker {}", if muted { "muted" } else { "live" });
        if muted {
            self.speaker.clear_queue();
            self.speaker.stop_current();
        }
    }

    pub fn is_speaker_muted(&self) -> bool {
        self.speaker_muted.load(Ordering::SeqCst)
    }

    /// Typed messages go to the transcript and the model immediately.
    pub fn send_typed_text(&self, text: &str) -> Result<(), LiveCallError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let guard = self.active.lock().unwrap();
        let Some(call) = guard.as_ref() else {
            return Err(LiveCallError::NoActiveCall);
        };
        call.text.handle_typed(trimmed);
        call.channel.send_text(trimmed)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEventReceiver;
    use crate::error::LiveCallError;
    use crate::history::MemorySessionStore;
    use crate::recap::{RecapContent, RecapGenerator};
    use crate::session::TranscriptTurn;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NoRecap;

    #[async_trait]
    impl RecapGenerator for NoRecap {
        async fn generate_recap(
            &self,
            _transcript: &[TranscriptTurn],
            _persona: &PersonaProfile,
        ) -> Result<RecapContent, LiveCallError> {
            let mut content = RecapContent::default();
            content.conversation_summary = "recapped".into();
            Ok(content)
        }
    }

    #[derive(Default)]
    struct FakeChannel {
        frames: Mutex<Vec<Vec<u8>>>,
        texts: Mutex<Vec<String>>,
        stream_end_signals: AtomicUsize,
        closed: AtomicUsize,
    }

    impl RealtimeChannel for FakeChannel {
        fn send_audio_frame(&self, pcm: &[u8]) -> Result<(), LiveCallError> {
            self.frames.lock().unwrap().push(pcm.to_vec());
            Ok(())
        }

        fn send_text(&self, text: &str) -> Result<(), LiveCallError> {
            self.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn signal_audio_stream_end(&self) {
            self.stream_end_signals.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        channel: Arc<FakeChannel>,
        receiver: Mutex<Option<ChannelEventReceiver>>,
        fail: bool,
    }

    #[async_trait]
    impl ChannelConnector for FakeConnector {
        async fn connect(
            &self,
            _persona: &PersonaProfile,
            _settings: &CallSettings,
        ) -> Result<(Arc<dyn RealtimeChannel>, ChannelEventReceiver), LiveCallError> {
            if self.fail {
                return Err(LiveCallError::Channel("refused".into()));
            }
            let receiver = self
                .receiver
                .lock()
                .unwrap()
                .take()
                .expect("connector used once");
            Ok((self.channel.clone(), receiver))
        }
    }

    #[derive(Default)]
    struct FakeMic {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: bool,
    }

    impl MicrophoneInput for FakeMic {
        fn start_capture(
            &self,
            _channel: Arc<dyn RealtimeChannel>,
            _on_error: CaptureErrorCallback,
        ) -> Result<(), LiveCallError> {
            if self.fail_start {
                return Err(LiveCallError::Permission("mic denied".into()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop_capture(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeSpeaker {
        chunks: Mutex<Vec<usize>>,
        queue_len: AtomicUsize,
        stop_current_calls: AtomicUsize,
        clear_queue_calls: AtomicUsize,
        cleanups: AtomicUsize,
    }

    impl SpeakerOutput for FakeSpeaker {
        fn enqueue_chunk(&self, bytes: &[u8], _format: &AudioFormatHint) {
            self.chunks.lock().unwrap().push(bytes.len());
            self.queue_len.fetch_add(1, Ordering::SeqCst);
        }

        fn clear_queue(&self) {
            self.clear_queue_calls.fetch_add(1, Ordering::SeqCst);
            self.queue_len.store(0, Ordering::SeqCst);
        }

        fn stop_current(&self) {
            self.stop_current_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            self.queue_len.store(0, Ordering::SeqCst);
        }

        fn is_idle(&self) -> bool {
            self.queue_len.load(Ordering::SeqCst) == 0
        }
    }

    struct Harness {
        handler: LiveCallHandler,
        channel: Arc<FakeChannel>,
        mic: Arc<FakeMic>,
        speaker: Arc<FakeSpeaker>,
        store: Arc<MemorySessionStore>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    }

    fn persona(greeting: Option<&str>) -> PersonaProfile {
        PersonaProfile {
            id: "sofia_es".into(),
            name: "Sofía".into(),
            language: "Spanish".into(),
            language_code: Some("es-ES".into()),
            voice_name: Some("Puck".into()),
            greeting_call: greeting.map(|g| g.to_string()),
        }
    }

    fn harness(fail_connect: bool, fail_mic: bool) -> Harness {
        let channel = Arc::new(FakeChannel::default());
        let (events, receiver) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            channel: channel.clone(),
            receiver: Mutex::new(Some(receiver)),
            fail: fail_connect,
        });
        let mic = Arc::new(FakeMic {
            fail_start: fail_mic,
            ..FakeMic::default()
        });
        let speaker = Arc::new(FakeSpeaker::default());
        let store = Arc::new(MemorySessionStore::new());

        let mut settings = CallSettings::default();
        settings.user_flush_delay_ms = 100;
        settings.ai_flush_delay_ms = 60;

        let mic_muted = Arc::new(AtomicBool::new(true));
        let speaker_muted = Arc::new(AtomicBool::new(false));
        let handler = LiveCallHandler::with_audio(
            connector,
            Arc::new(NoRecap),
            store.clone(),
            settings,
            mic.clone(),
            speaker.clone(),
            mic_muted,
            speaker_muted,
        );

        Harness {
            handler,
            channel,
            mic,
            speaker,
            store,
            events,
        }
    }

    async fn settle() {
        // Let the event pump and any timers run
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_call_with_barge_in() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        assert!(h.handler.is_active());

        h.events.send(ChannelEvent::Opened).unwrap();
        settle().await;
        assert_eq!(h.mic.starts.load(Ordering::SeqCst), 1);

        // Three user fragments forming one utterance
        for (text, is_final) in [("I", false), ("want to", false), ("practice", true)] {
            h.events
                .send(ChannelEvent::TextFragment {
                    text: text.into(),
                    is_final,
                    direction: TextDirection::User,
                })
                .unwrap();
        }
        settle().await;
        assert_eq!(h.handler.session().transcript_len(), 1);

        // AI responds with audio and a buffered (non-final) utterance
        for len in [5760usize, 3840] {
            h.events
                .send(ChannelEvent::AudioChunk {
                    bytes: vec![0u8; len],
                    format: None,
                })
                .unwrap();
        }
        h.events
            .send(ChannelEvent::TextFragment {
                text: "Great, let's begin!".into(),
                is_final: false,
                direction: TextDirection::Ai,
            })
            .unwrap();
        settle().await;
        assert_eq!(h.speaker.chunks.lock().unwrap().len(), 2);

        // User mutes the mic mid AI speech
        h.handler.set_mic_muted(true);
        assert_eq!(h.channel.stream_end_signals.load(Ordering::SeqCst), 1);

        // Barge-in before the AI buffer flushed
        h.events.send(ChannelEvent::Interrupted).unwrap();
        settle().await;
        assert_eq!(h.speaker.stop_current_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.speaker.clear_queue_calls.load(Ordering::SeqCst), 1);
        assert!(h.speaker.is_idle());

        // Even after the AI debounce window, the cut-off text stays out
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.handler.session().transcript_len(), 1);

        h.handler.end_call().await.unwrap();
        assert!(!h.handler.is_active());
        assert_eq!(h.mic.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.speaker.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.closed.load(Ordering::SeqCst), 1);

        let saved = h.store.sessions();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].transcript.len(), 1);
        assert_eq!(saved[0].transcript[0].speaker, Speaker::UserSpoken);
        assert_eq!(saved[0].transcript[0].text, "I want to practice");
        assert_eq!(saved[0].content.conversation_summary, "recapped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ai_turn_committed_when_flushed_before_barge_in() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        h.events
            .send(ChannelEvent::TextFragment {
                text: "Great, let's begin!".into(),
                is_final: true,
                direction: TextDirection::Ai,
            })
            .unwrap();
        settle().await;
        assert_eq!(h.handler.session().transcript_len(), 1);

        // A later barge-in does not claw the committed turn back
        h.events.send(ChannelEvent::Interrupted).unwrap();
        settle().await;
        assert_eq!(h.handler.session().transcript_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_rejected_while_active() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        settle().await;

        let err = h
            .handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveCallError::CallAlreadyActive));
        // The first session is unaffected
        assert!(h.handler.is_active());
        assert_eq!(
            h.handler.session().state(),
            Some(crate::session::SessionState::Active)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_cancels_pending_session() {
        let h = harness(true, false);
        let err = h
            .handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveCallError::Channel(_)));
        assert!(!h.handler.is_active());
        assert!(h.store.sessions().is_empty());

        // And a fresh attempt is allowed to try again
        assert!(h
            .handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mic_failure_at_open_cancels_without_recap() {
        let h = harness(false, true);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        settle().await;

        assert!(!h.handler.is_active());
        assert!(h.store.sessions().is_empty());
        assert_eq!(h.channel.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.speaker.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclean_close_produces_degraded_recap() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        h.events
            .send(ChannelEvent::TextFragment {
                text: "hola".into(),
                is_final: true,
                direction: TextDirection::User,
            })
            .unwrap();
        h.events
            .send(ChannelEvent::Closed {
                clean: false,
                reason: Some("network reset".into()),
            })
            .unwrap();
        settle().await;

        assert!(!h.handler.is_active());
        let saved = h.store.sessions();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].content.conversation_summary.contains("network reset"));
        assert_eq!(saved[0].transcript.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_flushes_pending_text() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        // Fragment still sitting in the buffer when the channel dies
        h.events
            .send(ChannelEvent::TextFragment {
                text: "half an utterance".into(),
                is_final: false,
                direction: TextDirection::User,
            })
            .unwrap();
        h.events
            .send(ChannelEvent::Error("boom".into()))
            .unwrap();
        settle().await;

        let saved = h.store.sessions();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].transcript.len(), 1);
        assert_eq!(saved[0].transcript[0].text, "half an utterance");
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_recorded_and_sent_sanitized() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(Some("¡Hola! 👋 ¿Listo?")), SessionKind::DirectCall)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        settle().await;

        let transcript = h.handler.session().transcript_snapshot();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::System);
        assert_eq!(transcript[0].text, "¡Hola! 👋 ¿Listo?");

        let texts = h.channel.texts.lock().unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0], "¡Hola! ¿Listo?");
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_text_goes_to_transcript_and_channel() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::VoiceChat)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        settle().await;

        h.handler.send_typed_text("  ¿Cómo se dice 'tree'?  ").unwrap();
        let transcript = h.handler.session().transcript_snapshot();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::UserTyped);
        assert_eq!(transcript[0].text, "¿Cómo se dice 'tree'?");
        assert_eq!(h.channel.texts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_text_without_call_errors() {
        let h = harness(false, false);
        let err = h.handler.send_typed_text("hello").unwrap_err();
        assert!(matches!(err, LiveCallError::NoActiveCall));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaker_mute_cuts_playback() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        h.events.send(ChannelEvent::Opened).unwrap();
        settle().await;

        h.handler.set_speaker_muted(true);
        assert!(h.handler.is_speaker_muted());
        assert_eq!(h.speaker.clear_queue_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.speaker.stop_current_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_call() {
        let h = harness(false, false);
        h.handler
            .start_call(persona(None), SessionKind::DirectCall)
            .await
            .unwrap();
        h.handler.cancel_pending_call();

        assert!(!h.handler.is_active());
        assert!(h.store.sessions().is_empty());
        assert_eq!(h.channel.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_without_call_errors() {
        let h = harness(false, false);
        let err = h.handler.end_call().await.unwrap_err();
        assert!(matches!(err, LiveCallError::NoActiveCall));
    }
}
