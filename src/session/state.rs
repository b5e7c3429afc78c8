//! Session lifecycle and transcript ownership.
//!
//! One [`SessionManager`] owns at most one live session at a time and is the
//! only mutator of its state and transcript. Everything else reaches the
//! session through it.

use crate::error::LiveCallError;
use crate::history::SessionStore;
use crate::recap::{RecapContent, RecapGenerator, SessionRecap};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Read-only snapshot of the conversational persona for one call.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersonaProfile {
    pub id: String,
    /// Display name, e.g. "Sofía".
    pub name: String,
    /// The language the persona speaks and the user practices.
    pub language: String,
    #[serde(default)]
    pub language_code: Option<String>,
    /// Voice the realtime channel should synthesize with.
    #[serde(default)]
    pub voice_name: Option<String>,
    /// Opening line spoken by the persona when a call connects.
    #[serde(default)]
    pub greeting_call: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    DirectCall,
    VoiceChat,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::DirectCall => "direct_call",
            SessionKind::VoiceChat => "voice_chat",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Speaker {
    UserSpoken,
    UserTyped,
    AiSpoken,
    System,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TurnType {
    Message,
    ActivityEvent,
}

/// One committed utterance. Raw fragments are transient and never stored;
/// only flushed, non-empty text becomes a turn.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    pub turn_type: TurnType,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Finalizing,
    Closed,
}

/// One live-voice interaction, from pending through close. Single use:
/// restarting means creating a new session.
#[derive(Debug, Clone)]
pub struct VoiceSession {
    pub id: String,
    pub persona: PersonaProfile,
    pub kind: SessionKind,
    pub state: SessionState,
    /// Set when the first real exchange happens, not at pending creation,
    /// so "ringing" latency never counts as conversation time.
    pub started_at: Option<DateTime<Utc>>,
    pub transcript: Vec<TranscriptTurn>,
}

/// How a call ended, which decides the recap path.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// Orderly end; the recap collaborator is consulted.
    Completed,
    /// The channel (or capture) died mid-call; a degraded recap records the
    /// reason and preserves the transcript without consulting the
    /// collaborator.
    ChannelLost(String),
}

/// Owns the lifecycle of one voice session at a time.
pub struct SessionManager {
    current: Mutex<Option<VoiceSession>>,
    recap: Arc<dyn RecapGenerator>,
    store: Arc<dyn SessionStore>,
}

impl SessionManager {
    pub fn new(recap: Arc<dyn RecapGenerator>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            current: Mutex::new(None),
            recap,
            store,
        }
    }

    /// Create a new pending session. Rejected while another session exists
    /// in any state short of fully closed.
    pub fn begin(
        &self,
        persona: PersonaProfile,
        kind: SessionKind,
    ) -> Result<String, LiveCallError> {
        let mut current = self.current.lock().unwrap();
        if let Some(existing) = current.as_ref() {
            warn!(
                "Refusing to start a session while {} is {:?}",
                existing.id, existing.state
            );
            return Err(LiveCallError::CallAlreadyActive);
        }

        let id = format!(
            "{}_{}_{}",
            persona.id,
            kind.as_str(),
            Utc::now().timestamp_millis()
        );
        info!("Session {} pending for persona {}", id, persona.id);

        *current = Some(VoiceSession {
            id: id.clone(),
            persona,
            kind,
            state: SessionState::Pending,
            started_at: None,
            transcript: Vec::new(),
        });

        Ok(id)
    }

    /// Mark the first real exchange: Pending -> Active.
    pub fn mark_started(&self) -> bool {
        let mut current = self.current.lock().unwrap();
        match current.as_mut() {
            Some(session) if session.state == SessionState::Pending => {
                session.state = SessionState::Active;
                session.started_at = Some(Utc::now());
                info!("Session {} active", session.id);
                true
            }
            Some(session) => {
                warn!(
                    "mark_started called on session {} in state {:?}",
                    session.id, session.state
                );
                session.state == SessionState::Active
            }
            None => {
                warn!("mark_started called with no session");
                false
            }
        }
    }

    /// Append one committed turn. No-op with a warning outside
    /// Pending/Active/Finalizing.
    pub fn add_turn(&self, speaker: Speaker, text: &str, turn_type: TurnType) {
        let mut current = self.current.lock().unwrap();
        match current.as_mut() {
            Some(session) if session.state != SessionState::Closed => {
                session.transcript.push(TranscriptTurn {
                    speaker,
                    text: text.to_string(),
                    turn_type,
                    timestamp_ms: Utc::now().timestamp_millis(),
                });
            }
            Some(session) => {
                warn!(
                    "Dropping turn for closed session {}: {:?} {:?}",
                    session.id, speaker, turn_type
                );
            }
            None => {
                warn!("Dropping turn, no session: {:?} {:?}", speaker, turn_type);
            }
        }
    }

    pub fn transcript_snapshot(&self) -> Vec<TranscriptTurn> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.transcript.clone())
            .unwrap_or_default()
    }

    pub fn transcript_len(&self) -> usize {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.transcript.len())
            .unwrap_or(0)
    }

    pub fn state(&self) -> Option<SessionState> {
        self.current.lock().unwrap().as_ref().map(|s| s.state)
    }

    pub fn session_id(&self) -> Option<String> {
        self.current.lock().unwrap().as_ref().map(|s| s.id.clone())
    }

    /// True while a session exists in any state short of fully closed.
    pub fn is_active(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    /// Finalize the session: generate (or substitute) a recap, hand the
    /// record to the persistence collaborator, then close.
    ///
    /// The recap is best-effort; only a persistence failure is returned,
    /// and even then the session still closes.
    pub async fn finalize(&self, outcome: CallOutcome) -> Result<(), LiveCallError> {
        let snapshot = {
            let mut current = self.current.lock().unwrap();
            match current.as_mut() {
                None => {
                    warn!("finalize called with no session");
                    return Ok(());
                }
                Some(session)
                    if session.state == SessionState::Finalizing
                        || session.state == SessionState::Closed =>
                {
                    warn!(
                        "finalize called on session {} already {:?}",
                        session.id, session.state
                    );
                    return Ok(());
                }
                Some(session) => {
                    session.state = SessionState::Finalizing;
                    session.clone()
                }
            }
        };

        let ended_at = Utc::now();
        info!(
            "Finalizing session {} with {} transcript turns",
            snapshot.id,
            snapshot.transcript.len()
        );

        let content = if snapshot.transcript.is_empty() {
            info!("Session {} had no conversation, skipping recap", snapshot.id);
            RecapContent::empty_session()
        } else {
            match outcome {
                CallOutcome::Completed => {
                    match self
                        .recap
                        .generate_recap(&snapshot.transcript, &snapshot.persona)
                        .await
                    {
                        Ok(content) => content,
                        Err(err) => {
                            warn!("Recap generation failed for {}: {}", snapshot.id, err);
                            RecapContent::failure(&err.to_string())
                        }
                    }
                }
                CallOutcome::ChannelLost(reason) => {
                    warn!("Session {} lost its channel: {}", snapshot.id, reason);
                    RecapContent::failure(&format!("the call disconnected ({})", reason))
                }
            }
        };

        let record = SessionRecap {
            session_id: snapshot.id.clone(),
            persona: snapshot.persona,
            kind: snapshot.kind,
            started_at: snapshot.started_at,
            duration: format_call_duration(snapshot.started_at, ended_at),
            transcript: snapshot.transcript,
            content,
        };

        let save_result = self.store.save_completed_session(&record);

        // The session is single-use; clear it whether or not the store
        // accepted the record.
        *self.current.lock().unwrap() = None;
        info!("Session {} closed", snapshot.id);

        if let Err(err) = &save_result {
            warn!("Failed to persist session {}: {}", snapshot.id, err);
        }
        save_result
    }

    /// Tear the session down without a recap. Meant for Pending/early-Active
    /// sessions; discarding a non-empty transcript is logged.
    pub fn cancel(&self) -> bool {
        let taken = self.current.lock().unwrap().take();
        match taken {
            Some(session) => {
                if !session.transcript.is_empty() {
                    warn!(
                        "Cancelling session {} discards {} transcript turns",
                        session.id,
                        session.transcript.len()
                    );
                }
                info!("Session {} cancelled", session.id);
                true
            }
            None => false,
        }
    }
}

fn format_call_duration(started_at: Option<DateTime<Utc>>, ended_at: DateTime<Utc>) -> String {
    let Some(started_at) = started_at else {
        return "0m 0s".to_string();
    };
    let ms = (ended_at - started_at).num_milliseconds().max(0);
    format!("{}m {}s", ms / 60_000, ((ms % 60_000) as f64 / 1000.0).round())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemorySessionStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRecap {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubRecap {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl RecapGenerator for StubRecap {
        async fn generate_recap(
            &self,
            _transcript: &[TranscriptTurn],
            _persona: &PersonaProfile,
        ) -> Result<RecapContent, LiveCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(LiveCallError::Recap("provider unavailable".into()))
            } else {
                let mut content = RecapContent::default();
                content.conversation_summary = "A short practice chat.".into();
                Ok(content)
            }
        }
    }

    fn persona() -> PersonaProfile {
        PersonaProfile {
            id: "sofia_es".into(),
            name: "Sofía".into(),
            language: "Spanish".into(),
            language_code: Some("es-ES".into()),
            voice_name: Some("Puck".into()),
            greeting_call: None,
        }
    }

    fn manager(fail_recap: bool) -> (Arc<SessionManager>, Arc<StubRecap>, Arc<MemorySessionStore>) {
        let recap = StubRecap::new(fail_recap);
        let store = Arc::new(MemorySessionStore::new());
        let manager = Arc::new(SessionManager::new(recap.clone(), store.clone()));
        (manager, recap, store)
    }

    #[test]
    fn test_second_begin_rejected() {
        let (manager, _, _) = manager(false);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        let err = manager.begin(persona(), SessionKind::DirectCall).unwrap_err();
        assert!(matches!(err, LiveCallError::CallAlreadyActive));
        // The existing session is untouched
        assert_eq!(manager.state(), Some(SessionState::Pending));
    }

    #[test]
    fn test_session_id_format() {
        let (manager, _, _) = manager(false);
        let id = manager.begin(persona(), SessionKind::VoiceChat).unwrap();
        assert!(id.starts_with("sofia_es_voice_chat_"));
    }

    #[test]
    fn test_add_turn_without_session_is_noop() {
        let (manager, _, _) = manager(false);
        manager.add_turn(Speaker::UserSpoken, "hello", TurnType::Message);
        assert_eq!(manager.transcript_len(), 0);
    }

    #[test]
    fn test_mark_started_transitions_once() {
        let (manager, _, _) = manager(false);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        assert!(manager.mark_started());
        assert_eq!(manager.state(), Some(SessionState::Active));
        // Second call keeps it active
        assert!(manager.mark_started());
    }

    #[tokio::test]
    async fn test_empty_transcript_skips_recap_collaborator() {
        let (manager, recap, store) = manager(false);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        manager.mark_started();
        manager.finalize(CallOutcome::Completed).await.unwrap();

        assert_eq!(recap.calls.load(Ordering::SeqCst), 0);
        let saved = store.sessions();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].transcript.is_empty());
        assert!(saved[0]
            .content
            .conversation_summary
            .contains("No conversation took place"));
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_recap_failure_still_closes_and_persists() {
        let (manager, recap, store) = manager(true);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        manager.mark_started();
        manager.add_turn(Speaker::UserSpoken, "hola", TurnType::Message);
        manager.add_turn(Speaker::AiSpoken, "¡Hola! ¿Qué tal?", TurnType::Message);
        manager.finalize(CallOutcome::Completed).await.unwrap();

        assert_eq!(recap.calls.load(Ordering::SeqCst), 1);
        let saved = store.sessions();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].transcript.len(), 2);
        assert!(saved[0]
            .content
            .conversation_summary
            .contains("Debrief generation failed"));
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_channel_lost_skips_recap_collaborator() {
        let (manager, recap, store) = manager(false);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        manager.mark_started();
        manager.add_turn(Speaker::UserSpoken, "hola", TurnType::Message);
        manager
            .finalize(CallOutcome::ChannelLost("socket dropped".into()))
            .await
            .unwrap();

        assert_eq!(recap.calls.load(Ordering::SeqCst), 0);
        let saved = store.sessions();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].content.conversation_summary.contains("socket dropped"));
        assert_eq!(saved[0].transcript.len(), 1);
    }

    #[tokio::test]
    async fn test_successful_finalize() {
        let (manager, _, store) = manager(false);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        manager.mark_started();
        manager.add_turn(Speaker::UserSpoken, "hola", TurnType::Message);
        manager.finalize(CallOutcome::Completed).await.unwrap();

        let saved = store.sessions();
        assert_eq!(saved[0].content.conversation_summary, "A short practice chat.");
        assert!(saved[0].duration.ends_with('s'));
    }

    #[tokio::test]
    async fn test_double_finalize_persists_once() {
        let (manager, _, store) = manager(false);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        manager.mark_started();
        manager.finalize(CallOutcome::Completed).await.unwrap();
        manager.finalize(CallOutcome::Completed).await.unwrap();
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn test_cancel_discards_without_persisting() {
        let (manager, _, store) = manager(false);
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
        assert!(manager.cancel());
        assert!(store.sessions().is_empty());
        assert!(!manager.is_active());
        // A new session can start after cancel
        manager.begin(persona(), SessionKind::DirectCall).unwrap();
    }

    #[test]
    fn test_duration_formatting() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(185_400);
        assert_eq!(format_call_duration(Some(start), end), "3m 5s");
        assert_eq!(format_call_duration(None, end), "0m 0s");
    }
}
