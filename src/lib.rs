//! Live voice call pipeline for a language-practice app.
//!
//! The crate captures the user's microphone, streams it to an opaque
//! realtime conversational channel, plays the AI's streamed audio back
//! gapless with barge-in support, coordinates interleaved transcription
//! fragments into a durable transcript, and manages the session lifecycle
//! through recap generation and persistence.
//!
//! [`LiveCallHandler`] is the entry point; everything it needs (the
//! channel connector, the recap generator, the session store, and
//! optionally the audio endpoints) is injected at composition time.

pub mod audio_toolkit;
pub mod channel;
pub mod error;
pub mod history;
pub mod llm_client;
pub mod recap;
pub mod session;
pub mod settings;

pub use channel::{
    build_system_instruction, AudioFormatHint, ChannelConnector, ChannelEvent,
    ChannelEventReceiver, RealtimeChannel, TextDirection,
};
pub use error::LiveCallError;
pub use history::{JsonSessionStore, MemorySessionStore, SessionStore};
pub use recap::{LlmRecapService, RecapContent, RecapGenerator, SessionRecap};
pub use session::{
    LiveCallHandler, PersonaProfile, SessionKind, SessionManager, SessionState, Speaker,
    TranscriptTurn, TurnType, UiNotifier,
};
pub use settings::{CallSettings, RecapProvider};
