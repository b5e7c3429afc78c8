//! Realtime channel abstraction.
//!
//! The live call core never speaks a vendor wire protocol. It consumes an
//! opaque bidirectional connection through the traits below and receives
//! inbound traffic as typed [`ChannelEvent`]s over a tokio channel.

use crate::error::LiveCallError;
use crate::session::PersonaProfile;
use crate::settings::CallSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Direction of a transcription fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextDirection {
    User,
    Ai,
}

/// Format hint accompanying an inbound audio chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormatHint {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormatHint {
    /// Mono PCM16 at the given rate.
    pub fn pcm(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Parse a MIME-style hint such as `audio/pcm;rate=24000`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mut rate = None;
        for part in mime.split(';').skip(1) {
            if let Some(value) = part.trim().strip_prefix("rate=") {
                rate = value.trim().parse::<u32>().ok();
            }
        }
        rate.map(Self::pcm)
    }
}

/// Events emitted by a realtime channel implementation.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The connection is open and the model is ready for audio.
    Opened,
    /// One chunk of AI audio, ready for scheduling. A missing format hint
    /// means the configured nominal playback rate applies.
    AudioChunk {
        bytes: Vec<u8>,
        format: Option<AudioFormatHint>,
    },
    /// One transcription fragment of user speech or AI speech.
    TextFragment {
        text: String,
        is_final: bool,
        direction: TextDirection,
    },
    /// The user barged in; the model cancelled the rest of its utterance.
    Interrupted,
    /// The connection closed. `clean` distinguishes an orderly close from a
    /// dropped one.
    Closed {
        clean: bool,
        reason: Option<String>,
    },
    /// The channel failed mid-session.
    Error(String),
}

/// Outbound half of the realtime connection.
pub trait RealtimeChannel: Send + Sync {
    /// Stream one mic frame (mono PCM16 at the configured target rate).
    /// Called from the audio capture callback; must not block.
    fn send_audio_frame(&self, pcm: &[u8]) -> Result<(), LiveCallError>;

    /// Send typed text into the conversation.
    fn send_text(&self, text: &str) -> Result<(), LiveCallError>;

    /// Tell the model the user's audio stream paused (mic muted).
    fn signal_audio_stream_end(&self);

    /// Close the connection. Implementations emit `Closed` once done.
    fn close(&self);
}

pub type ChannelEventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Opens realtime connections for new calls.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(
        &self,
        persona: &PersonaProfile,
        settings: &CallSettings,
    ) -> Result<(Arc<dyn RealtimeChannel>, ChannelEventReceiver), LiveCallError>;
}

/// Render a persona snapshot into the system instruction a channel
/// implementation hands to the model at connect time.
pub fn build_system_instruction(persona: &PersonaProfile) -> String {
    let mut instruction = format!(
        "You are {}, primarily speaking {}.",
        persona.name, persona.language
    );
    instruction.push_str(&format!(
        " Engage the user in natural conversation in {} and primarily respond in {}.",
        persona.language, persona.language
    ));
    instruction.push_str(
        " Keep responses conversational. DO NOT mention being an AI, model, or program. Act human.",
    );
    instruction
}
