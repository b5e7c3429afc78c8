// Re-export all audio components
pub mod audio;
pub mod text;

pub use audio::{
    CpalMicInput, CpalSpeakerOutput, MicrophoneInput, PlaybackScheduler, SpeakerOutput,
};
pub use text::sanitize_spoken_text;

/// Sample rate the realtime channel expects for outbound mic frames.
pub const MIC_TARGET_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of inbound AI audio when no format hint says otherwise.
pub const AI_OUTPUT_SAMPLE_RATE: u32 = 24_000;
