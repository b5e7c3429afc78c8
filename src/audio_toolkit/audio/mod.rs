// Re-export all audio components
pub mod capture;
pub mod playback;
pub mod resampler;
pub mod utils;

pub use capture::CpalMicInput;
pub use playback::{CpalSpeakerOutput, PlaybackScheduler};
pub use resampler::{decode_pcm16, quantize_pcm16, BlockResampler};

use crate::channel::RealtimeChannel;
use crate::error::LiveCallError;
use std::sync::Arc;

/// Callback invoked when capture fails mid-stream. The session layer
/// decides what to do with the call; capture itself only stops.
pub type CaptureErrorCallback = Box<dyn Fn(LiveCallError) + Send + Sync>;

/// Microphone side of the call: continuously captures, resamples and
/// streams frames to the realtime channel while unmuted.
pub trait MicrophoneInput: Send + Sync {
    /// Begin capturing. Frames go straight to `channel`; a mid-stream
    /// failure invokes `on_error` once and stops capture.
    fn start_capture(
        &self,
        channel: Arc<dyn RealtimeChannel>,
        on_error: CaptureErrorCallback,
    ) -> Result<(), LiveCallError>;

    /// Stop capturing and release the microphone. Idempotent; safe to call
    /// even if capture never started.
    fn stop_capture(&self);
}

/// Speaker side of the call: decodes and schedules inbound AI audio chunks
/// for gapless playback with barge-in support.
pub trait SpeakerOutput: Send + Sync {
    /// Decode and enqueue one chunk. Dropped silently while muted.
    fn enqueue_chunk(&self, bytes: &[u8], format: &crate::channel::AudioFormatHint);

    /// Discard all queued-but-unplayed chunks; what is currently sounding
    /// keeps playing.
    fn clear_queue(&self);

    /// Hard-stop whatever is currently sounding.
    fn stop_current(&self);

    /// Stop everything and tear down the output device. Idempotent.
    fn cleanup(&self);

    /// True when nothing is playing and nothing is queued.
    fn is_idle(&self) -> bool;
}
