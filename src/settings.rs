use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One entry in the recap provider fallback chain.
///
/// All providers speak the OpenAI-compatible chat completions protocol;
/// the recap service walks the chain in order until one succeeds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecapProvider {
    pub id: String,
    pub label: String,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
}

/// Tuning and device selection for a live call.
///
/// Every field has a serde default so partial configs deserialize cleanly.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CallSettings {
    /// Sample rate the realtime channel expects for mic frames (mono PCM16).
    #[serde(default = "default_mic_target_sample_rate")]
    pub mic_target_sample_rate: u32,

    /// Sample rate assumed for inbound AI audio when a chunk carries no
    /// format hint.
    #[serde(default = "default_playback_sample_rate")]
    pub playback_sample_rate: u32,

    /// Capture block size in samples, at the device's native rate.
    #[serde(default = "default_capture_block_size")]
    pub capture_block_size: u32,

    /// Debounce window for user speech transcription fragments.
    #[serde(default = "default_user_flush_delay_ms")]
    pub user_flush_delay_ms: u64,

    /// Debounce window for AI spoken-text fragments. Shorter than the user
    /// window: the AI stream signals sentence boundaries more eagerly.
    #[serde(default = "default_ai_flush_delay_ms")]
    pub ai_flush_delay_ms: u64,

    /// Negative overlap applied when chaining playback chunks, masking
    /// scheduling jitter without an audible gap.
    #[serde(default = "default_playback_overlap_ms")]
    pub playback_overlap_ms: u64,

    #[serde(default)]
    pub selected_microphone: Option<String>,

    #[serde(default)]
    pub selected_output_device: Option<String>,

    /// When set, the resampled capture stream of each call is dumped here
    /// as a WAV file.
    #[serde(default)]
    pub debug_audio_dir: Option<PathBuf>,

    #[serde(default)]
    pub recap_providers: Vec<RecapProvider>,
}

fn default_mic_target_sample_rate() -> u32 {
    crate::audio_toolkit::MIC_TARGET_SAMPLE_RATE
}

fn default_playback_sample_rate() -> u32 {
    crate::audio_toolkit::AI_OUTPUT_SAMPLE_RATE
}

fn default_capture_block_size() -> u32 {
    4096
}

fn default_user_flush_delay_ms() -> u64 {
    1500
}

fn default_ai_flush_delay_ms() -> u64 {
    800
}

fn default_playback_overlap_ms() -> u64 {
    15
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            mic_target_sample_rate: default_mic_target_sample_rate(),
            playback_sample_rate: default_playback_sample_rate(),
            capture_block_size: default_capture_block_size(),
            user_flush_delay_ms: default_user_flush_delay_ms(),
            ai_flush_delay_ms: default_ai_flush_delay_ms(),
            playback_overlap_ms: default_playback_overlap_ms(),
            selected_microphone: None,
            selected_output_device: None,
            debug_audio_dir: None,
            recap_providers: Vec::new(),
        }
    }
}

impl CallSettings {
    pub fn user_flush_delay(&self) -> Duration {
        Duration::from_millis(self.user_flush_delay_ms)
    }

    pub fn ai_flush_delay(&self) -> Duration {
        Duration::from_millis(self.ai_flush_delay_ms)
    }

    pub fn playback_overlap(&self) -> Duration {
        Duration::from_millis(self.playback_overlap_ms)
    }
}
