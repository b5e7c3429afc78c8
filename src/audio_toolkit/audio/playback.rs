//! AI audio playback.
//!
//! Inbound audio arrives as independent chunks that must play back-to-back
//! with no audible seam, and must cut off instantly when the user barges
//! in. [`PlaybackScheduler`] keeps the scheduling state in sample time
//! against the output clock; [`CpalSpeakerOutput`] wraps it around a real
//! output device, rendering from inside the device callback so a stop takes
//! effect within one audio-graph tick.

use super::resampler::{decode_pcm16, resample_chunk};
use super::utils::convert_to_mono;
use super::SpeakerOutput;
use crate::channel::AudioFormatHint;
use crate::settings::CallSettings;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

struct ScheduledChunk {
    samples: Vec<f32>,
    /// Absolute start time on the output sample clock.
    start: u64,
}

struct ActiveChunk {
    samples: Vec<f32>,
    pos: usize,
}

/// Sample-clock scheduling core. Pure state; the device callback drives it.
pub struct PlaybackScheduler {
    queue: VecDeque<ScheduledChunk>,
    current: Option<ActiveChunk>,
    /// Samples rendered since the stream opened.
    clock: u64,
    /// Sample time the next enqueued chunk will be scheduled at.
    next_start: u64,
    /// Negative overlap applied between consecutive chunks.
    overlap: u64,
}

impl PlaybackScheduler {
    pub fn new(overlap_samples: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            clock: 0,
            next_start: 0,
            overlap: overlap_samples,
        }
    }

    /// Queue one decoded chunk. The first chunk (or a chunk arriving while
    /// idle) starts immediately; otherwise it is scheduled to begin when
    /// the previous chunk ends, minus the overlap tolerance.
    pub fn enqueue(&mut self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        let len = samples.len() as u64;
        let start = self.clock.max(self.next_start);
        self.next_start = start + len - self.overlap.min(len);
        self.queue.push_back(ScheduledChunk { samples, start });
    }

    /// Discard everything queued without touching what is sounding now.
    pub fn clear_queue(&mut self) {
        if !self.queue.is_empty() {
            debug!("Clearing {} queued playback chunks", self.queue.len());
        }
        self.queue.clear();
    }

    /// Hard-stop the chunk currently sounding. Queued chunks are untouched.
    pub fn stop_current(&mut self) {
        if self.current.take().is_some() {
            debug!("Stopped current playback chunk");
        }
        if self.queue.is_empty() {
            self.next_start = self.clock;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    fn promote_next(&mut self) {
        if self.current.is_some() {
            return;
        }
        if let Some(front) = self.queue.front() {
            if front.start <= self.clock {
                let chunk = self.queue.pop_front().unwrap();
                self.current = Some(ActiveChunk {
                    samples: chunk.samples,
                    pos: 0,
                });
            }
        }
    }

    /// Render into an interleaved output buffer, duplicating the mono
    /// signal across `channels`. Silence when idle.
    pub fn render(&mut self, output: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in output.chunks_mut(channels) {
            self.promote_next();
            let value = match self.current.as_mut() {
                Some(active) => {
                    let v = active.samples[active.pos];
                    active.pos += 1;
                    if active.pos >= active.samples.len() {
                        self.current = None;
                    }
                    v
                }
                None => 0.0,
            };
            for sample in frame.iter_mut() {
                *sample = value;
            }
            self.clock += 1;
        }
    }
}

struct OutputStreamHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for OutputStreamHandle {
    fn drop(&mut self) {
        // Signal the stream thread to stop
        let _ = self.stop_tx.send(());
    }
}

/// Speaker output over a cpal device. The stream opens lazily on the first
/// unmuted chunk and is torn down by `cleanup`.
pub struct CpalSpeakerOutput {
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    muted: Arc<AtomicBool>,
    stream: Mutex<Option<OutputStreamHandle>>,
    /// Device rate once the stream is open; 0 while closed.
    device_rate: AtomicU32,
    overlap_ms: u64,
    selected_device: Option<String>,
}

impl CpalSpeakerOutput {
    pub fn new(settings: &CallSettings, muted: Arc<AtomicBool>) -> Self {
        Self {
            scheduler: Arc::new(Mutex::new(PlaybackScheduler::new(0))),
            muted,
            stream: Mutex::new(None),
            device_rate: AtomicU32::new(0),
            overlap_ms: settings.playback_overlap_ms,
            selected_device: settings.selected_output_device.clone(),
        }
    }

    fn ensure_stream(&self) -> Result<u32, String> {
        let mut stream_guard = self.stream.lock().unwrap();
        if stream_guard.is_some() {
            return Ok(self.device_rate.load(Ordering::SeqCst));
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, String>>();
        let scheduler = self.scheduler.clone();
        let device_name = self.selected_device.clone();

        // The cpal stream is not Send; a dedicated thread owns it for the
        // lifetime of the call.
        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match device_name {
                Some(name) => host
                    .output_devices()
                    .ok()
                    .and_then(|mut devices| {
                        devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    })
                    .or_else(|| host.default_output_device()),
                None => host.default_output_device(),
            };
            let Some(device) = device else {
                let _ = ready_tx.send(Err("No audio output device".to_string()));
                return;
            };

            let supported = match device.default_output_config() {
                Ok(config) => config,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("No output config: {}", e)));
                    return;
                }
            };
            let sample_format = supported.sample_format();
            let config = supported.config();
            let sample_rate = config.sample_rate.0;
            let channels = config.channels as usize;

            let stream_result = match sample_format {
                cpal::SampleFormat::F32 => {
                    build_output_stream::<f32>(&device, &config, channels, scheduler)
                }
                cpal::SampleFormat::I16 => {
                    build_output_stream::<i16>(&device, &config, channels, scheduler)
                }
                cpal::SampleFormat::U16 => {
                    build_output_stream::<u16>(&device, &config, channels, scheduler)
                }
                other => Err(format!("Unsupported output sample format: {:?}", other)),
            };

            let _stream = match stream_result {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Keep the stream alive until cleanup signals us.
            let _ = stop_rx.recv();
        });

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err("Audio output thread failed to start".to_string()),
        };

        {
            let mut scheduler = self.scheduler.lock().unwrap();
            *scheduler = PlaybackScheduler::new(self.overlap_ms * sample_rate as u64 / 1000);
        }
        self.device_rate.store(sample_rate, Ordering::SeqCst);
        *stream_guard = Some(OutputStreamHandle {
            stop_tx,
            thread: Some(thread),
        });
        info!("Audio output stream open at {} Hz", sample_rate);
        Ok(sample_rate)
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                scheduler.lock().unwrap().render(&mut scratch, channels);
                for (out, &value) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(value);
                }
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {}", e))?;

    stream.play().map_err(|e| format!("Failed to start output stream: {}", e))?;
    Ok(stream)
}

impl SpeakerOutput for CpalSpeakerOutput {
    fn enqueue_chunk(&self, bytes: &[u8], format: &AudioFormatHint) {
        if self.muted.load(Ordering::SeqCst) {
            debug!("Speaker muted, dropping {} byte chunk", bytes.len());
            return;
        }
        if bytes.is_empty() {
            return;
        }

        let device_rate = match self.ensure_stream() {
            Ok(rate) => rate,
            Err(e) => {
                error!("Cannot play AI audio chunk: {}", e);
                return;
            }
        };

        let mut samples = decode_pcm16(bytes);
        if format.channels > 1 {
            samples = convert_to_mono(&samples, format.channels as usize);
        }
        if format.sample_rate != device_rate {
            match resample_chunk(&samples, format.sample_rate, device_rate) {
                Ok(resampled) => samples = resampled,
                Err(e) => {
                    error!("Failed to resample AI audio chunk: {}", e);
                    return;
                }
            }
        }

        self.scheduler.lock().unwrap().enqueue(samples);
    }

    fn clear_queue(&self) {
        self.scheduler.lock().unwrap().clear_queue();
    }

    fn stop_current(&self) {
        self.scheduler.lock().unwrap().stop_current();
    }

    fn cleanup(&self) {
        let handle = self.stream.lock().unwrap().take();
        match handle {
            Some(mut handle) => {
                let _ = handle.stop_tx.send(());
                if let Some(thread) = handle.thread.take() {
                    let _ = thread.join();
                }
                self.device_rate.store(0, Ordering::SeqCst);
                info!("Audio output torn down");
            }
            None => {
                // Cleanup paths are reachable from several error branches;
                // a second call is tolerated.
                warn!("Audio output cleanup called but no stream was open");
            }
        }
        *self.scheduler.lock().unwrap() = PlaybackScheduler::new(0);
    }

    fn is_idle(&self) -> bool {
        self.scheduler.lock().unwrap().is_idle()
    }
}
