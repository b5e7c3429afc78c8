//! Microphone capture.
//!
//! A dedicated thread owns the cpal input stream (streams are not `Send`)
//! and every hardware block runs the same pipeline: mute check, mono fold,
//! per-block resample to the channel's target rate, PCM16 quantization,
//! send. The channel send happens inside the capture callback, so a
//! blocking send would backpressure the callback itself. That is
//! acceptable under the realtime-audio callback model, and the channel
//! contract forbids blocking anyway.

use super::resampler::{quantize_pcm16, BlockResampler};
use super::utils::{convert_to_mono, save_wav_file};
use super::{CaptureErrorCallback, MicrophoneInput};
use crate::channel::RealtimeChannel;
use crate::error::LiveCallError;
use crate::settings::CallSettings;
use chrono::Utc;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

struct InputStreamHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for InputStreamHandle {
    fn drop(&mut self) {
        // Signal the stream thread to stop
        let _ = self.stop_tx.send(());
    }
}

/// Microphone capture over a cpal device.
pub struct CpalMicInput {
    muted: Arc<AtomicBool>,
    target_rate: u32,
    block_size: u32,
    selected_device: Option<String>,
    debug_audio_dir: Option<PathBuf>,
    stream: Mutex<Option<InputStreamHandle>>,
}

impl CpalMicInput {
    pub fn new(settings: &CallSettings, muted: Arc<AtomicBool>) -> Self {
        Self {
            muted,
            target_rate: settings.mic_target_sample_rate,
            block_size: settings.capture_block_size,
            selected_device: settings.selected_microphone.clone(),
            debug_audio_dir: settings.debug_audio_dir.clone(),
            stream: Mutex::new(None),
        }
    }
}

/// One captured block through the outbound pipeline. Returns the resampled
/// block when a frame was sent, `None` when the block was discarded (muted
/// or degenerate).
fn process_capture_block(
    block: &[f32],
    channels: usize,
    resampler: &BlockResampler,
    muted: &AtomicBool,
    channel: &Arc<dyn RealtimeChannel>,
) -> Result<Option<Vec<f32>>, LiveCallError> {
    if muted.load(Ordering::SeqCst) {
        return Ok(None);
    }

    let mono = convert_to_mono(block, channels);
    let resampled = resampler.process(&mono);
    if resampled.is_empty() {
        return Ok(None);
    }

    let frame = quantize_pcm16(&resampled);
    channel.send_audio_frame(&frame)?;
    Ok(Some(resampled))
}

fn classify_build_error(err: &cpal::BuildStreamError) -> LiveCallError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => LiveCallError::Permission(
            "input device not available (access denied or device removed)".to_string(),
        ),
        cpal::BuildStreamError::StreamConfigNotSupported => {
            LiveCallError::Unsupported("input stream config not supported".to_string())
        }
        other => {
            let message = other.to_string();
            if message.to_lowercase().contains("denied")
                || message.to_lowercase().contains("permission")
            {
                LiveCallError::Permission(message)
            } else {
                LiveCallError::Capture(message)
            }
        }
    }
}

fn build_input_stream<T, F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    on_block: F,
) -> Result<cpal::Stream, LiveCallError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
    F: Fn(&[f32]) + Send + 'static,
{
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let block: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                on_block(&block);
            },
            |err| error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| classify_build_error(&e))?;

    stream
        .play()
        .map_err(|e| LiveCallError::Capture(format!("failed to start input stream: {}", e)))?;
    Ok(stream)
}

fn build_for_format<F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    on_block: F,
) -> Result<cpal::Stream, LiveCallError>
where
    F: Fn(&[f32]) + Send + 'static,
{
    match format {
        cpal::SampleFormat::F32 => build_input_stream::<f32, F>(device, config, on_block),
        cpal::SampleFormat::I16 => build_input_stream::<i16, F>(device, config, on_block),
        cpal::SampleFormat::U16 => build_input_stream::<u16, F>(device, config, on_block),
        other => Err(LiveCallError::Unsupported(format!(
            "input sample format {:?}",
            other
        ))),
    }
}

impl MicrophoneInput for CpalMicInput {
    fn start_capture(
        &self,
        channel: Arc<dyn RealtimeChannel>,
        on_error: CaptureErrorCallback,
    ) -> Result<(), LiveCallError> {
        let mut stream_guard = self.stream.lock().unwrap();
        if stream_guard.is_some() {
            debug!("Microphone capture already running");
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, LiveCallError>>();

        let muted = self.muted.clone();
        let target_rate = self.target_rate;
        let block_size = self.block_size;
        let device_name = self.selected_device.clone();
        let debug_dir = self.debug_audio_dir.clone();

        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let device = match device_name {
                Some(name) => host
                    .input_devices()
                    .ok()
                    .and_then(|mut devices| {
                        devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    })
                    .or_else(|| host.default_input_device()),
                None => host.default_input_device(),
            };
            let Some(device) = device else {
                let _ = ready_tx.send(Err(LiveCallError::Unsupported(
                    "no audio input device".to_string(),
                )));
                return;
            };

            let supported_configs: Vec<_> = match device.supported_input_configs() {
                Ok(configs) => configs.collect(),
                Err(e) => {
                    let _ = ready_tx.send(Err(LiveCallError::Unsupported(format!(
                        "failed to query input configs: {}",
                        e
                    ))));
                    return;
                }
            };

            let supported = supported_configs
                .iter()
                .filter(|c| c.channels() <= 2)
                .find(|c| c.sample_format() == cpal::SampleFormat::F32)
                .or_else(|| supported_configs.iter().find(|c| c.channels() <= 2));
            let Some(supported) = supported else {
                let _ = ready_tx.send(Err(LiveCallError::Unsupported(
                    "no usable input config".to_string(),
                )));
                return;
            };

            // Capture at the device's preferred rate; the per-block
            // resampler brings it to the target rate.
            let desired = cpal::SampleRate(target_rate);
            let sample_rate = if supported.min_sample_rate() <= desired
                && desired <= supported.max_sample_rate()
            {
                desired
            } else {
                supported.max_sample_rate()
            };
            let channels = supported.channels() as usize;
            let sample_format = supported.sample_format();
            let config = cpal::StreamConfig {
                channels: supported.channels(),
                sample_rate,
                buffer_size: cpal::BufferSize::Fixed(block_size),
            };
            let native_rate = sample_rate.0;
            if native_rate != target_rate {
                warn!(
                    "Mic capturing at {} Hz, resampling to {} Hz per block",
                    native_rate, target_rate
                );
            }

            let resampler = Arc::new(BlockResampler::new(native_rate, target_rate));
            let dump_buffer = debug_dir
                .as_ref()
                .map(|_| Arc::new(Mutex::new(Vec::<f32>::new())));
            let error_reported = Arc::new(AtomicBool::new(false));
            let on_error = Arc::new(on_error);

            let on_block = {
                let resampler = resampler.clone();
                let dump_buffer = dump_buffer.clone();
                let error_reported = error_reported.clone();
                let on_error = on_error.clone();
                move |block: &[f32]| {
                    if error_reported.load(Ordering::SeqCst) {
                        return;
                    }
                    match process_capture_block(block, channels, &resampler, &muted, &channel) {
                        Ok(Some(resampled)) => {
                            if let Some(buffer) = &dump_buffer {
                                buffer.lock().unwrap().extend_from_slice(&resampled);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            // Report once; the session layer stops capture.
                            if !error_reported.swap(true, Ordering::SeqCst) {
                                error!("Capture pipeline error: {}", err);
                                (on_error.as_ref())(err);
                            }
                        }
                    }
                }
            };

            // Some backends reject fixed buffer sizes; retry with the
            // device default before giving up.
            let build_result = build_for_format(&device, &config, sample_format, on_block.clone())
                .or_else(|first_err| match first_err {
                    LiveCallError::Unsupported(_) | LiveCallError::Permission(_) => Err(first_err),
                    _ => {
                        debug!(
                            "Fixed capture block size rejected ({}), retrying with default",
                            first_err
                        );
                        let fallback = cpal::StreamConfig {
                            buffer_size: cpal::BufferSize::Default,
                            ..config
                        };
                        build_for_format(&device, &fallback, sample_format, on_block)
                    }
                });

            let _stream = match build_result {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(native_rate));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            // Hold the stream until stop_capture signals us.
            let _ = stop_rx.recv();

            if let (Some(dir), Some(buffer)) = (debug_dir, dump_buffer) {
                let samples = buffer.lock().unwrap();
                if !samples.is_empty() {
                    let path = dir.join(format!("mic-{}.wav", Utc::now().timestamp_millis()));
                    if let Err(e) = save_wav_file(&path, &samples, target_rate) {
                        warn!("Failed to dump capture audio: {}", e);
                    }
                }
            }
        });

        match ready_rx.recv() {
            Ok(Ok(rate)) => {
                info!("Microphone capture started at {} Hz", rate);
                *stream_guard = Some(InputStreamHandle {
                    stop_tx,
                    thread: Some(thread),
                });
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LiveCallError::Capture(
                "audio capture thread failed to start".to_string(),
            )),
        }
    }

    fn stop_capture(&self) {
        let handle = self.stream.lock().unwrap().take();
        match handle {
            Some(mut handle) => {
                let _ = handle.stop_tx.send(());
                if let Some(thread) = handle.thread.take() {
                    let _ = thread.join();
                }
                info!("Microphone capture stopped");
            }
            None => {
                // Stop paths are reachable from several error branches;
                // a second call is tolerated.
                debug!("stop_capture called but capture was not running");
            }
        }
    }
}
