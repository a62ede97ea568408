//! Audio I/O
//!
//! Verwendet cpal für Cross-Platform Audio:
//! - Mikrofon-Capture (Mono, 48kHz) in einen Ring-Buffer
//! - Lautsprecher-Playback, das alle Anrufe zusammenmischt
//!
//! cpal-Streams sind nicht `Send`, deshalb lebt jeder auf einem eigenen
//! Thread, der bis `stop()` läuft. Das Enabled-Flag des `LocalStream`
//! entscheidet, ob Samples im Ring-Buffer landen (Mute).

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

pub const FRAME_DURATION: Duration = Duration::from_millis(20);

const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

/// Maximal gepuffertes Remote-Audio pro Anruf (200ms)
const MAX_PLAYBACK_FRAMES: usize = 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio thread terminated unexpectedly")]
    ThreadDied,
}

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

type SampleBuffer = Arc<Mutex<HeapRb<f32>>>;

/// Laufende Mikrofon-Aufnahme
pub struct MicrophoneCapture {
    capture_buffer: SampleBuffer,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneCapture {
    /// Öffnet das Standard-Mikrofon und startet die Aufnahme
    ///
    /// Kehrt erst zurück, wenn der Stream läuft oder der Aufbau fehlschlug.
    pub fn start(enabled: Arc<AtomicBool>) -> Result<Self, AudioError> {
        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let buffer = Arc::clone(&capture_buffer);
        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match Self::build_stream(buffer, enabled) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blockiert bis stop() oder Drop
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Microphone capture stopped");
            })
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                capture_buffer,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::ThreadDied),
        }
    }

    /// Stoppt die Aufnahme; weitere Aufrufe sind wirkungslos
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Lesezugriff auf die aufgenommenen Frames, z.B. für den Encoder-Task
    pub fn frames(&self) -> CaptureFrames {
        CaptureFrames {
            buffer: Arc::clone(&self.capture_buffer),
        }
    }

    fn build_stream(
        capture_buffer: SampleBuffer,
        enabled: Arc<AtomicBool>,
    ) -> Result<cpal::Stream, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect())?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if data.is_empty() || !enabled.load(Ordering::Relaxed) {
                        return;
                    }

                    // Downmix auf Mono
                    let mono: Vec<f32> = data
                        .chunks(channels.max(1))
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();

                    let samples = resample_linear(&mono, source_sample_rate, SAMPLE_RATE);

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(stream)
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MicrophoneCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneCapture")
            .field("running", &self.thread.is_some())
            .field("buffered", &self.capture_buffer.lock().occupied_len())
            .finish()
    }
}

/// Geteilter Lesezugriff auf den Capture-Buffer
#[derive(Clone)]
pub struct CaptureFrames {
    buffer: SampleBuffer,
}

impl CaptureFrames {
    /// Liest einen Frame, sobald genug Samples da sind
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }
}

// ============================================================================
// SPEAKER PLAYBACK
// ============================================================================

/// Puffer pro Quelle (Anruf), gemischt im Output-Callback
struct Mixer {
    sources: HashMap<Uuid, VecDeque<f32>>,
    capacity: usize,
}

impl Mixer {
    fn new(capacity: usize) -> Self {
        Self {
            sources: HashMap::new(),
            capacity,
        }
    }

    /// Hängt Samples an; bei Überlauf fallen die ältesten weg
    fn queue(&mut self, source: Uuid, samples: &[f32]) {
        let buffer = self.sources.entry(source).or_default();
        buffer.extend(samples.iter().copied());
        let overflow = buffer.len().saturating_sub(self.capacity);
        buffer.drain(..overflow);
    }

    fn remove(&mut self, source: &Uuid) {
        self.sources.remove(source);
    }

    /// Füllt einen interleaved Output-Buffer, Mono auf alle Kanäle
    fn fill(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            let mut mixed = 0.0f32;
            let mut has_audio = false;
            for buffer in self.sources.values_mut() {
                if let Some(sample) = buffer.pop_front() {
                    mixed += sample;
                    has_audio = true;
                }
            }
            let sample = if has_audio { soft_clip(mixed) } else { 0.0 };
            frame.fill(sample);
        }
    }
}

/// Sanfte Sättigung, wenn mehrere Sprecher summiert werden
fn soft_clip(sample: f32) -> f32 {
    (sample * 0.7).tanh() / 0.7_f32.tanh()
}

/// Laufendes Lautsprecher-Playback
pub struct SpeakerPlayback {
    mixer: Arc<Mutex<Mixer>>,
    output_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SpeakerPlayback {
    /// Öffnet den Standard-Lautsprecher
    ///
    /// Blockiert, bis der Stream läuft oder der Aufbau fehlschlug.
    pub fn start() -> Result<Self, AudioError> {
        let mixer = Arc::new(Mutex::new(Mixer::new(0)));

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let shared = Arc::clone(&mixer);
        let thread = std::thread::Builder::new()
            .name("speaker-playback".to_string())
            .spawn(move || {
                let (stream, rate) = match Self::build_stream(shared) {
                    Ok(started) => started,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rate));

                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Speaker playback stopped");
            })
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(output_rate)) => Ok(Self {
                mixer,
                output_rate,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::ThreadDied),
        }
    }

    /// Spielt dekodierte 48kHz-Samples einer Quelle ab
    pub fn queue(&self, source: Uuid, samples: &[f32]) {
        let samples = resample_linear(samples, SAMPLE_RATE, self.output_rate);
        self.mixer.lock().queue(source, &samples);
    }

    /// Verwirft den Puffer einer beendeten Quelle
    pub fn remove(&self, source: &Uuid) {
        self.mixer.lock().remove(source);
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn build_stream(mixer: Arc<Mutex<Mixer>>) -> Result<(cpal::Stream, u32), AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config: StreamConfig = select_best_config(configs.collect())?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let rate = config.sample_rate.0;
        let channels = config.channels as usize;
        let frame_at_rate = (FRAME_SIZE as u64 * rate as u64 / SAMPLE_RATE as u64) as usize;
        mixer.lock().capacity = frame_at_rate * MAX_PLAYBACK_FRAMES;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mixer.lock().fill(data, channels);
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok((stream, rate))
    }
}

impl Drop for SpeakerPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SpeakerPlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeakerPlayback")
            .field("output_rate", &self.output_rate)
            .field("sources", &self.mixer.lock().sources.len())
            .finish()
    }
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || data.is_empty() {
        return data.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Priorität: 48kHz > höchste Rate, F32 > andere
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32);

    for config in f32_configs.clone() {
        if config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
    }

    if let Some(config) = f32_configs.into_iter().next() {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 input configuration found".to_string(),
    ))
}
