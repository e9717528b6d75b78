//! Audio playback for TTS media and chimes
//!
//! Reference [`AudioOutput`] implementation: fetches media over HTTP (or from
//! disk), decodes MP3 or WAV, and plays through the default cpal output
//! device. Playback runs on background tasks; completion always fires the
//! [`DoneSignal`], including on fetch or decode failure, so the session never
//! hangs on a broken URL.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;

use crate::voice::audio::{AudioOutput, Chime, DoneSignal};
use crate::{Error, Result};

/// Gain applied to media playback while ducked
const DUCK_GAIN: f32 = 0.4;

/// Local chime sound file locations
#[derive(Debug, Clone, Default)]
pub struct ChimePaths {
    pub wake: Option<PathBuf>,
    pub exit: Option<PathBuf>,
    pub timer_finished: Option<PathBuf>,
}

impl ChimePaths {
    fn resolve(&self, chime: Chime) -> Option<&PathBuf> {
        match chime {
            Chime::Wake => self.wake.as_ref(),
            Chime::Exit => self.exit.as_ref(),
            Chime::TimerFinished => self.timer_finished.as_ref(),
        }
    }
}

/// Plays media and chimes on the default output device
pub struct CpalOutput {
    chimes: ChimePaths,
    http: reqwest::Client,
    /// Cancel flag of the playback currently in flight
    cancel: Mutex<Arc<AtomicBool>>,
    /// Current gain as f32 bits (ducking attenuates our own output)
    gain: Arc<AtomicU32>,
}

impl CpalOutput {
    /// Create an output backed by the default device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(chimes: ChimePaths) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio output initialized"
        );

        Ok(Self {
            chimes,
            http: reqwest::Client::new(),
            cancel: Mutex::new(Arc::new(AtomicBool::new(false))),
            gain: Arc::new(AtomicU32::new(1.0f32.to_bits())),
        })
    }

    /// Cancel the in-flight playback and install a fresh flag for the next.
    fn supersede(&self) -> Arc<AtomicBool> {
        let fresh = Arc::new(AtomicBool::new(false));
        let mut current = self.cancel.lock().unwrap();
        current.store(true, Ordering::SeqCst);
        *current = Arc::clone(&fresh);
        fresh
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn init(&self) {
        // The device handle is opened per playback; nothing to warm up, but
        // ducking from this point keeps focus behavior consistent
        tracing::trace!("audio output init");
    }

    async fn play(&self, urls: Vec<String>, done: DoneSignal) {
        let cancel = self.supersede();
        let gain = Arc::clone(&self.gain);
        let http = self.http.clone();

        tokio::spawn(async move {
            for url in urls {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                match fetch_bytes(&http, &url).await {
                    Ok(bytes) => {
                        if let Err(e) = play_media(bytes, &cancel, &gain).await {
                            tracing::warn!(url, error = %e, "media playback failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(url, error = %e, "media fetch failed");
                    }
                }
            }
            done.signal();
        });
    }

    async fn play_chime(&self, chime: Chime, done: DoneSignal) {
        let Some(path) = self.chimes.resolve(chime).cloned() else {
            tracing::trace!(?chime, "no chime configured");
            done.signal();
            return;
        };
        let cancel = self.supersede();
        let gain = Arc::clone(&self.gain);

        tokio::spawn(async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    if let Err(e) = play_media(bytes, &cancel, &gain).await {
                        tracing::warn!(path = %path.display(), error = %e, "chime playback failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "chime read failed");
                }
            }
            done.signal();
        });
    }

    async fn stop(&self) {
        self.cancel.lock().unwrap().store(true, Ordering::SeqCst);
    }

    async fn duck(&self) {
        self.gain.store(DUCK_GAIN.to_bits(), Ordering::SeqCst);
    }

    async fn unduck(&self) {
        self.gain.store(1.0f32.to_bits(), Ordering::SeqCst);
    }
}

async fn fetch_bytes(http: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let response = http.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    } else {
        Ok(tokio::fs::read(Path::new(url)).await?)
    }
}

/// Decode and play one media buffer, honoring the cancel flag.
async fn play_media(bytes: Vec<u8>, cancel: &Arc<AtomicBool>, gain: &Arc<AtomicU32>) -> Result<()> {
    let cancel = Arc::clone(cancel);
    let gain = Arc::clone(gain);
    tokio::task::spawn_blocking(move || {
        let (samples, sample_rate) = decode_media(&bytes)?;
        play_samples_blocking(&samples, sample_rate, &cancel, &gain)
    })
    .await
    .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
}

/// Decode WAV (RIFF magic) or MP3 bytes to mono f32 samples.
fn decode_media(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .filter_map(std::result::Result::ok)
            .map(|s| f32::from(s) / 32768.0)
            .collect(),
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .filter_map(std::result::Result::ok)
            .collect(),
    };

    // Mix down to mono
    let mono: Vec<f32> = samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, spec.sample_rate))
}

fn decode_mp3(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                #[allow(clippy::cast_sign_loss)]
                if sample_rate == 0 {
                    sample_rate = frame.sample_rate as u32;
                }
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("empty media stream".to_string()));
    }
    Ok((samples, sample_rate))
}

/// Push samples through the default output device, blocking until done or
/// cancelled.
fn play_samples_blocking(
    samples: &[f32],
    sample_rate: u32,
    cancel: &Arc<AtomicBool>,
    gain: &Arc<AtomicU32>,
) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() <= 2
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels);

    let samples = Arc::new(samples.to_vec());
    let position = Arc::new(Mutex::new(0usize));
    let finished = Arc::new(AtomicBool::new(false));

    let cb_samples = Arc::clone(&samples);
    let cb_position = Arc::clone(&position);
    let cb_finished = Arc::clone(&finished);
    let cb_gain = Arc::clone(gain);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = cb_position.lock().unwrap();
                let gain = f32::from_bits(cb_gain.load(Ordering::SeqCst));

                for frame in data.chunks_mut(channels) {
                    let sample = if *pos < cb_samples.len() {
                        let s = cb_samples[*pos] * gain;
                        *pos += 1;
                        s
                    } else {
                        cb_finished.store(true, Ordering::SeqCst);
                        0.0
                    };
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = samples.len() as u64 * 1000 / u64::from(sample_rate);
    let deadline =
        std::time::Instant::now() + std::time::Duration::from_millis(duration_ms + 1000);

    while !finished.load(Ordering::SeqCst) && !cancel.load(Ordering::SeqCst) {
        if std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!(samples = samples.len(), "playback finished");
    Ok(())
}
