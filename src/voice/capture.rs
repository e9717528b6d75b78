//! Microphone capture
//!
//! Captures from the default input device at 16 kHz mono and posts fixed-size
//! PCM chunks onto the session event queue. Backpressure policy is the
//! source's: if the session is gone the stream just stops sending.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc::UnboundedSender;

use crate::voice::satellite::SessionEvent;
use crate::voice::SAMPLE_RATE;
use crate::{Error, Result};

/// Samples per chunk posted to the session (64 ms at 16 kHz)
pub const CHUNK_SAMPLES: usize = 1024;

/// Streams microphone chunks into a session event queue
pub struct MicCapture {
    stream: Option<Stream>,
}

impl MicCapture {
    /// Open the default input device and start capturing.
    ///
    /// # Errors
    ///
    /// Returns an error if no suitable input device or config is available.
    pub fn start(events: UnboundedSender<SessionEvent>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

        let config: StreamConfig = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "microphone capture starting"
        );

        let mut pending: Vec<u8> = Vec::with_capacity(CHUNK_SAMPLES * 2);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        #[allow(clippy::cast_possible_truncation)]
                        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        pending.extend_from_slice(&value.to_le_bytes());
                        if pending.len() == CHUNK_SAMPLES * 2 {
                            let chunk = std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(CHUNK_SAMPLES * 2),
                            );
                            if events.send(SessionEvent::MicAudio(chunk)).is_err() {
                                return;
                            }
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "microphone capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        tracing::debug!("microphone capture started");

        Ok(Self {
            stream: Some(stream),
        })
    }

    /// Stop capturing and release the device.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("microphone capture stopped");
        }
    }

    /// Whether the capture stream is live.
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
