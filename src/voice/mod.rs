//! Voice processing: gates, models, the turn pipeline and the session
//!
//! Raw microphone chunks flow through the wake/speech gates while the
//! satellite is idle, and into the active [`pipeline::TurnPipeline`] once a
//! turn is running. The [`satellite::SatelliteSession`] orchestrates both.

pub mod audio;
pub mod capture;
pub mod models;
pub mod pipeline;
pub mod playback;
pub mod satellite;
pub mod speech;
pub mod wake;

pub use audio::{AudioOutput, Chime, DoneSignal};
pub use pipeline::{TurnOutcome, TurnPipeline, TurnSignal, TurnState};
pub use satellite::{PlaybackKind, SatelliteSession, SessionEvent, SessionSettings, StopReason};
pub use speech::{GateAction, SpeechGate};
pub use wake::{WakeEdge, WakeGate, WakeKind, WakeWordBank, WakeWordMeta};

/// Sample rate all voice processing runs at
pub const SAMPLE_RATE: u32 = 16_000;

/// Convert a little-endian 16-bit PCM chunk into samples.
#[must_use]
pub fn pcm_to_samples(chunk: &[u8]) -> Vec<i16> {
    chunk
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_conversion_is_little_endian() {
        let samples = pcm_to_samples(&[0x01, 0x00, 0xff, 0x7f, 0x00, 0x80]);
        assert_eq!(samples, vec![1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn pcm_conversion_drops_trailing_odd_byte() {
        assert_eq!(pcm_to_samples(&[0x01, 0x00, 0x7f]), vec![1]);
    }
}
