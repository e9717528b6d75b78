//! Probability model interfaces
//!
//! The neural VAD and keyword models are consumed as black boxes: one
//! probability in `[0, 1]` per fixed-size 16 kHz PCM frame. [`EnergyVad`] is
//! the built-in reference implementation based on RMS energy, for setups
//! without a neural model wired in.

/// Speech probability model (VAD)
pub trait SpeechModel: Send {
    /// Probability that the frame contains speech.
    fn predict(&mut self, samples: &[i16]) -> f32;

    /// Clear internal model state between turns.
    fn reset(&mut self) {}
}

/// Keyword probability model, one per configured phrase
pub trait WakeModel: Send {
    /// Probability that the phrase occurs in the recent audio.
    fn predict(&mut self, samples: &[i16]) -> f32;
}

/// Loads keyword model weights for configured phrases
///
/// The satellite core treats inference as a black box; an embedding
/// application supplies a provider backed by its inference runtime. Without
/// one, wake words are advertised to the hub but local detection is off and
/// turns start from hub-side triggers only.
pub trait WakeModelProvider: Send + Sync {
    /// Load the model described by `meta`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model weights cannot be loaded.
    fn load(&self, meta: &crate::voice::wake::WakeWordMeta) -> crate::Result<Box<dyn WakeModel>>;
}

/// RMS energy level (of full-scale) at which speech probability reaches 0.5
const SPEECH_ENERGY_REF: f32 = 0.03;

/// Energy-based speech model
///
/// Maps frame RMS energy linearly onto a probability, crossing 0.5 at
/// [`SPEECH_ENERGY_REF`]. Crude next to a neural VAD, but it drives the
/// speech gate with the same contract.
#[derive(Debug, Default)]
pub struct EnergyVad;

impl SpeechModel for EnergyVad {
    fn predict(&mut self, samples: &[i16]) -> f32 {
        (rms_energy(samples) / (2.0 * SPEECH_ENERGY_REF)).min(1.0)
    }
}

/// RMS energy of normalized samples
#[allow(clippy::cast_precision_loss)]
fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let normalized = f32::from(s) / 32768.0;
            normalized * normalized
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Scripted model for tests: replays a fixed probability sequence
#[derive(Debug)]
pub struct ScriptedModel {
    values: Vec<f32>,
    position: usize,
}

impl ScriptedModel {
    /// A model that always returns `value`.
    #[must_use]
    pub fn constant(value: f32) -> Self {
        Self {
            values: vec![value],
            position: 0,
        }
    }

    /// A model that replays `values`, repeating the last one when exhausted.
    #[must_use]
    pub fn sequence(values: Vec<f32>) -> Self {
        Self {
            values,
            position: 0,
        }
    }
}

impl SpeechModel for ScriptedModel {
    fn predict(&mut self, _samples: &[i16]) -> f32 {
        let value = self
            .values
            .get(self.position)
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(0.0);
        self.position += 1;
        value
    }
}

impl WakeModel for ScriptedModel {
    fn predict(&mut self, samples: &[i16]) -> f32 {
        SpeechModel::predict(self, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_has_low_probability() {
        let mut vad = EnergyVad;
        assert!(vad.predict(&[0; 512]) < 0.01);
    }

    #[test]
    fn loud_audio_has_high_probability() {
        let mut vad = EnergyVad;
        let loud = vec![16_000i16; 512];
        assert!(vad.predict(&loud) > 0.5);
    }

    #[test]
    fn scripted_model_repeats_last_value() {
        let mut model = ScriptedModel::sequence(vec![0.1, 0.9]);
        assert!((SpeechModel::predict(&mut model, &[]) - 0.1).abs() < f32::EPSILON);
        assert!((SpeechModel::predict(&mut model, &[]) - 0.9).abs() < f32::EPSILON);
        assert!((SpeechModel::predict(&mut model, &[]) - 0.9).abs() < f32::EPSILON);
    }
}
