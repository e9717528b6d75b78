//! Speech gate: hysteresis over per-frame speech probabilities
//!
//! Converts the raw probability stream from a VAD model into discrete
//! start/end events. A candidate run must stay on one side of the threshold
//! for a minimum duration before the gate flips; any sample that crosses back
//! early resets the candidate timer.

use std::time::{Duration, Instant};

/// Default probability threshold for speech
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// How long the probability must stay above threshold to confirm speech
pub const MIN_SPEECH_DURATION: Duration = Duration::from_millis(60);

/// How long the probability must stay below threshold to confirm silence
pub const MIN_SILENCE_DURATION: Duration = Duration::from_millis(800);

/// Discrete outcome of one gate step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// No state change
    None,
    /// Speech confirmed
    Start,
    /// Silence confirmed after speech
    End,
}

/// Stateful speech start/end detector
#[derive(Debug)]
pub struct SpeechGate {
    threshold: f32,
    min_speech: Duration,
    min_silence: Duration,
    speaking: bool,
    speech_started: Option<Instant>,
    silence_started: Option<Instant>,
    detected_this_session: bool,
}

impl SpeechGate {
    /// Create a gate with the given threshold and default timings.
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self::with_timings(threshold, MIN_SPEECH_DURATION, MIN_SILENCE_DURATION)
    }

    /// Create a gate with explicit timings.
    #[must_use]
    pub const fn with_timings(threshold: f32, min_speech: Duration, min_silence: Duration) -> Self {
        Self {
            threshold,
            min_speech,
            min_silence,
            speaking: false,
            speech_started: None,
            silence_started: None,
            detected_this_session: false,
        }
    }

    /// Whether speech has been confirmed since the last [`reset`](Self::reset).
    #[must_use]
    pub const fn has_detected_speech(&self) -> bool {
        self.detected_this_session
    }

    /// Clear all timers and flags. Must be called at the start of every new
    /// turn so no state carries across turns.
    pub const fn reset(&mut self) {
        self.speaking = false;
        self.detected_this_session = false;
        self.speech_started = None;
        self.silence_started = None;
    }

    /// Process one probability sample against the current time.
    pub fn process(&mut self, probability: f32) -> GateAction {
        self.process_at(probability, Instant::now())
    }

    /// Process one probability sample at an explicit instant.
    pub fn process_at(&mut self, probability: f32, now: Instant) -> GateAction {
        if probability >= self.threshold {
            if self.speaking {
                // Continuing speech, drop any candidate silence run
                self.silence_started = None;
            } else {
                match self.speech_started {
                    None => self.speech_started = Some(now),
                    Some(started) if now.duration_since(started) >= self.min_speech => {
                        self.speaking = true;
                        self.detected_this_session = true;
                        self.silence_started = None;
                        return GateAction::Start;
                    }
                    Some(_) => {}
                }
            }
        } else if self.speaking {
            match self.silence_started {
                None => self.silence_started = Some(now),
                Some(started) if now.duration_since(started) >= self.min_silence => {
                    self.speaking = false;
                    self.speech_started = None;
                    return GateAction::End;
                }
                Some(_) => {}
            }
        } else {
            // Candidate speech run broken before it was confirmed
            self.speech_started = None;
        }

        GateAction::None
    }
}

impl Default for SpeechGate {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}
