//! Shared test utilities

use std::sync::Mutex;

use async_trait::async_trait;

use lark_satellite::protocol::api::{VoiceAssistantEvent, VoiceAssistantEventResponse};
use lark_satellite::voice::{AudioOutput, Chime, DoneSignal};

/// Audio output double that records requests and holds completion signals
/// until the test fires them.
#[derive(Default)]
pub struct FakeOutput {
    plays: Mutex<Vec<Vec<String>>>,
    chimes: Mutex<Vec<Chime>>,
    pending: Mutex<Vec<DoneSignal>>,
    stops: Mutex<usize>,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plays(&self) -> Vec<Vec<String>> {
        self.plays.lock().unwrap().clone()
    }

    pub fn chimes(&self) -> Vec<Chime> {
        self.chimes.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn stops(&self) -> usize {
        *self.stops.lock().unwrap()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Fire the oldest held completion signal.
    pub fn complete_next(&self) {
        let signal = self.pending.lock().unwrap().remove(0);
        signal.signal();
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn init(&self) {}

    async fn play(&self, urls: Vec<String>, done: DoneSignal) {
        self.plays.lock().unwrap().push(urls);
        self.pending.lock().unwrap().push(done);
    }

    async fn play_chime(&self, chime: Chime, done: DoneSignal) {
        self.chimes.lock().unwrap().push(chime);
        self.pending.lock().unwrap().push(done);
    }

    async fn stop(&self) {
        *self.stops.lock().unwrap() += 1;
    }

    async fn duck(&self) {}

    async fn unduck(&self) {}
}

/// Build a hub lifecycle event with `(name, value)` data pairs.
pub fn lifecycle_event(
    kind: VoiceAssistantEvent,
    data: &[(&str, &str)],
) -> VoiceAssistantEventResponse {
    VoiceAssistantEventResponse::new(kind, data)
}
