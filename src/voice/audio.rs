//! Audio output interface
//!
//! The session and pipeline drive playback through [`AudioOutput`] and learn
//! about completion through a [`DoneSignal`] posted back onto the session
//! event queue. Implementations must signal completion even when playback
//! fails, otherwise the turn would never end.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::voice::satellite::{PlaybackKind, SessionEvent};

/// Locally stored feedback sounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chime {
    /// Played when a wake word triggers a fresh turn
    Wake,
    /// Played when a conversation is stopped locally
    Exit,
    /// Looped while a hub timer is ringing
    TimerFinished,
}

/// One-shot playback completion notifier
///
/// Consumes itself on [`signal`](Self::signal), so a completion can fire at
/// most once per playback request.
#[derive(Debug)]
pub struct DoneSignal {
    events: UnboundedSender<SessionEvent>,
    kind: PlaybackKind,
}

impl DoneSignal {
    /// Create a signal that posts `kind` to the session queue on completion.
    #[must_use]
    pub const fn new(events: UnboundedSender<SessionEvent>, kind: PlaybackKind) -> Self {
        Self { events, kind }
    }

    /// Report playback completion. Send failures mean the session is gone
    /// and are ignored.
    pub fn signal(self) {
        let _ = self.events.send(SessionEvent::PlaybackDone(self.kind));
    }
}

/// Playback capability consumed by the conversation core
///
/// A single shared resource: the session guarantees at most one active
/// playback request in flight, stopping the previous one before starting new
/// output.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Acquire the output device early so later playback does not fight for
    /// focus. Idempotent.
    async fn init(&self);

    /// Play the given media URLs in order, then fire `done`.
    async fn play(&self, urls: Vec<String>, done: DoneSignal);

    /// Play a local chime, then fire `done`.
    async fn play_chime(&self, chime: Chime, done: DoneSignal);

    /// Stop any in-flight playback. The interrupted playback still fires its
    /// completion signal.
    async fn stop(&self);

    /// Attenuate background audio while the satellite is listening.
    async fn duck(&self);

    /// Restore background audio volume.
    async fn unduck(&self);
}
