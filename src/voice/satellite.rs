//! Satellite session: top-level conversation orchestration
//!
//! Owns zero-or-one active [`TurnPipeline`], applies wake/speech gate output
//! to decide when turns start and stop, and implements the continue
//! conversation looping policy. All mutation happens on a single event queue:
//! hub messages, microphone chunks, playback completions and timer firings
//! arrive as [`SessionEvent`]s and are processed strictly in order, so turn
//! state is never mutated concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::protocol::api::{
    VoiceAssistantAnnounceFinished, VoiceAssistantAnnounceRequest, VoiceAssistantTimerEvent,
    VoiceAssistantTimerEventResponse,
};
use crate::protocol::ApiMessage;
use crate::voice::audio::{AudioOutput, Chime, DoneSignal};
use crate::voice::models::SpeechModel;
use crate::voice::pcm_to_samples;
use crate::voice::pipeline::{TurnOutcome, TurnPipeline, TurnSignal, TurnState};
use crate::voice::speech::{GateAction, SpeechGate};
use crate::voice::wake::{WakeKind, WakeWordBank};

/// Ignore wake edges this soon after a stop (debounces overlapping windows)
pub const WAKE_COOLDOWN: Duration = Duration::from_secs(2);

/// Default listening timeout when the config does not set one
pub const DEFAULT_LISTENING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between a turn ending and the continuation turn starting, so the
/// tail of the played TTS is not captured as new input
const CONTINUATION_DELAY: Duration = Duration::from_millis(500);

/// Minimum turn duration before forced continuation is allowed to loop
const RAPID_FAILURE_GUARD: Duration = Duration::from_millis(500);

/// Gap between timer-finished chime repeats
const TIMER_CHIME_INTERVAL: Duration = Duration::from_secs(1);

/// Why a conversation stop was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Local user action
    Manual,
    /// Listening silence timeout elapsed
    Timeout,
    /// Stop word detected
    Keyword,
    /// The hub ended the session
    Server,
    /// A turn error forced the stop
    Error,
    /// Anything else
    Unknown,
}

/// Which playback a completion signal belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackKind {
    /// TTS response playback for the given turn
    Tts { turn: u64 },
    /// Wake chime preceding `start` for the given turn
    WakeChime { turn: u64 },
    /// Exit chime preceding teardown
    ExitChime,
    /// Announcement media playback
    Announcement { start_conversation: bool },
    /// One repetition of the timer-finished chime
    TimerChime,
}

/// Everything the session reacts to, multiplexed onto one ordered queue
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded message from the hub
    HubMessage(ApiMessage),
    /// One fixed-size microphone chunk (16 kHz mono i16 PCM, little endian)
    MicAudio(Vec<u8>),
    /// A playback request completed (or was stopped)
    PlaybackDone(PlaybackKind),
    /// The TTS playback safety timer fired
    TtsSafetyTimeout { turn: u64, token: u64 },
    /// The continuation delay elapsed; start the follow-up turn
    ContinueDelay { turn: u64 },
    /// Re-check whether the timer-finished chime should repeat
    TimerChimeRecheck,
    /// An external stop request (e.g. from the CLI or the hub)
    StopRequested(StopReason),
}

/// Session-level tunables sourced from the settings store
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Speech gate probability threshold
    pub vad_threshold: f32,
    /// Listening timeout while no speech has been detected
    pub silence_timeout: Duration,
    /// Always loop into a new turn after a successful one
    pub force_continuous_conversation: bool,
    /// Play the wake chime before a fresh (non-continuation) turn
    pub wake_chime_enabled: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            vad_threshold: crate::voice::speech::DEFAULT_THRESHOLD,
            silence_timeout: DEFAULT_LISTENING_TIMEOUT,
            force_continuous_conversation: false,
            wake_chime_enabled: true,
        }
    }
}

/// Session state as seen by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteState {
    /// Connected baseline: no turn in progress
    Idle,
    /// A turn is being created
    Waking,
    /// Microphone audio is streaming to the hub
    Listening,
    /// The hub is processing the utterance
    Processing,
    /// A response is being spoken
    Responding,
}

impl From<TurnState> for SatelliteState {
    fn from(state: TurnState) -> Self {
        match state {
            TurnState::Waking => Self::Waking,
            TurnState::Listening => Self::Listening,
            TurnState::Processing => Self::Processing,
            TurnState::Responding => Self::Responding,
        }
    }
}

/// The conversation orchestrator for one hub connection
pub struct SatelliteSession {
    settings: SessionSettings,
    outbound: UnboundedSender<ApiMessage>,
    events: UnboundedSender<SessionEvent>,
    player: Arc<dyn AudioOutput>,
    speech_model: Box<dyn SpeechModel>,
    wake_bank: WakeWordBank,
    speech_gate: SpeechGate,
    state: SatelliteState,
    pipeline: Option<TurnPipeline>,
    turn_seq: u64,
    pending_wake_phrase: Option<String>,
    is_stopping: bool,
    explicit_stop: bool,
    last_wake: Option<Instant>,
    last_stop: Option<Instant>,
    last_activity: Instant,
    timer_finished: bool,
    tasks: JoinSet<()>,
}

impl SatelliteSession {
    /// Create a session for a freshly connected hub.
    ///
    /// `events` must be the sender side of the queue this session is driven
    /// from; timers and playback completions are posted there.
    pub fn new(
        settings: SessionSettings,
        wake_bank: WakeWordBank,
        speech_model: Box<dyn SpeechModel>,
        outbound: UnboundedSender<ApiMessage>,
        events: UnboundedSender<SessionEvent>,
        player: Arc<dyn AudioOutput>,
    ) -> Self {
        let speech_gate = SpeechGate::new(settings.vad_threshold);
        Self {
            settings,
            outbound,
            events,
            player,
            speech_model,
            wake_bank,
            speech_gate,
            state: SatelliteState::Idle,
            pipeline: None,
            turn_seq: 0,
            pending_wake_phrase: None,
            is_stopping: false,
            explicit_stop: false,
            last_wake: None,
            last_stop: None,
            last_activity: Instant::now(),
            timer_finished: false,
            tasks: JoinSet::new(),
        }
    }

    /// Current session state.
    #[must_use]
    pub const fn state(&self) -> SatelliteState {
        self.state
    }

    /// Process one event from the session queue.
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::HubMessage(message) => self.handle_hub_message(message).await,
            SessionEvent::MicAudio(chunk) => self.handle_mic_audio(&chunk).await,
            SessionEvent::PlaybackDone(kind) => self.handle_playback_done(kind).await,
            SessionEvent::TtsSafetyTimeout { turn, token } => {
                if turn != self.turn_seq {
                    tracing::debug!(turn, "ignoring safety timeout for a discarded turn");
                    return;
                }
                let outcome = self
                    .pipeline
                    .as_mut()
                    .and_then(|p| p.safety_timeout(token));
                if let Some(outcome) = outcome {
                    self.turn_ended(outcome, true).await;
                }
            }
            SessionEvent::ContinueDelay { turn } => self.handle_continue_delay(turn).await,
            SessionEvent::TimerChimeRecheck => self.handle_timer_chime_recheck().await,
            SessionEvent::StopRequested(reason) => self.stop_conversation(reason).await,
        }
    }

    /// Tear everything down when the hub connection closes.
    pub async fn close(&mut self) {
        tracing::debug!("closing session");
        self.tasks.abort_all();
        self.pipeline = None;
        self.pending_wake_phrase = None;
        self.timer_finished = false;
        self.is_stopping = false;
        self.explicit_stop = false;
        self.player.stop().await;
        self.state = SatelliteState::Idle;
        self.speech_gate.reset();
    }

    async fn handle_hub_message(&mut self, message: ApiMessage) {
        match message {
            ApiMessage::VoiceEvent(event) => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    let signals = pipeline.handle_event(&event).await;
                    self.apply_signals(signals).await;
                } else {
                    tracing::debug!(
                        event_type = event.event_type,
                        "pipeline event without an active turn"
                    );
                }
            }
            ApiMessage::TimerEvent(event) => self.handle_timer_event(&event).await,
            ApiMessage::AnnounceRequest(request) => self.handle_announcement(&request).await,
            ApiMessage::ConfigurationRequest(_) => {
                self.send(ApiMessage::ConfigurationResponse(
                    self.wake_bank.configuration(),
                ));
            }
            ApiMessage::SetConfiguration(set) => {
                let ignored = self.wake_bank.set_active(&set.active_wake_words);
                if !ignored.is_empty() {
                    tracing::warn!(?ignored, "ignoring unknown wake words");
                }
            }
            ApiMessage::VoiceResponse(_) => {
                // Legacy run acknowledgement, nothing to do with API audio
            }
            other => {
                tracing::debug!(tag = other.tag(), "unhandled hub message");
            }
        }
    }

    /// Apply pipeline notifications on the session's event path.
    async fn apply_signals(&mut self, signals: Vec<TurnSignal>) {
        for signal in signals {
            match signal {
                TurnSignal::StateChanged(state) => {
                    self.state = state.into();
                    tracing::debug!(state = ?self.state, "state changed");
                }
                TurnSignal::ListeningChanged(listening) => {
                    tracing::debug!(listening, "mic streaming changed");
                    if listening {
                        self.speech_gate.reset();
                        self.last_activity = Instant::now();
                    }
                }
                TurnSignal::SpeechDetected => {
                    // The hub VAD takes priority once it reports activity
                    tracing::debug!("hub VAD detected speech, resetting local timer");
                    self.last_activity = Instant::now();
                }
                TurnSignal::Ended(outcome) => self.turn_ended(outcome, true).await,
            }
        }
    }

    async fn handle_mic_audio(&mut self, chunk: &[u8]) {
        if self.is_stopping {
            return;
        }

        let samples = pcm_to_samples(chunk);
        let idle = self.state == SatelliteState::Idle;
        let edges = self.wake_bank.observe(&samples, idle);
        for edge in edges {
            match edge.kind {
                WakeKind::Wake => self.on_wake_detected(&edge.phrase).await,
                WakeKind::Stop => self.on_stop_detected().await,
            }
        }
        if self.is_stopping {
            return;
        }

        if self.pipeline.is_none() {
            self.last_activity = Instant::now();
            return;
        }
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.process_mic_audio(chunk);
        }

        let listening = self
            .pipeline
            .as_ref()
            .is_some_and(|p| p.state() == TurnState::Listening);
        if listening {
            let probability = self.speech_model.predict(&samples);
            match self.speech_gate.process(probability) {
                GateAction::Start => {
                    tracing::debug!("local VAD: speech started");
                    self.last_activity = Instant::now();
                }
                GateAction::End => {
                    tracing::debug!("local VAD: speech ended");
                    self.last_activity = Instant::now();
                }
                GateAction::None => {
                    // Once speech has been confirmed this turn, ending the
                    // conversation is left to the hub VAD
                    if !self.speech_gate.has_detected_speech()
                        && self.last_activity.elapsed() > self.settings.silence_timeout
                    {
                        tracing::info!(
                            timeout = ?self.settings.silence_timeout,
                            "listening timeout, no speech detected"
                        );
                        self.stop_conversation(StopReason::Timeout).await;
                    }
                }
            }
        } else {
            self.last_activity = Instant::now();
        }
    }

    async fn on_wake_detected(&mut self, phrase: &str) {
        if let Some(last_stop) = self.last_stop {
            if last_stop.elapsed() < WAKE_COOLDOWN {
                return;
            }
        }
        if self.state != SatelliteState::Idle {
            return;
        }

        tracing::debug!(phrase, "wake word detected");

        if self.timer_finished {
            self.stop_timer().await;
        } else if !self
            .pipeline
            .as_ref()
            .is_some_and(|p| p.state() == TurnState::Listening)
        {
            self.wake_satellite(phrase, false).await;
        }
    }

    async fn on_stop_detected(&mut self) {
        if self.timer_finished {
            self.stop_timer().await;
        } else if self.state == SatelliteState::Idle {
            // Nothing is active: ignore to prevent phantom stops from
            // ambient noise
            tracing::debug!("ignored stop word while idle");
        } else {
            tracing::debug!("stop word detected, requesting stop");
            self.stop_conversation(StopReason::Keyword).await;
        }
    }

    async fn wake_satellite(&mut self, phrase: &str, continuation: bool) {
        self.explicit_stop = false;
        self.is_stopping = false;
        self.last_activity = Instant::now();
        self.last_wake = Some(Instant::now());
        self.speech_gate.reset();

        tracing::debug!(phrase, continuation, "waking satellite");
        self.state = SatelliteState::Waking;
        self.player.duck().await;

        self.turn_seq += 1;
        self.pipeline = Some(TurnPipeline::new(
            self.turn_seq,
            self.outbound.clone(),
            self.events.clone(),
            Arc::clone(&self.player),
        ));

        if continuation || !self.settings.wake_chime_enabled {
            let phrase = if continuation { "" } else { phrase };
            let signals = self
                .pipeline
                .as_mut()
                .map(|p| p.start(phrase))
                .unwrap_or_default();
            self.apply_signals(signals).await;
        } else {
            self.pending_wake_phrase = Some(phrase.to_string());
            self.player
                .play_chime(
                    Chime::Wake,
                    DoneSignal::new(
                        self.events.clone(),
                        PlaybackKind::WakeChime {
                            turn: self.turn_seq,
                        },
                    ),
                )
                .await;
        }
    }

    async fn handle_playback_done(&mut self, kind: PlaybackKind) {
        match kind {
            PlaybackKind::Tts { turn } => {
                if turn != self.turn_seq {
                    tracing::debug!(turn, "ignoring playback completion for a discarded turn");
                    return;
                }
                let outcome = self
                    .pipeline
                    .as_mut()
                    .and_then(TurnPipeline::playback_finished);
                if let Some(outcome) = outcome {
                    self.turn_ended(outcome, true).await;
                }
            }
            PlaybackKind::WakeChime { turn } => {
                if turn != self.turn_seq {
                    tracing::debug!(turn, "ignoring wake chime for a discarded turn");
                    return;
                }
                let phrase = self.pending_wake_phrase.take().unwrap_or_default();
                let signals = self
                    .pipeline
                    .as_mut()
                    .map(|p| p.start(&phrase))
                    .unwrap_or_default();
                self.apply_signals(signals).await;
            }
            PlaybackKind::ExitChime => self.stop_satellite().await,
            PlaybackKind::Announcement { start_conversation } => {
                let outcome = TurnOutcome {
                    continue_conversation: start_conversation,
                    conversation_id: None,
                    had_error: false,
                    tts_played: true,
                };
                self.turn_ended(outcome, false).await;
            }
            PlaybackKind::TimerChime => {
                self.spawn_delay(TIMER_CHIME_INTERVAL, SessionEvent::TimerChimeRecheck);
            }
        }
    }

    async fn handle_continue_delay(&mut self, turn: u64) {
        if turn != self.turn_seq {
            tracing::debug!(turn, "ignoring continuation for a discarded turn");
            return;
        }
        if self.explicit_stop || self.state == SatelliteState::Idle {
            tracing::debug!("continuation cancelled by stop");
            return;
        }
        self.wake_satellite("", true).await;
    }

    /// Decide what happens after a turn (or announcement) reports ended.
    async fn turn_ended(&mut self, outcome: TurnOutcome, is_conversation: bool) {
        tracing::debug!(
            continue_conversation = outcome.continue_conversation,
            conversation_id = ?outcome.conversation_id,
            had_error = outcome.had_error,
            tts_played = outcome.tts_played,
            is_conversation,
            "turn ended"
        );
        self.send(ApiMessage::AnnounceFinished(VoiceAssistantAnnounceFinished {
            success: true,
        }));

        if self.explicit_stop {
            tracing::debug!("stopping: explicit stop was requested");
            self.stop_satellite().await;
            return;
        }
        if !is_conversation && !outcome.continue_conversation {
            tracing::debug!("announcement finished, returning to idle");
            self.stop_satellite().await;
            return;
        }
        if outcome.had_error {
            tracing::warn!("stopping conversation after error");
            self.stop_satellite().await;
            return;
        }
        if is_conversation && !outcome.tts_played {
            // Without this guard an empty turn with forced continuation
            // would loop forever
            tracing::warn!("stopping: no TTS playback occurred this turn");
            self.stop_satellite().await;
            return;
        }

        let session_duration = self.last_wake.map_or(Duration::MAX, |wake| wake.elapsed());
        let rapid_failure = session_duration < RAPID_FAILURE_GUARD;
        let force = self.settings.force_continuous_conversation;
        let should_loop =
            outcome.continue_conversation || (is_conversation && force && !rapid_failure);

        if should_loop {
            tracing::debug!(
                hub_requested = outcome.continue_conversation,
                force,
                ?session_duration,
                "continuing conversation"
            );
            self.spawn_delay(
                CONTINUATION_DELAY,
                SessionEvent::ContinueDelay {
                    turn: self.turn_seq,
                },
            );
        } else {
            if rapid_failure && force {
                tracing::warn!("continuous conversation aborted after rapid failure");
            }
            self.stop_satellite().await;
        }
    }

    /// Request that the active conversation stop.
    pub async fn stop_conversation(&mut self, reason: StopReason) {
        tracing::debug!(
            ?reason,
            state = ?self.state,
            is_stopping = self.is_stopping,
            "stop requested"
        );

        if self.is_stopping {
            tracing::debug!("already stopping, ignoring request");
            return;
        }
        // A timeout arriving while idle is a phantom from the VAD loop
        if self.state == SatelliteState::Idle && reason == StopReason::Timeout {
            tracing::warn!("ignoring timeout while idle");
            return;
        }

        self.is_stopping = true;
        self.explicit_stop = true;

        let play_exit_chime = matches!(
            reason,
            StopReason::Manual | StopReason::Keyword | StopReason::Timeout
        );

        if play_exit_chime {
            if self.state == SatelliteState::Responding {
                // Let the response finish speaking; the deferred stop applies
                // once playback completes. Keep explicit_stop latched.
                tracing::debug!("deferring stop until response playback finishes");
                self.is_stopping = false;
                return;
            }
            self.player
                .play_chime(
                    Chime::Exit,
                    DoneSignal::new(self.events.clone(), PlaybackKind::ExitChime),
                )
                .await;
        } else {
            self.stop_satellite().await;
        }
    }

    /// Tear the turn down and return to the idle baseline.
    async fn stop_satellite(&mut self) {
        tracing::debug!("tearing turn down");
        self.is_stopping = false;
        self.last_stop = Some(Instant::now());
        self.pipeline = None;
        self.pending_wake_phrase = None;
        self.player.stop().await;
        self.state = SatelliteState::Idle;
        self.send(ApiMessage::AnnounceFinished(VoiceAssistantAnnounceFinished {
            success: true,
        }));
        self.speech_gate.reset();
    }

    async fn handle_announcement(&mut self, request: &VoiceAssistantAnnounceRequest) {
        tracing::debug!(
            media_id = %request.media_id,
            start_conversation = request.start_conversation,
            "starting announcement"
        );
        // Responding keeps this from being treated as a conversation wake
        self.state = SatelliteState::Responding;
        self.player.duck().await;

        let mut urls = Vec::new();
        if !request.preannounce_media_id.is_empty() {
            urls.push(request.preannounce_media_id.clone());
        }
        if !request.media_id.is_empty() {
            urls.push(request.media_id.clone());
        }

        let done = DoneSignal::new(
            self.events.clone(),
            PlaybackKind::Announcement {
                start_conversation: request.start_conversation,
            },
        );
        if urls.is_empty() {
            done.signal();
        } else {
            self.player.play(urls, done).await;
        }
    }

    async fn handle_timer_event(&mut self, event: &VoiceAssistantTimerEventResponse) {
        match VoiceAssistantTimerEvent::try_from(event.event_type) {
            Ok(VoiceAssistantTimerEvent::Finished) => {
                if !self.timer_finished {
                    self.timer_finished = true;
                    self.player.duck().await;
                    self.play_timer_chime().await;
                }
            }
            Ok(kind) => {
                tracing::debug!(?kind, timer = %event.name, "timer event");
            }
            Err(_) => {
                tracing::debug!(event_type = event.event_type, "unknown timer event");
            }
        }
    }

    async fn handle_timer_chime_recheck(&mut self) {
        if self.timer_finished {
            self.play_timer_chime().await;
        } else {
            self.player.unduck().await;
        }
    }

    async fn play_timer_chime(&mut self) {
        self.player
            .play_chime(
                Chime::TimerFinished,
                DoneSignal::new(self.events.clone(), PlaybackKind::TimerChime),
            )
            .await;
    }

    async fn stop_timer(&mut self) {
        tracing::debug!("stopping timer chime");
        if self.timer_finished {
            self.timer_finished = false;
            self.player.stop().await;
        }
    }

    /// Spawn a one-shot delay posting `event` back onto the session queue.
    ///
    /// Tasks live in the session's [`JoinSet`] and are aborted as a unit on
    /// [`close`](Self::close).
    fn spawn_delay(&mut self, delay: Duration, event: SessionEvent) {
        while self.tasks.try_join_next().is_some() {}
        let events = self.events.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    fn send(&self, message: ApiMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("outbound channel closed, dropping message");
        }
    }
}
