//! Per-turn voice pipeline state machine
//!
//! One [`TurnPipeline`] instance drives a single conversation turn: it
//! requests the run from the hub, buffers microphone audio until the hub
//! confirms the run has started, reacts to lifecycle events, starts TTS
//! playback, and reports completion exactly once. The instance is discarded
//! after its ended signal fires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::protocol::api::{
    VoiceAssistantAudio, VoiceAssistantEvent, VoiceAssistantEventResponse, VoiceAssistantRequest,
};
use crate::protocol::ApiMessage;
use crate::voice::audio::{AudioOutput, DoneSignal};
use crate::voice::satellite::{PlaybackKind, SessionEvent};

/// Upper bound on a single TTS playback before completion is forced
pub const TTS_SAFETY_TIMEOUT: Duration = Duration::from_secs(300);

/// Log the mic backlog size every this many buffered chunks
const BACKLOG_LOG_INTERVAL: usize = 20;

/// Pipeline state within a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Owner is waking the satellite; set before `start` is invoked
    Waking,
    /// Microphone audio is wanted
    Listening,
    /// The hub is working out what was said
    Processing,
    /// A response is being generated or spoken
    Responding,
}

/// One-directional notifications from the pipeline to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TurnSignal {
    /// The pipeline state changed
    StateChanged(TurnState),
    /// Whether microphone audio should be forwarded changed
    ListeningChanged(bool),
    /// The hub's VAD reported speech; reset local silence tracking
    SpeechDetected,
    /// The turn completed; the instance must be discarded
    Ended(TurnOutcome),
}

/// Final report of a completed turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// The hub asked for a follow-up turn
    pub continue_conversation: bool,
    /// Conversation context id captured from the intent, if any
    pub conversation_id: Option<String>,
    /// The hub reported an error during the run
    pub had_error: bool,
    /// TTS playback happened at some point during the turn
    pub tts_played: bool,
}

/// State machine for one conversation turn
pub struct TurnPipeline {
    turn: u64,
    outbound: UnboundedSender<ApiMessage>,
    events: UnboundedSender<SessionEvent>,
    player: Arc<dyn AudioOutput>,
    state: TurnState,
    running: bool,
    backlog: VecDeque<Vec<u8>>,
    tts_stream_url: Option<String>,
    tts_played: bool,
    continue_conversation: bool,
    conversation_id: Option<String>,
    had_error: bool,
    ended: bool,
    timeout_token: u64,
    timeout_task: Option<JoinHandle<()>>,
}

impl TurnPipeline {
    /// Create a pipeline for the turn identified by `turn`.
    ///
    /// Completion and safety-timeout events posted to `events` carry the turn
    /// id so the session can discard signals from discarded instances.
    pub fn new(
        turn: u64,
        outbound: UnboundedSender<ApiMessage>,
        events: UnboundedSender<SessionEvent>,
        player: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            turn,
            outbound,
            events,
            player,
            state: TurnState::Listening,
            running: false,
            backlog: VecDeque::new(),
            tts_stream_url: None,
            tts_played: false,
            continue_conversation: false,
            conversation_id: None,
            had_error: false,
            ended: false,
            timeout_token: 0,
            timeout_task: None,
        }
    }

    /// Current pipeline state.
    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Request a new pipeline run from the hub.
    ///
    /// Emits the initial state and listening signals, then sends the turn
    /// start request carrying the wake phrase (empty for manual or
    /// continuation starts).
    pub fn start(&mut self, wake_word_phrase: &str) -> Vec<TurnSignal> {
        let signals = vec![
            TurnSignal::StateChanged(self.state),
            TurnSignal::ListeningChanged(self.state == TurnState::Listening),
        ];
        self.send(ApiMessage::VoiceRequest(VoiceAssistantRequest {
            start: true,
            conversation_id: String::new(),
            wake_word_phrase: wake_word_phrase.to_string(),
        }));
        signals
    }

    /// Handle a hub lifecycle event, updating state and TTS playback.
    pub async fn handle_event(&mut self, event: &VoiceAssistantEventResponse) -> Vec<TurnSignal> {
        let mut signals = Vec::new();

        let Ok(kind) = VoiceAssistantEvent::try_from(event.event_type) else {
            tracing::debug!(event_type = event.event_type, "unrecognized pipeline event");
            return signals;
        };
        tracing::debug!(event = ?kind, data = ?event.data, "pipeline event");

        match kind {
            VoiceAssistantEvent::RunStart => {
                // From this point microphone audio can be sent
                self.running = true;
                self.tts_stream_url = event.data_value("url").map(str::to_string);
                // Acquire the output device early so playback does not fight
                // for focus later; this also ducks background audio while the
                // microphone is capturing voice
                self.player.init().await;
            }
            VoiceAssistantEvent::SttStart => {
                tracing::debug!("hub STT started");
            }
            VoiceAssistantEvent::SttVadStart => {
                signals.push(TurnSignal::SpeechDetected);
            }
            VoiceAssistantEvent::SttVadEnd | VoiceAssistantEvent::SttEnd => {
                // The user has finished speaking
                self.update_state(TurnState::Processing, &mut signals);
            }
            VoiceAssistantEvent::IntentStart => {}
            VoiceAssistantEvent::IntentProgress => {
                // Pipelines with TTS streaming start playback here
                if event.data_value("tts_start_streaming") == Some("1") {
                    if let Some(url) = self.tts_stream_url.clone() {
                        self.begin_playback(url).await;
                    }
                }
            }
            VoiceAssistantEvent::IntentEnd => {
                if event.data_value("continue_conversation") == Some("1") {
                    self.continue_conversation = true;
                }
                if let Some(id) = event.data_value("conversation_id") {
                    self.conversation_id = Some(id.to_string());
                }
            }
            VoiceAssistantEvent::TtsStart => {
                self.update_state(TurnState::Responding, &mut signals);
            }
            VoiceAssistantEvent::TtsEnd => {
                // Without TTS streaming, the complete response plays now
                if !self.tts_played {
                    if let Some(url) = event.data_value("url").map(str::to_string) {
                        self.begin_playback(url).await;
                    }
                }
            }
            VoiceAssistantEvent::Error => {
                tracing::error!(
                    message = event.data_value("message").unwrap_or("unknown"),
                    "voice assistant error"
                );
                self.had_error = true;
            }
            VoiceAssistantEvent::RunEnd => {
                if !self.running {
                    // Leftover from a previous session racing this turn
                    tracing::warn!("ignoring run end for a pipeline that never started");
                    return signals;
                }
                if !self.tts_played {
                    if let Some(url) = self.tts_stream_url.clone() {
                        tracing::debug!(url, "playing fallback TTS URL from run start");
                        self.begin_playback(url).await;
                    } else if let Some(outcome) = self.fire_ended() {
                        signals.push(TurnSignal::Ended(outcome));
                    }
                }
                // If playback is in flight, its completion fires the ended
                // signal instead
            }
            VoiceAssistantEvent::WakeWordStart | VoiceAssistantEvent::WakeWordEnd => {}
        }

        signals
    }

    /// Forward or buffer one microphone chunk.
    ///
    /// Drops audio unless the pipeline is listening. Before the hub confirms
    /// the run, chunks accumulate in a backlog; once running, the backlog is
    /// flushed in arrival order ahead of the new chunk so nothing is lost or
    /// reordered across the transition.
    pub fn process_mic_audio(&mut self, chunk: &[u8]) {
        if self.state != TurnState::Listening {
            return;
        }
        if self.running {
            while let Some(buffered) = self.backlog.pop_front() {
                self.send_audio(buffered);
            }
            self.send_audio(chunk.to_vec());
        } else {
            self.backlog.push_back(chunk.to_vec());
            if self.backlog.len() % BACKLOG_LOG_INTERVAL == 0 {
                tracing::debug!(chunks = self.backlog.len(), "buffering mic audio");
            }
        }
    }

    /// Playback completion reported by the audio output.
    pub fn playback_finished(&mut self) -> Option<TurnOutcome> {
        self.fire_ended()
    }

    /// Safety timeout fired for the playback identified by `token`.
    ///
    /// Stale tokens (from a playback that was superseded) are ignored.
    pub fn safety_timeout(&mut self, token: u64) -> Option<TurnOutcome> {
        if token != self.timeout_token {
            tracing::debug!(token, "ignoring stale TTS safety timeout");
            return None;
        }
        tracing::warn!("TTS playback timed out, forcing completion");
        self.fire_ended()
    }

    async fn begin_playback(&mut self, url: String) {
        self.tts_played = true;
        self.arm_safety_timeout();
        self.player
            .play(
                vec![url],
                DoneSignal::new(self.events.clone(), PlaybackKind::Tts { turn: self.turn }),
            )
            .await;
    }

    /// Arm the playback safety timer, superseding any previous one.
    fn arm_safety_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        self.timeout_token += 1;
        let token = self.timeout_token;
        let turn = self.turn;
        let events = self.events.clone();
        self.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(TTS_SAFETY_TIMEOUT).await;
            let _ = events.send(SessionEvent::TtsSafetyTimeout { turn, token });
        }));
    }

    /// Latch and report the ended outcome; at most one caller ever gets it.
    fn fire_ended(&mut self) -> Option<TurnOutcome> {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if self.ended {
            return None;
        }
        self.ended = true;
        Some(TurnOutcome {
            continue_conversation: self.continue_conversation,
            conversation_id: self.conversation_id.clone(),
            had_error: self.had_error,
            tts_played: self.tts_played,
        })
    }

    fn update_state(&mut self, state: TurnState, signals: &mut Vec<TurnSignal>) {
        if state == self.state {
            return;
        }
        let old = self.state;
        self.state = state;
        signals.push(TurnSignal::StateChanged(state));
        if state == TurnState::Listening {
            signals.push(TurnSignal::ListeningChanged(true));
        } else if old == TurnState::Listening {
            signals.push(TurnSignal::ListeningChanged(false));
        }
    }

    fn send_audio(&self, data: Vec<u8>) {
        self.send(ApiMessage::VoiceAudio(VoiceAssistantAudio {
            data,
            end: false,
        }));
    }

    fn send(&self, message: ApiMessage) {
        if self.outbound.send(message).is_err() {
            tracing::debug!("outbound channel closed, dropping message");
        }
    }
}

impl Drop for TurnPipeline {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::audio::testing::RecordingOutput;
    use tokio::sync::mpsc;

    fn event(kind: VoiceAssistantEvent, data: &[(&str, &str)]) -> VoiceAssistantEventResponse {
        VoiceAssistantEventResponse::new(kind, data)
    }

    struct Harness {
        pipeline: TurnPipeline,
        outbound: mpsc::UnboundedReceiver<ApiMessage>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        player: Arc<RecordingOutput>,
    }

    fn harness() -> Harness {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let player = Arc::new(RecordingOutput::new());
        let pipeline = TurnPipeline::new(
            1,
            outbound_tx,
            events_tx,
            Arc::clone(&player) as Arc<dyn AudioOutput>,
        );
        Harness {
            pipeline,
            outbound,
            events,
            player,
        }
    }

    fn drain_audio(rx: &mut mpsc::UnboundedReceiver<ApiMessage>) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ApiMessage::VoiceAudio(audio) = message {
                chunks.push(audio.data);
            }
        }
        chunks
    }

    #[tokio::test]
    async fn start_sends_request_with_wake_phrase() {
        let mut h = harness();
        let signals = h.pipeline.start("hey_lark");

        assert_eq!(
            signals,
            vec![
                TurnSignal::StateChanged(TurnState::Listening),
                TurnSignal::ListeningChanged(true),
            ]
        );
        match h.outbound.try_recv().unwrap() {
            ApiMessage::VoiceRequest(request) => {
                assert!(request.start);
                assert_eq!(request.wake_word_phrase, "hey_lark");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn audio_is_buffered_then_flushed_in_order() {
        let mut h = harness();

        h.pipeline.process_mic_audio(&[1]);
        h.pipeline.process_mic_audio(&[2]);
        h.pipeline.process_mic_audio(&[3]);
        assert!(drain_audio(&mut h.outbound).is_empty());

        h.pipeline
            .handle_event(&event(VoiceAssistantEvent::RunStart, &[]))
            .await;
        h.pipeline.process_mic_audio(&[4]);

        assert_eq!(
            drain_audio(&mut h.outbound),
            vec![vec![1], vec![2], vec![3], vec![4]]
        );
    }

    #[tokio::test]
    async fn audio_is_dropped_outside_listening() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(VoiceAssistantEvent::RunStart, &[]))
            .await;
        h.pipeline
            .handle_event(&event(VoiceAssistantEvent::SttEnd, &[]))
            .await;

        h.pipeline.process_mic_audio(&[1]);
        assert!(drain_audio(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn stt_end_transitions_to_processing() {
        let mut h = harness();
        let signals = h
            .pipeline
            .handle_event(&event(VoiceAssistantEvent::SttEnd, &[]))
            .await;
        assert_eq!(
            signals,
            vec![
                TurnSignal::StateChanged(TurnState::Processing),
                TurnSignal::ListeningChanged(false),
            ]
        );
    }

    #[tokio::test]
    async fn server_vad_start_is_surfaced() {
        let mut h = harness();
        let signals = h
            .pipeline
            .handle_event(&event(VoiceAssistantEvent::SttVadStart, &[]))
            .await;
        assert_eq!(signals, vec![TurnSignal::SpeechDetected]);
    }

    #[tokio::test]
    async fn stale_run_end_is_ignored() {
        let mut h = harness();
        let signals = h
            .pipeline
            .handle_event(&event(VoiceAssistantEvent::RunEnd, &[]))
            .await;
        assert!(signals.is_empty());
    }

    #[tokio::test]
    async fn run_end_without_playback_or_url_ends_immediately() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(VoiceAssistantEvent::RunStart, &[]))
            .await;
        let signals = h
            .pipeline
            .handle_event(&event(VoiceAssistantEvent::RunEnd, &[]))
            .await;

        assert_eq!(
            signals,
            vec![TurnSignal::Ended(TurnOutcome::default())]
        );
    }

    #[tokio::test]
    async fn run_end_plays_fallback_url() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::RunStart,
                &[("url", "http://hub/tts.mp3")],
            ))
            .await;
        let signals = h
            .pipeline
            .handle_event(&event(VoiceAssistantEvent::RunEnd, &[]))
            .await;

        // No ended yet: completion of the fallback playback fires it
        assert!(signals.is_empty());
        assert_eq!(
            h.player.plays(),
            vec![vec!["http://hub/tts.mp3".to_string()]]
        );

        let outcome = h.pipeline.playback_finished().unwrap();
        assert!(outcome.tts_played);
    }

    #[tokio::test]
    async fn streaming_tts_starts_on_intent_progress() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::RunStart,
                &[("url", "http://hub/stream.mp3")],
            ))
            .await;
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::IntentProgress,
                &[("tts_start_streaming", "1")],
            ))
            .await;

        assert_eq!(
            h.player.plays(),
            vec![vec!["http://hub/stream.mp3".to_string()]]
        );

        // tts_end must not restart playback
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::TtsEnd,
                &[("url", "http://hub/other.mp3")],
            ))
            .await;
        assert_eq!(h.player.plays().len(), 1);
    }

    #[tokio::test]
    async fn intent_end_captures_continuation_and_conversation_id() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(VoiceAssistantEvent::RunStart, &[]))
            .await;
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::IntentEnd,
                &[("continue_conversation", "1"), ("conversation_id", "abc")],
            ))
            .await;
        let signals = h
            .pipeline
            .handle_event(&event(VoiceAssistantEvent::RunEnd, &[]))
            .await;

        let TurnSignal::Ended(outcome) = &signals[0] else {
            panic!("expected ended signal");
        };
        assert!(outcome.continue_conversation);
        assert_eq!(outcome.conversation_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn error_event_is_recorded_without_ending_the_turn() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(VoiceAssistantEvent::RunStart, &[]))
            .await;
        let signals = h
            .pipeline
            .handle_event(&event(
                VoiceAssistantEvent::Error,
                &[("message", "no pipeline")],
            ))
            .await;
        assert!(signals.is_empty());

        let signals = h
            .pipeline
            .handle_event(&event(VoiceAssistantEvent::RunEnd, &[]))
            .await;
        let TurnSignal::Ended(outcome) = &signals[0] else {
            panic!("expected ended signal");
        };
        assert!(outcome.had_error);
    }

    #[tokio::test]
    async fn ended_fires_once_across_timeout_and_completion() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::TtsEnd,
                &[("url", "http://hub/tts.mp3")],
            ))
            .await;

        assert!(h.pipeline.safety_timeout(1).is_some());
        assert!(h.pipeline.playback_finished().is_none());
    }

    #[tokio::test]
    async fn ended_fires_once_in_reverse_order() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::TtsEnd,
                &[("url", "http://hub/tts.mp3")],
            ))
            .await;

        assert!(h.pipeline.playback_finished().is_some());
        assert!(h.pipeline.safety_timeout(1).is_none());
    }

    #[tokio::test]
    async fn stale_timeout_token_is_ignored() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::TtsEnd,
                &[("url", "http://hub/tts.mp3")],
            ))
            .await;

        assert!(h.pipeline.safety_timeout(0).is_none());
        assert!(h.pipeline.playback_finished().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn safety_timeout_task_posts_event() {
        let mut h = harness();
        h.pipeline
            .handle_event(&event(
                VoiceAssistantEvent::TtsEnd,
                &[("url", "http://hub/tts.mp3")],
            ))
            .await;

        tokio::time::sleep(TTS_SAFETY_TIMEOUT + Duration::from_secs(1)).await;

        match h.events.try_recv().unwrap() {
            SessionEvent::TtsSafetyTimeout { turn, token } => {
                assert_eq!(turn, 1);
                assert_eq!(token, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
