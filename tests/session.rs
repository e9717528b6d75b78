//! End-to-end conversation scenarios
//!
//! Drives a [`SatelliteSession`] through full turns using a fake audio output
//! and scripted probability models, without hub or audio hardware.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use lark_satellite::protocol::api::VoiceAssistantEvent;
use lark_satellite::protocol::ApiMessage;
use lark_satellite::voice::models::ScriptedModel;
use lark_satellite::voice::satellite::SatelliteState;
use lark_satellite::voice::wake::{WakeKind, WakeWordBank, WakeWordMeta};
use lark_satellite::voice::{AudioOutput, Chime, SatelliteSession, SessionEvent, SessionSettings};

mod common;
use common::{lifecycle_event, FakeOutput};

struct Harness {
    session: SatelliteSession,
    outbound: mpsc::UnboundedReceiver<ApiMessage>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    player: Arc<FakeOutput>,
}

impl Harness {
    fn new(settings: SessionSettings, wake_values: Vec<f32>) -> Self {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let player = Arc::new(FakeOutput::new());

        let mut bank = WakeWordBank::new();
        bank.add(
            WakeWordMeta {
                id: "hey_device".to_string(),
                phrase: "hey_device".to_string(),
                trained_languages: vec!["en".to_string()],
                cutoff: 0.5,
                window_size: 1,
            },
            WakeKind::Wake,
            Box::new(ScriptedModel::sequence(wake_values)),
        );

        let session = SatelliteSession::new(
            settings,
            bank,
            Box::new(ScriptedModel::constant(0.0)),
            outbound_tx,
            events_tx,
            Arc::clone(&player) as Arc<dyn AudioOutput>,
        );

        Self {
            session,
            outbound,
            events_rx,
            player,
        }
    }

    /// Feed queued events (completions, delayed posts) back into the session.
    async fn pump(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.session.handle_event(event).await;
        }
    }

    async fn hub_event(&mut self, kind: VoiceAssistantEvent, data: &[(&str, &str)]) {
        self.session
            .handle_event(SessionEvent::HubMessage(ApiMessage::VoiceEvent(
                lifecycle_event(kind, data),
            )))
            .await;
    }

    async fn mic_chunk(&mut self, chunk: Vec<u8>) {
        self.session.handle_event(SessionEvent::MicAudio(chunk)).await;
    }

    fn drain_outbound(&mut self) -> Vec<ApiMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}

fn audio_payloads(messages: &[ApiMessage]) -> Vec<Vec<u8>> {
    messages
        .iter()
        .filter_map(|m| match m {
            ApiMessage::VoiceAudio(audio) => Some(audio.data.clone()),
            _ => None,
        })
        .collect()
}

fn voice_requests(messages: &[ApiMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ApiMessage::VoiceRequest(request) if request.start => {
                Some(request.wake_word_phrase.clone())
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn full_turn_from_wake_to_idle() {
    let settings = SessionSettings {
        wake_chime_enabled: false,
        ..SessionSettings::default()
    };
    let mut h = Harness::new(settings, vec![1.0, 0.0]);

    // Wake edge starts the turn and sends the start request
    h.mic_chunk(vec![0, 0]).await;
    assert_eq!(h.session.state(), SatelliteState::Listening);

    let messages = h.drain_outbound();
    assert_eq!(voice_requests(&messages), vec!["hey_device".to_string()]);

    // Audio before run start is buffered, nothing goes out
    h.mic_chunk(vec![1, 1]).await;
    h.mic_chunk(vec![2, 2]).await;
    h.mic_chunk(vec![3, 3]).await;
    assert!(audio_payloads(&h.drain_outbound()).is_empty());

    // Run start: the backlog flushes ahead of the next live chunk
    h.hub_event(VoiceAssistantEvent::RunStart, &[]).await;
    h.mic_chunk(vec![4, 4]).await;
    assert_eq!(
        audio_payloads(&h.drain_outbound()),
        vec![
            vec![0, 0],
            vec![1, 1],
            vec![2, 2],
            vec![3, 3],
            vec![4, 4],
        ]
    );

    // The hub VAD ends the utterance
    h.hub_event(VoiceAssistantEvent::SttVadEnd, &[]).await;
    assert_eq!(h.session.state(), SatelliteState::Processing);

    // Audio is no longer forwarded while processing
    h.mic_chunk(vec![5, 5]).await;
    assert!(audio_payloads(&h.drain_outbound()).is_empty());

    h.hub_event(VoiceAssistantEvent::TtsStart, &[]).await;
    assert_eq!(h.session.state(), SatelliteState::Responding);

    // Non-streaming TTS plays on tts end
    h.hub_event(VoiceAssistantEvent::TtsEnd, &[("url", "http://hub/reply.mp3")])
        .await;
    assert_eq!(
        h.player.plays(),
        vec![vec!["http://hub/reply.mp3".to_string()]]
    );

    // Run end while playback is in flight changes nothing
    h.hub_event(VoiceAssistantEvent::RunEnd, &[]).await;
    assert_eq!(h.session.state(), SatelliteState::Responding);

    // Playback completion fires ended and the session tears down to idle
    h.player.complete_next();
    h.pump().await;
    assert_eq!(h.session.state(), SatelliteState::Idle);

    let messages = h.drain_outbound();
    assert!(messages
        .iter()
        .any(|m| matches!(m, ApiMessage::AnnounceFinished(_))));
}

#[tokio::test(start_paused = true)]
async fn continuation_loops_into_a_new_turn_without_chime() {
    let settings = SessionSettings {
        wake_chime_enabled: true,
        ..SessionSettings::default()
    };
    let mut h = Harness::new(settings, vec![1.0, 0.0]);

    // Fresh wake plays the wake chime before the start request
    h.mic_chunk(vec![0, 0]).await;
    assert_eq!(h.session.state(), SatelliteState::Waking);
    assert_eq!(h.player.chimes(), vec![Chime::Wake]);

    h.player.complete_next();
    h.pump().await;
    assert_eq!(h.session.state(), SatelliteState::Listening);
    assert_eq!(
        voice_requests(&h.drain_outbound()),
        vec!["hey_device".to_string()]
    );

    // Turn runs; the hub asks for a follow-up
    h.hub_event(VoiceAssistantEvent::RunStart, &[]).await;
    h.hub_event(
        VoiceAssistantEvent::IntentEnd,
        &[("continue_conversation", "1"), ("conversation_id", "conv-7")],
    )
    .await;
    h.hub_event(VoiceAssistantEvent::TtsStart, &[]).await;
    h.hub_event(VoiceAssistantEvent::TtsEnd, &[("url", "http://hub/reply.mp3")])
        .await;
    h.hub_event(VoiceAssistantEvent::RunEnd, &[]).await;

    h.player.complete_next();
    h.pump().await;

    // Ended with continue=true: not idle, waiting out the restart delay
    assert_ne!(h.session.state(), SatelliteState::Idle);

    tokio::time::advance(Duration::from_secs(1)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    h.pump().await;

    // The follow-up turn started with no chime and no wake phrase
    assert_eq!(h.session.state(), SatelliteState::Listening);
    assert_eq!(h.player.chimes(), vec![Chime::Wake]);
    assert_eq!(voice_requests(&h.drain_outbound()), vec![String::new()]);
}

#[tokio::test]
async fn turn_without_playback_does_not_loop() {
    // Forced continuation must not loop when no TTS ever played
    let settings = SessionSettings {
        wake_chime_enabled: false,
        force_continuous_conversation: true,
        ..SessionSettings::default()
    };
    let mut h = Harness::new(settings, vec![1.0, 0.0]);

    h.mic_chunk(vec![0, 0]).await;
    h.hub_event(VoiceAssistantEvent::RunStart, &[]).await;
    h.hub_event(VoiceAssistantEvent::RunEnd, &[]).await;

    assert_eq!(h.session.state(), SatelliteState::Idle);
    assert_eq!(h.player.pending_count(), 0);
}
