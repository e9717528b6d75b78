//! Hub connection server
//!
//! Listens on the ESPHome native API port, performs the connection handshake,
//! and drives one [`SatelliteSession`] per hub connection. Hub messages,
//! microphone chunks, playback completions and timers all land on one ordered
//! event queue, so session state is only ever mutated from this loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::discovery::MdnsAdvertiser;
use crate::protocol::api::{
    features, ConnectResponse, DeviceInfoResponse, DisconnectResponse, HelloResponse, PingResponse,
};
use crate::protocol::{ApiMessage, FrameReader, FrameWriter, ProtocolError};
use crate::voice::audio::AudioOutput;
use crate::voice::capture::MicCapture;
use crate::voice::models::{EnergyVad, WakeModelProvider};
use crate::voice::satellite::{SatelliteSession, SessionEvent};
use crate::voice::wake::{WakeKind, WakeWordBank, WakeWordMeta};
use crate::{Error, Result};

/// Native API version implemented by this satellite
const API_VERSION_MAJOR: u32 = 1;
const API_VERSION_MINOR: u32 = 10;

/// Grace period for flushing queued outbound frames on shutdown
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepts hub connections and runs satellite sessions over them
pub struct SatelliteServer {
    config: Config,
    player: Arc<dyn AudioOutput>,
    wake_models: Option<Arc<dyn WakeModelProvider>>,
}

impl SatelliteServer {
    /// Create a server with no local wake model backend.
    pub fn new(config: Config, player: Arc<dyn AudioOutput>) -> Self {
        Self {
            config,
            player,
            wake_models: None,
        }
    }

    /// Attach an inference backend for local wake word detection.
    #[must_use]
    pub fn with_wake_models(mut self, provider: Arc<dyn WakeModelProvider>) -> Self {
        self.wake_models = Some(provider);
        self
    }

    /// Run until the process is stopped, serving one hub at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound. Connection-level
    /// failures are logged and the next connection is accepted.
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.satellite.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr, name = %self.config.satellite.name, "listening for hub connections");

        let advertiser = match MdnsAdvertiser::new() {
            Ok(advertiser) => {
                if let Err(e) = advertiser
                    .start(
                        &self.config.satellite.name,
                        &self.config.satellite.mac_address,
                        self.config.satellite.port,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "mDNS advertisement failed");
                }
                Some(advertiser)
            }
            Err(e) => {
                tracing::warn!(error = %e, "mDNS unavailable, hub must be configured manually");
                None
            }
        };

        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!(peer = %peer, "hub connected");

            match self.serve_connection(stream).await {
                Ok(()) => tracing::info!(peer = %peer, "hub disconnected"),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "hub connection failed"),
            }
        }

        // Unreachable: kept for symmetry if the loop ever gains a shutdown path
        #[allow(unreachable_code)]
        {
            if let Some(advertiser) = advertiser {
                advertiser.stop().await;
            }
            Ok(())
        }
    }

    /// Drive one hub connection to completion.
    #[allow(clippy::future_not_send)]
    async fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ApiMessage>();
        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = writer.write_message(&message).await {
                    tracing::warn!(error = %e, "outbound write failed");
                    break;
                }
            }
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();

        // Decoded hub messages join the same ordered queue as everything else
        let mut reader = FrameReader::new(read_half);
        let reader_events = events_tx.clone();
        let reader_task: JoinHandle<std::result::Result<(), ProtocolError>> =
            tokio::spawn(async move {
                loop {
                    match reader.read_message().await {
                        Ok(message) => {
                            if reader_events
                                .send(SessionEvent::HubMessage(message))
                                .is_err()
                            {
                                return Ok(());
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            });

        let mut session = SatelliteSession::new(
            self.config.session_settings(),
            self.build_wake_bank(),
            Box::new(EnergyVad),
            outbound_tx.clone(),
            events_tx.clone(),
            Arc::clone(&self.player),
        );

        let mut capture = match MicCapture::start(events_tx.clone()) {
            Ok(capture) => Some(capture),
            Err(e) => {
                tracing::warn!(error = %e, "microphone unavailable, hub audio only");
                None
            }
        };

        let result = self
            .connection_loop(&mut session, &mut events_rx, reader_task, &outbound_tx)
            .await;

        if let Some(capture) = capture.as_mut() {
            capture.stop();
        }
        session.close().await;

        // Let the writer drain anything still queued, then release it
        drop(session);
        drop(outbound_tx);
        drop(events_tx);
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await;

        result
    }

    async fn connection_loop(
        &self,
        session: &mut SatelliteSession,
        events_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        mut reader_task: JoinHandle<std::result::Result<(), ProtocolError>>,
        outbound: &mpsc::UnboundedSender<ApiMessage>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                result = &mut reader_task => {
                    return match result {
                        Ok(Ok(())) | Ok(Err(ProtocolError::ConnectionClosed)) => Ok(()),
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => Err(Error::Config(format!("reader task failed: {e}"))),
                    };
                }
                Some(event) = events_rx.recv() => {
                    if let SessionEvent::HubMessage(message) = event {
                        if self.handle_hub_message(message, session, outbound).await? {
                            reader_task.abort();
                            return Ok(());
                        }
                    } else {
                        session.handle_event(event).await;
                    }
                }
            }
        }
    }

    /// Handle one hub message, intercepting the connection handshake before
    /// voice traffic reaches the session. Returns `true` on clean disconnect.
    async fn handle_hub_message(
        &self,
        message: ApiMessage,
        session: &mut SatelliteSession,
        outbound: &mpsc::UnboundedSender<ApiMessage>,
    ) -> Result<bool> {
        match message {
            ApiMessage::HelloRequest(hello) => {
                tracing::info!(client = %hello.client_info, "hub hello");
                let _ = outbound.send(ApiMessage::HelloResponse(HelloResponse {
                    api_version_major: API_VERSION_MAJOR,
                    api_version_minor: API_VERSION_MINOR,
                    server_info: format!("lark-satellite {}", env!("CARGO_PKG_VERSION")),
                    name: self.config.satellite.name.clone(),
                }));
            }
            ApiMessage::ConnectRequest(connect) => {
                let expected = self.config.satellite.password.as_deref().unwrap_or("");
                let invalid_password = connect.password != expected;
                let _ = outbound.send(ApiMessage::ConnectResponse(ConnectResponse {
                    invalid_password,
                }));
                if invalid_password {
                    tracing::warn!("hub sent an invalid password");
                    return Ok(true);
                }
                tracing::info!("hub authenticated");
            }
            ApiMessage::DisconnectRequest(_) => {
                let _ = outbound.send(ApiMessage::DisconnectResponse(DisconnectResponse {}));
                return Ok(true);
            }
            ApiMessage::PingRequest(_) => {
                let _ = outbound.send(ApiMessage::PingResponse(PingResponse {}));
            }
            ApiMessage::DeviceInfoRequest(_) => {
                let _ = outbound.send(ApiMessage::DeviceInfoResponse(self.device_info()));
            }
            ApiMessage::SubscribeVoiceAssistant(subscribe) => {
                tracing::debug!(
                    subscribe = subscribe.subscribe,
                    flags = subscribe.flags,
                    "hub voice assistant subscription"
                );
            }
            voice => {
                session
                    .handle_event(SessionEvent::HubMessage(voice))
                    .await;
            }
        }
        Ok(false)
    }

    fn device_info(&self) -> DeviceInfoResponse {
        DeviceInfoResponse {
            uses_password: self.config.satellite.password.is_some(),
            name: self.config.satellite.name.clone(),
            mac_address: self.config.satellite.mac_address.clone(),
            esphome_version: env!("CARGO_PKG_VERSION").to_string(),
            model: "lark-satellite".to_string(),
            project_name: "lark.satellite".to_string(),
            project_version: env!("CARGO_PKG_VERSION").to_string(),
            voice_assistant_feature_flags: features::VOICE_ASSISTANT
                | features::API_AUDIO
                | features::TIMERS
                | features::ANNOUNCE
                | features::START_CONVERSATION,
        }
    }

    /// Build the per-connection wake word bank from configured manifests.
    fn build_wake_bank(&self) -> WakeWordBank {
        let mut bank = WakeWordBank::new();

        let Some(dir) = self.config.wake.manifest_dir.as_ref() else {
            tracing::info!("no wake manifest dir configured, waking via hub only");
            return bank;
        };
        let Some(provider) = self.wake_models.as_ref() else {
            tracing::info!("no wake model backend attached, waking via hub only");
            return bank;
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read wake manifest dir");
                return bank;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let meta = match WakeWordMeta::from_manifest(&path, self.config.wake.cutoff_override) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "bad wake manifest");
                    continue;
                }
            };
            let kind = if self.config.wake.stop_words.contains(&meta.id) {
                WakeKind::Stop
            } else {
                WakeKind::Wake
            };
            match provider.load(&meta) {
                Ok(model) => {
                    tracing::info!(id = %meta.id, phrase = %meta.phrase, ?kind, "wake word loaded");
                    bank.add(meta, kind, model);
                }
                Err(e) => {
                    tracing::warn!(id = %meta.id, error = %e, "wake model load failed");
                }
            }
        }

        bank
    }
}
