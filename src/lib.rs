//! Lark Satellite - headless ESPHome voice satellite
//!
//! This library implements the control plane of a voice satellite device:
//! - ESPHome native API framing and messages
//! - Local wake word and speech gating
//! - The per-turn voice pipeline state machine
//! - The session orchestrator with continue-conversation looping
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Home-Automation Hub                  │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ ESPHome native API (TCP)
//! ┌────────────────────────▼─────────────────────────────┐
//! │                  Frame Codec (protocol)               │
//! └────────────────────────┬─────────────────────────────┘
//! ┌────────────────────────▼─────────────────────────────┐
//! │              Satellite Session (voice)                │
//! │   Wake Gate │ Speech Gate │ Turn Pipeline │ Guards   │
//! └──────┬─────────────────────────────────┬─────────────┘
//!        │ mic chunks                      │ play/stop
//! ┌──────▼───────┐                 ┌───────▼─────────────┐
//! │  Microphone  │                 │    Audio Output      │
//! └──────────────┘                 └─────────────────────┘
//! ```

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod voice;

pub use config::Config;
pub use device::SatelliteServer;
pub use discovery::MdnsAdvertiser;
pub use error::{Error, Result};
pub use protocol::{ApiMessage, FrameReader, FrameWriter, ProtocolError};
pub use voice::{
    AudioOutput, Chime, DoneSignal, SatelliteSession, SessionEvent, SessionSettings, StopReason,
    TurnPipeline, TurnState,
};
