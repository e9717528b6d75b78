//! ESPHome native API protocol layer
//!
//! Message definitions ([`api`]) and the binary frame codec ([`codec`]).

pub mod api;
pub mod codec;

pub use api::{
    ApiMessage, VoiceAssistantEvent, VoiceAssistantEventData, VoiceAssistantEventResponse,
    VoiceAssistantTimerEvent,
};
pub use codec::{FrameReader, FrameWriter, ProtocolError};
