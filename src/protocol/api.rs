//! ESPHome native API message definitions
//!
//! Each message is a protobuf payload identified by a numeric type tag on the
//! wire. The subset here covers the connection handshake, device info, and the
//! voice assistant surface (turn lifecycle, audio streaming, announcements,
//! timers, and wake word configuration).
//!
//! [`ApiMessage`] is the typed envelope: it maps tags to payload types in both
//! directions. Tags not in the registry decode to `None` so the codec can skip
//! them without closing the connection.

use prost::Message;

/// Voice assistant feature flags advertised in [`DeviceInfoResponse`]
pub mod features {
    /// Basic voice assistant support
    pub const VOICE_ASSISTANT: u32 = 1 << 0;
    /// Audio is streamed over the API connection (not a side channel)
    pub const API_AUDIO: u32 = 1 << 2;
    /// Timer events are supported
    pub const TIMERS: u32 = 1 << 3;
    /// Announcements are supported
    pub const ANNOUNCE: u32 = 1 << 4;
    /// The hub may start a conversation remotely
    pub const START_CONVERSATION: u32 = 1 << 5;
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub client_info: String,
    #[prost(uint32, tag = "2")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "3")]
    pub api_version_minor: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloResponse {
    #[prost(uint32, tag = "1")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "2")]
    pub api_version_minor: u32,
    #[prost(string, tag = "3")]
    pub server_info: String,
    #[prost(string, tag = "4")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub password: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectResponse {
    #[prost(bool, tag = "1")]
    pub invalid_password: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct DisconnectRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct DisconnectResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct PingResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoResponse {
    #[prost(bool, tag = "1")]
    pub uses_password: bool,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub mac_address: String,
    #[prost(string, tag = "4")]
    pub esphome_version: String,
    #[prost(string, tag = "6")]
    pub model: String,
    #[prost(string, tag = "8")]
    pub project_name: String,
    #[prost(string, tag = "9")]
    pub project_version: String,
    #[prost(uint32, tag = "17")]
    pub voice_assistant_feature_flags: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeVoiceAssistantRequest {
    #[prost(bool, tag = "1")]
    pub subscribe: bool,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
}

/// Satellite to hub: request that a pipeline run start (or stop)
#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantRequest {
    #[prost(bool, tag = "1")]
    pub start: bool,
    #[prost(string, tag = "2")]
    pub conversation_id: String,
    #[prost(string, tag = "5")]
    pub wake_word_phrase: String,
}

/// Hub to satellite: legacy run acknowledgement
#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantResponse {
    #[prost(uint32, tag = "1")]
    pub port: u32,
    #[prost(bool, tag = "2")]
    pub error: bool,
}

/// Pipeline lifecycle event kinds sent by the hub
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum VoiceAssistantEvent {
    Error = 0,
    RunStart = 1,
    RunEnd = 2,
    SttStart = 3,
    SttEnd = 4,
    IntentStart = 5,
    IntentEnd = 6,
    TtsStart = 7,
    TtsEnd = 8,
    WakeWordStart = 9,
    WakeWordEnd = 10,
    SttVadStart = 11,
    SttVadEnd = 12,
    IntentProgress = 100,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantEventData {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantEventResponse {
    #[prost(enumeration = "VoiceAssistantEvent", tag = "1")]
    pub event_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub data: Vec<VoiceAssistantEventData>,
}

impl VoiceAssistantEventResponse {
    /// Build an event with the given kind and `(name, value)` data pairs.
    #[must_use]
    pub fn new(event: VoiceAssistantEvent, data: &[(&str, &str)]) -> Self {
        Self {
            event_type: event as i32,
            data: data
                .iter()
                .map(|(name, value)| VoiceAssistantEventData {
                    name: (*name).to_string(),
                    value: (*value).to_string(),
                })
                .collect(),
        }
    }

    /// Look up a data value by name.
    #[must_use]
    pub fn data_value(&self, name: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.as_str())
    }
}

/// Raw microphone or TTS audio carried over the API connection
#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantAudio {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub end: bool,
}

/// Timer lifecycle event kinds sent by the hub
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum VoiceAssistantTimerEvent {
    Started = 0,
    Updated = 1,
    Cancelled = 2,
    Finished = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantTimerEventResponse {
    #[prost(enumeration = "VoiceAssistantTimerEvent", tag = "1")]
    pub event_type: i32,
    #[prost(string, tag = "2")]
    pub timer_id: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(uint32, tag = "4")]
    pub total_seconds: u32,
    #[prost(uint32, tag = "5")]
    pub seconds_left: u32,
    #[prost(bool, tag = "6")]
    pub is_active: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantAnnounceRequest {
    #[prost(string, tag = "1")]
    pub media_id: String,
    #[prost(string, tag = "2")]
    pub text: String,
    #[prost(string, tag = "3")]
    pub preannounce_media_id: String,
    #[prost(bool, tag = "4")]
    pub start_conversation: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantAnnounceFinished {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantConfigurationRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantWakeWord {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub wake_word: String,
    #[prost(string, repeated, tag = "3")]
    pub trained_languages: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantConfigurationResponse {
    #[prost(message, repeated, tag = "1")]
    pub available_wake_words: Vec<VoiceAssistantWakeWord>,
    #[prost(string, repeated, tag = "2")]
    pub active_wake_words: Vec<String>,
    #[prost(uint32, tag = "3")]
    pub max_active_wake_words: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct VoiceAssistantSetConfiguration {
    #[prost(string, repeated, tag = "1")]
    pub active_wake_words: Vec<String>,
}

/// A typed API message with its wire tag
///
/// Constructed by the producing component, immutable after construction, and
/// consumed exactly once by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiMessage {
    HelloRequest(HelloRequest),
    HelloResponse(HelloResponse),
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    DisconnectRequest(DisconnectRequest),
    DisconnectResponse(DisconnectResponse),
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    DeviceInfoRequest(DeviceInfoRequest),
    DeviceInfoResponse(DeviceInfoResponse),
    SubscribeVoiceAssistant(SubscribeVoiceAssistantRequest),
    VoiceRequest(VoiceAssistantRequest),
    VoiceResponse(VoiceAssistantResponse),
    VoiceEvent(VoiceAssistantEventResponse),
    VoiceAudio(VoiceAssistantAudio),
    TimerEvent(VoiceAssistantTimerEventResponse),
    AnnounceRequest(VoiceAssistantAnnounceRequest),
    AnnounceFinished(VoiceAssistantAnnounceFinished),
    ConfigurationRequest(VoiceAssistantConfigurationRequest),
    ConfigurationResponse(VoiceAssistantConfigurationResponse),
    SetConfiguration(VoiceAssistantSetConfiguration),
}

impl ApiMessage {
    /// The numeric message type tag used on the wire.
    #[must_use]
    pub const fn tag(&self) -> u32 {
        match self {
            Self::HelloRequest(_) => 1,
            Self::HelloResponse(_) => 2,
            Self::ConnectRequest(_) => 3,
            Self::ConnectResponse(_) => 4,
            Self::DisconnectRequest(_) => 5,
            Self::DisconnectResponse(_) => 6,
            Self::PingRequest(_) => 7,
            Self::PingResponse(_) => 8,
            Self::DeviceInfoRequest(_) => 9,
            Self::DeviceInfoResponse(_) => 10,
            Self::SubscribeVoiceAssistant(_) => 89,
            Self::VoiceRequest(_) => 90,
            Self::VoiceResponse(_) => 91,
            Self::VoiceEvent(_) => 92,
            Self::VoiceAudio(_) => 106,
            Self::TimerEvent(_) => 115,
            Self::AnnounceRequest(_) => 119,
            Self::AnnounceFinished(_) => 120,
            Self::ConfigurationRequest(_) => 121,
            Self::ConfigurationResponse(_) => 122,
            Self::SetConfiguration(_) => 123,
        }
    }

    /// Encode the payload (without framing) to bytes.
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::HelloRequest(m) => m.encode_to_vec(),
            Self::HelloResponse(m) => m.encode_to_vec(),
            Self::ConnectRequest(m) => m.encode_to_vec(),
            Self::ConnectResponse(m) => m.encode_to_vec(),
            Self::DisconnectRequest(m) => m.encode_to_vec(),
            Self::DisconnectResponse(m) => m.encode_to_vec(),
            Self::PingRequest(m) => m.encode_to_vec(),
            Self::PingResponse(m) => m.encode_to_vec(),
            Self::DeviceInfoRequest(m) => m.encode_to_vec(),
            Self::DeviceInfoResponse(m) => m.encode_to_vec(),
            Self::SubscribeVoiceAssistant(m) => m.encode_to_vec(),
            Self::VoiceRequest(m) => m.encode_to_vec(),
            Self::VoiceResponse(m) => m.encode_to_vec(),
            Self::VoiceEvent(m) => m.encode_to_vec(),
            Self::VoiceAudio(m) => m.encode_to_vec(),
            Self::TimerEvent(m) => m.encode_to_vec(),
            Self::AnnounceRequest(m) => m.encode_to_vec(),
            Self::AnnounceFinished(m) => m.encode_to_vec(),
            Self::ConfigurationRequest(m) => m.encode_to_vec(),
            Self::ConfigurationResponse(m) => m.encode_to_vec(),
            Self::SetConfiguration(m) => m.encode_to_vec(),
        }
    }

    /// Decode a payload for the given tag.
    ///
    /// Returns `Ok(None)` for tags not in the registry; the codec skips those
    /// frames and keeps reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid protobuf for the tag.
    pub fn decode(tag: u32, payload: &[u8]) -> Result<Option<Self>, prost::DecodeError> {
        let message = match tag {
            1 => Self::HelloRequest(HelloRequest::decode(payload)?),
            2 => Self::HelloResponse(HelloResponse::decode(payload)?),
            3 => Self::ConnectRequest(ConnectRequest::decode(payload)?),
            4 => Self::ConnectResponse(ConnectResponse::decode(payload)?),
            5 => Self::DisconnectRequest(DisconnectRequest::decode(payload)?),
            6 => Self::DisconnectResponse(DisconnectResponse::decode(payload)?),
            7 => Self::PingRequest(PingRequest::decode(payload)?),
            8 => Self::PingResponse(PingResponse::decode(payload)?),
            9 => Self::DeviceInfoRequest(DeviceInfoRequest::decode(payload)?),
            10 => Self::DeviceInfoResponse(DeviceInfoResponse::decode(payload)?),
            89 => Self::SubscribeVoiceAssistant(SubscribeVoiceAssistantRequest::decode(payload)?),
            90 => Self::VoiceRequest(VoiceAssistantRequest::decode(payload)?),
            91 => Self::VoiceResponse(VoiceAssistantResponse::decode(payload)?),
            92 => Self::VoiceEvent(VoiceAssistantEventResponse::decode(payload)?),
            106 => Self::VoiceAudio(VoiceAssistantAudio::decode(payload)?),
            115 => Self::TimerEvent(VoiceAssistantTimerEventResponse::decode(payload)?),
            119 => Self::AnnounceRequest(VoiceAssistantAnnounceRequest::decode(payload)?),
            120 => Self::AnnounceFinished(VoiceAssistantAnnounceFinished::decode(payload)?),
            121 => Self::ConfigurationRequest(VoiceAssistantConfigurationRequest::decode(payload)?),
            122 => {
                Self::ConfigurationResponse(VoiceAssistantConfigurationResponse::decode(payload)?)
            }
            123 => Self::SetConfiguration(VoiceAssistantSetConfiguration::decode(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_registry_is_bidirectional() {
        let messages = [
            ApiMessage::HelloRequest(HelloRequest::default()),
            ApiMessage::PingRequest(PingRequest::default()),
            ApiMessage::VoiceRequest(VoiceAssistantRequest {
                start: true,
                conversation_id: String::new(),
                wake_word_phrase: "hey_lark".to_string(),
            }),
            ApiMessage::VoiceAudio(VoiceAssistantAudio {
                data: vec![1, 2, 3],
                end: false,
            }),
            ApiMessage::AnnounceFinished(VoiceAssistantAnnounceFinished { success: true }),
        ];

        for message in messages {
            let decoded = ApiMessage::decode(message.tag(), &message.encode_payload())
                .unwrap()
                .unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn unknown_tag_decodes_to_none() {
        assert_eq!(ApiMessage::decode(9999, &[]).unwrap(), None);
    }

    #[test]
    fn event_data_lookup() {
        let event = VoiceAssistantEventResponse::new(
            VoiceAssistantEvent::RunStart,
            &[("url", "http://hub/tts.mp3")],
        );
        assert_eq!(event.data_value("url"), Some("http://hub/tts.mp3"));
        assert_eq!(event.data_value("missing"), None);
    }
}
