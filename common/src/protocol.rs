//! Relay and peer wire formats.
//!
//! Relay messages are JSON with PascalCase keys. Peer application messages
//! ride on the data channel as `{type, data}` envelopes with kebab-case
//! internal message types.

use crate::clock::RemoteTimestamps;
use crate::error::{Result, SyncError};
use crate::time::{epoch_ms, Ticks};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Relay: inbound
// ---------------------------------------------------------------------------

/// Kinds of group lifecycle event sent by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupUpdateKind {
    PrepareSession,
    UserJoined,
    UserLeft,
    GroupJoined,
    GroupLeft,
    NotInGroup,
    GroupWait,
    GroupDoesNotExist,
    CreateGroupDenied,
    JoinGroupDenied,
    LibraryAccessDenied,
    /// Peer signaling relayed through the group channel.
    #[serde(rename = "WebRTC")]
    WebRtc,
}

/// A group lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupUpdate {
    // ---
    #[serde(rename = "Type")]
    pub kind: GroupUpdateKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl GroupUpdate {
    // ---
    pub fn new(kind: GroupUpdateKind, group_id: Option<String>, data: Option<Value>) -> Self {
        // ---
        Self {
            kind,
            group_id,
            data,
        }
    }

    /// `Data` as a plain string (user names, enable timestamps).
    pub fn data_str(&self) -> Option<&str> {
        // ---
        self.data.as_ref().and_then(Value::as_str)
    }

    /// `Data` decoded into `T`.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        // ---
        let data = self.data.clone().ok_or_else(|| {
            SyncError::MalformedMessage(format!("{:?} update without Data", self.kind))
        })?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Payload of a `PrepareSession` update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrepareSession {
    // ---
    pub group_id: String,
    pub playing_item_id: String,
}

/// Authoritative playback command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Play,
    Pause,
    Seek,
}

/// A playback command from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupCommand {
    // ---
    #[serde(rename = "Command")]
    pub kind: CommandKind,

    /// Server time the command takes effect.
    pub when: DateTime<Utc>,

    pub position_ticks: Ticks,

    /// Server time the command was emitted.
    pub emitted_at: DateTime<Utc>,
}

impl GroupCommand {
    // ---
    pub fn when_ms(&self) -> i64 {
        // ---
        epoch_ms(&self.when)
    }

    pub fn emitted_at_ms(&self) -> i64 {
        // ---
        epoch_ms(&self.emitted_at)
    }

    /// Same effect as `other`: identical kind, time and position.
    pub fn same_target(&self, other: &GroupCommand) -> bool {
        // ---
        self.kind == other.kind
            && self.when == other.when
            && self.position_ticks == other.position_ticks
    }
}

/// Messages pushed to us by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "MessageType", content = "Data")]
pub enum InboundMessage {
    SyncPlayGroupUpdate(GroupUpdate),
    SyncPlayCommand(GroupCommand),
}

impl InboundMessage {
    /// Parses relay text, mapping any decode failure to `MalformedMessage`.
    pub fn parse(text: &str) -> Result<Self> {
        // ---
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Relay: outbound
// ---------------------------------------------------------------------------

/// Messages we send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum OutboundMessage {
    RequestPlay,
    RequestPause,
    RequestSeek {
        #[serde(rename = "PositionTicks")]
        position_ticks: Ticks,
    },
    JoinGroup {
        #[serde(rename = "GroupId")]
        group_id: String,
        #[serde(rename = "PlayingItemId")]
        playing_item_id: String,
    },
    LeaveGroup,
    /// Latest round trip to the server, in milliseconds.
    Ping {
        #[serde(rename = "Ping")]
        ping_ms: i64,
    },
    Signal(PeerSignal),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String> {
        // ---
        Ok(serde_json::to_string(self)?)
    }
}

/// Server answer to a time probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UtcTimeResponse {
    // ---
    pub request_reception_time: DateTime<Utc>,
    pub response_transmission_time: DateTime<Utc>,
}

impl From<UtcTimeResponse> for RemoteTimestamps {
    fn from(resp: UtcTimeResponse) -> Self {
        // ---
        RemoteTimestamps {
            request_received: epoch_ms(&resp.request_reception_time),
            response_sent: epoch_ms(&resp.response_transmission_time),
        }
    }
}

// ---------------------------------------------------------------------------
// Peer signaling
// ---------------------------------------------------------------------------

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    // ---
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        // ---
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// What a signaling envelope carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    NewSession,
    SessionLeaving,
    Offer(String),
    Answer(String),
    IceCandidate(IceCandidate),
}

/// Signaling envelope as it appears on the relay.
///
/// Exactly one of the payload fields is expected to be set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerSignal {
    // ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_leaving: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,

    #[serde(
        rename = "ICECandidate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ice_candidate: Option<IceCandidate>,
}

impl PeerSignal {
    // ---
    pub fn new(from: Option<String>, to: Option<String>, payload: SignalPayload) -> Self {
        // ---
        let mut signal = PeerSignal {
            from,
            to,
            ..PeerSignal::default()
        };
        match payload {
            SignalPayload::NewSession => signal.new_session = Some(true),
            SignalPayload::SessionLeaving => signal.session_leaving = Some(true),
            SignalPayload::Offer(sdp) => signal.offer = Some(sdp),
            SignalPayload::Answer(sdp) => signal.answer = Some(sdp),
            SignalPayload::IceCandidate(c) => signal.ice_candidate = Some(c),
        }
        signal
    }

    /// Extracts the payload, rejecting envelopes that carry none.
    pub fn payload(&self) -> Result<SignalPayload> {
        // ---
        if self.new_session == Some(true) {
            return Ok(SignalPayload::NewSession);
        }
        if self.session_leaving == Some(true) {
            return Ok(SignalPayload::SessionLeaving);
        }
        if let Some(sdp) = &self.offer {
            return Ok(SignalPayload::Offer(sdp.clone()));
        }
        if let Some(sdp) = &self.answer {
            return Ok(SignalPayload::Answer(sdp.clone()));
        }
        if let Some(candidate) = &self.ice_candidate {
            return Ok(SignalPayload::IceCandidate(candidate.clone()));
        }
        Err(SyncError::MalformedMessage(
            "signaling envelope without payload".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Peer application messages
// ---------------------------------------------------------------------------

/// Who a peer message is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelClass {
    /// Consumed by the sync core itself.
    Internal,
    /// Passed through to the application.
    External,
}

/// Data-channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEnvelope {
    // ---
    #[serde(rename = "type")]
    pub class: ChannelClass,

    pub data: Value,
}

impl PeerEnvelope {
    pub fn parse(text: &str) -> Result<Self> {
        // ---
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub request_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    // ---
    pub request_id: u64,
    pub request_received: i64,
    pub response_sent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayName {
    pub name: String,
}

/// A peer's own view of the server clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSyncUpdate {
    pub offset_ms: f64,
    pub ping_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackDiff {
    pub diff_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackUpdatesRequest {
    pub enabled: bool,
}

/// Messages carried in `internal` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum InternalMessage {
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    DisplayName(DisplayName),
    TimeSyncServerUpdate(ServerSyncUpdate),
    PlaybackDiff(PlaybackDiff),
    PlaybackUpdatesRequest(PlaybackUpdatesRequest),
}

impl InternalMessage {
    // ---
    pub fn to_value(&self) -> Result<Value> {
        // ---
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        // ---
        Ok(serde_json::from_value(value)?)
    }
}
