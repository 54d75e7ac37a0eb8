//! Gateway wire protocol shared by the server and the client.
//!
//! Every frame is a JSON envelope `{"t": "<event>", "d": {...}}`. The handshake
//! is the only exception: the first client frame is a bare
//! `{"auth_token": "..."}` object.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close code sent when the handshake is rejected.
pub const CLOSE_AUTH_FAILED: u16 = 4004;

// ---------------------------------------------------------------------------
// Presence status
// ---------------------------------------------------------------------------

/// A user's externally visible availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Dnd,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Dnd => "dnd",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown presence status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for PresenceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "dnd" => Ok(PresenceStatus::Dnd),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Routing key grouping the connections interested in one event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// Personal topic every connection joins at handshake.
    User(String),
    Channel(String),
    Dm(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicParseError {
    #[error("topic `{0}` has no kind prefix")]
    MissingKind(String),
    #[error("unknown topic kind `{0}`")]
    UnknownKind(String),
    #[error("invalid topic id `{0}`")]
    InvalidId(String),
}

/// Ids are opaque but must be non-empty and free of separators and whitespace.
pub fn validate_id(id: &str) -> Result<(), TopicParseError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.chars().any(|c| c == ':' || c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(TopicParseError::InvalidId(id.to_string()))
    }
}

impl Topic {
    pub fn user(id: impl Into<String>) -> Self {
        Topic::User(id.into())
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Topic::Channel(id.into())
    }

    pub fn dm(id: impl Into<String>) -> Self {
        Topic::Dm(id.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Topic::User(_) => "user",
            Topic::Channel(_) => "channel",
            Topic::Dm(_) => "dm",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Topic::User(id) | Topic::Channel(id) | Topic::Dm(id) => id,
        }
    }

    /// The conversation target for channel and dm topics. Personal topics have none.
    pub fn room_target(&self) -> Option<RoomTarget> {
        match self {
            Topic::User(_) => None,
            Topic::Channel(id) => Some(RoomTarget::Channel(id.clone())),
            Topic::Dm(id) => Some(RoomTarget::Dm(id.clone())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| TopicParseError::MissingKind(s.to_string()))?;
        validate_id(id)?;
        match kind {
            "user" => Ok(Topic::User(id.to_string())),
            "channel" => Ok(Topic::Channel(id.to_string())),
            "dm" => Ok(Topic::Dm(id.to_string())),
            other => Err(TopicParseError::UnknownKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

/// The `channel_id | dm_id` half of conversation-scoped payloads.
///
/// Flattened into its parent, so it serializes as a single
/// `"channel_id": ...` or `"dm_id": ...` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomTarget {
    #[serde(rename = "channel_id")]
    Channel(String),
    #[serde(rename = "dm_id")]
    Dm(String),
}

impl RoomTarget {
    pub fn topic(&self) -> Topic {
        match self {
            RoomTarget::Channel(id) => Topic::Channel(id.clone()),
            RoomTarget::Dm(id) => Topic::Dm(id.clone()),
        }
    }

    /// Validate the id and return the topic it routes to.
    pub fn validated_topic(&self) -> Result<Topic, TopicParseError> {
        match self {
            RoomTarget::Channel(id) | RoomTarget::Dm(id) => validate_id(id)?,
        }
        Ok(self.topic())
    }
}

// ---------------------------------------------------------------------------
// Server → Client events
// ---------------------------------------------------------------------------

/// One entry of the presence snapshot carried by `ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(default)]
    pub presences: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(flatten)]
    pub target: RoomTarget,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    #[serde(flatten)]
    pub target: RoomTarget,
    /// Opaque message body produced by the messaging service.
    pub message: Value,
}

/// Events pushed by the gateway to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d")]
pub enum ServerEvent {
    #[serde(rename = "ready")]
    Ready(ReadyPayload),
    #[serde(rename = "user_online")]
    UserOnline {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "user_offline")]
    UserOffline {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "user_status_update")]
    StatusUpdate {
        #[serde(rename = "userId")]
        user_id: String,
        status: PresenceStatus,
    },
    #[serde(rename = "user_typing")]
    Typing(TypingPayload),
    #[serde(rename = "user_stop_typing")]
    StopTyping(TypingPayload),
    #[serde(rename = "new_message")]
    NewMessage(NewMessagePayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ready(_) => "ready",
            ServerEvent::UserOnline { .. } => "user_online",
            ServerEvent::UserOffline { .. } => "user_offline",
            ServerEvent::StatusUpdate { .. } => "user_status_update",
            ServerEvent::Typing(_) => "user_typing",
            ServerEvent::StopTyping(_) => "user_stop_typing",
            ServerEvent::NewMessage(_) => "new_message",
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server events
// ---------------------------------------------------------------------------

/// First frame on every gateway connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSet {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub dms: Vec<String>,
}

impl RoomSet {
    /// Convert to topics, rejecting the whole set if any id is invalid.
    pub fn topics(&self) -> Result<Vec<Topic>, TopicParseError> {
        let mut topics = Vec::with_capacity(self.channels.len() + self.dms.len());
        for id in &self.channels {
            validate_id(id)?;
            topics.push(Topic::Channel(id.clone()));
        }
        for id in &self.dms {
            validate_id(id)?;
            topics.push(Topic::Dm(id.clone()));
        }
        Ok(topics)
    }
}

/// Events a connected client may send after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "t", content = "d", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRooms(RoomSet),
    LeaveRooms(RoomSet),
    TypingStart(TypingPayload),
    TypingStop(TypingPayload),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid `{event}` payload: {source}")]
    InvalidPayload {
        event: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    t: String,
    #[serde(default)]
    d: Value,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRooms(_) => "join_rooms",
            ClientEvent::LeaveRooms(_) => "leave_rooms",
            ClientEvent::TypingStart(_) => "typing_start",
            ClientEvent::TypingStop(_) => "typing_stop",
        }
    }

    /// Decode a text frame, distinguishing malformed JSON from unknown event
    /// names and from bad payloads of known events.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        let (event, d) = (raw.t.as_str(), raw.d);
        let invalid = |event: &'static str| {
            move |source: serde_json::Error| DecodeError::InvalidPayload { event, source }
        };
        match event {
            "join_rooms" => serde_json::from_value(d)
                .map(ClientEvent::JoinRooms)
                .map_err(invalid("join_rooms")),
            "leave_rooms" => serde_json::from_value(d)
                .map(ClientEvent::LeaveRooms)
                .map_err(invalid("leave_rooms")),
            "typing_start" => serde_json::from_value(d)
                .map(ClientEvent::TypingStart)
                .map_err(invalid("typing_start")),
            "typing_stop" => serde_json::from_value(d)
                .map(ClientEvent::TypingStop)
                .map_err(invalid("typing_stop")),
            _ => Err(DecodeError::UnknownEvent(raw.t)),
        }
    }
}
