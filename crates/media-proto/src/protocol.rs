use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::record::{clamp_volume, AggregateView, MediaReport, TabMediaRecord};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Peers announce it in `HELLO` and the daemon refuses
/// mismatched ones.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Opaque browser tab handle, assigned by the browser.
pub type TabId = i64;

/// Error text for requests whose `type` is not understood.
pub const UNKNOWN_MESSAGE_TYPE: &str = "Unknown message type";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    FrameTooLarge(usize),
    #[error("Unknown message type")]
    UnknownType,
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("action '{action}' requires data.{field}")]
    MissingPayload {
        action: &'static str,
        field: &'static str,
    },
    #[error("seek time must be a non-negative number of seconds")]
    InvalidSeek,
}

/// What kind of peer is on the other end of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Role {
    /// Per-tab agent that reports media state and executes commands.
    Source {
        #[serde(default)]
        tab_id: Option<TabId>,
        #[serde(default)]
        url: Option<String>,
    },
    /// Popup / dashboard / CLI.  Receives `MEDIA_UPDATE` pushes.
    Consumer,
    /// Tab lifecycle feed.  Receives `ENSURE_SOURCE` requests.
    Browser,
}

/// Messages sent to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    Hello {
        protocol_version: u32,
        role: Role,
    },
    MediaDetected {
        data: MediaReport,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    MediaStateChanged {
        data: MediaReport,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    GetMediaState,
    ControlMedia {
        action: String,
        #[serde(default)]
        data: ControlData,
    },
    Ping,
    /// A source's answer to `GET_CURRENT_STATE`.
    CurrentState {
        #[serde(default)]
        data: Option<MediaReport>,
    },
    ListTabs,
    TabUpdated {
        tab_id: TabId,
        url: String,
        #[serde(default)]
        complete: bool,
    },
    TabRemoved {
        tab_id: TabId,
    },
}

const REQUEST_TYPES: &[&str] = &[
    "HELLO",
    "MEDIA_DETECTED",
    "MEDIA_STATE_CHANGED",
    "GET_MEDIA_STATE",
    "CONTROL_MEDIA",
    "PING",
    "CURRENT_STATE",
    "LIST_TABS",
    "TAB_UPDATED",
    "TAB_REMOVED",
];

impl Request {
    /// Parse a frame body.  A body whose `type` is missing or not one of ours
    /// is `UnknownType`; a known type with a bad payload is `Json`.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| ProtocolError::UnknownType)?;
        let known = value
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| REQUEST_TYPES.contains(&t));
        if !known {
            return Err(ProtocolError::UnknownType);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }
}

/// Messages sent from the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Outgoing {
    /// Exactly one per request.
    Response(Response),
    ControlCommand {
        action: String,
        data: ControlData,
    },
    GetCurrentState,
    MediaUpdate {
        data: AggregateView,
    },
    EnsureSource {
        tab_id: TabId,
    },
    /// WARN/ERROR log line from the daemon.
    Log {
        message: String,
    },
}

impl Outgoing {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn control(control: &Control) -> Self {
        Outgoing::ControlCommand {
            action: control.action().to_string(),
            data: control.data(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<AggregateView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<TabMediaRecord>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pong: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn state(view: AggregateView) -> Self {
        Self {
            data: Some(view),
            ..Self::ok()
        }
    }

    pub fn tabs(tabs: Vec<TabMediaRecord>) -> Self {
        Self {
            tabs: Some(tabs),
            ..Self::ok()
        }
    }

    pub fn pong() -> Self {
        Self {
            pong: true,
            ..Self::ok()
        }
    }

    pub fn welcome() -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION),
            ..Self::ok()
        }
    }
}

/// Payload of `CONTROL_MEDIA` / `CONTROL_COMMAND`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ControlData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

/// A validated playback command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    /// 0-100
    Volume(u8),
    /// Absolute position in seconds.
    Seek(f64),
}

impl Control {
    pub fn parse(action: &str, data: &ControlData) -> Result<Self, ControlError> {
        match action {
            "play" => Ok(Control::Play),
            "pause" => Ok(Control::Pause),
            "toggle" => Ok(Control::Toggle),
            "next" => Ok(Control::Next),
            "previous" => Ok(Control::Previous),
            "volume" => data
                .volume
                .map(|v| Control::Volume(clamp_volume(v)))
                .ok_or(ControlError::MissingPayload {
                    action: "volume",
                    field: "volume",
                }),
            "seek" => match data.time {
                Some(t) if t.is_finite() && t >= 0.0 => Ok(Control::Seek(t)),
                Some(_) => Err(ControlError::InvalidSeek),
                None => Err(ControlError::MissingPayload {
                    action: "seek",
                    field: "time",
                }),
            },
            other => Err(ControlError::UnknownAction(other.to_string())),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Control::Play => "play",
            Control::Pause => "pause",
            Control::Toggle => "toggle",
            Control::Next => "next",
            Control::Previous => "previous",
            Control::Volume(_) => "volume",
            Control::Seek(_) => "seek",
        }
    }

    pub fn data(&self) -> ControlData {
        match *self {
            Control::Volume(v) => ControlData {
                volume: Some(f64::from(v)),
                time: None,
            },
            Control::Seek(t) => ControlData {
                volume: None,
                time: Some(t),
            },
            _ => ControlData::default(),
        }
    }
}

// ── framing ───────────────────────────────────────────────────────────────────

/// Serialise `msg` as a length-prefixed frame: 4-byte big-endian length
/// followed by the JSON body.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(json.len()));
    }
    let len = json.len() as u32;
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&json);
    Ok(result)
}

/// Find the first complete frame in `data`.  Returns the body and the total
/// number of bytes it occupies, or `None` if more data is needed.
pub fn split_frame(data: &[u8]) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    if data.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    if data.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some((&data[4..4 + len], 4 + len)))
}

/// Decode the first complete frame in `data` as `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<Option<(T, usize)>, ProtocolError> {
    match split_frame(data)? {
        Some((body, consumed)) => Ok(Some((serde_json::from_slice(body)?, consumed))),
        None => Ok(None),
    }
}
