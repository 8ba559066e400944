//! Documents exchanged with the remote peer over the control channel.
//!
//! Every document is a JSON object with a one-letter type tag `t`.

use serde::{Deserialize, Serialize};

/// Type tag of a reconfiguration command.
pub const RECONFIGURE: &str = "R";

/// An inbound control document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "t", default)]
    pub tag: String,
    /// Target group: 0 audio, 1 video.
    #[serde(rename = "g", default)]
    pub group: Option<i64>,
    /// Payload kind: 0 session description, 1 transport descriptor.
    #[serde(rename = "k", default)]
    pub kind: Option<i64>,
    #[serde(rename = "v", default)]
    pub value: Option<String>,
}

/// Changed input state for one capture tick. Unchanged fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InputMessage {
    /// Released keys, then held keys.
    #[serde(rename = "k", skip_serializing_if = "Option::is_none")]
    pub keys: Option<[Vec<u32>; 2]>,
    #[serde(rename = "m", skip_serializing_if = "Option::is_none")]
    pub mouse: Option<[f32; 2]>,
    #[serde(rename = "b", skip_serializing_if = "Option::is_none")]
    pub buttons: Option<u32>,
    #[serde(rename = "w", skip_serializing_if = "Option::is_none")]
    pub wheel: Option<[i32; 2]>,
    #[serde(rename = "a", skip_serializing_if = "Option::is_none")]
    pub axes: Option<[i16; 6]>,
    #[serde(rename = "c", skip_serializing_if = "Option::is_none")]
    pub gamepad_buttons: Option<u32>,
}

impl InputMessage {
    pub fn is_empty(&self) -> bool {
        *self == InputMessage::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t")]
pub enum Outbound {
    #[serde(rename = "k")]
    KeepAlive,
    #[serde(rename = "r")]
    Request { q: String },
    #[serde(rename = "i")]
    Input(InputMessage),
}

impl Outbound {
    /// Asks the peer to start streaming over RTP.
    pub fn rtp_request() -> Self {
        Outbound::Request { q: "rtp".to_string() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
