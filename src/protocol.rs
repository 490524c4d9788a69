use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::statistics::StatsSnapshot;

/// The declared purpose of a pairing request.
///
/// `hire` and `freelance` pair with each other; every other intent pairs
/// with itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Casual,
    Pitch,
    Collab,
    Hire,
    Freelance,
    Review,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Casual,
        Intent::Pitch,
        Intent::Collab,
        Intent::Hire,
        Intent::Freelance,
        Intent::Review,
    ];

    /// The intent of the queue a peer is drawn from.
    pub fn target(self) -> Intent {
        match self {
            Intent::Hire => Intent::Freelance,
            Intent::Freelance => Intent::Hire,
            other => other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Casual => "casual",
            Intent::Pitch => "pitch",
            Intent::Collab => "collab",
            Intent::Hire => "hire",
            Intent::Freelance => "freelance",
            Intent::Review => "review",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "casual" => Self::Casual,
            "pitch" => Self::Pitch,
            "collab" => Self::Collab,
            "hire" => Self::Hire,
            "freelance" => Self::Freelance,
            "review" => Self::Review,
            _ => return Err(format!("unknown intent: {value}")),
        })
    }
}

/// The declared communication modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Video,
    Chat,
}

impl Medium {
    pub const ALL: [Medium; 2] = [Medium::Video, Medium::Chat];

    pub fn as_str(self) -> &'static str {
        match self {
            Medium::Video => "video",
            Medium::Chat => "chat",
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Medium {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "video" => Self::Video,
            "chat" => Self::Chat,
            _ => return Err(format!("unknown medium: {value}")),
        })
    }
}

/// Typed webrtc control message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// A webrtc control message forwarded between the two participants of a
/// room. The payload is opaque to the server; only its size is checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Commands received from a client over the long-lived connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    /// Authentication handshake, must be the first frame.
    Auth { token: String },
    JoinQueue {
        mode: Intent,
        connection_type: Medium,
        #[serde(default)]
        seq: Option<u64>,
    },
    Next {
        room_id: String,
        mode: Intent,
        connection_type: Medium,
        #[serde(default)]
        seq: Option<u64>,
    },
    Leave {
        #[serde(default)]
        room_id: Option<String>,
    },
    Signal {
        room_id: String,
        target_id: String,
        signal: SignalEnvelope,
    },
    GetStats,
    Ping,
}

/// Events pushed to a client over the long-lived connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    AuthOk {
        session_id: String,
    },
    Matched {
        room_id: String,
        peer_id: String,
        is_initiator: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    Waiting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    PeerLeft,
    PeerSkipped,
    Signal {
        signal: SignalEnvelope,
        from_id: String,
    },
    Stats(StatsSnapshot),
    Error {
        message: String,
    },
    AuthError {
        message: String,
    },
    Pong,
    ShuttingDown,
}

/// Cross-instance message carried on the `user:<session>` pub/sub topic.
///
/// Everything the rest of the system wants a session's client to see goes
/// through here; only the gateway instance holding the connection touches
/// transport details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case")]
pub enum BusEvent {
    /// Deliver an event to the session's client verbatim.
    Deliver(ServerEvent),
    /// Force the session off the service after a ui-visible warning delay.
    ForceDisconnect { warning_secs: u64 },
}

impl BusEvent {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}
