use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from a client to the relay.
///
/// Every field is optional on the wire: a missing channel id is answered with an error, a
/// missing signaling destination or payload is dropped without a reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Go live on a channel, taking ownership of it
    #[serde(rename_all = "camelCase")]
    StartBroadcast {
        #[serde(default, alias = "masjidId")]
        channel_id: Option<String>,
    },
    /// End a live channel
    #[serde(rename_all = "camelCase")]
    StopBroadcast {
        #[serde(default, alias = "masjidId")]
        channel_id: Option<String>,
    },
    /// Subscribe to a channel as a listener
    #[serde(rename_all = "camelCase")]
    JoinBroadcast {
        #[serde(default, alias = "masjidId")]
        channel_id: Option<String>,
    },
    /// Unsubscribe from a channel
    #[serde(rename_all = "camelCase")]
    LeaveBroadcast {
        #[serde(default, alias = "masjidId")]
        channel_id: Option<String>,
    },
    /// WebRTC session description offer for one peer
    Offer {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        offer: Option<Value>,
    },
    /// WebRTC session description answer for one peer
    Answer {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        answer: Option<Value>,
    },
    /// Trickled ICE candidate for one peer
    IceCandidate {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        candidate: Option<Value>,
    },
    /// Audio chunk for server-relayed fallback mode
    #[serde(rename_all = "camelCase")]
    AudioData {
        #[serde(default, alias = "masjidId")]
        channel_id: Option<String>,
        #[serde(default)]
        audio: Option<Value>,
        #[serde(default)]
        timestamp: Option<Value>,
    },
    /// Heartbeat to keep connection alive
    Ping,
}

impl ClientMessage {
    /// Wire name of the message kind, used for logging and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::StartBroadcast { .. } => "start-broadcast",
            ClientMessage::StopBroadcast { .. } => "stop-broadcast",
            ClientMessage::JoinBroadcast { .. } => "join-broadcast",
            ClientMessage::LeaveBroadcast { .. } => "leave-broadcast",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::AudioData { .. } => "audio-data",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Acknowledge a new connection with its relay-assigned id
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },
    /// A channel went live (sent to every connection)
    #[serde(rename_all = "camelCase")]
    BroadcastStarted { channel_id: String },
    /// Status of the caller's own broadcast
    #[serde(rename_all = "camelCase")]
    BroadcastStatus {
        status: BroadcastStatus,
        channel_id: String,
    },
    /// A channel ended (sent to its topic members)
    #[serde(rename_all = "camelCase")]
    BroadcastStopped { channel_id: String },
    /// Current listener count (sent to the owner)
    ListenerCount { count: usize },
    /// A listener joined (sent to the owner so it can open a peer connection)
    #[serde(rename_all = "camelCase")]
    ListenerJoined { listener_id: String },
    /// A listener left or disconnected (sent to the owner)
    #[serde(rename_all = "camelCase")]
    ListenerLeft { listener_id: String },
    /// Join confirmation
    #[serde(rename_all = "camelCase")]
    JoinedBroadcast { channel_id: String, success: bool },
    /// Error message
    Error { message: String },
    Offer { from: String, offer: Value },
    Answer { from: String, answer: Value },
    IceCandidate { from: String, candidate: Value },
    /// Relayed audio chunk
    AudioStream {
        audio: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    /// Response to ping
    Pong,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Live,
}

/// Negotiation message kinds forwarded point-to-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    /// Wrap a forwarded payload under the same kind name, tagged with the sender.
    pub fn forward(self, from: String, payload: Value) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::Offer {
                from,
                offer: payload,
            },
            SignalKind::Answer => ServerMessage::Answer {
                from,
                answer: payload,
            },
            SignalKind::IceCandidate => ServerMessage::IceCandidate {
                from,
                candidate: payload,
            },
        }
    }
}
