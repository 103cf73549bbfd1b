//! Relay protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol. Every frame is a
//! JSON object tagged by `type` in snake_case. Clients and the relay share
//! these definitions, so the call agent in this crate and the relay server
//! can never drift apart on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to the identity the handshake verified.
    /// Must be sent first after connecting.
    IdentityAnnounce { identity: String },

    /// Ask whether another identity is online.
    QueryPresence { identity: String },

    /// The sender started (or is still) typing in a conversation.
    TypingStart {
        conversation_id: String,
        recipient_id: String,
    },

    /// The sender stopped typing.
    TypingStop {
        conversation_id: String,
        recipient_id: String,
    },

    /// Forward an already-persisted message to its recipient.
    MessageRelay { message: ChatMessage },

    /// Tell the recipient that the sender deleted a message.
    MessageDeleted {
        message_id: String,
        recipient_id: String,
    },

    /// Mark messages as read by the sending identity.
    MarkRead { message_ids: Vec<String> },

    /// Add, replace or toggle off the sender's reaction on a message.
    ApplyReaction { message_id: String, emoji: String },

    /// Start a call. The relay answers `call_unreachable` if the callee
    /// has no live session.
    CallInitiate {
        call_id: String,
        callee_id: String,
        media_kind: MediaKind,
        caller_info: PeerInfo,
    },

    /// The callee accepted (UI notice for the caller).
    CallAccept {
        call_id: String,
        caller_id: String,
        callee_info: PeerInfo,
    },

    /// The callee has media and a peer connection; the caller may offer.
    ReceiverReady { call_id: String, caller_id: String },

    /// The callee declined (or could not take) the call.
    CallReject { call_id: String, caller_id: String },

    /// Either side hung up.
    CallEnd { call_id: String, peer_id: String },

    /// SDP offer for the peer.
    WebrtcOffer {
        call_id: String,
        recipient_id: String,
        sdp: SessionDescription,
    },

    /// SDP answer for the peer.
    WebrtcAnswer {
        call_id: String,
        recipient_id: String,
        sdp: SessionDescription,
    },

    /// A locally discovered ICE candidate for the peer.
    WebrtcIceCandidate {
        call_id: String,
        recipient_id: String,
        candidate: IceCandidate,
    },

    /// Ping to keep connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgement of a successful identity announcement.
    Registered { identity: String },

    /// A newer connection registered the same identity; this one is done.
    SessionReplaced,

    /// An identity came online or went offline.
    PresenceChanged {
        identity: String,
        is_online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    },

    /// Reply to `query_presence`.
    Presence(PresenceInfo),

    /// Typing indicator for a conversation.
    IsTyping {
        identity: String,
        conversation_id: String,
        is_typing: bool,
    },

    /// A message addressed to this client.
    MessageReceived { message: ChatMessage },

    /// The sender deleted a message.
    MessageDeleted { message_id: String },

    /// Delivery status of one of this client's messages changed.
    StatusChanged {
        message_id: String,
        status: MessageStatus,
    },

    /// Full reaction list of a message after an edit.
    ReactionChanged {
        message_id: String,
        reactions: Vec<Reaction>,
    },

    /// Someone is calling this client.
    IncomingCall {
        call_id: String,
        caller_id: String,
        media_kind: MediaKind,
        caller_info: PeerInfo,
    },

    /// The callee accepted.
    CallAccepted { call_id: String, callee_info: PeerInfo },

    /// The callee is ready for the offer.
    ReceiverReady { call_id: String },

    /// The callee declined.
    CallRejected { call_id: String },

    /// The peer hung up.
    CallEnded { call_id: String },

    /// The callee has no live session.
    CallUnreachable { call_id: String, callee_id: String },

    /// SDP offer from the peer.
    WebrtcOffer {
        call_id: String,
        sender_id: String,
        sdp: SessionDescription,
    },

    /// SDP answer from the peer.
    WebrtcAnswer {
        call_id: String,
        sender_id: String,
        sdp: SessionDescription,
    },

    /// ICE candidate from the peer.
    WebrtcIceCandidate {
        call_id: String,
        sender_id: String,
        candidate: IceCandidate,
    },

    /// Pong response to keep connection alive.
    Pong,

    /// Error response.
    Error { message: String },
}

impl ServerMessage {
    /// The call correlation id carried by call-related messages.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::CallAccepted { call_id, .. }
            | Self::ReceiverReady { call_id }
            | Self::CallRejected { call_id }
            | Self::CallEnded { call_id }
            | Self::CallUnreachable { call_id, .. }
            | Self::WebrtcOffer { call_id, .. }
            | Self::WebrtcAnswer { call_id, .. }
            | Self::WebrtcIceCandidate { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// Audio-only or audio + video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Whether the call carries a camera track.
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Display details one participant shows the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Whether an SDP blob is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description negotiated between two peer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A single ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string
    pub candidate: String,
    /// SDP mid
    pub sdp_mid: Option<String>,
    /// SDP m-line index
    pub sdp_m_line_index: Option<u16>,
}

/// Delivery status of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// One user's reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
}

/// A direct message as persisted by the message store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
}

fn default_content_type() -> String {
    "text".to_string()
}

/// Online status of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub identity: String,
    pub is_online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}
