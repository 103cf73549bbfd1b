//! # Calls
//!
//! One-to-one audio/video call negotiation over the relay.
//!
//! ## Negotiation Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CALL NEGOTIATION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Caller                         Relay                        Callee     │
//! │  ──────                         ─────                        ──────     │
//! │  calling   ── call_initiate ──►   │   ── incoming_call ──►   ringing    │
//! │                                   │                          (accept)   │
//! │                                   │                       acquire media │
//! │                                   │                       build peer    │
//! │            ◄── call_accepted ──   │   ◄── call_accept ────              │
//! │  connecting◄── receiver_ready ─   │   ◄── receiver_ready ─ connecting   │
//! │  acquire media, build peer        │                                     │
//! │            ── webrtc_offer ────►  │   ── webrtc_offer ───►              │
//! │                                   │                      set remote,    │
//! │                                   │                      drain ICE      │
//! │            ◄── webrtc_answer ──   │   ◄── webrtc_answer ──              │
//! │  set remote, drain ICE            │                                     │
//! │            ◄═══ webrtc_ice_candidate (both ways) ═══►                   │
//! │  connected                                                   connected  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`CallMachine`] is the pure transition function; [`CallAgent`] runs it as
//! an actor against real media devices, a peer connection and the relay.

mod agent;
mod machine;

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{IceCandidate, MediaKind, PeerInfo};

pub use agent::{
    CallAgent, CallHandle, LocalMedia, MediaDevices, PeerConnection, PeerConnector, PeerEvents,
    SignalSink,
};
pub use machine::{CallMachine, CallNotice, Command, Input, PeerState, TimerKind};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Correlation token binding every envelope of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Derive a fresh id from the participants and the creation time.
    ///
    /// The random suffix keeps two attempts created in the same millisecond
    /// apart.
    pub fn generate(caller_id: &str, callee_id: &str) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}-{}",
            caller_id,
            callee_id,
            Utc::now().timestamp_millis(),
            &nonce[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl PartialEq<str> for CallId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Which side of the call this client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Progress inside the `connecting` status.
///
/// Whether a remote description exists is a property of the step, so the
/// ICE queue can never disagree with the negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Waiting for camera/microphone, then for the peer connection built
    /// on them.
    AcquiringMedia,
    /// Callee: peer connection built, receiver-ready sent.
    AwaitingOffer,
    /// Caller: peer connection built, offer being created.
    CreatingOffer,
    /// Caller: offer sent.
    AwaitingAnswer,
    /// Callee: offer applied, answer being created.
    CreatingAnswer,
    /// Both descriptions applied; waiting for the transport to connect.
    Established,
}

impl Negotiation {
    pub fn has_remote_description(self) -> bool {
        matches!(self, Self::CreatingAnswer | Self::Established)
    }
}

/// Why a call ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    MediaUnavailable(String),
    PeerConnection(String),
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MediaUnavailable(reason) => write!(f, "media unavailable: {}", reason),
            Self::PeerConnection(reason) => write!(f, "peer connection failed: {}", reason),
            Self::Timeout => f.write_str("timed out"),
        }
    }
}

/// Status of a call session. Exactly one tag at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Calling,
    Ringing,
    Connecting(Negotiation),
    Connected,
    Ended,
    Failed(FailureReason),
    Rejected,
    Offline,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Failed(_) | Self::Rejected | Self::Offline
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal() && *self != Self::Idle
    }

    pub fn has_remote_description(&self) -> bool {
        match self {
            Self::Connecting(step) => step.has_remote_description(),
            Self::Connected => true,
            _ => false,
        }
    }

    /// Short lowercase name, as shown to users and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Connecting(_) => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Failed(_) => "failed",
            Self::Rejected => "rejected",
            Self::Offline => "offline",
        }
    }

    /// Whether `self → next` is an edge of the transition table for `role`.
    pub fn can_transition(&self, role: CallRole, next: &CallStatus) -> bool {
        use CallStatus::*;

        if self.is_terminal() {
            return false;
        }
        if let Failed(_) = next {
            return *self != Idle;
        }
        match (role, self, next) {
            (CallRole::Caller, Idle, Calling) => true,
            (CallRole::Caller, Calling, Connecting(Negotiation::AcquiringMedia)) => true,
            (CallRole::Caller, Calling, Rejected | Offline | Ended) => true,
            (CallRole::Callee, Idle, Ringing) => true,
            (CallRole::Callee, Ringing, Connecting(Negotiation::AcquiringMedia)) => true,
            (CallRole::Callee, Ringing, Ended) => true,
            (_, Connecting(_), Connecting(_) | Connected | Ended) => true,
            (_, Connected, Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Local camera/microphone track kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One call attempt as seen by this client.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: CallId,
    pub role: CallRole,
    /// The other participant
    pub peer_id: String,
    pub peer_info: PeerInfo,
    pub media_kind: MediaKind,
    status: CallStatus,
    /// Remote ICE candidates received before a remote description existed.
    ice_queue: VecDeque<IceCandidate>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl CallSession {
    fn new(
        call_id: CallId,
        role: CallRole,
        peer_id: String,
        peer_info: PeerInfo,
        media_kind: MediaKind,
        status: CallStatus,
    ) -> Self {
        Self {
            call_id,
            role,
            peer_id,
            peer_info,
            media_kind,
            status,
            ice_queue: VecDeque::new(),
            audio_enabled: true,
            video_enabled: media_kind.has_video(),
        }
    }

    pub fn status(&self) -> &CallStatus {
        &self.status
    }

    pub fn queued_ice(&self) -> usize {
        self.ice_queue.len()
    }

    /// Move along a table edge. Illegal edges leave the status untouched.
    fn transition(&mut self, next: CallStatus) -> bool {
        if !self.status.can_transition(self.role, &next) {
            tracing::warn!(
                call_id = %self.call_id,
                from = self.status.name(),
                to = next.name(),
                "Refusing illegal call transition"
            );
            return false;
        }
        tracing::debug!(
            call_id = %self.call_id,
            from = self.status.name(),
            to = next.name(),
            "Call transition"
        );
        self.status = next;
        true
    }
}

/// Read-only view of the call, published after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub call_id: Option<CallId>,
    pub role: Option<CallRole>,
    pub peer_id: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub status: CallStatus,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub queued_ice: usize,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            call_id: None,
            role: None,
            peer_id: None,
            media_kind: None,
            status: CallStatus::Idle,
            audio_enabled: false,
            video_enabled: false,
            queued_ice: 0,
        }
    }
}

impl From<&CallSession> for CallSnapshot {
    fn from(session: &CallSession) -> Self {
        Self {
            call_id: Some(session.call_id.clone()),
            role: Some(session.role),
            peer_id: Some(session.peer_id.clone()),
            media_kind: Some(session.media_kind),
            status: session.status.clone(),
            audio_enabled: session.audio_enabled,
            video_enabled: session.video_enabled,
            queued_ice: session.ice_queue.len(),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// Default STUN servers (free, public).
    pub fn default_stun() -> Vec<Self> {
        [
            "stun:stun.l.google.com:19302",
            "stun:stun1.l.google.com:3478",
            "stun:stun2.l.google.com:19302",
            "stun:stun3.l.google.com:3478",
            "stun:stun4.l.google.com:19302",
        ]
        .into_iter()
        .map(|url| Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        })
        .collect()
    }
}

/// Client-side call settings.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long `calling`/`ringing` may last. `None` waits forever.
    pub ring_timeout: Option<Duration>,
    /// How long `connecting` may last. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// How long a failed or offline call stays on screen.
    pub failure_dismiss: Duration,
    /// How long a rejected call stays on screen.
    pub rejected_dismiss: Duration,
    /// How long an ended call stays on screen.
    pub ended_dismiss: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Some(Duration::from_secs(45)),
            connect_timeout: Some(Duration::from_secs(30)),
            failure_dismiss: Duration::from_secs(2),
            rejected_dismiss: Duration::from_millis(1500),
            ended_dismiss: Duration::ZERO,
            ice_servers: IceServer::default_stun(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
