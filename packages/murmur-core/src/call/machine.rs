//! Sans-IO call negotiation.
//!
//! [`CallMachine::handle`] consumes one [`Input`] and returns the
//! [`Command`]s the driver must execute, in order. It never blocks, sleeps
//! or touches a device, so every transition can be tested synchronously.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{
    ClientMessage, IceCandidate, MediaKind, PeerInfo, ServerMessage, SessionDescription,
};

use super::{
    CallConfig, CallId, CallRole, CallSession, CallSnapshot, CallStatus, FailureReason,
    Negotiation, TrackKind,
};

// ── Inputs & Commands ─────────────────────────────────────────────────────────

/// Transport state reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Timers the machine can ask the driver to arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Bounds `calling` / `ringing`.
    Ring,
    /// Bounds `connecting`.
    Connect,
    /// Clears a terminal session from view.
    Dismiss,
}

/// Everything that can happen to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    // User actions
    StartCall {
        callee_id: String,
        callee_info: PeerInfo,
        media_kind: MediaKind,
    },
    Accept,
    Reject,
    HangUp,
    ToggleAudio,
    ToggleVideo,
    Dismiss,

    /// An envelope from the relay.
    Relay(ServerMessage),

    // Effect completions
    MediaAcquired {
        call_id: CallId,
    },
    MediaFailed {
        call_id: CallId,
        reason: String,
    },
    OfferCreated {
        call_id: CallId,
        sdp: SessionDescription,
    },
    AnswerCreated {
        call_id: CallId,
        sdp: SessionDescription,
    },
    PeerCreated {
        call_id: CallId,
    },
    PeerFailed {
        call_id: CallId,
        reason: String,
    },

    // Peer connection events
    LocalIceCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    ConnectionState {
        call_id: CallId,
        state: PeerState,
    },

    TimerElapsed {
        call_id: CallId,
        timer: TimerKind,
    },
}

/// Effects requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(ClientMessage),
    AcquireMedia {
        call_id: CallId,
        media_kind: MediaKind,
    },
    /// Stop tracks acquired for a call the machine no longer expects media for.
    DiscardMedia {
        call_id: CallId,
    },
    CreatePeerConnection {
        call_id: CallId,
    },
    CreateOffer {
        call_id: CallId,
    },
    CreateAnswer {
        call_id: CallId,
    },
    SetRemoteDescription {
        call_id: CallId,
        sdp: SessionDescription,
    },
    AddIceCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    SetTrackEnabled {
        track: TrackKind,
        enabled: bool,
    },
    ReleaseMedia,
    ClosePeerConnection,
    ArmTimer {
        call_id: CallId,
        timer: TimerKind,
        after: Duration,
    },
    Notify(CallNotice),
}

/// User-facing call events.
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    Incoming {
        call_id: CallId,
        caller_id: String,
        caller_info: PeerInfo,
        media_kind: MediaKind,
    },
    Accepted {
        call_id: CallId,
        callee_info: PeerInfo,
    },
    Connected {
        call_id: CallId,
    },
    UserOffline {
        call_id: CallId,
    },
    Rejected {
        call_id: CallId,
    },
    Missed {
        call_id: CallId,
    },
    Ended {
        call_id: CallId,
    },
    Failed {
        call_id: CallId,
        reason: FailureReason,
    },
    Dismissed {
        call_id: CallId,
    },
}

impl CallNotice {
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Incoming { call_id, .. }
            | Self::Accepted { call_id, .. }
            | Self::Connected { call_id }
            | Self::UserOffline { call_id }
            | Self::Rejected { call_id }
            | Self::Missed { call_id }
            | Self::Ended { call_id }
            | Self::Failed { call_id, .. }
            | Self::Dismissed { call_id } => call_id,
        }
    }

    /// Text for a toast or banner. `None` for purely structural notices.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Incoming { caller_info, .. } => {
                Some(format!("{} is calling", caller_info.username))
            }
            Self::Accepted { .. } => Some("Call accepted".to_string()),
            Self::Connected { .. } => Some("Connected".to_string()),
            Self::UserOffline { .. } => Some("User is offline".to_string()),
            Self::Rejected { .. } => Some("Call rejected".to_string()),
            Self::Missed { .. } => Some("Missed call".to_string()),
            Self::Ended { .. } => Some("Call ended".to_string()),
            Self::Failed { .. } => Some("Connection failed".to_string()),
            Self::Dismissed { .. } => None,
        }
    }
}

// ── Machine ───────────────────────────────────────────────────────────────────

/// Call negotiation for one client identity.
///
/// Holds at most one session. A terminal session stays until dismissed so
/// the UI can show how the call ended.
#[derive(Debug)]
pub struct CallMachine {
    identity: String,
    profile: PeerInfo,
    config: CallConfig,
    session: Option<CallSession>,
}

impl CallMachine {
    pub fn new(identity: impl Into<String>, profile: PeerInfo, config: CallConfig) -> Self {
        Self {
            identity: identity.into(),
            profile,
            config,
            session: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn status(&self) -> CallStatus {
        self.session
            .as_ref()
            .map(|s| s.status.clone())
            .unwrap_or(CallStatus::Idle)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.session
            .as_ref()
            .map(CallSnapshot::from)
            .unwrap_or_else(CallSnapshot::idle)
    }

    /// Apply one input. Only user actions can fail; everything arriving from
    /// the network or the driver is either applied or dropped.
    pub fn handle(&mut self, input: Input) -> Result<Vec<Command>> {
        match input {
            Input::StartCall {
                callee_id,
                callee_info,
                media_kind,
            } => self.start_call(callee_id, callee_info, media_kind),
            Input::Accept => self.accept(),
            Input::Reject => self.reject(),
            Input::HangUp => self.hang_up(),
            Input::ToggleAudio => self.toggle(TrackKind::Audio),
            Input::ToggleVideo => self.toggle(TrackKind::Video),
            Input::Dismiss => self.dismiss(),
            Input::Relay(message) => Ok(self.on_relay(message)),
            Input::MediaAcquired { call_id } => Ok(self.on_media_acquired(call_id)),
            Input::MediaFailed { call_id, reason } => Ok(self.on_media_failed(&call_id, reason)),
            Input::OfferCreated { call_id, sdp } => Ok(self.on_offer_created(&call_id, sdp)),
            Input::AnswerCreated { call_id, sdp } => Ok(self.on_answer_created(&call_id, sdp)),
            Input::PeerCreated { call_id } => Ok(self.on_peer_created(&call_id)),
            Input::PeerFailed { call_id, reason } => Ok(self.on_peer_failed(&call_id, reason)),
            Input::LocalIceCandidate { call_id, candidate } => {
                Ok(self.on_local_candidate(&call_id, candidate))
            }
            Input::ConnectionState { call_id, state } => {
                Ok(self.on_connection_state(&call_id, state))
            }
            Input::TimerElapsed { call_id, timer } => Ok(self.on_timer(&call_id, timer)),
        }
    }

    // ── User actions ──────────────────────────────────────────────────────────

    fn start_call(
        &mut self,
        callee_id: String,
        callee_info: PeerInfo,
        media_kind: MediaKind,
    ) -> Result<Vec<Command>> {
        if let Some(session) = self.live_session() {
            return Err(Error::CallInProgress(session.call_id.to_string()));
        }
        if callee_id == self.identity {
            return Err(Error::InvalidTransition {
                action: "call yourself",
                status: CallStatus::Idle.to_string(),
            });
        }

        let call_id = CallId::generate(&self.identity, &callee_id);
        tracing::info!(call_id = %call_id, callee = %callee_id, "Starting call");

        let mut commands = vec![Command::Send(ClientMessage::CallInitiate {
            call_id: call_id.to_string(),
            callee_id: callee_id.clone(),
            media_kind,
            caller_info: self.profile.clone(),
        })];
        if let Some(after) = self.config.ring_timeout {
            commands.push(Command::ArmTimer {
                call_id: call_id.clone(),
                timer: TimerKind::Ring,
                after,
            });
        }

        self.session = Some(CallSession::new(
            call_id,
            CallRole::Caller,
            callee_id,
            callee_info,
            media_kind,
            CallStatus::Calling,
        ));
        Ok(commands)
    }

    fn accept(&mut self) -> Result<Vec<Command>> {
        let session = self.require_session("accept")?;
        if session.role != CallRole::Callee || session.status != CallStatus::Ringing {
            return Err(invalid("accept", &session.status));
        }
        session.transition(CallStatus::Connecting(Negotiation::AcquiringMedia));
        let call_id = session.call_id.clone();

        let mut commands = vec![Command::AcquireMedia {
            call_id: call_id.clone(),
            media_kind: session.media_kind,
        }];
        if let Some(after) = self.config.connect_timeout {
            commands.push(Command::ArmTimer {
                call_id,
                timer: TimerKind::Connect,
                after,
            });
        }
        Ok(commands)
    }

    fn reject(&mut self) -> Result<Vec<Command>> {
        let session = self.require_session("reject")?;
        if session.role != CallRole::Callee || session.status != CallStatus::Ringing {
            return Err(invalid("reject", &session.status));
        }
        let goodbye = ClientMessage::CallReject {
            call_id: session.call_id.to_string(),
            caller_id: session.peer_id.clone(),
        };
        let call_id = session.call_id.clone();
        Ok(self.terminate(
            CallStatus::Ended,
            Some(goodbye),
            CallNotice::Ended { call_id },
        ))
    }

    fn hang_up(&mut self) -> Result<Vec<Command>> {
        let session = self.require_session("hang up")?;
        if !session.status.is_live() {
            return Err(invalid("hang up", &session.status));
        }
        if session.role == CallRole::Callee && session.status == CallStatus::Ringing {
            return self.reject();
        }
        let goodbye = ClientMessage::CallEnd {
            call_id: session.call_id.to_string(),
            peer_id: session.peer_id.clone(),
        };
        let call_id = session.call_id.clone();
        Ok(self.terminate(
            CallStatus::Ended,
            Some(goodbye),
            CallNotice::Ended { call_id },
        ))
    }

    fn toggle(&mut self, track: TrackKind) -> Result<Vec<Command>> {
        let action = match track {
            TrackKind::Audio => "toggle audio",
            TrackKind::Video => "toggle video",
        };
        let session = self.require_session(action)?;
        if !matches!(
            session.status,
            CallStatus::Connecting(_) | CallStatus::Connected
        ) {
            return Err(invalid(action, &session.status));
        }

        let enabled = match track {
            TrackKind::Audio => {
                session.audio_enabled = !session.audio_enabled;
                session.audio_enabled
            }
            TrackKind::Video => {
                if !session.media_kind.has_video() {
                    return Err(invalid(action, &session.status));
                }
                session.video_enabled = !session.video_enabled;
                session.video_enabled
            }
        };
        Ok(vec![Command::SetTrackEnabled { track, enabled }])
    }

    fn dismiss(&mut self) -> Result<Vec<Command>> {
        let Some(session) = &self.session else {
            return Ok(Vec::new());
        };
        if !session.status.is_terminal() {
            return Err(invalid("dismiss", &session.status));
        }
        Ok(self.clear())
    }

    // ── Relay events ──────────────────────────────────────────────────────────

    fn on_relay(&mut self, message: ServerMessage) -> Vec<Command> {
        match message {
            ServerMessage::IncomingCall {
                call_id,
                caller_id,
                media_kind,
                caller_info,
            } => self.on_incoming(call_id.into(), caller_id, media_kind, caller_info),

            ServerMessage::CallUnreachable { call_id, callee_id } => {
                if self.expect(&call_id, CallRole::Caller, |s| *s == CallStatus::Calling) {
                    tracing::info!(call_id = %call_id, callee = %callee_id, "Callee is offline");
                    return self.terminate(
                        CallStatus::Offline,
                        None,
                        CallNotice::UserOffline {
                            call_id: call_id.into(),
                        },
                    );
                }
                Vec::new()
            }

            ServerMessage::CallAccepted {
                call_id,
                callee_info,
            } => {
                if !self.expect(&call_id, CallRole::Caller, |s| {
                    matches!(s, CallStatus::Calling | CallStatus::Connecting(_))
                }) {
                    return Vec::new();
                }
                if let Some(session) = self.session.as_mut() {
                    session.peer_info = callee_info.clone();
                }
                vec![Command::Notify(CallNotice::Accepted {
                    call_id: call_id.into(),
                    callee_info,
                })]
            }

            ServerMessage::ReceiverReady { call_id } => {
                if !self.expect(&call_id, CallRole::Caller, |s| *s == CallStatus::Calling) {
                    return Vec::new();
                }
                let Some(session) = self.session.as_mut() else {
                    return Vec::new();
                };
                session.transition(CallStatus::Connecting(Negotiation::AcquiringMedia));
                let mut commands = vec![Command::AcquireMedia {
                    call_id: session.call_id.clone(),
                    media_kind: session.media_kind,
                }];
                if let Some(after) = self.config.connect_timeout {
                    commands.push(Command::ArmTimer {
                        call_id: session.call_id.clone(),
                        timer: TimerKind::Connect,
                        after,
                    });
                }
                commands
            }

            ServerMessage::CallRejected { call_id } => {
                let status = match self.current(&call_id) {
                    Some(session) if session.role == CallRole::Caller => session.status.clone(),
                    _ => return Vec::new(),
                };
                match status {
                    CallStatus::Calling => self.terminate(
                        CallStatus::Rejected,
                        None,
                        CallNotice::Rejected {
                            call_id: call_id.into(),
                        },
                    ),
                    CallStatus::Connecting(_) | CallStatus::Connected => self.terminate(
                        CallStatus::Ended,
                        None,
                        CallNotice::Ended {
                            call_id: call_id.into(),
                        },
                    ),
                    _ => Vec::new(),
                }
            }

            ServerMessage::CallEnded { call_id } => {
                if !self.current(&call_id).is_some_and(|s| s.status.is_live()) {
                    return Vec::new();
                }
                tracing::info!(call_id = %call_id, "Peer ended the call");
                self.terminate(
                    CallStatus::Ended,
                    None,
                    CallNotice::Ended {
                        call_id: call_id.into(),
                    },
                )
            }

            ServerMessage::WebrtcOffer {
                call_id,
                sender_id,
                sdp,
            } => {
                let expected = CallStatus::Connecting(Negotiation::AwaitingOffer);
                if !self.expect_from(&call_id, &sender_id, CallRole::Callee, |s| *s == expected) {
                    return Vec::new();
                }
                let Some(session) = self.session.as_mut() else {
                    return Vec::new();
                };
                session.transition(CallStatus::Connecting(Negotiation::CreatingAnswer));
                let call_id = session.call_id.clone();
                let mut commands = vec![Command::SetRemoteDescription {
                    call_id: call_id.clone(),
                    sdp,
                }];
                commands.extend(drain_ice(session));
                commands.push(Command::CreateAnswer { call_id });
                commands
            }

            ServerMessage::WebrtcAnswer {
                call_id,
                sender_id,
                sdp,
            } => {
                let expected = CallStatus::Connecting(Negotiation::AwaitingAnswer);
                if !self.expect_from(&call_id, &sender_id, CallRole::Caller, |s| *s == expected) {
                    return Vec::new();
                }
                let Some(session) = self.session.as_mut() else {
                    return Vec::new();
                };
                session.transition(CallStatus::Connecting(Negotiation::Established));
                let mut commands = vec![Command::SetRemoteDescription {
                    call_id: session.call_id.clone(),
                    sdp,
                }];
                commands.extend(drain_ice(session));
                commands
            }

            ServerMessage::WebrtcIceCandidate {
                call_id,
                sender_id,
                candidate,
            } => {
                let Some(session) = self.current(&call_id) else {
                    return Vec::new();
                };
                if session.peer_id != sender_id || !session.status.is_live() {
                    tracing::debug!(call_id = %call_id, "Dropping stray ICE candidate");
                    return Vec::new();
                }
                if session.status.has_remote_description() {
                    vec![Command::AddIceCandidate {
                        call_id: session.call_id.clone(),
                        candidate,
                    }]
                } else {
                    session.ice_queue.push_back(candidate);
                    tracing::debug!(
                        call_id = %call_id,
                        queued = session.ice_queue.len(),
                        "Queued early ICE candidate"
                    );
                    Vec::new()
                }
            }

            _ => Vec::new(),
        }
    }

    fn on_incoming(
        &mut self,
        call_id: CallId,
        caller_id: String,
        media_kind: MediaKind,
        caller_info: PeerInfo,
    ) -> Vec<Command> {
        if let Some(session) = self.live_session() {
            if session.call_id == call_id {
                return Vec::new();
            }
            tracing::info!(
                call_id = %call_id,
                caller = %caller_id,
                active = %session.call_id,
                "Busy, rejecting incoming call"
            );
            return vec![Command::Send(ClientMessage::CallReject {
                call_id: call_id.to_string(),
                caller_id,
            })];
        }

        tracing::info!(call_id = %call_id, caller = %caller_id, "Incoming call");
        let mut commands = vec![Command::Notify(CallNotice::Incoming {
            call_id: call_id.clone(),
            caller_id: caller_id.clone(),
            caller_info: caller_info.clone(),
            media_kind,
        })];
        if let Some(after) = self.config.ring_timeout {
            commands.push(Command::ArmTimer {
                call_id: call_id.clone(),
                timer: TimerKind::Ring,
                after,
            });
        }
        self.session = Some(CallSession::new(
            call_id,
            CallRole::Callee,
            caller_id,
            caller_info,
            media_kind,
            CallStatus::Ringing,
        ));
        commands
    }

    // ── Effect completions ────────────────────────────────────────────────────

    fn on_media_acquired(&mut self, call_id: CallId) -> Vec<Command> {
        let acquiring = CallStatus::Connecting(Negotiation::AcquiringMedia);
        if !self
            .session
            .as_ref()
            .is_some_and(|s| s.call_id == call_id && s.status == acquiring)
        {
            tracing::debug!(call_id = %call_id, "Discarding media for stale call");
            return vec![Command::DiscardMedia { call_id }];
        }
        vec![Command::CreatePeerConnection { call_id }]
    }

    /// The peer connection exists. Only now may the callee announce
    /// readiness or the caller build an offer.
    fn on_peer_created(&mut self, call_id: &CallId) -> Vec<Command> {
        let acquiring = CallStatus::Connecting(Negotiation::AcquiringMedia);
        let profile = self.profile.clone();
        let Some(session) = self.current(call_id.as_str()) else {
            return Vec::new();
        };
        if session.status != acquiring {
            return Vec::new();
        }

        match session.role {
            CallRole::Callee => {
                session.transition(CallStatus::Connecting(Negotiation::AwaitingOffer));
                let caller_id = session.peer_id.clone();
                vec![
                    Command::Send(ClientMessage::CallAccept {
                        call_id: call_id.to_string(),
                        caller_id: caller_id.clone(),
                        callee_info: profile,
                    }),
                    Command::Send(ClientMessage::ReceiverReady {
                        call_id: call_id.to_string(),
                        caller_id,
                    }),
                ]
            }
            CallRole::Caller => {
                session.transition(CallStatus::Connecting(Negotiation::CreatingOffer));
                vec![Command::CreateOffer {
                    call_id: call_id.clone(),
                }]
            }
        }
    }

    fn on_media_failed(&mut self, call_id: &CallId, reason: String) -> Vec<Command> {
        let acquiring = CallStatus::Connecting(Negotiation::AcquiringMedia);
        let Some(session) = self.current(call_id.as_str()) else {
            return Vec::new();
        };
        if session.status != acquiring {
            return Vec::new();
        }
        tracing::warn!(call_id = %call_id, reason = %reason, "Media acquisition failed");
        let goodbye = farewell(session);
        self.terminate(
            CallStatus::Failed(FailureReason::MediaUnavailable(reason.clone())),
            Some(goodbye),
            CallNotice::Failed {
                call_id: call_id.clone(),
                reason: FailureReason::MediaUnavailable(reason),
            },
        )
    }

    fn on_offer_created(&mut self, call_id: &CallId, sdp: SessionDescription) -> Vec<Command> {
        let creating = CallStatus::Connecting(Negotiation::CreatingOffer);
        if !self.expect(call_id.as_str(), CallRole::Caller, |s| *s == creating) {
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.transition(CallStatus::Connecting(Negotiation::AwaitingAnswer));
        vec![Command::Send(ClientMessage::WebrtcOffer {
            call_id: call_id.to_string(),
            recipient_id: session.peer_id.clone(),
            sdp,
        })]
    }

    fn on_answer_created(&mut self, call_id: &CallId, sdp: SessionDescription) -> Vec<Command> {
        let creating = CallStatus::Connecting(Negotiation::CreatingAnswer);
        if !self.expect(call_id.as_str(), CallRole::Callee, |s| *s == creating) {
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.transition(CallStatus::Connecting(Negotiation::Established));
        vec![Command::Send(ClientMessage::WebrtcAnswer {
            call_id: call_id.to_string(),
            recipient_id: session.peer_id.clone(),
            sdp,
        })]
    }

    fn on_peer_failed(&mut self, call_id: &CallId, reason: String) -> Vec<Command> {
        let Some(session) = self.current(call_id.as_str()) else {
            return Vec::new();
        };
        if !session.status.is_live() {
            return Vec::new();
        }
        tracing::warn!(call_id = %call_id, reason = %reason, "Peer connection failed");
        let goodbye = farewell(session);
        self.terminate(
            CallStatus::Failed(FailureReason::PeerConnection(reason.clone())),
            Some(goodbye),
            CallNotice::Failed {
                call_id: call_id.clone(),
                reason: FailureReason::PeerConnection(reason),
            },
        )
    }

    // ── Peer connection events ────────────────────────────────────────────────

    fn on_local_candidate(&mut self, call_id: &CallId, candidate: IceCandidate) -> Vec<Command> {
        match self.current(call_id.as_str()) {
            Some(session)
                if matches!(
                    session.status,
                    CallStatus::Connecting(_) | CallStatus::Connected
                ) =>
            {
                vec![Command::Send(ClientMessage::WebrtcIceCandidate {
                    call_id: call_id.to_string(),
                    recipient_id: session.peer_id.clone(),
                    candidate,
                })]
            }
            _ => Vec::new(),
        }
    }

    fn on_connection_state(&mut self, call_id: &CallId, state: PeerState) -> Vec<Command> {
        match state {
            PeerState::Connected => {
                let Some(session) = self.current(call_id.as_str()) else {
                    return Vec::new();
                };
                if !matches!(session.status, CallStatus::Connecting(_)) {
                    return Vec::new();
                }
                if !session.ice_queue.is_empty() {
                    tracing::debug!(
                        call_id = %call_id,
                        dropped = session.ice_queue.len(),
                        "Connected with unapplied remote candidates"
                    );
                    session.ice_queue.clear();
                }
                session.transition(CallStatus::Connected);
                tracing::info!(call_id = %call_id, "Call connected");
                vec![Command::Notify(CallNotice::Connected {
                    call_id: call_id.clone(),
                })]
            }
            PeerState::Failed => self.on_peer_failed(call_id, "ICE connection failed".into()),
            PeerState::Disconnected => {
                tracing::warn!(call_id = %call_id, "Peer connection disconnected");
                Vec::new()
            }
            PeerState::Connecting | PeerState::Closed => Vec::new(),
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    fn on_timer(&mut self, call_id: &CallId, timer: TimerKind) -> Vec<Command> {
        let Some(session) = self.current(call_id.as_str()) else {
            return Vec::new();
        };
        let (role, status) = (session.role, session.status.clone());
        let goodbye = farewell(session);
        match (timer, role, &status) {
            (TimerKind::Ring, CallRole::Caller, CallStatus::Calling)
            | (TimerKind::Connect, _, CallStatus::Connecting(_)) => {
                tracing::info!(call_id = %call_id, status = status.name(), "Call timed out");
                self.terminate(
                    CallStatus::Failed(FailureReason::Timeout),
                    Some(goodbye),
                    CallNotice::Failed {
                        call_id: call_id.clone(),
                        reason: FailureReason::Timeout,
                    },
                )
            }
            (TimerKind::Ring, CallRole::Callee, CallStatus::Ringing) => {
                tracing::info!(call_id = %call_id, "Missed call");
                self.terminate(
                    CallStatus::Ended,
                    Some(goodbye),
                    CallNotice::Missed {
                        call_id: call_id.clone(),
                    },
                )
            }
            (TimerKind::Dismiss, _, status) if status.is_terminal() => self.clear(),
            _ => Vec::new(),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn live_session(&self) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| s.status.is_live())
    }

    fn require_session(&mut self, action: &'static str) -> Result<&mut CallSession> {
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => {
                tracing::debug!(action, "No active call");
                Err(Error::NoActiveCall)
            }
        }
    }

    /// The session, if `call_id` names it. Anything else is stale or unknown.
    fn current(&mut self, call_id: &str) -> Option<&mut CallSession> {
        match self.session.as_mut() {
            Some(session) if session.call_id == *call_id => Some(session),
            _ => {
                tracing::debug!(call_id, "Dropping event for unknown call");
                None
            }
        }
    }

    fn expect(
        &mut self,
        call_id: &str,
        role: CallRole,
        status: impl FnOnce(&CallStatus) -> bool,
    ) -> bool {
        match self.current(call_id) {
            Some(session) if session.role == role && status(&session.status) => true,
            Some(session) => {
                tracing::debug!(
                    call_id,
                    status = session.status.name(),
                    "Ignoring out-of-order call event"
                );
                false
            }
            None => false,
        }
    }

    fn expect_from(
        &mut self,
        call_id: &str,
        sender_id: &str,
        role: CallRole,
        status: impl FnOnce(&CallStatus) -> bool,
    ) -> bool {
        if !self.current(call_id).is_some_and(|s| s.peer_id == sender_id) {
            return false;
        }
        self.expect(call_id, role, status)
    }

    /// Move to a terminal status and release everything the call held.
    fn terminate(
        &mut self,
        status: CallStatus,
        goodbye: Option<ClientMessage>,
        notice: CallNotice,
    ) -> Vec<Command> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if !session.transition(status.clone()) {
            return Vec::new();
        }
        session.ice_queue.clear();

        let after = match status {
            CallStatus::Ended => self.config.ended_dismiss,
            CallStatus::Rejected => self.config.rejected_dismiss,
            _ => self.config.failure_dismiss,
        };

        let mut commands = Vec::with_capacity(6);
        commands.extend(goodbye.map(Command::Send));
        commands.push(Command::ReleaseMedia);
        commands.push(Command::ClosePeerConnection);
        commands.push(Command::Notify(notice));
        commands.push(Command::ArmTimer {
            call_id: session.call_id.clone(),
            timer: TimerKind::Dismiss,
            after,
        });
        commands
    }

    fn clear(&mut self) -> Vec<Command> {
        match self.session.take() {
            Some(session) => vec![Command::Notify(CallNotice::Dismissed {
                call_id: session.call_id,
            })],
            None => Vec::new(),
        }
    }
}

/// The envelope telling the peer this side is giving up.
fn farewell(session: &CallSession) -> ClientMessage {
    match (session.role, &session.status) {
        (
            CallRole::Callee,
            CallStatus::Ringing | CallStatus::Connecting(Negotiation::AcquiringMedia),
        ) => {
            ClientMessage::CallReject {
                call_id: session.call_id.to_string(),
                caller_id: session.peer_id.clone(),
            }
        }
        _ => ClientMessage::CallEnd {
            call_id: session.call_id.to_string(),
            peer_id: session.peer_id.clone(),
        },
    }
}

/// Apply queued remote candidates in arrival order, exactly once.
fn drain_ice(session: &mut CallSession) -> Vec<Command> {
    let call_id = session.call_id.clone();
    session
        .ice_queue
        .drain(..)
        .map(|candidate| Command::AddIceCandidate {
            call_id: call_id.clone(),
            candidate,
        })
        .collect()
}

fn invalid(action: &'static str, status: &CallStatus) -> Error {
    Error::InvalidTransition {
        action,
        status: status.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> PeerInfo {
        PeerInfo {
            username: name.to_string(),
            avatar_url: None,
        }
    }

    fn machine(identity: &str) -> CallMachine {
        CallMachine::new(identity, info(identity), CallConfig::default())
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    fn start(alice: &mut CallMachine) -> CallId {
        alice
            .handle(Input::StartCall {
                callee_id: "bob".to_string(),
                callee_info: info("bob"),
                media_kind: MediaKind::Video,
            })
            .unwrap();
        alice.session().unwrap().call_id.clone()
    }

    fn ring(bob: &mut CallMachine, call_id: &str) -> Vec<Command> {
        bob.handle(Input::Relay(ServerMessage::IncomingCall {
            call_id: call_id.to_string(),
            caller_id: "alice".to_string(),
            media_kind: MediaKind::Video,
            caller_info: info("alice"),
        }))
        .unwrap()
    }

    fn sent(commands: &[Command]) -> Vec<&ClientMessage> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_call_sends_initiate_and_arms_ring_timer() {
        let mut alice = machine("alice");
        let commands = alice
            .handle(Input::StartCall {
                callee_id: "bob".to_string(),
                callee_info: info("bob"),
                media_kind: MediaKind::Audio,
            })
            .unwrap();

        assert_eq!(alice.status(), CallStatus::Calling);
        assert!(matches!(
            &commands[0],
            Command::Send(ClientMessage::CallInitiate { callee_id, media_kind: MediaKind::Audio, .. })
                if callee_id == "bob"
        ));
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::ArmTimer { timer: TimerKind::Ring, after, .. } if *after == Duration::from_secs(45)
        )));

        let again = alice.handle(Input::StartCall {
            callee_id: "carol".to_string(),
            callee_info: info("carol"),
            media_kind: MediaKind::Audio,
        });
        assert!(matches!(again, Err(Error::CallInProgress(_))));
    }

    #[test]
    fn test_unreachable_callee_goes_offline_then_dismisses() {
        let mut alice = machine("alice");
        let call_id = start(&mut alice);

        let commands = alice
            .handle(Input::Relay(ServerMessage::CallUnreachable {
                call_id: call_id.to_string(),
                callee_id: "bob".to_string(),
            }))
            .unwrap();

        assert_eq!(alice.status(), CallStatus::Offline);
        assert!(sent(&commands).is_empty());
        assert!(commands.contains(&Command::ReleaseMedia));
        assert!(commands.contains(&Command::Notify(CallNotice::UserOffline {
            call_id: call_id.clone()
        })));
        assert!(commands.contains(&Command::ArmTimer {
            call_id: call_id.clone(),
            timer: TimerKind::Dismiss,
            after: Duration::from_secs(2),
        }));

        alice
            .handle(Input::TimerElapsed {
                call_id,
                timer: TimerKind::Dismiss,
            })
            .unwrap();
        assert_eq!(alice.status(), CallStatus::Idle);
    }

    #[test]
    fn test_caller_negotiation() {
        let mut alice = machine("alice");
        let call_id = start(&mut alice);

        let commands = alice
            .handle(Input::Relay(ServerMessage::ReceiverReady {
                call_id: call_id.to_string(),
            }))
            .unwrap();
        assert_eq!(
            alice.status(),
            CallStatus::Connecting(Negotiation::AcquiringMedia)
        );
        assert_eq!(
            commands[0],
            Command::AcquireMedia {
                call_id: call_id.clone(),
                media_kind: MediaKind::Video
            }
        );

        let commands = alice
            .handle(Input::MediaAcquired {
                call_id: call_id.clone(),
            })
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::CreatePeerConnection {
                call_id: call_id.clone()
            }]
        );
        assert_eq!(
            alice.status(),
            CallStatus::Connecting(Negotiation::AcquiringMedia)
        );

        let commands = alice
            .handle(Input::PeerCreated {
                call_id: call_id.clone(),
            })
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::CreateOffer {
                call_id: call_id.clone()
            }]
        );

        let commands = alice
            .handle(Input::OfferCreated {
                call_id: call_id.clone(),
                sdp: SessionDescription::offer("v=0 offer"),
            })
            .unwrap();
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::WebrtcOffer { recipient_id, .. }] if recipient_id == "bob"
        ));

        let commands = alice
            .handle(Input::Relay(ServerMessage::WebrtcAnswer {
                call_id: call_id.to_string(),
                sender_id: "bob".to_string(),
                sdp: SessionDescription::answer("v=0 answer"),
            }))
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::SetRemoteDescription {
                call_id: call_id.clone(),
                sdp: SessionDescription::answer("v=0 answer"),
            }]
        );
        assert_eq!(
            alice.status(),
            CallStatus::Connecting(Negotiation::Established)
        );

        let commands = alice
            .handle(Input::ConnectionState {
                call_id: call_id.clone(),
                state: PeerState::Connected,
            })
            .unwrap();
        assert_eq!(alice.status(), CallStatus::Connected);
        assert_eq!(
            commands,
            vec![Command::Notify(CallNotice::Connected { call_id })]
        );
    }

    #[test]
    fn test_callee_queues_early_ice_and_drains_in_order() {
        let mut bob = machine("bob");
        let commands = ring(&mut bob, "c1");
        assert_eq!(bob.status(), CallStatus::Ringing);
        assert!(matches!(commands[0], Command::Notify(CallNotice::Incoming { .. })));

        bob.handle(Input::Accept).unwrap();
        let commands = bob
            .handle(Input::MediaAcquired {
                call_id: "c1".into(),
            })
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::CreatePeerConnection {
                call_id: "c1".into()
            }]
        );

        let commands = bob
            .handle(Input::PeerCreated {
                call_id: "c1".into(),
            })
            .unwrap();
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::CallAccept { .. }, ClientMessage::ReceiverReady { .. }]
        ));
        assert_eq!(
            bob.status(),
            CallStatus::Connecting(Negotiation::AwaitingOffer)
        );

        for n in [1, 2] {
            let commands = bob
                .handle(Input::Relay(ServerMessage::WebrtcIceCandidate {
                    call_id: "c1".to_string(),
                    sender_id: "alice".to_string(),
                    candidate: candidate(n),
                }))
                .unwrap();
            assert!(commands.is_empty());
        }
        assert_eq!(bob.snapshot().queued_ice, 2);

        let commands = bob
            .handle(Input::Relay(ServerMessage::WebrtcOffer {
                call_id: "c1".to_string(),
                sender_id: "alice".to_string(),
                sdp: SessionDescription::offer("v=0 offer"),
            }))
            .unwrap();
        assert_eq!(
            commands,
            vec![
                Command::SetRemoteDescription {
                    call_id: "c1".into(),
                    sdp: SessionDescription::offer("v=0 offer"),
                },
                Command::AddIceCandidate {
                    call_id: "c1".into(),
                    candidate: candidate(1),
                },
                Command::AddIceCandidate {
                    call_id: "c1".into(),
                    candidate: candidate(2),
                },
                Command::CreateAnswer {
                    call_id: "c1".into()
                },
            ]
        );
        assert_eq!(bob.snapshot().queued_ice, 0);

        // Later candidates go straight to the peer connection.
        let commands = bob
            .handle(Input::Relay(ServerMessage::WebrtcIceCandidate {
                call_id: "c1".to_string(),
                sender_id: "alice".to_string(),
                candidate: candidate(3),
            }))
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::AddIceCandidate {
                call_id: "c1".into(),
                candidate: candidate(3),
            }]
        );

        let commands = bob
            .handle(Input::AnswerCreated {
                call_id: "c1".into(),
                sdp: SessionDescription::answer("v=0 answer"),
            })
            .unwrap();
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::WebrtcAnswer { recipient_id, .. }] if recipient_id == "alice"
        ));
    }

    #[test]
    fn test_mismatched_call_id_is_ignored() {
        let mut alice = machine("alice");
        start(&mut alice);

        for message in [
            ServerMessage::ReceiverReady {
                call_id: "other".to_string(),
            },
            ServerMessage::CallEnded {
                call_id: "other".to_string(),
            },
            ServerMessage::WebrtcAnswer {
                call_id: "other".to_string(),
                sender_id: "bob".to_string(),
                sdp: SessionDescription::answer("x"),
            },
        ] {
            let commands = alice.handle(Input::Relay(message)).unwrap();
            assert!(commands.is_empty());
            assert_eq!(alice.status(), CallStatus::Calling);
        }
    }

    #[test]
    fn test_offer_from_wrong_sender_is_dropped() {
        let mut bob = machine("bob");
        ring(&mut bob, "c1");
        bob.handle(Input::Accept).unwrap();
        bob.handle(Input::MediaAcquired {
            call_id: "c1".into(),
        })
        .unwrap();
        bob.handle(Input::PeerCreated {
            call_id: "c1".into(),
        })
        .unwrap();

        let commands = bob
            .handle(Input::Relay(ServerMessage::WebrtcOffer {
                call_id: "c1".to_string(),
                sender_id: "mallory".to_string(),
                sdp: SessionDescription::offer("evil"),
            }))
            .unwrap();
        assert!(commands.is_empty());
        assert_eq!(
            bob.status(),
            CallStatus::Connecting(Negotiation::AwaitingOffer)
        );
    }

    #[test]
    fn test_busy_callee_auto_rejects_second_call() {
        let mut bob = machine("bob");
        ring(&mut bob, "c1");
        bob.handle(Input::Accept).unwrap();

        let commands = bob
            .handle(Input::Relay(ServerMessage::IncomingCall {
                call_id: "c2".to_string(),
                caller_id: "carol".to_string(),
                media_kind: MediaKind::Audio,
                caller_info: info("carol"),
            }))
            .unwrap();

        assert_eq!(
            commands,
            vec![Command::Send(ClientMessage::CallReject {
                call_id: "c2".to_string(),
                caller_id: "carol".to_string(),
            })]
        );
        assert_eq!(bob.session().unwrap().call_id, CallId::from("c1"));
    }

    #[test]
    fn test_duplicate_receiver_ready_is_ignored() {
        let mut alice = machine("alice");
        let call_id = start(&mut alice);
        let ready = ServerMessage::ReceiverReady {
            call_id: call_id.to_string(),
        };
        assert!(!alice.handle(Input::Relay(ready.clone())).unwrap().is_empty());
        assert!(alice.handle(Input::Relay(ready)).unwrap().is_empty());
    }

    #[test]
    fn test_late_media_is_discarded_after_hang_up() {
        let mut alice = machine("alice");
        let call_id = start(&mut alice);
        alice
            .handle(Input::Relay(ServerMessage::ReceiverReady {
                call_id: call_id.to_string(),
            }))
            .unwrap();

        let commands = alice.handle(Input::HangUp).unwrap();
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::CallEnd { peer_id, .. }] if peer_id == "bob"
        ));
        assert_eq!(alice.status(), CallStatus::Ended);

        let commands = alice
            .handle(Input::MediaAcquired {
                call_id: call_id.clone(),
            })
            .unwrap();
        assert_eq!(commands, vec![Command::DiscardMedia { call_id }]);
    }

    #[test]
    fn test_callee_media_failure_rejects_call() {
        let mut bob = machine("bob");
        ring(&mut bob, "c1");
        bob.handle(Input::Accept).unwrap();

        let commands = bob
            .handle(Input::MediaFailed {
                call_id: "c1".into(),
                reason: "permission denied".to_string(),
            })
            .unwrap();

        assert!(matches!(
            bob.status(),
            CallStatus::Failed(FailureReason::MediaUnavailable(_))
        ));
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::CallReject { caller_id, .. }] if caller_id == "alice"
        ));
        assert!(commands.contains(&Command::ReleaseMedia));
    }

    #[test]
    fn test_ring_timeouts() {
        let mut alice = machine("alice");
        let call_id = start(&mut alice);
        let commands = alice
            .handle(Input::TimerElapsed {
                call_id,
                timer: TimerKind::Ring,
            })
            .unwrap();
        assert_eq!(alice.status(), CallStatus::Failed(FailureReason::Timeout));
        assert!(matches!(sent(&commands).as_slice(), [ClientMessage::CallEnd { .. }]));

        let mut bob = machine("bob");
        ring(&mut bob, "c1");
        let commands = bob
            .handle(Input::TimerElapsed {
                call_id: "c1".into(),
                timer: TimerKind::Ring,
            })
            .unwrap();
        assert_eq!(bob.status(), CallStatus::Ended);
        assert!(matches!(sent(&commands).as_slice(), [ClientMessage::CallReject { .. }]));
        assert!(commands.contains(&Command::Notify(CallNotice::Missed {
            call_id: "c1".into()
        })));
    }

    #[test]
    fn test_stale_ring_timer_after_connect_is_ignored() {
        let mut bob = machine("bob");
        ring(&mut bob, "c1");
        bob.handle(Input::Accept).unwrap();
        let commands = bob
            .handle(Input::TimerElapsed {
                call_id: "c1".into(),
                timer: TimerKind::Ring,
            })
            .unwrap();
        assert!(commands.is_empty());
        assert!(matches!(bob.status(), CallStatus::Connecting(_)));
    }

    #[test]
    fn test_remote_end_releases_everything() {
        let mut bob = machine("bob");
        ring(&mut bob, "c1");
        bob.handle(Input::Accept).unwrap();

        let commands = bob
            .handle(Input::Relay(ServerMessage::CallEnded {
                call_id: "c1".to_string(),
            }))
            .unwrap();
        assert_eq!(bob.status(), CallStatus::Ended);
        assert!(sent(&commands).is_empty());
        assert!(commands.contains(&Command::ReleaseMedia));
        assert!(commands.contains(&Command::ClosePeerConnection));

        // A second end for the same call is a no-op.
        let commands = bob
            .handle(Input::Relay(ServerMessage::CallEnded {
                call_id: "c1".to_string(),
            }))
            .unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn test_rejected_by_callee() {
        let mut alice = machine("alice");
        let call_id = start(&mut alice);
        let commands = alice
            .handle(Input::Relay(ServerMessage::CallRejected {
                call_id: call_id.to_string(),
            }))
            .unwrap();
        assert_eq!(alice.status(), CallStatus::Rejected);
        assert!(commands.contains(&Command::ArmTimer {
            call_id,
            timer: TimerKind::Dismiss,
            after: Duration::from_millis(1500),
        }));
    }

    #[test]
    fn test_toggles() {
        let mut bob = machine("bob");
        assert!(matches!(
            bob.handle(Input::ToggleAudio),
            Err(Error::NoActiveCall)
        ));

        ring(&mut bob, "c1");
        assert!(matches!(
            bob.handle(Input::ToggleAudio),
            Err(Error::InvalidTransition { .. })
        ));

        bob.handle(Input::Accept).unwrap();
        let commands = bob.handle(Input::ToggleAudio).unwrap();
        assert_eq!(
            commands,
            vec![Command::SetTrackEnabled {
                track: TrackKind::Audio,
                enabled: false
            }]
        );
        assert!(!bob.snapshot().audio_enabled);

        let commands = bob.handle(Input::ToggleVideo).unwrap();
        assert_eq!(
            commands,
            vec![Command::SetTrackEnabled {
                track: TrackKind::Video,
                enabled: false
            }]
        );
    }

    /// Accept, get media and build the peer connection.
    fn ready(bob: &mut CallMachine, call_id: &str) {
        ring(bob, call_id);
        bob.handle(Input::Accept).unwrap();
        bob.handle(Input::MediaAcquired {
            call_id: call_id.into(),
        })
        .unwrap();
        bob.handle(Input::PeerCreated {
            call_id: call_id.into(),
        })
        .unwrap();
    }

    #[test]
    fn test_callee_peer_failure_before_ready_rejects() {
        let mut bob = machine("bob");
        ring(&mut bob, "c1");
        bob.handle(Input::Accept).unwrap();
        bob.handle(Input::MediaAcquired {
            call_id: "c1".into(),
        })
        .unwrap();

        let commands = bob
            .handle(Input::PeerFailed {
                call_id: "c1".into(),
                reason: "no transport".to_string(),
            })
            .unwrap();
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::CallReject { caller_id, .. }] if caller_id == "alice"
        ));
        assert!(matches!(
            bob.status(),
            CallStatus::Failed(FailureReason::PeerConnection(_))
        ));

        // Too late to announce readiness for a call that already failed.
        let commands = bob
            .handle(Input::PeerCreated {
                call_id: "c1".into(),
            })
            .unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn test_callee_failure_after_ready_ends_call() {
        let mut bob = machine("bob");
        ready(&mut bob, "c1");

        let commands = bob
            .handle(Input::ConnectionState {
                call_id: "c1".into(),
                state: PeerState::Failed,
            })
            .unwrap();
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::CallEnd { peer_id, .. }] if peer_id == "alice"
        ));

        let mut bob = machine("bob");
        ready(&mut bob, "c2");
        let commands = bob
            .handle(Input::TimerElapsed {
                call_id: "c2".into(),
                timer: TimerKind::Connect,
            })
            .unwrap();
        assert!(matches!(
            sent(&commands).as_slice(),
            [ClientMessage::CallEnd { .. }]
        ));
        assert_eq!(bob.status(), CallStatus::Failed(FailureReason::Timeout));
    }

    #[test]
    fn test_connected_discards_unapplied_candidates() {
        let mut bob = machine("bob");
        ready(&mut bob, "c1");
        bob.handle(Input::Relay(ServerMessage::WebrtcIceCandidate {
            call_id: "c1".to_string(),
            sender_id: "alice".to_string(),
            candidate: candidate(1),
        }))
        .unwrap();
        assert_eq!(bob.snapshot().queued_ice, 1);

        let commands = bob
            .handle(Input::ConnectionState {
                call_id: "c1".into(),
                state: PeerState::Connected,
            })
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::Notify(CallNotice::Connected {
                call_id: "c1".into()
            })]
        );
        assert_eq!(bob.snapshot().queued_ice, 0);
    }

    #[test]
    fn test_accept_requires_ringing() {
        let mut alice = machine("alice");
        start(&mut alice);
        let err = alice.handle(Input::Accept).unwrap_err();
        assert_eq!(err.to_string(), "Cannot accept while call is calling");
    }
}
