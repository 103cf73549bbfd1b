//! Call signaling relay.
//!
//! Stateless: the relay never tracks calls. Each call-control or WebRTC
//! frame is turned into a [`SignalingEnvelope`] addressed by identity and
//! tagged by call id, with `sender_id` stamped from the authenticated
//! connection rather than taken from the payload.

use murmur_core::protocol::{ClientMessage, ServerMessage};

use crate::registry::SessionRegistry;
use crate::state::Delivery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    /// Call lifecycle: initiate, accept, ready, reject, end.
    Control,
}

/// A signaling frame on its way from one identity to another.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    pub kind: EnvelopeKind,
    pub call_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    /// What the recipient receives.
    pub payload: ServerMessage,
}

impl SignalingEnvelope {
    /// Build the envelope for a client frame. `None` for non-signaling frames.
    pub fn from_client(sender: &str, message: ClientMessage) -> Option<Self> {
        let sender_id = sender.to_string();
        let (kind, recipient_id, payload) = match message {
            ClientMessage::CallInitiate {
                call_id,
                callee_id,
                media_kind,
                caller_info,
            } => (
                EnvelopeKind::Control,
                callee_id,
                ServerMessage::IncomingCall {
                    call_id,
                    caller_id: sender_id.clone(),
                    media_kind,
                    caller_info,
                },
            ),
            ClientMessage::CallAccept {
                call_id,
                caller_id,
                callee_info,
            } => (
                EnvelopeKind::Control,
                caller_id,
                ServerMessage::CallAccepted {
                    call_id,
                    callee_info,
                },
            ),
            ClientMessage::ReceiverReady { call_id, caller_id } => (
                EnvelopeKind::Control,
                caller_id,
                ServerMessage::ReceiverReady { call_id },
            ),
            ClientMessage::CallReject { call_id, caller_id } => (
                EnvelopeKind::Control,
                caller_id,
                ServerMessage::CallRejected { call_id },
            ),
            ClientMessage::CallEnd { call_id, peer_id } => (
                EnvelopeKind::Control,
                peer_id,
                ServerMessage::CallEnded { call_id },
            ),
            ClientMessage::WebrtcOffer {
                call_id,
                recipient_id,
                sdp,
            } => (
                EnvelopeKind::Offer,
                recipient_id,
                ServerMessage::WebrtcOffer {
                    call_id,
                    sender_id: sender_id.clone(),
                    sdp,
                },
            ),
            ClientMessage::WebrtcAnswer {
                call_id,
                recipient_id,
                sdp,
            } => (
                EnvelopeKind::Answer,
                recipient_id,
                ServerMessage::WebrtcAnswer {
                    call_id,
                    sender_id: sender_id.clone(),
                    sdp,
                },
            ),
            ClientMessage::WebrtcIceCandidate {
                call_id,
                recipient_id,
                candidate,
            } => (
                EnvelopeKind::IceCandidate,
                recipient_id,
                ServerMessage::WebrtcIceCandidate {
                    call_id,
                    sender_id: sender_id.clone(),
                    candidate,
                },
            ),
            _ => return None,
        };

        let call_id = payload.call_id()?.to_string();
        Some(Self {
            kind,
            call_id,
            sender_id,
            recipient_id,
            payload,
        })
    }

    fn is_initiate(&self) -> bool {
        matches!(self.payload, ServerMessage::IncomingCall { .. })
    }
}

#[derive(Clone)]
pub struct SignalingRelay {
    registry: SessionRegistry,
}

impl SignalingRelay {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Route one envelope.
    ///
    /// An initiate for an offline callee is answered with `call_unreachable`
    /// and reaches nobody else. Any other envelope for an offline recipient
    /// is dropped.
    pub fn relay(&self, envelope: SignalingEnvelope) -> Vec<Delivery> {
        if envelope.recipient_id == envelope.sender_id {
            return vec![Delivery::To {
                identity: envelope.sender_id,
                message: ServerMessage::Error {
                    message: "Cannot signal yourself".to_string(),
                },
            }];
        }

        if !self.registry.is_online(&envelope.recipient_id) {
            if envelope.is_initiate() {
                tracing::info!(
                    call_id = envelope.call_id.as_str(),
                    callee = envelope.recipient_id.as_str(),
                    "Callee unreachable"
                );
                return vec![Delivery::To {
                    identity: envelope.sender_id,
                    message: ServerMessage::CallUnreachable {
                        call_id: envelope.call_id,
                        callee_id: envelope.recipient_id,
                    },
                }];
            }
            tracing::debug!(
                call_id = envelope.call_id.as_str(),
                kind = ?envelope.kind,
                recipient = envelope.recipient_id.as_str(),
                "Dropping envelope for offline recipient"
            );
            return Vec::new();
        }

        tracing::debug!(
            call_id = envelope.call_id.as_str(),
            kind = ?envelope.kind,
            from = envelope.sender_id.as_str(),
            to = envelope.recipient_id.as_str(),
            "Forwarding signal"
        );
        vec![Delivery::To {
            identity: envelope.recipient_id,
            message: envelope.payload,
        }]
    }
}
