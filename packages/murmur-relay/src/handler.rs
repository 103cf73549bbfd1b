//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! routing them through the relay state, and sending responses. Each
//! connection handles one inbound frame to completion before the next, so
//! the relay preserves order within a connection.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use murmur_core::protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Verified;
use crate::error::RelayResult;
use crate::signaling::SignalingEnvelope;
use crate::state::{Delivery, RelayState};

/// The registered side of one connection.
pub struct Connection {
    pub identity: String,
    pub handle: Uuid,
    /// Weak so a replaced connection's channel closes once the registry
    /// lets go of it.
    outbound: mpsc::WeakUnboundedSender<ServerMessage>,
}

impl Connection {
    /// Reply to this connection only.
    fn reply(&self, message: ServerMessage) {
        if let Some(tx) = self.outbound.upgrade() {
            let _ = tx.send(message);
        }
    }
}

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for `identity_announce` matching the verified identity
/// 2. Registers the session and broadcasts presence
/// 3. Spawns a sender task to forward outbound messages
/// 4. Processes incoming messages until the connection closes or is replaced
pub async fn handle_websocket(socket: WebSocket, state: RelayState, verified: Verified) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Wait for Identity ─────────────────────────────────────────

    let identity = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::IdentityAnnounce { identity }) => {
                    if identity.is_empty() || !verified.permits(&identity) {
                        tracing::warn!(identity = identity.as_str(), "Identity does not match credentials");
                        send_direct(
                            &mut ws_sender,
                            &ServerMessage::Error {
                                message: "Identity does not match credentials".to_string(),
                            },
                        )
                        .await;
                        continue;
                    }

                    let ack = ServerMessage::Registered {
                        identity: identity.clone(),
                    };
                    if !send_direct(&mut ws_sender, &ack).await {
                        return; // Connection closed
                    }
                    break identity;
                }
                Ok(ClientMessage::Ping) => {
                    send_direct(&mut ws_sender, &ServerMessage::Pong).await;
                }
                Ok(_) => {
                    send_direct(
                        &mut ws_sender,
                        &ServerMessage::Error {
                            message: "Must announce identity before sending other messages"
                                .to_string(),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!("Failed to parse client message: {}", e);
                    send_direct(
                        &mut ws_sender,
                        &ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    )
                    .await;
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return; // Connection closed before announcing
            }
            _ => continue,
        }
    };

    // ── Step 2: Register Session ──────────────────────────────────────────

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let outbound = tx.downgrade();
    let (handle, deliveries) = state.presence.connect(&identity, tx);
    state.dispatch(deliveries);
    tracing::info!(identity = identity.as_str(), "WebSocket registered");

    let connection = Connection {
        identity,
        handle,
        outbound,
    };

    // ── Step 3: Spawn Sender Task ─────────────────────────────────────────

    // Ends when the registry drops this session's sender, which happens on
    // replacement and on disconnect.
    let mut sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if !send_direct(&mut ws_sender, &msg).await {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // ── Step 4: Process Messages ──────────────────────────────────────────

    loop {
        tokio::select! {
            next = ws_receiver.next() => {
                let Some(msg_result) = next else { break };
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            handle_client_message(&state, &connection, client_msg).await;
                        }
                        Err(e) => {
                            tracing::warn!(
                                identity = connection.identity.as_str(),
                                error = %e,
                                "Failed to parse client message"
                            );
                            connection.reply(ServerMessage::Error {
                                message: format!("Invalid message format: {}", e),
                            });
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!(identity = connection.identity.as_str(), "Client sent close frame");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            identity = connection.identity.as_str(),
                            error = %e,
                            "WebSocket error"
                        );
                        break;
                    }
                    _ => {} // Binary, Ping, Pong: axum answers pings itself
                }
            }
            _ = &mut sender_task => {
                tracing::info!(identity = connection.identity.as_str(), "Session replaced, closing");
                break;
            }
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    if state.registry.is_current(&connection.identity, connection.handle) {
        state.dispatch(state.typing.clear_identity(&connection.identity));
    }
    state.dispatch(
        state
            .presence
            .disconnect(&connection.identity, connection.handle),
    );
    sender_task.abort();
    tracing::info!(identity = connection.identity.as_str(), "WebSocket disconnected");
}

/// Serialize and write one frame. Returns false once the socket is gone.
async fn send_direct(ws_sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => ws_sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            true
        }
    }
}

/// Handle a parsed client message.
pub async fn handle_client_message(state: &RelayState, conn: &Connection, msg: ClientMessage) {
    let identity = conn.identity.as_str();
    match msg {
        ClientMessage::IdentityAnnounce { .. } => {
            conn.reply(ServerMessage::Error {
                message: "Already registered".to_string(),
            });
        }

        ClientMessage::QueryPresence { identity: target } => {
            let info = state.presence.query(&target).await;
            conn.reply(ServerMessage::Presence(info));
        }

        ClientMessage::TypingStart {
            conversation_id,
            recipient_id,
        } => {
            state.dispatch(state.typing.start(identity, &conversation_id, &recipient_id));
        }

        ClientMessage::TypingStop {
            conversation_id,
            recipient_id,
        } => {
            state.dispatch(state.typing.stop(identity, &conversation_id, &recipient_id));
        }

        ClientMessage::MessageRelay { message } => {
            let result = state.messages.deliver(identity, message).await;
            finish(state, conn, "message_relay", result);
        }

        ClientMessage::MessageDeleted {
            message_id,
            recipient_id,
        } => {
            let result = state
                .messages
                .delete(identity, &message_id, &recipient_id)
                .await;
            finish(state, conn, "message_deleted", result);
        }

        ClientMessage::MarkRead { message_ids } => {
            let result = state.messages.mark_read(identity, &message_ids).await;
            finish(state, conn, "mark_read", result);
        }

        ClientMessage::ApplyReaction { message_id, emoji } => {
            let result = state
                .messages
                .apply_reaction(identity, &message_id, &emoji)
                .await;
            finish(state, conn, "apply_reaction", result);
        }

        signal @ (ClientMessage::CallInitiate { .. }
        | ClientMessage::CallAccept { .. }
        | ClientMessage::ReceiverReady { .. }
        | ClientMessage::CallReject { .. }
        | ClientMessage::CallEnd { .. }
        | ClientMessage::WebrtcOffer { .. }
        | ClientMessage::WebrtcAnswer { .. }
        | ClientMessage::WebrtcIceCandidate { .. }) => {
            if let Some(envelope) = SignalingEnvelope::from_client(identity, signal) {
                state.dispatch(state.signaling.relay(envelope));
            }
        }

        ClientMessage::Ping => {
            conn.reply(ServerMessage::Pong);
        }
    }
}

/// Dispatch a handler's deliveries, or report its error to this connection.
fn finish(state: &RelayState, conn: &Connection, event: &str, result: RelayResult<Vec<Delivery>>) {
    match result {
        Ok(deliveries) => {
            state.dispatch(deliveries);
        }
        Err(e) if e.is_user_visible() => {
            tracing::debug!(identity = conn.identity.as_str(), event = event, error = %e, "Rejected");
            conn.reply(ServerMessage::Error {
                message: e.to_string(),
            });
        }
        Err(e) => {
            tracing::warn!(identity = conn.identity.as_str(), event = event, error = %e, "Store failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DevVerifier;
    use crate::state::RelayConfig;
    use crate::store::{MemoryStore, MessageStore};
    use chrono::Utc;
    use murmur_core::protocol::{ChatMessage, MediaKind, MessageStatus, PeerInfo};
    use std::sync::Arc;

    struct Client {
        conn: Connection,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn test_state() -> (RelayState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(None));
        let state = RelayState::new(
            RelayConfig::default(),
            store.clone(),
            store.clone(),
            Arc::new(DevVerifier),
        );
        (state, store)
    }

    fn connect(state: &RelayState, identity: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = tx.downgrade();
        let (handle, deliveries) = state.presence.connect(identity, tx);
        state.dispatch(deliveries);
        Client {
            conn: Connection {
                identity: identity.to_string(),
                handle,
                outbound,
            },
            rx,
        }
    }

    fn chat(id: &str, sender: &str, recipient: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: sender.to_string(),
            recipient_id: recipient.to_string(),
            content: "hi".to_string(),
            content_type: "text".to_string(),
            status: MessageStatus::Sent,
            reactions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ping_and_duplicate_announce() {
        let (state, _) = test_state();
        let mut alice = connect(&state, "alice");
        alice.drain();

        handle_client_message(&state, &alice.conn, ClientMessage::Ping).await;
        handle_client_message(
            &state,
            &alice.conn,
            ClientMessage::IdentityAnnounce {
                identity: "alice".to_string(),
            },
        )
        .await;

        let replies = alice.drain();
        assert_eq!(replies[0], ServerMessage::Pong);
        assert!(matches!(replies[1], ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_presence_query_reply() {
        let (state, _) = test_state();
        let mut alice = connect(&state, "alice");
        let _bob = connect(&state, "bob");
        alice.drain();

        handle_client_message(
            &state,
            &alice.conn,
            ClientMessage::QueryPresence {
                identity: "bob".to_string(),
            },
        )
        .await;

        assert!(matches!(
            &alice.drain()[..],
            [ServerMessage::Presence(info)] if info.identity == "bob" && info.is_online
        ));
    }

    #[tokio::test]
    async fn test_message_relay_and_read_receipt() {
        let (state, store) = test_state();
        store.create(chat("m1", "alice", "bob")).await.unwrap();
        let mut alice = connect(&state, "alice");
        let mut bob = connect(&state, "bob");
        alice.drain();
        bob.drain();

        handle_client_message(
            &state,
            &alice.conn,
            ClientMessage::MessageRelay {
                message: chat("m1", "alice", "bob"),
            },
        )
        .await;
        assert!(matches!(
            &bob.drain()[..],
            [ServerMessage::MessageReceived { message }] if message.id == "m1"
        ));

        let mark = ClientMessage::MarkRead {
            message_ids: vec!["m1".to_string()],
        };
        handle_client_message(&state, &bob.conn, mark.clone()).await;
        assert!(matches!(
            &alice.drain()[..],
            [ServerMessage::StatusChanged { status: MessageStatus::Read, .. }]
        ));

        // Idempotent: nothing the second time.
        handle_client_message(&state, &bob.conn, mark).await;
        assert!(alice.drain().is_empty());
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn test_forged_sender_gets_error_only() {
        let (state, _) = test_state();
        let mut mallory = connect(&state, "mallory");
        let mut bob = connect(&state, "bob");
        mallory.drain();
        bob.drain();

        handle_client_message(
            &state,
            &mallory.conn,
            ClientMessage::MessageRelay {
                message: chat("m1", "alice", "bob"),
            },
        )
        .await;

        assert!(matches!(&mallory.drain()[..], [ServerMessage::Error { .. }]));
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn test_reaction_reaches_both_participants() {
        let (state, store) = test_state();
        store.create(chat("m1", "alice", "bob")).await.unwrap();
        let mut alice = connect(&state, "alice");
        let mut bob = connect(&state, "bob");
        alice.drain();
        bob.drain();

        handle_client_message(
            &state,
            &bob.conn,
            ClientMessage::ApplyReaction {
                message_id: "m1".to_string(),
                emoji: "👍".to_string(),
            },
        )
        .await;

        for client in [&mut alice, &mut bob] {
            assert!(matches!(
                &client.drain()[..],
                [ServerMessage::ReactionChanged { reactions, .. }] if reactions.len() == 1
            ));
        }
    }

    #[tokio::test]
    async fn test_call_initiate_routes_by_presence() {
        let (state, _) = test_state();
        let mut alice = connect(&state, "alice");
        alice.drain();

        let initiate = ClientMessage::CallInitiate {
            call_id: "call-1".to_string(),
            callee_id: "bob".to_string(),
            media_kind: MediaKind::Video,
            caller_info: PeerInfo::default(),
        };

        handle_client_message(&state, &alice.conn, initiate.clone()).await;
        assert!(matches!(
            &alice.drain()[..],
            [ServerMessage::CallUnreachable { call_id, .. }] if call_id == "call-1"
        ));

        let mut bob = connect(&state, "bob");
        alice.drain();
        bob.drain();

        handle_client_message(&state, &alice.conn, initiate).await;
        assert!(alice.drain().is_empty());
        assert!(matches!(
            &bob.drain()[..],
            [ServerMessage::IncomingCall { caller_id, media_kind: MediaKind::Video, .. }]
                if caller_id == "alice"
        ));
    }

    #[tokio::test]
    async fn test_typing_start_and_stop() {
        let (state, _) = test_state();
        let alice = connect(&state, "alice");
        let mut bob = connect(&state, "bob");
        bob.drain();

        for msg in [
            ClientMessage::TypingStart {
                conversation_id: "c1".to_string(),
                recipient_id: "bob".to_string(),
            },
            ClientMessage::TypingStop {
                conversation_id: "c1".to_string(),
                recipient_id: "bob".to_string(),
            },
        ] {
            handle_client_message(&state, &alice.conn, msg).await;
        }

        let flags: Vec<bool> = bob
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::IsTyping { is_typing, .. } => Some(is_typing),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![true, false]);
        assert_eq!(state.typing.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_after_replacement_is_dropped() {
        let (state, _) = test_state();
        let old = connect(&state, "alice");
        let mut new = connect(&state, "alice");
        new.drain();

        // The old connection's weak sender no longer upgrades.
        handle_client_message(&state, &old.conn, ClientMessage::Ping).await;
        assert!(new.drain().is_empty());
    }
}
