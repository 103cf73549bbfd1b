//! Async driver for [`CallMachine`].
//!
//! The agent is a single task that owns the machine and every call resource
//! (local tracks, the peer connection). Inputs are processed one at a time;
//! the commands an input produces are executed in order before the next
//! input is taken. Media acquisition is the only effect that runs
//! concurrently, and its result comes back through the inbox tagged with
//! the call id it was started for.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Error, Result};
use crate::protocol::{
    ClientMessage, IceCandidate, MediaKind, PeerInfo, ServerMessage, SessionDescription,
};

use super::machine::{CallMachine, CallNotice, Command, Input, PeerState, TimerKind};
use super::{CallId, CallSnapshot, IceServer, TrackKind};

// ── Collaborators ─────────────────────────────────────────────────────────────

/// Camera and microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// Request local tracks. May wait on a permission prompt.
    async fn acquire(&self, media_kind: MediaKind) -> Result<Box<dyn LocalMedia>>;
}

/// Local tracks for one call.
pub trait LocalMedia: Send + Sync {
    fn set_track_enabled(&mut self, track: TrackKind, enabled: bool);

    /// Stop every track. Must be idempotent.
    fn stop(&mut self);
}

/// Builds peer connections around local media.
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        media: &dyn LocalMedia,
        ice_servers: &[IceServer],
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>>;
}

/// One WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send {
    /// Create an offer and install it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&mut self) -> Result<SessionDescription>;

    async fn set_remote_description(&mut self, sdp: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    async fn close(&mut self);
}

/// Outbound half of the relay link.
pub trait SignalSink: Send + Sync + 'static {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

impl SignalSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, message: ClientMessage) -> Result<()> {
        mpsc::UnboundedSender::send(self, message)
            .map_err(|_| Error::Signaling("relay link closed".to_string()))
    }
}

/// Callback handle a peer connection uses to report ICE and transport state.
///
/// Events are tagged with the call the connection was built for, so events
/// from a torn-down connection cannot leak into a later call.
#[derive(Clone)]
pub struct PeerEvents {
    call_id: CallId,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl PeerEvents {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        let _ = self.tx.send(AgentEvent::Input(Input::LocalIceCandidate {
            call_id: self.call_id.clone(),
            candidate,
        }));
    }

    pub fn connection_state(&self, state: PeerState) {
        let _ = self.tx.send(AgentEvent::Input(Input::ConnectionState {
            call_id: self.call_id.clone(),
            state,
        }));
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

enum AgentEvent {
    /// A user action; the reply carries the snapshot after it was applied.
    Action {
        input: Input,
        reply: oneshot::Sender<Result<CallSnapshot>>,
    },
    Input(Input),
    Media {
        call_id: CallId,
        result: Result<Box<dyn LocalMedia>>,
    },
}

/// Cloneable front end of a running [`CallAgent`].
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<AgentEvent>,
    snapshots: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    /// Call `callee_id`. Returns the id of the new call.
    pub async fn start_call(
        &self,
        callee_id: impl Into<String>,
        callee_info: PeerInfo,
        media_kind: MediaKind,
    ) -> Result<CallId> {
        let snapshot = self
            .act(Input::StartCall {
                callee_id: callee_id.into(),
                callee_info,
                media_kind,
            })
            .await?;
        snapshot.call_id.ok_or(Error::NoActiveCall)
    }

    pub async fn accept(&self) -> Result<()> {
        self.act(Input::Accept).await.map(|_| ())
    }

    pub async fn reject(&self) -> Result<()> {
        self.act(Input::Reject).await.map(|_| ())
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.act(Input::HangUp).await.map(|_| ())
    }

    /// Flip the microphone. Returns whether it is now enabled.
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.act(Input::ToggleAudio).await.map(|s| s.audio_enabled)
    }

    /// Flip the camera. Returns whether it is now enabled.
    pub async fn toggle_video(&self) -> Result<bool> {
        self.act(Input::ToggleVideo).await.map(|s| s.video_enabled)
    }

    /// Clear a terminal call from view before its dismissal delay.
    pub async fn dismiss(&self) -> Result<()> {
        self.act(Input::Dismiss).await.map(|_| ())
    }

    /// Feed an envelope received from the relay.
    pub fn relay(&self, message: ServerMessage) -> Result<()> {
        self.tx
            .send(AgentEvent::Input(Input::Relay(message)))
            .map_err(|_| Error::AgentStopped)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    async fn act(&self, input: Input) -> Result<CallSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentEvent::Action { input, reply })
            .map_err(|_| Error::AgentStopped)?;
        rx.await.map_err(|_| Error::AgentStopped)?
    }
}

/// Runs a [`CallMachine`] against real devices and the relay.
pub struct CallAgent {
    machine: CallMachine,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    sink: Arc<dyn SignalSink>,

    requests: mpsc::UnboundedReceiver<AgentEvent>,
    internal: mpsc::UnboundedReceiver<AgentEvent>,
    internal_tx: mpsc::UnboundedSender<AgentEvent>,
    snapshots: watch::Sender<CallSnapshot>,
    notices: mpsc::UnboundedSender<CallNotice>,

    /// Media acquired but not yet attached to a peer connection.
    pending_media: Option<(CallId, Box<dyn LocalMedia>)>,
    local_media: Option<Box<dyn LocalMedia>>,
    peer: Option<Box<dyn PeerConnection>>,
}

impl CallAgent {
    pub fn new(
        machine: CallMachine,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn SignalSink>,
    ) -> (Self, CallHandle, mpsc::UnboundedReceiver<CallNotice>) {
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (snapshots, snapshot_rx) = watch::channel(machine.snapshot());
        let (notices, notice_rx) = mpsc::unbounded_channel();

        let agent = Self {
            machine,
            devices,
            connector,
            sink,
            requests,
            internal,
            internal_tx,
            snapshots,
            notices,
            pending_media: None,
            local_media: None,
            peer: None,
        };
        let handle = CallHandle {
            tx: request_tx,
            snapshots: snapshot_rx,
        };
        (agent, handle, notice_rx)
    }

    /// Build an agent and run it on the current runtime.
    pub fn spawn(
        machine: CallMachine,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn SignalSink>,
    ) -> (CallHandle, mpsc::UnboundedReceiver<CallNotice>) {
        let (agent, handle, notices) = Self::new(machine, devices, connector, sink);
        tokio::spawn(agent.run());
        (handle, notices)
    }

    /// Process events until every [`CallHandle`] is dropped.
    pub async fn run(mut self) {
        tracing::debug!(identity = self.machine.identity(), "Call agent started");

        loop {
            let event = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(event) => event,
                    None => break,
                },
                Some(event) = self.internal.recv() => event,
            };
            self.process(event).await;
        }

        self.release().await;
        tracing::debug!(identity = self.machine.identity(), "Call agent stopped");
    }

    async fn process(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Action { input, reply } => match self.machine.handle(input) {
                Ok(commands) => {
                    self.execute(commands).await;
                    self.publish();
                    let _ = reply.send(Ok(self.machine.snapshot()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            AgentEvent::Input(input) => self.apply(input).await,
            AgentEvent::Media { call_id, result } => {
                let input = match result {
                    Ok(media) => {
                        if let Some((_, mut stale)) =
                            self.pending_media.replace((call_id.clone(), media))
                        {
                            stale.stop();
                        }
                        Input::MediaAcquired { call_id }
                    }
                    Err(e) => Input::MediaFailed {
                        call_id,
                        reason: e.to_string(),
                    },
                };
                self.apply(input).await;
            }
        }
    }

    async fn apply(&mut self, input: Input) {
        match self.machine.handle(input) {
            Ok(commands) => self.execute(commands).await,
            Err(e) => tracing::debug!(error = %e, "Call input rejected"),
        }
        self.publish();
    }

    /// Run commands in order. Completions are fed straight back into the
    /// machine and their commands appended to the same batch.
    async fn execute(&mut self, commands: Vec<Command>) {
        let mut queue = VecDeque::from(commands);
        while let Some(command) = queue.pop_front() {
            let Some(input) = self.run_command(command).await else {
                continue;
            };
            match self.machine.handle(input) {
                Ok(more) => queue.extend(more),
                Err(e) => tracing::debug!(error = %e, "Call completion rejected"),
            }
        }
    }

    async fn run_command(&mut self, command: Command) -> Option<Input> {
        match command {
            Command::Send(message) => {
                if let Err(e) = self.sink.send(message) {
                    tracing::warn!(error = %e, "Failed to send call signal");
                }
                None
            }

            Command::AcquireMedia {
                call_id,
                media_kind,
            } => {
                let devices = Arc::clone(&self.devices);
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = devices.acquire(media_kind).await;
                    let _ = tx.send(AgentEvent::Media { call_id, result });
                });
                None
            }

            Command::DiscardMedia { call_id } => {
                match self.pending_media.take() {
                    Some((id, mut media)) if id == call_id => media.stop(),
                    other => self.pending_media = other,
                }
                None
            }

            Command::CreatePeerConnection { call_id } => {
                let media = match self.pending_media.take() {
                    Some((id, media)) if id == call_id => media,
                    other => {
                        self.pending_media = other;
                        return Some(Input::PeerFailed {
                            call_id,
                            reason: "no local media".to_string(),
                        });
                    }
                };
                let events = PeerEvents {
                    call_id: call_id.clone(),
                    tx: self.internal_tx.clone(),
                };
                let result = self
                    .connector
                    .connect(media.as_ref(), &self.machine.config().ice_servers, events)
                    .await;
                self.local_media = Some(media);
                match result {
                    Ok(peer) => {
                        self.peer = Some(peer);
                        Some(Input::PeerCreated { call_id })
                    }
                    Err(e) => Some(Input::PeerFailed {
                        call_id,
                        reason: e.to_string(),
                    }),
                }
            }

            Command::CreateOffer { call_id } => {
                let peer = self.peer.as_mut()?;
                Some(match peer.create_offer().await {
                    Ok(sdp) => Input::OfferCreated { call_id, sdp },
                    Err(e) => Input::PeerFailed {
                        call_id,
                        reason: e.to_string(),
                    },
                })
            }

            Command::CreateAnswer { call_id } => {
                let peer = self.peer.as_mut()?;
                Some(match peer.create_answer().await {
                    Ok(sdp) => Input::AnswerCreated { call_id, sdp },
                    Err(e) => Input::PeerFailed {
                        call_id,
                        reason: e.to_string(),
                    },
                })
            }

            Command::SetRemoteDescription { call_id, sdp } => {
                let peer = self.peer.as_mut()?;
                match peer.set_remote_description(sdp).await {
                    Ok(()) => None,
                    Err(e) => Some(Input::PeerFailed {
                        call_id,
                        reason: e.to_string(),
                    }),
                }
            }

            Command::AddIceCandidate { call_id, candidate } => {
                let peer = self.peer.as_mut()?;
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    tracing::warn!(call_id = %call_id, error = %e, "Failed to add ICE candidate");
                }
                None
            }

            Command::SetTrackEnabled { track, enabled } => {
                if let Some(media) = self.local_media.as_mut() {
                    media.set_track_enabled(track, enabled);
                }
                None
            }

            Command::ReleaseMedia => {
                if let Some(mut media) = self.local_media.take() {
                    media.stop();
                }
                if let Some((_, mut media)) = self.pending_media.take() {
                    media.stop();
                }
                None
            }

            Command::ClosePeerConnection => {
                if let Some(mut peer) = self.peer.take() {
                    peer.close().await;
                }
                None
            }

            Command::ArmTimer {
                call_id,
                timer,
                after,
            } => {
                self.arm(call_id, timer, after);
                None
            }

            Command::Notify(notice) => {
                let _ = self.notices.send(notice);
                None
            }
        }
    }

    fn arm(&self, call_id: CallId, timer: TimerKind, after: std::time::Duration) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(AgentEvent::Input(Input::TimerElapsed { call_id, timer }));
        });
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.machine.snapshot());
    }

    async fn release(&mut self) {
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        if let Some((_, mut media)) = self.pending_media.take() {
            media.stop();
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
