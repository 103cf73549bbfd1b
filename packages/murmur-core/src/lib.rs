//! # Murmur Core
//!
//! Shared pieces of the Murmur real-time layer:
//!
//! - [`protocol`]: the JSON envelopes exchanged between clients and the relay
//! - [`call`]: client-side call negotiation, as a pure state machine plus an
//!   async agent that drives it against media devices and a peer connection
//! - [`error`]: the client-side error type
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         CLIENT                                  │
//! │                                                                 │
//! │   UI ──► CallHandle ──► CallAgent ──► CallMachine (pure)        │
//! │              ▲              │                                   │
//! │              │              ├──► MediaDevices / LocalMedia      │
//! │       snapshots, notices    ├──► PeerConnector / PeerConnection │
//! │                             └──► SignalSink ──────┐             │
//! └───────────────────────────────────────────────────┼─────────────┘
//!                                                     ▼
//!                                        murmur-relay (WebSocket)
//! ```

pub mod call;
pub mod error;
pub mod protocol;

pub use call::{
    CallAgent, CallConfig, CallHandle, CallId, CallMachine, CallNotice, CallRole, CallSnapshot,
    CallStatus,
};
pub use error::{Error, Result};
pub use protocol::{ClientMessage, ServerMessage};
