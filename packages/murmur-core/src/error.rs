//! # Error Handling
//!
//! Error types for the client side of Murmur.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Call Lifecycle Errors                                             │
//! │  │   ├── CallInProgress        - A live call already exists            │
//! │  │   ├── NoActiveCall          - Action needs a call that isn't there  │
//! │  │   └── InvalidTransition     - Action not allowed in this state      │
//! │  │                                                                      │
//! │  ├── Media Errors                                                      │
//! │  │   └── MediaUnavailable      - Permission denied / no device         │
//! │  │                                                                      │
//! │  └── Transport Errors                                                  │
//! │      ├── PeerConnection        - WebRTC peer connection failure        │
//! │      ├── Signaling             - Relay link refused an envelope        │
//! │      └── AgentStopped          - The call agent task has exited        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inside the state machine every error resolves to the terminal `failed`
//! status with resources released; these values surface only through the
//! driver's collaborator traits and the [`CallHandle`](crate::call::CallHandle).

use thiserror::Error;

/// Result type alias for Murmur Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Murmur Core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Call Lifecycle Errors
    // ========================================================================

    /// A non-terminal call already exists
    #[error("A call is already in progress: {0}")]
    CallInProgress(String),

    /// The action requires a live call
    #[error("No active call.")]
    NoActiveCall,

    /// The action is not valid for the current call status
    #[error("Cannot {action} while call is {status}")]
    InvalidTransition {
        /// What was attempted
        action: &'static str,
        /// Status the call was in
        status: String,
    },

    // ========================================================================
    // Media Errors
    // ========================================================================

    /// Local media could not be acquired (permission denied, no device)
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    // ========================================================================
    // Transport Errors
    // ========================================================================

    /// The WebRTC peer connection failed
    #[error("Peer connection failed: {0}")]
    PeerConnection(String),

    /// The signaling link could not carry an envelope
    #[error("Signaling failed: {0}")]
    Signaling(String),

    /// The call agent is no longer running
    #[error("Call agent has stopped.")]
    AgentStopped,
}

impl Error {
    /// Whether this error came from local media devices
    pub fn is_media_error(&self) -> bool {
        matches!(self, Self::MediaUnavailable(_))
    }

    /// Whether this error is fatal for a call attempt
    pub fn is_fatal_for_call(&self) -> bool {
        matches!(
            self,
            Self::MediaUnavailable(_) | Self::PeerConnection(_) | Self::Signaling(_)
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
