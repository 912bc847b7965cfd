//! Outbound peer session boundary
//!
//! The relay only needs two send-only tracks and a way to exchange session
//! descriptions. [`peer::Str0mSession`] implements this on top of str0m.

use std::sync::Arc;

use crate::error::{NegotiationError, SessionError, TrackError};
use crate::model::state::{ConnectionState, SdpKind};

pub mod peer;

pub use peer::Str0mSession;

/// Called on every connection state change of the session.
pub type StateHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// A send-only track of the outbound session.
pub trait MediaTrack: Send + Sync {
    /// Queues one sample spanning `duration` ticks of the track clock.
    fn write_sample(&self, data: &[u8], duration: u32) -> Result<(), TrackError>;
}

pub trait OutboundSession: Send + Sync {
    /// Synthesizes an offer or answer and applies it as local description.
    fn create_local_description(&self, kind: SdpKind) -> Result<String, NegotiationError>;

    fn apply_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), NegotiationError>;

    /// Replaces the connection state listener.
    fn on_connection_state(&self, handler: StateHandler);

    fn video_track(&self) -> Arc<dyn MediaTrack>;

    fn audio_track(&self) -> Arc<dyn MediaTrack>;

    /// Releases the session. Idempotent.
    fn close(&self) -> Result<(), SessionError>;
}
