//! Error types for every seam of the relay.
//!
//! Each collaborator boundary gets its own enum so callers can tell a
//! rejected session description apart from a broken upstream or a failed
//! audio transform.

use thiserror::Error;

/// Failures while exchanging session descriptions.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The description could not be parsed.
    #[error("malformed session description: {0}")]
    Malformed(String),
    /// The description parsed but the peer session refused it.
    #[error("session description rejected: {0}")]
    Rejected(String),
    /// An answer arrived without a local offer waiting for it.
    #[error("no pending local offer to match the answer")]
    NoPendingOffer,
    /// An answer was requested before any remote offer was applied.
    #[error("no remote offer to answer")]
    NoRemoteOffer,
    #[error("session is closed")]
    Closed,
}

/// Failures while building or tearing down the outbound peer session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid local candidate: {0}")]
    Candidate(String),
    #[error("no usable local candidate")]
    NoCandidates,
}

/// Failures while writing a sample to an outbound track.
#[derive(Debug, Error)]
pub enum TrackError {
    /// The track has no negotiated media line yet.
    #[error("track is not negotiated")]
    NotNegotiated,
    /// The remote peer accepted no payload type for the track's codec.
    #[error("no payload type negotiated for {0}")]
    NoPayloadType(&'static str),
    #[error("sample write failed: {0}")]
    Write(String),
    #[error("track is closed")]
    Closed,
}

/// Failures of the upstream ingest connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream io error: {0}")]
    Io(#[from] std::io::Error),
    /// The RTMP session failed to parse or produce a message.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    /// The server refused the connection or the stream key.
    #[error("upstream rejected the request: {0}")]
    Rejected(String),
    #[error("invalid upstream address: {0}")]
    InvalidAddress(String),
    #[error("unsupported upstream: {0}")]
    Unsupported(String),
    #[error("malformed upstream data: {0}")]
    Malformed(String),
    #[error("upstream connection is closed")]
    Closed,
}

/// Failures of the audio transform collaborator.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("audio transform setup failed: {0}")]
    Setup(String),
    #[error("audio transform failed: {0}")]
    Packet(String),
}

/// Failures that stop a relay run before or instead of its read loop.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect upstream: {0}")]
    Connect(#[source] UpstreamError),
    #[error("failed to read upstream streams: {0}")]
    Streams(#[source] UpstreamError),
    #[error("failed to configure audio transform: {0}")]
    Transform(#[source] TransformError),
    #[error("relay was already started")]
    AlreadyStarted,
    #[error("relay thread panicked")]
    Panicked,
}

/// Failures while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
