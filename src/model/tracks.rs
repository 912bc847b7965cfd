//! Outbound media track bookkeeping
//!
//! The peer session owns one [`TrackOut`] per send-only track and moves it
//! through SDP negotiation before any sample may be written to it.

use str0m::format::Codec;
use str0m::media::{Frequency, MediaKind, Mid};

/// Represents an outgoing media track being sent to the peer.
#[derive(Debug)]
pub struct TrackOut {
    /// The kind of media (audio or video)
    pub(crate) kind: MediaKind,
    /// Codec the relay writes on this track
    pub(crate) codec: Codec,
    /// RTP clock of the codec
    pub(crate) clock: Frequency,
    /// Current state of the outgoing track
    pub(crate) state: TrackOutState,
    /// RTP time of the last written sample, in `clock` ticks
    pub(crate) rtp_time: u64,
}

/// The negotiation state of an outgoing track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutState {
    /// Track needs to be opened in the next SDP negotiation
    ToOpen,
    /// Track negotiation is in progress with the given Mid
    Negotiating(Mid),
    /// Track is fully negotiated and open for media transmission
    Open(Mid),
}

impl TrackOut {
    pub fn video() -> TrackOut {
        TrackOut {
            kind: MediaKind::Video,
            codec: Codec::H264,
            clock: Frequency::NINETY_KHZ,
            state: TrackOutState::ToOpen,
            rtp_time: 0,
        }
    }

    pub fn audio() -> TrackOut {
        TrackOut {
            kind: MediaKind::Audio,
            codec: Codec::Opus,
            clock: Frequency::FORTY_EIGHT_KHZ,
            state: TrackOutState::ToOpen,
            rtp_time: 0,
        }
    }

    /// Gets the media ID (Mid) for this track, if assigned.
    pub fn mid(&self) -> Option<Mid> {
        match self.state {
            TrackOutState::ToOpen => None,
            TrackOutState::Negotiating(m) | TrackOutState::Open(m) => Some(m),
        }
    }

    /// The Mid samples may be written to, once negotiation completed.
    pub fn open_mid(&self) -> Option<Mid> {
        match self.state {
            TrackOutState::Open(m) => Some(m),
            _ => None,
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self.kind {
            MediaKind::Video => "H264",
            MediaKind::Audio => "opus",
        }
    }
}
