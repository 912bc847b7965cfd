//! Relays one live RTMP stream to one WebRTC peer.
//!
//! The upstream is demuxed into packets, video is reframed to Annex B,
//! audio goes through an [`AudioTransform`], and both are written to the
//! send-only tracks of an [`OutboundSession`] once the peer connects.

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod model;
pub mod reframe;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod timestamp;
pub mod transform;
pub mod upstream;

mod util;

pub use audio::AacOpusTransform;
pub use bridge::Bridge;
pub use config::{Config, SessionConfig};
pub use model::state::{ConnectionState, SdpKind, SessionDescription};
pub use model::stream::{MediaKind, Packet, StreamDescriptor};
pub use relay::{MediaRelay, RelayEnd, RelayReport};
pub use session::{MediaTrack, OutboundSession, Str0mSession};
pub use transform::{AudioFormat, AudioFrame, AudioTransform, MuteAudio};
pub use upstream::{RtmpDialer, UpstreamConnection, UpstreamDialer};
pub use util::select_host_address;
