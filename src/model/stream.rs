//! Stream descriptors and demuxed packets
//!
//! These are the values an upstream source hands to the relay: one
//! descriptor per elementary stream, decided once at connect time, and one
//! packet per demuxed access unit.

use std::time::Duration;

/// Codec parameters of an H.264 video stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoParams {
    /// Sequence parameter set, without start code or length prefix
    pub sps: Vec<u8>,
    /// Picture parameter set, without start code or length prefix
    pub pps: Vec<u8>,
}

/// Speaker arrangement of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    /// Any other arrangement, by channel count
    Other(u8),
}

impl ChannelLayout {
    pub fn from_channels(count: u8) -> ChannelLayout {
        match count {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            n => ChannelLayout::Other(n),
        }
    }

    pub fn channels(&self) -> u8 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Other(n) => *n,
        }
    }
}

/// In-memory representation of decoded audio samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    /// 32-bit float, one plane per channel
    F32Planar,
}

/// Codec parameters of an audio stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    /// Decoder configuration as carried by the container (AAC AudioSpecificConfig)
    pub config: Vec<u8>,
}

/// What a stream carries, with the parameters needed to relay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Video(VideoParams),
    Audio(AudioParams),
}

impl MediaKind {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, MediaKind::Audio(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            MediaKind::Video(_) => "video",
            MediaKind::Audio(_) => "audio",
        }
    }
}

/// One elementary stream of an upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Position of the stream, referenced by [`Packet::stream_index`]
    pub index: usize,
    pub kind: MediaKind,
}

/// One demuxed access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_index: usize,
    /// Media time on the source clock
    pub time: Duration,
    pub data: Vec<u8>,
    pub is_key_frame: bool,
}
