//! Audio transform boundary
//!
//! The relay hands every upstream audio packet to an [`AudioTransform`],
//! which turns it into packets the outbound audio track accepts. The numeric
//! work (decode, resample, remix, encode) lives behind the trait.

use std::time::Duration;

use tracing::info;

use crate::error::TransformError;
use crate::model::stream::{AudioParams, ChannelLayout, Packet, SampleFormat};

/// Sample rate, channel layout and sample format of an audio signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    /// Format every transform is configured to produce.
    pub const OUTPUT: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        channel_layout: ChannelLayout::Stereo,
        sample_format: SampleFormat::S16,
    };
}

impl From<&AudioParams> for AudioFormat {
    fn from(params: &AudioParams) -> Self {
        AudioFormat {
            sample_rate: params.sample_rate,
            channel_layout: params.channel_layout,
            sample_format: params.sample_format,
        }
    }
}

/// One transformed audio packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Media time of the output packet
    pub time: Duration,
    pub data: Vec<u8>,
}

/// Converts upstream audio packets into outbound audio packets.
///
/// `setup` is called exactly once before the first `transform`. A transform
/// may buffer input and return no frames, or split one input into several.
pub trait AudioTransform: Send {
    fn setup(&mut self, input: &AudioParams, output: &AudioFormat) -> Result<(), TransformError>;

    fn transform(&mut self, packet: &Packet) -> Result<Vec<AudioFrame>, TransformError>;
}

/// Transform that swallows all audio.
///
/// Useful when no audio encoder is linked in: video still flows and the
/// audio track stays silent.
#[derive(Debug, Default)]
pub struct MuteAudio {
    dropped: u64,
}

impl MuteAudio {
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl AudioTransform for MuteAudio {
    fn setup(&mut self, input: &AudioParams, output: &AudioFormat) -> Result<(), TransformError> {
        info!(
            input = ?AudioFormat::from(input),
            ?output,
            "audio transform configured, audio will be muted"
        );
        Ok(())
    }

    fn transform(&mut self, _packet: &Packet) -> Result<Vec<AudioFrame>, TransformError> {
        self.dropped += 1;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_emits_nothing() {
        let mut mute = MuteAudio::default();
        let params = AudioParams {
            sample_rate: 44_100,
            channel_layout: ChannelLayout::Stereo,
            sample_format: SampleFormat::F32Planar,
            config: vec![0x12, 0x10],
        };
        mute.setup(&params, &AudioFormat::OUTPUT).unwrap();

        let packet = Packet {
            stream_index: 1,
            time: Duration::from_millis(23),
            data: vec![0x21, 0x00],
            is_key_frame: false,
        };
        assert!(mute.transform(&packet).unwrap().is_empty());
        assert_eq!(mute.dropped(), 1);
    }
}
