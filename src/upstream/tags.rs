//! Video and audio message bodies of an RTMP stream
//!
//! RTMP carries media in the FLV tag body layout: one header byte naming the
//! codec and frame type, a packet type byte, then the payload. The first
//! AVC and AAC sequence headers become stream descriptors; later media
//! bodies become [`Packet`]s of those streams.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::model::stream::{
    AudioParams, ChannelLayout, MediaKind, Packet, SampleFormat, StreamDescriptor, VideoParams,
};

const CODEC_AVC: u8 = 7;
const SOUND_AAC: u8 = 10;
const FRAME_KEY: u8 = 1;

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Turns media message bodies into stream descriptors and packets.
#[derive(Debug, Default)]
pub struct TagDemuxer {
    streams: Vec<StreamDescriptor>,
    video: Option<usize>,
    audio: Option<usize>,
}

impl TagDemuxer {
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Handles one video message body with its millisecond timestamp.
    pub fn video(&mut self, timestamp: u32, data: &[u8]) -> Result<Option<Packet>, UpstreamError> {
        if data.len() < 5 {
            debug!(len = data.len(), "skipping short video message");
            return Ok(None);
        }

        let head = data[0];
        if head & 0x80 != 0 || head & 0x0f != CODEC_AVC {
            debug!(head, "skipping non-AVC video message");
            return Ok(None);
        }

        match data[1] {
            0 => {
                if self.video.is_some() {
                    debug!("ignoring repeated AVC sequence header");
                    return Ok(None);
                }
                let params = parse_avc_config(&data[5..])?;
                self.video = Some(self.add_stream(MediaKind::Video(params)));
                Ok(None)
            }
            1 => {
                let Some(index) = self.video else {
                    debug!("dropping video before AVC sequence header");
                    return Ok(None);
                };
                Ok(Some(Packet {
                    stream_index: index,
                    time: Duration::from_millis(timestamp as u64),
                    data: data[5..].to_vec(),
                    is_key_frame: head >> 4 == FRAME_KEY,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Handles one audio message body with its millisecond timestamp.
    pub fn audio(&mut self, timestamp: u32, data: &[u8]) -> Result<Option<Packet>, UpstreamError> {
        if data.len() < 2 {
            debug!(len = data.len(), "skipping short audio message");
            return Ok(None);
        }

        if data[0] >> 4 != SOUND_AAC {
            debug!(format = data[0] >> 4, "skipping non-AAC audio message");
            return Ok(None);
        }

        match data[1] {
            0 => {
                if self.audio.is_some() {
                    debug!("ignoring repeated AAC sequence header");
                    return Ok(None);
                }
                let params = parse_audio_config(&data[2..])?;
                self.audio = Some(self.add_stream(MediaKind::Audio(params)));
                Ok(None)
            }
            _ => {
                let Some(index) = self.audio else {
                    debug!("dropping audio before AAC sequence header");
                    return Ok(None);
                };
                Ok(Some(Packet {
                    stream_index: index,
                    time: Duration::from_millis(timestamp as u64),
                    data: data[2..].to_vec(),
                    is_key_frame: false,
                }))
            }
        }
    }

    fn add_stream(&mut self, kind: MediaKind) -> usize {
        let index = self.streams.len();
        debug!(index, kind = kind.name(), "found upstream stream");
        self.streams.push(StreamDescriptor { index, kind });
        index
    }
}

/// Parses an AVCDecoderConfigurationRecord, keeping the first SPS and PPS.
pub fn parse_avc_config(data: &[u8]) -> Result<VideoParams, UpstreamError> {
    if data.len() < 6 {
        return Err(UpstreamError::Malformed("short AVC configuration record".into()));
    }

    let length_size = (data[4] & 0x03) + 1;
    if length_size != 4 {
        warn!(length_size, "AVC stream uses non 4-byte NAL lengths");
    }

    let mut pos = 5;
    let sps_count = data[pos] & 0x1f;
    pos += 1;
    let mut sps = None;
    for _ in 0..sps_count {
        let unit = read_parameter_set(data, &mut pos)?;
        sps.get_or_insert_with(|| unit.to_vec());
    }

    let pps_count = *data
        .get(pos)
        .ok_or_else(|| UpstreamError::Malformed("AVC configuration record without PPS".into()))?;
    pos += 1;
    let mut pps = None;
    for _ in 0..pps_count {
        let unit = read_parameter_set(data, &mut pos)?;
        pps.get_or_insert_with(|| unit.to_vec());
    }

    Ok(VideoParams {
        sps: sps.ok_or_else(|| UpstreamError::Malformed("no SPS in AVC configuration".into()))?,
        pps: pps.ok_or_else(|| UpstreamError::Malformed("no PPS in AVC configuration".into()))?,
    })
}

/// Parses an AAC AudioSpecificConfig.
pub fn parse_audio_config(data: &[u8]) -> Result<AudioParams, UpstreamError> {
    if data.len() < 2 {
        return Err(UpstreamError::Malformed("short AAC AudioSpecificConfig".into()));
    }

    let object_type = data[0] >> 3;
    let frequency_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);

    let (sample_rate, channel_config) = if frequency_index == 0x0f {
        if data.len() < 5 {
            return Err(UpstreamError::Malformed("short explicit AAC frequency".into()));
        }
        let rate = ((data[1] as u32 & 0x7f) << 17)
            | ((data[2] as u32) << 9)
            | ((data[3] as u32) << 1)
            | (data[4] as u32 >> 7);
        (rate, (data[4] >> 3) & 0x0f)
    } else {
        let rate = *AAC_SAMPLE_RATES.get(frequency_index as usize).ok_or_else(|| {
            UpstreamError::Malformed(format!("bad AAC frequency index {frequency_index}"))
        })?;
        (rate, (data[1] >> 3) & 0x0f)
    };

    debug!(object_type, sample_rate, channel_config, "parsed AAC config");

    // Channel configuration 7 is 7.1, i.e. eight channels.
    let channels = if channel_config == 7 { 8 } else { channel_config };

    Ok(AudioParams {
        sample_rate,
        channel_layout: ChannelLayout::from_channels(channels),
        sample_format: SampleFormat::F32Planar,
        config: data.to_vec(),
    })
}

fn read_parameter_set<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], UpstreamError> {
    let short = || UpstreamError::Malformed("truncated parameter set".into());
    let len_bytes = data.get(*pos..*pos + 2).ok_or_else(short)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    *pos += 2;
    let unit = data.get(*pos..*pos + len).ok_or_else(short)?;
    *pos += len;
    Ok(unit)
}
