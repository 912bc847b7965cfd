//! AAC to Opus audio transform
//!
//! Decodes AAC-LC with symphonia, remixes to stereo, resamples to 48 kHz
//! with rubato and encodes 20 ms Opus frames. Output frames are timed from
//! the first input packet in steps of exactly one frame.

use std::time::Duration;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_AAC};
use symphonia::core::formats::Packet as EncodedPacket;
use symphonia::default::codecs::AacDecoder;
use tracing::{debug, info};

use crate::error::TransformError;
use crate::model::stream::{AudioParams, Packet};
use crate::transform::{AudioFormat, AudioFrame, AudioTransform};

const OUTPUT_RATE: u32 = 48_000;
const OUTPUT_CHANNELS: usize = 2;
/// 20 ms at 48 kHz, per channel
const FRAME_SAMPLES: usize = 960;
const FRAME_DURATION: Duration = Duration::from_millis(20);
/// One AAC frame, the resampler's fixed input chunk
const AAC_FRAME_SAMPLES: usize = 1024;
const MAX_OPUS_PACKET: usize = 4000;
const OPUS_BITRATE: i32 = 128_000;

/// [`AudioTransform`] from AAC-LC to 48 kHz stereo Opus.
#[derive(Default)]
pub struct AacOpusTransform {
    pipeline: Option<Pipeline>,
}

impl AacOpusTransform {
    pub fn new() -> Self {
        AacOpusTransform::default()
    }
}

impl AudioTransform for AacOpusTransform {
    fn setup(&mut self, input: &AudioParams, output: &AudioFormat) -> Result<(), TransformError> {
        if *output != AudioFormat::OUTPUT {
            return Err(TransformError::Setup(format!(
                "only {:?} output is supported, got {output:?}",
                AudioFormat::OUTPUT
            )));
        }
        if input.config.is_empty() {
            return Err(TransformError::Setup("missing AAC AudioSpecificConfig".into()));
        }

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_AAC)
            .with_sample_rate(input.sample_rate)
            .with_extra_data(input.config.clone().into_boxed_slice());
        let decoder = AacDecoder::try_new(&params, &DecoderOptions::default())
            .map_err(|e| TransformError::Setup(format!("AAC decoder: {e}")))?;

        let mut pipeline = Pipeline::new(input.sample_rate)?;
        pipeline.decoder = Some(decoder);

        info!(
            input = ?AudioFormat::from(input),
            ?output,
            resampling = pipeline.resampler.is_some(),
            "AAC to Opus transform configured"
        );
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn transform(&mut self, packet: &Packet) -> Result<Vec<AudioFrame>, TransformError> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| TransformError::Packet("transform is not configured".into()))?;

        let stereo = pipeline.decode(&packet.data)?;
        pipeline.push(&stereo, packet.time)
    }
}

/// Decoder, resampler and encoder state of one configured transform.
struct Pipeline {
    decoder: Option<AacDecoder>,
    resampler: Option<Resampling>,
    encoder: opus::Encoder,
    /// Interleaved 48 kHz stereo waiting to fill a frame
    fifo: Vec<f32>,
    /// Media time of the first input packet
    anchor: Option<Duration>,
    emitted: u32,
}

struct Resampling {
    resampler: SincFixedIn<f32>,
    /// Planar input waiting to fill a chunk
    input: [Vec<f32>; OUTPUT_CHANNELS],
}

impl Pipeline {
    fn new(input_rate: u32) -> Result<Pipeline, TransformError> {
        let resampler = if input_rate == OUTPUT_RATE {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = OUTPUT_RATE as f64 / input_rate as f64;
            let resampler =
                SincFixedIn::<f32>::new(ratio, 2.0, params, AAC_FRAME_SAMPLES, OUTPUT_CHANNELS)
                    .map_err(|e| TransformError::Setup(format!("resampler: {e:?}")))?;
            Some(Resampling {
                resampler,
                input: [Vec::new(), Vec::new()],
            })
        };

        let mut encoder =
            opus::Encoder::new(OUTPUT_RATE, opus::Channels::Stereo, opus::Application::Audio)
                .map_err(|e| TransformError::Setup(format!("Opus encoder: {e:?}")))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(OPUS_BITRATE))
            .map_err(|e| TransformError::Setup(format!("Opus bitrate: {e:?}")))?;

        Ok(Pipeline {
            decoder: None,
            resampler,
            encoder,
            fifo: Vec::new(),
            anchor: None,
            emitted: 0,
        })
    }

    /// Decodes one raw AAC frame to interleaved stereo at the input rate.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, TransformError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| TransformError::Packet("no AAC decoder".into()))?;

        let packet = EncodedPacket::new_from_slice(0, 0, AAC_FRAME_SAMPLES as u64, data);
        let decoded = decoder
            .decode(&packet)
            .map_err(|e| TransformError::Packet(format!("AAC decode: {e}")))?;

        let spec = *decoded.spec();
        let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);

        Ok(to_stereo(samples.samples(), spec.channels.count()))
    }

    /// Queues interleaved stereo input and encodes every complete frame.
    fn push(&mut self, stereo: &[f32], time: Duration) -> Result<Vec<AudioFrame>, TransformError> {
        let anchor = *self.anchor.get_or_insert(time);

        match &mut self.resampler {
            Some(resampling) => {
                for pair in stereo.chunks_exact(OUTPUT_CHANNELS) {
                    resampling.input[0].push(pair[0]);
                    resampling.input[1].push(pair[1]);
                }
                while resampling.input[0].len() >= resampling.resampler.input_frames_next() {
                    let n = resampling.resampler.input_frames_next();
                    let chunk: Vec<Vec<f32>> = resampling
                        .input
                        .iter_mut()
                        .map(|channel| channel.drain(..n).collect())
                        .collect();
                    let out = resampling
                        .resampler
                        .process(&chunk, None)
                        .map_err(|e| TransformError::Packet(format!("resample: {e:?}")))?;
                    for i in 0..out[0].len() {
                        self.fifo.push(out[0][i]);
                        self.fifo.push(out[1][i]);
                    }
                }
            }
            None => self.fifo.extend_from_slice(stereo),
        }

        let mut frames = Vec::new();
        while self.fifo.len() >= FRAME_SAMPLES * OUTPUT_CHANNELS {
            let pcm: Vec<i16> = self
                .fifo
                .drain(..FRAME_SAMPLES * OUTPUT_CHANNELS)
                .map(to_s16)
                .collect();
            let data = self
                .encoder
                .encode_vec(&pcm, MAX_OPUS_PACKET)
                .map_err(|e| TransformError::Packet(format!("Opus encode: {e:?}")))?;

            frames.push(AudioFrame {
                time: anchor + FRAME_DURATION * self.emitted,
                data,
            });
            self.emitted += 1;
        }

        if frames.is_empty() {
            debug!(queued = self.fifo.len() / OUTPUT_CHANNELS, "audio buffered");
        }
        Ok(frames)
    }
}

/// Interleaved samples of any channel count to interleaved stereo.
///
/// Mono is duplicated; wider layouts keep their front left and right.
fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

fn to_s16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stream::{ChannelLayout, SampleFormat};

    fn params(sample_rate: u32, config: &[u8]) -> AudioParams {
        AudioParams {
            sample_rate,
            channel_layout: ChannelLayout::Stereo,
            sample_format: SampleFormat::F32Planar,
            config: config.to_vec(),
        }
    }

    fn silence(frames: usize) -> Vec<f32> {
        vec![0.0; frames * OUTPUT_CHANNELS]
    }

    #[test]
    fn setup_accepts_aac_lc() {
        let mut transform = AacOpusTransform::new();
        // AAC LC, 44.1 kHz, stereo
        transform
            .setup(&params(44_100, &[0x12, 0x10]), &AudioFormat::OUTPUT)
            .unwrap();
        assert!(transform.pipeline.as_ref().unwrap().resampler.is_some());

        let mut transform = AacOpusTransform::new();
        // AAC LC, 48 kHz, stereo
        transform
            .setup(&params(48_000, &[0x11, 0x90]), &AudioFormat::OUTPUT)
            .unwrap();
        assert!(transform.pipeline.as_ref().unwrap().resampler.is_none());
    }

    #[test]
    fn setup_rejects_other_outputs() {
        let mut transform = AacOpusTransform::new();
        let mono = AudioFormat {
            channel_layout: ChannelLayout::Mono,
            ..AudioFormat::OUTPUT
        };
        assert!(matches!(
            transform.setup(&params(44_100, &[0x12, 0x10]), &mono),
            Err(TransformError::Setup(_))
        ));
    }

    #[test]
    fn setup_needs_a_decoder_config() {
        let mut transform = AacOpusTransform::new();
        assert!(matches!(
            transform.setup(&params(44_100, &[]), &AudioFormat::OUTPUT),
            Err(TransformError::Setup(_))
        ));
    }

    #[test]
    fn transform_before_setup_fails() {
        let mut transform = AacOpusTransform::new();
        let packet = Packet {
            stream_index: 0,
            time: Duration::ZERO,
            data: vec![0x21, 0x00],
            is_key_frame: false,
        };
        assert!(matches!(
            transform.transform(&packet),
            Err(TransformError::Packet(_))
        ));
    }

    #[test]
    fn frames_are_20ms_apart_from_the_first_input() {
        let mut pipeline = Pipeline::new(48_000).unwrap();
        let start = Duration::from_millis(500);

        let first = pipeline.push(&silence(1024), start).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].time, start);
        assert!(!first[0].data.is_empty());

        // 64 frames left over plus 1024 more fill one frame, not two.
        let second = pipeline.push(&silence(1024), start + Duration::from_millis(21)).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].time, start + FRAME_DURATION);

        let third = pipeline.push(&silence(1024), start + Duration::from_millis(42)).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].time, start + FRAME_DURATION * 2);
    }

    #[test]
    fn resampled_input_keeps_the_frame_cadence() {
        let mut pipeline = Pipeline::new(44_100).unwrap();

        let mut frames = Vec::new();
        for i in 0..20u64 {
            let time = Duration::from_micros(i * 1024 * 1_000_000 / 44_100);
            frames.extend(pipeline.push(&silence(1024), time).unwrap());
        }

        // 20 AAC frames are about 464 ms, minus the resampler's delay.
        assert!(frames.len() >= 18, "only {} frames", frames.len());
        assert!(frames.len() <= 24, "{} frames", frames.len());
        for (n, frame) in frames.iter().enumerate() {
            assert_eq!(frame.time, FRAME_DURATION * n as u32);
        }
    }

    #[test]
    fn remix_to_stereo() {
        assert_eq!(to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(to_stereo(&[0.1, 0.2, 0.3, 0.4], 2), vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(
            to_stereo(&[0.1, 0.2, 0.9, 0.3, 0.4, 0.9], 3),
            vec![0.1, 0.2, 0.3, 0.4]
        );
    }

    #[test]
    fn samples_are_clamped_to_s16() {
        assert_eq!(to_s16(2.0), i16::MAX);
        assert_eq!(to_s16(-2.0), -i16::MAX);
        assert_eq!(to_s16(0.0), 0);
    }
}
