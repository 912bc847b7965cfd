//! The media relay loop
//!
//! [`MediaRelay::run`] dials the upstream, configures the audio transform
//! from the stream descriptors, then forwards packets one at a time until the
//! upstream ends, fails, or the relay is closed:
//!
//! * video is reframed to Annex B and written with its 90 kHz duration
//! * audio goes through the [`AudioTransform`] and every output is written
//!   with its 48 kHz duration
//!
//! [`MediaRelay::close`] may run on another thread at any time. The closed
//! latch and the upstream handle share one lock; the handle itself is closed
//! outside of it so a blocked read is interrupted rather than waited for.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{RelayError, UpstreamError};
use crate::model::stream::{AudioParams, MediaKind, Packet, StreamDescriptor, VideoParams};
use crate::reframe::reframe;
use crate::session::MediaTrack;
use crate::timestamp::TimestampTracker;
use crate::transform::{AudioFormat, AudioTransform};
use crate::upstream::{UpstreamConnection, UpstreamDialer};

/// Why a relay run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    /// The upstream finished its broadcast.
    EndOfStream,
    /// The relay was closed.
    Closed,
    /// Reading from the upstream failed mid-stream.
    ReadFailed(String),
}

/// Outcome of a finished relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub end: RelayEnd,
    pub video_samples: u64,
    pub audio_samples: u64,
    pub transform_failures: u64,
    pub write_failures: u64,
    /// Packets of unknown or unrelayed streams
    pub dropped_packets: u64,
}

impl RelayReport {
    fn new() -> Self {
        RelayReport {
            end: RelayEnd::EndOfStream,
            video_samples: 0,
            audio_samples: 0,
            transform_failures: 0,
            write_failures: 0,
            dropped_packets: 0,
        }
    }
}

#[derive(Default)]
struct RelayState {
    closed: bool,
    upstream: Option<Arc<dyn UpstreamConnection>>,
}

pub struct MediaRelay {
    address: String,
    dialer: Arc<dyn UpstreamDialer>,
    video: Arc<dyn MediaTrack>,
    audio: Arc<dyn MediaTrack>,
    transform: Mutex<Option<Box<dyn AudioTransform>>>,
    state: Mutex<RelayState>,
}

impl MediaRelay {
    pub fn new(
        address: impl Into<String>,
        dialer: Arc<dyn UpstreamDialer>,
        video: Arc<dyn MediaTrack>,
        audio: Arc<dyn MediaTrack>,
        transform: Box<dyn AudioTransform>,
    ) -> MediaRelay {
        MediaRelay {
            address: address.into(),
            dialer,
            video,
            audio,
            transform: Mutex::new(Some(transform)),
            state: Mutex::new(RelayState::default()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Dials the upstream and relays until it ends. Runs once per relay.
    pub fn run(&self) -> Result<RelayReport, RelayError> {
        let transform = self
            .transform
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RelayError::AlreadyStarted)?;

        if self.is_closed() {
            return Ok(RelayReport {
                end: RelayEnd::Closed,
                ..RelayReport::new()
            });
        }

        info!(address = %self.address, "dialing upstream");
        let upstream = self.dialer.dial(&self.address).map_err(RelayError::Connect)?;

        {
            let mut state = self.lock_state();
            if state.closed {
                drop(state);
                debug!("relay closed while dialing, releasing upstream");
                if let Err(e) = upstream.close() {
                    warn!("failed to release upstream: {e}");
                }
                return Ok(RelayReport {
                    end: RelayEnd::Closed,
                    ..RelayReport::new()
                });
            }
            state.upstream = Some(upstream.clone());
        }

        let dispatch = upstream
            .streams()
            .map_err(RelayError::Streams)
            .and_then(|streams| {
                Dispatch::new(&streams, transform, self.video.clone(), self.audio.clone())
            });
        let mut dispatch = match dispatch {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!("relay setup failed, releasing upstream: {e}");
                if let Err(e) = self.close() {
                    warn!("failed to release upstream: {e}");
                }
                return Err(e);
            }
        };

        let end = loop {
            let packet = match upstream.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    info!("upstream reached end of stream");
                    break RelayEnd::EndOfStream;
                }
                Err(_) if self.is_closed() => break RelayEnd::Closed,
                Err(e) => {
                    warn!("upstream read failed: {e}");
                    break RelayEnd::ReadFailed(e.to_string());
                }
            };

            if self.is_closed() {
                break RelayEnd::Closed;
            }

            dispatch.packet(packet);
        };

        let report = RelayReport {
            end,
            ..dispatch.report
        };
        info!(?report, "relay stopped");
        Ok(report)
    }

    /// Releases the upstream connection. Idempotent; later runs see `Closed`.
    pub fn close(&self) -> Result<(), UpstreamError> {
        let upstream = {
            let mut state = self.lock_state();
            state.closed = true;
            state.upstream.take()
        };

        match upstream {
            Some(upstream) => {
                debug!(address = %self.address, "releasing upstream");
                upstream.close()
            }
            None => Ok(()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-run packet routing and timing state.
struct Dispatch {
    streams: Vec<StreamDescriptor>,
    /// Relayed video stream and its parameter sets
    video: Option<(usize, VideoParams)>,
    /// Relayed audio stream
    audio: Option<usize>,
    transform: Box<dyn AudioTransform>,
    video_track: Arc<dyn MediaTrack>,
    audio_track: Arc<dyn MediaTrack>,
    video_clock: TimestampTracker,
    audio_clock: TimestampTracker,
    report: RelayReport,
}

impl Dispatch {
    /// Picks the first stream of each kind and configures the transform once.
    fn new(
        streams: &[StreamDescriptor],
        mut transform: Box<dyn AudioTransform>,
        video_track: Arc<dyn MediaTrack>,
        audio_track: Arc<dyn MediaTrack>,
    ) -> Result<Dispatch, RelayError> {
        let video = streams.iter().find_map(|s| match &s.kind {
            MediaKind::Video(params) => Some((s.index, params.clone())),
            MediaKind::Audio(_) => None,
        });

        let audio: Option<(usize, &AudioParams)> = streams.iter().find_map(|s| match &s.kind {
            MediaKind::Audio(params) => Some((s.index, params)),
            MediaKind::Video(_) => None,
        });

        if let Some((index, params)) = audio {
            debug!(index, input = ?AudioFormat::from(params), "configuring audio transform");
            transform
                .setup(params, &AudioFormat::OUTPUT)
                .map_err(RelayError::Transform)?;
        }

        Ok(Dispatch {
            streams: streams.to_vec(),
            video,
            audio: audio.map(|(index, _)| index),
            transform,
            video_track,
            audio_track,
            video_clock: TimestampTracker::video(),
            audio_clock: TimestampTracker::audio(),
            report: RelayReport::new(),
        })
    }

    fn packet(&mut self, packet: Packet) {
        let Some(stream) = self.streams.iter().find(|s| s.index == packet.stream_index) else {
            debug!(index = packet.stream_index, "dropping packet of unknown stream");
            self.report.dropped_packets += 1;
            return;
        };

        if stream.kind.is_video() {
            self.video(packet);
        } else {
            self.audio(packet);
        }
    }

    fn video(&mut self, packet: Packet) {
        let Some((index, params)) = &self.video else {
            return;
        };
        if *index != packet.stream_index {
            self.report.dropped_packets += 1;
            return;
        }

        let data = reframe(&packet.data, packet.is_key_frame, params);
        if data.is_empty() {
            debug!(time = ?packet.time, "dropping empty video packet");
            self.report.dropped_packets += 1;
            return;
        }

        let duration = self.video_clock.sample_count(packet.time);
        match self.video_track.write_sample(&data, duration) {
            Ok(()) => {
                self.video_clock.commit(packet.time);
                self.report.video_samples += 1;
            }
            Err(e) => {
                debug!("video write failed: {e}");
                self.report.write_failures += 1;
            }
        }
    }

    fn audio(&mut self, packet: Packet) {
        if self.audio != Some(packet.stream_index) {
            self.report.dropped_packets += 1;
            return;
        }

        let frames = match self.transform.transform(&packet) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(time = ?packet.time, "audio transform failed, skipping packet: {e}");
                self.report.transform_failures += 1;
                return;
            }
        };

        for frame in frames {
            let duration = self.audio_clock.sample_count(frame.time);
            match self.audio_track.write_sample(&frame.data, duration) {
                Ok(()) => {
                    self.audio_clock.commit(frame.time);
                    self.report.audio_samples += 1;
                }
                Err(e) => {
                    debug!("audio write failed: {e}");
                    self.report.write_failures += 1;
                }
            }
        }
    }
}
