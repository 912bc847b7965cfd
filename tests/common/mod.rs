//! Fake collaborators for relay and bridge tests.
#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ingest_rtc::error::{NegotiationError, SessionError, TrackError, TransformError, UpstreamError};
use ingest_rtc::model::stream::{AudioParams, ChannelLayout, SampleFormat, VideoParams};
use ingest_rtc::session::StateHandler;
use ingest_rtc::{
    AudioFormat, AudioFrame, AudioTransform, ConnectionState, MediaKind, MediaTrack,
    OutboundSession, Packet, SdpKind, StreamDescriptor, UpstreamConnection, UpstreamDialer,
};

pub const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1f];
pub const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
pub const START_CODE: &[u8] = &[0, 0, 0, 1];

pub fn video_params() -> VideoParams {
    VideoParams {
        sps: SPS.to_vec(),
        pps: PPS.to_vec(),
    }
}

pub fn audio_params() -> AudioParams {
    AudioParams {
        sample_rate: 44_100,
        channel_layout: ChannelLayout::Stereo,
        sample_format: SampleFormat::F32Planar,
        config: vec![0x12, 0x10],
    }
}

pub fn video_stream(index: usize) -> StreamDescriptor {
    StreamDescriptor {
        index,
        kind: MediaKind::Video(video_params()),
    }
}

pub fn audio_stream(index: usize) -> StreamDescriptor {
    StreamDescriptor {
        index,
        kind: MediaKind::Audio(audio_params()),
    }
}

/// Length-prefixes each unit.
pub fn avcc(units: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        out.extend_from_slice(unit);
    }
    out
}

pub fn video_packet(index: usize, millis: u64, key: bool, data: Vec<u8>) -> Packet {
    Packet {
        stream_index: index,
        time: Duration::from_millis(millis),
        data,
        is_key_frame: key,
    }
}

pub fn audio_packet(index: usize, millis: u64, data: Vec<u8>) -> Packet {
    Packet {
        stream_index: index,
        time: Duration::from_millis(millis),
        data,
        is_key_frame: false,
    }
}

/// Polls `cond` until it holds or two seconds pass.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Upstream fed through a channel. Dropping the sender ends the stream.
pub struct FakeConnection {
    streams: Vec<StreamDescriptor>,
    /// `streams()` fails, as if the stream headers were unreadable
    broken: bool,
    feed: Mutex<Receiver<Packet>>,
    closed: AtomicBool,
    pub closes: AtomicUsize,
}

impl FakeConnection {
    pub fn new(streams: Vec<StreamDescriptor>) -> (Arc<FakeConnection>, Sender<Packet>) {
        let (tx, rx) = mpsc::channel();
        let conn = Arc::new(FakeConnection {
            streams,
            broken: false,
            feed: Mutex::new(rx),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        });
        (conn, tx)
    }

    pub fn broken() -> Arc<FakeConnection> {
        let (_, rx) = mpsc::channel();
        Arc::new(FakeConnection {
            streams: Vec::new(),
            broken: true,
            feed: Mutex::new(rx),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl UpstreamConnection for FakeConnection {
    fn streams(&self) -> Result<Vec<StreamDescriptor>, UpstreamError> {
        if self.broken {
            return Err(UpstreamError::Malformed("no stream headers".into()));
        }
        Ok(self.streams.clone())
    }

    fn read_packet(&self) -> Result<Option<Packet>, UpstreamError> {
        let feed = self.feed.lock().unwrap();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(UpstreamError::Closed);
            }
            match feed.recv_timeout(Duration::from_millis(5)) {
                Ok(packet) => return Ok(Some(packet)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn close(&self) -> Result<(), UpstreamError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one prepared connection, or refuses.
pub struct FakeDialer {
    conn: Mutex<Option<Arc<FakeConnection>>>,
    pub dials: AtomicUsize,
}

impl FakeDialer {
    pub fn new(conn: Arc<FakeConnection>) -> Arc<FakeDialer> {
        Arc::new(FakeDialer {
            conn: Mutex::new(Some(conn)),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn refusing() -> Arc<FakeDialer> {
        Arc::new(FakeDialer {
            conn: Mutex::new(None),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl UpstreamDialer for FakeDialer {
    fn dial(&self, _address: &str) -> Result<Arc<dyn UpstreamConnection>, UpstreamError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        match self.conn.lock().unwrap().take() {
            Some(conn) => {
                let conn: Arc<dyn UpstreamConnection> = conn;
                Ok(conn)
            }
            None => Err(UpstreamError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            ))),
        }
    }
}

/// Records every sample written to it.
#[derive(Default)]
pub struct RecordingTrack {
    samples: Mutex<Vec<(Vec<u8>, u32)>>,
    attempts: AtomicUsize,
    /// Write attempts (0-based) that fail
    fail_on: Mutex<Vec<usize>>,
}

impl RecordingTrack {
    pub fn failing_on(attempts: &[usize]) -> RecordingTrack {
        RecordingTrack {
            fail_on: Mutex::new(attempts.to_vec()),
            ..RecordingTrack::default()
        }
    }

    pub fn samples(&self) -> Vec<(Vec<u8>, u32)> {
        self.samples.lock().unwrap().clone()
    }

    pub fn durations(&self) -> Vec<u32> {
        self.samples().into_iter().map(|(_, d)| d).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }
}

impl MediaTrack for RecordingTrack {
    fn write_sample(&self, data: &[u8], duration: u32) -> Result<(), TrackError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.lock().unwrap().contains(&attempt) {
            return Err(TrackError::NotNegotiated);
        }
        self.samples.lock().unwrap().push((data.to_vec(), duration));
        Ok(())
    }
}

/// Outbound session double with release counters.
pub struct FakeSession {
    pub video: Arc<RecordingTrack>,
    pub audio: Arc<RecordingTrack>,
    handler: Mutex<Option<StateHandler>>,
    pub creates: AtomicUsize,
    pub closes: AtomicUsize,
    pub remote: Mutex<Vec<(String, SdpKind)>>,
    pub fail_close: AtomicBool,
}

impl FakeSession {
    pub fn new() -> Arc<FakeSession> {
        Arc::new(FakeSession {
            video: Arc::new(RecordingTrack::default()),
            audio: Arc::new(RecordingTrack::default()),
            handler: Mutex::new(None),
            creates: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            remote: Mutex::new(Vec::new()),
            fail_close: AtomicBool::new(false),
        })
    }

    /// Delivers a connection state change like the real session would.
    pub fn fire(&self, state: ConnectionState) {
        let handler = self.handler.lock().unwrap();
        if let Some(handler) = handler.as_ref() {
            handler(state);
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl OutboundSession for FakeSession {
    fn create_local_description(&self, kind: SdpKind) -> Result<String, NegotiationError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0\r\no=fake {n} 0 IN IP4 0.0.0.0\r\ns={kind:?}\r\n"))
    }

    fn apply_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), NegotiationError> {
        if !sdp.starts_with("v=0") {
            return Err(NegotiationError::Malformed("missing version line".into()));
        }
        self.remote.lock().unwrap().push((sdp.to_string(), kind));
        Ok(())
    }

    fn on_connection_state(&self, handler: StateHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn video_track(&self) -> Arc<dyn MediaTrack> {
        self.video.clone()
    }

    fn audio_track(&self) -> Arc<dyn MediaTrack> {
        self.audio.clone()
    }

    fn close(&self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(SessionError::Io(io::Error::new(io::ErrorKind::Other, "boom")));
        }
        Ok(())
    }
}

/// Splits each input into `frames` outputs `step` apart. Payload `[0xff]` fails.
pub struct FakeTransform {
    pub setups: Arc<Mutex<Vec<(AudioParams, AudioFormat)>>>,
    frames: usize,
    step: Duration,
    refuse_setup: bool,
}

impl FakeTransform {
    pub fn new(frames: usize, step: Duration) -> FakeTransform {
        FakeTransform {
            setups: Arc::new(Mutex::new(Vec::new())),
            frames,
            step,
            refuse_setup: false,
        }
    }

    /// A transform whose setup always fails.
    pub fn refusing() -> FakeTransform {
        FakeTransform {
            refuse_setup: true,
            ..FakeTransform::new(1, Duration::ZERO)
        }
    }
}

impl AudioTransform for FakeTransform {
    fn setup(&mut self, input: &AudioParams, output: &AudioFormat) -> Result<(), TransformError> {
        self.setups.lock().unwrap().push((input.clone(), *output));
        if self.refuse_setup {
            return Err(TransformError::Setup("unsupported input".into()));
        }
        Ok(())
    }

    fn transform(&mut self, packet: &Packet) -> Result<Vec<AudioFrame>, TransformError> {
        if packet.data == [0xff] {
            return Err(TransformError::Packet("undecodable".into()));
        }

        Ok((0..self.frames)
            .map(|i| AudioFrame {
                time: packet.time + self.step * i as u32,
                data: [packet.data.as_slice(), &[i as u8]].concat(),
            })
            .collect())
    }
}
