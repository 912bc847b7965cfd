//! RTMP playback upstream
//!
//! Dials `rtmp://host[:port]/app/stream-key`, performs the handshake and
//! the connect/play exchange through `rml_rtmp`'s client session, and
//! demuxes the H.264 and AAC messages it delivers into [`Packet`]s.
//!
//! Every read is bounded by the connect timeout until the stream plays and
//! its sequence headers have been seen. After that reads block; `close`
//! shuts the socket down so a blocked read returns.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult, StreamMetadata,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::UpstreamError;
use crate::model::stream::{Packet, StreamDescriptor};
use crate::upstream::tags::TagDemuxer;
use crate::upstream::{UpstreamConnection, UpstreamDialer};

const DEFAULT_PORT: u16 = 1935;

/// Media messages read while looking for sequence headers before giving up
/// on the missing kind.
const HEADER_MESSAGE_LIMIT: usize = 64;

const READ_BUFFER: usize = 4096;

/// Parsed `rtmp://` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    /// Application path, everything but the last path segment
    pub app: String,
    /// Last path segment plus any query
    pub stream_key: String,
}

impl RtmpUrl {
    pub fn parse(address: &str) -> Result<RtmpUrl, UpstreamError> {
        let invalid = |reason: &str| UpstreamError::InvalidAddress(format!("{address}: {reason}"));

        let url = Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "rtmp" => {}
            "rtmps" => return Err(UpstreamError::Unsupported(format!("{address}: TLS is not supported"))),
            other => return Err(UpstreamError::Unsupported(format!("{address}: scheme {other}"))),
        }

        let host = url.host_str().ok_or_else(|| invalid("missing host"))?.to_string();
        let path = url.path().trim_matches('/');
        let (app, key) = path.rsplit_once('/').ok_or_else(|| invalid("expected /app/stream-key"))?;
        if app.is_empty() || key.is_empty() {
            return Err(invalid("expected /app/stream-key"));
        }

        let stream_key = match url.query() {
            Some(query) => format!("{key}?{query}"),
            None => key.to_string(),
        };

        Ok(RtmpUrl {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            app: app.to_string(),
            stream_key,
        })
    }

    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

/// Dials RTMP upstreams and plays one stream key.
#[derive(Debug, Clone)]
pub struct RtmpDialer {
    connect_timeout: Duration,
}

impl Default for RtmpDialer {
    fn default() -> Self {
        RtmpDialer::new(Duration::from_secs(10))
    }
}

impl RtmpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        RtmpDialer { connect_timeout }
    }
}

impl UpstreamDialer for RtmpDialer {
    fn dial(&self, address: &str) -> Result<Arc<dyn UpstreamConnection>, UpstreamError> {
        let url = RtmpUrl::parse(address)?;

        let addr = (url.host.as_str(), url.port)
            .to_socket_addrs()
            .map_err(|e| UpstreamError::InvalidAddress(format!("{address}: {e}")))?
            .next()
            .ok_or_else(|| UpstreamError::InvalidAddress(address.to_string()))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.connect_timeout))?;
        let socket = stream.try_clone()?;

        let client = RtmpClient::play(stream, &url)?;
        client.stream.set_read_timeout(None)?;

        let streams = client.demuxer.streams().to_vec();
        info!(
            address,
            streams = ?streams.iter().map(|s| s.kind.name()).collect::<Vec<_>>(),
            "upstream connected"
        );

        Ok(Arc::new(RtmpConnection {
            client: Mutex::new(client),
            streams,
            socket,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A playing RTMP stream.
pub struct RtmpConnection {
    client: Mutex<RtmpClient>,
    streams: Vec<StreamDescriptor>,
    /// Clone of the client socket, so `close` can interrupt a blocked read
    socket: TcpStream,
    closed: AtomicBool,
}

impl UpstreamConnection for RtmpConnection {
    fn streams(&self) -> Result<Vec<StreamDescriptor>, UpstreamError> {
        Ok(self.streams.clone())
    }

    fn read_packet(&self) -> Result<Option<Packet>, UpstreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed);
        }

        let result = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_packet();

        // A shut down socket reads as EOF or an error, either means closed.
        if self.closed.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed);
        }
        result
    }

    fn close(&self) -> Result<(), UpstreamError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing RTMP upstream");
        match self.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Client session state behind the connection lock.
struct RtmpClient {
    stream: TcpStream,
    session: ClientSession,
    demuxer: TagDemuxer,
    pending: VecDeque<Packet>,
    buf: Vec<u8>,
    connected: bool,
    playing: bool,
    ended: bool,
    /// Kinds the stream metadata announced, as (video, audio)
    announced: Option<(bool, bool)>,
    media_messages: usize,
}

impl RtmpClient {
    /// Handshakes, connects to the app, plays the stream key and waits for
    /// the sequence headers.
    fn play(mut stream: TcpStream, url: &RtmpUrl) -> Result<RtmpClient, UpstreamError> {
        let remaining = handshake(&mut stream)?;

        let mut config = ClientSessionConfig::new();
        config.tc_url = Some(url.tc_url());
        let (session, initial) = ClientSession::new(config).map_err(protocol)?;

        let mut client = RtmpClient {
            stream,
            session,
            demuxer: TagDemuxer::default(),
            pending: VecDeque::new(),
            buf: vec![0; READ_BUFFER],
            connected: false,
            playing: false,
            ended: false,
            announced: None,
            media_messages: 0,
        };
        client.handle_results(initial)?;
        if !remaining.is_empty() {
            let results = client.session.handle_input(&remaining).map_err(protocol)?;
            client.handle_results(results)?;
        }

        debug!(app = %url.app, "requesting RTMP connection");
        let request = client
            .session
            .request_connection(url.app.clone())
            .map_err(protocol)?;
        client.handle_results(vec![request])?;
        client.pump_until("connect", |c| c.connected)?;

        debug!(key = %url.stream_key, "requesting RTMP playback");
        let request = client
            .session
            .request_playback(url.stream_key.clone())
            .map_err(protocol)?;
        client.handle_results(vec![request])?;
        client.pump_until("play", |c| c.playing)?;

        client.await_headers()?;
        Ok(client)
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, UpstreamError> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(Some(packet));
            }
            if self.ended {
                return Ok(None);
            }
            if !self.pump()? {
                info!("RTMP server closed the connection");
                self.ended = true;
            }
        }
    }

    fn await_headers(&mut self) -> Result<(), UpstreamError> {
        loop {
            let (want_video, want_audio) = self.announced.unwrap_or((true, true));
            let video_done = !want_video || self.demuxer.has_video();
            let audio_done = !want_audio || self.demuxer.has_audio();
            if (video_done && audio_done) || self.ended {
                break;
            }
            if self.media_messages >= HEADER_MESSAGE_LIMIT {
                debug!(messages = self.media_messages, "stopped waiting for sequence headers");
                break;
            }
            if !self.pump()? {
                self.ended = true;
            }
        }

        if self.demuxer.streams().is_empty() {
            return Err(UpstreamError::Malformed("no H.264 or AAC stream found".into()));
        }
        if !self.demuxer.has_video() {
            warn!("no AVC sequence header found, relaying without video");
        }
        if !self.demuxer.has_audio() {
            warn!("no AAC sequence header found, relaying without audio");
        }

        Ok(())
    }

    fn pump_until(
        &mut self,
        step: &str,
        done: impl Fn(&RtmpClient) -> bool,
    ) -> Result<(), UpstreamError> {
        while !done(self) {
            if !self.pump()? {
                return Err(UpstreamError::Rejected(format!(
                    "server closed the connection during {step}"
                )));
            }
        }
        Ok(())
    }

    /// Reads once from the socket. `false` when the server closed it.
    fn pump(&mut self) -> Result<bool, UpstreamError> {
        let n = loop {
            match self.stream.read(&mut self.buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Ok(false);
        }

        let results = self.session.handle_input(&self.buf[..n]).map_err(protocol)?;
        self.handle_results(results)?;
        Ok(true)
    }

    fn handle_results(&mut self, results: Vec<ClientSessionResult>) -> Result<(), UpstreamError> {
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    self.stream.write_all(&packet.bytes)?;
                }
                ClientSessionResult::RaisedEvent(event) => self.handle_event(event)?,
                ClientSessionResult::UnhandleableMessageReceived(_) => {
                    debug!("ignoring unhandled RTMP message");
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ClientSessionEvent) -> Result<(), UpstreamError> {
        match event {
            ClientSessionEvent::ConnectionRequestAccepted => {
                debug!("RTMP connection accepted");
                self.connected = true;
            }
            ClientSessionEvent::ConnectionRequestRejected { description } => {
                return Err(UpstreamError::Rejected(description));
            }
            ClientSessionEvent::PlaybackRequestAccepted => {
                debug!("RTMP playback accepted");
                self.playing = true;
            }
            ClientSessionEvent::StreamMetadataReceived { metadata } => {
                self.announced = announced_kinds(&metadata);
            }
            ClientSessionEvent::VideoDataReceived { timestamp, data } => {
                self.media_messages += 1;
                if let Some(packet) = self.demuxer.video(timestamp.value, &data)? {
                    self.pending.push_back(packet);
                }
            }
            ClientSessionEvent::AudioDataReceived { timestamp, data } => {
                self.media_messages += 1;
                if let Some(packet) = self.demuxer.audio(timestamp.value, &data)? {
                    self.pending.push_back(packet);
                }
            }
            ClientSessionEvent::UnhandleableOnStatusCode { code } => {
                if ends_stream(&code) {
                    info!(%code, "RTMP stream ended");
                    self.ended = true;
                } else if !self.playing && is_failure(&code) {
                    return Err(UpstreamError::Rejected(code));
                } else {
                    debug!(%code, "RTMP status");
                }
            }
            other => debug!(?other, "RTMP event"),
        }
        Ok(())
    }
}

/// Client side of the RTMP handshake. Returns bytes read past its end.
fn handshake(stream: &mut TcpStream) -> Result<Vec<u8>, UpstreamError> {
    let mut handshake = Handshake::new(PeerType::Client);
    let p0_and_p1 = handshake.generate_outbound_p0_and_p1().map_err(protocol)?;
    stream.write_all(&p0_and_p1)?;

    let mut buf = [0u8; READ_BUFFER];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(UpstreamError::Rejected(
                "server closed the connection during handshake".into(),
            ));
        }

        match handshake.process_bytes(&buf[..n]).map_err(protocol)? {
            HandshakeProcessResult::InProgress { response_bytes } => {
                stream.write_all(&response_bytes)?;
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                stream.write_all(&response_bytes)?;
                debug!("RTMP handshake completed");
                return Ok(remaining_bytes);
            }
        }
    }
}

/// Kinds announced by `onMetaData`, `None` when it names neither.
fn announced_kinds(metadata: &StreamMetadata) -> Option<(bool, bool)> {
    let video = metadata.video_codec_id.is_some() || metadata.video_width.is_some();
    let audio = metadata.audio_codec_id.is_some() || metadata.audio_sample_rate.is_some();
    (video || audio).then_some((video, audio))
}

fn ends_stream(code: &str) -> bool {
    matches!(
        code,
        "NetStream.Play.Stop" | "NetStream.Play.Complete" | "NetStream.Play.UnpublishNotify"
    )
}

fn is_failure(code: &str) -> bool {
    ["Failed", "NotFound", "Rejected", "BadName"]
        .iter()
        .any(|marker| code.contains(marker))
}

fn protocol(e: impl std::fmt::Display) -> UpstreamError {
    UpstreamError::Protocol(e.to_string())
}
