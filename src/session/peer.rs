//! str0m backed outbound session
//!
//! str0m is sans-IO: the [`Rtc`] state machine only moves when it is fed
//! input and polled for output. One driver thread owns the UDP socket reads
//! and timeouts. Every other caller (negotiation, track writes, close) takes
//! the same lock, does its work, and drains the state machine until it
//! reports its next timeout, transmitting on the socket as it goes.
//!
//! Connection state listeners are always invoked after the lock is released,
//! so a listener may call back into the session.
//!
//! Closing joins the driver, so once `close` returns the UDP port is free
//! to be bound again.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind, MediaTime, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Event, IceConnectionState, Input, Output, Rtc};
use tracing::{debug, error, info, warn};

use crate::config::{BundlePolicy, SdpSemantics, SessionConfig};
use crate::error::{NegotiationError, SessionError, TrackError};
use crate::model::propagated::Propagated;
use crate::model::state::{ConnectionState, SdpKind};
use crate::model::tracks::{TrackOut, TrackOutState};
use crate::session::{MediaTrack, OutboundSession, StateHandler};
use crate::util::{get_candidates, resolve_bind};

const VIDEO: usize = 0;
const AUDIO: usize = 1;

/// Socket read timeout bounds for the driver loop.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);
const MAX_READ_TIMEOUT: Duration = Duration::from_millis(100);

type Listener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Outbound session with one H.264 and one Opus send-only track.
pub struct Str0mSession {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    peer: Mutex<Peer>,
    listener: Mutex<Option<Listener>>,
    closed: AtomicBool,
}

struct Peer {
    rtc: Rtc,
    /// Send half of the media socket, released on close
    socket: Option<UdpSocket>,
    tracks: [TrackOut; 2],
    stream_id: String,
    /// Our offer, waiting for the remote answer
    pending: Option<SdpPendingOffer>,
    /// Our answer to the last remote offer
    answer: Option<SdpAnswer>,
    state: ConnectionState,
    /// DTLS completed at least once; ICE recovering means connected again
    dtls_done: bool,
    connection_timeout: Duration,
    deadline: Option<Instant>,
    /// State changes not yet delivered to the listener
    changes: Vec<ConnectionState>,
}

impl Str0mSession {
    pub fn new(config: &SessionConfig) -> Result<Str0mSession, SessionError> {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

        if !config.ice_servers.is_empty() {
            warn!(servers = ?config.ice_servers, "ICE servers are ignored, only host candidates are offered");
        }
        if config.bundle_policy != BundlePolicy::MaxBundle {
            warn!(policy = ?config.bundle_policy, "str0m always bundles media, using max-bundle");
        }
        if config.sdp_semantics != SdpSemantics::UnifiedPlan {
            warn!("str0m only speaks unified plan SDP");
        }

        let socket = UdpSocket::bind(resolve_bind(config.bind)?)?;
        let local_addr = socket.local_addr()?;
        let candidates = get_candidates(&socket)?;
        let sender = socket.try_clone()?;

        let mut rtc = Rtc::builder()
            .clear_codecs()
            .enable_h264(true)
            .enable_opus(true)
            .build();

        for candidate in candidates {
            info!("Local candidate: {:?}", candidate);
            let _ = rtc.add_local_candidate(candidate);
        }

        let id = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        let peer = Peer {
            rtc,
            socket: Some(sender),
            tracks: [TrackOut::video(), TrackOut::audio()],
            stream_id: format!("ingest-{id}"),
            pending: None,
            answer: None,
            state: ConnectionState::New,
            dtls_done: false,
            connection_timeout: config.connection_timeout(),
            deadline: None,
            changes: Vec::new(),
        };

        let shared = Arc::new(Shared {
            peer: Mutex::new(peer),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let driver = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("rtc-driver-{id}"))
            .spawn(move || run(driver, socket))?;

        info!("Bound UDP port: {}", local_addr);

        Ok(Str0mSession {
            shared,
            local_addr,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn track(&self, index: usize) -> Arc<dyn MediaTrack> {
        Arc::new(Str0mTrack {
            shared: self.shared.clone(),
            index,
        })
    }

    /// Waits for the driver to drop its socket.
    ///
    /// A listener closing the session runs on the driver thread itself; that
    /// driver sees the closed flag and exits once the listener returns.
    fn join_driver(&self) {
        let Some(handle) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            return;
        }

        if handle.join().is_err() {
            error!(addr = %self.local_addr, "peer driver panicked");
        }
    }
}

impl OutboundSession for Str0mSession {
    fn create_local_description(&self, kind: SdpKind) -> Result<String, NegotiationError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }

        let (result, _) = self.shared.with_peer(|peer| match kind {
            SdpKind::Offer => peer.create_offer(),
            SdpKind::Answer => peer.answer(),
        });
        result
    }

    fn apply_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), NegotiationError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }

        let (result, _) = self.shared.with_peer(|peer| match kind {
            SdpKind::Offer => peer.accept_offer(sdp),
            SdpKind::Answer => peer.accept_answer(sdp),
        });
        result
    }

    fn on_connection_state(&self, handler: StateHandler) {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(handler));
    }

    fn video_track(&self) -> Arc<dyn MediaTrack> {
        self.track(VIDEO)
    }

    fn audio_track(&self) -> Arc<dyn MediaTrack> {
        self.track(AUDIO)
    }

    fn close(&self) -> Result<(), SessionError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(addr = %self.local_addr, "closing peer session");
        let changes = {
            let mut peer = self.shared.lock();
            peer.rtc.disconnect();
            peer.deadline = None;
            peer.socket = None;
            peer.set_state(ConnectionState::Closed);
            std::mem::take(&mut peer.changes)
        };
        self.shared.notify(changes);
        self.join_driver();

        Ok(())
    }
}

impl Drop for Str0mSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct Str0mTrack {
    shared: Arc<Shared>,
    index: usize,
}

impl MediaTrack for Str0mTrack {
    fn write_sample(&self, data: &[u8], duration: u32) -> Result<(), TrackError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TrackError::Closed);
        }

        let (result, _) = self
            .shared
            .with_peer(|peer| peer.write(self.index, data, duration));
        result
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Peer> {
        self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the peer and drains its output. Returns the next timeout.
    fn with_peer<T>(&self, f: impl FnOnce(&mut Peer) -> T) -> (T, Instant) {
        let (result, timeout, changes) = {
            let mut peer = self.lock();
            let result = f(&mut peer);
            let timeout = peer.poll_until_timeout();
            (result, timeout, std::mem::take(&mut peer.changes))
        };
        self.notify(changes);
        (result, timeout)
    }

    fn notify(&self, changes: Vec<ConnectionState>) {
        if changes.is_empty() {
            return;
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(listener) = listener {
            for state in changes {
                listener(state);
            }
        }
    }
}

impl Peer {
    fn create_offer(&mut self) -> Result<String, NegotiationError> {
        let mut change = self.rtc.sdp_api();

        for track in &mut self.tracks {
            if let TrackOutState::ToOpen = track.state {
                let mid = change.add_media(
                    track.kind,
                    Direction::SendOnly,
                    Some(self.stream_id.clone()),
                    None,
                    None,
                );
                track.state = TrackOutState::Negotiating(mid);
            }
        }

        let Some((offer, pending)) = change.apply() else {
            return Err(NegotiationError::Rejected("nothing to offer".into()));
        };

        self.pending = Some(pending);
        Ok(offer.to_sdp_string())
    }

    fn answer(&self) -> Result<String, NegotiationError> {
        self.answer
            .as_ref()
            .map(|answer| answer.to_sdp_string())
            .ok_or(NegotiationError::NoRemoteOffer)
    }

    fn accept_offer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        let offer =
            SdpOffer::from_sdp_string(sdp).map_err(|e| NegotiationError::Malformed(e.to_string()))?;

        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| NegotiationError::Rejected(e.to_string()))?;

        // A remote offer supersedes any offer of ours still in flight.
        self.pending = None;
        for track in &mut self.tracks {
            if let TrackOutState::Negotiating(_) = track.state {
                track.state = TrackOutState::ToOpen;
            }
        }

        self.answer = Some(answer);
        self.start_deadline();
        Ok(())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        let answer =
            SdpAnswer::from_sdp_string(sdp).map_err(|e| NegotiationError::Malformed(e.to_string()))?;

        let pending = self.pending.take().ok_or(NegotiationError::NoPendingOffer)?;

        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| NegotiationError::Rejected(e.to_string()))?;

        for track in &mut self.tracks {
            if let TrackOutState::Negotiating(m) = track.state {
                track.state = TrackOutState::Open(m);
            }
        }

        self.start_deadline();
        Ok(())
    }

    fn start_deadline(&mut self) {
        if self.state != ConnectionState::Connected && self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.connection_timeout);
        }
    }

    fn write(&mut self, index: usize, data: &[u8], duration: u32) -> Result<(), TrackError> {
        let track = &mut self.tracks[index];
        let mid = track.open_mid().ok_or(TrackError::NotNegotiated)?;
        let Some(writer) = self.rtc.writer(mid) else {
            return Err(TrackError::NotNegotiated);
        };

        // Match outgoing pt to the track codec.
        let pt = writer
            .payload_params()
            .find(|p| p.spec().codec == track.codec)
            .map(|p| p.pt())
            .ok_or(TrackError::NoPayloadType(track.codec_name()))?;

        let rtp_time = track.rtp_time + duration as u64;
        writer
            .write(pt, Instant::now(), MediaTime::new(rtp_time, track.clock), data.to_vec())
            .map_err(|e| TrackError::Write(e.to_string()))?;

        track.rtp_time = rtp_time;
        Ok(())
    }

    fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Peer disconnected: {:?}", e);
            self.rtc.disconnect();
            self.set_state(ConnectionState::Failed);
        }
    }

    fn check_deadline(&mut self, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };

        if now >= deadline && self.state != ConnectionState::Connected {
            warn!(timeout = ?self.connection_timeout, "peer did not connect in time");
            self.deadline = None;
            self.rtc.disconnect();
            self.set_state(ConnectionState::Failed);
        }
    }

    /// Poll all the output from the peer until it returns a timeout.
    /// Transmit data on the socket and collect state changes.
    fn poll_until_timeout(&mut self) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                return Instant::now() + MAX_READ_TIMEOUT;
            }

            match self.poll_output() {
                Propagated::Timeout(t) => return t,
                Propagated::StateChange(state) => self.changes.push(state),
                Propagated::Noop => {}
            }
        }
    }

    fn poll_output(&mut self) -> Propagated {
        match self.rtc.poll_output() {
            Ok(Output::Transmit(transmit)) => {
                let Some(socket) = &self.socket else {
                    return Propagated::Noop;
                };
                if let Err(e) = socket.send_to(&transmit.contents, transmit.destination) {
                    debug!("UDP send to {} failed: {:?}", transmit.destination, e);
                }
                Propagated::Noop
            }
            Ok(Output::Timeout(t)) => Propagated::Timeout(t),
            Ok(Output::Event(e)) => self.handle_event(e),
            Err(e) => {
                warn!("Peer poll_output failed: {:?}", e);
                self.rtc.disconnect();
                self.transition(ConnectionState::Failed)
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Propagated {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE State = {:?}", state);
                match ice_state(state, self.dtls_done) {
                    Some(next) => self.transition(next),
                    None => Propagated::Noop,
                }
            }
            Event::Connected => {
                self.dtls_done = true;
                self.transition(ConnectionState::Connected)
            }
            Event::MediaAdded(added) => {
                self.handle_media_added(added.mid, added.kind);
                Propagated::Noop
            }
            other => {
                debug!("Event: {:?}", other);
                Propagated::Noop
            }
        }
    }

    /// Binds a media line the remote offered to our track of the same kind.
    fn handle_media_added(&mut self, mid: Mid, kind: MediaKind) {
        let Some(track) = self
            .tracks
            .iter_mut()
            .find(|t| t.kind == kind && t.state == TrackOutState::ToOpen)
        else {
            debug!(?mid, ?kind, "no free track for added media");
            return;
        };

        debug!(?mid, ?kind, "track bound to media");
        track.state = TrackOutState::Open(mid);
    }

    fn set_state(&mut self, next: ConnectionState) {
        let propagated = self.transition(next);
        self.changes.extend(propagated.state());
    }

    fn transition(&mut self, next: ConnectionState) -> Propagated {
        if self.state == next || self.state == ConnectionState::Closed {
            return Propagated::Noop;
        }

        info!(from = ?self.state, to = ?next, "peer connection state");
        self.state = next;
        if next == ConnectionState::Connected {
            self.deadline = None;
        }

        Propagated::StateChange(next)
    }
}

/// Maps ICE agent states onto the connection state machine.
///
/// ICE reaching connected is not enough on first contact, DTLS must finish
/// too; str0m reports that separately.
fn ice_state(state: IceConnectionState, dtls_done: bool) -> Option<ConnectionState> {
    match state {
        IceConnectionState::New => None,
        IceConnectionState::Checking => Some(ConnectionState::Connecting),
        IceConnectionState::Connected | IceConnectionState::Completed => {
            dtls_done.then_some(ConnectionState::Connected)
        }
        IceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
    }
}

/// Driver loop. Owns the receive half of the socket and drops it on exit.
fn run(shared: Arc<Shared>, socket: UdpSocket) {
    let mut buf = vec![0; 2000];

    let destination = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("UdpSocket has no local address: {e:?}");
            return;
        }
    };

    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }

        let (alive, timeout) = shared.with_peer(|peer| peer.rtc.is_alive());
        if !alive {
            info!("Peer is no longer alive");
            break;
        }

        // The read timeout is not allowed to be 0.
        let duration = timeout
            .saturating_duration_since(Instant::now())
            .clamp(MIN_READ_TIMEOUT, MAX_READ_TIMEOUT);

        if let Err(e) = socket.set_read_timeout(Some(duration)) {
            error!("setting socket read timeout failed: {e:?}");
            break;
        }

        buf.resize(2000, 0);

        match socket.recv_from(&mut buf) {
            Ok((n, source)) => {
                buf.truncate(n);

                // Parse data to a DatagramRecv, which help preparse network data to
                // figure out the multiplexing of all protocols on one UDP port.
                if let Ok(contents) = buf.as_slice().try_into() {
                    let input = Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination,
                            contents,
                        },
                    );
                    shared.with_peer(|peer| peer.handle_input(input));
                }
            }

            Err(e) => match e.kind() {
                // Expected error for set_read_timeout(). One for windows, one for the rest.
                ErrorKind::WouldBlock | ErrorKind::TimedOut => {}
                _ => {
                    error!("UdpSocket read failed: {e:?}");
                    break;
                }
            },
        }

        // Drive time forward.
        let now = Instant::now();
        shared.with_peer(|peer| {
            peer.handle_input(Input::Timeout(now));
            peer.check_deadline(now);
        });
    }

    debug!("peer driver stopped");
}
