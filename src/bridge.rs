//! One upstream, one peer
//!
//! A [`Bridge`] wires a [`SignalingSession`] to a [`MediaRelay`]: the relay
//! starts on its own thread once the peer connects, and [`Bridge::close`]
//! releases the peer session and the upstream exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{NegotiationError, RelayError};
use crate::model::state::{ConnectionState, SdpKind};
use crate::relay::{MediaRelay, RelayReport};
use crate::session::OutboundSession;
use crate::signaling::{SignalingSession, StateAction};
use crate::transform::AudioTransform;
use crate::upstream::UpstreamDialer;

type RelayHandle = JoinHandle<Result<RelayReport, RelayError>>;

pub struct Bridge {
    signaling: SignalingSession,
    relay: Arc<MediaRelay>,
    session: Arc<dyn OutboundSession>,
    closed: AtomicBool,
    started: AtomicBool,
    relay_thread: Mutex<Option<RelayHandle>>,
}

impl Bridge {
    /// Builds a bridge relaying `upstream` to the tracks of `session`.
    ///
    /// Registers itself as the session's connection state listener.
    pub fn new(
        upstream: impl Into<String>,
        session: Arc<dyn OutboundSession>,
        dialer: Arc<dyn UpstreamDialer>,
        transform: Box<dyn AudioTransform>,
    ) -> Arc<Bridge> {
        let relay = MediaRelay::new(
            upstream,
            dialer,
            session.video_track(),
            session.audio_track(),
            transform,
        );

        let bridge = Arc::new(Bridge {
            signaling: SignalingSession::new(session.clone()),
            relay: Arc::new(relay),
            session: session.clone(),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            relay_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&bridge);
        session.on_connection_state(Box::new(move |state| {
            if let Some(bridge) = weak.upgrade() {
                bridge.handle_connection_state(state);
            }
        }));

        bridge
    }

    pub fn local_description(&self, kind: SdpKind) -> Result<String, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        self.signaling.local_description(kind)
    }

    pub fn set_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        self.signaling.set_remote_description(sdp, kind)
    }

    pub fn remote_description(&self) -> Option<String> {
        self.signaling.remote_description()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.signaling.connection_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn relay_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn handle_connection_state(&self, state: ConnectionState) {
        match self.signaling.handle_connection_state(state) {
            StateAction::StartRelay => self.start_relay(),
            StateAction::Close => self.close(),
            StateAction::None => {}
        }
    }

    fn start_relay(&self) {
        if self.is_closed() {
            debug!("bridge closed, not starting relay");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("relay already started");
            return;
        }

        let relay = self.relay.clone();
        let spawned = thread::Builder::new()
            .name("media-relay".into())
            .spawn(move || {
                let result = relay.run();
                if let Err(e) = &result {
                    error!("relay failed: {e}");
                }
                result
            });

        match spawned {
            Ok(handle) => {
                *self
                    .relay_thread
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => error!("failed to spawn relay thread: {e}"),
        }
    }

    /// Releases the peer session and the upstream. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(upstream = %self.relay.address(), "closing bridge");

        if let Err(e) = self.session.close() {
            warn!("failed to release peer session: {e}");
        }
        if let Err(e) = self.relay.close() {
            warn!("failed to release upstream: {e}");
        }
    }

    /// Waits for the relay thread to finish.
    ///
    /// `None` if the relay never started or was already waited for.
    pub fn wait(&self) -> Option<Result<RelayReport, RelayError>> {
        let handle = self
            .relay_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        Some(handle.join().unwrap_or(Err(RelayError::Panicked)))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}
