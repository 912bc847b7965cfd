//! Session description exchange and the connection state machine
//!
//! [`SignalingSession`] caches the local description on first request and
//! decides what each connection state change means for the relay.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::error::NegotiationError;
use crate::model::state::{ConnectionState, SdpKind};
use crate::session::OutboundSession;

/// What the owner of the relay must do after a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    None,
    /// The peer is connected, media may flow.
    StartRelay,
    /// The peer is gone for good, release everything.
    Close,
}

pub struct SignalingSession {
    session: Arc<dyn OutboundSession>,
    local: Mutex<Option<String>>,
    remote: Mutex<Option<String>>,
    connection: Mutex<ConnectionState>,
}

impl SignalingSession {
    pub fn new(session: Arc<dyn OutboundSession>) -> SignalingSession {
        SignalingSession {
            session,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            connection: Mutex::new(ConnectionState::New),
        }
    }

    /// The local description, synthesized on first call and cached after.
    ///
    /// Once cached, `kind` is ignored.
    pub fn local_description(&self, kind: SdpKind) -> Result<String, NegotiationError> {
        let mut local = lock(&self.local);
        if let Some(sdp) = local.as_ref() {
            return Ok(sdp.clone());
        }

        let sdp = self.session.create_local_description(kind)?;
        info!(?kind, "local description created");
        *local = Some(sdp.clone());
        Ok(sdp)
    }

    /// Applies a remote description, replacing any earlier one.
    pub fn set_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), NegotiationError> {
        self.session.apply_remote_description(sdp, kind)?;
        info!(?kind, "remote description applied");
        *lock(&self.remote) = Some(sdp.to_string());
        Ok(())
    }

    pub fn remote_description(&self) -> Option<String> {
        lock(&self.remote).clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.connection)
    }

    /// Records a state change and returns the action it calls for.
    pub fn handle_connection_state(&self, next: ConnectionState) -> StateAction {
        let previous = std::mem::replace(&mut *lock(&self.connection), next);
        info!(from = ?previous, to = ?next, "connection state changed");

        match next {
            ConnectionState::Connected => StateAction::StartRelay,
            ConnectionState::Failed => StateAction::Close,
            ConnectionState::Disconnected => {
                warn!("peer disconnected, waiting for it to recover");
                StateAction::None
            }
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Closed => {
                StateAction::None
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
