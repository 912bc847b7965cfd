//! Upstream ingest boundary
//!
//! The relay dials an address through an [`UpstreamDialer`] and reads
//! demuxed packets from the resulting [`UpstreamConnection`]. Reads block;
//! `close` may be called from any thread while a read is in flight.

use std::sync::Arc;

use crate::error::UpstreamError;
use crate::model::stream::{Packet, StreamDescriptor};

pub mod rtmp;
pub mod tags;

pub use rtmp::RtmpDialer;

pub trait UpstreamConnection: Send + Sync {
    /// Streams of the connection, fixed for its lifetime.
    fn streams(&self) -> Result<Vec<StreamDescriptor>, UpstreamError>;

    /// Blocks for the next packet. `Ok(None)` is the end of the stream.
    fn read_packet(&self) -> Result<Option<Packet>, UpstreamError>;

    /// Releases the connection. Idempotent; an in-flight read fails or ends.
    fn close(&self) -> Result<(), UpstreamError>;
}

pub trait UpstreamDialer: Send + Sync {
    fn dial(&self, address: &str) -> Result<Arc<dyn UpstreamConnection>, UpstreamError>;
}
