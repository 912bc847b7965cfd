//! Data models for the relay
//!
//! This module contains the core data structures shared by the upstream
//! demuxer, the relay loop and the outbound peer session.

pub mod propagated;
pub mod state;
pub mod stream;
pub mod tracks;
