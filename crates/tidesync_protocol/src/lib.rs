//! # TideSync Protocol
//!
//! Messages exchanged between two TideSync peers and their wire encoding.
//!
//! A session opens with a signed [`Welcome`] from each side. Each peer then
//! sends a [`SyncRequest`] for the changes after its cursor and receives
//! [`ChangeBatch`]es in reply, confirming each one with an
//! [`Acknowledge`]. [`Close`] ends the session.
//!
//! This crate performs no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;

pub use codec::{
    decode_message, encode_message, frame, frame_len, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Acknowledge, ChangeBatch, Close, SyncMessage, SyncRequest, Welcome, PROTOCOL_VERSION,
};
