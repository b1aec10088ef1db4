//! Wire layer for controller-agent communication.
//!
//! # Architecture
//!
//! - **protocol**: Message types (CommandMessage, CommandResponse, EventName, RequestId)
//! - **codec**: JSON command encoding plus length-delimited frame codecs
//! - **transport**: tcp/ipc addresses, streams and listeners

pub mod codec;
mod finite;
pub mod protocol;
pub mod transport;
