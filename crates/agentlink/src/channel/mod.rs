//! Controller-side endpoints.
//!
//! - **command**: request-reply, bounded retries on timeout
//! - **event**: subscribe-only, single long receive
//! - **socket**: the socket roles both channels are built on

pub mod command;
pub mod event;
pub mod socket;

pub use command::{CommandChannel, CommandConfig, Delivery};
pub use event::{EventChannel, EventConfig};
pub use socket::{FramedRequestSocket, FramedSubscribeSocket, RequestSocket, SubscribeSocket};
