//! agentlink: command and event channels between a controller and an agent.
//!
//! The controller holds a [`ChannelManager`] with two endpoints:
//! - a request-reply command channel with bounded timeout retries
//! - a subscribe-only event channel delivering status event names
//!
//! The agent side of both endpoints lives in [`agent`].

pub mod agent;
pub mod bridge;
pub mod channel;
pub mod error;
pub mod manager;

pub use bridge::protocol::{CommandMessage, CommandResponse, EventName, RequestId};
pub use bridge::transport::{ChannelAddress, TransportKind};
pub use channel::{CommandConfig, Delivery, EventConfig};
pub use error::{ChannelError, EndpointRole, SocketError, TransportError};
pub use manager::{ChannelConfig, ChannelManager, ChannelState};
