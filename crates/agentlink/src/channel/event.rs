//! Event channel - subscribe-only, one long receive per call, no retry.

use std::time::Duration;

use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::socket::{FramedSubscribeSocket, SubscribeSocket};
use crate::bridge::protocol::EventName;
use crate::bridge::transport::ChannelAddress;
use crate::error::{ChannelError, EndpointRole, SocketError, TransportError};

#[derive(Debug, Clone)]
pub struct EventConfig {
    pub recv_deadline: Duration,
    /// Prefix an event must start with to be delivered. Empty takes everything.
    pub filter: Bytes,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            recv_deadline: Duration::from_secs(120),
            filter: Bytes::new(),
        }
    }
}

/// Subscribe endpoint for agent status events.
pub struct EventChannel {
    socket: Box<dyn SubscribeSocket>,
    recv_deadline: Duration,
    cancel: CancellationToken,
}

impl EventChannel {
    /// Open a subscribe socket to `address`. The filter is fixed from here on.
    pub async fn open(
        address: &ChannelAddress,
        config: EventConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ChannelError> {
        tracing::debug!(%address, "Opening event endpoint");
        let socket = FramedSubscribeSocket::connect(address, config.recv_deadline, config.filter)
            .await
            .map_err(|source| ChannelError::Initialization {
                role: EndpointRole::Event,
                address: address.to_string(),
                source,
            })?;
        Ok(Self::new(Box::new(socket), config.recv_deadline, cancel))
    }

    pub fn new(
        socket: Box<dyn SubscribeSocket>,
        recv_deadline: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket,
            recv_deadline,
            cancel,
        }
    }

    /// Wait for the next event.
    ///
    /// A lapsed deadline is `EventTimeout`; the caller decides whether to wait
    /// again.
    pub async fn get_event(&mut self) -> Result<EventName, ChannelError> {
        tracing::debug!(deadline = ?self.recv_deadline, "Waiting for event");
        let cancel = self.cancel.clone();

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Closed.into()),
            received = self.socket.recv() => received,
        };

        match received {
            Ok(payload) => {
                let event = EventName::from_payload(&payload);
                tracing::debug!(%event, "Received event");
                Ok(event)
            }
            Err(SocketError::Timeout(deadline)) => Err(ChannelError::EventTimeout { deadline }),
            Err(SocketError::Transport(e)) => Err(e.into()),
        }
    }

    pub async fn close(mut self) -> Result<(), TransportError> {
        self.socket.close().await
    }
}
