//! Command channel - request-reply with bounded timeout retries.
//!
//! Flow per call:
//! 1. Encode once (encoding failures are final)
//! 2. Send under the send deadline, retrying send timeouts
//! 3. Receive under the receive deadline; on timeout either re-send
//!    (`Delivery::AtLeastOnce`) or keep waiting (`Delivery::AtMostOnce`)
//! 4. Return the raw reply
//!
//! Retrying assumes the command is safe to deliver more than once. Commands
//! that are not idempotent should go through a channel configured with
//! `Delivery::AtMostOnce`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::socket::{FramedRequestSocket, RequestSocket};
use crate::bridge::codec;
use crate::bridge::protocol::{CommandMessage, CommandResponse};
use crate::bridge::transport::ChannelAddress;
use crate::error::{ChannelError, EndpointRole, SocketError, TransportError};

/// What a receive timeout means for the request in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Delivery {
    /// Treat a lost reply like a lost request and send again.
    #[default]
    AtLeastOnce,
    /// Never re-send after a successful send; only wait longer for the reply.
    AtMostOnce,
}

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub send_deadline: Duration,
    pub recv_deadline: Duration,
    /// Timeouts tolerated per phase; the next one fails the call.
    pub max_timeouts: u32,
    pub delivery: Delivery,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            send_deadline: Duration::from_secs(3),
            recv_deadline: Duration::from_secs(3),
            max_timeouts: 3,
            delivery: Delivery::AtLeastOnce,
        }
    }
}

/// Request-reply endpoint for commands.
///
/// Holds one request socket; callers must not interleave calls, which the
/// `&mut self` receiver enforces.
pub struct CommandChannel {
    socket: Box<dyn RequestSocket>,
    config: CommandConfig,
    cancel: CancellationToken,
}

impl CommandChannel {
    /// Open a request socket to `address`.
    ///
    /// Nothing stays open when this fails.
    pub async fn open(
        address: &ChannelAddress,
        config: CommandConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ChannelError> {
        tracing::debug!(%address, "Opening command endpoint");
        let socket =
            FramedRequestSocket::connect(address, config.send_deadline, config.recv_deadline)
                .await
                .map_err(|source| ChannelError::Initialization {
                    role: EndpointRole::Command,
                    address: address.to_string(),
                    source,
                })?;
        Ok(Self::new(Box::new(socket), config, cancel))
    }

    pub fn new(
        socket: Box<dyn RequestSocket>,
        config: CommandConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket,
            config,
            cancel,
        }
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// Deliver one command and return its reply.
    ///
    /// Returns `Transport(Closed)` as soon as the channel's cancellation token
    /// fires.
    pub async fn send_command(
        &mut self,
        message: &CommandMessage,
    ) -> Result<CommandResponse, ChannelError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Closed.into()),
            result = self.exchange(message) => result,
        }
    }

    async fn exchange(
        &mut self,
        message: &CommandMessage,
    ) -> Result<CommandResponse, ChannelError> {
        let payload = codec::encode(message).inspect_err(|e| {
            tracing::info!(command = message.name(), error = %e, "Malformed command");
        })?;

        tracing::debug!(command = %message, "Sending command");

        let mut send_timeouts = 0u32;
        let mut recv_timeouts = 0u32;
        let mut resend = true;

        loop {
            if resend {
                match self.socket.send(payload.clone()).await {
                    Ok(()) => {}
                    Err(SocketError::Timeout(deadline)) => {
                        send_timeouts += 1;
                        tracing::info!(
                            command = message.name(),
                            attempt = send_timeouts,
                            ?deadline,
                            "Command send timeout"
                        );
                        if send_timeouts > self.config.max_timeouts {
                            return Err(ChannelError::SendTimeoutExceeded {
                                attempts: send_timeouts,
                            });
                        }
                        continue;
                    }
                    Err(SocketError::Transport(e)) => return Err(e.into()),
                }
            }

            match self.socket.recv().await {
                Ok(reply) => {
                    tracing::debug!(
                        command = message.name(),
                        reply_bytes = reply.len(),
                        send_timeouts,
                        recv_timeouts,
                        "Command acknowledged"
                    );
                    return Ok(CommandResponse::new(reply));
                }
                Err(SocketError::Timeout(deadline)) => {
                    recv_timeouts += 1;
                    tracing::info!(
                        command = message.name(),
                        attempt = recv_timeouts,
                        ?deadline,
                        "Command receive timeout"
                    );
                    if recv_timeouts > self.config.max_timeouts {
                        return Err(ChannelError::RecvTimeoutExceeded {
                            attempts: recv_timeouts,
                        });
                    }
                    resend = self.config.delivery == Delivery::AtLeastOnce;
                }
                Err(SocketError::Transport(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), TransportError> {
        self.socket.close().await
    }
}
