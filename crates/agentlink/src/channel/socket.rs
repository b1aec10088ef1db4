//! Socket roles used by the channels.
//!
//! The traits are the seam between the retry logic and the wire: the framed
//! implementations below talk to a real agent, tests plug in scripted fakes.
//! Deadlines belong to the socket, the same way they are socket options on
//! the agent's side of the link.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::bridge::codec::{EnvelopeCodec, frame_codec};
use crate::bridge::protocol::RequestId;
use crate::bridge::transport::{ChannelAddress, ChannelStream, connect};
use crate::error::{SocketError, TransportError};

/// Request role: one outstanding request, one reply.
#[async_trait]
pub trait RequestSocket: Send {
    /// Send a new request. Any earlier outstanding request is abandoned.
    ///
    /// A `Timeout` means the request did not reach the agent.
    async fn send(&mut self, payload: Bytes) -> Result<(), SocketError>;

    /// Wait for the reply to the most recent request.
    async fn recv(&mut self) -> Result<Bytes, SocketError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Subscribe role: receive broadcast frames only.
#[async_trait]
pub trait SubscribeSocket: Send {
    async fn recv(&mut self) -> Result<Bytes, SocketError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

fn transport_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::InvalidData => TransportError::MalformedFrame(e.to_string()),
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}

fn validate_deadline(name: &str, deadline: Duration) -> Result<(), TransportError> {
    if deadline.is_zero() {
        return Err(TransportError::InvalidOption(format!(
            "{name} deadline must be non-zero"
        )));
    }
    Ok(())
}

/// Pause between dial attempts while an agent is unreachable.
const REDIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Dial until the agent answers. Callers bound this with their deadline.
async fn redial(address: &ChannelAddress) -> ChannelStream {
    loop {
        match connect(address).await {
            Ok(stream) => {
                tracing::debug!(%address, "Reconnected");
                return stream;
            }
            Err(e) => {
                tracing::trace!(%address, error = %e, "Redial failed");
                tokio::time::sleep(REDIAL_INTERVAL).await;
            }
        }
    }
}

/// Request socket over a length-delimited stream with request id envelopes.
///
/// A lost connection is dropped and dialed again on the next `send`. Sockets
/// built with `from_stream` have no address and report `Closed` instead.
pub struct FramedRequestSocket {
    address: Option<ChannelAddress>,
    framed: Option<Framed<ChannelStream, EnvelopeCodec>>,
    send_deadline: Duration,
    recv_deadline: Duration,
    next_id: RequestId,
    outstanding: Option<RequestId>,
}

impl FramedRequestSocket {
    /// Validate deadlines, then dial.
    pub async fn connect(
        address: &ChannelAddress,
        send_deadline: Duration,
        recv_deadline: Duration,
    ) -> Result<Self, TransportError> {
        validate_deadline("send", send_deadline)?;
        validate_deadline("receive", recv_deadline)?;
        let stream = connect(address).await?;
        let mut socket = Self::from_stream(stream, send_deadline, recv_deadline);
        socket.address = Some(address.clone());
        Ok(socket)
    }

    pub fn from_stream(
        stream: ChannelStream,
        send_deadline: Duration,
        recv_deadline: Duration,
    ) -> Self {
        Self {
            address: None,
            framed: Some(Framed::new(stream, EnvelopeCodec::new())),
            send_deadline,
            recv_deadline,
            next_id: RequestId::new(1),
            outstanding: None,
        }
    }

    /// Drop the connection if the agent hung up, discarding any late replies.
    fn drop_if_disconnected(&mut self) {
        let Some(framed) = self.framed.as_mut() else {
            return;
        };
        loop {
            match framed.next().now_or_never() {
                None => return,
                Some(Some(Ok((id, _)))) => {
                    tracing::debug!(request_id = %id, "Dropping stale reply");
                }
                Some(Some(Err(e))) => {
                    tracing::debug!(error = %e, "Command connection broken");
                    break;
                }
                Some(None) => {
                    tracing::debug!("Agent closed the command connection");
                    break;
                }
            }
        }
        self.framed = None;
    }

    /// Undo a send cut short by its deadline, so the request is never delivered.
    ///
    /// Returns true when the frame had in fact been written completely.
    fn abandon_send(&mut self, frame_len: usize) -> bool {
        let Some(framed) = self.framed.as_mut() else {
            return false;
        };
        let unsent = framed.write_buffer().len();
        if unsent == 0 {
            return true;
        }
        if unsent == frame_len {
            framed.write_buffer_mut().clear();
        } else {
            // The agent drops a truncated frame together with its connection.
            tracing::debug!(
                written = frame_len.saturating_sub(unsent),
                frame_len,
                "Dropping connection with partially written request"
            );
            self.framed = None;
        }
        false
    }
}

#[async_trait]
impl RequestSocket for FramedRequestSocket {
    async fn send(&mut self, payload: Bytes) -> Result<(), SocketError> {
        let id = self.next_id;
        self.next_id = id.next();
        self.outstanding = Some(id);
        self.drop_if_disconnected();

        let frame_len = EnvelopeCodec::frame_len(payload.len());
        tracing::trace!(request_id = %id, payload_bytes = payload.len(), "Sending request");

        let address = self.address.as_ref();
        let slot = &mut self.framed;
        let attempt = async {
            if slot.is_none() {
                let Some(address) = address else {
                    return Err(TransportError::Closed);
                };
                *slot = Some(Framed::new(redial(address).await, EnvelopeCodec::new()));
            }
            let Some(framed) = slot.as_mut() else {
                return Err(TransportError::Closed);
            };
            framed.send((id, payload)).await.map_err(transport_error)
        };

        match tokio::time::timeout(self.send_deadline, attempt).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.framed = None;
                Err(e.into())
            }
            Err(_) => {
                if self.abandon_send(frame_len) {
                    Ok(())
                } else {
                    Err(SocketError::Timeout(self.send_deadline))
                }
            }
        }
    }

    async fn recv(&mut self) -> Result<Bytes, SocketError> {
        let expected = self.outstanding.ok_or(TransportError::ProtocolState(
            "receive without an outstanding request",
        ))?;
        let framed = self.framed.as_mut().ok_or(TransportError::Closed)?;

        let reply = async {
            loop {
                match framed.next().await {
                    Some(Ok((id, payload))) if id == expected => return Ok(payload),
                    Some(Ok((id, _))) => {
                        tracing::debug!(request_id = %id, expected = %expected, "Dropping stale reply");
                    }
                    Some(Err(e)) => return Err(transport_error(e)),
                    None => return Err(TransportError::Closed),
                }
            }
        };

        match tokio::time::timeout(self.recv_deadline, reply).await {
            Ok(Ok(payload)) => {
                self.outstanding = None;
                Ok(payload)
            }
            Ok(Err(e)) => {
                self.framed = None;
                Err(e.into())
            }
            Err(_) => Err(SocketError::Timeout(self.recv_deadline)),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outstanding = None;
        match self.framed.take() {
            Some(mut framed) => SinkExt::<(RequestId, Bytes)>::close(&mut framed)
                .await
                .map_err(transport_error),
            None => Ok(()),
        }
    }
}

/// Subscribe socket over a length-delimited stream.
///
/// Frames not starting with `filter` are skipped; an empty filter takes
/// everything. A lost connection is dialed again within the same receive
/// deadline when the socket knows its address.
pub struct FramedSubscribeSocket {
    address: Option<ChannelAddress>,
    framed: Option<Framed<ChannelStream, LengthDelimitedCodec>>,
    recv_deadline: Duration,
    filter: Bytes,
}

impl FramedSubscribeSocket {
    pub async fn connect(
        address: &ChannelAddress,
        recv_deadline: Duration,
        filter: Bytes,
    ) -> Result<Self, TransportError> {
        validate_deadline("receive", recv_deadline)?;
        let stream = connect(address).await?;
        let mut socket = Self::from_stream(stream, recv_deadline, filter);
        socket.address = Some(address.clone());
        Ok(socket)
    }

    pub fn from_stream(stream: ChannelStream, recv_deadline: Duration, filter: Bytes) -> Self {
        Self {
            address: None,
            framed: Some(Framed::new(stream, frame_codec())),
            recv_deadline,
            filter,
        }
    }
}

#[async_trait]
impl SubscribeSocket for FramedSubscribeSocket {
    async fn recv(&mut self) -> Result<Bytes, SocketError> {
        let address = self.address.as_ref();
        let slot = &mut self.framed;
        let filter = &self.filter;

        let next = async {
            loop {
                if slot.is_none() {
                    let Some(address) = address else {
                        return Err(TransportError::Closed);
                    };
                    *slot = Some(Framed::new(redial(address).await, frame_codec()));
                }
                let Some(framed) = slot.as_mut() else {
                    return Err(TransportError::Closed);
                };

                let lost = match framed.next().await {
                    Some(Ok(frame)) if frame.starts_with(filter) => return Ok(frame.freeze()),
                    Some(Ok(frame)) => {
                        tracing::trace!(frame_bytes = frame.len(), "Skipping filtered event");
                        continue;
                    }
                    Some(Err(e)) => transport_error(e),
                    None => TransportError::Closed,
                };

                *slot = None;
                match lost {
                    TransportError::Closed if address.is_some() => {
                        tracing::debug!("Event connection lost, redialing");
                    }
                    other => return Err(other),
                }
            }
        };

        match tokio::time::timeout(self.recv_deadline, next).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SocketError::Timeout(self.recv_deadline)),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.framed.take() {
            Some(mut framed) => SinkExt::<Bytes>::close(&mut framed)
                .await
                .map_err(transport_error),
            None => Ok(()),
        }
    }
}
