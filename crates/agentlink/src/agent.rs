//! Agent side of the link - runs inside the monitored process.
//!
//! The controller side lives in `channel` and `manager`. This module binds
//! the addresses the controller dials:
//! - **ReplyEndpoint**: answers command requests, echoing each request id
//! - **EventPublisher**: broadcasts event names to every connected subscriber

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, FramedWrite, LengthDelimitedCodec};

use crate::bridge::codec::{self, EnvelopeCodec, frame_codec};
use crate::bridge::protocol::{CommandMessage, EventName, RequestId};
use crate::bridge::transport::{ChannelAddress, ChannelListener, ChannelStream};
use crate::error::{ChannelError, TransportError};

/// Longest a single subscriber may hold up a broadcast.
const PUBLISH_DEADLINE: Duration = Duration::from_secs(3);

/// A command request as received by the agent.
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    id: RequestId,
    payload: Bytes,
}

impl IncomingCommand {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn decode(&self) -> Result<CommandMessage, ChannelError> {
        codec::decode(&self.payload)
    }
}

/// Reply side of the command channel.
///
/// Serves one controller connection at a time; when the controller goes away
/// the next `next_command` call waits for a new one.
pub struct ReplyEndpoint {
    listener: ChannelListener,
    conn: Option<Framed<ChannelStream, EnvelopeCodec>>,
}

impl ReplyEndpoint {
    pub async fn bind(address: &ChannelAddress) -> Result<Self, TransportError> {
        let listener = ChannelListener::bind(address).await?;
        Ok(Self {
            listener,
            conn: None,
        })
    }

    pub fn local_address(&self) -> Result<ChannelAddress, TransportError> {
        self.listener.local_address()
    }

    /// Wait for the next request.
    ///
    /// A reset or truncated connection counts as a disconnect. A frame that
    /// cannot be decoded drops the connection and is reported as
    /// `MalformedFrame`; the endpoint stays usable either way.
    pub async fn next_command(&mut self) -> Result<IncomingCommand, TransportError> {
        loop {
            if self.conn.is_none() {
                let stream = self.listener.accept().await?;
                tracing::debug!(transport = stream.transport(), "Controller connected");
                self.conn = Some(Framed::new(stream, EnvelopeCodec::new()));
            }
            let Some(conn) = self.conn.as_mut() else {
                continue;
            };

            match conn.next().await {
                Some(Ok((id, payload))) => {
                    tracing::trace!(
                        request_id = %id,
                        payload_bytes = payload.len(),
                        "Request received"
                    );
                    return Ok(IncomingCommand { id, payload });
                }
                Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    self.conn = None;
                    return Err(TransportError::MalformedFrame(e.to_string()));
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Controller connection failed");
                    self.conn = None;
                }
                None => {
                    tracing::debug!("Controller disconnected");
                    self.conn = None;
                }
            }
        }
    }

    /// Answer a request. The reply carries the request's id.
    pub async fn reply(
        &mut self,
        request: &IncomingCommand,
        payload: impl Into<Bytes>,
    ) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::Closed)?;
        conn.send((request.id, payload.into()))
            .await
            .map_err(TransportError::Io)
    }

    /// Answer every request with `handler`.
    ///
    /// Misbehaving controllers are dropped and the next one is awaited; only
    /// a listener failure ends the loop.
    pub async fn serve<F>(mut self, mut handler: F) -> TransportError
    where
        F: FnMut(Result<CommandMessage, ChannelError>) -> Bytes,
    {
        loop {
            let request = match self.next_command().await {
                Ok(request) => request,
                Err(TransportError::MalformedFrame(reason)) => {
                    tracing::warn!(%reason, "Dropped controller after malformed frame");
                    continue;
                }
                Err(e) => return e,
            };
            let reply = handler(request.decode());
            if let Err(e) = self.reply(&request, reply).await {
                tracing::warn!(error = %e, "Failed to send reply");
            }
        }
    }
}

type Subscriber = FramedWrite<ChannelStream, LengthDelimitedCodec>;

/// Publish side of the event channel.
///
/// Accepts subscribers in the background for as long as it lives.
pub struct EventPublisher {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    count_rx: watch::Receiver<usize>,
    count_tx: Arc<watch::Sender<usize>>,
    address: ChannelAddress,
    accept_task: JoinHandle<()>,
}

impl EventPublisher {
    pub async fn bind(address: &ChannelAddress) -> Result<Self, TransportError> {
        let listener = ChannelListener::bind(address).await?;
        let address = listener.local_address()?;
        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let (count_tx, count_rx) = watch::channel(0usize);
        let count_tx = Arc::new(count_tx);

        let accept_task = tokio::spawn({
            let subscribers = Arc::clone(&subscribers);
            let count_tx = Arc::clone(&count_tx);
            async move {
                loop {
                    match listener.accept().await {
                        Ok(stream) => {
                            let mut subs = subscribers.lock().await;
                            subs.push(FramedWrite::new(stream, frame_codec()));
                            count_tx.send_replace(subs.len());
                            tracing::debug!(subscribers = subs.len(), "Subscriber connected");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept subscriber");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            subscribers,
            count_rx,
            count_tx,
            address,
            accept_task,
        })
    }

    pub fn local_address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Wait until at least `n` subscribers are connected.
    pub async fn wait_for_subscribers(&self, n: usize) {
        let mut rx = self.count_rx.clone();
        // The sender lives as long as `self`, so this only returns once satisfied.
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Broadcast an event to every live subscriber. Returns how many got it.
    ///
    /// Subscribers whose connection failed or stalled are dropped.
    pub async fn publish(&self, event: &EventName) -> usize {
        let payload = Bytes::copy_from_slice(event.as_str().as_bytes());
        let mut subs = self.subscribers.lock().await;

        let mut live = Vec::with_capacity(subs.len());
        for mut sub in subs.drain(..) {
            match tokio::time::timeout(PUBLISH_DEADLINE, sub.send(payload.clone())).await {
                Ok(Ok(())) => live.push(sub),
                Ok(Err(e)) => tracing::debug!(error = %e, "Dropping subscriber"),
                Err(_) => tracing::debug!("Dropping stalled subscriber"),
            }
        }
        *subs = live;
        self.count_tx.send_replace(subs.len());

        tracing::debug!(%event, delivered = subs.len(), "Published event");
        subs.len()
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
