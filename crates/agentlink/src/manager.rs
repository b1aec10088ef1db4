//! Channel manager - owns both controller endpoints for their whole life.
//!
//! Lifecycle: uninitialized -> ready -> closed, with `EventsOnly` when the
//! command endpoint failed to open after the event endpoint succeeded. In
//! that case the event endpoint stays open and usable until
//! `shutdown_channels`.
//!
//! Each endpoint sits behind an async mutex, so concurrent callers are
//! served one at a time instead of interleaving requests on one socket.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CommandMessage, CommandResponse, EventName};
use crate::bridge::transport::{ChannelAddress, TransportKind};
use crate::channel::{CommandChannel, CommandConfig, Delivery, EventChannel, EventConfig};
use crate::error::{ChannelError, EndpointRole, TransportError};

#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub command: CommandConfig,
    pub event: EventConfig,
    pub transport: TransportKind,
}

impl ChannelConfig {
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.command.delivery = delivery;
        self
    }

    pub fn with_command_deadlines(mut self, send: Duration, recv: Duration) -> Self {
        self.command.send_deadline = send;
        self.command.recv_deadline = recv;
        self
    }

    pub fn with_max_timeouts(mut self, max_timeouts: u32) -> Self {
        self.command.max_timeouts = max_timeouts;
        self
    }

    pub fn with_event_deadline(mut self, deadline: Duration) -> Self {
        self.event.recv_deadline = deadline;
        self
    }

    pub fn with_event_filter(mut self, filter: impl Into<Bytes>) -> Self {
        self.event.filter = filter.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing was ever opened.
    Uninitialized,
    /// Both endpoints open. A lost connection is dialed again on next use.
    Ready,
    /// Command endpoint failed to open; events still flow.
    EventsOnly,
    Closed,
}

struct Lifecycle {
    cancel: CancellationToken,
    addresses: Option<(ChannelAddress, ChannelAddress)>,
}

/// Owner of the command and event endpoints.
///
/// Share it behind an `Arc`; every operation takes `&self`.
pub struct ChannelManager {
    config: ChannelConfig,
    command: Mutex<Option<CommandChannel>>,
    event: Mutex<Option<EventChannel>>,
    lifecycle: StdMutex<Lifecycle>,
    opened: AtomicBool,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            command: Mutex::new(None),
            event: Mutex::new(None),
            lifecycle: StdMutex::new(Lifecycle {
                cancel: CancellationToken::new(),
                addresses: None,
            }),
            opened: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        // Lifecycle holds no invariants a panicking holder could break.
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Command and event addresses from the last initialization.
    pub fn addresses(&self) -> Option<(ChannelAddress, ChannelAddress)> {
        self.lifecycle().addresses.clone()
    }

    pub async fn state(&self) -> ChannelState {
        let event_open = self.event.lock().await.is_some();
        let command_open = self.command.lock().await.is_some();
        match (command_open, event_open) {
            (true, _) => ChannelState::Ready,
            (false, true) => ChannelState::EventsOnly,
            (false, false) if self.opened.load(Ordering::Acquire) => ChannelState::Closed,
            (false, false) => ChannelState::Uninitialized,
        }
    }

    /// Open both endpoints on `host` using the configured transport.
    pub async fn init_channels(
        &self,
        host: &str,
        command_port: u16,
        event_port: u16,
    ) -> Result<(), ChannelError> {
        let command_addr = self.config.transport.address(host, command_port);
        let event_addr = self.config.transport.address(host, event_port);
        self.init_with_addresses(command_addr, event_addr).await
    }

    /// Open the event endpoint, then the command endpoint.
    ///
    /// If the event endpoint fails nothing is left open. If the command
    /// endpoint fails the event endpoint stays open (`ChannelState::EventsOnly`)
    /// until `shutdown_channels`.
    pub async fn init_with_addresses(
        &self,
        command_addr: ChannelAddress,
        event_addr: ChannelAddress,
    ) -> Result<(), ChannelError> {
        if self.state().await != ChannelState::Uninitialized {
            tracing::warn!("Re-initializing channels, closing previous endpoints");
            self.shutdown_channels().await;
        }

        tracing::debug!(command = %command_addr, event = %event_addr, "Initializing channels");

        let cancel = {
            let mut lifecycle = self.lifecycle();
            lifecycle.cancel = CancellationToken::new();
            lifecycle.addresses = Some((command_addr.clone(), event_addr.clone()));
            lifecycle.cancel.clone()
        };

        let event = EventChannel::open(&event_addr, self.config.event.clone(), cancel.clone()).await?;
        *self.event.lock().await = Some(event);
        self.opened.store(true, Ordering::Release);

        let command = CommandChannel::open(&command_addr, self.config.command.clone(), cancel)
            .await
            .inspect_err(|e| {
                tracing::warn!(error = %e, "Command endpoint failed; event endpoint left open");
            })?;
        *self.command.lock().await = Some(command);

        tracing::info!(command = %command_addr, event = %event_addr, "Channels ready");
        Ok(())
    }

    /// Send a command to the agent and wait for its reply.
    pub async fn send_container_command(
        &self,
        message: &CommandMessage,
    ) -> Result<CommandResponse, ChannelError> {
        let mut command = self.command.lock().await;
        let channel = command
            .as_mut()
            .ok_or(TransportError::NotOpen(EndpointRole::Command))?;
        channel.send_command(message).await
    }

    /// Wait for the next event broadcast by the agent.
    pub async fn get_container_event(&self) -> Result<EventName, ChannelError> {
        let mut event = self.event.lock().await;
        let channel = event
            .as_mut()
            .ok_or(TransportError::NotOpen(EndpointRole::Event))?;
        channel.get_event().await
    }

    /// Close whatever is open. Idempotent, never fails.
    ///
    /// Pending `send_container_command` / `get_container_event` calls return
    /// `Transport(Closed)`.
    pub async fn shutdown_channels(&self) {
        self.lifecycle().cancel.cancel();

        let event = self.event.lock().await.take();
        if let Some(event) = event {
            if let Err(e) = event.close().await {
                tracing::warn!(role = %EndpointRole::Event, error = %e, "Error closing endpoint");
            }
            tracing::debug!("Event endpoint closed");
        }

        let command = self.command.lock().await.take();
        if let Some(command) = command {
            if let Err(e) = command.close().await {
                tracing::warn!(role = %EndpointRole::Command, error = %e, "Error closing endpoint");
            }
            tracing::debug!("Command endpoint closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use crate::agent::{EventPublisher, ReplyEndpoint};

    struct Agent {
        command_port: u16,
        event_port: u16,
        publisher: EventPublisher,
        server: tokio::task::JoinHandle<TransportError>,
    }

    fn port_of(addr: &ChannelAddress) -> u16 {
        match addr {
            ChannelAddress::Tcp { port, .. } => *port,
            ChannelAddress::Ipc { .. } => panic!("expected tcp address"),
        }
    }

    fn echo(cmd: Result<CommandMessage, ChannelError>) -> Bytes {
        match cmd {
            Ok(m) => Bytes::from(format!("ok:{}", m.name())),
            Err(e) => Bytes::from(format!("error:{e}")),
        }
    }

    async fn spawn_agent() -> Agent {
        let any_port = ChannelAddress::tcp("127.0.0.1", 0);
        let endpoint = ReplyEndpoint::bind(&any_port).await.unwrap();
        let command_port = port_of(&endpoint.local_address().unwrap());
        let publisher = EventPublisher::bind(&any_port).await.unwrap();
        let event_port = port_of(publisher.local_address());
        let server = tokio::spawn(endpoint.serve(echo));
        Agent {
            command_port,
            event_port,
            publisher,
            server,
        }
    }

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn command_and_event_roundtrip() {
        let agent = spawn_agent().await;
        let manager = ChannelManager::default();

        manager
            .init_channels("127.0.0.1", agent.command_port, agent.event_port)
            .await
            .unwrap();
        assert_eq!(manager.state().await, ChannelState::Ready);

        let response = manager
            .send_container_command(&CommandMessage::new("start_monitor"))
            .await
            .unwrap();
        assert_eq!(response.text(), "ok:start_monitor");

        agent.publisher.wait_for_subscribers(1).await;
        agent
            .publisher
            .publish(&EventName::new("monitor.start.done"))
            .await;
        assert_eq!(
            manager.get_container_event().await.unwrap(),
            EventName::new("monitor.start.done")
        );

        manager.shutdown_channels().await;
        assert_eq!(manager.state().await, ChannelState::Closed);
        agent.server.abort();
    }

    #[tokio::test]
    async fn shutdown_before_init_is_noop() {
        let manager = ChannelManager::default();
        manager.shutdown_channels().await;
        manager.shutdown_channels().await;
        assert_eq!(manager.state().await, ChannelState::Uninitialized);

        let err = manager
            .send_container_command(&CommandMessage::new("start_monitor"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::NotOpen(EndpointRole::Command))
        ));
        let err = manager.get_container_event().await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::NotOpen(EndpointRole::Event))
        ));
    }

    #[tokio::test]
    async fn shutdown_twice_after_init() {
        let agent = spawn_agent().await;
        let manager = ChannelManager::default();
        manager
            .init_channels("127.0.0.1", agent.command_port, agent.event_port)
            .await
            .unwrap();

        manager.shutdown_channels().await;
        manager.shutdown_channels().await;
        assert_eq!(manager.state().await, ChannelState::Closed);
        assert!(
            manager
                .get_container_event()
                .await
                .unwrap_err()
                .is_closed()
        );
        agent.server.abort();
    }

    #[tokio::test]
    async fn event_endpoint_failure_opens_nothing() {
        let manager = ChannelManager::default();
        let agent = spawn_agent().await;
        let dead = refused_port().await;

        let err = manager
            .init_channels("127.0.0.1", agent.command_port, dead)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Initialization {
                role: EndpointRole::Event,
                ..
            }
        ));
        assert_eq!(manager.state().await, ChannelState::Uninitialized);
        agent.server.abort();
    }

    #[tokio::test]
    async fn command_endpoint_failure_leaves_events_open() {
        let agent = spawn_agent().await;
        let dead = refused_port().await;
        let manager = ChannelManager::default();

        let err = manager
            .init_channels("127.0.0.1", dead, agent.event_port)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Initialization {
                role: EndpointRole::Command,
                ..
            }
        ));
        assert_eq!(manager.state().await, ChannelState::EventsOnly);

        // Events still flow.
        agent.publisher.wait_for_subscribers(1).await;
        agent.publisher.publish(&EventName::new("heartbeat")).await;
        assert_eq!(manager.get_container_event().await.unwrap().as_str(), "heartbeat");

        // Commands report the missing endpoint.
        let err = manager
            .send_container_command(&CommandMessage::new("start_monitor"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::NotOpen(EndpointRole::Command))
        ));

        manager.shutdown_channels().await;
        assert_eq!(manager.state().await, ChannelState::Closed);
        agent.server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_yields_event_timeout() {
        let agent = spawn_agent().await;
        let manager = ChannelManager::default();
        manager
            .init_channels("127.0.0.1", agent.command_port, agent.event_port)
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = manager.get_container_event().await.unwrap_err();
        assert!(
            matches!(err, ChannelError::EventTimeout { deadline } if deadline == Duration::from_secs(120))
        );
        assert!(started.elapsed() >= Duration::from_secs(120));

        manager.shutdown_channels().await;
        agent.server.abort();
    }

    #[tokio::test]
    async fn shutdown_unblocks_pending_event_wait() {
        let agent = spawn_agent().await;
        let manager = Arc::new(ChannelManager::default());
        manager
            .init_channels("127.0.0.1", agent.command_port, agent.event_port)
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.get_container_event().await }
        });
        tokio::task::yield_now().await;

        manager.shutdown_channels().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_closed());
        agent.server.abort();
    }

    #[tokio::test]
    async fn concurrent_commands_are_serialized() {
        let agent = spawn_agent().await;
        let manager = Arc::new(ChannelManager::default());
        manager
            .init_channels("127.0.0.1", agent.command_port, agent.event_port)
            .await
            .unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    let name = format!("cmd_{i}");
                    let response = manager
                        .send_container_command(&CommandMessage::new(name.clone()))
                        .await
                        .unwrap();
                    (name, response)
                })
            })
            .collect();

        for task in tasks {
            let (name, response) = task.await.unwrap();
            assert_eq!(response.text(), format!("ok:{name}"));
        }

        manager.shutdown_channels().await;
        agent.server.abort();
    }

    #[tokio::test]
    async fn reinit_replaces_endpoints() {
        let first = spawn_agent().await;
        let second = spawn_agent().await;
        let manager = ChannelManager::default();

        manager
            .init_channels("127.0.0.1", first.command_port, first.event_port)
            .await
            .unwrap();
        manager
            .init_channels("127.0.0.1", second.command_port, second.event_port)
            .await
            .unwrap();

        let (command, _) = manager.addresses().unwrap();
        assert_eq!(command, ChannelAddress::tcp("127.0.0.1", second.command_port));
        assert!(
            manager
                .send_container_command(&CommandMessage::new("ping"))
                .await
                .is_ok()
        );

        manager.shutdown_channels().await;
        first.server.abort();
        second.server.abort();
    }

    async fn bind_publisher(port: u16) -> EventPublisher {
        // The old publisher's listener goes away once its accept task is reaped.
        let addr = ChannelAddress::tcp("127.0.0.1", port);
        for _ in 0..50 {
            if let Ok(publisher) = EventPublisher::bind(&addr).await {
                return publisher;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("port {port} never became free");
    }

    #[tokio::test]
    async fn channels_recover_after_agent_restart() {
        let agent = spawn_agent().await;
        let manager = Arc::new(ChannelManager::default());
        manager
            .init_channels("127.0.0.1", agent.command_port, agent.event_port)
            .await
            .unwrap();
        assert!(
            manager
                .send_container_command(&CommandMessage::new("ping"))
                .await
                .is_ok()
        );

        agent.server.abort();
        let _ = agent.server.await;
        drop(agent.publisher);

        let endpoint = ReplyEndpoint::bind(&ChannelAddress::tcp("127.0.0.1", agent.command_port))
            .await
            .unwrap();
        let server = tokio::spawn(endpoint.serve(echo));
        let publisher = bind_publisher(agent.event_port).await;
        // Give the runtime a turn to observe the old connections closing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..3 {
            let response = manager
                .send_container_command(&CommandMessage::new("ping"))
                .await
                .unwrap();
            assert_eq!(response.text(), "ok:ping");
        }
        assert_eq!(manager.state().await, ChannelState::Ready);

        let waiter = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.get_container_event().await }
        });
        publisher.wait_for_subscribers(1).await;
        publisher.publish(&EventName::new("monitor.start.done")).await;
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            EventName::new("monitor.start.done")
        );

        manager.shutdown_channels().await;
        server.abort();
    }

    #[tokio::test]
    async fn ipc_transport_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = TransportKind::Ipc {
            dir: dir.path().to_path_buf(),
        };

        let endpoint = ReplyEndpoint::bind(&transport.address("", 65501))
            .await
            .unwrap();
        let publisher = EventPublisher::bind(&transport.address("", 65502))
            .await
            .unwrap();
        let server = tokio::spawn(endpoint.serve(echo));

        let manager = ChannelManager::new(ChannelConfig::default().with_transport(transport));
        manager.init_channels("", 65501, 65502).await.unwrap();

        let response = manager
            .send_container_command(&CommandMessage::new("shutdown_sensor"))
            .await
            .unwrap();
        assert_eq!(response.text(), "ok:shutdown_sensor");

        publisher.wait_for_subscribers(1).await;
        publisher.publish(&EventName::new("shutdown.done")).await;
        assert_eq!(
            manager.get_container_event().await.unwrap().as_str(),
            "shutdown.done"
        );

        manager.shutdown_channels().await;
        server.abort();
    }

    #[test]
    fn config_builders() {
        let config = ChannelConfig::default()
            .with_delivery(Delivery::AtMostOnce)
            .with_command_deadlines(Duration::from_secs(1), Duration::from_secs(2))
            .with_max_timeouts(5)
            .with_event_deadline(Duration::from_secs(30))
            .with_event_filter("monitor.");

        assert_eq!(config.command.delivery, Delivery::AtMostOnce);
        assert_eq!(config.command.send_deadline, Duration::from_secs(1));
        assert_eq!(config.command.recv_deadline, Duration::from_secs(2));
        assert_eq!(config.command.max_timeouts, 5);
        assert_eq!(config.event.recv_deadline, Duration::from_secs(30));
        assert_eq!(&config.event.filter[..], b"monitor.");
        assert_eq!(config.transport, TransportKind::Tcp);
    }

    #[test]
    fn default_config_values() {
        let config = ChannelConfig::default();
        assert_eq!(config.command.send_deadline, Duration::from_secs(3));
        assert_eq!(config.command.recv_deadline, Duration::from_secs(3));
        assert_eq!(config.command.max_timeouts, 3);
        assert_eq!(config.command.delivery, Delivery::AtLeastOnce);
        assert_eq!(config.event.recv_deadline, Duration::from_secs(120));
        assert!(config.event.filter.is_empty());
    }
}
