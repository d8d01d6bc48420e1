//! Connection supervisor with auto-recovery.
//!
//! Owns the broker connection and its single channel. Every successful
//! connection is announced to the registered listeners exactly once, after
//! which the supervisor watches the connection and channel events. Any
//! failure tears the link down and schedules a full reconnect after a fixed
//! delay, forever, unless the broker closes the connection with a reply
//! code the close policy does not cover.

use crate::adapters::FnListener;
use crate::domain::config::SupervisorConfig;
use crate::domain::error::RpcError;
use crate::domain::state::ConnectionState;
use crate::ports::ConnectionListener;
use mq_broker::{
    reply_codes, Broker, BrokerError, Channel, CloseReason, Connection, TransportEvent,
};
use mq_telemetry::{BROKER_CONNECTIONS, BROKER_CONNECT_ATTEMPTS};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Statistics for the connection supervisor
#[derive(Debug, Default)]
pub struct SupervisorStats {
    /// Dial attempts
    pub connect_attempts: AtomicU64,
    /// Connections that reached the connected state
    pub connections: AtomicU64,
    /// Attempts that failed to dial, open a channel, or bind listeners
    pub connect_failures: AtomicU64,
}

/// State shared between the supervisor task and its handles.
struct Shared {
    state: watch::Sender<ConnectionState>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    stats: SupervisorStats,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        debug!(state = %state, "Connection state changed");
        self.state.send_replace(state);
    }
}

/// How a supervised connection ended.
#[derive(Debug)]
enum Disconnect {
    Retry,
    Stop(CloseReason),
    Shutdown,
}

/// An open connection with its channel and event subscriptions.
struct Link {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    connection_events: broadcast::Receiver<TransportEvent>,
    channel_events: broadcast::Receiver<TransportEvent>,
}

/// Connection supervisor, configured before it is spawned.
pub struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    config: SupervisorConfig,
    listeners: Vec<Arc<dyn ConnectionListener>>,
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    pub fn new(broker: Arc<dyn Broker>, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            broker,
            config,
            listeners: Vec::new(),
            shared: Arc::new(Shared {
                state,
                channel: RwLock::new(None),
                stats: SupervisorStats::default(),
            }),
        }
    }

    /// Register a dependent. Listeners run in registration order.
    pub fn add_listener(&mut self, listener: Arc<dyn ConnectionListener>) -> &mut Self {
        self.listeners.push(listener);
        self
    }

    /// State stream, available before the supervisor is spawned.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Start the supervisor loop in the background.
    pub fn spawn(self) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(self.run(shutdown_rx));

        SupervisorHandle {
            shared,
            shutdown: Arc::new(shutdown_tx),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u64 = 0;
        let mut generation: u64 = 0;

        loop {
            attempt += 1;
            self.shared.set_state(ConnectionState::Connecting { attempt });
            self.shared
                .stats
                .connect_attempts
                .fetch_add(1, Ordering::Relaxed);
            BROKER_CONNECT_ATTEMPTS.inc();
            info!(attempt, url = %self.config.url, "Trying to establish connection");

            let outcome = match self.establish().await {
                Ok(mut link) => match self.bind_listeners(&link.channel).await {
                    Ok(()) => {
                        attempt = 0;
                        generation += 1;
                        *self.shared.channel.write() = Some(Arc::clone(&link.channel));
                        self.shared.stats.connections.fetch_add(1, Ordering::Relaxed);
                        BROKER_CONNECTIONS.inc();
                        self.shared
                            .set_state(ConnectionState::Connected { generation });
                        info!(
                            generation,
                            connection_id = link.connection.id(),
                            channel_id = link.channel.id(),
                            "Connected"
                        );

                        let outcome = self.supervise(&mut link, &mut shutdown).await;
                        *self.shared.channel.write() = None;
                        self.teardown(&link, &outcome).await;
                        outcome
                    }
                    Err(e) => {
                        self.shared
                            .stats
                            .connect_failures
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(attempt, error = %e, "Listener setup failed, retrying");
                        self.teardown(&link, &Disconnect::Retry).await;
                        Disconnect::Retry
                    }
                },
                Err(e) => {
                    self.shared
                        .stats
                        .connect_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(attempt, error = %e, "Connection failed, retrying");
                    Disconnect::Retry
                }
            };

            match outcome {
                Disconnect::Retry => {}
                Disconnect::Stop(reason) => {
                    error!(
                        code = reason.code,
                        reason = %reason.text,
                        "Connection closed with a non-recoverable code, not reconnecting"
                    );
                    self.shared.set_state(ConnectionState::Stopped {
                        code: reason.code,
                        reason: reason.text,
                    });
                    return;
                }
                Disconnect::Shutdown => {
                    self.stop_for_shutdown();
                    return;
                }
            }

            let delay = self.config.retry_delay;
            self.shared.set_state(ConnectionState::Reconnecting {
                attempt: attempt + 1,
                delay,
            });
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => {
                    self.stop_for_shutdown();
                    return;
                }
            }
        }
    }

    /// Dial and open the channel, subscribing to events straight away so
    /// nothing that happens during listener setup is missed.
    async fn establish(&self) -> Result<Link, BrokerError> {
        let connection = self.broker.dial(&self.config.url).await?;
        let connection_events = connection.events();

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(CloseReason::normal()).await;
                return Err(e);
            }
        };
        let channel_events = channel.events();

        Ok(Link {
            connection,
            channel,
            connection_events,
            channel_events,
        })
    }

    async fn bind_listeners(&self, channel: &Arc<dyn Channel>) -> Result<(), RpcError> {
        for listener in &self.listeners {
            listener.on_connected(Arc::clone(channel)).await?;
            debug!(listener = listener.name(), "Listener bound to channel");
        }
        Ok(())
    }

    /// Wait for the first event that ends this connection.
    async fn supervise(&self, link: &mut Link, shutdown: &mut watch::Receiver<bool>) -> Disconnect {
        loop {
            tokio::select! {
                // Connection events first: a connection close also closes
                // the channel, and the connection carries the reply code.
                biased;

                _ = shutdown_requested(shutdown) => return Disconnect::Shutdown,

                event = link.connection_events.recv() => match event {
                    Ok(TransportEvent::Error(message)) => {
                        warn!(error = %message, "Error occurred with connection");
                        return Disconnect::Retry;
                    }
                    Ok(TransportEvent::Closed(reason)) => {
                        if self.config.close_policy.is_retryable(&reason) {
                            warn!(code = reason.code, reason = %reason.text, "Connection closed, retrying");
                            return Disconnect::Retry;
                        }
                        return Disconnect::Stop(reason);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connection events lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!("Connection event stream ended, retrying");
                        return Disconnect::Retry;
                    }
                },

                event = link.channel_events.recv() => match event {
                    Ok(TransportEvent::Error(message)) => {
                        warn!(error = %message, "Error occurred with channel");
                        return Disconnect::Retry;
                    }
                    Ok(TransportEvent::Closed(reason)) => {
                        warn!(code = reason.code, reason = %reason.text, "Channel closed");
                        return Disconnect::Retry;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Channel events lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!("Channel event stream ended, retrying");
                        return Disconnect::Retry;
                    }
                },
            }
        }
    }

    /// Close whatever is still open so a reconnect starts from scratch.
    async fn teardown(&self, link: &Link, outcome: &Disconnect) {
        if !link.connection.is_open() {
            return;
        }
        let reason = match outcome {
            Disconnect::Shutdown => CloseReason::normal(),
            _ => CloseReason::new(reply_codes::REPLY_SUCCESS, "reconnecting"),
        };
        if let Err(e) = link.connection.close(reason).await {
            debug!(error = %e, "Closing stale connection failed");
        }
    }

    fn stop_for_shutdown(&self) {
        self.shared.set_state(ConnectionState::Stopped {
            code: reply_codes::REPLY_SUCCESS,
            reason: "shutdown".to_string(),
        });
        info!("Connection supervisor stopped");
    }
}

/// Resolves once shutdown is requested. Never resolves if every handle
/// has been dropped without asking.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wait up to `wait` for a connection. Zero checks once without waiting.
pub(crate) async fn wait_until_connected(
    state: &mut watch::Receiver<ConnectionState>,
    wait: Duration,
) -> Result<(), RpcError> {
    if !wait.is_zero() {
        let _ = tokio::time::timeout(
            wait,
            state.wait_for(|s| s.is_connected() || s.is_stopped()),
        )
        .await;
    }

    let current = state.borrow().clone();
    if current.is_connected() {
        Ok(())
    } else {
        Err(RpcError::NotConnected {
            state: current.to_string(),
        })
    }
}

/// Handle to a running supervisor. Clones share the same supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The live channel, if connected.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.shared.channel.read().clone()
    }

    /// Wait up to `wait` for a live channel.
    pub async fn wait_connected(&self, wait: Duration) -> Result<Arc<dyn Channel>, RpcError> {
        let mut state = self.subscribe();
        wait_until_connected(&mut state, wait).await?;
        self.channel().ok_or_else(|| RpcError::NotConnected {
            state: self.state().to_string(),
        })
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.shared.stats
    }

    /// Close the connection and stop the loop. Waits for the task to end.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
    }
}

/// Supervise a connection to `config.url`, calling `on_connected` with the
/// channel after every successful (re)connection. Returns immediately.
pub fn connect<F>(broker: Arc<dyn Broker>, config: SupervisorConfig, on_connected: F) -> SupervisorHandle
where
    F: Fn(Arc<dyn Channel>) + Send + Sync + 'static,
{
    let mut supervisor = ConnectionSupervisor::new(broker, config);
    supervisor.add_listener(Arc::new(FnListener::new("on_connected", on_connected)));
    supervisor.spawn()
}
