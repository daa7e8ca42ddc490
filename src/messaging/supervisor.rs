//! Connection supervisor for RabbitMQ
//!
//! Owns one connection and one channel, notices when the broker drops them
//! and redials at a constant interval until closed. Publishers and
//! subscribers wait on the supervisor's state before touching the channel.

use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{AmqpChannel, AmqpConnection, AmqpConnector};
use crate::error::{MqError, Result};
use crate::types::{ConnectionParams, RetryPolicy};

/// Lifecycle of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, reached through `close()` or cancellation
    Closed,
}

struct LiveLink {
    connection: Box<dyn AmqpConnection>,
    channel: Arc<dyn AmqpChannel>,
    closed: Option<oneshot::Receiver<String>>,
}

struct Shared {
    connector: Arc<dyn AmqpConnector>,
    params: ConnectionParams,
    retry: RetryPolicy,
    // Every (re)connect and teardown happens under this lock
    live: Mutex<Option<LiveLink>>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

/// Handle to a supervised connection. Clones share the connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    /// Create the supervisor and start its recovery loop, which dials right
    /// away. Cancelling `cancel` closes the supervisor.
    pub fn start(
        connector: Arc<dyn AmqpConnector>,
        params: ConnectionParams,
        retry: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            connector,
            params,
            retry,
            live: Mutex::new(None),
            state,
            cancel: cancel.child_token(),
        });

        tokio::spawn(recovery_loop(shared.clone()));

        Self { shared }
    }

    /// Dial now unless already connected. The recovery loop keeps retrying
    /// regardless of what this returns.
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }

    /// Wait until connected, at most `delay x max_attempts`.
    pub async fn wait_connected(&self) -> Result<()> {
        let budget = self.shared.retry.wait_budget();
        let mut state = self.shared.state.subscribe();

        let reached = tokio::time::timeout(
            budget,
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed)),
        )
        .await;

        match reached {
            Ok(Ok(s)) if *s == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(MqError::Closed),
            Err(_) => Err(MqError::ConnectTimeout(budget)),
        }
    }

    /// The live channel, once connected.
    pub async fn channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        self.wait_connected().await?;
        self.current_channel().await.ok_or_else(|| {
            MqError::connectivity(&self.shared.params.connection_name, "connection dropped")
        })
    }

    /// The live channel if there is one, without waiting.
    pub(crate) async fn current_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        self.shared
            .live
            .lock()
            .await
            .as_ref()
            .map(|link| link.channel.clone())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions, e.g. to restart consumers after a reconnect.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.shared.params
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.shared.retry
    }

    /// Token cancelled when this supervisor closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Stop reconnecting, close channel and connection, and fail every
    /// waiter with `Closed`. Safe to call more than once.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.teardown(ConnectionState::Closed).await;
    }
}

impl Shared {
    async fn connect(&self) -> Result<()> {
        let mut live = self.live.lock().await;
        if self.cancel.is_cancelled() {
            return Err(MqError::Closed);
        }
        if live.is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let dialed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MqError::Closed),
            dialed = self.connector.dial(&self.params) => dialed,
        };

        match dialed {
            Ok(link) => {
                *live = Some(LiveLink {
                    connection: link.connection,
                    channel: link.channel,
                    closed: Some(link.closed),
                });
                self.set_state(ConnectionState::Connected);
                info!(
                    connection = %self.params.connection_name,
                    "Broker connection established"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn take_close_signal(&self) -> Option<oneshot::Receiver<String>> {
        self.live.lock().await.as_mut().and_then(|link| link.closed.take())
    }

    async fn teardown(&self, next: ConnectionState) {
        let link = self.live.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = link.channel.close().await {
                debug!(error = %e, "Channel close failed");
            }
            if let Err(e) = link.connection.close().await {
                debug!(error = %e, "Connection close failed");
            }
        }

        if next == ConnectionState::Closed {
            self.state.send_replace(ConnectionState::Closed);
        } else {
            self.set_state(next);
        }
    }

    /// Closed is terminal and never overwritten.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn recovery_loop(shared: Arc<Shared>) {
    let name = shared.params.connection_name.clone();

    loop {
        let closed = match shared.connect().await {
            Ok(()) => shared.take_close_signal().await,
            Err(MqError::Closed) => break,
            Err(e) => {
                warn!(connection = %name, error = %e, "Broker connection attempt failed");
                None
            }
        };

        if let Some(closed) = closed {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                reason = closed => {
                    let reason = reason.unwrap_or_else(|_| "close listener dropped".to_string());
                    warn!(connection = %name, reason = %reason, "Broker connection lost");
                    shared.teardown(ConnectionState::Disconnected).await;
                }
            }
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.retry.delay) => {}
        }
    }

    shared.teardown(ConnectionState::Closed).await;
    info!(connection = %name, "Connection supervisor stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messaging::test_utils::FakeAmqpBroker;

    fn params() -> ConnectionParams {
        ConnectionParams {
            uri: "amqp://localhost:5672".to_string(),
            vhost: "/".to_string(),
            connection_name: "orders-service".to_string(),
            heartbeat: Duration::from_secs(10),
        }
    }

    fn supervisor(broker: &Arc<FakeAmqpBroker>, cancel: &CancellationToken) -> ConnectionSupervisor {
        ConnectionSupervisor::start(broker.connector(), params(), RetryPolicy::default(), cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_start() {
        let broker = FakeAmqpBroker::new();
        let cancel = CancellationToken::new();
        let supervisor = supervisor(&broker, &cancel);

        supervisor.wait_connected().await.unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(broker.dials(), 1);
        assert_eq!(broker.dialed_with()[0].connection_name, "orders-service");

        // Already connected, no second dial
        supervisor.connect().await.unwrap();
        assert_eq!(broker.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_failed_dials_at_fixed_interval() {
        let broker = FakeAmqpBroker::new();
        broker.fail_next_dials(3);
        let cancel = CancellationToken::new();
        let supervisor = supervisor(&broker, &cancel);

        let started = tokio::time::Instant::now();
        supervisor.wait_connected().await.unwrap();

        assert_eq!(broker.dials(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_repeated_drops() {
        let broker = FakeAmqpBroker::new();
        let cancel = CancellationToken::new();
        let supervisor = supervisor(&broker, &cancel);
        supervisor.wait_connected().await.unwrap();

        for round in 1..=5 {
            let mut state = supervisor.subscribe_state();
            broker.drop_connection("heartbeat timeout");
            state
                .wait_for(|s| *s == ConnectionState::Disconnected)
                .await
                .unwrap();

            supervisor.wait_connected().await.unwrap();
            assert_eq!(broker.dials(), round + 1);
            assert_eq!(broker.closed_links(), round);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_while_broker_down() {
        let broker = FakeAmqpBroker::new();
        broker.fail_next_dials(usize::MAX);
        let cancel = CancellationToken::new();
        let supervisor = supervisor(&broker, &cancel);

        let err = supervisor.wait_connected().await.unwrap_err();
        assert!(matches!(err, MqError::ConnectTimeout(d) if d == Duration::from_secs(20)));
        assert!(err.is_retryable());
        assert_ne!(supervisor.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_waiters() {
        let broker = FakeAmqpBroker::new();
        broker.fail_next_dials(usize::MAX);
        let cancel = CancellationToken::new();
        let supervisor = supervisor(&broker, &cancel);

        let waiter = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.wait_connected().await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;

        supervisor.close().await;
        supervisor.close().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, MqError::Closed));
        assert_eq!(supervisor.state(), ConnectionState::Closed);
        assert!(matches!(supervisor.connect().await, Err(MqError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_closes() {
        let broker = FakeAmqpBroker::new();
        let cancel = CancellationToken::new();
        let supervisor = supervisor(&broker, &cancel);
        supervisor.wait_connected().await.unwrap();

        cancel.cancel();
        let mut state = supervisor.subscribe_state();
        state.wait_for(|s| *s == ConnectionState::Closed).await.unwrap();
        assert_eq!(broker.closed_links(), 1);
    }
}
