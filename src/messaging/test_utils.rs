//! In-memory brokers for exercising the clients without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::group::{
    AdminConnector, ClaimHandler, ClusterAdmin, GroupConnection, GroupConnector, GroupSession,
    PartitionClaim,
};
use super::transport::{
    Acknowledger, AmqpChannel, AmqpConnection, AmqpConnector, AmqpLink, DeliveryStream,
    InboundDelivery, QueueArgs,
};
use crate::error::{MqError, Result};
use crate::types::{ConnectionParams, ConsumerRecord, OutboundMessage};

// ---------------------------------------------------------------------------
// AMQP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Ack(u64),
    Reject { tag: u64, requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

#[derive(Default)]
struct AmqpState {
    failing_dials: usize,
    dials: usize,
    closed_links: usize,
    dialed_with: Vec<ConnectionParams>,
    exchanges: Vec<String>,
    queues: Vec<(String, QueueArgs)>,
    bindings: Vec<(String, String, String)>,
    prefetch: Option<u16>,
    rejected_exchanges: Vec<String>,
    published: Vec<Published>,
    settled: Vec<Settled>,
    close_signal: Option<oneshot::Sender<String>>,
    consumers: Vec<FakeConsumer>,
    cancelled: Vec<String>,
}

struct FakeConsumer {
    queue: String,
    tag: String,
    deliveries: mpsc::UnboundedSender<Result<InboundDelivery>>,
}

/// A RabbitMQ stand-in recording every call.
#[derive(Default)]
pub struct FakeAmqpBroker {
    state: Mutex<AmqpState>,
    consumer_started: Notify,
    settled_changed: Notify,
}

impl FakeAmqpBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn AmqpConnector> {
        Arc::new(FakeConnector(self.clone()))
    }

    /// Make the next `n` dials fail.
    pub fn fail_next_dials(&self, n: usize) {
        self.state.lock().unwrap().failing_dials = n;
    }

    /// Refuse declarations of this exchange.
    pub fn reject_exchange(&self, exchange: &str) {
        self.state.lock().unwrap().rejected_exchanges.push(exchange.to_string());
    }

    /// Simulate the broker dropping the live connection.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(signal) = state.close_signal.take() {
            let _ = signal.send(reason.to_string());
        }
        state.consumers.clear();
    }

    /// Push one delivery to the first consumer of `queue`.
    pub fn deliver(self: &Arc<Self>, queue: &str, tag: u64, payload: &[u8], redelivered: bool) {
        let state = self.state.lock().unwrap();
        if let Some(consumer) = state.consumers.iter().find(|c| c.queue == queue) {
            let acker = FakeAcker {
                tag,
                broker: self.clone(),
            };
            let _ = consumer
                .deliveries
                .send(Ok(InboundDelivery::new(payload.to_vec(), redelivered, acker)));
        }
    }

    pub async fn wait_for_consumer(&self) {
        self.wait_for_consumers(1).await;
    }

    pub async fn wait_for_consumers(&self, count: usize) {
        loop {
            let notified = self.consumer_started.notified();
            if self.state.lock().unwrap().consumers.len() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Tags of the registered consumers, in registration order.
    pub fn consumer_tags(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.consumers.iter().map(|c| c.tag.clone()).collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub async fn wait_for_settled(&self, count: usize) -> Vec<Settled> {
        loop {
            let notified = self.settled_changed.notified();
            {
                let state = self.state.lock().unwrap();
                if state.settled.len() >= count {
                    return state.settled.clone();
                }
            }
            notified.await;
        }
    }

    pub fn dials(&self) -> usize {
        self.state.lock().unwrap().dials
    }

    pub fn closed_links(&self) -> usize {
        self.state.lock().unwrap().closed_links
    }

    pub fn dialed_with(&self) -> Vec<ConnectionParams> {
        self.state.lock().unwrap().dialed_with.clone()
    }

    pub fn exchanges(&self) -> Vec<String> {
        self.state.lock().unwrap().exchanges.clone()
    }

    pub fn queues(&self) -> Vec<(String, QueueArgs)> {
        self.state.lock().unwrap().queues.clone()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetch
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn settled(&self) -> Vec<Settled> {
        self.state.lock().unwrap().settled.clone()
    }

    fn settle(&self, settled: Settled) {
        self.state.lock().unwrap().settled.push(settled);
        self.settled_changed.notify_waiters();
    }
}

struct FakeConnector(Arc<FakeAmqpBroker>);

#[async_trait]
impl AmqpConnector for FakeConnector {
    async fn dial(&self, params: &ConnectionParams) -> Result<AmqpLink> {
        let mut state = self.0.state.lock().unwrap();
        state.dials += 1;
        state.dialed_with.push(params.clone());
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(MqError::connectivity("fake-broker", "connection refused"));
        }

        let (tx, closed) = oneshot::channel();
        state.close_signal = Some(tx);
        Ok(AmqpLink {
            connection: Box::new(FakeConnection(self.0.clone())),
            channel: Arc::new(FakeChannel(self.0.clone())),
            closed,
        })
    }
}

struct FakeConnection(Arc<FakeAmqpBroker>);

#[async_trait]
impl AmqpConnection for FakeConnection {
    async fn close(&self) -> Result<()> {
        self.0.state.lock().unwrap().closed_links += 1;
        Ok(())
    }
}

struct FakeChannel(Arc<FakeAmqpBroker>);

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let mut state = self.0.state.lock().unwrap();
        if state.rejected_exchanges.iter().any(|e| e == exchange) {
            return Err(MqError::topology(
                format!("exchange {exchange}"),
                "PRECONDITION_FAILED - inequivalent arg 'type'",
            ));
        }
        state.exchanges.push(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, args: &QueueArgs) -> Result<()> {
        let mut state = self.0.state.lock().unwrap();
        state.queues.push((queue.to_string(), args.clone()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.0.state.lock().unwrap();
        state
            .bindings
            .push((queue.to_string(), exchange.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.0.state.lock().unwrap().prefetch = Some(count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<()> {
        self.0.state.lock().unwrap().published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.0.state.lock().unwrap();
            if state.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(MqError::topology(
                    format!("consumer on {queue}"),
                    format!("NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"),
                ));
            }
            state.consumers.push(FakeConsumer {
                queue: queue.to_string(),
                tag: consumer_tag.to_string(),
                deliveries: tx,
            });
        }
        self.0.consumer_started.notify_waiters();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.0.state.lock().unwrap();
        state.consumers.retain(|c| c.tag != consumer_tag);
        state.cancelled.push(consumer_tag.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeAcker {
    tag: u64,
    broker: Arc<FakeAmqpBroker>,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(Settled::Ack(self.tag));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker.settle(Settled::Reject {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Kafka
// ---------------------------------------------------------------------------

/// Session that records marks and commits.
#[derive(Default)]
pub struct RecordingSession {
    marked: Mutex<HashMap<(String, i32), i64>>,
    commits: Mutex<Vec<(String, i32, i64)>>,
    failing_commits: Mutex<usize>,
    attempts: Mutex<usize>,
    committed: Notify,
}

impl RecordingSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every (topic, partition, next offset) committed so far, in order.
    pub fn commits(&self) -> Vec<(String, i32, i64)> {
        self.commits.lock().unwrap().clone()
    }

    /// Make the next `n` commits fail as if the coordinator moved.
    pub fn fail_next_commits(&self, n: usize) {
        *self.failing_commits.lock().unwrap() = n;
    }

    /// Resolves once `count` commits were tried, successful or not.
    pub async fn wait_for_commit_attempts(&self, count: usize) {
        loop {
            let notified = self.committed.notified();
            if *self.attempts.lock().unwrap() >= count {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_for_commits(&self, count: usize) -> Vec<(String, i32, i64)> {
        loop {
            let notified = self.committed.notified();
            let commits = self.commits();
            if commits.len() >= count {
                return commits;
            }
            notified.await;
        }
    }
}

impl GroupSession for RecordingSession {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.marked
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition), offset);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        *self.attempts.lock().unwrap() += 1;
        let marked: Vec<_> = self.marked.lock().unwrap().drain().collect();

        let failed = {
            let mut failing = self.failing_commits.lock().unwrap();
            let failed = *failing > 0;
            *failing = failing.saturating_sub(1);
            failed
        };
        if !failed {
            let mut commits = self.commits.lock().unwrap();
            for ((topic, partition), offset) in marked {
                commits.push((topic, partition, offset));
            }
        }

        self.committed.notify_waiters();
        if failed {
            return Err(MqError::connectivity("group coordinator", "not coordinator"));
        }
        Ok(())
    }
}

/// A partition claim fed from a fixed list of records.
pub struct ScriptedClaim {
    topic: String,
    partition: i32,
    records: VecDeque<ConsumerRecord>,
}

impl ScriptedClaim {
    pub fn new(topic: &str, partition: i32, records: Vec<ConsumerRecord>) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            records: records.into(),
        }
    }
}

#[async_trait]
impl PartitionClaim for ScriptedClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_record(&mut self) -> Option<ConsumerRecord> {
        self.records.pop_front()
    }

    fn buffered(&self) -> usize {
        self.records.len()
    }
}

pub fn records(topic: &str, partition: i32, offsets: std::ops::Range<i64>) -> Vec<ConsumerRecord> {
    offsets
        .map(|offset| {
            ConsumerRecord::new(topic, partition, offset, format!("msg-{offset}").into_bytes())
        })
        .collect()
}

/// One scripted session: claims handed out when `consume` runs.
pub type SessionScript = Vec<(String, i32, Vec<ConsumerRecord>)>;

#[derive(Default)]
struct GroupState {
    sessions: VecDeque<std::result::Result<SessionScript, MqError>>,
    consume_calls: usize,
    idle_calls: usize,
    topics_seen: Vec<Vec<String>>,
    closed: bool,
}

/// A consumer group that replays scripted sessions, then idles.
pub struct FakeGroup {
    state: Mutex<GroupState>,
    session: Arc<RecordingSession>,
    errors_tx: mpsc::UnboundedSender<MqError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<MqError>>>,
    idle: Notify,
}

impl FakeGroup {
    pub fn new() -> Arc<Self> {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(GroupState::default()),
            session: RecordingSession::new(),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            idle: Notify::new(),
        })
    }

    pub fn push_session(&self, script: SessionScript) {
        self.state.lock().unwrap().sessions.push_back(Ok(script));
    }

    pub fn push_failure(&self, error: MqError) {
        self.state.lock().unwrap().sessions.push_back(Err(error));
    }

    pub fn report_error(&self, error: MqError) {
        let _ = self.errors_tx.send(error);
    }

    pub fn session(&self) -> Arc<RecordingSession> {
        self.session.clone()
    }

    pub fn consume_calls(&self) -> usize {
        self.state.lock().unwrap().consume_calls
    }

    pub fn topics_seen(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().topics_seen.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Resolves once every scripted session has been played.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            {
                let state = self.state.lock().unwrap();
                if state.idle_calls > 0 {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl GroupConnection for FakeGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.consume_calls += 1;
            state.topics_seen.push(topics.to_vec());
            state.sessions.pop_front()
        };

        let script = match next {
            Some(Ok(script)) => script,
            Some(Err(e)) => return Err(e),
            None => {
                self.state.lock().unwrap().idle_calls += 1;
                self.idle.notify_waiters();
                cancel.cancelled().await;
                return Ok(());
            }
        };

        let session: Arc<dyn GroupSession> = self.session.clone();
        let mut claims = tokio::task::JoinSet::new();
        for (topic, partition, records) in script {
            let handler = handler.clone();
            let session = session.clone();
            let claim = Box::new(ScriptedClaim::new(&topic, partition, records));
            claims.spawn(async move { handler.consume_claim(session, claim).await });
        }
        while let Some(result) = claims.join_next().await {
            result.expect("claim task panicked")?;
        }
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<MqError>> {
        self.errors_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Hands out the same fake group for every group id.
pub struct FakeGroupConnector {
    pub group: Arc<FakeGroup>,
    pub connects: Mutex<Vec<String>>,
}

impl FakeGroupConnector {
    pub fn new(group: Arc<FakeGroup>) -> Arc<Self> {
        Arc::new(Self {
            group,
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl GroupConnector for FakeGroupConnector {
    async fn connect(&self, group_id: &str) -> Result<Arc<dyn GroupConnection>> {
        self.connects.lock().unwrap().push(group_id.to_string());
        Ok(self.group.clone())
    }
}

/// Cluster metadata with programmable answers.
#[derive(Default)]
pub struct FakeAdminConnector {
    pub connects: Mutex<usize>,
    pub answers: Mutex<VecDeque<Result<Option<i64>>>>,
    pub closed: Mutex<usize>,
}

impl FakeAdminConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, answer: Result<Option<i64>>) {
        self.answers.lock().unwrap().push_back(answer);
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }

    pub fn closed(&self) -> usize {
        *self.closed.lock().unwrap()
    }
}

struct FakeAdmin(Arc<FakeAdminConnector>);

#[async_trait]
impl AdminConnector for Arc<FakeAdminConnector> {
    async fn connect(&self) -> Result<Arc<dyn ClusterAdmin>> {
        *self.connects.lock().unwrap() += 1;
        Ok(Arc::new(FakeAdmin(self.clone())))
    }
}

#[async_trait]
impl ClusterAdmin for FakeAdmin {
    async fn committed_offset(&self, _group: &str, _topic: &str, _partition: i32) -> Result<Option<i64>> {
        self.0
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }

    async fn close(&self) -> Result<()> {
        *self.0.closed.lock().unwrap() += 1;
        Ok(())
    }
}
