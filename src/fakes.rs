// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. It enforces the same
//! redeclaration rules RabbitMQ does and records every ack, nack and qos call.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, ConsumerMessage, HandlerError},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, ClosureNotifier, ClosureSignal, Delivery, DeliveryAcker,
        DeliveryStream, Dialer,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack(u64),
    Nack { delivery_tag: u64, requeue: bool },
}

#[derive(Default)]
pub(crate) struct BrokerState {
    pub exchanges: BTreeMap<String, ExchangeDefinition>,
    pub queues: BTreeMap<String, QueueDefinition>,
    pub bindings: BTreeSet<QueueBinding>,
    pub qos: Vec<u16>,
    pub consume_calls: Vec<String>,
    pub consumers: BTreeMap<String, mpsc::UnboundedSender<Result<Delivery, AmqpError>>>,
    pub settlements: Vec<Settlement>,
    pub channels_opened: usize,
    pub channels_closed: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn connection(&self) -> Arc<FakeConnection> {
        let (notifier, signal) = ClosureSignal::channel();
        Arc::new(FakeConnection {
            broker: self.clone(),
            connected: AtomicBool::new(true),
            refuse_channels: AtomicBool::new(false),
            notifier,
            signal,
        })
    }

    pub fn channel(&self) -> Arc<FakeChannel> {
        self.state().channels_opened += 1;
        Arc::new(FakeChannel {
            broker: self.clone(),
            open: AtomicBool::new(true),
        })
    }

    /// A delivery whose settlement is recorded on this broker.
    pub fn delivery(&self, delivery_tag: u64, content_type: Option<&str>, data: &[u8]) -> Delivery {
        let acker = Arc::new(FakeAcker {
            broker: self.clone(),
            delivery_tag,
        });
        let delivery = Delivery::new(delivery_tag, data.to_vec(), acker)
            .with_routing("orders-exchange", "orders.created");
        match content_type {
            Some(content_type) => delivery.with_content_type(content_type),
            None => delivery,
        }
    }

    /// Pushes a delivery to the consumer registered under `tag`.
    pub fn deliver(&self, tag: &str, delivery: Delivery) -> bool {
        match self.state().consumers.get(tag) {
            Some(tx) => tx.send(Ok(delivery)).is_ok(),
            None => false,
        }
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    /// Polls `check` until it holds or two seconds pass.
    pub async fn eventually(&self, check: impl Fn(&BrokerState) -> bool) -> bool {
        for _ in 0..200 {
            if check(&self.state()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub(crate) struct FakeConnection {
    broker: FakeBroker,
    connected: AtomicBool,
    refuse_channels: AtomicBool,
    notifier: ClosureNotifier,
    signal: ClosureSignal,
}

impl FakeConnection {
    /// Simulates the broker or network dropping the connection.
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.broker.state().consumers.clear();
        self.notifier.notify(reason.to_owned());
    }

    pub fn refuse_channels(&self) {
        self.refuse_channels.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn closure_signal(&self) -> ClosureSignal {
        self.signal.clone()
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }
        if self.refuse_channels.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("channel limit reached".to_owned()));
        }
        Ok(self.broker.channel())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    broker: FakeBroker,
    open: AtomicBool,
}

impl FakeChannel {
    fn fail<T>(&self, err: AmqpError) -> Result<T, AmqpError> {
        // RabbitMQ closes the channel on a precondition failure
        self.open.store(false, Ordering::SeqCst);
        Err(err)
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::QoSDeclarationError("channel closed".to_owned()));
        }
        self.broker.state().qos.push(prefetch_count);
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        if state.exchanges.get(def.name()).is_some_and(|existing| existing != def) {
            return self.fail(AmqpError::DeclareExchangeError(
                def.name().to_owned(),
                "PRECONDITION_FAILED - inequivalent arg".to_owned(),
            ));
        }
        state.exchanges.insert(def.name().to_owned(), def.clone());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        if state.queues.get(def.name()).is_some_and(|existing| existing != def) {
            return self.fail(AmqpError::DeclareQueueError(
                def.name().to_owned(),
                "PRECONDITION_FAILED - inequivalent arg".to_owned(),
            ));
        }
        state.queues.insert(def.name().to_owned(), def.clone());
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue_name())
        {
            return self.fail(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name().to_owned(),
                binding.queue_name().to_owned(),
                "NOT_FOUND".to_owned(),
            ));
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.broker.state();
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ConsumerDeclarationError(
                consumer_tag.to_owned(),
                "NOT_FOUND".to_owned(),
            ));
        }
        if state
            .consumers
            .get(consumer_tag)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(AmqpError::ConsumerDeclarationError(
                consumer_tag.to_owned(),
                "NOT_ALLOWED - reused consumer tag".to_owned(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.insert(consumer_tag.to_owned(), tx);
        state.consume_calls.push(consumer_tag.to_owned());

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.broker.state();
        state.channels_closed += 1;
        state.consumers.clear();
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
    delivery_tag: u64,
}

#[async_trait]
impl DeliveryAcker for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker
            .state()
            .settlements
            .push(Settlement::Ack(self.delivery_tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.state().settlements.push(Settlement::Nack {
            delivery_tag: self.delivery_tag,
            requeue,
        });
        Ok(())
    }
}

/// Dialer handing out fresh fake connections on the same broker.
pub(crate) struct FakeDialer {
    broker: FakeBroker,
    pub dials: AtomicUsize,
    pub failures: AtomicUsize,
    stall_ms: AtomicU64,
    refuse_channels: AtomicBool,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeDialer {
    pub fn new(broker: &FakeBroker) -> Self {
        FakeDialer {
            broker: broker.clone(),
            dials: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            stall_ms: AtomicU64::new(0),
            refuse_channels: AtomicBool::new(false),
            connections: Mutex::new(vec![]),
        }
    }

    /// Makes the next `count` dials fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Makes every dial hang for `delay` before answering, like a SYN lost
    /// on the way to an unreachable host.
    pub fn stall(&self, delay: Duration) {
        self.stall_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every connection dialed from now on refuses to open channels.
    pub fn refuse_channels(&self) {
        self.refuse_channels.store(true, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, _uri: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let conn = self.broker.connection();
        if self.refuse_channels.load(Ordering::SeqCst) {
            conn.refuse_channels();
        }
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

/// Handler recording each body it sees. Bodies equal to `b"fail"` fail.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub seen: Mutex<Vec<(String, Vec<u8>)>>,
    pub started: AtomicUsize,
    pub delay: Duration,
}

impl RecordingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        RecordingHandler {
            delay,
            ..Default::default()
        }
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage<'_>) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen
            .lock()
            .unwrap()
            .push((msg.consumer_tag.to_owned(), msg.data.to_vec()));

        if msg.data == b"fail" {
            return Err(HandlerError::new("refusing poisoned body"));
        }
        Ok(())
    }
}
