//! Connection management: shared client state, connect/shutdown, and the
//! background driver that consumes transport events.

use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::ack::{AckTracker, Dispatch};
use crate::config::RealtimeOptions;
use crate::heartbeat::HeartbeatScheduler;
use crate::protocol::{ClientFrame, OutboundMessage, Reply, ServerFrame};
use crate::queue::{OutboundQueue, QueuedMessage};
use crate::registry::{self, Listener, ListenerId, SubscriptionRegistry};
use crate::state::ConnectionState;
use crate::transport::{ConnectRequest, Transport, TransportEvent};
use crate::types::{ClientStats, ConnectionChange, ConnectionStatus, Error};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long a background task waits on a reply that is only logged.
const REPLY_LOG_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback for connection status changes.
pub type ConnectionListener = Arc<dyn Fn(&ConnectionChange) + Send + Sync>;

type ConnectWaiter = oneshot::Sender<Result<(), Error>>;
type ConnectReceiver = oneshot::Receiver<Result<(), Error>>;

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// A status change captured under the lock and delivered after it is released.
#[must_use]
pub(crate) struct Notice {
    change: ConnectionChange,
    listeners: Vec<ConnectionListener>,
}

impl Notice {
    pub(crate) fn deliver(self) {
        for listener in &self.listeners {
            notify(listener, &self.change);
        }
    }
}

/// Invoke one connection listener, containing panics.
pub(crate) fn notify(listener: &ConnectionListener, change: &ConnectionChange) {
    if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
        tracing::error!(status = %change.status, "connection listener panicked");
    }
}

/// Why the connection is being torn down by the caller.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Shutdown {
    Disconnect,
    Reset,
}

impl Shutdown {
    fn connect_error(self) -> Error {
        match self {
            Self::Disconnect => Error::Closed,
            Self::Reset => Error::Reset,
        }
    }

    fn ack_error(self) -> Error {
        match self {
            Self::Disconnect => Error::Disconnected,
            Self::Reset => Error::Reset,
        }
    }
}

/// Outcome of a shutdown, settled outside the lock.
#[must_use]
pub(crate) struct Settled {
    notice: Option<Notice>,
    waiters: Vec<ConnectWaiter>,
    reason: Shutdown,
}

impl Settled {
    pub(crate) fn deliver(self) {
        for waiter in self.waiters {
            let _ = waiter.send(Err(self.reason.connect_error()));
        }
        if let Some(notice) = self.notice {
            notice.deliver();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

enum DriverSlot {
    Idle,
    /// `connect()` is fetching a token or opening the transport.
    Starting { epoch: u64 },
    Running {
        epoch: u64,
        close_tx: oneshot::Sender<()>,
    },
}

impl DriverSlot {
    fn epoch(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Starting { epoch } | Self::Running { epoch, .. } => Some(*epoch),
        }
    }
}

enum ConnectStep {
    Ready,
    Join(ConnectReceiver),
    Start {
        epoch: u64,
        options: RealtimeOptions,
        notice: Notice,
    },
}

/// All mutable client state. Lives behind one mutex that is never held
/// across an `.await` or while user callbacks run.
pub(crate) struct ConnectionManager {
    pub(crate) options: RealtimeOptions,
    pub(crate) state: ConnectionState,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) queue: OutboundQueue,
    pub(crate) tracker: AckTracker,
    listeners: Vec<(u64, ConnectionListener)>,
    next_listener_id: u64,
    driver: DriverSlot,
    /// Bumped per connect attempt; events from an older driver are ignored.
    epoch: u64,
    connect_waiters: Vec<ConnectWaiter>,
    last_shutdown: Shutdown,
}

impl ConnectionManager {
    fn new(options: RealtimeOptions) -> Self {
        Self {
            queue: OutboundQueue::new(options.max_queue_size),
            options,
            state: ConnectionState::new(),
            registry: SubscriptionRegistry::new(),
            tracker: AckTracker::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
            driver: DriverSlot::Idle,
            epoch: 0,
            connect_waiters: Vec::new(),
            last_shutdown: Shutdown::Disconnect,
        }
    }

    pub(crate) fn notice(&self, error: Option<String>) -> Notice {
        Notice {
            change: self.state.change(error),
            listeners: self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
        }
    }

    pub(crate) fn add_listener(&mut self, listener: ConnectionListener) -> u64 {
        self.next_listener_id += 1;
        self.listeners.push((self.next_listener_id, listener));
        self.next_listener_id
    }

    pub(crate) fn remove_listener(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub(crate) fn stats(&self) -> ClientStats {
        ClientStats {
            status: self.state.status(),
            subscriptions: self.registry.len(),
            queue_size: self.queue.len(),
            reconnect_count: self.state.reconnect_count(),
            pending_acks: self.tracker.len(),
        }
    }

    fn owns(&self, epoch: u64) -> bool {
        self.driver.epoch() == Some(epoch)
    }

    fn take_waiters(&mut self) -> Vec<ConnectWaiter> {
        mem::take(&mut self.connect_waiters)
    }

    fn begin_connect(&mut self) -> ConnectStep {
        if self.state.status().is_connected() {
            return ConnectStep::Ready;
        }
        if !matches!(self.driver, DriverSlot::Idle) {
            let (tx, rx) = oneshot::channel();
            self.connect_waiters.push(tx);
            return ConnectStep::Join(rx);
        }
        self.epoch += 1;
        self.driver = DriverSlot::Starting { epoch: self.epoch };
        self.state.transition(ConnectionStatus::Connecting);
        ConnectStep::Start {
            epoch: self.epoch,
            options: self.options.clone(),
            notice: self.notice(None),
        }
    }

    /// Stop the driver, close the transport and reject everything waiting on
    /// this connection.
    fn shutdown(&mut self, transport: &dyn Transport, reason: Shutdown) -> Settled {
        if let DriverSlot::Running { close_tx, .. } =
            mem::replace(&mut self.driver, DriverSlot::Idle)
        {
            let _ = close_tx.send(());
        }
        transport.close();
        self.last_shutdown = reason;

        self.reject_pending(|| reason.ack_error());

        let notice = self
            .state
            .transition(ConnectionStatus::Disconnected)
            .then(|| self.notice(None));
        Settled {
            notice,
            waiters: self.take_waiters(),
            reason,
        }
    }

    /// Reject every pending ack and drop their queued copies.
    fn reject_pending(&mut self, err: impl Fn() -> Error) {
        let rejected = self.tracker.reject_all(err);
        if !rejected.is_empty() {
            tracing::debug!(count = rejected.len(), "rejected pending acks");
        }
        self.queue.discard(&rejected);
    }

    /// Emit every queued message oldest first. On an emit failure the failed
    /// message and everything after it go back to the head of the queue.
    fn flush_queue(&mut self, transport: &dyn Transport) -> usize {
        let mut items = self.queue.drain().into_iter();
        let mut sent = 0;
        while let Some(item) = items.next() {
            match transport.emit(item.message.to_frame()) {
                Ok(()) => {
                    sent += 1;
                    item.mark_sent();
                }
                Err(e) => {
                    let mut rest = vec![item];
                    rest.extend(items);
                    tracing::warn!(error = %e, requeued = rest.len(), "queue flush interrupted");
                    self.queue.requeue_front(rest);
                    break;
                }
            }
        }
        sent
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Transport handle plus the locked manager. Owned by the client, borrowed by
/// the driver task, weakly referenced by handles.
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    manager: Mutex<ConnectionManager>,
}

/// How an un-acked publish left the client.
pub(crate) enum Unacked {
    Sent {
        reply: oneshot::Receiver<Reply>,
        timeout: Duration,
    },
    Queued,
}

impl Shared {
    pub(crate) fn new(transport: Arc<dyn Transport>, options: RealtimeOptions) -> Self {
        Self {
            transport,
            manager: Mutex::new(ConnectionManager::new(options)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionManager> {
        self.manager.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Lifecycle ---

    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let step = self.lock().begin_connect();
        let (epoch, options) = match step {
            ConnectStep::Ready => return Ok(()),
            ConnectStep::Join(rx) => {
                tracing::debug!("joining in-flight connect");
                return wait_connected(rx).await;
            }
            ConnectStep::Start {
                epoch,
                options,
                notice,
            } => {
                notice.deliver();
                (epoch, options)
            }
        };

        tracing::info!(url = %options.url, "connecting");
        match self.open(epoch, &options).await {
            Ok(rx) => wait_connected(rx).await,
            Err(e) => {
                self.abort_start(epoch, &e);
                Err(e)
            }
        }
    }

    /// Fetch the token, open the transport and spawn the driver.
    async fn open(
        self: &Arc<Self>,
        epoch: u64,
        options: &RealtimeOptions,
    ) -> Result<ConnectReceiver, Error> {
        let url = options.handshake_url()?;
        let token = match &options.auth {
            Some(auth) => Some(auth().await.map_err(Error::TokenFetch)?),
            None => None,
        };
        self.ensure_starting(epoch)?;

        let request = ConnectRequest {
            url,
            token,
            auth: options.auth.clone(),
            reconnect: options.reconnect.clone(),
        };
        tracing::debug!(?request, "opening transport");
        let events = self.transport.connect(request).await?;

        let (close_tx, close_rx) = oneshot::channel();
        let (tx, rx) = oneshot::channel();
        {
            let mut m = self.lock();
            if !m.owns(epoch) {
                let err = m.last_shutdown.connect_error();
                // a newer connect may already be using the transport
                if matches!(m.driver, DriverSlot::Idle) {
                    self.transport.close();
                }
                return Err(err);
            }
            m.driver = DriverSlot::Running { epoch, close_tx };
            m.connect_waiters.push(tx);
        }

        tokio::spawn(run_driver(Driver {
            shared: Arc::clone(self),
            epoch,
            events,
            close_rx,
            heartbeat: HeartbeatScheduler::new(options.heartbeat_interval),
        }));
        Ok(rx)
    }

    fn ensure_starting(&self, epoch: u64) -> Result<(), Error> {
        let m = self.lock();
        if m.owns(epoch) {
            Ok(())
        } else {
            Err(m.last_shutdown.connect_error())
        }
    }

    /// Roll back a connect that failed before the driver started.
    fn abort_start(&self, epoch: u64, err: &Error) {
        let (notices, waiters) = {
            let mut m = self.lock();
            if !m.owns(epoch) {
                return;
            }
            m.driver = DriverSlot::Idle;
            let failed = m.notice(Some(err.to_string()));
            m.state.transition(ConnectionStatus::Disconnected);
            ([failed, m.notice(None)], m.take_waiters())
        };
        tracing::warn!(error = %err, "connect failed");
        let reason = err.to_string();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Connection(reason.clone())));
        }
        for notice in notices {
            notice.deliver();
        }
    }

    pub(crate) fn disconnect(&self) {
        let settled = self.lock().shutdown(&*self.transport, Shutdown::Disconnect);
        settled.deliver();
    }

    /// Disconnect, swap in `options` and clear topics, queue and pending acks.
    /// Connection listeners are kept.
    pub(crate) fn reinit(&self, options: RealtimeOptions) {
        let settled = {
            let mut m = self.lock();
            let settled = m.shutdown(&*self.transport, Shutdown::Reset);
            m.queue.clear_with(|| Error::Reset);
            m.queue.set_max_size(options.max_queue_size);
            m.registry.clear();
            m.state = ConnectionState::new();
            m.options = options;
            settled
        };
        tracing::debug!("client reinitialized");
        settled.deliver();
    }

    /// Disconnect and drop every collection, connection listeners included.
    pub(crate) fn destroy(&self) {
        let settled = {
            let mut m = self.lock();
            let settled = m.shutdown(&*self.transport, Shutdown::Disconnect);
            m.queue.clear_with(|| Error::Closed);
            m.registry.clear();
            m.listeners.clear();
            settled
        };
        settled.deliver();
    }

    // --- Subscriptions ---

    pub(crate) fn subscribe(&self, topic: &str, listener: Listener) -> ListenerId {
        let mut m = self.lock();
        let (id, created) = m.registry.add(topic, listener);
        if created {
            tracing::debug!(topic, "topic registered");
            if m.state.status().is_connected() {
                self.emit_subscribe(topic);
            }
        }
        id
    }

    fn emit_subscribe(&self, topic: &str) {
        match self.transport.emit_with_reply(ClientFrame::subscribe(topic)) {
            Ok(reply) => log_reply("subscribe", topic.to_string(), reply),
            Err(e) => tracing::warn!(topic, error = %e, "subscribe emit failed"),
        }
    }

    // --- Publishing ---

    pub(crate) fn send_unacked(&self, message: OutboundMessage) -> Result<Unacked, Error> {
        let mut m = self.lock();
        if m.state.status().is_connected() {
            match self.transport.emit_with_reply(message.to_frame()) {
                Ok(reply) => {
                    tracing::debug!(id = %message.id, topic = %message.topic, "publish sent");
                    return Ok(Unacked::Sent {
                        reply,
                        timeout: m.options.ack.timeout(),
                    });
                }
                Err(e) => {
                    tracing::warn!(id = %message.id, error = %e, "emit failed, queueing publish");
                }
            }
        }

        let id = message.id.clone();
        let evicted = m.queue.enqueue(QueuedMessage::new(message, None));
        if evicted.contains(&id) {
            return Err(Error::QueueOverflow { id });
        }
        tracing::debug!(id = %id, queue_size = m.queue.len(), "publish queued");
        Ok(Unacked::Queued)
    }

    /// One attempt of an ack-tracked publish: emit when connected, else queue.
    pub(crate) fn send_attempt(
        &self,
        message: &OutboundMessage,
        attempt: u32,
    ) -> Result<Dispatch, Error> {
        let mut m = self.lock();
        if m.tracker.record_attempt(&message.id).is_none() {
            return Ok(Dispatch::Skipped);
        }
        if m.state.status().is_connected() {
            match self.transport.emit_with_reply(message.to_frame()) {
                Ok(reply) => {
                    tracing::debug!(id = %message.id, topic = %message.topic, attempt, "publish sent");
                    log_reply("publish", message.topic.clone(), reply);
                    return Ok(Dispatch::Sent);
                }
                Err(e) => {
                    tracing::warn!(id = %message.id, attempt, error = %e, "emit failed, queueing publish");
                }
            }
        }

        if m.queue.contains(&message.id) {
            tracing::debug!(id = %message.id, attempt, "earlier copy still queued");
            return Ok(Dispatch::StillQueued);
        }
        let (tx, rx) = oneshot::channel();
        m.queue
            .enqueue(QueuedMessage::new(message.clone(), Some(tx)));
        tracing::debug!(id = %message.id, attempt, queue_size = m.queue.len(), "publish queued");
        Ok(Dispatch::Queued(rx))
    }
}

async fn wait_connected(rx: ConnectReceiver) -> Result<(), Error> {
    rx.await.unwrap_or(Err(Error::Closed))
}

/// Await a server reply in the background and log it. Failures never reach
/// the caller that emitted the frame.
fn log_reply(kind: &'static str, topic: String, reply: oneshot::Receiver<Reply>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::debug!(kind, topic = %topic, "no runtime, reply ignored");
        return;
    };
    handle.spawn(async move {
        match tokio::time::timeout(REPLY_LOG_TIMEOUT, reply).await {
            Ok(Ok(r)) if r.is_success() => tracing::debug!(
                kind,
                topic = %topic,
                subscribers = ?r.subscriber_count,
                delivered_to = ?r.delivered_to,
                "server accepted"
            ),
            Ok(Ok(r)) => tracing::warn!(kind, topic = %topic, error = ?r.error, "server rejected"),
            Ok(Err(_)) => tracing::debug!(kind, topic = %topic, "reply dropped"),
            Err(_) => tracing::debug!(kind, topic = %topic, "no reply"),
        }
    });
}

// ---------------------------------------------------------------------------
// Background driver
// ---------------------------------------------------------------------------

struct Driver {
    shared: Arc<Shared>,
    epoch: u64,
    events: mpsc::Receiver<TransportEvent>,
    close_rx: oneshot::Receiver<()>,
    heartbeat: HeartbeatScheduler,
}

enum LoopAction {
    Continue,
    Stop,
}

async fn run_driver(mut d: Driver) {
    tracing::debug!(epoch = d.epoch, "driver started");
    loop {
        let action = tokio::select! {
            biased;

            _ = &mut d.close_rx => {
                tracing::debug!(epoch = d.epoch, "close requested");
                LoopAction::Stop
            }

            event = d.events.recv() => match event {
                Some(event) => d.handle_event(event),
                None => d.give_up("transport event stream ended".to_string()),
            },

            _ = d.heartbeat.tick() => d.send_heartbeat(),
        };
        if let LoopAction::Stop = action {
            break;
        }
    }
    d.heartbeat.stop();
    tracing::debug!(epoch = d.epoch, "driver stopped");
}

impl Driver {
    fn handle_event(&mut self, event: TransportEvent) -> LoopAction {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason),
            TransportEvent::ConnectError { message } => {
                tracing::warn!(error = %message, "connect error");
                self.report(message)
            }
            TransportEvent::ReconnectAttempt { attempt } => self.on_reconnect_attempt(attempt),
            TransportEvent::ReconnectFailed => self.give_up("reconnection failed".to_string()),
            TransportEvent::Frame(frame) => self.on_frame(frame),
        }
    }

    fn on_connected(&mut self) -> LoopAction {
        let shared = Arc::clone(&self.shared);
        let (notice, waiters) = {
            let mut m = shared.lock();
            if !m.owns(self.epoch) {
                return LoopAction::Stop;
            }
            m.state.transition(ConnectionStatus::Connected);
            let topics = m.registry.topics();
            for topic in &topics {
                shared.emit_subscribe(topic);
            }
            let flushed = m.flush_queue(&*shared.transport);
            tracing::info!(
                topics = topics.len(),
                flushed,
                still_queued = m.queue.len(),
                "connected"
            );
            (m.notice(None), m.take_waiters())
        };
        self.heartbeat.start();
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        notice.deliver();
        LoopAction::Continue
    }

    fn on_disconnected(&mut self, reason: Option<String>) -> LoopAction {
        self.heartbeat.stop();
        let reason = reason.unwrap_or_else(|| "transport disconnected".to_string());
        let shared = Arc::clone(&self.shared);
        let mut m = shared.lock();
        if !m.owns(self.epoch) {
            return LoopAction::Stop;
        }

        if m.options.reconnect.enabled {
            tracing::warn!(reason = %reason, "connection lost, transport will reconnect");
            m.state.transition(ConnectionStatus::Reconnecting);
            let notice = m.notice(None);
            drop(m);
            notice.deliver();
            return LoopAction::Continue;
        }

        tracing::warn!(reason = %reason, "connection lost, reconnection disabled");
        m.driver = DriverSlot::Idle;
        m.reject_pending(|| Error::Connection(reason.clone()));
        m.state.transition(ConnectionStatus::Disconnected);
        let notice = m.notice(None);
        let waiters = m.take_waiters();
        drop(m);

        shared.transport.close();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Connection(reason.clone())));
        }
        notice.deliver();
        LoopAction::Stop
    }

    fn on_reconnect_attempt(&mut self, reported: u32) -> LoopAction {
        let shared = Arc::clone(&self.shared);
        let mut m = shared.lock();
        if !m.owns(self.epoch) {
            return LoopAction::Stop;
        }
        if m
            .options
            .reconnect
            .is_exhausted(m.state.reconnect_attempt().saturating_add(1))
        {
            drop(m);
            return self.give_up("reconnection attempts exhausted".to_string());
        }
        let attempt = m.state.record_reconnect_attempt();
        if attempt != reported {
            tracing::debug!(attempt, reported, "transport attempt numbering differs");
        }

        let delay = m.options.reconnect.delay_for(attempt);
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect attempt"
        );
        let notice = m.notice(None);
        drop(m);
        notice.deliver();
        LoopAction::Continue
    }

    /// Terminal failure: close the transport, reject pending acks, report, and
    /// settle at `disconnected`.
    fn give_up(&mut self, reason: String) -> LoopAction {
        self.heartbeat.stop();
        let shared = Arc::clone(&self.shared);
        let (notices, waiters) = {
            let mut m = shared.lock();
            if !m.owns(self.epoch) {
                return LoopAction::Stop;
            }
            tracing::error!(
                attempts = m.state.reconnect_attempt(),
                reason = %reason,
                "giving up on connection"
            );
            m.driver = DriverSlot::Idle;
            shared.transport.close();
            m.reject_pending(|| Error::Connection(reason.clone()));
            let failed = m.notice(Some(reason.clone()));
            m.state.transition(ConnectionStatus::Disconnected);
            ([failed, m.notice(None)], m.take_waiters())
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::Connection(reason.clone())));
        }
        for notice in notices {
            notice.deliver();
        }
        LoopAction::Stop
    }

    /// Report an error to listeners without changing the held status.
    fn report(&self, error: String) -> LoopAction {
        let notice = {
            let m = self.shared.lock();
            if !m.owns(self.epoch) {
                return LoopAction::Stop;
            }
            m.notice(Some(error))
        };
        notice.deliver();
        LoopAction::Continue
    }

    fn on_frame(&mut self, frame: ServerFrame) -> LoopAction {
        match frame {
            ServerFrame::Event(event) => {
                let listeners = self.shared.lock().registry.listeners(&event.topic);
                if listeners.is_empty() {
                    tracing::debug!(topic = %event.topic, "event for unsubscribed topic dropped");
                } else {
                    registry::dispatch(&listeners, &event);
                }
            }
            ServerFrame::Ack(ack) => {
                let id = ack.id.clone();
                if !self.shared.lock().tracker.resolve(ack) {
                    tracing::debug!(id = %id, "ack for unknown message");
                }
            }
            ServerFrame::HeartbeatAck(_) => tracing::trace!("heartbeat acknowledged"),
            ServerFrame::Error(err) => {
                tracing::warn!(code = err.code, message = %err.message, "server error");
                return self.report(format!("server error {}: {}", err.code, err.message));
            }
        }
        LoopAction::Continue
    }

    fn send_heartbeat(&self) -> LoopAction {
        match self.shared.transport.emit(ClientFrame::heartbeat()) {
            Ok(()) => tracing::trace!("heartbeat sent"),
            Err(e) => tracing::warn!(error = %e, "heartbeat emit failed"),
        }
        LoopAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::transport::TransportError;

    /// Accepts the first `accept` emits, then refuses.
    struct FlakyTransport {
        accept: usize,
        emitted: Mutex<Vec<ClientFrame>>,
        closes: Mutex<usize>,
    }

    impl FlakyTransport {
        fn new(accept: usize) -> Self {
            Self {
                accept,
                emitted: Mutex::default(),
                closes: Mutex::default(),
            }
        }

        fn payloads(&self) -> Vec<Value> {
            self.emitted
                .lock()
                .unwrap()
                .iter()
                .filter_map(|f| match f {
                    ClientFrame::Publish(p) => Some(p.payload.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn connect(
            &self,
            _request: ConnectRequest,
        ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
            Err(TransportError::Other("not used".to_string()))
        }

        fn emit(&self, frame: ClientFrame) -> Result<(), TransportError> {
            let mut emitted = self.emitted.lock().unwrap();
            if emitted.len() >= self.accept {
                return Err(TransportError::NotConnected);
            }
            emitted.push(frame);
            Ok(())
        }

        fn emit_with_reply(
            &self,
            frame: ClientFrame,
        ) -> Result<oneshot::Receiver<Reply>, TransportError> {
            self.emit(frame)?;
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Reply::success());
            Ok(rx)
        }

        fn close(&self) {
            *self.closes.lock().unwrap() += 1;
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(RealtimeOptions::new("wss://rt.example.com/socket"))
    }

    fn queued(id: &str, payload: Value, ack_required: bool) -> QueuedMessage {
        QueuedMessage::new(
            OutboundMessage::new("t", payload, Some(id.to_string()), ack_required),
            None,
        )
    }

    #[test]
    fn begin_connect_starts_once_then_joins() {
        let mut m = manager();
        match m.begin_connect() {
            ConnectStep::Start { epoch, notice, .. } => {
                assert_eq!(epoch, 1);
                assert_eq!(notice.change.status, ConnectionStatus::Connecting);
            }
            _ => panic!("expected a fresh start"),
        }
        assert!(m.owns(1));
        assert!(matches!(m.begin_connect(), ConnectStep::Join(_)));
        assert_eq!(m.connect_waiters.len(), 1);

        m.state.transition(ConnectionStatus::Connected);
        assert!(matches!(m.begin_connect(), ConnectStep::Ready));
    }

    #[test]
    fn shutdown_settles_waiters_and_rejects_acks() {
        let transport = FlakyTransport::new(0);
        let mut m = manager();
        let _ = m.begin_connect();
        let mut joined = match m.begin_connect() {
            ConnectStep::Join(rx) => rx,
            _ => panic!("expected to join the running connect"),
        };
        let mut ack = m.tracker.register("m-1", "t").unwrap();
        m.queue.enqueue(queued("m-1", Value::Null, true));
        m.queue.enqueue(queued("m-2", Value::Null, false));

        m.shutdown(&transport, Shutdown::Disconnect).deliver();

        assert!(matches!(joined.try_recv(), Ok(Err(Error::Closed))));
        assert!(matches!(ack.try_recv(), Ok(Err(Error::Disconnected))));
        assert_eq!(m.tracker.len(), 0);
        assert_eq!(m.queue.len(), 1, "unacked message survives");
        assert!(m.queue.contains("m-2"));
        assert!(!m.owns(1));
        assert_eq!(m.state.status(), ConnectionStatus::Disconnected);
        assert_eq!(*transport.closes.lock().unwrap(), 1);
    }

    #[test]
    fn reset_shutdown_rejects_with_reset() {
        let transport = FlakyTransport::new(0);
        let mut m = manager();
        let _ = m.begin_connect();
        let mut joined = match m.begin_connect() {
            ConnectStep::Join(rx) => rx,
            _ => panic!("expected to join the running connect"),
        };
        let mut ack = m.tracker.register("m-1", "t").unwrap();

        m.shutdown(&transport, Shutdown::Reset).deliver();

        assert!(matches!(joined.try_recv(), Ok(Err(Error::Reset))));
        assert!(matches!(ack.try_recv(), Ok(Err(Error::Reset))));
    }

    #[test]
    fn flush_requeues_the_failed_tail_in_order() {
        let transport = FlakyTransport::new(2);
        let mut m = manager();
        for n in 1..=4 {
            m.queue.enqueue(queued(&format!("m-{n}"), json!(n), false));
        }

        assert_eq!(m.flush_queue(&transport), 2);
        assert_eq!(transport.payloads(), vec![json!(1), json!(2)]);
        let rest: Vec<Value> = m
            .queue
            .drain()
            .into_iter()
            .map(|item| item.message.payload)
            .collect();
        assert_eq!(rest, vec![json!(3), json!(4)]);
    }

    #[test]
    fn stats_reflect_collections() {
        let mut m = manager();
        m.registry.add("a", Arc::new(|_: &crate::InboundEvent| {}));
        m.queue.enqueue(queued("m-1", Value::Null, false));
        let _rx = m.tracker.register("m-2", "a").unwrap();

        let stats = m.stats();
        assert_eq!(stats.status, ConnectionStatus::Disconnected);
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.pending_acks, 1);
    }
}
