//! Companion link channel.
//!
//! Architecture: reactor pattern, one task owns all channel state.
//! - `ConnectionState`, the `PendingQueue` and the pending-request table live
//!   in the reactor task and are mutated nowhere else
//! - caller commands and platform callbacks share one input queue, so their
//!   relative order is preserved
//! - replies are routed to callers via oneshot channels keyed by correlation id
//! - inbound events/requests go to a separate dispatcher task that runs the
//!   registered handler one message at a time, concurrently with outbound calls
//!
//! Delivery is best-effort: events queued while unreachable are flushed in
//! order on reconnect, and a message lost during a flush is not retried.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::link::message::{LinkMessage, Params};
use crate::link::protocol::{Event, FlatPayload, Request};
use crate::link::queue::PendingQueue;
use crate::link::transport::{LinkTransport, PlatformEvent, PlatformSink};

/// Platform activation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    NotActivated,
    Activating,
    Activated,
}

impl ActivationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationState::NotActivated => "not_activated",
            ActivationState::Activating => "activating",
            ActivationState::Activated => "activated",
        }
    }
}

/// Link connection state. Reachability is orthogonal to activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub activation: ActivationState,
    pub reachable: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            activation: ActivationState::NotActivated,
            reachable: false,
        }
    }
}

impl ConnectionState {
    /// Events can be sent right now instead of queued
    pub fn is_deliverable(&self) -> bool {
        self.activation == ActivationState::Activated && self.reachable
    }
}

/// Receiver for inbound events and requests
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_event(&self, kind: &str, params: &Params);

    /// Produce the reply payload for a request. `None` answers with an empty reply.
    async fn on_request(&self, kind: &str, params: &Params) -> Option<Params> {
        let _ = (kind, params);
        None
    }
}

/// Reactor input: caller commands and marshalled platform callbacks
pub(crate) enum ReactorInput {
    Command(LinkCommand),
    Platform(PlatformEvent),
}

pub(crate) enum LinkCommand {
    Activate,
    Request {
        message: LinkMessage,
        reply_tx: oneshot::Sender<Result<Params, LinkError>>,
    },
    Event(LinkMessage),
    Reply(LinkMessage),
    Flush,
    PendingLen(oneshot::Sender<usize>),
    Shutdown,
}

enum DispatchInput {
    Handler(Arc<dyn InboundHandler>),
    Message(LinkMessage),
}

/// The reactor task state
struct Reactor {
    name: String,
    transport: Arc<dyn LinkTransport>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    queue: PendingQueue,
    pending: HashMap<Uuid, oneshot::Sender<Result<Params, LinkError>>>,
    dispatch_tx: mpsc::UnboundedSender<DispatchInput>,
}

impl Reactor {
    async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<ReactorInput>, sweep_every: Duration) {
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        debug!("{}: Link reactor started", self.name);

        loop {
            tokio::select! {
                input = input_rx.recv() => {
                    match input {
                        Some(ReactorInput::Platform(event)) => self.on_platform(event).await,
                        Some(ReactorInput::Command(LinkCommand::Shutdown)) => {
                            info!("{}: Link shutting down, failing {} pending requests", self.name, self.pending.len());
                            break;
                        }
                        Some(ReactorInput::Command(command)) => self.on_command(command).await,
                        None => {
                            info!("{}: Input closed, link reactor exiting", self.name);
                            break;
                        }
                    }
                }

                _ = sweep.tick() => self.sweep(),
            }
        }

        for (id, reply_tx) in self.pending.drain() {
            trace!("{}: Failing request {} on shutdown", self.name, id);
            let _ = reply_tx.send(Err(LinkError::Closed));
        }
        debug!("{}: Link reactor exiting", self.name);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state);
    }

    async fn on_platform(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::Activation(activation) => {
                let previous = self.state.activation;
                if previous == ActivationState::Activated && activation != ActivationState::Activated {
                    warn!(
                        "{}: Ignoring activation regression to {}",
                        self.name,
                        activation.as_str()
                    );
                    return;
                }
                self.state.activation = activation;
                self.publish();
                info!("{}: Activation {} -> {}", self.name, previous.as_str(), activation.as_str());

                if activation == ActivationState::Activated && previous != ActivationState::Activated {
                    self.flush().await;
                }
            }
            PlatformEvent::Reachability(reachable) => {
                let previous = self.state.reachable;
                self.state.reachable = reachable;
                self.publish();
                if previous != reachable {
                    info!("{}: Companion reachable={}", self.name, reachable);
                }
                if reachable && !previous {
                    self.flush().await;
                }
            }
            PlatformEvent::Frame(frame) => {
                let message = match LinkMessage::from_frame(frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("{}: Dropping malformed inbound message: {}", self.name, e);
                        return;
                    }
                };
                self.on_inbound(message);
            }
        }
    }

    fn on_inbound(&mut self, message: LinkMessage) {
        match message {
            LinkMessage::Reply { id, kind, payload } => match self.pending.remove(&id) {
                Some(reply_tx) => {
                    trace!("{}: Reply for {} ({})", self.name, id, kind);
                    let _ = reply_tx.send(Ok(payload));
                }
                None => {
                    debug!(
                        "{}: Discarding orphan reply {} ({}), {} pending",
                        self.name,
                        id,
                        kind,
                        self.pending.len()
                    );
                }
            },
            other => {
                if self.dispatch_tx.send(DispatchInput::Message(other)).is_err() {
                    warn!("{}: Inbound dispatcher gone, dropping message", self.name);
                }
            }
        }
    }

    async fn on_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Activate => self.activate().await,
            LinkCommand::Request { message, reply_tx } => self.send_request(message, reply_tx).await,
            LinkCommand::Event(message) => self.send_event(message).await,
            LinkCommand::Reply(message) => {
                if !self.state.reachable {
                    debug!("{}: Unreachable, dropping reply to '{}'", self.name, message.kind());
                    return;
                }
                if let Err(e) = self.transport.send(message.to_frame()).await {
                    debug!("{}: Reply to '{}' failed: {}", self.name, message.kind(), e);
                }
            }
            LinkCommand::Flush => self.flush().await,
            LinkCommand::PendingLen(tx) => {
                let _ = tx.send(self.queue.len());
            }
            LinkCommand::Shutdown => {}
        }
    }

    async fn activate(&mut self) {
        if self.state.activation != ActivationState::NotActivated {
            debug!("{}: Activation already {}", self.name, self.state.activation.as_str());
            return;
        }
        self.state.activation = ActivationState::Activating;
        self.publish();
        info!("{}: Activating companion link", self.name);

        if let Err(e) = self.transport.activate().await {
            warn!("{}: Activation failed: {}", self.name, e);
            if self.state.activation == ActivationState::Activating {
                self.state.activation = ActivationState::NotActivated;
                self.publish();
            }
        }
    }

    async fn send_request(
        &mut self,
        message: LinkMessage,
        reply_tx: oneshot::Sender<Result<Params, LinkError>>,
    ) {
        let id = match &message {
            LinkMessage::Request { id, .. } => *id,
            _ => {
                let _ = reply_tx.send(Err(LinkError::Serialization(
                    "only requests expect a reply".to_string(),
                )));
                return;
            }
        };

        // Requests are never queued: once a reply matters they are not safely retryable
        if !self.state.reachable {
            debug!("{}: Request '{}' rejected, companion unreachable", self.name, message.kind());
            let _ = reply_tx.send(Err(LinkError::Unavailable));
            return;
        }

        match self.transport.send(message.to_frame()).await {
            Ok(()) => {
                self.pending.insert(id, reply_tx);
                trace!("{}: Request {} registered, {} pending", self.name, id, self.pending.len());
            }
            Err(e) => {
                warn!("{}: Send failed for request {}: {}", self.name, id, e);
                let _ = reply_tx.send(Err(e));
            }
        }
    }

    async fn send_event(&mut self, message: LinkMessage) {
        if !self.state.is_deliverable() || !self.queue.is_empty() {
            self.queue.push(message);
            debug!("{}: Event queued, {} pending", self.name, self.queue.len());
            // Earlier queued events must go first
            self.flush().await;
            return;
        }

        if let Err(e) = self.transport.send(message.to_frame()).await {
            debug!("{}: Direct send of '{}' failed ({}), queueing", self.name, message.kind(), e);
            self.queue.push(message);
        }
    }

    /// Drain the queue in insertion order. Stops at the first failed send; the
    /// failed message is dropped, unattempted ones stay queued.
    async fn flush(&mut self) {
        if !self.state.is_deliverable() || self.queue.is_empty() {
            return;
        }

        let total = self.queue.len();
        let mut sent = 0;
        while let Some(message) = self.queue.pop_front() {
            match self.transport.send(message.to_frame()).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(
                        "{}: Flush dropped '{}' after {} of {} sent: {}",
                        self.name,
                        message.kind(),
                        sent,
                        total,
                        e
                    );
                    break;
                }
            }
        }
        info!("{}: Flushed {} of {} queued events", self.name, sent, total);
    }

    fn sweep(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, reply_tx| !reply_tx.is_closed());
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!("{}: Swept {} abandoned requests, {} remaining", self.name, expired, self.pending.len());
        }
    }
}

async fn dispatch_task(
    mut rx: mpsc::UnboundedReceiver<DispatchInput>,
    reactor_tx: mpsc::UnboundedSender<ReactorInput>,
    name: String,
) {
    let mut handler: Option<Arc<dyn InboundHandler>> = None;
    let mut backlog: VecDeque<LinkMessage> = VecDeque::new();

    while let Some(input) = rx.recv().await {
        match input {
            DispatchInput::Handler(new_handler) => {
                debug!("{}: Inbound handler registered, {} buffered", name, backlog.len());
                while let Some(message) = backlog.pop_front() {
                    deliver(new_handler.as_ref(), message, &reactor_tx).await;
                }
                handler = Some(new_handler);
            }
            DispatchInput::Message(message) => match &handler {
                Some(handler) => deliver(handler.as_ref(), message, &reactor_tx).await,
                None => backlog.push_back(message),
            },
        }
    }
}

async fn deliver(
    handler: &dyn InboundHandler,
    message: LinkMessage,
    reactor_tx: &mpsc::UnboundedSender<ReactorInput>,
) {
    match message {
        LinkMessage::Event { kind, params } => handler.on_event(&kind, &params).await,
        LinkMessage::Request { id, kind, params } => {
            let payload = handler.on_request(&kind, &params).await.unwrap_or_default();
            let reply = LinkMessage::reply(id, kind, payload);
            let _ = reactor_tx.send(ReactorInput::Command(LinkCommand::Reply(reply)));
        }
        LinkMessage::Reply { .. } => {}
    }
}

/// Handle to a running link channel. Cheap to clone; all clones drive the
/// same reactor.
#[derive(Clone)]
pub struct LinkChannel {
    name: Arc<str>,
    input_tx: mpsc::UnboundedSender<ReactorInput>,
    dispatch_tx: mpsc::UnboundedSender<DispatchInput>,
    state_rx: watch::Receiver<ConnectionState>,
    request_timeout: Duration,
}

impl LinkChannel {
    /// Bind the transport and spawn the reactor and dispatcher tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(name: &str, transport: Arc<dyn LinkTransport>, config: &LinkConfig) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        transport.bind(PlatformSink::new(input_tx.clone()));

        tokio::spawn(dispatch_task(dispatch_rx, input_tx.clone(), name.to_string()));

        let reactor = Reactor {
            name: name.to_string(),
            transport,
            state: ConnectionState::default(),
            state_tx,
            queue: PendingQueue::new(),
            pending: HashMap::new(),
            dispatch_tx: dispatch_tx.clone(),
        };
        tokio::spawn(reactor.run(input_rx, config.sweep_interval()));

        Self {
            name: Arc::from(name),
            input_tx,
            dispatch_tx,
            state_rx,
            request_timeout: config.request_timeout(),
        }
    }

    fn command(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.input_tx
            .send(ReactorInput::Command(command))
            .map_err(|_| LinkError::Closed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Trigger platform activation. Idempotent.
    pub fn activate(&self) -> Result<(), LinkError> {
        self.command(LinkCommand::Activate)
    }

    /// Send a request and wait for the reply. Fails fast with
    /// `LinkError::Unavailable` when the companion is unreachable.
    pub async fn send_request(
        &self,
        kind: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Params, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(LinkCommand::Request {
            message: LinkMessage::request(kind, params),
            reply_tx,
        })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                debug!("{}: Request '{}' timed out after {:?}", self.name, kind, timeout);
                Err(LinkError::Timeout(timeout))
            }
        }
    }

    /// Typed request using the configured timeout
    pub async fn request<R: FlatPayload>(&self, request: &Request) -> Result<R, LinkError> {
        let payload = self
            .send_request(request.kind(), request.to_params(), self.request_timeout)
            .await?;
        R::from_params(&payload)
    }

    /// Fire-and-forget event. Queued while the companion is unreachable or the
    /// link is not yet activated; returns immediately either way.
    pub fn send_event(&self, kind: &str, params: Params) -> Result<(), LinkError> {
        self.command(LinkCommand::Event(LinkMessage::event(kind, params)))
    }

    /// Typed event
    pub fn send(&self, event: &Event) -> Result<(), LinkError> {
        self.send_event(event.kind(), event.to_params())
    }

    /// Drain queued events if the link is deliverable
    pub fn flush(&self) -> Result<(), LinkError> {
        self.command(LinkCommand::Flush)
    }

    /// Register the single inbound handler, replacing any previous one.
    /// Messages received before the first registration are buffered.
    pub fn on_inbound_message(&self, handler: Arc<dyn InboundHandler>) -> Result<(), LinkError> {
        self.dispatch_tx
            .send(DispatchInput::Handler(handler))
            .map_err(|_| LinkError::Closed)
    }

    /// Number of queued events
    pub async fn pending_len(&self) -> Result<usize, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.command(LinkCommand::PendingLen(tx))?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    /// Latest connection state
    pub fn connection(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Stop the reactor; outstanding requests fail with `LinkError::Closed`
    pub fn shutdown(&self) {
        let _ = self.command(LinkCommand::Shutdown);
    }
}
