//! Connection actor and the client handle that talks to it.
//!
//! One spawned task owns the transport. It is the only writer of the
//! connection state, resolves pending requests, activates subscriptions,
//! routes pushes, sends heartbeats and reconnects with backoff. Callers hold
//! a cheap [`ApiClient`] clone and talk to the actor over a command channel.

use crate::config::ConnectionConfig;
use crate::error::{AppError, Result};
use crate::types::{
    encode_request, ConnectionEvent, ConnectionState, ForgetRequest, InboundMessage, PingRequest,
    Route,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::correlator::{Correlator, PendingRequest, PendingSubscription};
use super::registry::{deliver, Activation, PushHandler, SubscriptionRegistry};
use super::transport::{Connector, Frame, Link, LinkEvent};

enum Command {
    Connect,
    Send { req_id: u64, text: String },
    Disconnect { done: oneshot::Sender<()> },
}

/// State shared between the actor and every client handle.
struct Shared {
    correlator: Correlator,
    registry: SubscriptionRegistry,
    /// Replayed first after a reconnect.
    auth_request: Mutex<Option<Value>>,
    last_error: Mutex<Option<String>>,
}

/// Handle to the broker connection.
#[derive(Clone)]
pub struct ApiClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// A confirmed push subscription. Keyed by route, so it stays valid across reconnects.
#[derive(Clone)]
pub struct Subscription {
    route: Route,
    client: ApiClient,
}

impl Subscription {
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Current server-side id, if the subscription is live.
    pub fn id(&self) -> Option<String> {
        self.client.shared.registry.server_id(&self.route)
    }

    pub async fn unsubscribe(self) -> Result<()> {
        self.client.unsubscribe(&self.route).await
    }
}

impl ApiClient {
    /// Spawn the connection actor. Must be called inside a tokio runtime.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new(Shared {
            correlator: Correlator::new(),
            registry: SubscriptionRegistry::new(),
            auth_request: Mutex::new(None),
            last_error: Mutex::new(None),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);

        let actor = ConnectionActor {
            config,
            connector,
            shared: shared.clone(),
            commands: cmd_rx,
            state: state_tx,
            events: events.clone(),
            seq: 0,
        };
        tokio::spawn(actor.run());

        Self {
            shared,
            commands: cmd_tx,
            state_rx,
            events,
        }
    }

    /// Connect and wait until the link is up. Idempotent while connected or connecting.
    pub async fn connect(&self) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        if *state_rx.borrow_and_update() == ConnectionState::Connected {
            return Ok(());
        }
        self.commands
            .send(Command::Connect)
            .map_err(|_| AppError::ConnectionFailed("connection task stopped".to_string()))?;

        loop {
            state_rx
                .changed()
                .await
                .map_err(|_| AppError::ConnectionFailed("connection task stopped".to_string()))?;
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Errored => {
                    let reason = self
                        .shared
                        .last_error
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(AppError::ConnectionFailed(reason));
                }
                ConnectionState::Disconnected => {
                    return Err(AppError::ConnectionFailed("disconnected".to_string()))
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => continue,
            }
        }
    }

    /// Close the link, fail pending requests and drop every subscription.
    pub async fn disconnect(&self) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done }).is_ok() {
            let _ = ack.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Send a request and await its response. Fails at once when not connected.
    pub async fn send<T: Serialize>(&self, request: &T) -> Result<InboundMessage> {
        if !self.is_connected() {
            return Err(AppError::ConnectionNotAvailable);
        }
        let req_id = self.shared.correlator.next_id();
        let text = encode_request(request, req_id)?;
        let (tx, rx) = oneshot::channel();
        self.shared.correlator.register(req_id, PendingRequest::new(tx));
        self.dispatch_command(req_id, text)?;

        rx.await
            .map_err(|_| AppError::ConnectionLost("request abandoned".to_string()))?
    }

    /// Subscribe a route. The first response payload reaches `handler` before this returns.
    pub async fn subscribe<T: Serialize>(
        &self,
        route: Route,
        request: &T,
        handler: PushHandler,
    ) -> Result<Subscription> {
        if !self.is_connected() {
            return Err(AppError::ConnectionNotAvailable);
        }
        let request = serde_json::to_value(request)?;
        let req_id = self.shared.correlator.next_id();
        let text = encode_request(&request, req_id)?;

        // The request id doubles as the intent generation.
        self.shared
            .registry
            .set_intent(route.clone(), request, handler.clone(), req_id);

        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest::new(tx).with_subscription(PendingSubscription {
            route: route.clone(),
            handler,
            generation: req_id,
        });
        self.shared.correlator.register(req_id, pending);
        if let Err(e) = self.dispatch_command(req_id, text) {
            self.shared.registry.withdraw_intent(&route, req_id);
            return Err(e);
        }

        let result = rx
            .await
            .map_err(|_| AppError::ConnectionLost("request abandoned".to_string()))
            .and_then(|r| r);
        match result {
            Ok(msg) if msg.subscription_id.is_some() => {
                debug!("Subscribed {}", route);
                Ok(Subscription {
                    route,
                    client: self.clone(),
                })
            }
            Ok(msg) => {
                self.shared.registry.withdraw_intent(&route, req_id);
                Err(AppError::Protocol(format!(
                    "{} response carried no subscription id",
                    msg.msg_type.as_deref().unwrap_or("subscribe")
                )))
            }
            Err(e) => {
                self.shared.registry.withdraw_intent(&route, req_id);
                Err(e)
            }
        }
    }

    /// Cancel a route's subscription. Local routing stops before the forget goes out.
    pub async fn unsubscribe(&self, route: &Route) -> Result<()> {
        match self.shared.registry.remove(route) {
            Some(server_id) if self.is_connected() => {
                debug!("Forgetting {} ({})", route, server_id);
                self.send(&ForgetRequest { forget: server_id }).await.map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Unsubscribe in the background, logging failures.
    pub fn unsubscribe_detached(&self, route: Route) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.unsubscribe(&route).await {
                warn!("Failed to unsubscribe {}: {}", route, e);
            }
        });
    }

    /// Store the authorize request replayed after a reconnect.
    pub fn set_auth_request<T: Serialize>(&self, request: &T) -> Result<()> {
        let value = serde_json::to_value(request)?;
        *self
            .shared
            .auth_request
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(value);
        Ok(())
    }

    pub fn clear_auth_request(&self) {
        *self
            .shared
            .auth_request
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_subscribed(&self, route: &Route) -> bool {
        self.shared.registry.is_live(route)
    }

    /// Number of live server-confirmed subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.registry.live_count()
    }

    /// Number of desired subscriptions, live or awaiting replay.
    pub fn intent_count(&self) -> usize {
        self.shared.registry.intent_count()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }

    fn dispatch_command(&self, req_id: u64, text: String) -> Result<()> {
        if self.commands.send(Command::Send { req_id, text }).is_err() {
            self.shared.correlator.take(req_id);
            return Err(AppError::ConnectionNotAvailable);
        }
        Ok(())
    }
}

/// How a connected session ended.
enum SessionEnd {
    Closed(String),
    Disconnected(oneshot::Sender<()>),
    /// Every client handle is gone.
    Dropped,
}

enum Reconnect {
    Linked(Link),
    Exhausted,
    Cancelled(oneshot::Sender<()>),
    Dropped,
}

struct ConnectionActor {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Arrival counter stamped on inbound messages.
    seq: u64,
}

impl ConnectionActor {
    async fn run(mut self) {
        while self.wait_for_connect().await {
            self.set_state(ConnectionState::Connecting);
            match self.open_link().await {
                Ok(link) => {
                    if !self.drive(link).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("Connection failed: {}", e);
                    self.fail(e.to_string());
                }
            }
        }
        debug!("Connection task stopped");
    }

    /// Idle until a connect command. Returns false once every handle is dropped.
    async fn wait_for_connect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(Command::Connect) => return true,
                Some(Command::Send { req_id, .. }) => {
                    self.shared
                        .correlator
                        .reject(req_id, AppError::ConnectionNotAvailable);
                }
                Some(Command::Disconnect { done }) => {
                    self.shared.registry.clear();
                    self.set_state(ConnectionState::Disconnected);
                    let _ = done.send(());
                }
                None => return false,
            }
        }
    }

    async fn open_link(&self) -> Result<Link> {
        let url = self.config.url();
        info!("Connecting to {}", self.config.endpoint);
        match tokio::time::timeout(self.config.connect_timeout, self.connector.connect(url)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "no connection after {:?}",
                self.config.connect_timeout
            ))),
        }
    }

    /// Run sessions until a disconnect or exhausted retries. Returns false once every handle is dropped.
    async fn drive(&mut self, mut link: Link) -> bool {
        loop {
            self.set_state(ConnectionState::Connected);
            self.emit(ConnectionEvent::Open);
            info!("Connected to broker");
            self.replay(&link);

            let end = self.pump(&mut link).await;
            drop(link);

            match end {
                SessionEnd::Disconnected(done) => {
                    self.set_state(ConnectionState::Disconnected);
                    let rejected = self
                        .shared
                        .correlator
                        .reject_all(AppError::ConnectionLost("client disconnected".to_string()));
                    self.shared.registry.clear();
                    self.emit(ConnectionEvent::Close {
                        reason: "client disconnect".to_string(),
                    });
                    info!("Disconnected ({} pending requests cancelled)", rejected);
                    let _ = done.send(());
                    return true;
                }
                SessionEnd::Dropped => return false,
                SessionEnd::Closed(reason) => {
                    warn!("Connection closed: {}", reason);
                    self.set_state(ConnectionState::Reconnecting);
                    self.shared
                        .correlator
                        .reject_all(AppError::ConnectionLost(reason.clone()));
                    let stale = self.shared.registry.clear_live();
                    debug!("{} subscriptions marked stale", stale);
                    self.emit(ConnectionEvent::Close { reason });

                    match self.reconnect().await {
                        Reconnect::Linked(next) => link = next,
                        Reconnect::Exhausted => {
                            self.fail("reconnect attempts exhausted".to_string());
                            self.emit(ConnectionEvent::Failed);
                            return true;
                        }
                        Reconnect::Cancelled(done) => {
                            self.shared.registry.clear();
                            self.set_state(ConnectionState::Disconnected);
                            let _ = done.send(());
                            return true;
                        }
                        Reconnect::Dropped => return false,
                    }
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Reconnect {
        for attempt in 0..self.config.max_reconnect_attempts {
            let delay = self.config.backoff_delay(attempt);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                self.config.max_reconnect_attempts
            );
            self.emit(ConnectionEvent::Reconnecting {
                attempt: attempt + 1,
                delay,
            });

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.commands.recv() => match cmd {
                        Some(Command::Disconnect { done }) => return Reconnect::Cancelled(done),
                        Some(Command::Send { req_id, .. }) => {
                            self.shared.correlator.reject(req_id, AppError::ConnectionNotAvailable);
                        }
                        Some(Command::Connect) => {}
                        None => return Reconnect::Dropped,
                    },
                }
            }

            match self.open_link().await {
                Ok(link) => return Reconnect::Linked(link),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    self.emit(ConnectionEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
        Reconnect::Exhausted
    }

    async fn pump(&mut self, link: &mut Link) -> SessionEnd {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = link.inbound.recv() => match event {
                    Some(LinkEvent::Text(text)) => self.handle_text(link, &text),
                    Some(LinkEvent::Error(message)) => {
                        warn!("Transport error: {}", message);
                        self.emit(ConnectionEvent::Error { message });
                    }
                    Some(LinkEvent::Closed(reason)) => return SessionEnd::Closed(reason),
                    None => return SessionEnd::Closed("transport ended".to_string()),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send { req_id, text }) => {
                        if link.outbound.send(Frame::Text(text)).is_err() {
                            self.shared
                                .correlator
                                .reject(req_id, AppError::ConnectionLost("transport closed".to_string()));
                        }
                    }
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect { done }) => {
                        let _ = link.outbound.send(Frame::Close);
                        return SessionEnd::Disconnected(done);
                    }
                    None => {
                        let _ = link.outbound.send(Frame::Close);
                        return SessionEnd::Dropped;
                    }
                },
                _ = heartbeat.tick() => {
                    self.send_untracked(link, &PingRequest { ping: 1 });
                }
            }
        }
    }

    fn handle_text(&mut self, link: &Link, text: &str) {
        self.seq += 1;
        let msg = match InboundMessage::parse(text, self.seq) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        if self.shared.registry.dispatch(&msg) {
            return;
        }

        let pending = msg.req_id.and_then(|id| self.shared.correlator.take(id));
        match pending {
            Some(pending) => self.complete(link, pending, msg),
            None => debug!(
                "Unmatched {} message (req_id {:?})",
                msg.msg_type.as_deref().unwrap_or("unknown"),
                msg.req_id
            ),
        }
    }

    /// Resolve a pending request, activating its subscription first.
    fn complete(&self, link: &Link, mut pending: PendingRequest, msg: InboundMessage) {
        if msg.error.is_none() {
            if let (Some(sub), Some(server_id)) = (pending.subscription.take(), msg.subscription_id.as_deref()) {
                match self
                    .shared
                    .registry
                    .activate(server_id, &sub.route, sub.handler.clone(), sub.generation)
                {
                    Activation::Activated { replaced } => {
                        if let Some(old) = replaced {
                            self.send_untracked(link, &ForgetRequest { forget: old });
                        }
                        deliver(&sub.route, &sub.handler, &msg);
                    }
                    Activation::Withdrawn => {
                        debug!("Subscription {} withdrawn before confirmation", sub.route);
                        self.send_untracked(
                            link,
                            &ForgetRequest {
                                forget: server_id.to_string(),
                            },
                        );
                    }
                }
            }
        }
        pending.respond(msg.into_result());
    }

    /// Re-send authorization then every desired subscription on a fresh link.
    fn replay(&self, link: &Link) {
        let auth = self
            .shared
            .auth_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(auth) = auth {
            self.send_tracked(link, &auth, PendingRequest::replay(None));
        }

        let intents = self.shared.registry.intents();
        if !intents.is_empty() {
            info!("Replaying {} subscriptions", intents.len());
        }
        for intent in intents {
            let pending = PendingRequest::replay(Some(PendingSubscription {
                route: intent.route,
                handler: intent.handler,
                generation: intent.generation,
            }));
            self.send_tracked(link, &intent.request, pending);
        }
    }

    fn send_tracked(&self, link: &Link, request: &Value, pending: PendingRequest) {
        let req_id = self.shared.correlator.next_id();
        match encode_request(request, req_id) {
            Ok(text) => {
                self.shared.correlator.register(req_id, pending);
                if link.outbound.send(Frame::Text(text)).is_err() {
                    self.shared.correlator.take(req_id);
                }
            }
            Err(e) => warn!("Cannot encode replayed request: {}", e),
        }
    }

    fn send_untracked<T: Serialize>(&self, link: &Link, request: &T) {
        let req_id = self.shared.correlator.next_id();
        match encode_request(request, req_id) {
            Ok(text) => {
                let _ = link.outbound.send(Frame::Text(text));
            }
            Err(e) => warn!("Cannot encode request: {}", e),
        }
    }

    fn fail(&self, reason: String) {
        *self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.set_state(ConnectionState::Errored);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}
