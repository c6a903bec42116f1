use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{ClientMessage, GatewayCounters, MessageError, Outbound, ServerMessage};
use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::tracking::{
    SubscriberId, TrackingEvent, TrackingEventPayload, TrackingNumber, TrackingSource,
};

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    fn subscriber(&self) -> SubscriberId {
        SubscriberId(self.0.clone())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct ClientState {
    sender: mpsc::UnboundedSender<Outbound>,
    remote: Option<String>,
    alive: bool,
    subscriptions: BTreeSet<TrackingNumber>,
    rooms: BTreeSet<String>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: u64,
}

#[derive(Default)]
struct GatewayState {
    clients: HashMap<ClientId, ClientState>,
    rooms: HashMap<String, HashSet<ClientId>>,
}

impl GatewayState {
    fn leave_room(&mut self, client_id: &ClientId, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(client_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
        if let Some(client) = self.clients.get_mut(client_id) {
            client.rooms.remove(room);
        }
    }

    /// Drops the client and its room memberships, returning what it watched.
    fn remove_client(&mut self, client_id: &ClientId) -> Option<BTreeSet<TrackingNumber>> {
        let client = self.clients.remove(client_id)?;
        for room in &client.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(client_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        Some(client.subscriptions)
    }
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
}

struct Inner {
    source: Arc<dyn TrackingSource>,
    clock: Arc<dyn Clock>,
    state: Mutex<GatewayState>,
    counters: Counters,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn encode(&self, message: &ServerMessage) -> Option<String> {
        match serde_json::to_string(message) {
            Ok(text) => Some(text),
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(message_type = message.type_name(), error = %err, "frame not serialisable");
                None
            }
        }
    }

    fn push(&self, client: &ClientState, frame: Outbound) -> bool {
        let is_message = matches!(frame, Outbound::Message(_));
        if client.sender.send(frame).is_err() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if is_message {
            self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn send_to(&self, client_id: &ClientId, message: &ServerMessage) -> bool {
        let Some(text) = self.encode(message) else {
            return false;
        };
        let state = self.lock();
        match state.clients.get(client_id) {
            Some(client) => self.push(client, Outbound::Message(text)),
            None => false,
        }
    }

    /// Frames for one client's ledger subscription. Runs synchronously on the
    /// publishing thread, so no status change can be skipped.
    fn deliver_watched(&self, client_id: &ClientId, watched: &TrackingNumber, event: &TrackingEvent) {
        self.send_to(
            client_id,
            &ServerMessage::TrackingUpdate {
                tracking_number: watched.clone(),
                event: Box::new(event.clone()),
                timestamp: event.timestamp,
            },
        );
        if let TrackingEventPayload::StatusUpdate(change) = &event.payload {
            self.send_to(
                client_id,
                &ServerMessage::StatusUpdate {
                    tracking_number: watched.clone(),
                    data: change.clone(),
                    timestamp: event.timestamp,
                },
            );
        }
    }

    fn send_where<F>(&self, message: &ServerMessage, mut include: F) -> usize
    where
        F: FnMut(&ClientId, &ClientState) -> bool,
    {
        let Some(text) = self.encode(message) else {
            return 0;
        };
        let state = self.lock();
        state
            .clients
            .iter()
            .filter(|&(id, client)| include(id, client))
            .filter(|&(_, client)| self.push(client, Outbound::Message(text.clone())))
            .count()
    }
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub terminated: Vec<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientDetail {
    pub id: ClientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub subscriptions: Vec<TrackingNumber>,
    pub rooms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStatistics {
    #[serde(flatten)]
    pub counters: GatewayCounters,
    pub rooms: usize,
    pub clients: Vec<ClientDetail>,
}

/// Realtime fan-out hub.
///
/// Each client is an unbounded outbound channel; the socket task owns the
/// actual connection. Ledger callbacks hold only a weak reference back to the
/// hub, so a dropped gateway never keeps itself alive through the ledger.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("connections", &self.inner.lock().clients.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(source: Arc<dyn TrackingSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                clock,
                state: Mutex::new(GatewayState::default()),
                counters: Counters::default(),
            }),
        }
    }

    /// Registers a connection and queues its `connection.ack`.
    pub fn connect(&self, remote: Option<String>) -> (ClientId, mpsc::UnboundedReceiver<Outbound>) {
        let client_id = ClientId::generate();
        let (sender, receiver) = mpsc::unbounded_channel();
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.lock();
            state.clients.insert(
                client_id.clone(),
                ClientState {
                    sender,
                    remote: remote.clone(),
                    alive: true,
                    subscriptions: BTreeSet::new(),
                    rooms: BTreeSet::new(),
                    connected_at: now,
                    last_activity: now,
                    message_count: 0,
                },
            );
        }
        self.inner
            .counters
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
        info!(client_id = %client_id, remote = remote.as_deref().unwrap_or("unknown"), "realtime client connected");

        self.inner.send_to(
            &client_id,
            &ServerMessage::ConnectionAck {
                client_id: client_id.0.clone(),
                status: "connected",
                message: "Connected to document tracking".to_string(),
                timestamp: now,
            },
        );
        (client_id, receiver)
    }

    /// Handles one text frame. Parse failures are answered on the same
    /// connection; nothing here closes it.
    pub fn on_message(&self, client_id: &ClientId, text: &str) {
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.lock();
            let Some(client) = state.clients.get_mut(client_id) else {
                return;
            };
            client.last_activity = now;
            client.message_count += 1;
        }
        self.inner
            .counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                let reply = match &err {
                    MessageError::UnknownType(_) => err.to_string(),
                    MessageError::Malformed(_) | MessageError::MissingType => {
                        self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                        "Invalid message format".to_string()
                    }
                };
                debug!(client_id = %client_id, error = %err, "rejected realtime message");
                self.inner
                    .send_to(client_id, &ServerMessage::error(err.kind(), reply));
                return;
            }
        };

        match message {
            ClientMessage::Subscribe { tracking_number } => {
                self.handle_subscribe(client_id, tracking_number)
            }
            ClientMessage::Unsubscribe { tracking_number } => {
                self.handle_unsubscribe(client_id, tracking_number)
            }
            ClientMessage::Track { tracking_number } => self.handle_track(client_id, tracking_number),
            ClientMessage::JoinRoom { room } => self.handle_join(client_id, room),
            ClientMessage::LeaveRoom { room } => self.handle_leave(client_id, room),
            ClientMessage::Ping => {
                self.inner
                    .send_to(client_id, &ServerMessage::Pong { timestamp: now });
            }
            ClientMessage::GetStatus => {
                let tracking = match self.inner.source.statistics() {
                    Ok(stats) => Some(stats),
                    Err(err) => {
                        warn!(error = %err, "ledger statistics unavailable");
                        None
                    }
                };
                self.inner.send_to(
                    client_id,
                    &ServerMessage::SystemStatus {
                        gateway: self.counters(),
                        tracking,
                        timestamp: now,
                    },
                );
            }
        }
    }

    fn handle_subscribe(&self, client_id: &ClientId, tracking_number: Option<TrackingNumber>) {
        let Some(tracking_number) = tracking_number else {
            self.reply_error(
                client_id,
                ErrorKind::InvalidRequest,
                "Tracking number required for subscription",
            );
            return;
        };
        let snapshot = match self.inner.source.snapshot(&tracking_number) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.reply_error(
                    client_id,
                    err.kind(),
                    format!("Tracking number not found: {tracking_number}"),
                );
                return;
            }
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let target = client_id.clone();
        let watched = tracking_number.clone();
        let callback = Arc::new(move |event: &TrackingEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver_watched(&target, &watched, event);
            }
        });
        if let Err(err) = self
            .inner
            .source
            .watch(&tracking_number, client_id.subscriber(), callback)
        {
            self.reply_error(client_id, err.kind(), err.to_string());
            return;
        }

        let registered = {
            let mut state = self.inner.lock();
            match state.clients.get_mut(client_id) {
                Some(client) => {
                    client.subscriptions.insert(tracking_number.clone());
                    true
                }
                None => false,
            }
        };
        if !registered {
            self.inner
                .source
                .unwatch(&tracking_number, &client_id.subscriber());
            return;
        }

        debug!(client_id = %client_id, %tracking_number, "client subscribed");
        self.inner.send_to(
            client_id,
            &ServerMessage::Subscribed {
                message: format!("Subscribed to tracking updates for {tracking_number}"),
                tracking_number,
                current_data: Box::new(snapshot),
            },
        );
    }

    fn handle_unsubscribe(&self, client_id: &ClientId, tracking_number: Option<TrackingNumber>) {
        let Some(tracking_number) = tracking_number else {
            self.reply_error(client_id, ErrorKind::InvalidRequest, "Tracking number required");
            return;
        };
        let removed = {
            let mut state = self.inner.lock();
            state
                .clients
                .get_mut(client_id)
                .is_some_and(|client| client.subscriptions.remove(&tracking_number))
        };
        if !removed {
            self.reply_error(
                client_id,
                ErrorKind::NotFound,
                format!("Not subscribed to {tracking_number}"),
            );
            return;
        }

        self.inner
            .source
            .unwatch(&tracking_number, &client_id.subscriber());
        self.inner.send_to(
            client_id,
            &ServerMessage::Unsubscribed {
                message: format!("Unsubscribed from {tracking_number}"),
                tracking_number,
            },
        );
    }

    fn handle_track(&self, client_id: &ClientId, tracking_number: Option<TrackingNumber>) {
        let Some(tracking_number) = tracking_number else {
            self.reply_error(client_id, ErrorKind::InvalidRequest, "Tracking number required");
            return;
        };
        match self.inner.source.snapshot(&tracking_number) {
            Ok(snapshot) => {
                self.inner.send_to(
                    client_id,
                    &ServerMessage::TrackingData {
                        tracking_number,
                        data: Box::new(snapshot),
                        timestamp: self.inner.clock.now(),
                    },
                );
            }
            Err(err) => self.reply_error(
                client_id,
                err.kind(),
                format!("Tracking number not found: {tracking_number}"),
            ),
        }
    }

    fn handle_join(&self, client_id: &ClientId, room: Option<String>) {
        let Some(room) = room.filter(|room| !room.is_empty()) else {
            self.reply_error(client_id, ErrorKind::InvalidRequest, "Room name required");
            return;
        };
        {
            let mut state = self.inner.lock();
            let Some(client) = state.clients.get_mut(client_id) else {
                return;
            };
            client.rooms.insert(room.clone());
            state
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(client_id.clone());
        }
        self.inner.send_to(
            client_id,
            &ServerMessage::RoomJoined {
                message: format!("Joined room: {room}"),
                room,
            },
        );
    }

    fn handle_leave(&self, client_id: &ClientId, room: Option<String>) {
        let Some(room) = room.filter(|room| !room.is_empty()) else {
            self.reply_error(client_id, ErrorKind::InvalidRequest, "Room name required");
            return;
        };
        self.inner.lock().leave_room(client_id, &room);
        self.inner.send_to(
            client_id,
            &ServerMessage::RoomLeft {
                message: format!("Left room: {room}"),
                room,
            },
        );
    }

    fn reply_error(&self, client_id: &ClientId, kind: ErrorKind, message: impl Into<String>) {
        self.inner
            .send_to(client_id, &ServerMessage::error(kind, message));
    }

    pub fn on_pong(&self, client_id: &ClientId) {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock();
        if let Some(client) = state.clients.get_mut(client_id) {
            client.alive = true;
            client.last_activity = now;
        }
    }

    /// Transport-level failure on a connection.
    pub fn on_error(&self, client_id: &ClientId, error: &dyn std::error::Error) {
        self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(client_id = %client_id, error = %error, "realtime connection error");
    }

    /// Releases every subscription and room membership held by the client.
    /// Returns `false` if it was already gone.
    pub fn disconnect(&self, client_id: &ClientId) -> bool {
        let Some(subscriptions) = self.inner.lock().remove_client(client_id) else {
            return false;
        };
        let subscriber = client_id.subscriber();
        for tracking_number in &subscriptions {
            self.inner.source.unwatch(tracking_number, &subscriber);
        }
        info!(client_id = %client_id, released = subscriptions.len(), "realtime client disconnected");
        true
    }

    pub fn send_to(&self, client_id: &ClientId, message: &ServerMessage) -> bool {
        self.inner.send_to(client_id, message)
    }

    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<&ClientId>) -> usize {
        self.inner
            .send_where(message, |id, _| Some(id) != exclude)
    }

    pub fn broadcast_to_subscribers(
        &self,
        tracking_number: &TrackingNumber,
        message: &ServerMessage,
    ) -> usize {
        let sent = self
            .inner
            .send_where(message, |_, client| client.subscriptions.contains(tracking_number));
        debug!(%tracking_number, sent, message_type = message.type_name(), "subscriber broadcast");
        sent
    }

    pub fn broadcast_to_room(
        &self,
        room: &str,
        message: &ServerMessage,
        exclude: Option<&ClientId>,
    ) -> usize {
        self.inner.send_where(message, |id, client| {
            client.rooms.contains(room) && Some(id) != exclude
        })
    }

    /// Terminates clients that never answered the previous ping, then pings
    /// the rest and waits for the next sweep to judge them.
    pub fn heartbeat_sweep(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        {
            let mut state = self.inner.lock();
            for (client_id, client) in state.clients.iter_mut() {
                if client.alive {
                    client.alive = false;
                    if self.inner.push(client, Outbound::Ping) {
                        report.pinged += 1;
                    }
                } else {
                    self.inner.push(
                        client,
                        Outbound::Close {
                            code: CLOSE_GOING_AWAY,
                            reason: "heartbeat timeout".to_string(),
                        },
                    );
                    report.terminated.push(client_id.clone());
                }
            }
        }
        for client_id in &report.terminated {
            warn!(client_id = %client_id, "terminating unresponsive realtime client");
            self.disconnect(client_id);
        }
        report
    }

    /// Fans out events that no per-client subscription covers: creations go
    /// to everyone. Status changes reach their subscribers through the ledger
    /// subscription registered on `subscribe`, so they are skipped here.
    pub fn dispatch_event(&self, event: &TrackingEvent) -> usize {
        match &event.payload {
            TrackingEventPayload::Created(record) => self.broadcast(
                &ServerMessage::NewTracking {
                    data: record.clone(),
                    timestamp: event.timestamp,
                },
                None,
            ),
            TrackingEventPayload::StatusUpdate(_) => 0,
        }
    }

    /// Forwards the ledger's global feed until it closes.
    pub fn spawn_event_pump(&self, mut feed: broadcast::Receiver<TrackingEvent>) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        gateway.dispatch_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime event pump lagged; new_tracking broadcasts skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("realtime event pump stopped");
        })
    }

    fn counters(&self) -> GatewayCounters {
        let active = self.inner.lock().clients.len() as u64;
        let counters = &self.inner.counters;
        GatewayCounters {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: active,
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }

    pub fn statistics(&self) -> GatewayStatistics {
        let counters = self.counters();
        let state = self.inner.lock();
        let mut clients: Vec<ClientDetail> = state
            .clients
            .iter()
            .map(|(id, client)| ClientDetail {
                id: id.clone(),
                remote: client.remote.clone(),
                connected_at: client.connected_at,
                last_activity: client.last_activity,
                message_count: client.message_count,
                subscriptions: client.subscriptions.iter().cloned().collect(),
                rooms: client.rooms.iter().cloned().collect(),
            })
            .collect();
        clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));
        GatewayStatistics {
            counters,
            rooms: state.rooms.len(),
            clients,
        }
    }

    /// Closes every connection and forgets all clients and rooms.
    pub fn shutdown(&self) {
        let released: Vec<(ClientId, BTreeSet<TrackingNumber>)> = {
            let mut state = self.inner.lock();
            let clients = std::mem::take(&mut state.clients);
            state.rooms.clear();
            clients
                .into_iter()
                .map(|(id, client)| {
                    self.inner.push(
                        &client,
                        Outbound::Close {
                            code: CLOSE_NORMAL,
                            reason: "Server shutdown".to_string(),
                        },
                    );
                    (id, client.subscriptions)
                })
                .collect()
        };
        for (client_id, subscriptions) in &released {
            let subscriber = client_id.subscriber();
            for tracking_number in subscriptions {
                self.inner.source.unwatch(tracking_number, &subscriber);
            }
        }
        info!(closed = released.len(), "realtime gateway shut down");
    }
}
