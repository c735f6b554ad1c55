//! Realtime relay between the streamer, session owners and viewers.
//!
//! Every socket starts anonymous. `join_session` makes it a viewer of a
//! session; presenting the session secret makes it the session's owner
//! (the streamer), the only tier allowed to drive the state machine.

pub mod protocol;
pub mod ws;

use crate::auth::TokenKeys;
use crate::manager::{Manager, ManagerEvent};
use crate::protocol::SessionState;
use bytes::Bytes;
use protocol::{ClientEvent, ErrorType, Outbound, ServerEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-connection send buffer. Data chunks are dropped when it is full.
const CONNECTION_BUFFER_SIZE: usize = 256;

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    Anonymous = 0,
    Viewer = 1,
    Owner = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub socket_id: ConnId,
    pub bound_user_id: Option<String>,
    pub bound_sid: Option<String>,
    pub privilege: Privilege,
}

struct Connection {
    record: ConnectionRecord,
    tx: mpsc::Sender<Outbound>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnId, Connection>,
    /// channel name -> member connections
    channels: HashMap<String, HashSet<ConnId>>,
}

pub struct Relay {
    manager: Arc<Manager>,
    tokens: Arc<TokenKeys>,
    relay_endpoint: String,
    debug: bool,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(
        manager: Arc<Manager>,
        tokens: Arc<TokenKeys>,
        relay_endpoint: String,
        debug: bool,
    ) -> Self {
        Self {
            manager,
            tokens,
            relay_endpoint,
            debug,
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a socket and queue its `hello`.
    pub async fn connect(&self) -> (ConnId, mpsc::Receiver<Outbound>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let hello = ServerEvent::Hello {
            relay_endpoint: self.relay_endpoint.clone(),
            debug: self.debug,
        };
        let _ = tx.try_send(hello.into());
        self.registry.write().await.connections.insert(
            id,
            Connection {
                record: ConnectionRecord {
                    socket_id: id,
                    bound_user_id: None,
                    bound_sid: None,
                    privilege: Privilege::Anonymous,
                },
                tx,
                channels: HashSet::new(),
            },
        );
        debug!(conn = id, "Relay connection opened");
        (id, rx)
    }

    /// Forget a socket. Sessions it was bound to are unaffected.
    pub async fn disconnect(&self, conn: ConnId) {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;
        let Some(connection) = reg.connections.remove(&conn) else {
            return;
        };
        for name in &connection.channels {
            if let Some(members) = reg.channels.get_mut(name) {
                members.remove(&conn);
                if members.is_empty() {
                    reg.channels.remove(name);
                }
            }
        }
        debug!(conn, "Relay connection closed");
    }

    pub async fn record(&self, conn: ConnId) -> Option<ConnectionRecord> {
        self.registry
            .read()
            .await
            .connections
            .get(&conn)
            .map(|c| c.record.clone())
    }

    async fn send(&self, conn: ConnId, event: ServerEvent) {
        let tx = self
            .registry
            .read()
            .await
            .connections
            .get(&conn)
            .map(|c| c.tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(event.into()).await;
        }
    }

    async fn reject(&self, conn: ConnId, message: &str, kind: ErrorType) {
        debug!(conn, ?kind, "{}", message);
        self.send(conn, ServerEvent::Error(message.to_string())).await;
        self.send(conn, ServerEvent::ErrorType(kind)).await;
    }

    pub async fn handle(&self, conn: ConnId, event: ClientEvent) {
        match event {
            ClientEvent::Auth(token) => self.auth(conn, &token).await,
            ClientEvent::JoinSession(sid) => self.join_session(conn, sid).await,
            ClientEvent::UpgradePrivileges(secret) => self.upgrade_privileges(conn, &secret).await,
            ClientEvent::SetSessionState(n) => self.set_session_state(conn, n).await,
            ClientEvent::JoinChannel(names) => self.join_channels(conn, names).await,
            ClientEvent::LeaveChannel(names) => self.leave_channels(conn, names).await,
        }
    }

    async fn auth(&self, conn: ConnId, token: &str) {
        let claims = match self.tokens.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(conn, error = %e, "Relay auth rejected");
                return self.reject(conn, "Invalid token", ErrorType::InvalidToken).await;
            }
        };
        if let Some(c) = self.registry.write().await.connections.get_mut(&conn) {
            c.record.bound_user_id = Some(claims.id);
        }
    }

    async fn join_session(&self, conn: ConnId, sid: String) {
        // A binding to a session that has since been deleted does not count.
        let current = self.record(conn).await.and_then(|r| r.bound_sid);
        if let Some(bound) = &current {
            if self.manager.get_session(bound).await.is_some() {
                return self
                    .reject(conn, "Already joined a session", ErrorType::SessionConflict)
                    .await;
            }
        }
        if self.manager.get_session(&sid).await.is_none() {
            return self
                .reject(conn, "Session not found", ErrorType::SessionNotFound)
                .await;
        }

        let bound = {
            let mut reg = self.registry.write().await;
            match reg.connections.get_mut(&conn) {
                Some(c) if c.record.bound_sid == current => {
                    c.record.bound_sid = Some(sid.clone());
                    c.record.privilege = Privilege::Viewer;
                    true
                }
                _ => false,
            }
        };
        if bound {
            self.send(conn, ServerEvent::SessionId(sid)).await;
        } else {
            self.reject(conn, "Already joined a session", ErrorType::SessionConflict)
                .await;
        }
    }

    async fn upgrade_privileges(&self, conn: ConnId, secret: &str) {
        let Some(instance) = self.manager.find_by_secret(secret).await else {
            warn!(conn, "Privilege upgrade with an unknown secret");
            return self.send(conn, ServerEvent::Upgraded(false)).await;
        };

        let upgraded = match self.registry.write().await.connections.get_mut(&conn) {
            Some(c) => {
                c.record.privilege = Privilege::Owner;
                c.record.bound_sid = Some(instance.sid.clone());
                c.record.bound_user_id = None;
                true
            }
            None => false,
        };
        if !upgraded {
            return;
        }

        info!(conn, sid = %instance.sid, "Streamer attached to session");
        instance.set_state(SessionState::Handshaking);
        self.send(conn, ServerEvent::Upgraded(true)).await;
        self.send(conn, ServerEvent::SessionId(instance.sid.clone()))
            .await;
    }

    async fn set_session_state(&self, conn: ConnId, n: u8) {
        let Some(record) = self.record(conn).await else {
            return;
        };
        if record.privilege < Privilege::Owner {
            return self
                .reject(conn, "Insufficient privileges", ErrorType::NotPermitted)
                .await;
        }
        let state = match SessionState::try_from(n) {
            Ok(state) => state,
            Err(e) => return self.reject(conn, &e, ErrorType::InvalidState).await,
        };
        let instance = match &record.bound_sid {
            Some(sid) => self.manager.get_instance(sid).await,
            None => None,
        };
        let Some(instance) = instance else {
            return self
                .reject(conn, "Session not found", ErrorType::SessionNotFound)
                .await;
        };

        instance.set_state(state);
        if state == SessionState::Disconnecting {
            instance.request_stop().await;
        }
    }

    async fn join_channels(&self, conn: ConnId, names: Vec<String>) {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;
        let Some(c) = reg.connections.get_mut(&conn) else {
            return;
        };
        for name in names {
            reg.channels.entry(name.clone()).or_default().insert(conn);
            c.channels.insert(name);
        }
    }

    async fn leave_channels(&self, conn: ConnId, names: Vec<String>) {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;
        let Some(c) = reg.connections.get_mut(&conn) else {
            return;
        };
        for name in names {
            c.channels.remove(&name);
            if let Some(members) = reg.channels.get_mut(&name) {
                members.remove(&conn);
                if members.is_empty() {
                    reg.channels.remove(&name);
                }
            }
        }
    }

    /// Queue `chunk` for every member of `channel`. Returns how many
    /// connections accepted it.
    pub async fn publish(&self, channel: &str, chunk: Bytes) -> usize {
        let reg = self.registry.read().await;
        let Some(members) = reg.channels.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for id in members {
            let Some(c) = reg.connections.get(id) else {
                continue;
            };
            let frame = Outbound::Data {
                channel: channel.to_string(),
                chunk: chunk.clone(),
            };
            match c.tx.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(conn = id, channel, "Connection backed up, dropping chunk")
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Forward the output streams of every launched session to its
    /// `sid:stream` channels.
    pub fn spawn_forwarding(self: &Arc<Self>) -> JoinHandle<()> {
        let relay = self.clone();
        let mut events = self.manager.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ManagerEvent::Launched(sid)) => relay.forward_streams(&sid).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Relay fell behind on session events")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn forward_streams(self: &Arc<Self>, sid: &str) {
        let Some(instance) = self.manager.get_instance(sid).await else {
            return;
        };
        for (name, sender) in instance.streams() {
            let mut rx = sender.subscribe();
            let channel = format!("{}:{}", sid, name);
            let relay = self.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(chunk) => {
                            relay.publish(&channel, chunk).await;
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(channel = %channel, skipped = n, "Stream forwarder lagged")
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }
    }
}
