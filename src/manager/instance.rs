//! A single running session and its lifecycle notifications.

use super::Manager;
use crate::config::{AppSpec, User};
use crate::error::Result;
use crate::protocol::SessionState;
use crate::util::{constant_time_eq, random_token};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};
use tracing::info;

const EVENT_BUFFER_SIZE: usize = 64;

/// Named output streams of a session (`stdout`, `streamer_stderr`, ...).
pub type OutputStreams = BTreeMap<String, broadcast::Sender<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    PreStart,
    Start,
    PreStop,
    Stop,
    PreStateChange {
        from: SessionState,
        to: SessionState,
    },
    StateChanged {
        to: SessionState,
        from: SessionState,
    },
    State(SessionState),
}

/// The process side of a session. The instance owns one and drives it.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start(&self, instance: &Arc<ApplicationInstance>) -> Result<()>;

    /// Release everything the session holds. Called exactly once.
    async fn stop(&self, instance: &ApplicationInstance);

    /// Ask the session to wind down; completion is observed via `stop`.
    async fn request_stop(&self, instance: &ApplicationInstance);

    fn streams(&self) -> OutputStreams;
}

pub struct ApplicationInstance {
    pub user: User,
    pub app_spec: AppSpec,
    pub sid: String,
    secret: String,
    state: Mutex<SessionState>,
    events: broadcast::Sender<InstanceEvent>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    supervisor: Box<dyn ProcessSupervisor>,
    registry: Weak<Manager>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub id: String,
    pub name: String,
}

/// What the control API exposes about a session. The secret is never part of it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub user: UserView,
    pub app_specs: AppSpec,
    pub sid: String,
    pub ready: bool,
    pub state: SessionState,
    pub state_name: &'static str,
    /// Reserved for per-viewer permissions.
    pub acl: Vec<String>,
}

impl ApplicationInstance {
    pub fn new(
        user: User,
        app_spec: AppSpec,
        sid: String,
        supervisor: Box<dyn ProcessSupervisor>,
        registry: Weak<Manager>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            user,
            app_spec,
            sid,
            secret: random_token(),
            state: Mutex::new(SessionState::Initializing),
            events,
            stopped: AtomicBool::new(false),
            stop_tx,
            supervisor,
            registry,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: InstanceEvent) {
        let _ = self.events.send(event);
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn secret_matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.secret.as_bytes(), candidate.as_bytes())
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition to `next`. Any state may follow any other; re-setting the
    /// current state emits nothing.
    pub fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *state;
        if previous == next {
            return;
        }
        self.emit(InstanceEvent::PreStateChange { from: previous, to: next });
        *state = next;
        self.emit(InstanceEvent::StateChanged { to: next, from: previous });
        self.emit(InstanceEvent::State(next));
        info!(sid = %self.sid, from = %previous, to = %next, "Session state changed");
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.emit(InstanceEvent::PreStart);
        self.supervisor.start(self).await?;
        self.emit(InstanceEvent::Start);
        Ok(())
    }

    /// Tear the session down and deregister it. Later calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        self.emit(InstanceEvent::PreStop);
        self.supervisor.stop(self).await;
        if let Some(registry) = self.registry.upgrade() {
            registry.delete_session(&self.sid).await;
        }
        self.emit(InstanceEvent::Stop);
        info!(sid = %self.sid, user = %self.user.id, "Session stopped");
    }

    pub async fn request_stop(&self) {
        self.stop_tx.send_replace(true);
        self.supervisor.request_stop(self).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flips to `true` once a stop has been requested or performed.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn streams(&self) -> OutputStreams {
        self.supervisor.streams()
    }

    pub fn serialize(&self) -> SessionView {
        let state = self.state();
        SessionView {
            user: UserView {
                id: self.user.id.clone(),
                name: self.user.name.clone(),
            },
            app_specs: self.app_spec.clone(),
            sid: self.sid.clone(),
            ready: state >= SessionState::Ready,
            state,
            state_name: state.name(),
            acl: Vec::new(),
        }
    }
}
