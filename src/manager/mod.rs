//! Session registry: ids, the canonical session maps and lifecycle events.

pub mod instance;
pub mod launch;
pub mod local;
pub mod readiness;

pub use instance::{
    ApplicationInstance, InstanceEvent, OutputStreams, ProcessSupervisor, SessionView,
};

use crate::config::{AppSpec, User};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    PreLaunch { sid: String, user_id: String },
    Launched(String),
    Deleted(String),
}

/// What the registry knows about a session before its instance exists.
#[derive(Debug, Clone)]
pub struct ProvisionalSession {
    pub user: User,
    pub app_spec: AppSpec,
    pub extra: Map<String, Value>,
}

#[derive(Clone)]
pub enum SessionEntry {
    Instance(Arc<ApplicationInstance>),
    Provisional(Arc<ProvisionalSession>),
}

impl SessionEntry {
    pub fn instance(&self) -> Option<&Arc<ApplicationInstance>> {
        match self {
            SessionEntry::Instance(inst) => Some(inst),
            SessionEntry::Provisional(_) => None,
        }
    }

    pub fn view(&self, sid: &str) -> SessionView {
        match self {
            SessionEntry::Instance(inst) => inst.serialize(),
            SessionEntry::Provisional(p) => SessionView {
                user: instance::UserView {
                    id: p.user.id.clone(),
                    name: p.user.name.clone(),
                },
                app_specs: p.app_spec.clone(),
                sid: sid.to_string(),
                ready: false,
                state: crate::protocol::SessionState::Initializing,
                state_name: crate::protocol::SessionState::Initializing.name(),
                acl: Vec::new(),
            },
        }
    }
}

/// Where sessions actually run. The registry only deals in this interface.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// One-time setup before the first launch.
    async fn start(&self) {}

    fn create_supervisor(
        &self,
        user: &User,
        app_spec: &AppSpec,
        sid: &str,
    ) -> Box<dyn ProcessSupervisor>;
}

enum UserSlot {
    /// A launch under this sid is in flight.
    Launching(String),
    Active(String),
}

pub struct Manager {
    backend: Arc<dyn SessionBackend>,
    instances: RwLock<HashMap<String, Arc<ApplicationInstance>>>,
    provisional: RwLock<HashMap<String, Arc<ProvisionalSession>>>,
    /// user id -> their session; one entry per user
    user_slots: Mutex<HashMap<String, UserSlot>>,
    events: broadcast::Sender<ManagerEvent>,
    this: Weak<Manager>,
}

/// Session ids double as capabilities for viewers, so they must be unguessable.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Manager {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Arc::new_cyclic(|this| Self {
            backend,
            instances: RwLock::new(HashMap::new()),
            provisional: RwLock::new(HashMap::new()),
            user_slots: Mutex::new(HashMap::new()),
            events,
            this: this.clone(),
        })
    }

    pub async fn start(&self) {
        self.backend.start().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    /// Start a session for `user`. Does not check whether the user already
    /// has one; see [`Manager::launch_for_user`].
    pub async fn launch(
        &self,
        user: &User,
        app_spec: &AppSpec,
        extra: Map<String, Value>,
    ) -> Result<String> {
        self.launch_with_sid(generate_session_id(), user, app_spec, extra)
            .await
    }

    async fn launch_with_sid(
        &self,
        sid: String,
        user: &User,
        app_spec: &AppSpec,
        extra: Map<String, Value>,
    ) -> Result<String> {
        self.provisional.write().await.insert(
            sid.clone(),
            Arc::new(ProvisionalSession {
                user: user.clone(),
                app_spec: app_spec.clone(),
                extra,
            }),
        );
        self.emit(ManagerEvent::PreLaunch {
            sid: sid.clone(),
            user_id: user.id.clone(),
        });

        let supervisor = self.backend.create_supervisor(user, app_spec, &sid);
        let instance = ApplicationInstance::new(
            user.clone(),
            app_spec.clone(),
            sid.clone(),
            supervisor,
            self.this.clone(),
        );
        self.instances.write().await.insert(sid.clone(), instance.clone());

        if let Err(e) = instance.start().await {
            warn!(sid = %sid, user = %user.id, error = %e, "Session failed to start");
            instance.stop().await;
            return Err(e);
        }

        info!(sid = %sid, user = %user.id, app = %app_spec.id, "Session launched");
        self.emit(ManagerEvent::Launched(sid.clone()));
        Ok(sid)
    }

    /// Launch while holding the user's single session slot. A user who
    /// already has (or is getting) a session gets a conflict carrying it.
    pub async fn launch_for_user(&self, user: &User, app_spec: &AppSpec) -> Result<String> {
        let sid = {
            let mut slots = self.user_slots.lock().await;
            match slots.get(&user.id) {
                Some(UserSlot::Active(sid)) | Some(UserSlot::Launching(sid)) => {
                    return Err(Error::Conflict {
                        current: Some(sid.clone()),
                    })
                }
                None => {
                    let sid = generate_session_id();
                    slots.insert(user.id.clone(), UserSlot::Launching(sid.clone()));
                    sid
                }
            }
        };

        let result = self
            .launch_with_sid(sid.clone(), user, app_spec, Map::new())
            .await;

        let mut slots = self.user_slots.lock().await;
        // The session may already have exited during start.
        let live = result.is_ok() && self.instances.read().await.contains_key(&sid);
        let ours = matches!(slots.get(&user.id), Some(UserSlot::Launching(s)) if *s == sid);
        if ours {
            if live {
                slots.insert(user.id.clone(), UserSlot::Active(sid));
            } else {
                slots.remove(&user.id);
            }
        }
        result
    }

    pub async fn session_for_user(&self, user_id: &str) -> Option<String> {
        match self.user_slots.lock().await.get(user_id) {
            Some(UserSlot::Active(sid)) => Some(sid.clone()),
            _ => None,
        }
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionEntry> {
        if let Some(instance) = self.instances.read().await.get(id) {
            return Some(SessionEntry::Instance(instance.clone()));
        }
        self.provisional
            .read()
            .await
            .get(id)
            .map(|p| SessionEntry::Provisional(p.clone()))
    }

    pub async fn get_instance(&self, id: &str) -> Option<Arc<ApplicationInstance>> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn delete_session(&self, id: &str) {
        let provisional = self.provisional.write().await.remove(id);
        let instance = self.instances.write().await.remove(id);
        if provisional.is_none() && instance.is_none() {
            return;
        }
        self.user_slots
            .lock()
            .await
            .retain(|_, slot| !matches!(slot, UserSlot::Active(sid) if sid == id));
        info!(sid = %id, "Session deleted");
        self.emit(ManagerEvent::Deleted(id.to_string()));
    }

    pub async fn find_by_secret(&self, secret: &str) -> Option<Arc<ApplicationInstance>> {
        self.instances
            .read()
            .await
            .values()
            .find(|inst| inst.secret_matches(secret))
            .cloned()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::instance::tests::{app, user, FakeSupervisor};
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        fail_start: AtomicBool,
    }

    #[async_trait]
    impl SessionBackend for FakeBackend {
        fn create_supervisor(&self, _: &User, _: &AppSpec, _: &str) -> Box<dyn ProcessSupervisor> {
            Box::new(FakeSupervisor {
                fail_start: self.fail_start.load(Ordering::SeqCst),
                ..Default::default()
            })
        }
    }

    fn manager() -> (Arc<Manager>, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        (Manager::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn second_launch_returns_existing_sid_as_conflict() {
        let (m, _) = manager();
        let u = user("u");
        let sid = m.launch_for_user(&u, &app("a")).await.unwrap();
        for _ in 0..3 {
            match m.launch_for_user(&u, &app("a")).await {
                Err(Error::Conflict { current }) => {
                    assert_eq!(current.as_deref(), Some(sid.as_str()))
                }
                other => panic!("expected conflict, got {:?}", other.map(|_| ())),
            }
        }
        assert_eq!(m.session_ids().await, vec![sid.clone()]);
        assert_eq!(m.session_for_user("u").await, Some(sid));
    }

    #[tokio::test]
    async fn different_users_get_independent_sessions() {
        let (m, _) = manager();
        let a = m.launch_for_user(&user("a"), &app("x")).await.unwrap();
        let b = m.launch_for_user(&user("b"), &app("x")).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn get_session_after_delete_is_none() {
        let (m, _) = manager();
        let sid = m.launch(&user("u"), &app("a"), Map::new()).await.unwrap();
        assert!(m.get_session(&sid).await.unwrap().instance().is_some());
        m.delete_session(&sid).await;
        assert!(m.get_session(&sid).await.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_announced_once() {
        let (m, _) = manager();
        let sid = m.launch(&user("u"), &app("a"), Map::new()).await.unwrap();
        let mut rx = m.subscribe();
        m.delete_session(&sid).await;
        m.delete_session(&sid).await;
        assert_eq!(rx.try_recv().unwrap(), ManagerEvent::Deleted(sid));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn launch_emits_pre_launch_then_launched() {
        let (m, _) = manager();
        let mut rx = m.subscribe();
        let sid = m.launch(&user("u"), &app("a"), Map::new()).await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ManagerEvent::PreLaunch {
                sid: sid.clone(),
                user_id: "u".into()
            }
        );
        assert_eq!(rx.try_recv().unwrap(), ManagerEvent::Launched(sid));
    }

    #[tokio::test]
    async fn instance_takes_precedence_over_provisional_record() {
        let (m, _) = manager();
        let mut extra = Map::new();
        extra.insert("note".into(), Value::from("hi"));
        let sid = m.launch(&user("u"), &app("a"), extra).await.unwrap();
        assert!(m.provisional.read().await.contains_key(&sid));
        assert!(matches!(m.get_session(&sid).await, Some(SessionEntry::Instance(_))));
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_registered() {
        let (m, backend) = manager();
        backend.fail_start.store(true, Ordering::SeqCst);
        let mut rx = m.subscribe();
        assert!(m.launch_for_user(&user("u"), &app("a")).await.is_err());
        assert!(m.session_ids().await.is_empty());
        assert!(m.provisional.read().await.is_empty());
        assert!(m.session_for_user("u").await.is_none());
        assert!(matches!(rx.try_recv().unwrap(), ManagerEvent::PreLaunch { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ManagerEvent::Deleted(_)));

        backend.fail_start.store(false, Ordering::SeqCst);
        assert!(m.launch_for_user(&user("u"), &app("a")).await.is_ok());
    }

    #[tokio::test]
    async fn find_by_secret_matches_only_live_instances() {
        let (m, _) = manager();
        let sid = m.launch(&user("u"), &app("a"), Map::new()).await.unwrap();
        let inst = m.get_instance(&sid).await.unwrap();
        let secret = inst.secret().to_string();
        assert_eq!(m.find_by_secret(&secret).await.unwrap().sid, sid);
        assert!(m.find_by_secret("bogus").await.is_none());
        m.delete_session(&sid).await;
        assert!(m.find_by_secret(&secret).await.is_none());
    }

    #[tokio::test]
    async fn stop_frees_the_user_for_a_new_session() {
        let (m, _) = manager();
        let u = user("u");
        let first = m.launch_for_user(&u, &app("a")).await.unwrap();
        m.get_instance(&first).await.unwrap().request_stop().await;
        assert!(m.get_session(&first).await.is_none());
        let second = m.launch_for_user(&u, &app("a")).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn concurrent_launches_for_one_user_yield_one_session() {
        let (m, _) = manager();
        let u = user("u");
        let spec = app("a");
        let (r1, r2) = tokio::join!(m.launch_for_user(&u, &spec), m.launch_for_user(&u, &spec));
        assert_eq!([r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(m.session_ids().await.len(), 1);
    }

    /// Supervisor whose start takes a while, leaving the launch in flight.
    struct SlowSupervisor;

    #[async_trait]
    impl ProcessSupervisor for SlowSupervisor {
        async fn start(&self, _instance: &Arc<ApplicationInstance>) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        }

        async fn stop(&self, _instance: &ApplicationInstance) {}

        async fn request_stop(&self, instance: &ApplicationInstance) {
            instance.stop().await;
        }

        fn streams(&self) -> OutputStreams {
            OutputStreams::new()
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl SessionBackend for SlowBackend {
        fn create_supervisor(&self, _: &User, _: &AppSpec, _: &str) -> Box<dyn ProcessSupervisor> {
            Box::new(SlowSupervisor)
        }
    }

    #[tokio::test]
    async fn conflict_during_launch_carries_the_pending_sid() {
        let m = Manager::new(Arc::new(SlowBackend));
        let u = user("u");
        let spec = app("a");

        let second = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            m.launch_for_user(&u, &spec).await
        };
        let (first, second) = tokio::join!(m.launch_for_user(&u, &spec), second);

        let sid = first.unwrap();
        match second {
            Err(Error::Conflict { current }) => assert_eq!(current, Some(sid.clone())),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
        assert_eq!(m.session_for_user("u").await, Some(sid));
    }
}
