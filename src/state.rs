//! Shared application state.

use crate::auth::TokenKeys;
use crate::config::Config;
use crate::manager::local::LocalBackend;
use crate::manager::{Manager, SessionBackend};
use crate::relay::Relay;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<Manager>,
    pub relay: Arc<Relay>,
    pub tokens: Arc<TokenKeys>,
}

impl AppState {
    pub fn new(config: Config, backend: Arc<dyn SessionBackend>) -> Self {
        let tokens = Arc::new(TokenKeys::new(config.secret(), config.session_max_length_secs));
        let manager = Manager::new(backend);
        let relay = Arc::new(Relay::new(
            manager.clone(),
            tokens.clone(),
            config.management_options.relay_endpoint.clone(),
            config.management_options.debug,
        ));
        Self {
            config: Arc::new(config),
            manager,
            relay,
            tokens,
        }
    }

    /// State backed by local processes.
    pub fn local(config: Config) -> Self {
        let backend = Arc::new(LocalBackend::new(config.management_options.clone()));
        Self::new(config, backend)
    }
}
