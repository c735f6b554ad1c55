//! Server configuration: users, launchable apps and management options.
//!
//! The file format is TOML with camelCase keys. Everything has a default, so
//! an empty file is a valid (if useless) configuration.

use crate::error::{Error, Result};
use crate::util::random_token;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_HYPERWARP_PATH: &str = "/opt/hyperwarp";
pub const DEFAULT_PROC_EXIT_TIMEOUT_MS: u64 = 30 * 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_POLL_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Lifetime of issued bearer tokens.
    #[serde(default = "default_session_max_length_secs")]
    pub session_max_length_secs: u64,
    #[serde(default)]
    pub management_options: ManagementOptions,
    #[serde(default)]
    pub app_specs: Vec<AppSpec>,
    #[serde(default)]
    pub users: Vec<User>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: None,
            session_max_length_secs: default_session_max_length_secs(),
            management_options: ManagementOptions::default(),
            app_specs: Vec::new(),
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_user_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub can_start_session: bool,
    #[serde(default = "default_true")]
    pub can_list_apps: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl User {
    pub fn has_credential(&self) -> bool {
        self.password.is_some() || self.access_token.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub id: String,
    pub binary: String,
    /// Argument template; `%sid%`, `%user%` and `%username%` are substituted.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub rewrite_home: bool,
    #[serde(default = "default_true")]
    pub rewrite_data_dirs: bool,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_poster")]
    pub poster: String,
}

/// An external program that wraps a launch for diagnostics (valgrind, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wrapper {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profiler {
    Flamegraph,
    Valgrind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `<hyperwarpPath>/target/<hyperwarpTarget>/streamerd`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_streamer_mode")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder: Option<String>,
    #[serde(default)]
    pub optimize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiler: Option<Profiler>,
    #[serde(default)]
    pub driver_reset_workaround: bool,
}

impl Default for StreamerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            mode: default_streamer_mode(),
            encoder: None,
            optimize: false,
            profiler: None,
            driver_reset_workaround: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementOptions {
    #[serde(default)]
    pub disable_audio_support: bool,
    #[serde(default)]
    pub disable_startup_audio_cleanup: bool,
    #[serde(default = "default_hyperwarp_path")]
    pub hyperwarp_path: PathBuf,
    #[serde(default = "default_hyperwarp_target")]
    pub hyperwarp_target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata_path: Option<PathBuf>,
    /// Directory holding the per-session rendezvous sockets.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_proc_exit_timeout_ms")]
    pub proc_exit_request_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    /// URL the streamer pushes to; also announced to relay clients.
    #[serde(default = "default_relay_endpoint")]
    pub relay_endpoint: String,
    /// Mirror child output to our own stdout/stderr.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_wrapper: Option<Wrapper>,
    #[serde(default)]
    pub streamer: StreamerOptions,
}

impl Default for ManagementOptions {
    fn default() -> Self {
        Self {
            disable_audio_support: false,
            disable_startup_audio_cleanup: false,
            hyperwarp_path: default_hyperwarp_path(),
            hyperwarp_target: default_hyperwarp_target(),
            userdata_path: None,
            socket_dir: default_socket_dir(),
            proc_exit_request_timeout_ms: DEFAULT_PROC_EXIT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            relay_endpoint: default_relay_endpoint(),
            verbose: false,
            debug: false,
            app_wrapper: None,
            streamer: StreamerOptions::default(),
        }
    }
}

impl ManagementOptions {
    /// Root under which every user gets a data directory.
    pub fn userdata_root(&self) -> PathBuf {
        if let Some(path) = &self.userdata_path {
            return path.clone();
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".stargate").join("userdata")
    }

    pub fn hook_target_dir(&self) -> PathBuf {
        self.hyperwarp_path.join("target").join(&self.hyperwarp_target)
    }

    /// Preload list in load order: pre-glue, hooker, post-glue.
    pub fn hook_libraries(&self) -> Vec<PathBuf> {
        vec![
            self.hyperwarp_path.join("libhyperpreglue.so"),
            self.hook_target_dir().join("libhyperwarphooker.so"),
            self.hyperwarp_path.join("libhyperglue.so"),
        ]
    }

    pub fn streamer_binary(&self) -> PathBuf {
        self.streamer
            .binary
            .clone()
            .unwrap_or_else(|| self.hook_target_dir().join("streamerd"))
    }

    pub fn socket_path(&self, sid: &str) -> PathBuf {
        self.socket_dir.join(format!("hyperwarp-{}.sock", sid))
    }
}

impl Config {
    /// Load from `path`, writing a default file if none exists.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "No config file found, generating a new one");
            let rendered = toml::to_string_pretty(&Config::default())
                .map_err(|e| Error::Config(e.to_string()))?;
            if let Err(e) = std::fs::write(path, rendered) {
                warn!(error = %e, "Could not write default config");
            }
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.finish();
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup("SECRET") {
            self.secret = Some(secret);
        }
        let opts = &mut self.management_options;
        if let Some(path) = lookup("STARGATE_USERDATA") {
            opts.userdata_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("HYPERWARP_PATH") {
            opts.hyperwarp_path = PathBuf::from(path);
        }
        if let Some(target) = lookup("HYPERWARP_TARGET") {
            opts.hyperwarp_target = target;
        }
    }

    /// Drop unusable users and make sure a signing secret exists.
    pub fn finish(&mut self) {
        if self.app_specs.is_empty() {
            warn!("No appSpecs configured, server won't be able to do much");
        }

        let mut index = 0;
        self.users.retain(|user| {
            let keep = if user.id.is_empty() {
                warn!(index, "No user id specified, skipping");
                false
            } else if !user.has_credential() {
                warn!(index, "No password or access token specified, skipping");
                false
            } else {
                true
            };
            index += 1;
            keep
        });
        if self.users.is_empty() {
            warn!("Config specifies no users");
        }

        if self.secret.is_none() {
            warn!("No secret configured, generating one; issued tokens will not survive a restart");
            self.secret = Some(random_token());
        }
        info!(
            apps = self.app_specs.len(),
            users = self.users.len(),
            "Configuration loaded"
        );
    }

    pub fn secret(&self) -> &str {
        self.secret.as_deref().unwrap_or_default()
    }

    pub fn find_user(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn find_app(&self, id: &str) -> Option<&AppSpec> {
        self.app_specs.iter().find(|a| a.id == id)
    }
}

fn default_true() -> bool { true }
fn default_user_name() -> String { "Nameless User".to_string() }
fn default_display_name() -> String { "Untitled App".to_string() }
fn default_description() -> String { "No description provided.".to_string() }
fn default_poster() -> String { "/assets/poster_placeholder.png".to_string() }
fn default_hyperwarp_path() -> PathBuf { PathBuf::from(DEFAULT_HYPERWARP_PATH) }
fn default_hyperwarp_target() -> String { "release".to_string() }
fn default_socket_dir() -> PathBuf { PathBuf::from("/tmp/stargate") }
fn default_proc_exit_timeout_ms() -> u64 { DEFAULT_PROC_EXIT_TIMEOUT_MS }
fn default_poll_interval_ms() -> u64 { DEFAULT_POLL_INTERVAL_MS }
fn default_poll_attempts() -> u32 { DEFAULT_POLL_ATTEMPTS }
fn default_relay_endpoint() -> String { "ws://127.0.0.1:8001/api/v1/ws".to_string() }
fn default_streamer_mode() -> String { "ws".to_string() }
fn default_session_max_length_secs() -> u64 { 24 * 60 * 60 }
