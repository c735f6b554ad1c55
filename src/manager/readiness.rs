//! Waiting for the hook layer to open its rendezvous socket.
//!
//! The hooked process gives no push notification when it is ready, so we
//! poll for the socket path on a fixed interval with a hard attempt cap.

use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket showed up on this (1-based) poll.
    Ready { attempt: u32 },
    TimedOut,
    /// A stop arrived before the socket showed up.
    Cancelled,
}

async fn poll_socket(path: &Path, policy: PollPolicy) -> Readiness {
    for attempt in 1..=policy.attempts {
        sleep(policy.interval).await;
        // A plain stat; cheap enough to run on the executor.
        if path.exists() {
            return Readiness::Ready { attempt };
        }
    }
    Readiness::TimedOut
}

/// Poll for `path`, giving up early once `stop` flips to true.
pub async fn wait_for_socket(
    path: &Path,
    policy: PollPolicy,
    mut stop: watch::Receiver<bool>,
) -> Readiness {
    tokio::select! {
        readiness = poll_socket(path, policy) => readiness,
        _ = stop.wait_for(|stopping| *stopping) => Readiness::Cancelled,
    }
}

/// Wait for the socket, then give the hook one more interval to finish
/// binding and run `spawn` exactly once. On timeout or stop `spawn` never runs.
pub async fn handoff<F, Fut>(
    path: &Path,
    policy: PollPolicy,
    mut stop: watch::Receiver<bool>,
    spawn: F,
) -> Readiness
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let readiness = wait_for_socket(path, policy, stop.clone()).await;
    match readiness {
        Readiness::Ready { attempt } => {
            info!(socket = %path.display(), attempt, "Hook socket is up");
            let settled = tokio::select! {
                _ = sleep(policy.interval) => true,
                _ = stop.wait_for(|stopping| *stopping) => false,
            };
            if !settled || *stop.borrow() {
                info!(socket = %path.display(), "Session stopping, not starting the streamer");
                return Readiness::Cancelled;
            }
            spawn().await;
        }
        Readiness::TimedOut => {
            warn!(
                socket = %path.display(),
                attempts = policy.attempts,
                "Hook socket never appeared, not starting the streamer"
            );
        }
        Readiness::Cancelled => {
            info!(socket = %path.display(), "Session stopping, abandoned socket wait");
        }
    }
    readiness
}
