//! Bounded reconnection of lost peers.
//!
//! [`ReconnectScheduler`] is a small actor. The connection manager reports a
//! lost peer with [`ReconnectScheduler::peer_lost`]; the scheduler then runs
//! one retry task for that peer which sleeps `interval * (attempts + 1)`,
//! counts the attempt, and redials. A success clears the counter. Once the
//! counter reaches the ceiling the peer is forgotten and no further attempts
//! are made. Cancelling a peer (explicit disconnect) stops its task at the
//! next await point, sleeping or dialing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::PeerError;
use crate::transport::PeerId;

/// Base retry interval.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failed retries after which a peer is dropped.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Interval of the connectivity health check.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff policy for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Base interval; retry `n` (zero-based) waits `interval * (n + 1)`.
    pub interval: Duration,
    /// Failed retries tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: RECONNECT_INTERVAL,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry that follows `attempts` failed retries.
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        self.interval.saturating_mul(attempts.saturating_add(1))
    }
}

/// What the scheduler needs from whoever owns the connections.
pub trait Redial: Send + Sync + 'static {
    /// Dials `peer` once, without re-arming the scheduler on failure.
    fn redial(&self, peer: &PeerId) -> impl Future<Output = Result<(), PeerError>> + Send;

    /// Drops `peer` from the set of peers to stay connected to.
    fn give_up(&self, peer: &PeerId) -> impl Future<Output = ()> + Send;
}

#[derive(Debug)]
enum Command {
    Lost(PeerId),
    Cancel(PeerId),
    CancelAll,
}

/// Handle to the reconnection actor.
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    commands: mpsc::UnboundedSender<Command>,
    attempts: Arc<Mutex<HashMap<PeerId, u32>>>,
    policy: ReconnectPolicy,
}

impl ReconnectScheduler {
    /// Starts the actor. It stops when `shutdown` is cancelled.
    ///
    /// The actor holds `dialer` weakly; retries stop once it is dropped.
    pub fn spawn<D: Redial>(dialer: Weak<D>, policy: ReconnectPolicy, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(run(dialer, policy, shutdown, rx, Arc::clone(&attempts)));
        Self {
            commands: tx,
            attempts,
            policy,
        }
    }

    /// The policy this scheduler applies.
    #[must_use]
    pub const fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Reports that the connection to `peer` was lost or could not be made.
    /// Ignored while a retry task for `peer` is already running.
    pub fn peer_lost(&self, peer: &PeerId) {
        let _ = self.commands.send(Command::Lost(peer.clone()));
    }

    /// Stops retrying `peer` and clears its counter.
    pub fn cancel(&self, peer: &PeerId) {
        self.attempts.lock().remove(peer);
        let _ = self.commands.send(Command::Cancel(peer.clone()));
    }

    /// Stops every retry.
    pub fn cancel_all(&self) {
        self.attempts.lock().clear();
        let _ = self.commands.send(Command::CancelAll);
    }

    /// Failed retries counted so far for `peer`, if it has a counter.
    #[must_use]
    pub fn attempts(&self, peer: &PeerId) -> Option<u32> {
        self.attempts.lock().get(peer).copied()
    }

    /// Peers that currently have a reconnect counter.
    #[must_use]
    pub fn pending(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.attempts.lock().keys().cloned().collect();
        peers.sort();
        peers
    }
}

async fn run<D: Redial>(
    dialer: Weak<D>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<Command>,
    attempts: Arc<Mutex<HashMap<PeerId, u32>>>,
) {
    let mut tasks: HashMap<PeerId, CancellationToken> = HashMap::new();
    loop {
        let cmd = tokio::select! {
            () = shutdown.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            Command::Lost(peer) => {
                if tasks.get(&peer).is_some_and(|t| !t.is_cancelled()) {
                    tracing::debug!(peer_id = %peer, "reconnect already scheduled");
                    continue;
                }
                attempts.lock().entry(peer.clone()).or_insert(0);
                let token = shutdown.child_token();
                tasks.insert(peer.clone(), token.clone());
                tokio::spawn(retry(
                    dialer.clone(),
                    policy,
                    peer,
                    token,
                    Arc::clone(&attempts),
                ));
            }
            Command::Cancel(peer) => {
                if let Some(token) = tasks.remove(&peer) {
                    token.cancel();
                    tracing::debug!(peer_id = %peer, "reconnect cancelled");
                }
                attempts.lock().remove(&peer);
            }
            Command::CancelAll => {
                for (_, token) in tasks.drain() {
                    token.cancel();
                }
                attempts.lock().clear();
            }
        }
    }
    for (_, token) in tasks.drain() {
        token.cancel();
    }
}

async fn retry<D: Redial>(
    dialer: Weak<D>,
    policy: ReconnectPolicy,
    peer: PeerId,
    token: CancellationToken,
    attempts: Arc<Mutex<HashMap<PeerId, u32>>>,
) {
    loop {
        let Some(done) = attempts.lock().get(&peer).copied() else {
            // Counter cleared by a cancel that raced this task.
            break;
        };

        if done >= policy.max_attempts {
            attempts.lock().remove(&peer);
            tracing::warn!(peer_id = %peer, attempts = done, "giving up on peer");
            if let Some(d) = dialer.upgrade() {
                d.give_up(&peer).await;
            }
            break;
        }

        let delay = policy.delay(done);
        tracing::info!(peer_id = %peer, attempt = done + 1, delay_secs = delay.as_secs(), "reconnect scheduled");
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        attempts.lock().insert(peer.clone(), done + 1);

        let Some(d) = dialer.upgrade() else { break };
        let result = tokio::select! {
            () = token.cancelled() => return,
            r = d.redial(&peer) => r,
        };
        match result {
            Ok(()) => {
                attempts.lock().remove(&peer);
                tracing::info!(peer_id = %peer, "reconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer, attempt = done + 1, err = %e, "reconnect failed");
            }
        }
    }
    token.cancel();
}
