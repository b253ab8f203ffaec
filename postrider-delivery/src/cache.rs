//! Bounded cache of outbound SMTP sessions, keyed by next-hop.
//!
//! The cache is the sole concurrency limiter on outbound I/O: at most
//! `max_concurrent_send_jobs` connections exist at once, shared by every
//! concurrent delivery. Callers borrow a session through
//! [`ClientCache::with_connection`] under a hard `give_up` deadline that
//! covers both the pool wait and the work done on the session.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use postrider_common::{ClientError, NextHop, SmtpClient, internal};
use tokio::time::Instant;

/// Opens new outbound sessions; the wire codec behind it is a collaborator.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: SmtpClient;

    /// Establish a session to the given next-hop.
    ///
    /// # Errors
    /// On connect, greeting, or TLS failure.
    async fn connect(&self, hop: &NextHop) -> Result<Self::Client, ClientError>;
}

/// Outcome of a [`ClientCache::with_connection`] call.
#[derive(Debug)]
pub enum ConnectionOutcome<T> {
    /// The closure ran on a session to this next-hop.
    Ok(NextHop, T),
    /// Establishing a session to this candidate failed.
    ErrorOpeningResource(NextHop, ClientError),
    /// `give_up` elapsed before a session was available.
    GaveUpWaiting,
    /// The cache is shutting down.
    CacheClosed,
}

struct Session<C> {
    client: C,
    uses: u32,
}

struct CacheState<C> {
    idle: HashMap<NextHop, VecDeque<Session<C>>>,
    /// Total live sessions, idle and borrowed.
    open: usize,
    capacity: usize,
    closed: bool,
}

/// Runtime handle the control surface uses to resize the cache without
/// knowing the concrete client type.
pub trait CacheControl: Send + Sync {
    fn set_max_concurrent_send_jobs(&self, n: usize);
    fn max_concurrent_send_jobs(&self) -> usize;
}

/// The bounded connection cache.
pub struct ClientCache<N: Connector> {
    connector: N,
    state: StdMutex<CacheState<N::Client>>,
    freed: tokio::sync::Notify,
    max_session_uses: u32,
}

impl<N: Connector> ClientCache<N> {
    pub fn new(connector: N, max_concurrent_send_jobs: usize, max_session_uses: u32) -> Self {
        Self {
            connector,
            state: StdMutex::new(CacheState {
                idle: HashMap::new(),
                open: 0,
                capacity: max_concurrent_send_jobs.max(1),
                closed: false,
            }),
            freed: tokio::sync::Notify::new(),
            max_session_uses: max_session_uses.max(1),
        }
    }

    /// Borrow a session to the first available candidate and run `f` on it.
    ///
    /// Candidates are tried in order: an idle session is reused when one
    /// exists; otherwise a new one is opened if the capacity budget allows,
    /// falling through to the next candidate when the open fails; otherwise
    /// the call waits for a session to be freed. `ErrorOpeningResource` is
    /// only returned once every candidate has failed to open. The `give_up`
    /// deadline bounds the wait, the connects, and `f` together.
    ///
    /// A session that comes back healthy and under its use limit is parked
    /// for reuse; anything else is closed.
    pub async fn with_connection<T, F>(
        &self,
        candidates: &[NextHop],
        give_up: Duration,
        f: F,
    ) -> ConnectionOutcome<T>
    where
        T: Send,
        F: for<'c> FnOnce(
                &'c mut N::Client,
            ) -> Pin<Box<dyn Future<Output = T> + Send + 'c>>
            + Send,
    {
        if give_up.is_zero() {
            return ConnectionOutcome::GaveUpWaiting;
        }
        let deadline = Instant::now() + give_up;

        // Candidates that already failed to open during this call, and the
        // last such failure for the all-failed outcome.
        let mut failed: Vec<NextHop> = Vec::new();
        let mut last_error: Option<(NextHop, ClientError)> = None;

        let (mut session, hop) = loop {
            let acquired = {
                let mut state = self.lock_state();
                if state.closed {
                    return ConnectionOutcome::CacheClosed;
                }

                let idle = candidates.iter().find_map(|hop| {
                    state
                        .idle
                        .get_mut(hop)
                        .and_then(VecDeque::pop_front)
                        .map(|session| (session, hop.clone()))
                });
                if let Some((session, hop)) = idle {
                    break (session, hop);
                }

                if state.open < state.capacity {
                    match candidates.iter().find(|hop| !failed.contains(*hop)) {
                        Some(hop) => {
                            state.open += 1;
                            Some(hop.clone())
                        }
                        None => {
                            return match last_error.take() {
                                Some((hop, e)) => {
                                    ConnectionOutcome::ErrorOpeningResource(hop, e)
                                }
                                None => ConnectionOutcome::GaveUpWaiting,
                            };
                        }
                    }
                } else {
                    None
                }
            };

            if let Some(hop) = acquired {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, self.connector.connect(&hop)).await {
                    Ok(Ok(client)) => break (Session { client, uses: 0 }, hop),
                    Ok(Err(e)) => {
                        // Fall through to the next candidate.
                        self.drop_slot();
                        last_error = Some((hop.clone(), e));
                        failed.push(hop);
                    }
                    Err(_) => {
                        self.drop_slot();
                        return ConnectionOutcome::GaveUpWaiting;
                    }
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return ConnectionOutcome::GaveUpWaiting;
            }
            if tokio::time::timeout(deadline - now, self.freed.notified())
                .await
                .is_err()
            {
                return ConnectionOutcome::GaveUpWaiting;
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, f(&mut session.client)).await {
            Ok(value) => {
                session.uses += 1;
                self.park(hop.clone(), session).await;
                ConnectionOutcome::Ok(hop, value)
            }
            Err(_) => {
                // The session state mid-command is unknown; discard it.
                self.discard(session).await;
                ConnectionOutcome::GaveUpWaiting
            }
        }
    }

    /// Drain and close every session. Subsequent `with_connection` calls
    /// return [`ConnectionOutcome::CacheClosed`]; borrowed sessions are
    /// closed as they come back.
    pub async fn close(&self) {
        let drained = {
            let mut state = self.lock_state();
            state.closed = true;
            let drained: Vec<Session<N::Client>> = state
                .idle
                .drain()
                .flat_map(|(_, sessions)| sessions)
                .collect();
            state.open -= drained.len();
            drained
        };
        self.freed.notify_waiters();

        internal!(level = INFO, "Closing client cache ({} idle sessions)", drained.len());
        for mut session in drained {
            session.client.close().await;
        }
    }

    async fn park(&self, hop: NextHop, session: Session<N::Client>) {
        let keep = session.client.is_healthy() && session.uses < self.max_session_uses;
        let parked = {
            let mut state = self.lock_state();
            if keep && !state.closed && state.open <= state.capacity {
                state.idle.entry(hop).or_default().push_back(session);
                None
            } else {
                state.open -= 1;
                Some(session)
            }
        };
        self.freed.notify_waiters();

        if let Some(mut session) = parked {
            session.client.close().await;
        }
    }

    async fn discard(&self, mut session: Session<N::Client>) {
        self.drop_slot();
        session.client.close().await;
    }

    fn drop_slot(&self) {
        self.lock_state().open -= 1;
        self.freed.notify_waiters();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState<N::Client>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn open_sessions(&self) -> usize {
        self.lock_state().open
    }
}

impl<N: Connector> CacheControl for ClientCache<N> {
    /// Resize the budget. Growing wakes waiters; shrinking lets borrowed
    /// sessions drain naturally, since `park` closes any session that comes
    /// back over budget.
    fn set_max_concurrent_send_jobs(&self, n: usize) {
        let mut state = self.lock_state();
        state.capacity = n.max(1);
        // Surplus idle sessions are dropped here; the rest drain on return.
        let mut surplus = Vec::new();
        while state.open > state.capacity {
            let Some(hop) = state
                .idle
                .iter()
                .find(|(_, q)| !q.is_empty())
                .map(|(hop, _)| hop.clone())
            else {
                break;
            };
            if let Some(session) = state.idle.get_mut(&hop).and_then(VecDeque::pop_front) {
                state.open -= 1;
                surplus.push(session);
            }
        }
        drop(state);
        // Closing is graceful-best-effort; these sessions are idle.
        drop(surplus);
        self.freed.notify_waiters();
    }

    fn max_concurrent_send_jobs(&self) -> usize {
        self.lock_state().capacity
    }
}
