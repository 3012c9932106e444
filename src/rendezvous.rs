//! The rendezvous between an SSH session waiting for a certificate and the
//! browser login that vouches for it.
//!
//! Every pending request is keyed by an unguessable single-use code. An entry
//! moves `Pending -> Authenticated -> Consumed`, or to `Expired` from either
//! of the first two states, and never goes back. Each entry carries its own
//! [`watch`] channel, which is both the per-entry lock (all transitions go
//! through [`watch::Sender::send_if_modified`]) and the wake-up signal for the
//! SSH session blocked in [`RendezvousStore::wait`].
//!
//! Consumed entries stay in the table until the reaper drops them, so a
//! replayed callback is told the code was already used.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::{distributions::Alphanumeric, Rng};
use ssh_key::PublicKey;
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::identity::Identity;

/// 32 alphanumeric characters, a little over 190 bits.
pub const CODE_LENGTH: usize = 32;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RendezvousError {
    #[error("no such rendezvous code")]
    NotFound,
    #[error("the rendezvous has expired")]
    Expired,
    #[error("the rendezvous was already authenticated")]
    AlreadyAuthenticated,
    #[error("the rendezvous has not been authenticated")]
    NotAuthenticated,
    #[error("the wait for authentication was cancelled")]
    Cancelled,
}

/// Externally visible state of a rendezvous entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Authenticated,
    Consumed,
    Expired,
}

#[derive(Debug)]
enum State {
    Pending,
    Authenticated { identity: Identity, at: Instant },
    Consumed,
    Expired,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Pending => Phase::Pending,
            State::Authenticated { .. } => Phase::Authenticated,
            State::Consumed => Phase::Consumed,
            State::Expired => Phase::Expired,
        }
    }
}

struct Entry {
    ca: Arc<str>,
    public_key: PublicKey,
    created_at: Instant,
    state: watch::Sender<State>,
}

/// Snapshot of an entry, as shown to the browser.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub ca: Arc<str>,
    pub phase: Phase,
    pub expires_at: Option<Instant>,
}

/// What the SSH session receives once the rendezvous completes.
#[derive(Clone, Debug)]
pub struct Completed {
    pub ca: Arc<str>,
    pub public_key: PublicKey,
    pub identity: Identity,
}

/// Only a prefix of the code ever goes to the logs.
pub(crate) fn code_prefix(code: &str) -> &str {
    code.get(..6).unwrap_or(code)
}

fn gen_code() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(CODE_LENGTH)
        .map(char::from)
        .collect()
}

struct Inner {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    rendezvous_ttl: Duration,
    sso_ttl: Duration,
}

/// In-memory table of rendezvous entries. Cheap to clone.
#[derive(Clone)]
pub struct RendezvousStore {
    inner: Arc<Inner>,
}

impl RendezvousStore {
    /// `rendezvous_ttl` bounds how long a login may take; `sso_ttl` bounds
    /// how long an authenticated entry waits to be claimed, counted from
    /// authentication.
    pub fn new(rendezvous_ttl: Duration, sso_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                rendezvous_ttl,
                sso_ttl,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, code: &str) -> Result<Arc<Entry>, RendezvousError> {
        self.entries()
            .get(code)
            .cloned()
            .ok_or(RendezvousError::NotFound)
    }

    fn remove(&self, code: &str, entry: &Arc<Entry>) {
        let mut entries = self.entries();
        if entries
            .get(code)
            .is_some_and(|stored| Arc::ptr_eq(stored, entry))
        {
            entries.remove(code);
        }
    }

    fn expires_at(&self, entry: &Entry, state: &State) -> Option<Instant> {
        match state {
            State::Pending => Some(entry.created_at + self.inner.rendezvous_ttl),
            State::Authenticated { at, .. } => Some(*at + self.inner.sso_ttl),
            State::Consumed | State::Expired => None,
        }
    }

    /// A consumed entry is kept until it could no longer have been live.
    fn tombstone_until(&self, entry: &Entry) -> Instant {
        entry.created_at + self.inner.rendezvous_ttl + self.inner.sso_ttl
    }

    /// Number of entries, consumed ones not yet reaped included.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a new rendezvous for `public_key` on the CA `ca` and return its code.
    pub fn create(&self, ca: impl Into<Arc<str>>, public_key: PublicKey) -> String {
        let ca = ca.into();
        let (state, _) = watch::channel(State::Pending);
        let mut entries = self.entries();
        let code = loop {
            let code = gen_code();
            if !entries.contains_key(&code) {
                break code;
            }
        };
        entries.insert(
            code.clone(),
            Arc::new(Entry {
                ca: ca.clone(),
                public_key,
                created_at: Instant::now(),
                state,
            }),
        );
        tracing::debug!(%ca, code = code_prefix(&code), "Rendezvous created");
        code
    }

    /// Read-only view of an entry. Entries past their TTL report
    /// [`Phase::Expired`] even before the reaper collects them.
    pub fn lookup(&self, code: &str) -> Result<SessionInfo, RendezvousError> {
        let entry = self.get(code)?;
        let state = entry.state.borrow();
        let expires_at = self.expires_at(&entry, &state);
        let phase = match expires_at {
            Some(deadline) if Instant::now() >= deadline => Phase::Expired,
            _ => state.phase(),
        };
        Ok(SessionInfo {
            ca: entry.ca.clone(),
            phase,
            expires_at,
        })
    }

    /// Attach an identity to a pending entry.
    ///
    /// Fails without touching the entry if it was already authenticated or
    /// consumed, so a late or duplicated callback cannot replace the identity.
    pub fn authenticate(&self, code: &str, identity: Identity) -> Result<(), RendezvousError> {
        let entry = self.get(code)?;
        let now = Instant::now();
        let pending_deadline = entry.created_at + self.inner.rendezvous_ttl;
        let principal = identity.principal().to_string();
        let mut outcome = Ok(());
        entry.state.send_if_modified(|state| match state {
            State::Pending if now >= pending_deadline => {
                *state = State::Expired;
                outcome = Err(RendezvousError::Expired);
                true
            }
            State::Pending => {
                *state = State::Authenticated { identity, at: now };
                true
            }
            State::Authenticated { .. } | State::Consumed => {
                outcome = Err(RendezvousError::AlreadyAuthenticated);
                false
            }
            State::Expired => {
                outcome = Err(RendezvousError::Expired);
                false
            }
        });
        match outcome {
            Ok(()) => {
                tracing::info!(ca = %entry.ca, %principal, code = code_prefix(code), "Rendezvous authenticated");
            }
            Err(RendezvousError::Expired) => self.remove(code, &entry),
            Err(error) => {
                tracing::warn!(ca = %entry.ca, code = code_prefix(code), %error, "Rejected authentication");
            }
        }
        outcome
    }

    fn consume_entry(&self, code: &str, entry: &Arc<Entry>) -> Result<Completed, RendezvousError> {
        let now = Instant::now();
        let sso_ttl = self.inner.sso_ttl;
        let mut outcome = Err(RendezvousError::NotFound);
        entry.state.send_if_modified(|state| {
            let (next, result) = match std::mem::replace(state, State::Consumed) {
                State::Authenticated { at, .. } if now >= at + sso_ttl => {
                    (State::Expired, Err(RendezvousError::Expired))
                }
                State::Authenticated { identity, .. } => (State::Consumed, Ok(identity)),
                State::Pending => (State::Pending, Err(RendezvousError::NotAuthenticated)),
                State::Consumed => (State::Consumed, Err(RendezvousError::NotFound)),
                State::Expired => (State::Expired, Err(RendezvousError::Expired)),
            };
            let modified = result.is_ok() || matches!(next, State::Expired);
            *state = next;
            outcome = result;
            modified
        });
        match outcome {
            Ok(identity) => {
                tracing::debug!(ca = %entry.ca, code = code_prefix(code), "Rendezvous consumed");
                Ok(Completed {
                    ca: entry.ca.clone(),
                    public_key: entry.public_key.clone(),
                    identity,
                })
            }
            Err(RendezvousError::Expired) => {
                self.remove(code, entry);
                Err(RendezvousError::Expired)
            }
            Err(error) => Err(error),
        }
    }

    /// Claim the identity of an authenticated entry. Succeeds at most once per code.
    pub fn consume(&self, code: &str) -> Result<Completed, RendezvousError> {
        let entry = self.get(code)?;
        self.consume_entry(code, &entry)
    }

    /// Move a live entry to `Expired` and drop it from the table.
    fn expire(&self, code: &str, entry: &Arc<Entry>) {
        entry.state.send_if_modified(|state| match state {
            State::Pending | State::Authenticated { .. } => {
                *state = State::Expired;
                true
            }
            State::Consumed | State::Expired => false,
        });
        self.remove(code, entry);
    }

    /// Block until the entry is authenticated, then consume it.
    ///
    /// Returns early with [`RendezvousError::Expired`] when the entry's TTL or
    /// `deadline` passes first, and with [`RendezvousError::Cancelled`] when
    /// `cancel` fires. Either way the entry is abandoned and can no longer be
    /// authenticated.
    pub async fn wait(
        &self,
        code: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Completed, RendezvousError> {
        let entry = self.get(code)?;
        let mut updates = entry.state.subscribe();
        loop {
            // The borrow must end before consume_entry takes the write lock.
            let phase = updates.borrow_and_update().phase();
            let expires_at = match phase {
                Phase::Pending => entry.created_at + self.inner.rendezvous_ttl,
                Phase::Authenticated => return self.consume_entry(code, &entry),
                Phase::Consumed => return Err(RendezvousError::NotFound),
                Phase::Expired => return Err(RendezvousError::Expired),
            };

            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Err(RendezvousError::NotFound);
                    }
                }
                _ = tokio::time::sleep_until(expires_at.min(deadline)) => {
                    self.expire(code, &entry);
                    tracing::info!(ca = %entry.ca, code = code_prefix(code), "Rendezvous expired while waiting");
                    return Err(RendezvousError::Expired);
                }
                _ = cancel.cancelled() => {
                    self.expire(code, &entry);
                    tracing::info!(ca = %entry.ca, code = code_prefix(code), "Rendezvous abandoned");
                    return Err(RendezvousError::Cancelled);
                }
            }
        }
    }

    /// Expire and evict every entry past its TTL, returning how many were removed.
    ///
    /// Consumed entries are evicted as they are; they never move to `Expired`.
    pub fn reap(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            let mut keep = true;
            entry.state.send_if_modified(|state| {
                let expired = match (self.expires_at(entry, state), &*state) {
                    (Some(deadline), _) => now >= deadline,
                    (None, State::Consumed) => {
                        keep = now < self.tombstone_until(entry);
                        return false;
                    }
                    (None, _) => {
                        keep = false;
                        return false;
                    }
                };
                if expired {
                    *state = State::Expired;
                    keep = false;
                }
                expired
            });
            keep
        });
        before - entries.len()
    }

    /// Run [`Self::reap`] every `interval` until `halt` is cancelled.
    pub fn spawn_reaper(&self, interval: Duration, halt: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = halt.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = store.reap();
                        if reaped > 0 {
                            tracing::debug!(reaped, remaining = store.len(), "Reaped expired rendezvous entries");
                        }
                    }
                }
            }
            tracing::debug!("Rendezvous reaper stopped");
        })
    }
}
