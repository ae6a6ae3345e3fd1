//! Process-local reader/writer lock for one physical database file.
//!
//! SQLite reports locking conflicts as errors instead of waiting, so every
//! store serializes writers through a [`Synchronizer`] while readers proceed
//! concurrently. Each logical store owns exactly one instance.
//!
//! Rules:
//! - any number of shared tokens may be held at once;
//! - an exclusive token excludes every other token;
//! - a waiting writer blocks new shared acquisitions from threads that hold no
//!   token yet, so a steady stream of readers cannot starve it;
//! - the thread holding the exclusive token, or any thread already holding a
//!   shared token, may nest further shared acquisitions;
//! - asking for an exclusive token while the same thread holds any token is
//!   refused instead of deadlocking.
//!
//! Tokens release themselves on drop. Bookkeeping mismatches found on release
//! are reported through `log::error!` and a diagnostics counter, and trip a
//! `debug_assert!` in debug builds; they are never returned to the caller.

use crate::error::{LockProtocolError, Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

static NEXT_SYNCHRONIZER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Cumulative counters, intended for diagnostics and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub shared_acquired: u64,
    pub exclusive_acquired: u64,
    /// Acquisitions that had to wait for another holder.
    pub contended_waits: u64,
    pub protocol_violations: u64,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    mode: LockMode,
    thread: ThreadId,
}

#[derive(Default)]
struct State {
    shared_by_thread: HashMap<ThreadId, usize>,
    shared_total: usize,
    writer: Option<ThreadId>,
    writers_waiting: usize,
    held: HashMap<u64, Holder>,
    next_token: u64,
    stats: SyncStats,
}

struct Inner {
    id: u64,
    name: String,
    state: Mutex<State>,
    changed: Condvar,
}

impl Inner {
    // The state mutex never guards user code, so a poisoned guard still holds
    // consistent bookkeeping.
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the state changes. The flag is `false` once `deadline` has passed.
    fn wait<'a>(
        &'a self,
        guard: MutexGuard<'a, State>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, State>, bool) {
        match deadline {
            None => (
                self.changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                true,
            ),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (guard, false);
                }
                let (guard, _) = self
                    .changed
                    .wait_timeout(guard, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, true)
            }
        }
    }

    fn release(&self, token: u64) {
        let mut state = self.lock_state();
        let Some(holder) = state.held.remove(&token) else {
            state.stats.protocol_violations += 1;
            drop(state);
            report_violation(&LockProtocolError::NotHeld {
                store: self.name.clone(),
                token,
            });
            return;
        };

        match holder.mode {
            LockMode::Shared => {
                if let Some(count) = state.shared_by_thread.get_mut(&holder.thread) {
                    *count -= 1;
                    if *count == 0 {
                        state.shared_by_thread.remove(&holder.thread);
                    }
                }
                state.shared_total = state.shared_total.saturating_sub(1);
            }
            LockMode::Exclusive => {
                state.writer = None;
            }
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// Log a misuse of the lock contract; fatal in debug builds only.
pub(crate) fn report_violation(err: &LockProtocolError) {
    log::error!("lock protocol violation: {err}");
    debug_assert!(false, "lock protocol violation: {err}");
}

/// Reader/writer lock shared by every handle to one store.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Synchronizer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SYNCHRONIZER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Block until a token of `mode` can be granted.
    pub fn acquire(&self, mode: LockMode) -> Result<LockToken> {
        self.acquire_until(mode, None)
    }

    /// Like [`Synchronizer::acquire`], giving up with `LockTimeout` after `timeout`.
    pub fn acquire_timeout(&self, mode: LockMode, timeout: Duration) -> Result<LockToken> {
        self.acquire_until(mode, Some(timeout))
    }

    /// Release `token`, checking that it was issued by this synchronizer.
    ///
    /// A foreign token is reported as a protocol violation and then released
    /// against the synchronizer that issued it.
    pub fn release(&self, token: LockToken) {
        if !Arc::ptr_eq(&token.inner, &self.inner) {
            self.inner.lock_state().stats.protocol_violations += 1;
            report_violation(&LockProtocolError::ForeignToken {
                store: self.inner.name.clone(),
                owner: token.inner.name.clone(),
            });
        }
        token.release();
    }

    pub fn stats(&self) -> SyncStats {
        self.inner.lock_state().stats
    }

    /// The strongest mode held by the calling thread, if any.
    pub fn held_by_current_thread(&self) -> Option<LockMode> {
        let me = thread::current().id();
        let state = self.inner.lock_state();
        if state.writer == Some(me) {
            Some(LockMode::Exclusive)
        } else if state.shared_by_thread.contains_key(&me) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    /// Number of shared tokens currently outstanding, across all threads.
    pub fn shared_holders(&self) -> usize {
        self.inner.lock_state().shared_total
    }

    pub fn is_write_locked(&self) -> bool {
        self.inner.lock_state().writer.is_some()
    }

    /// Threads currently blocked in an exclusive acquisition.
    pub fn waiting_writers(&self) -> usize {
        self.inner.lock_state().writers_waiting
    }

    fn acquire_until(&self, mode: LockMode, timeout: Option<Duration>) -> Result<LockToken> {
        let me = thread::current().id();
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut state = self.inner.lock_state();
        let mut waited = false;

        match mode {
            LockMode::Shared => loop {
                let nested =
                    state.writer == Some(me) || state.shared_by_thread.contains_key(&me);
                if nested || (state.writer.is_none() && state.writers_waiting == 0) {
                    break;
                }
                waited = true;
                let (guard, in_time) = self.inner.wait(state, deadline);
                state = guard;
                if !in_time {
                    return Err(StoreError::LockTimeout {
                        mode,
                        waited: started.elapsed(),
                    });
                }
            },
            LockMode::Exclusive => {
                let held = if state.writer == Some(me) {
                    Some(LockMode::Exclusive)
                } else if state.shared_by_thread.contains_key(&me) {
                    Some(LockMode::Shared)
                } else {
                    None
                };
                if let Some(held) = held {
                    state.stats.protocol_violations += 1;
                    let err = LockProtocolError::Upgrade {
                        store: self.inner.name.clone(),
                        held,
                    };
                    log::error!("lock protocol violation: {err}");
                    return Err(StoreError::LockProtocol(err));
                }

                state.writers_waiting += 1;
                while state.writer.is_some() || state.shared_total > 0 {
                    waited = true;
                    let (guard, in_time) = self.inner.wait(state, deadline);
                    state = guard;
                    if !in_time {
                        state.writers_waiting -= 1;
                        drop(state);
                        // Readers parked behind this writer may proceed now.
                        self.inner.changed.notify_all();
                        return Err(StoreError::LockTimeout {
                            mode,
                            waited: started.elapsed(),
                        });
                    }
                }
                state.writers_waiting -= 1;
            }
        }

        state.next_token += 1;
        let id = state.next_token;
        state.held.insert(id, Holder { mode, thread: me });
        match mode {
            LockMode::Shared => {
                *state.shared_by_thread.entry(me).or_insert(0) += 1;
                state.shared_total += 1;
                state.stats.shared_acquired += 1;
            }
            LockMode::Exclusive => {
                state.writer = Some(me);
                state.stats.exclusive_acquired += 1;
            }
        }
        if waited {
            state.stats.contended_waits += 1;
            log::debug!(
                "{} waited {:?} for {mode} access",
                self.inner.name,
                started.elapsed()
            );
        }

        Ok(LockToken {
            id,
            mode,
            inner: Arc::clone(&self.inner),
            released: false,
        })
    }
}

/// A held permit on one store. Released exactly once: explicitly through
/// [`LockToken::release`] / [`Synchronizer::release`], or on drop.
#[must_use = "dropping a lock token releases it immediately"]
pub struct LockToken {
    id: u64,
    mode: LockMode,
    inner: Arc<Inner>,
    released: bool,
}

impl LockToken {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(self.id);
        }
    }
}

impl PartialEq for LockToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.id == other.id
    }
}

impl Eq for LockToken {}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("store", &self.inner.name)
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        self.release_once();
    }
}
