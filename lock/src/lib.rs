//! Coordination between staging moves and repository builds.
//!
//! The upload pipeline has two kinds of filesystem operations: *moves*
//! (finalizing an uploaded file into the staging tree) and *exec-once*
//! operations (snapshotting the staging tree and rebuilding repositories).
//! Any number of moves may run concurrently, but an exec-once operation must
//! observe a frozen staging tree: it waits for every move that was in flight
//! when it claimed the slot, and moves requested while it holds the slot wait
//! for it to finish.
//!
//! Exec-once operations are self-coalescing. While one is active, the first
//! additional request becomes the single queued follow-up; every further
//! concurrent request simply shares the queued operation's eventual result.
//! Queue depth is therefore bounded at one and an exec-once body never runs
//! more than once per admission.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch};

/// Returned to exec-once waiters whose underlying execution was dropped
/// before it produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("exec-once operation was cancelled before completing")]
pub struct ExecCancelled;

/// Completion signal for a single move operation. The sender side lives in a
/// guard held across the move body, so a dropped move still resolves.
type MoveTicket = oneshot::Receiver<()>;

/// Shared completion channel for one exec-once execution. `None` until the
/// runner publishes its result; a closed channel means the runner was
/// dropped.
type DoneRx<R> = watch::Receiver<Option<R>>;

struct Active<R> {
    done: DoneRx<R>,
    /// Moves the runner must await before executing its body. Tickets stay
    /// here (popped one at a time) so that a runner dropped mid-drain hands
    /// the remainder to its successor.
    drain: Vec<MoveTicket>,
}

struct State<R> {
    next_move_id: u64,
    moves: HashMap<u64, MoveTicket>,
    active: Option<Active<R>>,
    queued: Option<DoneRx<R>>,
}

impl<R> State<R> {
    /// Release the active slot: promote the queued exec (if any), handing it
    /// the current pending-move set plus whatever the departing runner left
    /// undrained. Without a successor, undrained tickets go back into the
    /// pending set so a later exec still waits for those moves.
    fn promote(&mut self) {
        let leftovers = self.active.take().map(|a| a.drain).unwrap_or_default();
        match self.queued.take() {
            Some(next) => {
                let mut drain: Vec<MoveTicket> = std::mem::take(&mut self.moves)
                    .into_values()
                    .collect();
                drain.extend(leftovers);
                self.active = Some(Active { done: next, drain });
            }
            None => {
                for ticket in leftovers {
                    let id = self.next_move_id;
                    self.next_move_id += 1;
                    self.moves.insert(id, ticket);
                }
            }
        }
    }
}

/// Arbitrates unbounded concurrent move operations against mutually
/// exclusive, self-coalescing exec-once operations.
///
/// `R` is the exec-once result type, shared by value with every coalesced
/// waiter.
pub struct OpLock<R: Clone> {
    state: Arc<Mutex<State<R>>>,
}

impl<R: Clone> Clone for OpLock<R> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: Clone> Default for OpLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

enum Admission<R> {
    /// This call runs the body, optionally after waiting for a predecessor.
    Run {
        predecessor: Option<DoneRx<R>>,
        tx: watch::Sender<Option<R>>,
    },
    /// This call shares the queued execution's result and runs nothing.
    Coalesce(DoneRx<R>),
}

impl<R: Clone> OpLock<R> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_move_id: 0,
                moves: HashMap::new(),
                active: None,
                queued: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<R>> {
        self.state.lock().expect("coordinator state poisoned")
    }

    /// Run a move operation.
    ///
    /// The operation is tracked in the pending-move set for its whole
    /// duration. If an exec-once operation is active at admission time, the
    /// move waits for that execution (and only that one) before running.
    pub async fn with_move<T, F>(&self, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let (tx, rx) = oneshot::channel::<()>();
        let (id, active_done) = {
            let mut state = self.lock();
            let id = state.next_move_id;
            state.next_move_id += 1;
            state.moves.insert(id, rx);
            (id, state.active.as_ref().map(|a| a.done.clone()))
        };
        let _ticket = MoveGuard {
            id,
            state: Arc::clone(&self.state),
            _tx: tx,
        };
        if let Some(mut done) = active_done {
            // A closed channel means the exec was dropped; either way the
            // slot is no longer blocking this move.
            let _ = done.wait_for(|v| v.is_some()).await;
        }
        op.await
    }

    /// Run an exec-once operation, or share the result of one that is
    /// already on its way.
    ///
    /// Admission has three cases: claim the slot immediately, become the
    /// single queued follow-up behind the active execution, or coalesce onto
    /// an already-queued follow-up. A runner drains the moves that were
    /// pending when it claimed the slot, runs `op`, promotes the queued
    /// execution, and only then publishes its result.
    pub async fn exec_once<F>(&self, op: F) -> Result<R, ExecCancelled>
    where
        F: Future<Output = R>,
    {
        let admission = {
            let mut state = self.lock();
            if state.active.is_none() {
                let (tx, rx) = watch::channel(None);
                let drain = std::mem::take(&mut state.moves).into_values().collect();
                state.active = Some(Active { done: rx, drain });
                Admission::Run {
                    predecessor: None,
                    tx,
                }
            } else if let Some(queued) = state.queued.as_ref() {
                Admission::Coalesce(queued.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                let predecessor = state.active.as_ref().map(|a| a.done.clone());
                state.queued = Some(rx);
                Admission::Run { predecessor, tx }
            }
        };

        let (predecessor, tx) = match admission {
            Admission::Coalesce(rx) => return Self::await_result(rx).await,
            Admission::Run { predecessor, tx } => (predecessor, tx),
        };

        let mut guard = RunnerGuard {
            state: Arc::clone(&self.state),
            identity: tx.subscribe(),
            disarmed: false,
        };

        if let Some(rx) = predecessor {
            // The predecessor's value is irrelevant; completion or a dropped
            // runner both release the slot to us.
            let _ = Self::await_result(rx).await;
            self.adopt_slot(&guard.identity);
        }

        // Drain one ticket at a time so the remainder stays visible to a
        // successor if this future is dropped mid-drain.
        loop {
            let ticket = {
                let mut state = self.lock();
                state.active.as_mut().and_then(|a| a.drain.pop())
            };
            match ticket {
                // A dropped sender counts as completion.
                Some(ticket) => {
                    let _ = ticket.await;
                }
                None => break,
            }
        }

        let result = op.await;

        {
            let mut state = self.lock();
            state.promote();
        }
        guard.disarmed = true;
        let _ = tx.send(Some(result.clone()));
        Ok(result)
    }

    /// After the predecessor releases, this call owns the active slot. The
    /// normal path is promotion by the predecessor; if the predecessor was a
    /// queued runner that was dropped before ever becoming active, the slot
    /// it left behind is adopted here, inheriting its undrained tickets and
    /// the current pending-move set.
    fn adopt_slot(&self, identity: &DoneRx<R>) {
        let mut state = self.lock();
        let promoted = state
            .active
            .as_ref()
            .is_some_and(|a| a.done.same_channel(identity));
        if promoted {
            return;
        }
        let mut drain: Vec<MoveTicket> = state.active.take().map(|a| a.drain).unwrap_or_default();
        drain.extend(std::mem::take(&mut state.moves).into_values());
        state.queued = None;
        state.active = Some(Active {
            done: identity.clone(),
            drain,
        });
    }

    async fn await_result(mut rx: DoneRx<R>) -> Result<R, ExecCancelled> {
        let value = rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| ExecCancelled)?;
        match &*value {
            Some(result) => Ok(result.clone()),
            None => Err(ExecCancelled),
        }
    }
}

/// Keeps a move's completion sender alive for the duration of its body and
/// removes the pending-set entry once the move ends (by any path).
struct MoveGuard<R> {
    id: u64,
    state: Arc<Mutex<State<R>>>,
    _tx: oneshot::Sender<()>,
}

impl<R> Drop for MoveGuard<R> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.moves.remove(&self.id);
        }
    }
}

/// Ensures a runner that is dropped mid-flight still releases whichever slot
/// it holds: a dead queued runner clears the queue, a dead active runner
/// promotes its successor. Waiters observe the closed channel as
/// [`ExecCancelled`].
struct RunnerGuard<R: Clone> {
    state: Arc<Mutex<State<R>>>,
    identity: DoneRx<R>,
    disarmed: bool,
}

impl<R: Clone> Drop for RunnerGuard<R> {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let is_queued = state
            .queued
            .as_ref()
            .is_some_and(|q| q.same_channel(&self.identity));
        if is_queued {
            state.queued = None;
            return;
        }
        let is_active = state
            .active
            .as_ref()
            .is_some_and(|a| a.done.same_channel(&self.identity));
        if is_active {
            state.promote();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn move_returns_body_result() {
        let lock: OpLock<()> = OpLock::new();
        let out = lock.with_move(async { 42 }).await;
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn exec_once_runs_and_returns() {
        let lock: OpLock<u32> = OpLock::new();
        let out = lock.exec_once(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn sequential_execs_each_run() {
        let lock: OpLock<usize> = OpLock::new();
        let calls = AtomicUsize::new(0);
        for expected in 1..=3 {
            let out = lock
                .exec_once(async { calls.fetch_add(1, Ordering::SeqCst) + 1 })
                .await
                .unwrap();
            assert_eq!(out, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pending_set_is_emptied_after_moves() {
        let lock: OpLock<()> = OpLock::new();
        lock.with_move(async {}).await;
        lock.with_move(async {}).await;
        assert!(lock.lock().moves.is_empty());
    }

    #[tokio::test]
    async fn slots_are_clear_after_exec() {
        let lock: OpLock<u8> = OpLock::new();
        lock.exec_once(async { 1 }).await.unwrap();
        let state = lock.lock();
        assert!(state.active.is_none());
        assert!(state.queued.is_none());
    }
}
