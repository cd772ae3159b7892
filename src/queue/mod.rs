//! Per-connection operation queue.
//!
//! Every engine call is wrapped in an [`Operation`] and submitted here. The queue decides
//! when each one may start based on the connection's [`SchedulingPolicy`], the operation's
//! dispatch class and the lane (statement or backup session) it belongs to.
//!
//! Dispatch is captured when an operation is submitted:
//! - `Serial` (sequential policy) starts only when nothing else is in flight.
//! - `Parallel` (concurrent policy) starts unless a serial or exclusive operation is running
//!   or another operation of the same lane is in flight.
//! - `Exclusive` (exec, wait, close) behaves as `Serial` under both policies.
//!
//! Pending entries are scanned in submission order. A blocked serial or exclusive entry stops
//! the scan; a parallel entry waiting on its lane is skipped so other lanes can proceed.

mod operation;
mod pending;

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::SqlSchedulerError;
use crate::types::SchedulingPolicy;

pub use operation::OperationKind;
pub use pending::Pending;
pub(crate) use operation::{Operation, Task};

/// Ordering domain for the operations of one statement or backup session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LaneId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Serial,
    Parallel,
    Exclusive,
}

struct Entry {
    op: Box<dyn Operation>,
    dispatch: Dispatch,
    lane: Option<LaneId>,
}

struct QueueState {
    policy: SchedulingPolicy,
    in_flight: usize,
    barrier_running: bool,
    busy_lanes: HashSet<LaneId>,
    pending: VecDeque<Entry>,
    /// Set once the engine handle is gone; later submissions are rejected with it.
    shut: Option<SqlSchedulerError>,
}

impl QueueState {
    fn can_start(&self, entry: &Entry) -> bool {
        match entry.dispatch {
            Dispatch::Serial | Dispatch::Exclusive => self.in_flight == 0,
            Dispatch::Parallel => {
                !self.barrier_running
                    && entry.lane.is_none_or(|lane| !self.busy_lanes.contains(&lane))
            }
        }
    }

    fn mark_started(&mut self, entry: &Entry) {
        self.in_flight += 1;
        if entry.dispatch != Dispatch::Parallel {
            self.barrier_running = true;
        }
        if let Some(lane) = entry.lane {
            self.busy_lanes.insert(lane);
        }
    }

    fn take_ready(&mut self) -> Vec<Entry> {
        let mut ready = Vec::new();
        let mut idx = 0;
        while idx < self.pending.len() {
            if self.can_start(&self.pending[idx]) {
                if let Some(entry) = self.pending.remove(idx) {
                    self.mark_started(&entry);
                    ready.push(entry);
                }
                continue;
            }
            if self.pending[idx].dispatch != Dispatch::Parallel || self.barrier_running {
                break;
            }
            idx += 1;
        }
        ready
    }
}

pub(crate) struct OperationQueue {
    state: Mutex<QueueState>,
    next_lane: AtomicU64,
    runtime: Handle,
}

impl OperationQueue {
    pub(crate) fn new(policy: SchedulingPolicy, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                policy,
                in_flight: 0,
                barrier_running: false,
                busy_lanes: HashSet::new(),
                pending: VecDeque::new(),
                shut: None,
            }),
            next_lane: AtomicU64::new(1),
            runtime,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Critical sections never call user code, so a poisoned lock still holds valid counts.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn allocate_lane(&self) -> LaneId {
        LaneId(self.next_lane.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn policy(&self) -> SchedulingPolicy {
        self.lock().policy
    }

    /// Affects operations submitted from now on; queued ones keep their dispatch.
    pub(crate) fn set_policy(&self, policy: SchedulingPolicy) {
        let mut state = self.lock();
        if state.policy != policy {
            debug!(?policy, "scheduling policy changed");
            state.policy = policy;
        }
    }

    pub(crate) fn submit(
        self: &Arc<Self>,
        op: Box<dyn Operation>,
        lane: Option<LaneId>,
        exclusive: bool,
    ) {
        let ready = {
            let mut state = self.lock();
            if let Some(err) = state.shut.clone() {
                drop(state);
                op.reject(err);
                return;
            }
            let dispatch = if exclusive {
                Dispatch::Exclusive
            } else {
                match state.policy {
                    SchedulingPolicy::Sequential => Dispatch::Serial,
                    SchedulingPolicy::Concurrent => Dispatch::Parallel,
                }
            };
            state.pending.push_back(Entry { op, dispatch, lane });
            state.take_ready()
        };
        self.launch_all(ready);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub(crate) fn queued(&self) -> usize {
        self.lock().pending.len()
    }

    /// Reject everything still queued and refuse later submissions.
    pub(crate) fn fail_pending(&self, err: SqlSchedulerError) {
        let drained: Vec<Entry> = {
            let mut state = self.lock();
            if state.shut.is_none() {
                state.shut = Some(err.clone());
            }
            state.pending.drain(..).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing queued operations");
        }
        for entry in drained {
            entry.op.reject(err.clone());
        }
    }

    fn launch_all(self: &Arc<Self>, ready: Vec<Entry>) {
        for entry in ready {
            self.launch(entry);
        }
    }

    fn launch(self: &Arc<Self>, entry: Entry) {
        let queue = Arc::clone(self);
        let Entry { op, dispatch, lane } = entry;
        let kind = op.kind();
        self.runtime.spawn(async move {
            let fatal = match AssertUnwindSafe(op.start()).catch_unwind().await {
                Ok(completion) => completion.fatal,
                Err(_) => {
                    warn!(%kind, "operation panicked; its caller sees a dropped result");
                    false
                }
            };
            queue.complete(dispatch, lane, fatal);
        });
    }

    fn complete(self: &Arc<Self>, dispatch: Dispatch, lane: Option<LaneId>, fatal: bool) {
        let (ready, drained, err) = {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if dispatch != Dispatch::Parallel {
                state.barrier_running = false;
            }
            if let Some(lane) = lane {
                state.busy_lanes.remove(&lane);
            }
            if fatal {
                let err = state
                    .shut
                    .get_or_insert_with(|| SqlSchedulerError::misuse("Database is closed"))
                    .clone();
                (Vec::new(), state.pending.drain(..).collect::<Vec<_>>(), Some(err))
            } else {
                (state.take_ready(), Vec::new(), None)
            }
        };
        if let Some(err) = err {
            for entry in drained {
                entry.op.reject(err.clone());
            }
        }
        self.launch_all(ready);
    }
}
