//! A renewable timeout service.
//!
//! Roles arm named timeouts (election, heartbeat) which fire once and then
//! stay quiet until renewed. Expiry is delivered by calling the callback
//! registered at creation; callbacks enqueue an event into the node's inbound
//! queue, so expirations flow through the same serialized handling path as
//! every other message.
//!
//! The driver is a single task polling at millisecond resolution. The
//! schedule itself is a plain data structure with no timers of its own, so
//! the due/renew/cancel logic is testable with fabricated clock readings.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::thread_rng;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// The named timeouts a node can arm.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TimeoutName {
    Election,
    Heartbeat,
}

/// Expiry-ordered bookkeeping of armed timeouts.
///
/// Each armed timeout occupies one slot keyed by `(deadline, id)`; the id in
/// the key keeps simultaneous deadlines distinct while preserving ascending
/// expiry order. A fired timeout leaves the queue and re-enters only on
/// renewal.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    queue: BTreeMap<(Instant, u64), u64>,
    armed: BTreeMap<u64, Instant>,
}

impl Schedule {
    /// Arm the timeout `id` to fire at `deadline`, replacing any prior arming.
    pub(crate) fn arm(&mut self, id: u64, deadline: Instant) {
        if let Some(prior) = self.armed.insert(id, deadline) {
            self.queue.remove(&(prior, id));
        }
        self.queue.insert((deadline, id), id);
    }

    /// Disarm the timeout `id`; unknown ids are ignored.
    pub(crate) fn disarm(&mut self, id: u64) {
        if let Some(deadline) = self.armed.remove(&id) {
            self.queue.remove(&(deadline, id));
        }
    }

    /// Remove and return all timeouts due at `now`, in ascending deadline order.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some((&(deadline, id), _)) = self.queue.iter().next() {
            if deadline > now {
                break;
            }
            self.queue.remove(&(deadline, id));
            self.armed.remove(&id);
            due.push(id);
        }
        due
    }

    pub(crate) fn is_armed(&self, id: u64) -> bool {
        self.armed.contains_key(&id)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

type Callback = Box<dyn Fn() + Send + 'static>;

enum Op {
    Create {
        id: u64,
        name: TimeoutName,
        delay: Duration,
        jitter: Duration,
        callback: Callback,
    },
    Renew {
        id: u64,
    },
    Cancel {
        id: u64,
    },
}

struct Registered {
    name: TimeoutName,
    delay: Duration,
    jitter: Duration,
    callback: Callback,
}

/// A handle to the timeout service for arming new timeouts.
#[derive(Clone)]
pub(crate) struct TimeoutService {
    ops_tx: mpsc::UnboundedSender<Op>,
    next_id: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl TimeoutService {
    /// Spawn the driver task and return a handle to it.
    ///
    /// The driver runs until every `TimeoutService` clone and every
    /// `TimeoutHandle` has been dropped.
    pub(crate) fn spawn() -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        tokio::spawn(driver(ops_rx));
        Self {
            ops_tx,
            next_id: Default::default(),
        }
    }

    /// Create and arm a new timeout.
    ///
    /// Each time the timeout fires, `callback` is invoked from the driver
    /// task and the timeout stays quiet until renewed through the returned
    /// handle. Every (re)arming picks a fresh deadline of
    /// `delay + rand(0..=jitter)` from that moment.
    pub(crate) fn create(
        &self,
        name: TimeoutName,
        delay: Duration,
        jitter: Duration,
        callback: impl Fn() + Send + 'static,
    ) -> TimeoutHandle {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let _ = self.ops_tx.send(Op::Create {
            id,
            name,
            delay,
            jitter,
            callback: Box::new(callback),
        });
        TimeoutHandle {
            id,
            ops_tx: self.ops_tx.clone(),
        }
    }
}

/// A handle to one armed timeout.
///
/// Dropping the handle cancels the timeout.
pub(crate) struct TimeoutHandle {
    id: u64,
    ops_tx: mpsc::UnboundedSender<Op>,
}

impl TimeoutHandle {
    /// Re-arm the timeout for a fresh delay from now.
    pub(crate) fn renew(&self) {
        let _ = self.ops_tx.send(Op::Renew { id: self.id });
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        let _ = self.ops_tx.send(Op::Cancel { id: self.id });
    }
}

/// How often the driver checks for due timeouts.
const TICK: Duration = Duration::from_millis(1);

async fn driver(mut ops_rx: mpsc::UnboundedReceiver<Op>) {
    let mut schedule = Schedule::default();
    let mut registered: BTreeMap<u64, Registered> = BTreeMap::new();
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;

        // Apply pending ops before checking deadlines so a renewal racing an
        // expiry wins.
        loop {
            match ops_rx.try_recv() {
                Ok(Op::Create {
                    id,
                    name,
                    delay,
                    jitter,
                    callback,
                }) => {
                    let reg = Registered {
                        name,
                        delay,
                        jitter,
                        callback,
                    };
                    schedule.arm(id, next_deadline(&reg));
                    registered.insert(id, reg);
                }
                Ok(Op::Renew { id }) => {
                    if let Some(reg) = registered.get(&id) {
                        schedule.arm(id, next_deadline(reg));
                    }
                }
                Ok(Op::Cancel { id }) => {
                    schedule.disarm(id);
                    registered.remove(&id);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }

        for id in schedule.pop_due(Instant::now()) {
            if let Some(reg) = registered.get(&id) {
                trace!(id, name = ?reg.name, "timeout fired");
                (reg.callback)();
            }
        }
    }
}

fn next_deadline(reg: &Registered) -> Instant {
    let jitter_ms = reg.jitter.as_millis() as u64;
    let jitter = Duration::from_millis(thread_rng().gen_range(0..=jitter_ms));
    Instant::now() + reg.delay + jitter
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
