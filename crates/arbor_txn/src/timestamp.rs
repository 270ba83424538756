//! Commit timestamp authority.
//!
//! Issues strictly increasing commit timestamps and tracks which ones are still
//! in flight. `last_finished` only ever advances, and only over a contiguous
//! prefix: every commit issued at or before it has finished.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use arbor_common::error::TimestampError;
use arbor_common::types::Timestamp;

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Result of `start_commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedTimestamp {
    pub timestamp: Timestamp,
    /// `last_finished` at issue time; the commit's causal predecessor.
    pub previous: Timestamp,
}

struct TsState {
    last_issued: Timestamp,
    last_finished: Timestamp,
    /// Issued and not yet ended or failed, in issue order.
    running: BTreeSet<Timestamp>,
    /// Ended, but an older commit is still running.
    finished: BTreeSet<Timestamp>,
}

/// Binary gate held from `start_commit` to `end_commit`/`fail_commit` in strict mode.
struct StrictGate {
    busy: Mutex<bool>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct TsStats {
    issued: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    clock_bumps: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampStatsSnapshot {
    pub issued: u64,
    pub finished: u64,
    pub failed: u64,
    /// Timestamps minted as `last_issued + 1` after the spin bound ran out.
    pub clock_bumps: u64,
    pub running: usize,
}

pub struct TimestampAuthority {
    state: Mutex<TsState>,
    finished_cv: Condvar,
    strict: Option<StrictGate>,
    clock: Arc<dyn Clock>,
    max_spin: Duration,
    cancelled: AtomicBool,
    stats: TsStats,
}

const SPIN_PAUSE: Duration = Duration::from_millis(1);

impl TimestampAuthority {
    /// `initial` is the last timestamp known to be durable (the store's
    /// newest commit, or its creation time).
    pub fn new(initial: Timestamp, strict_ordering: bool, max_spin: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TsState {
                last_issued: initial,
                last_finished: initial,
                running: BTreeSet::new(),
                finished: BTreeSet::new(),
            }),
            finished_cv: Condvar::new(),
            strict: strict_ordering.then(|| StrictGate {
                busy: Mutex::new(false),
                cv: Condvar::new(),
            }),
            clock,
            max_spin,
            cancelled: AtomicBool::new(false),
            stats: TsStats::default(),
        }
    }

    pub fn with_system_clock(initial: Timestamp, strict_ordering: bool, max_spin: Duration) -> Self {
        Self::new(initial, strict_ordering, max_spin, Arc::new(SystemClock))
    }

    /// Mint the next commit timestamp.
    ///
    /// Waits (bounded by `max_spin`) for the clock to pass the last issued
    /// value. If the clock is still behind when the bound runs out, issues
    /// `last_issued + 1`. An `override_ts` is used as-is when it keeps
    /// issuance strictly monotonic.
    pub fn start_commit(&self, override_ts: Option<Timestamp>) -> Result<IssuedTimestamp, TimestampError> {
        if let Some(gate) = &self.strict {
            self.acquire_gate(gate)?;
        }
        let result = self.issue(override_ts);
        if result.is_err() {
            self.release_gate();
        }
        result
    }

    fn issue(&self, override_ts: Option<Timestamp>) -> Result<IssuedTimestamp, TimestampError> {
        if let Some(ts) = override_ts {
            let mut state = self.state.lock();
            if ts <= state.last_issued {
                return Err(TimestampError::OverrideNotMonotonic {
                    requested: ts,
                    last_issued: state.last_issued,
                });
            }
            return Ok(self.issue_locked(&mut state, ts));
        }

        let deadline = Instant::now() + self.max_spin;
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(TimestampError::Cancelled);
            }
            {
                let mut state = self.state.lock();
                let now = self.clock.now();
                if now > state.last_issued {
                    return Ok(self.issue_locked(&mut state, now));
                }
                if Instant::now() >= deadline {
                    let bumped = state.last_issued.next();
                    tracing::warn!(
                        "clock at {} has not passed last issued {}, issuing {}",
                        now,
                        state.last_issued,
                        bumped
                    );
                    self.stats.clock_bumps.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.issue_locked(&mut state, bumped));
                }
            }
            std::thread::sleep(SPIN_PAUSE);
        }
    }

    fn issue_locked(&self, state: &mut TsState, ts: Timestamp) -> IssuedTimestamp {
        state.last_issued = ts;
        state.running.insert(ts);
        self.stats.issued.fetch_add(1, Ordering::Relaxed);
        IssuedTimestamp {
            timestamp: ts,
            previous: state.last_finished,
        }
    }

    /// Retire `ts` as finished and advance `last_finished` over the
    /// contiguous prefix of finished commits.
    pub fn end_commit(&self, ts: Timestamp) {
        {
            let mut state = self.state.lock();
            if state.running.remove(&ts) {
                self.stats.finished.fetch_add(1, Ordering::Relaxed);
                state.finished.insert(ts);
                self.drain_finished(&mut state);
            } else {
                tracing::warn!("end_commit for unknown timestamp {}", ts);
            }
        }
        self.release_gate();
    }

    /// Retire `ts` without finishing it. Commits that finished behind it may
    /// now become visible, but `ts` itself never does.
    pub fn fail_commit(&self, ts: Timestamp) {
        {
            let mut state = self.state.lock();
            if state.running.remove(&ts) {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.drain_finished(&mut state);
            } else {
                tracing::warn!("fail_commit for unknown timestamp {}", ts);
            }
        }
        self.release_gate();
    }

    /// Move finished timestamps older than every running one into `last_finished`.
    fn drain_finished(&self, state: &mut TsState) {
        let oldest_running = state.running.first().copied();
        let mut advanced = state.last_finished;
        while let Some(f) = state.finished.first().copied() {
            if oldest_running.map_or(false, |o| f > o) {
                break;
            }
            state.finished.remove(&f);
            advanced = advanced.max(f);
        }
        if advanced > state.last_finished {
            state.last_finished = advanced;
            self.finished_cv.notify_all();
        }
    }

    pub fn last_finished(&self) -> Timestamp {
        self.state.lock().last_finished
    }

    pub fn last_issued(&self) -> Timestamp {
        self.state.lock().last_issued
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Block until `last_finished` advances or `timeout` elapses, then return it.
    pub fn wait_for_commit(&self, timeout: Duration) -> Timestamp {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let seen = state.last_finished;
        while state.last_finished == seen {
            if self.finished_cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.last_finished
    }

    /// Abort every in-progress and future spin with `TimestampError::Cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.strict {
            let _busy = gate.busy.lock();
            gate.cv.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TimestampStatsSnapshot {
        TimestampStatsSnapshot {
            issued: self.stats.issued.load(Ordering::Relaxed),
            finished: self.stats.finished.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            clock_bumps: self.stats.clock_bumps.load(Ordering::Relaxed),
            running: self.state.lock().running.len(),
        }
    }

    fn acquire_gate(&self, gate: &StrictGate) -> Result<(), TimestampError> {
        let mut busy = gate.busy.lock();
        while *busy {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(TimestampError::Cancelled);
            }
            gate.cv.wait_for(&mut busy, SPIN_PAUSE * 50);
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(TimestampError::Cancelled);
        }
        *busy = true;
        Ok(())
    }

    fn release_gate(&self) {
        if let Some(gate) = &self.strict {
            let mut busy = gate.busy.lock();
            *busy = false;
            gate.cv.notify_one();
        }
    }
}
