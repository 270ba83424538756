//! Read / write / option lock table.
//!
//! - READ is shared and counted per holder.
//! - WRITE is exclusive and reentrant (counted). A holder may upgrade from its
//!   own READ locks.
//! - OPTION is an exclusive reservation. It blocks other options and other
//!   writers but not readers.
//!
//! A request for a set of keys is granted all at once or not at all. Waiters
//! park on one condvar that every release signals. All mutations go through
//! one table-wide mutex.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use arbor_common::error::LockError;
use arbor_common::types::LockType;

struct LockEntry<H> {
    readers: HashMap<H, u32>,
    writer: Option<(H, u32)>,
    option: Option<H>,
}

impl<H: Eq + Hash + Clone> LockEntry<H> {
    fn new() -> Self {
        Self {
            readers: HashMap::new(),
            writer: None,
            option: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.option.is_none()
    }

    fn writer_is_other(&self, holder: &H) -> bool {
        self.writer.as_ref().map_or(false, |(w, _)| w != holder)
    }

    fn option_is_other(&self, holder: &H) -> bool {
        self.option.as_ref().map_or(false, |o| o != holder)
    }

    fn can_lock(&self, lock_type: LockType, holder: &H) -> bool {
        match lock_type {
            LockType::Read => !self.writer_is_other(holder),
            LockType::Write => {
                !self.writer_is_other(holder)
                    && !self.option_is_other(holder)
                    && self.readers.keys().all(|r| r == holder)
            }
            LockType::Option => !self.option_is_other(holder) && !self.writer_is_other(holder),
        }
    }

    fn grant(&mut self, lock_type: LockType, holder: &H) {
        match lock_type {
            LockType::Read => *self.readers.entry(holder.clone()).or_insert(0) += 1,
            LockType::Write => match &mut self.writer {
                Some((_, count)) => *count += 1,
                None => self.writer = Some((holder.clone(), 1)),
            },
            LockType::Option => self.option = Some(holder.clone()),
        }
    }

    fn holds(&self, lock_type: LockType, holder: &H) -> bool {
        match lock_type {
            LockType::Read => self.readers.contains_key(holder),
            LockType::Write => self.writer.as_ref().map_or(false, |(w, _)| w == holder),
            LockType::Option => self.option.as_ref() == Some(holder),
        }
    }

    fn held_by_other(&self, lock_type: LockType, holder: &H) -> bool {
        match lock_type {
            LockType::Read => self.readers.keys().any(|r| r != holder),
            LockType::Write => self.writer_is_other(holder),
            LockType::Option => self.option_is_other(holder),
        }
    }

    /// Drop one level of `lock_type`. Caller checked `holds`.
    fn release_one(&mut self, lock_type: LockType, holder: &H) {
        match lock_type {
            LockType::Read => {
                if let Some(count) = self.readers.get_mut(holder) {
                    *count -= 1;
                    if *count == 0 {
                        self.readers.remove(holder);
                    }
                }
            }
            LockType::Write => {
                if let Some((_, count)) = &mut self.writer {
                    *count -= 1;
                    if *count == 0 {
                        self.writer = None;
                    }
                }
            }
            LockType::Option => self.option = None,
        }
    }

    /// Drop every lock `holder` has here; returns the released types.
    fn release_all(&mut self, holder: &H) -> Vec<LockType> {
        let mut released = Vec::new();
        if self.readers.remove(holder).is_some() {
            released.push(LockType::Read);
        }
        if self.writer.as_ref().map_or(false, |(w, _)| w == holder) {
            self.writer = None;
            released.push(LockType::Write);
        }
        if self.option.as_ref() == Some(holder) {
            self.option = None;
            released.push(LockType::Option);
        }
        released
    }

    fn replace_holder(&mut self, old: &H, new: &H) -> bool {
        let mut changed = false;
        if let Some(count) = self.readers.remove(old) {
            *self.readers.entry(new.clone()).or_insert(0) += count;
            changed = true;
        }
        if let Some((w, _)) = &mut self.writer {
            if w == old {
                *w = new.clone();
                changed = true;
            }
        }
        if self.option.as_ref() == Some(old) {
            self.option = Some(new.clone());
            changed = true;
        }
        changed
    }
}

/// Point-in-time view of one key's holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState<K, H> {
    pub key: K,
    pub readers: Vec<H>,
    pub writer: Option<H>,
    pub option: Option<H>,
}

/// Outcome of a lock request.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<K, H> {
    /// Every key granted; states after the grant.
    Granted(Vec<LockState<K, H>>),
    /// Nothing granted. `blocked` are the keys still unavailable at the deadline.
    TimedOut { blocked: Vec<K> },
}

impl<K, H> LockOutcome<K, H> {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted(_))
    }
}

#[derive(Debug, Default)]
struct LockStats {
    granted: AtomicU64,
    timed_out: AtomicU64,
    waits: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    pub granted: u64,
    pub timed_out: u64,
    pub waits: u64,
    pub released: u64,
    pub locked_keys: usize,
}

pub struct LockTable<K, H> {
    entries: Mutex<HashMap<K, LockEntry<H>>>,
    released: Condvar,
    stats: LockStats,
}

impl<K, H> LockTable<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            stats: LockStats::default(),
        }
    }

    /// Lock every key in `keys` for `holder`, waiting up to `timeout`.
    /// A zero timeout tries exactly once.
    pub fn lock(&self, lock_type: LockType, holder: &H, keys: &[K], timeout: Duration) -> LockOutcome<K, H> {
        let keys = dedup(keys);
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            let blocked: Vec<K> = keys
                .iter()
                .filter(|k| {
                    entries
                        .get(*k)
                        .map_or(false, |e| !e.can_lock(lock_type, holder))
                })
                .cloned()
                .collect();
            if blocked.is_empty() {
                let mut states = Vec::with_capacity(keys.len());
                for key in &keys {
                    let entry = entries.entry(key.clone()).or_insert_with(LockEntry::new);
                    entry.grant(lock_type, holder);
                    states.push(snapshot(key, entry));
                }
                self.stats.granted.fetch_add(keys.len() as u64, Ordering::Relaxed);
                return LockOutcome::Granted(states);
            }
            if Instant::now() >= deadline {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(?holder, ?blocked, "{} lock request timed out", lock_type);
                return LockOutcome::TimedOut { blocked };
            }
            self.stats.waits.fetch_add(1, Ordering::Relaxed);
            self.released.wait_until(&mut entries, deadline);
        }
    }

    /// Release one level of `lock_type` on each key. Fails without releasing
    /// anything if `holder` lacks the lock on any key.
    pub fn unlock(&self, lock_type: LockType, holder: &H, keys: &[K]) -> Result<Vec<LockState<K, H>>, LockError> {
        let keys = dedup(keys);
        let mut entries = self.entries.lock();
        if let Some(missing) = keys
            .iter()
            .find(|k| !entries.get(*k).map_or(false, |e| e.holds(lock_type, holder)))
        {
            return Err(LockError::NotHeld {
                lock_type,
                key: format!("{:?}", missing),
                holder: format!("{:?}", holder),
            });
        }
        let mut states = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(entry) = entries.get_mut(key) {
                entry.release_one(lock_type, holder);
                states.push(snapshot(key, entry));
                if entry.is_empty() {
                    entries.remove(key);
                }
            }
        }
        self.stats.released.fetch_add(keys.len() as u64, Ordering::Relaxed);
        self.released.notify_all();
        Ok(states)
    }

    /// Release every lock type `holder` has on `keys`.
    pub fn unlock_keys(&self, holder: &H, keys: &[K]) -> Vec<(K, LockType)> {
        let mut entries = self.entries.lock();
        let mut released = Vec::new();
        for key in dedup(keys) {
            if let Some(entry) = entries.get_mut(&key) {
                for t in entry.release_all(holder) {
                    released.push((key.clone(), t));
                }
                if entry.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        self.finish_release(released)
    }

    /// Release everything `holder` has.
    pub fn unlock_all(&self, holder: &H) -> Vec<(K, LockType)> {
        let mut entries = self.entries.lock();
        let mut released = Vec::new();
        entries.retain(|key, entry| {
            for t in entry.release_all(holder) {
                released.push((key.clone(), t));
            }
            !entry.is_empty()
        });
        self.finish_release(released)
    }

    fn finish_release(&self, released: Vec<(K, LockType)>) -> Vec<(K, LockType)> {
        if !released.is_empty() {
            self.stats
                .released
                .fetch_add(released.len() as u64, Ordering::Relaxed);
            self.released.notify_all();
        }
        released
    }

    /// Hand every lock of `old` over to `new`. Returns the number of keys touched.
    pub fn change_holder(&self, old: &H, new: &H) -> usize {
        let mut entries = self.entries.lock();
        let n = entries
            .values_mut()
            .filter_map(|e| e.replace_holder(old, new).then_some(()))
            .count();
        if n > 0 {
            self.released.notify_all();
        }
        n
    }

    pub fn has_lock(&self, lock_type: LockType, holder: &H, key: &K) -> bool {
        self.entries
            .lock()
            .get(key)
            .map_or(false, |e| e.holds(lock_type, holder))
    }

    pub fn has_lock_by_others(&self, lock_type: LockType, holder: &H, key: &K) -> bool {
        self.entries
            .lock()
            .get(key)
            .map_or(false, |e| e.held_by_other(lock_type, holder))
    }

    pub fn writer_of(&self, key: &K) -> Option<H> {
        self.entries
            .lock()
            .get(key)
            .and_then(|e| e.writer.as_ref().map(|(w, _)| w.clone()))
    }

    pub fn lock_state(&self, key: &K) -> Option<LockState<K, H>> {
        self.entries.lock().get(key).map(|e| snapshot(key, e))
    }

    /// Every `(key, type)` pair `holder` currently has.
    pub fn locks_of(&self, holder: &H) -> Vec<(K, LockType)> {
        let entries = self.entries.lock();
        let mut out = Vec::new();
        for (key, entry) in entries.iter() {
            for t in LockType::ALL {
                if entry.holds(t, holder) {
                    out.push((key.clone(), t));
                }
            }
        }
        out
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            granted: self.stats.granted.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            locked_keys: self.entries.lock().len(),
        }
    }
}

impl<K, H> Default for LockTable<K, H>
where
    K: Eq + Hash + Clone + Debug,
    H: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

fn dedup<K: Eq + Hash + Clone>(keys: &[K]) -> Vec<K> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter().filter(|k| seen.insert((*k).clone())).cloned().collect()
}

fn snapshot<K: Clone, H: Clone>(key: &K, entry: &LockEntry<H>) -> LockState<K, H> {
    LockState {
        key: key.clone(),
        readers: entry.readers.keys().cloned().collect(),
        writer: entry.writer.as_ref().map(|(w, _)| w.clone()),
        option: entry.option.clone(),
    }
}
