//! Durable lock areas.
//!
//! A lock area is the persisted lock set of a view plus the branch point and
//! read-only flag it was opened with. It outlives the session that created it
//! and can be re-attached by id.
//!
//! Two backends: `MemLockAreaStore` (process lifetime) and `FileLockAreaStore`,
//! an append-only journal in the WAL record format:
//! `[len:4][crc32:4][bincode record]`. The journal is replayed and compacted
//! on open; a torn or corrupt tail stops replay at the last good record.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use arbor_common::error::StorageError;
use arbor_common::types::{BranchPoint, DurableLockingId, LockGrade, LockType, ObjectId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockArea {
    pub id: DurableLockingId,
    pub user: String,
    pub branch_point: BranchPoint,
    pub read_only: bool,
    pub locks: BTreeMap<ObjectId, LockGrade>,
}

impl LockArea {
    pub fn lock_count(&self) -> usize {
        self.locks.values().map(|g| g.types().count()).sum()
    }
}

/// Persistence for lock areas.
pub trait LockAreaStore: Send + Sync {
    /// Create an area under a fresh unique id.
    fn create(
        &self,
        user: &str,
        branch_point: BranchPoint,
        read_only: bool,
        locks: BTreeMap<ObjectId, LockGrade>,
    ) -> Result<LockArea, StorageError>;

    fn get(&self, id: &DurableLockingId) -> Result<Option<LockArea>, StorageError>;

    /// All areas, or those of one user.
    fn list(&self, user: Option<&str>) -> Result<Vec<LockArea>, StorageError>;

    /// Switch `lock_type` on or off for `ids`. Objects left without any grade are dropped.
    fn update_locks(
        &self,
        id: &DurableLockingId,
        lock_type: LockType,
        ids: &[ObjectId],
        on: bool,
    ) -> Result<(), StorageError>;

    fn delete(&self, id: &DurableLockingId) -> Result<(), StorageError>;
}

// ── Shared in-memory table ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LockAreaRecord {
    Create(LockArea),
    Update {
        id: DurableLockingId,
        lock_type: LockType,
        ids: Vec<ObjectId>,
        on: bool,
    },
    Delete(DurableLockingId),
}

#[derive(Default)]
struct LockAreaTable {
    areas: BTreeMap<DurableLockingId, LockArea>,
    seq: u64,
}

impl LockAreaTable {
    fn fresh_id(&mut self) -> DurableLockingId {
        loop {
            self.seq += 1;
            let candidate = DurableLockingId(format!("{:012x}{:06x}", Timestamp::now().0, self.seq));
            if !self.areas.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn check(&self, record: &LockAreaRecord) -> Result<(), StorageError> {
        match record {
            LockAreaRecord::Create(area) if self.areas.contains_key(&area.id) => {
                Err(StorageError::LockAreaAlreadyExists(area.id.clone()))
            }
            LockAreaRecord::Update { id, .. } | LockAreaRecord::Delete(id)
                if !self.areas.contains_key(id) =>
            {
                Err(StorageError::LockAreaNotFound(id.clone()))
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, record: LockAreaRecord) {
        match record {
            LockAreaRecord::Create(area) => {
                self.areas.insert(area.id.clone(), area);
            }
            LockAreaRecord::Update {
                id,
                lock_type,
                ids,
                on,
            } => {
                if let Some(area) = self.areas.get_mut(&id) {
                    for oid in ids {
                        let grade = area.locks.get(&oid).copied().unwrap_or_default();
                        let grade = grade.update(lock_type, on);
                        if grade.is_none() {
                            area.locks.remove(&oid);
                        } else {
                            area.locks.insert(oid, grade);
                        }
                    }
                }
            }
            LockAreaRecord::Delete(id) => {
                self.areas.remove(&id);
            }
        }
    }

    fn list(&self, user: Option<&str>) -> Vec<LockArea> {
        self.areas
            .values()
            .filter(|a| user.map_or(true, |u| a.user == u))
            .cloned()
            .collect()
    }
}

// ── In-memory backend ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemLockAreaStore {
    table: Mutex<LockAreaTable>,
}

impl MemLockAreaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockAreaStore for MemLockAreaStore {
    fn create(
        &self,
        user: &str,
        branch_point: BranchPoint,
        read_only: bool,
        locks: BTreeMap<ObjectId, LockGrade>,
    ) -> Result<LockArea, StorageError> {
        let mut table = self.table.lock();
        let area = LockArea {
            id: table.fresh_id(),
            user: user.to_string(),
            branch_point,
            read_only,
            locks,
        };
        table.apply(LockAreaRecord::Create(area.clone()));
        Ok(area)
    }

    fn get(&self, id: &DurableLockingId) -> Result<Option<LockArea>, StorageError> {
        Ok(self.table.lock().areas.get(id).cloned())
    }

    fn list(&self, user: Option<&str>) -> Result<Vec<LockArea>, StorageError> {
        Ok(self.table.lock().list(user))
    }

    fn update_locks(
        &self,
        id: &DurableLockingId,
        lock_type: LockType,
        ids: &[ObjectId],
        on: bool,
    ) -> Result<(), StorageError> {
        let mut table = self.table.lock();
        let record = LockAreaRecord::Update {
            id: id.clone(),
            lock_type,
            ids: ids.to_vec(),
            on,
        };
        table.check(&record)?;
        table.apply(record);
        Ok(())
    }

    fn delete(&self, id: &DurableLockingId) -> Result<(), StorageError> {
        let mut table = self.table.lock();
        let record = LockAreaRecord::Delete(id.clone());
        table.check(&record)?;
        table.apply(record);
        Ok(())
    }
}

// ── File-backed backend ─────────────────────────────────────────────────────

const JOURNAL_FILENAME: &str = "lock_areas.log";
const JOURNAL_TMP_FILENAME: &str = "lock_areas.tmp";

struct FileState {
    table: LockAreaTable,
    writer: BufWriter<File>,
}

pub struct FileLockAreaStore {
    dir: PathBuf,
    state: Mutex<FileState>,
}

fn encode(record: &LockAreaRecord) -> Result<Vec<u8>, StorageError> {
    let data = bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(8 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

fn decode_all(data: &[u8]) -> Vec<LockAreaRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let checksum = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        pos += 8;
        if pos + len > data.len() {
            tracing::warn!("lock area journal truncated at position {}, stopping replay", pos);
            break;
        }
        let payload = &data[pos..pos + len];
        if crc32fast::hash(payload) != checksum {
            tracing::warn!("lock area journal checksum mismatch at position {}, stopping replay", pos);
            break;
        }
        match bincode::deserialize::<LockAreaRecord>(payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("lock area journal decode error at position {}: {}", pos, e);
                break;
            }
        }
        pos += len;
    }
    records
}

impl FileLockAreaStore {
    /// Open (or create) the journal under `dir`, replay it and compact it to
    /// one `Create` record per live area.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(JOURNAL_FILENAME);

        let mut table = LockAreaTable::default();
        if path.exists() {
            let data = fs::read(&path)?;
            for record in decode_all(&data) {
                if table.check(&record).is_ok() {
                    table.apply(record);
                }
            }
        }

        let tmp = dir.join(JOURNAL_TMP_FILENAME);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for area in table.areas.values() {
                out.write_all(&encode(&LockAreaRecord::Create(area.clone()))?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let file = OpenOptions::new().append(true).open(&path)?;
        tracing::info!(
            "opened lock area journal {} with {} areas",
            path.display(),
            table.areas.len()
        );
        Ok(Self {
            dir,
            state: Mutex::new(FileState {
                table,
                writer: BufWriter::new(file),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append(state: &mut FileState, record: LockAreaRecord) -> Result<(), StorageError> {
        state.table.check(&record)?;
        let frame = encode(&record)?;
        state.writer.write_all(&frame)?;
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;
        state.table.apply(record);
        Ok(())
    }
}

impl LockAreaStore for FileLockAreaStore {
    fn create(
        &self,
        user: &str,
        branch_point: BranchPoint,
        read_only: bool,
        locks: BTreeMap<ObjectId, LockGrade>,
    ) -> Result<LockArea, StorageError> {
        let mut state = self.state.lock();
        let area = LockArea {
            id: state.table.fresh_id(),
            user: user.to_string(),
            branch_point,
            read_only,
            locks,
        };
        Self::append(&mut state, LockAreaRecord::Create(area.clone()))?;
        Ok(area)
    }

    fn get(&self, id: &DurableLockingId) -> Result<Option<LockArea>, StorageError> {
        Ok(self.state.lock().table.areas.get(id).cloned())
    }

    fn list(&self, user: Option<&str>) -> Result<Vec<LockArea>, StorageError> {
        Ok(self.state.lock().table.list(user))
    }

    fn update_locks(
        &self,
        id: &DurableLockingId,
        lock_type: LockType,
        ids: &[ObjectId],
        on: bool,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        Self::append(
            &mut state,
            LockAreaRecord::Update {
                id: id.clone(),
                lock_type,
                ids: ids.to_vec(),
                on,
            },
        )
    }

    fn delete(&self, id: &DurableLockingId) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        Self::append(&mut state, LockAreaRecord::Delete(id.clone()))
    }
}
