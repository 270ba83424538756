use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one logical object, stable across branches and revisions.
///
/// `Temp` ids are handed out client-side for objects created inside a
/// transaction; the commit pipeline replaces them with `Persistent` ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectId {
    Persistent(u64),
    Temp(u32),
}

impl ObjectId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, ObjectId::Temp(_))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Persistent(v) => write!(f, "oid:{}", v),
            ObjectId::Temp(v) => write!(f, "tmp:{}", v),
        }
    }
}

/// Branch identifier. The main branch is always `BranchId::MAIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub u32);

impl BranchId {
    pub const MAIN: BranchId = BranchId(0);

    pub fn is_main(&self) -> bool {
        *self == BranchId::MAIN
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch:{}", self.0)
    }
}

/// Commit timestamp in milliseconds since the Unix epoch.
///
/// `UNSPECIFIED` addresses the current head wherever a timestamp is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const UNSPECIFIED: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// Wall-clock time in milliseconds.
    pub fn now() -> Timestamp {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Timestamp(millis)
    }

    pub fn is_specified(&self) -> bool {
        *self != Timestamp::UNSPECIFIED
    }

    pub fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_specified() {
            write!(f, "ts:{}", self.0)
        } else {
            write!(f, "ts:head")
        }
    }
}

/// A coordinate in the branch tree: a branch observed at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchPoint {
    pub branch: BranchId,
    pub timestamp: Timestamp,
}

impl BranchPoint {
    pub fn new(branch: BranchId, timestamp: Timestamp) -> Self {
        Self { branch, timestamp }
    }

    /// The current head of `branch`.
    pub fn head(branch: BranchId) -> Self {
        Self {
            branch,
            timestamp: Timestamp::UNSPECIFIED,
        }
    }

    pub fn is_head(&self) -> bool {
        !self.timestamp.is_specified()
    }
}

impl fmt::Display for BranchPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}

/// Per-(object, branch) revision counter; the first revision is `Version::FIRST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(pub u32);

impl Version {
    pub const FIRST: Version = Version(1);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies one exact revision: the object, the branch it lives on and its version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionKey {
    pub id: ObjectId,
    pub branch: BranchId,
    pub version: Version,
}

impl RevisionKey {
    pub fn new(id: ObjectId, branch: BranchId, version: Version) -> Self {
        Self {
            id,
            branch,
            version,
        }
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.id, self.branch, self.version)
    }
}

/// Client session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// View or transaction identifier, unique across the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view:{}", self.0)
    }
}

/// Name of a durable lock area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DurableLockingId(pub String);

impl fmt::Display for DurableLockingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "area:{}", self.0)
    }
}

/// Lock flavours held in the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockType {
    /// Shared.
    Read,
    /// Exclusive against other writers, readers and option holders.
    Write,
    /// Exclusive reservation that blocks writers and other options but not readers.
    Option,
}

impl LockType {
    pub const ALL: [LockType; 3] = [LockType::Read, LockType::Write, LockType::Option];
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Read => write!(f, "READ"),
            LockType::Write => write!(f, "WRITE"),
            LockType::Option => write!(f, "OPTION"),
        }
    }
}

/// Set of lock types one holder has on one object, as persisted in a lock area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockGrade(u8);

impl LockGrade {
    pub const NONE: LockGrade = LockGrade(0);

    fn bit(lock_type: LockType) -> u8 {
        match lock_type {
            LockType::Read => 0b001,
            LockType::Write => 0b010,
            LockType::Option => 0b100,
        }
    }

    pub fn of(lock_type: LockType) -> LockGrade {
        LockGrade(Self::bit(lock_type))
    }

    pub fn update(self, lock_type: LockType, on: bool) -> LockGrade {
        if on {
            LockGrade(self.0 | Self::bit(lock_type))
        } else {
            LockGrade(self.0 & !Self::bit(lock_type))
        }
    }

    pub fn contains(self, lock_type: LockType) -> bool {
        self.0 & Self::bit(lock_type) != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn types(self) -> impl Iterator<Item = LockType> {
        LockType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}
