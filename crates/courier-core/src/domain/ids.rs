//! Strongly-typed identifiers.
//!
//! # ULID ベースの ID
//! すべての ID は `Id<T>` に包んだ ULID。`T` はゼロサイズのマーカー型で、
//! 実行時には使わない（PhantomData）。
//!
//! Every id is a ULID wrapped in `Id<T>`, where `T` is a zero-sized marker.
//! ULIDs sort by creation time, so listing jobs by id lists them in enqueue
//! order. The marker keeps a `JobId` from being passed where a `WorkerId` is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for id kinds; provides the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Marker for workers (claim owners).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Identifier of a job record (single delivery or batch).
pub type JobId = Id<Job>;

/// Identifier of a worker; the owner of an `InProgress` claim.
pub type WorkerId = Id<Worker>;
