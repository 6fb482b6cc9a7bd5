//! The relational storage model and the backend trait over it.
//!
//! Four tables, all scoped by repository and keyed by the composite
//! `(repo, key_sha, time)` where applicable:
//!
//! - the key map: `key_sha -> key` with collision detection,
//! - changesets (`CSet`): what changed and how it is encoded,
//! - blobs: the zlib-compressed payload of every non-delete changeset,
//! - commit messages: optional metadata attached to a changeset.

use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;

use crate::error::DBError;
use crate::hash::KeySha;

pub mod memory;

pub use memory::Memory;

/// A set of canonicalized RDF statement lines, each terminated by ` .`.
///
/// The engine treats statements as opaque lines; canonicalization is the
/// caller's responsibility, and two statements differing only by whitespace
/// are distinct.
pub type StatementSet = HashSet<String>;

/// Millisecond-precision timestamp ordering the changesets of a history.
///
/// Times are unique per `(repo, key_sha)` history; the engine only relies on
/// strict ordering, not on wall-clock meaning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// The closest representable instant before `self`.
    ///
    /// Used to address the memento preceding a changeset when exporting
    /// deltas. Saturates at [`Timestamp::ZERO`].
    pub fn prev(self) -> Timestamp {
        Timestamp(self.0.saturating_sub(1))
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Timestamp(millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a repository, the scope of every key history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoId(pub u64);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository: `(owner, name)` plus its storage id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repo {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
}

/// How a changeset encodes the state of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// The full statement set.
    Snapshot,
    /// Additions and deletions relative to the reconstruction of the
    /// preceding chain.
    Delta,
    /// A tombstone. Resets the chain base: the next changeset, if any, must
    /// be a snapshot.
    Delete,
}

/// Changeset metadata.
///
/// `len` is the compressed byte length of the associated blob, 0 for
/// deletes (which have no blob).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CSet {
    pub time: Timestamp,
    pub kind: ChangeKind,
    pub len: u64,
}

impl CSet {
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

/// A storage backend for revision histories.
///
/// This is the persistence seam of the engine: [`Memory`] is the reference
/// implementation, and a relational backend maps each method onto a query
/// over the tables described in the module docs. Implementations must
/// enforce uniqueness of the `(repo, key_sha, time)` composite key.
///
/// The engine is single-writer per repository and assumes that each public
/// mutation of [`crate::RevisionDb`] runs inside one backend transaction, so
/// that a `(CSet, Blob)` pair appears atomically and multi-step in-history
/// edits either fully succeed or leave the chain unmodified.
pub trait RevisionStore {
    // -------- repositories --------

    /// Create a repository. Fails with [`DBError::RepoExists`] when
    /// `(owner, name)` is already taken.
    fn create_repo(&self, owner: &str, name: &str) -> Result<RepoId, DBError>;

    fn find_repo(&self, owner: &str, name: &str) -> Result<Option<Repo>, DBError>;

    /// Remove a repository, cascading to all of its changesets, blobs and
    /// commit messages.
    ///
    /// Key map entries are *not* cleaned up here; orphaned entries are left
    /// to a maintenance pass.
    fn remove_repo(&self, repo: RepoId) -> Result<(), DBError>;

    // -------- key map --------

    /// The key string a digest maps to, if any.
    fn key_for(&self, sha: &KeySha) -> Result<Option<String>, DBError>;

    /// Insert a key map entry.
    ///
    /// Succeeds when `sha` is unmapped or already maps to `key`; fails with
    /// [`DBError::Collision`] when it maps to a different key. Callers
    /// normally go through [`RevisionStore::ensure_key`].
    fn insert_key(&self, sha: KeySha, key: &str) -> Result<(), DBError>;

    /// Idempotently ensure the key map contains `(sha, key)`.
    ///
    /// Fails with [`DBError::Collision`] when `sha` is already bound to a
    /// different key.
    fn ensure_key(&self, sha: KeySha, key: &str) -> Result<(), DBError> {
        match self.key_for(&sha)? {
            Some(existing) if existing == key => Ok(()),
            Some(existing) => Err(DBError::Collision {
                sha,
                existing,
                new: key.to_owned(),
            }),
            None => self.insert_key(sha, key),
        }
    }

    // -------- changesets --------

    /// Create a changeset. Fails with [`DBError::CSetExists`] when one
    /// already exists at the same composite key.
    fn insert_cset(&self, repo: RepoId, sha: KeySha, cset: CSet) -> Result<(), DBError>;

    fn cset_at(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<Option<CSet>, DBError>;

    /// The temporally first changeset of a history, or none.
    fn first_cset(&self, repo: RepoId, sha: KeySha) -> Result<Option<CSet>, DBError>;

    /// The most recent changeset of a history, or none.
    fn last_cset(&self, repo: RepoId, sha: KeySha) -> Result<Option<CSet>, DBError>;

    /// The earliest changeset strictly after `ts`, or none.
    fn next_cset_after(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
    ) -> Result<Option<CSet>, DBError>;

    /// The latest changeset strictly before `ts`, or none.
    fn prev_cset_before(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
    ) -> Result<Option<CSet>, DBError>;

    /// The time of the nearest non-delta changeset at or before `upto`
    /// (unbounded when `None`), or none. This is the base a delta chain
    /// replays from.
    fn base_time(
        &self,
        repo: RepoId,
        sha: KeySha,
        upto: Option<Timestamp>,
    ) -> Result<Option<Timestamp>, DBError>;

    /// All changesets with `from <= time` (and `time <= upto` when bounded),
    /// ascending by time.
    fn csets_between(
        &self,
        repo: RepoId,
        sha: KeySha,
        from: Timestamp,
        upto: Option<Timestamp>,
    ) -> Result<Vec<CSet>, DBError>;

    /// All changeset times of a history, newest first. This backs the
    /// timemap of a resource.
    fn cset_times_desc(&self, repo: RepoId, sha: KeySha) -> Result<Vec<Timestamp>, DBError>;

    fn cset_count(&self, repo: RepoId, sha: KeySha) -> Result<usize, DBError>;

    /// Remove the changeset at exactly `ts`. Returns whether one existed.
    fn remove_cset(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<bool, DBError>;

    /// Drop an entire history: all changesets and blobs of `(repo, sha)`.
    fn remove_key(&self, repo: RepoId, sha: KeySha) -> Result<(), DBError>;

    // -------- blobs --------

    /// Create a blob. Fails with [`DBError::BlobExists`] when one already
    /// exists at the same composite key.
    fn insert_blob(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
        data: Vec<u8>,
    ) -> Result<(), DBError>;

    fn blob(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<Option<Bytes>, DBError>;

    /// Remove the blob at exactly `ts`. Returns whether one existed.
    fn remove_blob(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<bool, DBError>;

    // -------- commit messages --------

    /// Attach a commit message to the changeset at `ts`, replacing any
    /// previous one.
    fn insert_commit_message(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
        message: &str,
    ) -> Result<(), DBError>;

    fn commit_message(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
    ) -> Result<Option<String>, DBError>;

    // -------- index --------

    /// Page through the keys of a repository that are live at `ts`, with the
    /// time of their latest change.
    ///
    /// For every key the latest changeset at or before `ts` is considered;
    /// tombstoned keys are filtered out after pagination, mirroring the
    /// relational query (group by key, page, then join out deletes and the
    /// key map). `page` is 1-based; results are ordered by key digest.
    fn live_keys_at(
        &self,
        repo: RepoId,
        ts: Timestamp,
        page: usize,
        page_size: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Timestamp)>, DBError>;
}
