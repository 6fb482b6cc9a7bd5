//! The revision storage engine.
//!
//! [`RevisionDb`] stores the full history of named RDF resources as
//! time-indexed chains of changesets. Appends are encoded either as a full
//! snapshot or as a delta against the reconstruction of the preceding chain,
//! trading storage size against reconstruction cost via
//! [`Options::snapshot_factor`]. Histories can also be edited at arbitrary
//! timestamps: inserting, tombstoning or excising a changeset rewrites the
//! immediately following changeset so that every other point in history
//! reconstructs to the same statement set as before.

use log::debug;

use crate::Options;
use crate::db::chain::{self, Chain, Memento};
use crate::db::codec;
use crate::db::store::{CSet, ChangeKind, RepoId, RevisionStore, StatementSet, Timestamp};
use crate::error::DBError;
use crate::hash::{KeySha, hash_key};

/// What a mutation wrote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A full snapshot changeset was stored.
    Snapshot,
    /// A delta changeset was stored.
    Delta,
    /// A tombstone changeset was stored.
    Deleted,
    /// Nothing was stored: the mutation was an idempotent no-op (identical
    /// re-save, repeated delete, or an insert that collapsed into the
    /// surrounding states).
    Unchanged,
}

/// Additions and deletions between two mementos.
///
/// Both sets hold bare statement lines; the `"A "`/`"D "` markers are a
/// property of the stored patch format (see [`crate::db::codec`]) and are
/// applied by serialization layers, not here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: StatementSet,
    pub deleted: StatementSet,
}

/// The revision storage engine, generic over its persistence backend.
///
/// All mutations operate on a single `(repo, key)` history and assume a
/// single writer per repository; see [`RevisionStore`] for the transactional
/// contract expected of backends.
pub struct RevisionDb<S> {
    store: S,
    opts: Options,
}

impl<S: RevisionStore> RevisionDb<S> {
    pub fn new(store: S) -> Self {
        Self::with_options(store, Options::default())
    }

    pub fn with_options(store: S, opts: Options) -> Self {
        Self { store, opts }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // -------- chain queries --------

    /// The chain governing `ts`: empty, `[Delete]`, or `[Snapshot, Delta*]`.
    pub fn chain_at_ts(&self, repo: RepoId, key: &str, ts: Timestamp) -> Result<Chain, DBError> {
        chain::chain_at_ts(&self.store, repo, hash_key(key), ts)
    }

    /// The current live chain, from the last non-delta changeset onward.
    pub fn chain_tail(&self, repo: RepoId, key: &str) -> Result<Chain, DBError> {
        chain::chain_tail(&self.store, repo, hash_key(key))
    }

    pub fn cset_at(&self, repo: RepoId, key: &str, ts: Timestamp) -> Result<Option<CSet>, DBError> {
        self.store.cset_at(repo, hash_key(key), ts)
    }

    pub fn next_cset_after(
        &self,
        repo: RepoId,
        key: &str,
        ts: Timestamp,
    ) -> Result<Option<CSet>, DBError> {
        self.store.next_cset_after(repo, hash_key(key), ts)
    }

    pub fn prev_cset_before(
        &self,
        repo: RepoId,
        key: &str,
        ts: Timestamp,
    ) -> Result<Option<CSet>, DBError> {
        self.store.prev_cset_before(repo, hash_key(key), ts)
    }

    pub fn first_cset(&self, repo: RepoId, key: &str) -> Result<Option<CSet>, DBError> {
        self.store.first_cset(repo, hash_key(key))
    }

    pub fn last_cset(&self, repo: RepoId, key: &str) -> Result<Option<CSet>, DBError> {
        self.store.last_cset(repo, hash_key(key))
    }

    /// All change times of a resource, newest first. Backs the timemap of
    /// the resource.
    pub fn timemap(&self, repo: RepoId, key: &str) -> Result<Vec<Timestamp>, DBError> {
        self.store.cset_times_desc(repo, hash_key(key))
    }

    pub fn cset_count(&self, repo: RepoId, key: &str) -> Result<usize, DBError> {
        self.store.cset_count(repo, hash_key(key))
    }

    // -------- reconstruction --------

    /// Reconstruct the state of a resource at `ts`.
    ///
    /// Fails with [`DBError::NotFound`] when the resource did not exist at
    /// `ts`; a tombstoned resource is [`Memento::Deleted`], which is a
    /// distinct, addressable state.
    pub fn memento_at(&self, repo: RepoId, key: &str, ts: Timestamp) -> Result<Memento, DBError> {
        let sha = hash_key(key);
        let chain = chain::chain_at_ts(&self.store, repo, sha, ts)?;
        chain::memento_from_chain(&self.store, repo, sha, &chain)?.ok_or(DBError::NotFound {
            repo,
            key: sha,
            ts,
        })
    }

    // -------- mutations --------

    /// Append a new state to the tail of a history.
    ///
    /// The timestamp must be strictly greater than the current chain tail's.
    /// On first write of a key, its key map entry is created (failing with
    /// [`DBError::Collision`] on a digest clash). Re-saving the identical
    /// statement set is an [`Outcome::Unchanged`] no-op.
    pub fn append(
        &self,
        repo: RepoId,
        key: &str,
        stmts: &StatementSet,
        ts: Timestamp,
    ) -> Result<Outcome, DBError> {
        let sha = hash_key(key);
        let chain = chain::chain_tail(&self.store, repo, sha)?;
        if chain.is_empty() {
            self.store.ensure_key(sha, key)?;
        }
        self.save_at(repo, sha, &chain, stmts, ts)
    }

    /// Insert a state at an arbitrary historical time.
    ///
    /// Inserting at the exact time of an existing changeset replaces it.
    /// The immediately following changeset, if it carries content, is
    /// rewritten against the now-changed chain so that its reconstruction is
    /// preserved; a following tombstone is independent of preceding content
    /// and is left alone.
    pub fn insert(
        &self,
        repo: RepoId,
        key: &str,
        stmts: &StatementSet,
        ts: Timestamp,
    ) -> Result<Outcome, DBError> {
        let sha = hash_key(key);

        // Capture the reconstruction at the following changeset before
        // touching the chain.
        let next = self.store.next_cset_after(repo, sha, ts)?;
        let next_state = match &next {
            Some(cset) if !cset.is_delete() => Some(self.state_at(repo, sha, cset.time)?),
            _ => None,
        };

        if self.store.cset_at(repo, sha, ts)?.is_some() {
            // Replacement in place; the successor is rewritten below, so no
            // separate excision pass is needed here.
            self.excise(repo, sha, ts)?;
        }

        let chain_here = chain::chain_at_ts(&self.store, repo, sha, ts)?;
        if chain_here.is_empty() {
            self.store.ensure_key(sha, key)?;
        }
        let outcome = self.save_at(repo, sha, &chain_here, stmts, ts)?;

        if let (Some(next), Some(next_state)) = (next, next_state) {
            debug!("insert at {ts} rewrites changeset at {}", next.time);
            self.rewrite_at(repo, sha, next.time, &next_state)?;
        }
        Ok(outcome)
    }

    /// Tombstone a resource at `ts`.
    ///
    /// Fails with [`DBError::NotFound`] when the resource never existed at
    /// `ts`; deleting an already-deleted resource is an
    /// [`Outcome::Unchanged`] no-op. A following tombstone becomes redundant
    /// and is removed; a following delta is rewritten and, since its base is
    /// now a tombstone, re-encodes as a snapshot.
    pub fn delete(&self, repo: RepoId, key: &str, ts: Timestamp) -> Result<Outcome, DBError> {
        let sha = hash_key(key);
        let chain = chain::chain_at_ts(&self.store, repo, sha, ts)?;
        let Some(last) = chain.last() else {
            return Err(DBError::NotFound { repo, key: sha, ts });
        };
        if last.is_delete() {
            return Ok(Outcome::Unchanged);
        }

        let next = self.store.next_cset_after(repo, sha, ts)?;
        let mut next_state = None;
        match &next {
            Some(cset) if cset.kind == ChangeKind::Delta => {
                next_state = Some(self.state_at(repo, sha, cset.time)?);
            }
            Some(cset) if cset.is_delete() => {
                // Successive tombstones are redundant.
                self.excise(repo, sha, cset.time)?;
            }
            _ => {}
        }

        if self.store.cset_at(repo, sha, ts)?.is_some() {
            self.excise(repo, sha, ts)?;
        }
        self.store.insert_cset(
            repo,
            sha,
            CSet {
                time: ts,
                kind: ChangeKind::Delete,
                len: 0,
            },
        )?;

        if let (Some(next), Some(next_state)) = (next, next_state) {
            // The successor's base is now a tombstone, so this re-save
            // stores a snapshot.
            debug!("delete at {ts} rewrites changeset at {}", next.time);
            self.rewrite_at(repo, sha, next.time, &next_state)?;
        }
        Ok(Outcome::Deleted)
    }

    /// Physically excise the changeset at `ts`, collapsing history as if it
    /// never happened.
    ///
    /// Fails with [`DBError::NotFound`] when no changeset exists at `ts`.
    /// The following changeset, if it carries content, is rewritten against
    /// the collapsed chain.
    pub fn remove(&self, repo: RepoId, key: &str, ts: Timestamp) -> Result<(), DBError> {
        let sha = hash_key(key);
        if self.store.cset_at(repo, sha, ts)?.is_none() {
            return Err(DBError::NotFound { repo, key: sha, ts });
        }

        let next = self.store.next_cset_after(repo, sha, ts)?;
        let next_state = match &next {
            Some(cset) if !cset.is_delete() => Some(self.state_at(repo, sha, cset.time)?),
            _ => None,
        };

        self.excise(repo, sha, ts)?;

        if let (Some(next), Some(next_state)) = (next, next_state) {
            debug!("remove at {ts} rewrites changeset at {}", next.time);
            self.rewrite_at(repo, sha, next.time, &next_state)?;
        }
        Ok(())
    }

    // -------- delta export --------

    /// The delta a memento introduced over its predecessor.
    ///
    /// When the memento is physically a delta, its patch blob is decoded
    /// directly; otherwise the statement sets on either side of the
    /// changeset are diffed. A resource with no history at `ts` yields an
    /// empty delta.
    pub fn delta_of_memento(&self, repo: RepoId, key: &str, ts: Timestamp) -> Result<Delta, DBError> {
        let sha = hash_key(key);
        let chain = chain::chain_at_ts(&self.store, repo, sha, ts)?;
        let Some(cset) = chain.last() else {
            return Ok(Delta::default());
        };
        match cset.kind {
            ChangeKind::Delete => {
                // Everything that existed before the tombstone was deleted
                // here.
                let deleted = self.state_before(repo, sha, cset.time)?;
                Ok(Delta {
                    added: StatementSet::new(),
                    deleted,
                })
            }
            ChangeKind::Delta => {
                let blob = self
                    .store
                    .blob(repo, sha, cset.time)?
                    .ok_or(DBError::MissingBlob {
                        repo,
                        key: sha,
                        ts: cset.time,
                    })?;
                let (added, deleted) = codec::decode_patch(&codec::decompress(&blob)?)?;
                Ok(Delta { added, deleted })
            }
            ChangeKind::Snapshot => {
                let current = chain::replay(&self.store, repo, sha, &chain)?;
                let prior = self.state_before(repo, sha, cset.time)?;
                Ok(Delta {
                    added: current.difference(&prior).cloned().collect(),
                    deleted: prior.difference(&current).cloned().collect(),
                })
            }
        }
    }

    /// The delta between the mementos at `ts` and `other_ts`: statements
    /// added relative to the `other_ts` state, and statements deleted from
    /// it.
    ///
    /// Fails with [`DBError::InvalidRange`] when either timestamp precedes
    /// the resource's history. A tombstoned endpoint diffs as the empty
    /// statement set.
    pub fn delta_between_mementos(
        &self,
        repo: RepoId,
        key: &str,
        ts: Timestamp,
        other_ts: Timestamp,
    ) -> Result<Delta, DBError> {
        let sha = hash_key(key);
        let chain = chain::chain_at_ts(&self.store, repo, sha, ts)?;
        let other_chain = chain::chain_at_ts(&self.store, repo, sha, other_ts)?;
        let stmts = chain::memento_from_chain(&self.store, repo, sha, &chain)?
            .ok_or(DBError::InvalidRange { key: sha, ts })?
            .into_statements();
        let other = chain::memento_from_chain(&self.store, repo, sha, &other_chain)?
            .ok_or(DBError::InvalidRange { key: sha, ts: other_ts })?
            .into_statements();
        Ok(Delta {
            added: stmts.difference(&other).cloned().collect(),
            deleted: other.difference(&stmts).cloned().collect(),
        })
    }

    // -------- commit messages --------

    /// Attach a commit message to the changeset at `ts`.
    pub fn add_commit_message(
        &self,
        repo: RepoId,
        key: &str,
        ts: Timestamp,
        message: &str,
    ) -> Result<(), DBError> {
        self.store
            .insert_commit_message(repo, hash_key(key), ts, message)
    }

    pub fn commit_message(
        &self,
        repo: RepoId,
        key: &str,
        ts: Timestamp,
    ) -> Result<Option<String>, DBError> {
        self.store.commit_message(repo, hash_key(key), ts)
    }

    // -------- repository index --------

    /// Page through the keys live at `ts` with the time of their latest
    /// change, [`Options::index_page_size`] keys per page (1-based).
    pub fn index(
        &self,
        repo: RepoId,
        ts: Timestamp,
        page: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Timestamp)>, DBError> {
        self.store
            .live_keys_at(repo, ts, page, self.opts.index_page_size, limit)
    }

    /// Remove a repository, cascading to all of its histories. Key map
    /// entries are left to a maintenance pass.
    pub fn remove_repo(&self, repo: RepoId) -> Result<(), DBError> {
        self.store.remove_repo(repo)
    }

    // -------- internals --------

    /// Save `stmts` at `ts` on top of `chain`, choosing the encoding.
    ///
    /// A snapshot is stored when the chain is empty or starts with a
    /// tombstone, when the snapshot is no larger than the candidate patch,
    /// or when the accumulated delta bulk has outgrown the base snapshot by
    /// [`Options::snapshot_factor`]; otherwise the patch is stored as a
    /// delta. The blob is created before its changeset.
    fn save_at(
        &self,
        repo: RepoId,
        sha: KeySha,
        chain: &[CSet],
        stmts: &StatementSet,
        ts: Timestamp,
    ) -> Result<Outcome, DBError> {
        if let Some(last) = chain.last() {
            if ts <= last.time {
                return Err(DBError::NonMonotonic {
                    ts,
                    tail: last.time,
                });
            }
        }

        // On an empty or tombstone-based chain there is no previous state to
        // diff against and a snapshot is stored unconditionally.
        let patch = match chain.first() {
            None => None,
            Some(base) if base.is_delete() => None,
            Some(_) => {
                let prev = chain::replay(&self.store, repo, sha, chain)?;
                if *stmts == prev {
                    return Ok(Outcome::Unchanged);
                }
                Some(codec::compress(&codec::encode_patch(&prev, stmts))?)
            }
        };
        let snap = codec::compress(&codec::encode_snapshot(stmts))?;

        // Accumulated size of the delta chain including the candidate patch.
        let accum = chain.iter().skip(1).map(|c| c.len).sum::<u64>()
            + patch.as_ref().map_or(0, |p| p.len() as u64);
        let base_len = chain.first().map_or(0, |c| c.len);

        match patch {
            Some(patch)
                if snap.len() > patch.len()
                    && self.opts.snapshot_factor * base_len as f64 > accum as f64 =>
            {
                debug!("storing delta for {sha}@{ts} ({} bytes)", patch.len());
                let len = patch.len() as u64;
                self.store.insert_blob(repo, sha, ts, patch)?;
                self.store.insert_cset(
                    repo,
                    sha,
                    CSet {
                        time: ts,
                        kind: ChangeKind::Delta,
                        len,
                    },
                )?;
                Ok(Outcome::Delta)
            }
            _ => {
                debug!("storing snapshot for {sha}@{ts} ({} bytes)", snap.len());
                let len = snap.len() as u64;
                self.store.insert_blob(repo, sha, ts, snap)?;
                self.store.insert_cset(
                    repo,
                    sha,
                    CSet {
                        time: ts,
                        kind: ChangeKind::Snapshot,
                        len,
                    },
                )?;
                Ok(Outcome::Snapshot)
            }
        }
    }

    /// Reconstruction at `ts` for a changeset known to carry content.
    fn state_at(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<StatementSet, DBError> {
        let chain = chain::chain_at_ts(&self.store, repo, sha, ts)?;
        chain::replay(&self.store, repo, sha, &chain)
    }

    /// The statement set just before `ts`; empty when the resource did not
    /// exist or was tombstoned.
    fn state_before(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
    ) -> Result<StatementSet, DBError> {
        let chain = chain::chain_at_ts(&self.store, repo, sha, ts.prev())?;
        Ok(chain::memento_from_chain(&self.store, repo, sha, &chain)?
            .map(Memento::into_statements)
            .unwrap_or_default())
    }

    /// Remove the changeset and blob at exactly `ts`.
    fn excise(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<(), DBError> {
        self.store.remove_cset(repo, sha, ts)?;
        self.store.remove_blob(repo, sha, ts)?;
        Ok(())
    }

    /// Re-save `stmts` at `ts` against the chain as it stands without the
    /// changeset currently there, re-choosing its encoding.
    ///
    /// May collapse the changeset entirely when the surrounding states
    /// already reconstruct to `stmts`.
    fn rewrite_at(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
        stmts: &StatementSet,
    ) -> Result<(), DBError> {
        self.excise(repo, sha, ts)?;
        let chain = chain::chain_at_ts(&self.store, repo, sha, ts)?;
        self.save_at(repo, sha, &chain, stmts, ts)?;
        Ok(())
    }
}
