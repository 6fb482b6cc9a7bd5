//! Chain queries and memento reconstruction.
//!
//! A chain is the contiguous run of changesets from a resource's nearest
//! non-delta changeset (its base) up to some time bound, ascending. Under
//! the chain invariants it has one of three shapes: empty (the resource did
//! not exist yet), a single delete (tombstoned), or a snapshot followed by
//! zero or more deltas.

use crate::db::codec;
use crate::db::store::{CSet, RepoId, RevisionStore, StatementSet, Timestamp};
use crate::error::DBError;
use crate::hash::KeySha;

/// An ascending run of changesets sharing a base. See the module docs for
/// the possible shapes.
pub type Chain = Vec<CSet>;

/// The reconstructed state of a resource at a point in time.
///
/// A tombstoned resource is distinct from one that never existed; the
/// latter is a [`DBError::NotFound`] at the engine surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Memento {
    /// The resource existed, with these statements.
    Present(StatementSet),
    /// The resource was tombstoned at this time.
    Deleted,
}

impl Memento {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Memento::Deleted)
    }

    /// The statement set, with a tombstone reading as the empty set.
    pub fn into_statements(self) -> StatementSet {
        match self {
            Memento::Present(stmts) => stmts,
            Memento::Deleted => StatementSet::new(),
        }
    }
}

/// The chain governing `ts`: every changeset between the nearest snapshot
/// or delete at-or-before `ts` and `ts` itself.
pub fn chain_at_ts<S: RevisionStore>(
    store: &S,
    repo: RepoId,
    sha: KeySha,
    ts: Timestamp,
) -> Result<Chain, DBError> {
    match store.base_time(repo, sha, Some(ts))? {
        Some(base) => store.csets_between(repo, sha, base, Some(ts)),
        None => Ok(Chain::new()),
    }
}

/// The current live chain: from the last non-delta changeset onward,
/// unbounded above.
pub fn chain_tail<S: RevisionStore>(
    store: &S,
    repo: RepoId,
    sha: KeySha,
) -> Result<Chain, DBError> {
    match store.base_time(repo, sha, None)? {
        Some(base) => store.csets_between(repo, sha, base, None),
        None => Ok(Chain::new()),
    }
}

/// Replay a `[Snapshot, Delta*]` chain into its statement set.
///
/// The first changeset's blob seeds the set, each subsequent delta blob is
/// applied in time order. Delete changesets carry no blob and must not
/// appear in `chain`.
pub(crate) fn replay<S: RevisionStore>(
    store: &S,
    repo: RepoId,
    sha: KeySha,
    chain: &[CSet],
) -> Result<StatementSet, DBError> {
    let mut stmts = StatementSet::new();
    for (i, cset) in chain.iter().enumerate() {
        let blob = store
            .blob(repo, sha, cset.time)?
            .ok_or(DBError::MissingBlob {
                repo,
                key: sha,
                ts: cset.time,
            })?;
        let data = codec::decompress(&blob)?;
        if i == 0 {
            stmts = codec::decode_snapshot(&data)?;
        } else {
            codec::apply_patch(&mut stmts, &data)?;
        }
    }
    Ok(stmts)
}

/// Interpret a chain produced by [`chain_at_ts`] as a [`Memento`], or `None`
/// when the chain is empty (the resource did not exist at the bound).
pub(crate) fn memento_from_chain<S: RevisionStore>(
    store: &S,
    repo: RepoId,
    sha: KeySha,
    chain: &[CSet],
) -> Result<Option<Memento>, DBError> {
    match chain {
        [] => Ok(None),
        [only] if only.is_delete() => Ok(Some(Memento::Deleted)),
        _ => replay(store, repo, sha, chain).map(|stmts| Some(Memento::Present(stmts))),
    }
}
