use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;

use super::{CSet, ChangeKind, Repo, RepoId, RevisionStore, Timestamp};
use crate::error::DBError;
use crate::hash::{HASH_LEN, KeySha};

/// Composite row key shared by the changeset, blob and message tables.
type RowKey = (RepoId, KeySha, Timestamp);

const MIN_SHA: KeySha = KeySha { data: [0x00; HASH_LEN] };
const MAX_SHA: KeySha = KeySha { data: [0xff; HASH_LEN] };

#[derive(Debug, Default)]
struct Inner {
    next_repo_id: u64,
    repos: BTreeMap<RepoId, Repo>,
    hmap: HashMap<KeySha, String>,
    csets: BTreeMap<RowKey, (ChangeKind, u64)>,
    blobs: BTreeMap<RowKey, Bytes>,
    messages: BTreeMap<RowKey, String>,
}

/// In-memory implementation of [`RevisionStore`].
///
/// The reference backend: `BTreeMap` tables over the composite row key
/// behind a shared lock, so cloned handles address the same store. Individual
/// calls are serialized; transactional grouping of the engine's multi-step
/// mutations is the concern of a persistent backend.
#[derive(Clone, Debug, Default)]
pub struct Memory(Arc<RwLock<Inner>>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, DBError> {
        self.0.read().map_err(|e| DBError::StorePoisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, DBError> {
        self.0.write().map_err(|e| DBError::StorePoisoned(e.to_string()))
    }
}

fn cset_from_row((_, _, time): RowKey, (kind, len): (ChangeKind, u64)) -> CSet {
    CSet { time, kind, len }
}

impl RevisionStore for Memory {
    fn create_repo(&self, owner: &str, name: &str) -> Result<RepoId, DBError> {
        let mut inner = self.write()?;
        if inner.repos.values().any(|r| r.owner == owner && r.name == name) {
            return Err(DBError::RepoExists {
                owner: owner.to_owned(),
                name: name.to_owned(),
            });
        }
        inner.next_repo_id += 1;
        let id = RepoId(inner.next_repo_id);
        inner.repos.insert(
            id,
            Repo {
                id,
                owner: owner.to_owned(),
                name: name.to_owned(),
            },
        );
        Ok(id)
    }

    fn find_repo(&self, owner: &str, name: &str) -> Result<Option<Repo>, DBError> {
        let inner = self.read()?;
        Ok(inner
            .repos
            .values()
            .find(|r| r.owner == owner && r.name == name)
            .cloned())
    }

    fn remove_repo(&self, repo: RepoId) -> Result<(), DBError> {
        let mut inner = self.write()?;
        inner.csets.retain(|&(r, _, _), _| r != repo);
        inner.blobs.retain(|&(r, _, _), _| r != repo);
        inner.messages.retain(|&(r, _, _), _| r != repo);
        inner.repos.remove(&repo);
        Ok(())
    }

    fn key_for(&self, sha: &KeySha) -> Result<Option<String>, DBError> {
        Ok(self.read()?.hmap.get(sha).cloned())
    }

    fn insert_key(&self, sha: KeySha, key: &str) -> Result<(), DBError> {
        let mut inner = self.write()?;
        if let Some(existing) = inner.hmap.get(&sha) {
            if existing != key {
                return Err(DBError::Collision {
                    sha,
                    existing: existing.clone(),
                    new: key.to_owned(),
                });
            }
            return Ok(());
        }
        inner.hmap.insert(sha, key.to_owned());
        Ok(())
    }

    fn insert_cset(&self, repo: RepoId, sha: KeySha, cset: CSet) -> Result<(), DBError> {
        let mut inner = self.write()?;
        let row = (repo, sha, cset.time);
        if inner.csets.contains_key(&row) {
            return Err(DBError::CSetExists {
                repo,
                key: sha,
                ts: cset.time,
            });
        }
        inner.csets.insert(row, (cset.kind, cset.len));
        Ok(())
    }

    fn cset_at(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<Option<CSet>, DBError> {
        let inner = self.read()?;
        Ok(inner
            .csets
            .get(&(repo, sha, ts))
            .map(|&row| cset_from_row((repo, sha, ts), row)))
    }

    fn first_cset(&self, repo: RepoId, sha: KeySha) -> Result<Option<CSet>, DBError> {
        let inner = self.read()?;
        Ok(inner
            .csets
            .range((repo, sha, Timestamp::ZERO)..=(repo, sha, Timestamp::MAX))
            .next()
            .map(|(&row, &val)| cset_from_row(row, val)))
    }

    fn last_cset(&self, repo: RepoId, sha: KeySha) -> Result<Option<CSet>, DBError> {
        let inner = self.read()?;
        Ok(inner
            .csets
            .range((repo, sha, Timestamp::ZERO)..=(repo, sha, Timestamp::MAX))
            .next_back()
            .map(|(&row, &val)| cset_from_row(row, val)))
    }

    fn next_cset_after(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
    ) -> Result<Option<CSet>, DBError> {
        let inner = self.read()?;
        Ok(inner
            .csets
            .range((
                Bound::Excluded((repo, sha, ts)),
                Bound::Included((repo, sha, Timestamp::MAX)),
            ))
            .next()
            .map(|(&row, &val)| cset_from_row(row, val)))
    }

    fn prev_cset_before(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
    ) -> Result<Option<CSet>, DBError> {
        let inner = self.read()?;
        Ok(inner
            .csets
            .range((repo, sha, Timestamp::ZERO)..(repo, sha, ts))
            .next_back()
            .map(|(&row, &val)| cset_from_row(row, val)))
    }

    fn base_time(
        &self,
        repo: RepoId,
        sha: KeySha,
        upto: Option<Timestamp>,
    ) -> Result<Option<Timestamp>, DBError> {
        let inner = self.read()?;
        let upto = upto.unwrap_or(Timestamp::MAX);
        Ok(inner
            .csets
            .range((repo, sha, Timestamp::ZERO)..=(repo, sha, upto))
            .rev()
            .find(|&(_, &(kind, _))| kind != ChangeKind::Delta)
            .map(|(&(_, _, time), _)| time))
    }

    fn csets_between(
        &self,
        repo: RepoId,
        sha: KeySha,
        from: Timestamp,
        upto: Option<Timestamp>,
    ) -> Result<Vec<CSet>, DBError> {
        let inner = self.read()?;
        let upto = upto.unwrap_or(Timestamp::MAX);
        Ok(inner
            .csets
            .range((repo, sha, from)..=(repo, sha, upto))
            .map(|(&row, &val)| cset_from_row(row, val))
            .collect())
    }

    fn cset_times_desc(&self, repo: RepoId, sha: KeySha) -> Result<Vec<Timestamp>, DBError> {
        let inner = self.read()?;
        Ok(inner
            .csets
            .range((repo, sha, Timestamp::ZERO)..=(repo, sha, Timestamp::MAX))
            .rev()
            .map(|(&(_, _, time), _)| time)
            .collect())
    }

    fn cset_count(&self, repo: RepoId, sha: KeySha) -> Result<usize, DBError> {
        let inner = self.read()?;
        Ok(inner
            .csets
            .range((repo, sha, Timestamp::ZERO)..=(repo, sha, Timestamp::MAX))
            .count())
    }

    fn remove_cset(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<bool, DBError> {
        Ok(self.write()?.csets.remove(&(repo, sha, ts)).is_some())
    }

    fn remove_key(&self, repo: RepoId, sha: KeySha) -> Result<(), DBError> {
        let mut inner = self.write()?;
        inner.csets.retain(|&(r, s, _), _| (r, s) != (repo, sha));
        inner.blobs.retain(|&(r, s, _), _| (r, s) != (repo, sha));
        Ok(())
    }

    fn insert_blob(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
        data: Vec<u8>,
    ) -> Result<(), DBError> {
        let mut inner = self.write()?;
        let row = (repo, sha, ts);
        if inner.blobs.contains_key(&row) {
            return Err(DBError::BlobExists {
                repo,
                key: sha,
                ts,
            });
        }
        inner.blobs.insert(row, Bytes::from(data));
        Ok(())
    }

    fn blob(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<Option<Bytes>, DBError> {
        Ok(self.read()?.blobs.get(&(repo, sha, ts)).cloned())
    }

    fn remove_blob(&self, repo: RepoId, sha: KeySha, ts: Timestamp) -> Result<bool, DBError> {
        Ok(self.write()?.blobs.remove(&(repo, sha, ts)).is_some())
    }

    fn insert_commit_message(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
        message: &str,
    ) -> Result<(), DBError> {
        self.write()?
            .messages
            .insert((repo, sha, ts), message.to_owned());
        Ok(())
    }

    fn commit_message(
        &self,
        repo: RepoId,
        sha: KeySha,
        ts: Timestamp,
    ) -> Result<Option<String>, DBError> {
        Ok(self.read()?.messages.get(&(repo, sha, ts)).cloned())
    }

    fn live_keys_at(
        &self,
        repo: RepoId,
        ts: Timestamp,
        page: usize,
        page_size: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Timestamp)>, DBError> {
        let inner = self.read()?;

        // Latest changeset per key at or before `ts`, in key digest order.
        // The cset table iterates sorted by (sha, time), so the last row seen
        // per digest is its max-time row.
        let mut latest: Vec<(KeySha, Timestamp, ChangeKind)> = Vec::new();
        for (&(_, sha, time), &(kind, _)) in inner
            .csets
            .range((repo, MIN_SHA, Timestamp::ZERO)..=(repo, MAX_SHA, Timestamp::MAX))
        {
            if time > ts {
                continue;
            }
            match latest.last_mut() {
                Some(entry) if entry.0 == sha => {
                    entry.1 = time;
                    entry.2 = kind;
                }
                _ => latest.push((sha, time, kind)),
            }
        }

        // Paginate the per-key groups first, then drop tombstones and join
        // the key map, like the relational formulation of this query.
        let start = page.saturating_sub(1).saturating_mul(page_size);
        let mut out = Vec::new();
        for (sha, time, _) in latest
            .into_iter()
            .skip(start)
            .take(page_size)
            .filter(|&(_, _, kind)| kind != ChangeKind::Delete)
        {
            if let Some(key) = inner.hmap.get(&sha) {
                out.push((key.clone(), time));
            }
            if limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultTest;
    use crate::hash::hash_key;
    use pretty_assertions::assert_eq;

    const REPO: RepoId = RepoId(1);

    fn cset(time: u64, kind: ChangeKind, len: u64) -> CSet {
        CSet {
            time: Timestamp(time),
            kind,
            len,
        }
    }

    fn seed_chain(store: &Memory, sha: KeySha) -> ResultTest<()> {
        store.insert_cset(REPO, sha, cset(1, ChangeKind::Snapshot, 10))?;
        store.insert_cset(REPO, sha, cset(2, ChangeKind::Delta, 4))?;
        store.insert_cset(REPO, sha, cset(3, ChangeKind::Delta, 5))?;
        store.insert_cset(REPO, sha, cset(5, ChangeKind::Delete, 0))?;
        store.insert_cset(REPO, sha, cset(7, ChangeKind::Snapshot, 12))?;
        Ok(())
    }

    #[test]
    fn test_cset_point_and_neighbor_queries() -> ResultTest<()> {
        let store = Memory::new();
        let sha = hash_key("k");
        seed_chain(&store, sha)?;

        assert_eq!(store.cset_at(REPO, sha, Timestamp(2))?, Some(cset(2, ChangeKind::Delta, 4)));
        assert_eq!(store.cset_at(REPO, sha, Timestamp(4))?, None);
        assert_eq!(store.first_cset(REPO, sha)?, Some(cset(1, ChangeKind::Snapshot, 10)));
        assert_eq!(store.last_cset(REPO, sha)?, Some(cset(7, ChangeKind::Snapshot, 12)));
        assert_eq!(
            store.next_cset_after(REPO, sha, Timestamp(3))?,
            Some(cset(5, ChangeKind::Delete, 0))
        );
        assert_eq!(
            store.prev_cset_before(REPO, sha, Timestamp(5))?,
            Some(cset(3, ChangeKind::Delta, 5))
        );
        assert_eq!(store.next_cset_after(REPO, sha, Timestamp(7))?, None);
        assert_eq!(store.cset_count(REPO, sha)?, 5);
        Ok(())
    }

    #[test]
    fn test_base_time_skips_deltas() -> ResultTest<()> {
        let store = Memory::new();
        let sha = hash_key("k");
        seed_chain(&store, sha)?;

        assert_eq!(store.base_time(REPO, sha, Some(Timestamp(3)))?, Some(Timestamp(1)));
        assert_eq!(store.base_time(REPO, sha, Some(Timestamp(6)))?, Some(Timestamp(5)));
        assert_eq!(store.base_time(REPO, sha, None)?, Some(Timestamp(7)));
        assert_eq!(store.base_time(REPO, hash_key("other"), None)?, None);
        Ok(())
    }

    #[test]
    fn test_duplicate_cset_rejected() -> ResultTest<()> {
        let store = Memory::new();
        let sha = hash_key("k");
        store.insert_cset(REPO, sha, cset(1, ChangeKind::Snapshot, 10))?;
        assert!(matches!(
            store.insert_cset(REPO, sha, cset(1, ChangeKind::Delta, 3)),
            Err(DBError::CSetExists { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_ensure_key_detects_collision() -> ResultTest<()> {
        let store = Memory::new();
        let sha = hash_key("key1");
        store.ensure_key(sha, "key1")?;
        store.ensure_key(sha, "key1")?;
        // Injected digest: pretend "key2" hashes to the same value.
        assert!(matches!(
            store.ensure_key(sha, "key2"),
            Err(DBError::Collision { .. })
        ));
        assert_eq!(store.key_for(&sha)?, Some("key1".to_owned()));
        Ok(())
    }

    #[test]
    fn test_repo_directory() -> ResultTest<()> {
        let store = Memory::new();
        let id = store.create_repo("alice", "places")?;
        assert_eq!(store.find_repo("alice", "places")?.map(|r| r.id), Some(id));
        assert_eq!(store.find_repo("alice", "streets")?, None);
        assert!(matches!(
            store.create_repo("alice", "places"),
            Err(DBError::RepoExists { .. })
        ));

        store.remove_repo(id)?;
        assert_eq!(store.find_repo("alice", "places")?, None);
        // The name is free again.
        store.create_repo("alice", "places")?;
        Ok(())
    }

    #[test]
    fn test_remove_key_drops_a_whole_history() -> ResultTest<()> {
        let store = Memory::new();
        let sha = hash_key("k");
        let other = hash_key("other");
        seed_chain(&store, sha)?;
        store.insert_blob(REPO, sha, Timestamp(1), vec![1, 2, 3])?;
        store.insert_cset(REPO, other, cset(1, ChangeKind::Snapshot, 10))?;

        store.remove_key(REPO, sha)?;

        assert_eq!(store.cset_count(REPO, sha)?, 0);
        assert_eq!(store.blob(REPO, sha, Timestamp(1))?, None);
        assert_eq!(store.cset_count(REPO, other)?, 1);
        Ok(())
    }

    #[test]
    fn test_remove_repo_cascades() -> ResultTest<()> {
        let store = Memory::new();
        let sha = hash_key("k");
        seed_chain(&store, sha)?;
        store.insert_blob(REPO, sha, Timestamp(1), vec![1, 2, 3])?;
        store.insert_commit_message(REPO, sha, Timestamp(1), "initial")?;
        let other = RepoId(2);
        store.insert_cset(other, sha, cset(1, ChangeKind::Snapshot, 10))?;

        store.remove_repo(REPO)?;

        assert_eq!(store.cset_count(REPO, sha)?, 0);
        assert_eq!(store.blob(REPO, sha, Timestamp(1))?, None);
        assert_eq!(store.commit_message(REPO, sha, Timestamp(1))?, None);
        // Other repositories are untouched, and so is the key map.
        assert_eq!(store.cset_count(other, sha)?, 1);
        Ok(())
    }

    #[test]
    fn test_live_keys_pagination() -> ResultTest<()> {
        let store = Memory::new();
        let keys = ["a", "b", "c", "d"];
        for key in keys {
            let sha = hash_key(key);
            store.ensure_key(sha, key)?;
            store.insert_cset(REPO, sha, cset(1, ChangeKind::Snapshot, 10))?;
        }
        // Tombstone one of them.
        store.insert_cset(REPO, hash_key("b"), cset(2, ChangeKind::Delete, 0))?;

        let all = store.live_keys_at(REPO, Timestamp(10), 1, 100, None)?;
        let mut names: Vec<_> = all.iter().map(|(k, _)| k.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["a", "c", "d"]);

        // Before the tombstone all four keys are live.
        assert_eq!(store.live_keys_at(REPO, Timestamp(1), 1, 100, None)?.len(), 4);

        // Pages partition the per-key groups.
        let page1 = store.live_keys_at(REPO, Timestamp(10), 1, 2, None)?;
        let page2 = store.live_keys_at(REPO, Timestamp(10), 2, 2, None)?;
        let page3 = store.live_keys_at(REPO, Timestamp(10), 3, 2, None)?;
        assert_eq!(page1.len() + page2.len() + page3.len(), 3);
        assert!(page3.is_empty());

        // An explicit limit caps the page.
        assert_eq!(store.live_keys_at(REPO, Timestamp(10), 1, 100, Some(2))?.len(), 2);
        Ok(())
    }
}
