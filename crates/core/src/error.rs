use std::io;

use thiserror::Error;

use crate::db::store::{RepoId, Timestamp};
use crate::hash::KeySha;

#[derive(Error, Debug)]
pub enum DBError {
    #[error("no revision of {key} in repo {repo} at {ts}")]
    NotFound {
        repo: RepoId,
        key: KeySha,
        ts: Timestamp,
    },
    #[error("key map collision on {sha}: maps to `{existing}`, refusing `{new}`")]
    Collision {
        sha: KeySha,
        existing: String,
        new: String,
    },
    #[error("non-monotonic append at {ts}: chain tail is at {tail}")]
    NonMonotonic { ts: Timestamp, tail: Timestamp },
    #[error("invalid delta range: no revision of {key} at {ts}")]
    InvalidRange { key: KeySha, ts: Timestamp },
    #[error("missing blob for changeset {key}@{ts} in repo {repo}")]
    MissingBlob {
        repo: RepoId,
        key: KeySha,
        ts: Timestamp,
    },
    #[error("changeset {key}@{ts} already exists in repo {repo}")]
    CSetExists {
        repo: RepoId,
        key: KeySha,
        ts: Timestamp,
    },
    #[error("blob {key}@{ts} already exists in repo {repo}")]
    BlobExists {
        repo: RepoId,
        key: KeySha,
        ts: Timestamp,
    },
    #[error("repo `{owner}/{name}` already exists")]
    RepoExists { owner: String, name: String },
    #[error("lock on revision store was poisoned: {0}")]
    StorePoisoned(String),
    #[error("IOError: {0}.")]
    IoError(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type used throughout the test suites.
pub type ResultTest<T> = anyhow::Result<T>;
