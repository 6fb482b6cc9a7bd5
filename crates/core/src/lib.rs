pub mod db;
pub mod error;
pub mod hash;

pub use crate::db::chain::{Chain, Memento};
pub use crate::db::revision_db::{Delta, Outcome, RevisionDb};
pub use crate::db::store::{CSet, ChangeKind, Repo, RepoId, RevisionStore, StatementSet, Timestamp};
pub use crate::error::DBError;

/// [`RevisionDb`] options.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// The snapshot-forcing factor.
    ///
    /// This factor (among others) determines whether a snapshot is stored
    /// rather than a delta, depending on the size of the latest snapshot and
    /// subsequent deltas. For the latest snapshot `base` and deltas `d1`,
    /// `d2`, ..., `dn` a new snapshot is definitely stored if:
    ///
    /// `snapshot_factor * len(base) <= len(d1) + len(d2) + ... + len(dn)`
    ///
    /// In short, larger values will result in longer delta chains and likely
    /// reduce storage size at the expense of higher revision reconstruction
    /// costs.
    ///
    /// Default: 10.0
    pub snapshot_factor: f64,
    /// Pagination size for repository indexes (number of resource keys per
    /// page).
    ///
    /// Default: 1000
    pub index_page_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            snapshot_factor: 10.0,
            index_page_size: 1000,
        }
    }
}
