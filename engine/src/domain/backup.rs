//! Backup cadence and retention policy.

/// Decides when the ledger should snapshot itself into the backend's
/// backup area: after every K-th successful addition, plus on demand.
/// Retention (keep only the N most recent) is enforced by the backend's
/// `prune_backups`.
#[derive(Debug, Clone)]
pub struct BackupPolicy {
    every: u32,
    keep: usize,
    additions: u32,
}

impl BackupPolicy {
    pub fn new(every: u32, keep: usize) -> Self {
        Self {
            every,
            keep,
            additions: 0,
        }
    }

    /// How many backups to retain.
    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Record `count` successful additions; returns true when an
    /// auto-backup is due. The counter carries over, so a batch that
    /// crosses the threshold triggers exactly one backup.
    pub fn note_additions(&mut self, count: u32) -> bool {
        if self.every == 0 {
            return false;
        }
        self.additions += count;
        if self.additions >= self.every {
            self.additions %= self.every;
            true
        } else {
            false
        }
    }
}
