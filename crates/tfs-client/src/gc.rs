//! Orphan segment collection
//!
//! Segments uploaded by a large-file write that never produced an index are
//! unreachable. They are queued here and deleted once they are older than
//! `gc_expired_time`, so a writer resuming from a checkpoint has time to
//! pick them up first.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tfs_common::{UnlinkAction, UnlinkType};

use crate::client::TfsClient;
use crate::resolver::Location;
use crate::stats::ClientStats;

#[derive(Debug, Clone)]
pub struct Orphan {
    pub location: Location,
    pub queued: Instant,
}

#[derive(Debug, Default)]
pub struct GcQueue {
    orphans: Mutex<Vec<Orphan>>,
}

impl GcQueue {
    pub fn push(&self, location: Location) {
        debug!(segment = %location.name, "queued orphan segment");
        self.orphans.lock().push(Orphan {
            location,
            queued: Instant::now(),
        });
    }

    pub fn extend(&self, locations: impl IntoIterator<Item = Location>) {
        for location in locations {
            self.push(location);
        }
    }

    /// Remove and return orphans older than `expiry`
    pub fn take_expired(&self, expiry: Duration) -> Vec<Orphan> {
        let mut orphans = self.orphans.lock();
        let (expired, kept) = orphans
            .drain(..)
            .partition(|o| o.queued.elapsed() >= expiry);
        *orphans = kept;
        expired
    }

    fn requeue(&self, orphan: Orphan) {
        self.orphans.lock().push(orphan);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.orphans.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TfsClient {
    /// Delete expired orphan segments. Transient failures are retried on the
    /// next run; anything else drops the orphan. Returns how many were removed.
    pub async fn collect_garbage(&self) -> usize {
        let expired = self.gc.take_expired(self.tunables.gc_expiry());
        if expired.is_empty() {
            return 0;
        }

        let action = UnlinkType::new(UnlinkAction::Delete).with_override();
        let mut removed = 0;
        for orphan in expired {
            match self.unlink_location(&orphan.location, action).await {
                Ok(_) => removed += 1,
                Err(e) if e.is_not_found() => {
                    debug!(segment = %orphan.location.name, "orphan segment already gone");
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        segment = %orphan.location.name,
                        error = %e,
                        "failed to remove orphan segment, will retry"
                    );
                    self.gc.requeue(orphan);
                }
                Err(e) => {
                    warn!(
                        segment = %orphan.location.name,
                        error = %e,
                        "giving up on orphan segment"
                    );
                }
            }
        }

        ClientStats::add(&self.stats.gc_removed, removed as u64);
        if removed > 0 {
            info!(removed, pending = self.gc.len(), "collected orphan segments");
        }
        removed
    }
}
