//! Background maintenance
//!
//! One task per client. Every tick it drops expired resolver entries and
//! idle connections; on their own periods it collects orphan segments and
//! logs a statistics snapshot. The task holds a weak reference so it never
//! keeps a dropped client alive.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::TfsClient;

const TICK: Duration = Duration::from_secs(1);

pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Ask the task to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn abort(self) {
        self.task.abort();
    }
}

pub fn spawn(client: &Arc<TfsClient>) -> MaintenanceHandle {
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(maintenance_loop(Arc::downgrade(client), rx));
    MaintenanceHandle { shutdown, task }
}

/// Whether a job with period `period` last run at `last` is due
fn due(period: Option<Duration>, last: Instant, now: Instant) -> bool {
    period.is_some_and(|p| now.duration_since(last) >= p)
}

async fn maintenance_loop(client: Weak<TfsClient>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let start = Instant::now();
    let mut last_gc = start;
    let mut last_stat = start;

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {}
        }

        let Some(client) = client.upgrade() else {
            break;
        };
        if !client.is_live() {
            break;
        }

        let expired = client.resolver.expire();
        let idle = client
            .tunables
            .cache_ttl()
            .map_or(0, |ttl| client.pool.expire_idle(ttl));
        if expired > 0 || idle > 0 {
            debug!(expired, idle, "expired cached entries");
        }

        let now = Instant::now();
        if due(client.tunables.gc_period(), last_gc, now) {
            last_gc = now;
            client.collect_garbage().await;
        }
        if due(client.tunables.stat_period(), last_stat, now) {
            last_stat = now;
            let stats = client.stats.snapshot();
            info!(
                opens = stats.opens,
                reads = stats.reads,
                read_bytes = stats.read_bytes,
                writes = stats.writes,
                write_bytes = stats.write_bytes,
                unlinks = stats.unlinks,
                retries = stats.retries,
                failures = stats.failures,
                hit_ratio = client.stats.hit_ratio(),
                open_files = client.open_files(),
                orphans = client.pending_orphans(),
                "client statistics"
            );
        }
    }

    debug!("maintenance task stopped");
}
