//! Eviction policy
//!
//! Least-recently-used by last activity, among idle directories only. A
//! directory with a live session or an attached append handle is skipped
//! no matter how long it has been quiet.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, warn};

use crate::directory::MuxDirectory;

use super::{CacheInner, CacheTable};

/// Limits a sweep evicts towards
pub(crate) struct Pressure {
    pub dir_max: usize,
    pub stream_max: usize,
    /// Maximum evictions in this pass
    pub budget: usize,
}

impl CacheInner {
    /// Pick idle directories, oldest first, until `pressure` would be
    /// relieved or its budget is spent
    ///
    /// Picked directories leave `resident` and are marked busy; pass them to
    /// [`CacheInner::close_victims`] once the table is unlocked.
    pub(crate) fn take_victims(
        &self,
        table: &mut CacheTable,
        pressure: &Pressure,
    ) -> Vec<(PathBuf, MuxDirectory)> {
        let mut resident = table.resident.len();
        let mut streams: usize = table.resident.values().map(|d| d.stream_count()).sum();
        let over = |resident: usize, streams: usize| {
            resident > pressure.dir_max || streams > pressure.stream_max
        };
        if !over(resident, streams) {
            return Vec::new();
        }

        let mut candidates: Vec<(Instant, PathBuf)> = table
            .resident
            .iter()
            .filter(|(_, d)| d.is_idle())
            .map(|(path, d)| (d.last_activity(), path.clone()))
            .collect();
        candidates.sort();

        let mut victims = Vec::new();
        for (_, path) in candidates {
            if victims.len() >= pressure.budget || !over(resident, streams) {
                break;
            }
            let Some(dir) = table.resident.remove(&path) else {
                continue;
            };

            resident -= 1;
            streams = streams.saturating_sub(dir.stream_count());
            table.busy.insert(path.clone());
            victims.push((path, dir));
        }

        victims
    }

    /// Close victims with the table unlocked. Returns the number evicted;
    /// any that gained writers in the meantime become resident again.
    pub(crate) fn close_victims(&self, victims: Vec<(PathBuf, MuxDirectory)>) -> usize {
        if victims.is_empty() {
            return 0;
        }

        let mut evicted = 0;
        for (path, dir) in &victims {
            match dir.try_close() {
                Ok(true) => {
                    evicted += 1;
                    self.evictions.fetch_add(1, Ordering::SeqCst);
                    debug!(path = %path.display(), "directory evicted");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "eviction failed");
                }
            }
        }

        self.settle(victims);
        evicted
    }

    /// One maintenance pass of the sweeper
    pub(crate) fn sweep(&self) -> usize {
        let pressure = Pressure {
            dir_max: self.config.cache_dir_max,
            stream_max: self.config.cache_stream_max,
            budget: self.config.write_cache_dir_liner,
        };

        let victims = {
            let mut table = self.dirs.lock();
            table.resident.retain(|_, d| !d.is_closed());
            self.take_victims(&mut table, &pressure)
        };

        let evicted = self.close_victims(victims);
        if evicted > 0 {
            debug!(evicted, "cache sweep");
        }
        evicted
    }
}
