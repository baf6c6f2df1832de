// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The resharder (spec §4.9): moves each domain whose `hash(domain) mod N`
//! changed when the shard count changed, while `reshard_in_progress` keeps
//! fetchers from claiming.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use datastore::Datastore;
use frontier_store::{shard_for_domain, FrontierStore};

use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReshardReport {
    pub domains_scanned: usize,
    pub domains_moved: usize,
    pub domains_reconciled: usize,
}

pub struct Resharder {
    datastore: Arc<Datastore>,
    frontier_root: PathBuf,
    old_num_shards: u32,
    op_deadline: Duration,
}

impl Resharder {
    pub fn new(datastore: Arc<Datastore>, frontier_root: impl Into<PathBuf>, old_num_shards: u32, op_deadline: Duration) -> Self {
        Self {
            datastore,
            frontier_root: frontier_root.into(),
            old_num_shards,
            op_deadline,
        }
    }

    /// Runs the full quiesce -> move -> resume cycle (spec §4.9 steps 1-3).
    /// The `reshard_in_progress` flag is always cleared, even on error, so a
    /// failed reshard never wedges the crawler permanently stuck quiesced.
    pub async fn reshard_to(&self, new_num_shards: u32) -> Result<ReshardReport> {
        self.datastore.set_reshard_in_progress(self.op_deadline, true).await?;
        let result = self.run(new_num_shards).await;
        self.datastore.set_reshard_in_progress(self.op_deadline, false).await?;
        result
    }

    async fn run(&self, new_num_shards: u32) -> Result<ReshardReport> {
        let domains = self.datastore.scan_all_domains(self.op_deadline).await?;
        let mut report = ReshardReport {
            domains_scanned: domains.len(),
            ..Default::default()
        };

        for domain in domains {
            let Some(meta) = self.datastore.get_domain_meta(self.op_deadline, &domain).await? else {
                continue;
            };

            let actual_shard = self.reconcile_shard(&domain, meta.shard).await?;
            if actual_shard != meta.shard {
                self.datastore.set_shard(self.op_deadline, &domain, actual_shard).await?;
                report.domains_reconciled += 1;
            }

            let new_shard = shard_for_domain(&domain, new_num_shards);
            if new_shard == actual_shard {
                continue;
            }

            let old_store = FrontierStore::new(&self.frontier_root, actual_shard);
            let new_path = old_store.move_to_shard(&domain, new_shard)?;
            self.datastore.set_file_path(self.op_deadline, &domain, &new_path).await?;
            self.datastore.set_shard(self.op_deadline, &domain, new_shard).await?;
            self.datastore.remove_from_ready(self.op_deadline, actual_shard, &domain).await?;

            if meta.frontier_offset < meta.frontier_size {
                self.datastore
                    .mark_ready_no_earlier_than(self.op_deadline, new_shard, &domain, unix_now())
                    .await?;
            }
            report.domains_moved += 1;
        }

        Ok(report)
    }

    /// spec §4.9 crash recovery: if a prior reshard died mid-move, the file
    /// may already live under a shard its metadata doesn't name. On-disk
    /// location wins; metadata is corrected to match rather than moving the
    /// file a second time.
    async fn reconcile_shard(&self, domain: &str, recorded_shard: u32) -> Result<u32> {
        if FrontierStore::new(&self.frontier_root, recorded_shard).exists(domain) {
            return Ok(recorded_shard);
        }
        for shard in 0..self.old_num_shards {
            if shard != recorded_shard && FrontierStore::new(&self.frontier_root, shard).exists(domain) {
                tracing::warn!(domain, recorded_shard, found_shard = shard, "reconciling shard after interrupted reshard");
                return Ok(shard);
            }
        }
        Ok(recorded_shard)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_mapping_changes_when_shard_count_changes() {
        let domain = "example.com";
        let old = shard_for_domain(domain, 2);
        let new = shard_for_domain(domain, 4);
        // Not guaranteed to differ for every domain, but the function must
        // at least be deterministic given the same shard count.
        assert_eq!(old, shard_for_domain(domain, 2));
        assert_eq!(new, shard_for_domain(domain, 4));
    }
}
