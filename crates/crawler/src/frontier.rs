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

//! The frontier manager (spec §4.5): the central glue between the dedup
//! bloom, per-domain frontier files and the datastore's ready sets. Every
//! URL that ever reaches a fetcher passes through here first.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use datastore::{bloom_ops::RemoteDedupBloom, domain::DomainMeta, ready_set::ClaimedDomain, Datastore};
use frontier_store::{FrontierStore, ReadOutcome, UrlEntry};
use politeness::{DomainFlags, PolitenessEngine};
use url::Url;

use crate::{EnqueueLink, RawLink, Result};

/// Result of reading the next URL out of a claimed domain's frontier file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TakeOutcome {
    Url { url: String, depth: u32, next_offset: u64 },
    Exhausted,
}

pub struct FrontierManager {
    datastore: Arc<Datastore>,
    frontier_root: PathBuf,
    bloom: RemoteDedupBloom,
    politeness: Arc<PolitenessEngine>,
    num_shards: u32,
    max_url_len: usize,
    max_depth: u32,
    op_deadline: Duration,
    fsync_interval: Duration,
    /// Last forced-fsync time per domain (spec §4.2's configurable cadence).
    /// A plain `std::sync::Mutex` is fine here: the critical section is a
    /// single hashmap read-or-insert, never held across an `.await`.
    last_fsync: std::sync::Mutex<HashMap<String, u64>>,
}

impl FrontierManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datastore: Arc<Datastore>,
        frontier_root: impl Into<PathBuf>,
        bloom: RemoteDedupBloom,
        politeness: Arc<PolitenessEngine>,
        num_shards: u32,
        max_url_len: usize,
        max_depth: u32,
        op_deadline: Duration,
        fsync_interval: Duration,
    ) -> Self {
        Self {
            datastore,
            frontier_root: frontier_root.into(),
            bloom,
            politeness,
            num_shards,
            max_url_len,
            max_depth,
            op_deadline,
            fsync_interval,
            last_fsync: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Decides whether this append must force an `fsync` (spec §4.2: "each
    /// flush fsync'd on a configurable cadence"), and if so, records `now`
    /// as the domain's last-synced time.
    fn should_force_fsync(&self, domain: &str, now: u64) -> bool {
        let mut last = self.last_fsync.lock().expect("last_fsync mutex poisoned");
        let due = match last.get(domain) {
            Some(&prev) => now.saturating_sub(prev) >= self.fsync_interval.as_secs(),
            None => true,
        };
        if due {
            last.insert(domain.to_string(), now);
        }
        due
    }

    fn store_for_shard(&self, shard: u32) -> FrontierStore {
        FrontierStore::new(&self.frontier_root, shard)
    }

    fn shard_of(&self, domain: &str) -> u32 {
        frontier_store::shard_for_domain(domain, self.num_shards)
    }

    /// spec §4.5 `enqueue`: normalize, filter, dedup, and append survivors to
    /// their destination shards' frontier files.
    pub async fn enqueue(&self, links: &[RawLink], source_domain: &str, base: Option<&Url>) -> Result<usize> {
        let candidates = self.normalize_and_filter(links, source_domain, base).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = candidates.iter().map(|c| c.url.as_str().to_string()).collect();
        let novel_mask = self
            .datastore
            .bloom_link_commit(self.op_deadline, &self.bloom, &keys)
            .await?;

        let survivors: Vec<&EnqueueLink> = candidates
            .iter()
            .zip(novel_mask.iter())
            .filter_map(|(c, &novel)| if novel { Some(c) } else { None })
            .collect();
        if survivors.is_empty() {
            return Ok(0);
        }

        let mut by_domain: HashMap<String, Vec<&EnqueueLink>> = HashMap::new();
        for link in &survivors {
            if let Some(domain) = common::url::registered_domain(&link.url) {
                by_domain.entry(domain).or_default().push(link);
            }
        }

        let now = unix_now();
        let mut total = 0usize;
        for (domain, links) in by_domain {
            let shard = self.shard_of(&domain);
            let entries: Vec<UrlEntry> = links
                .iter()
                .map(|l| UrlEntry {
                    url: l.url.as_str().to_string(),
                    depth: l.depth,
                    priority: 0,
                    added_at: now,
                })
                .collect();

            let store = self.store_for_shard(shard);
            let relative_path = FrontierStore::relative_path(shard, &domain);
            let force_fsync = self.should_force_fsync(&domain, now);
            let new_size = store.append_many(&domain, &entries, force_fsync)?;

            self.datastore
                .upsert_frontier_growth(self.op_deadline, &domain, &relative_path, shard, new_size)
                .await?;
            self.datastore
                .mark_ready_no_earlier_than(self.op_deadline, shard, &domain, now)
                .await?;
            total += entries.len();
        }

        Ok(total)
    }

    async fn normalize_and_filter(
        &self,
        links: &[RawLink],
        source_domain: &str,
        base: Option<&Url>,
    ) -> Result<Vec<EnqueueLink>> {
        tracing::trace!(source_domain, candidates = links.len(), "normalizing enqueue batch");
        let mut out = Vec::with_capacity(links.len());
        for link in links {
            if link.depth > self.max_depth && self.max_depth > 0 {
                continue;
            }
            let Ok(url) = common::url::normalize(base, &link.href, self.max_url_len) else {
                continue;
            };
            let Some(domain) = common::url::registered_domain(&url) else {
                continue;
            };

            let flags = self.domain_flags(&domain).await?;
            if !self.politeness.is_domain_permitted_in_principle(flags) {
                continue;
            }

            out.push(EnqueueLink { url, depth: link.depth });
        }
        Ok(out)
    }

    async fn domain_flags(&self, domain: &str) -> Result<DomainFlags> {
        let meta = self.datastore.get_domain_meta(self.op_deadline, domain).await?;
        Ok(match meta {
            Some(m) => DomainFlags {
                is_excluded: m.is_excluded,
                is_seeded: m.is_seeded,
            },
            None => DomainFlags {
                is_excluded: false,
                is_seeded: false,
            },
        })
    }

    /// Seed loading (spec §4.8): marks each seed domain as seeded, then
    /// enqueues the seed URL at depth 0.
    pub async fn enqueue_seeds(&self, seed_urls: &[String]) -> Result<usize> {
        let mut total = 0usize;
        for raw in seed_urls {
            let Ok(url) = common::url::normalize(None, raw, self.max_url_len) else {
                continue;
            };
            let Some(domain) = common::url::registered_domain(&url) else {
                continue;
            };
            self.datastore.mark_seeded(self.op_deadline, &domain).await?;
            total += self
                .enqueue(
                    &[RawLink {
                        href: url.as_str().to_string(),
                        depth: 0,
                    }],
                    &domain,
                    None,
                )
                .await?;
        }
        Ok(total)
    }

    /// spec §4.5 `claim_next`.
    pub async fn claim_next(&self, shard: u32) -> Result<Option<ClaimedDomain>> {
        Ok(self.datastore.claim_next(self.op_deadline, shard, unix_now()).await?)
    }

    /// spec §4.5 `take_next_url`.
    pub fn take_next_url(&self, claimed: &ClaimedDomain, shard: u32) -> Result<TakeOutcome> {
        let store = self.store_for_shard(shard);
        match store.read_line_at(&claimed.domain, claimed.frontier_offset)? {
            ReadOutcome::Entry(entry, next_offset) => Ok(TakeOutcome::Url {
                url: entry.url,
                depth: entry.depth,
                next_offset,
            }),
            ReadOutcome::Exhausted => Ok(TakeOutcome::Exhausted),
            ReadOutcome::Pending => Ok(TakeOutcome::Exhausted),
        }
    }

    /// spec §4.5 `release`.
    pub async fn release(
        &self,
        shard: u32,
        claimed: &ClaimedDomain,
        new_offset: u64,
        next_fetch_time: u64,
    ) -> Result<()> {
        self.datastore
            .release(self.op_deadline, shard, &claimed.domain, new_offset, next_fetch_time)
            .await?;
        Ok(())
    }

    pub async fn domain_meta(&self, domain: &str) -> Result<Option<DomainMeta>> {
        Ok(self.datastore.get_domain_meta(self.op_deadline, domain).await?)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_stable_across_instances() {
        assert_eq!(
            frontier_store::shard_for_domain("example.com", 8),
            frontier_store::shard_for_domain("example.com", 8)
        );
    }
}
