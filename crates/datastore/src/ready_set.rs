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

//! `ready:<shard>` sorted sets and the atomic claim/release scripts (spec
//! §4.1, §4.5).

use std::time::Duration;

use redis::AsyncCommands;

use crate::{Datastore, Error};

fn ready_key(shard: u32) -> String {
    format!("ready:{shard}")
}

/// The tuple a successful claim returns: everything the fetcher needs to
/// start reading the domain's frontier file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDomain {
    pub domain: String,
    pub file_path: String,
    pub frontier_offset: u64,
    pub frontier_size: u64,
    /// Earliest time politeness permitted this fetch, as of the claim
    /// (spec §3's `next_fetch_time`); carried through so a fetcher can log
    /// or reason about scheduling without a second round-trip.
    pub next_fetch_time: u64,
}

impl Datastore {
    /// Ensures `domain` is a member of `ready:<shard>` with score
    /// `min(current_score, candidate_score)`, per spec §4.5 step 7: newly
    /// available domains become ready immediately, but an already-scheduled
    /// domain is never made *earlier* than its politeness delay.
    pub async fn mark_ready_no_earlier_than(
        &self,
        deadline: Duration,
        shard: u32,
        domain: &str,
        candidate_score: u64,
    ) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let key = ready_key(shard);
            let current: Option<f64> = conn.zscore(&key, domain).await?;
            let score = match current {
                Some(existing) => (existing as u64).min(candidate_score),
                None => candidate_score,
            };
            let _: () = conn.zadd(&key, domain, score as f64).await?;
            Ok(())
        })
        .await
    }

    /// Atomic pop-min of `ready:<shard>` whose score <= now (spec §4.1/§4.5
    /// `claim_next`). Returns `None` if nothing is eligible.
    pub async fn claim_next(&self, deadline: Duration, shard: u32, now: u64) -> Result<Option<ClaimedDomain>, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let result: Vec<String> = self
                .scripts()
                .claim
                .key(ready_key(shard))
                .arg(now)
                .arg(shard)
                .invoke_async(&mut conn)
                .await?;

            if result.is_empty() {
                return Ok(None);
            }

            Ok(Some(ClaimedDomain {
                domain: result[0].clone(),
                file_path: result.get(1).cloned().unwrap_or_default(),
                frontier_offset: result.get(2).and_then(|s| s.parse().ok()).unwrap_or(0),
                frontier_size: result.get(3).and_then(|s| s.parse().ok()).unwrap_or(0),
                next_fetch_time: result.get(4).and_then(|s| s.parse().ok()).unwrap_or(0),
            }))
        })
        .await
    }

    /// Persists `new_offset` and re-inserts `domain` into `ready:<shard>`
    /// with score `next_fetch_time` iff it still has unread URLs (spec
    /// §4.5 `release`). Returns whether the domain was re-inserted.
    pub async fn release(
        &self,
        deadline: Duration,
        shard: u32,
        domain: &str,
        new_offset: u64,
        next_fetch_time: u64,
    ) -> Result<bool, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let reinserted: i64 = self
                .scripts()
                .release
                .key(ready_key(shard))
                .arg(domain)
                .arg(new_offset)
                .arg(next_fetch_time)
                .invoke_async(&mut conn)
                .await?;
            Ok(reinserted == 1)
        })
        .await
    }

    /// Removes `domain` from `ready:<old_shard>` without touching its
    /// metadata; used by the resharder (spec §4.9) right before
    /// re-inserting into the new shard's ready set.
    pub async fn remove_from_ready(&self, deadline: Duration, shard: u32, domain: &str) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.zrem(ready_key(shard), domain).await?;
            Ok(())
        })
        .await
    }

    pub async fn ready_len(&self, deadline: Duration, shard: u32) -> Result<u64, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            Ok(conn.zcard(ready_key(shard)).await?)
        })
        .await
    }
}
