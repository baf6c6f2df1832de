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

//! Coordinator-only state (spec §4.8/§4.9/§6): per-shard heartbeats, the
//! `reshard_in_progress` flag, the durable seed set, and domain-key
//! enumeration for bulk housekeeping scans.

use std::time::Duration;

use redis::AsyncCommands;

use crate::{Datastore, Error};

const RESHARD_KEY: &str = "reshard_in_progress";
const SEEDS_KEY: &str = "seeds:set";
const SHUTDOWN_KEY: &str = "shutdown_requested";

fn heartbeat_key(shard: u32) -> String {
    format!("heartbeat:{shard}")
}

impl Datastore {
    /// Written by each fetcher process every `heartbeat_interval_seconds`
    /// (spec §4.8).
    pub async fn record_heartbeat(&self, deadline: Duration, shard: u32, now: u64) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.set(heartbeat_key(shard), now).await?;
            Ok(())
        })
        .await
    }

    /// `None` if the shard has never reported in.
    pub async fn heartbeat(&self, deadline: Duration, shard: u32) -> Result<Option<u64>, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            Ok(conn.get(heartbeat_key(shard)).await?)
        })
        .await
    }

    pub async fn set_reshard_in_progress(&self, deadline: Duration, in_progress: bool) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.set(RESHARD_KEY, in_progress as u8).await?;
            Ok(())
        })
        .await
    }

    pub async fn is_reshard_in_progress(&self, deadline: Duration) -> Result<bool, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let flag: Option<u8> = conn.get(RESHARD_KEY).await?;
            Ok(flag.unwrap_or(0) == 1)
        })
        .await
    }

    /// A standalone `stop` invocation (spec §6's CLI) has no direct channel
    /// to a running process's `CancellationToken`; it sets this flag instead,
    /// which the orchestrator's stop-condition loop polls on the same
    /// cadence it already checks `stop_max_pages`/`stop_max_duration`.
    pub async fn request_shutdown(&self, deadline: Duration) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.set(SHUTDOWN_KEY, true as u8).await?;
            Ok(())
        })
        .await
    }

    pub async fn is_shutdown_requested(&self, deadline: Duration) -> Result<bool, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let flag: Option<u8> = conn.get(SHUTDOWN_KEY).await?;
            Ok(flag.unwrap_or(0) == 1)
        })
        .await
    }

    /// Clears the flag once the orchestrator has acted on it, so a future
    /// fresh `start`/`resume` doesn't immediately self-cancel.
    pub async fn clear_shutdown_request(&self, deadline: Duration) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.del(SHUTDOWN_KEY).await?;
            Ok(())
        })
        .await
    }

    pub async fn add_seed(&self, deadline: Duration, url: &str) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.sadd(SEEDS_KEY, url).await?;
            Ok(())
        })
        .await
    }

    /// Used on `resume` (spec §6's CLI) to re-derive the full seed list
    /// without requiring the operator to keep the original seed file.
    pub async fn all_seeds(&self, deadline: Duration) -> Result<Vec<String>, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            Ok(conn.smembers(SEEDS_KEY).await?)
        })
        .await
    }

    /// Re-inserts a domain into `ready:<shard>` with score `now` and clears
    /// its `claimed_by`/`claimed_at` fields. Used when the stale-claim scan
    /// (spec §4.8) finds a domain held by a shard whose heartbeat has gone
    /// dark for longer than `heartbeat_dead_after_seconds`.
    pub async fn reset_stale_claim(&self, deadline: Duration, shard: u32, domain: &str, now: u64) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let meta_key = format!("domain:{domain}");
            let _: () = conn.hdel(&meta_key, &["claimed_by", "claimed_at"]).await?;
            let _: () = conn.zadd(format!("ready:{shard}"), domain, now as f64).await?;
            Ok(())
        })
        .await
    }

    /// Enumerates every known registered domain by scanning `domain:*` keys.
    /// Used by the resharder (§4.9) and the stale-claim scanner (§4.8); both
    /// are bulk, infrequent operations, so a non-blocking `SCAN` cursor walk
    /// is preferred over `KEYS`.
    pub async fn scan_all_domains(&self, deadline: Duration) -> Result<Vec<String>, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let mut cursor = 0u64;
            let mut domains = Vec::new();
            loop {
                let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg("domain:*")
                    .arg("COUNT")
                    .arg(500)
                    .query_async(&mut conn)
                    .await?;
                domains.extend(keys.into_iter().filter_map(|k| k.strip_prefix("domain:").map(str::to_string)));
                if next_cursor == 0 {
                    break;
                }
                cursor = next_cursor;
            }
            Ok(domains)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_key_is_namespaced_by_shard() {
        assert_eq!(heartbeat_key(3), "heartbeat:3");
        assert_ne!(heartbeat_key(3), heartbeat_key(4));
    }
}
