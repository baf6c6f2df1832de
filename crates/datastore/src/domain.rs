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

//! Domain metadata (spec §3): the `domain:<name>` hash holding `file_path`,
//! `frontier_offset`, `frontier_size`, `next_fetch_time`, `robots_txt`,
//! `robots_expires`, `is_excluded`, `is_seeded`, and `shard`. Per spec §5's
//! shared-resource policy, this one hash has several independent writers:
//! the owning shard's fetcher (`frontier_offset`), any enqueuing process
//! (`frontier_size`, `file_path`), the politeness engine (`robots_txt`,
//! `robots_expires`), and the coordinator (resharder, exclusion loader).

use std::time::Duration;

use redis::{AsyncCommands, cmd};

use crate::{Datastore, Error};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainMeta {
    pub file_path: String,
    pub frontier_offset: u64,
    pub frontier_size: u64,
    /// Earliest time politeness permits a fetch from this domain (spec §3).
    pub next_fetch_time: u64,
    /// Cached robots.txt body, empty until the politeness engine's first
    /// fetch for this domain.
    pub robots_txt: String,
    /// Unix-seconds expiry of `robots_txt`; `0` means never fetched.
    pub robots_expires: u64,
    pub is_excluded: bool,
    pub is_seeded: bool,
    pub shard: u32,
    /// Set by the claim script while a fetcher holds this domain; cleared
    /// by release. Used by stale-claim recovery (spec §4.8).
    pub claimed_by: Option<u32>,
    pub claimed_at: Option<u64>,
}

fn key(domain: &str) -> String {
    format!("domain:{domain}")
}

impl Datastore {
    pub async fn get_domain_meta(&self, deadline: Duration, domain: &str) -> Result<Option<DomainMeta>, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let fields: Vec<Option<String>> = cmd("HMGET")
                .arg(key(domain))
                .arg(&[
                    "file_path",
                    "frontier_offset",
                    "frontier_size",
                    "next_fetch_time",
                    "robots_txt",
                    "robots_expires",
                    "is_excluded",
                    "is_seeded",
                    "shard",
                    "claimed_by",
                    "claimed_at",
                ])
                .query_async(&mut conn)
                .await?;
            if fields.iter().all(Option::is_none) {
                return Ok(None);
            }
            Ok(Some(DomainMeta {
                file_path: fields[0].clone().unwrap_or_default(),
                frontier_offset: fields[1].as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                frontier_size: fields[2].as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                next_fetch_time: fields[3].as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                robots_txt: fields[4].clone().unwrap_or_default(),
                robots_expires: fields[5].as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                is_excluded: fields[6].as_deref() == Some("1"),
                is_seeded: fields[7].as_deref() == Some("1"),
                shard: fields[8].as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
                claimed_by: fields[9].as_deref().and_then(|s| s.parse().ok()),
                claimed_at: fields[10].as_deref().and_then(|s| s.parse().ok()),
            }))
        })
        .await
    }

    /// Ensures `file_path`/`shard` are set (first enqueue for a new domain)
    /// and raises `frontier_size` to `new_size` iff it is still smaller
    /// (spec §5: SET-IF-ABSENT for `file_path`, SET-IF-GREATER for
    /// `frontier_size`), atomically via Lua so two concurrent enqueuers for
    /// the same domain can never race each other's write.
    pub async fn upsert_frontier_growth(
        &self,
        deadline: Duration,
        domain: &str,
        file_path: &str,
        shard: u32,
        new_size: u64,
    ) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = self
                .scripts()
                .upsert_frontier_growth
                .key(key(domain))
                .arg(file_path)
                .arg(shard)
                .arg(new_size)
                .invoke_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    /// Reads the politeness engine's cached robots.txt for `domain`, if any
    /// is present and unexpired as of `now` (spec §3/§6: `robots_txt`,
    /// `robots_expires`). Returns `None` when no cache entry exists yet or
    /// it has expired, either of which means the caller must refetch.
    pub async fn get_robots_cache(
        &self,
        deadline: Duration,
        domain: &str,
        now: u64,
    ) -> Result<Option<(String, u64)>, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let fields: Vec<Option<String>> = cmd("HMGET")
                .arg(key(domain))
                .arg(&["robots_txt", "robots_expires"])
                .query_async(&mut conn)
                .await?;
            let body = fields[0].clone();
            let expires = fields[1].as_deref().and_then(|s| s.parse::<u64>().ok());
            match (body, expires) {
                (Some(body), Some(expires)) if expires > now => Ok(Some((body, expires))),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Persists a freshly (re)fetched or classified robots.txt (spec §3:
    /// the politeness engine is one of the hash's writers, single-writer-
    /// wins per field — concurrent coalesced fetches for the same domain
    /// are serialized upstream by the politeness engine's own lock, so a
    /// plain `HSET` here is sufficient).
    pub async fn set_robots_cache(
        &self,
        deadline: Duration,
        domain: &str,
        body: &str,
        expires_at: u64,
    ) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn
                .hset_multiple(
                    key(domain),
                    &[("robots_txt", body.to_string()), ("robots_expires", expires_at.to_string())],
                )
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_excluded(&self, deadline: Duration, domain: &str, excluded: bool) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.hset(key(domain), "is_excluded", excluded as u8).await?;
            Ok(())
        })
        .await
    }

    /// Only the seed loader ever sets this (spec §4.5 step 8); normal
    /// enqueues never flip it.
    pub async fn mark_seeded(&self, deadline: Duration, domain: &str) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.hset(key(domain), "is_seeded", true as u8).await?;
            Ok(())
        })
        .await
    }

    pub async fn set_shard(&self, deadline: Duration, domain: &str, shard: u32) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.hset(key(domain), "shard", shard).await?;
            Ok(())
        })
        .await
    }

    pub async fn set_file_path(&self, deadline: Duration, domain: &str, file_path: &str) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let _: () = conn.hset(key(domain), "file_path", file_path).await?;
            Ok(())
        })
        .await
    }
}
