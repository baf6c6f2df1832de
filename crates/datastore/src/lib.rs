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

//! The datastore client (spec §4.1): typed async operations over Redis for
//! domain metadata, ready-queues, the dedup bloom filter and atomic
//! claim/release scripts. Every remote call goes through [`Datastore`]; no
//! other crate talks to `redis` directly.

pub mod bloom_ops;
pub mod coordinator;
pub mod domain;
pub mod ready_set;
pub mod visited;

use std::time::Duration;

use common::retry::ExponentialBackoff;
use deadpool_redis::{Config, Runtime};
use redis::Script;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("datastore pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("datastore pool creation error: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("datastore operation exceeded its deadline after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },
}

/// Whether a [`redis::RedisError`] represents a transient condition (connection
/// loss, the server still loading its dataset) worth retrying, versus a
/// programming error (wrong arity, wrong type) that never recovers by
/// itself. Mirrors the distinction spec §4.1 draws for retry eligibility.
fn is_transient(err: &redis::RedisError) -> bool {
    err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() || {
        let msg = err.to_string();
        msg.contains("LOADING")
    }
}

/// Loaded-once Lua scripts for the atomic multi-key operations spec §4.1
/// calls for (claim, release, link-commit), cached by SHA the way
/// `EVALSHA` expects.
pub(crate) struct Scripts {
    pub claim: Script,
    pub release: Script,
    pub link_commit: Script,
    pub upsert_frontier_growth: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim: Script::new(include_str!("scripts/claim.lua")),
            release: Script::new(include_str!("scripts/release.lua")),
            link_commit: Script::new(include_str!("scripts/link_commit.lua")),
            upsert_frontier_growth: Script::new(include_str!("scripts/upsert_frontier_growth.lua")),
        }
    }
}

pub struct Datastore {
    pool: deadpool_redis::Pool,
    scripts: Scripts,
}

impl Datastore {
    pub fn connect(redis_url: &str) -> Result<Self, Error> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self {
            pool,
            scripts: Scripts::load(),
        })
    }

    pub(crate) async fn connection(&self) -> Result<deadpool_redis::Connection, Error> {
        Ok(self.pool.get().await?)
    }

    pub(crate) fn scripts(&self) -> &Scripts {
        &self.scripts
    }

    /// Retries `op` with exponential backoff until it succeeds, a
    /// non-transient error occurs, or `deadline` elapses — the retry policy
    /// spec §4.1 requires for idempotent remote calls.
    pub(crate) async fn with_retry<T, F, Fut>(&self, deadline: Duration, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let start = std::time::Instant::now();
        let mut backoff = ExponentialBackoff::from_millis(20).with_limit(Duration::from_secs(2));
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(Error::Redis(e)) if is_transient(&e) => {
                    if start.elapsed() >= deadline {
                        return Err(Error::DeadlineExceeded { attempts });
                    }
                    let delay = backoff.next().unwrap_or(Duration::from_secs(2));
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_recognized() {
        let err = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&err));
    }
}
