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

//! Thin adapter mapping `bloom`'s bit math onto the shared Redis bitmap
//! (spec §4.3, §4.1's "link-commit" pipeline): the authoritative bits live
//! in `seen:bloom` so every fetcher process agrees on membership without
//! sharing in-process state.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use redis::AsyncCommands;

use crate::{Datastore, Error};

const BITMAP_KEY: &str = "seen:bloom";

pub struct RemoteDedupBloom {
    num_hashes: u64,
    bit_len: u64,
    capacity: u64,
    warned_half_full: AtomicBool,
}

impl RemoteDedupBloom {
    pub fn new(capacity: u64, fpr: f64) -> Self {
        let bit_len = bloom::num_bits(capacity, fpr);
        let num_hashes = bloom::num_hashes(bit_len, capacity);
        Self {
            num_hashes,
            bit_len,
            capacity,
            warned_half_full: AtomicBool::new(false),
        }
    }
}

impl Datastore {
    /// Bulk probably-seen mask, in order (spec §4.3 `contains_many`).
    pub async fn bloom_contains_many(
        &self,
        deadline: Duration,
        bloom: &RemoteDedupBloom,
        urls: &[impl AsRef<[u8]>],
    ) -> Result<Vec<bool>, Error> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let mut pipe = redis::pipe();
            for url in urls {
                for offset in bloom::bit_positions(url.as_ref(), bloom.num_hashes, bloom.bit_len) {
                    pipe.cmd("GETBIT").arg(BITMAP_KEY).arg(offset);
                }
            }
            let bits: Vec<u8> = pipe.query_async(&mut conn).await?;

            let mut result = Vec::with_capacity(urls.len());
            let mut idx = 0usize;
            for _ in urls {
                let chunk = &bits[idx..idx + bloom.num_hashes as usize];
                result.push(chunk.iter().all(|&b| b == 1));
                idx += bloom.num_hashes as usize;
            }
            Ok(result)
        })
        .await
    }

    /// Marks every URL in `urls` as seen (spec §4.3 `add_many`). Idempotent:
    /// safe to retry freely, as the spec requires.
    pub async fn bloom_add_many(
        &self,
        deadline: Duration,
        bloom: &RemoteDedupBloom,
        urls: &[impl AsRef<[u8]>],
    ) -> Result<(), Error> {
        if urls.is_empty() {
            return Ok(());
        }
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let mut pipe = redis::pipe();
            for url in urls {
                for offset in bloom::bit_positions(url.as_ref(), bloom.num_hashes, bloom.bit_len) {
                    pipe.cmd("SETBIT").arg(BITMAP_KEY).arg(offset).arg(1);
                }
            }
            let _: Vec<i64> = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await?;

        self.maybe_warn_bloom_occupancy(deadline, bloom).await
    }

    /// Single round-trip "bloom-exists x K -> select novel -> bloom-add x
    /// novel" (spec §4.1): returns, for each URL in order, whether it was
    /// novel (and has now been added) or already seen (left untouched).
    pub async fn bloom_link_commit(
        &self,
        deadline: Duration,
        bloom: &RemoteDedupBloom,
        urls: &[impl AsRef<[u8]>],
    ) -> Result<Vec<bool>, Error> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let result = self
            .with_retry(deadline, || async {
                let mut conn = self.connection().await?;
                let script = &self.scripts().link_commit;
                let mut binding = script.key(BITMAP_KEY);
                let mut invocation = binding.arg(bloom.num_hashes);
                for url in urls {
                    for offset in bloom::bit_positions(url.as_ref(), bloom.num_hashes, bloom.bit_len) {
                        invocation = invocation.arg(offset);
                    }
                }
                let novel: Vec<i64> = invocation.invoke_async(&mut conn).await?;
                Ok(novel)
            })
            .await?;

        self.maybe_warn_bloom_occupancy(deadline, bloom).await?;
        Ok(result.into_iter().map(|n| n == 1).collect())
    }

    async fn maybe_warn_bloom_occupancy(&self, deadline: Duration, bloom: &RemoteDedupBloom) -> Result<(), Error> {
        if bloom.warned_half_full.load(Ordering::Relaxed) {
            return Ok(());
        }
        let popcount: i64 = self
            .with_retry(deadline, || async {
                let mut conn = self.connection().await?;
                Ok(conn.bitcount(BITMAP_KEY).await?)
            })
            .await?;
        let occupancy = popcount as f64 / bloom.bit_len as f64;
        if occupancy > 0.5 && !bloom.warned_half_full.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                occupancy,
                capacity = bloom.capacity,
                "dedup bloom bitmap occupancy exceeds half of nominal capacity; false-positive rate is rising"
            );
        }
        Ok(())
    }
}
