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

//! Visited records (spec §3): one terminal outcome per fetch attempt, used
//! for metrics and debugging rather than re-crawl decisions (dedup is the
//! bloom filter's job, not this log).

use std::time::Duration;

use redis::AsyncCommands;

use crate::{Datastore, Error};

#[derive(Debug, Clone)]
pub struct VisitedRecord {
    pub url: String,
    pub status_code: Option<u16>,
    /// The stored content's path under the content root (spec §3/§6's
    /// `content_path`), not its hash — the hash alone isn't enough to
    /// locate the file without also knowing the configured extension.
    pub content_path: Option<String>,
    pub error: Option<String>,
    pub fetched_at: u64,
}

fn key(url_hash: &str) -> String {
    format!("visited:{url_hash}")
}

impl Datastore {
    pub async fn record_visited(&self, deadline: Duration, url_hash: &str, record: &VisitedRecord) -> Result<(), Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            let mut fields: Vec<(&str, String)> = vec![
                ("url", record.url.clone()),
                ("fetched_at", record.fetched_at.to_string()),
            ];
            if let Some(status) = record.status_code {
                fields.push(("status_code", status.to_string()));
            }
            if let Some(path) = &record.content_path {
                fields.push(("content_path", path.clone()));
            }
            if let Some(error) = &record.error {
                fields.push(("error", error.clone()));
            }
            let _: () = conn.hset_multiple(key(url_hash), &fields).await?;
            Ok(())
        })
        .await
    }

    pub async fn incr_pages_fetched(&self, deadline: Duration, by: u64) -> Result<u64, Error> {
        self.with_retry(deadline, || async {
            let mut conn = self.connection().await?;
            Ok(conn.incr("metrics:pages_fetched", by).await?)
        })
        .await
    }
}
