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

//! The fetcher worker pool (spec §4.6): the per-shard claim/fetch/release
//! loop, backpressured against the parser queue.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use datastore::{ready_set::ClaimedDomain, visited::VisitedRecord, Datastore};
use politeness::{DomainFlags, PolitenessEngine};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    frontier::{FrontierManager, TakeOutcome},
    http::HttpFetcher,
    metrics::Metrics,
    parse::ParseJob,
};

/// How long a worker sleeps after `claim_next` finds nothing eligible
/// (spec §4.5: "the caller should sleep <= a small quantum").
pub const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct FetcherPool {
    frontier: Arc<FrontierManager>,
    politeness: Arc<PolitenessEngine>,
    http: Arc<HttpFetcher>,
    datastore: Arc<Datastore>,
    metrics: Arc<Metrics>,
    parser_tx: tokio::sync::mpsc::Sender<ParseJob>,
    shard: u32,
    fetch_deadline: Duration,
    op_deadline: Duration,
    shutdown_grace: Duration,
}

impl FetcherPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frontier: Arc<FrontierManager>,
        politeness: Arc<PolitenessEngine>,
        http: Arc<HttpFetcher>,
        datastore: Arc<Datastore>,
        metrics: Arc<Metrics>,
        parser_tx: tokio::sync::mpsc::Sender<ParseJob>,
        shard: u32,
        fetch_deadline: Duration,
        op_deadline: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            frontier,
            politeness,
            http,
            datastore,
            metrics,
            parser_tx,
            shard,
            fetch_deadline,
            op_deadline,
            shutdown_grace,
        }
    }

    /// Spawns `num_tasks` cooperative fetcher tasks for this shard (spec
    /// §4.6). Each runs independently; ordering is only guaranteed within a
    /// single domain's file, never across tasks.
    pub fn spawn(self: Arc<Self>, num_tasks: usize, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        (0..num_tasks.max(1))
            .map(|_| {
                let pool = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.worker_loop(cancel).await })
            })
            .collect()
    }

    async fn worker_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let claimed = match self.frontier.claim_next(self.shard).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => continue,
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, shard = self.shard, "claim_next failed");
                    tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                    continue;
                }
            };

            self.handle_claim(claimed, &cancel).await;
        }
    }

    async fn handle_claim(&self, claimed: ClaimedDomain, cancel: &CancellationToken) {
        let now = unix_now();

        let outcome = match self.frontier.take_next_url(&claimed, self.shard) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(domain = %claimed.domain, error = %e, "frontier read failed");
                self.release(&claimed, claimed.frontier_offset, now).await;
                return;
            }
        };

        let (url_str, depth, next_offset) = match outcome {
            TakeOutcome::Exhausted => {
                self.release(&claimed, claimed.frontier_offset, now).await;
                return;
            }
            TakeOutcome::Url { url, depth, next_offset } => (url, depth, next_offset),
        };

        let Ok(url) = Url::parse(&url_str) else {
            self.release(&claimed, next_offset, now).await;
            return;
        };

        let flags = self.domain_flags(&claimed.domain).await;
        if !self.politeness.is_url_allowed(&url, &claimed.domain, flags).await {
            self.release(&claimed, next_offset, now).await;
            return;
        }

        self.politeness.ensure_robots_fresh(&claimed.domain).await;

        let fetch_result = tokio::select! {
            result = self.http.fetch(&url, self.fetch_deadline) => Some(result),
            _ = cancel.cancelled() => {
                // spec §4.6 shutdown step 1: finish or cancel in-flight work
                // within a grace period before abandoning it.
                tokio::select! {
                    result = self.http.fetch(&url, self.shutdown_grace) => Some(result),
                    _ = tokio::time::sleep(self.shutdown_grace) => None,
                }
            }
        };

        let next_fetch_time = self.politeness.next_fetch_time(&claimed.domain, now).await;

        match fetch_result {
            None => {
                // Cancelled and abandoned mid-flight: release without
                // advancing next_fetch_time so a future process can retry.
                self.release(&claimed, claimed.frontier_offset, now).await;
            }
            Some(Ok(page)) if page.status < 400 => {
                self.metrics.record_fetch_ok();
                self.release(&claimed, next_offset, next_fetch_time).await;

                if is_html(page.content_type.as_deref()) {
                    let job = ParseJob {
                        url: page.final_url,
                        depth,
                        domain: claimed.domain.clone(),
                        status: page.status,
                        content_type: page.content_type,
                        body: page.body,
                        fetched_at: now,
                    };
                    // Bounded channel: a full parser queue blocks this
                    // fetcher task cooperatively (spec §4.6 backpressure).
                    if self.parser_tx.send(job).await.is_err() {
                        tracing::warn!("parser queue closed; dropping parsed page");
                    }
                } else {
                    self.record_error(&url, Some(page.status), None, now).await;
                }
            }
            Some(Ok(page)) => {
                self.metrics.record_fetch_error();
                self.release(&claimed, next_offset, next_fetch_time).await;
                self.record_error(&url, Some(page.status), None, now).await;
            }
            Some(Err(e)) => {
                self.metrics.record_fetch_error();
                self.release(&claimed, next_offset, next_fetch_time).await;
                self.record_error(&url, None, Some(e.to_string()), now).await;
            }
        }
    }

    async fn domain_flags(&self, domain: &str) -> DomainFlags {
        match self.frontier.domain_meta(domain).await {
            Ok(Some(meta)) => DomainFlags {
                is_excluded: meta.is_excluded,
                is_seeded: meta.is_seeded,
            },
            _ => DomainFlags {
                is_excluded: false,
                is_seeded: false,
            },
        }
    }

    async fn release(&self, claimed: &ClaimedDomain, new_offset: u64, next_fetch_time: u64) {
        if let Err(e) = self.frontier.release(self.shard, claimed, new_offset, next_fetch_time).await {
            tracing::warn!(domain = %claimed.domain, error = %e, "release failed");
        }
    }

    async fn record_error(&self, url: &Url, status: Option<u16>, error: Option<String>, now: u64) {
        let record = VisitedRecord {
            url: url.to_string(),
            status_code: status,
            content_path: None,
            error,
            fetched_at: now,
        };
        if let Err(e) = self
            .datastore
            .record_visited(self.op_deadline, &common::url::hash16(url), &record)
            .await
        {
            tracing::warn!(url = %url, error = %e, "failed to record visited entry");
        }
    }
}

fn is_html(content_type: Option<&str>) -> bool {
    content_type.map(|ct| ct.contains("text/html")).unwrap_or(false)
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
    fn html_content_type_is_detected() {
        assert!(is_html(Some("text/html; charset=utf-8")));
        assert!(!is_html(Some("application/pdf")));
        assert!(!is_html(None));
    }
}
