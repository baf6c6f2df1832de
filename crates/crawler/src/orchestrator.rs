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

//! The orchestrator (spec §4.8): seed loading, worker pool startup,
//! heartbeats, the metrics tick, stale-claim recovery, and stop-condition
//! detection driving graceful shutdown.

use std::{
    path::Path,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use datastore::Datastore;
use politeness::PolitenessEngine;
use tokio_util::sync::CancellationToken;

use crate::{content_store::ContentStore, fetch::FetcherPool, frontier::FrontierManager, http::HttpFetcher, metrics::Metrics, parse::ParserWorkerPool, Result};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Total shard count in the deployment (used for domain->shard hashing
    /// elsewhere); this process only runs the fetcher pools in `owned_shards`.
    pub shards: u32,
    pub owned_shards: Vec<u32>,
    pub fetcher_tasks_per_shard: usize,
    pub parser_workers: usize,
    pub parser_queue_items: usize,
    pub fetch_deadline: Duration,
    pub op_deadline: Duration,
    pub fetcher_shutdown_grace: Duration,
    pub metrics_interval: Duration,
    pub stale_claim_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_dead_after: Duration,
    pub stop_max_pages: u64,
    pub stop_max_duration: Option<Duration>,
    pub shutdown_idle_grace: Duration,
}

pub struct Orchestrator {
    datastore: Arc<Datastore>,
    frontier: Arc<FrontierManager>,
    politeness: Arc<PolitenessEngine>,
    http: Arc<HttpFetcher>,
    content_store: Arc<ContentStore>,
    metrics: Arc<Metrics>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        datastore: Arc<Datastore>,
        frontier: Arc<FrontierManager>,
        politeness: Arc<PolitenessEngine>,
        http: Arc<HttpFetcher>,
        content_store: Arc<ContentStore>,
        metrics: Arc<Metrics>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            datastore,
            frontier,
            politeness,
            http,
            content_store,
            metrics,
            config,
        }
    }

    /// Loads one URL per line from `path` (spec §4.8: seed-file parsing
    /// itself is an external collaborator; this just reads lines), persists
    /// them to `seeds:set` for a future `resume`, and enqueues each at
    /// depth 0.
    pub async fn load_seed_file(&self, path: &Path) -> Result<usize> {
        let text = tokio::fs::read_to_string(path).await?;
        let urls: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();

        for url in &urls {
            self.datastore.add_seed(self.config.op_deadline, url).await?;
        }

        Ok(self.frontier.enqueue_seeds(&urls).await?)
    }

    /// Re-enqueues every durably recorded seed (spec §6 `resume` subcommand)
    /// without requiring the operator to still have the original seed file.
    pub async fn resume_seeds(&self) -> Result<usize> {
        let urls = self.datastore.all_seeds(self.config.op_deadline).await?;
        Ok(self.frontier.enqueue_seeds(&urls).await?)
    }

    /// Starts the fetcher/parser pools for `owned_shards` plus the
    /// housekeeping tasks (heartbeat, metrics, stale-claim scan, stop
    /// detection), and blocks until `cancel` fires and every task has wound
    /// down (spec §4.8's graceful-shutdown contract).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let (parser_tx, parser_rx) = tokio::sync::mpsc::channel(self.config.parser_queue_items.max(1));

        let parser_pool = Arc::new(ParserWorkerPool::new(
            self.frontier.clone(),
            self.content_store.clone(),
            self.datastore.clone(),
            self.metrics.clone(),
            self.config.op_deadline,
        ));
        let mut handles = parser_pool.spawn(self.config.parser_workers.max(1), parser_rx);

        for &shard in &self.config.owned_shards {
            let fetcher_pool = Arc::new(FetcherPool::new(
                self.frontier.clone(),
                self.politeness.clone(),
                self.http.clone(),
                self.datastore.clone(),
                self.metrics.clone(),
                parser_tx.clone(),
                shard,
                self.config.fetch_deadline,
                self.config.op_deadline,
                self.config.fetcher_shutdown_grace,
            ));
            handles.extend(fetcher_pool.spawn(self.config.fetcher_tasks_per_shard.max(1), cancel.clone()));
        }
        // Every fetcher pool holds its own clone; dropping this one lets the
        // parser pool observe channel closure once all fetchers exit.
        drop(parser_tx);

        handles.push(tokio::spawn(self.clone().heartbeat_loop(cancel.clone())));
        handles.push(tokio::spawn(self.clone().metrics_loop(cancel.clone())));
        handles.push(tokio::spawn(self.clone().stale_claim_loop(cancel.clone())));
        handles.push(tokio::spawn(self.clone().stop_condition_loop(cancel.clone())));

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            for &shard in &self.config.owned_shards {
                if let Err(e) = self.datastore.record_heartbeat(self.config.op_deadline, shard, unix_now()).await {
                    tracing::warn!(shard, error = %e, "heartbeat write failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.metrics_interval) => self.metrics.log_snapshot(),
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// spec §4.8: finds domains claimed by a shard whose heartbeat has gone
    /// dark and resets them so another fetcher can pick the domain back up.
    async fn stale_claim_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.stale_claim_interval) => {}
                _ = cancel.cancelled() => return,
            }

            if let Err(e) = self.scan_stale_claims().await {
                tracing::warn!(error = %e, "stale-claim scan failed");
            }
        }
    }

    async fn scan_stale_claims(&self) -> Result<()> {
        let now = unix_now();
        let domains = self.datastore.scan_all_domains(self.config.op_deadline).await?;
        for domain in domains {
            let Some(meta) = self.frontier.domain_meta(&domain).await? else {
                continue;
            };
            let (Some(claimed_by), Some(claimed_at)) = (meta.claimed_by, meta.claimed_at) else {
                continue;
            };

            let heartbeat = self.datastore.heartbeat(self.config.op_deadline, claimed_by).await?;
            let shard_dead = match heartbeat {
                Some(ts) => now.saturating_sub(ts) > self.config.heartbeat_dead_after.as_secs(),
                None => true,
            };
            let claim_stale = now.saturating_sub(claimed_at) > self.config.heartbeat_dead_after.as_secs();

            if shard_dead && claim_stale {
                tracing::warn!(domain, shard = claimed_by, "resetting stale claim from dead fetcher");
                self.datastore
                    .reset_stale_claim(self.config.op_deadline, claimed_by, &domain, now)
                    .await?;
            }
        }
        Ok(())
    }

    async fn stop_condition_loop(self: Arc<Self>, cancel: CancellationToken) {
        let start = Instant::now();
        let mut idle_since: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let pages = self.metrics.pages_fetched_total.load(Ordering::Relaxed);
            if should_stop_on_pages(pages, self.config.stop_max_pages) {
                tracing::info!(pages, "stop_max_pages reached; shutting down");
                cancel.cancel();
                return;
            }
            if should_stop_on_duration(start.elapsed(), self.config.stop_max_duration) {
                tracing::info!("stop_max_duration reached; shutting down");
                cancel.cancel();
                return;
            }

            match self.datastore.is_shutdown_requested(self.config.op_deadline).await {
                Ok(true) => {
                    tracing::info!("shutdown requested via stop subcommand; shutting down");
                    if let Err(e) = self.datastore.clear_shutdown_request(self.config.op_deadline).await {
                        tracing::warn!(error = %e, "failed to clear shutdown request flag");
                    }
                    cancel.cancel();
                    return;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "shutdown-flag check failed"),
            }

            let all_idle = self.all_ready_sets_empty().await;
            if all_idle {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.shutdown_idle_grace {
                    tracing::info!("all ready sets empty past idle grace; shutting down");
                    cancel.cancel();
                    return;
                }
            } else {
                idle_since = None;
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn all_ready_sets_empty(&self) -> bool {
        for &shard in &self.config.owned_shards {
            match self.datastore.ready_len(self.config.op_deadline, shard).await {
                Ok(0) => continue,
                _ => return false,
            }
        }
        true
    }
}

fn should_stop_on_pages(pages_fetched: u64, stop_max_pages: u64) -> bool {
    stop_max_pages > 0 && pages_fetched >= stop_max_pages
}

fn should_stop_on_duration(elapsed: Duration, stop_max_duration: Option<Duration>) -> bool {
    matches!(stop_max_duration, Some(max) if elapsed >= max)
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
    fn stop_on_pages_is_disabled_when_limit_is_zero() {
        assert!(!should_stop_on_pages(1_000_000, 0));
        assert!(should_stop_on_pages(100, 100));
        assert!(!should_stop_on_pages(99, 100));
    }

    #[test]
    fn stop_on_duration_is_disabled_without_a_limit() {
        assert!(!should_stop_on_duration(Duration::from_secs(9999), None));
        assert!(should_stop_on_duration(Duration::from_secs(100), Some(Duration::from_secs(60))));
        assert!(!should_stop_on_duration(Duration::from_secs(10), Some(Duration::from_secs(60))));
    }
}
