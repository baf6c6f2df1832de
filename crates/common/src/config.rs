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

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Every field carries its own default function so a config file only needs
/// to set the options an operator actually cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "defaults::shards")]
    pub shards: u32,
    #[serde(default = "defaults::fetcher_tasks_per_shard")]
    pub fetcher_tasks_per_shard: usize,
    #[serde(default = "defaults::parser_workers_per_shard")]
    pub parser_workers_per_shard: usize,
    #[serde(default = "defaults::parser_queue_items")]
    pub parser_queue_items: usize,
    #[serde(default = "defaults::parser_queue_bytes")]
    pub parser_queue_bytes: u64,

    #[serde(default = "defaults::bloom_capacity")]
    pub bloom_capacity: u64,
    #[serde(default = "defaults::bloom_fpr")]
    pub bloom_fpr: f64,

    #[serde(default = "defaults::max_url_len")]
    pub max_url_len: usize,
    #[serde(default = "defaults::max_depth")]
    pub max_depth: u32,

    #[serde(default = "defaults::fetch_deadline_seconds")]
    pub fetch_deadline_seconds: u64,
    #[serde(default = "defaults::robots_fetch_deadline_seconds")]
    pub robots_fetch_deadline_seconds: u64,

    #[serde(default = "defaults::default_crawl_delay_seconds")]
    pub default_crawl_delay_seconds: u64,
    #[serde(default = "defaults::min_crawl_delay_seconds")]
    pub min_crawl_delay_seconds: u64,
    #[serde(default = "defaults::max_crawl_delay_seconds")]
    pub max_crawl_delay_seconds: u64,

    #[serde(default = "defaults::robots_ttl_seconds")]
    pub robots_ttl_seconds: u64,
    #[serde(default = "defaults::robots_negative_ttl_seconds")]
    pub robots_negative_ttl_seconds: u64,

    #[serde(default = "defaults::seeded_only")]
    pub seeded_only: bool,

    #[serde(default = "defaults::stop_max_pages")]
    pub stop_max_pages: u64,
    #[serde(default = "defaults::stop_max_duration_seconds")]
    pub stop_max_duration_seconds: u64,

    #[serde(default = "defaults::metrics_interval_seconds")]
    pub metrics_interval_seconds: u64,
    #[serde(default = "defaults::stale_claim_interval_seconds")]
    pub stale_claim_interval_seconds: u64,
    #[serde(default = "defaults::heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "defaults::heartbeat_dead_after_seconds")]
    pub heartbeat_dead_after_seconds: u64,
    #[serde(default = "defaults::shutdown_idle_grace_seconds")]
    pub shutdown_idle_grace_seconds: u64,
    #[serde(default = "defaults::fetcher_shutdown_grace_seconds")]
    pub fetcher_shutdown_grace_seconds: u64,
    #[serde(default = "defaults::max_fetcher_tasks")]
    pub max_fetcher_tasks: usize,

    #[serde(default = "defaults::content_root")]
    pub content_root: String,
    #[serde(default = "defaults::frontier_root")]
    pub frontier_root: String,
    #[serde(default = "defaults::save_extracted_text_only")]
    pub save_extracted_text_only: bool,
    #[serde(default = "defaults::frontier_fsync_interval_seconds")]
    pub frontier_fsync_interval_seconds: u64,

    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,
    #[serde(default = "defaults::redis_url")]
    pub redis_url: String,
    #[serde(default = "defaults::log_filter")]
    pub log_filter: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        // SAFETY net for callers that want an all-defaults config without
        // going through TOML: deserialize an empty table so every
        // `#[serde(default = ...)]` function above is exercised the same
        // way it would be for a real file.
        toml::from_str("").expect("CrawlerConfig defaults must always deserialize")
    }
}

impl CrawlerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        let config: CrawlerConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.shards == 0 {
            return Err(Error::ConfigInvalid("shards must be >= 1".into()));
        }
        if self.fetcher_tasks_per_shard == 0 {
            return Err(Error::ConfigInvalid(
                "fetcher_tasks_per_shard must be >= 1".into(),
            ));
        }
        if self.min_crawl_delay_seconds > self.max_crawl_delay_seconds {
            return Err(Error::ConfigInvalid(
                "min_crawl_delay_seconds must be <= max_crawl_delay_seconds".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.bloom_fpr) {
            return Err(Error::ConfigInvalid("bloom_fpr must be in (0, 1)".into()));
        }
        Ok(())
    }
}

/// Pure default-value functions, mirroring the teacher crate's
/// `config::defaults` module: one function per field, so each field's
/// default is independently documented and testable.
pub mod defaults {
    pub fn shards() -> u32 {
        1
    }
    pub fn fetcher_tasks_per_shard() -> usize {
        500
    }
    pub fn parser_workers_per_shard() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1)
    }
    pub fn parser_queue_items() -> usize {
        200
    }
    pub fn parser_queue_bytes() -> u64 {
        50 * 1024 * 1024
    }
    pub fn bloom_capacity() -> u64 {
        200_000_000
    }
    pub fn bloom_fpr() -> f64 {
        1e-4
    }
    pub fn max_url_len() -> usize {
        2048
    }
    pub fn max_depth() -> u32 {
        0
    }
    pub fn fetch_deadline_seconds() -> u64 {
        30
    }
    pub fn robots_fetch_deadline_seconds() -> u64 {
        10
    }
    pub fn default_crawl_delay_seconds() -> u64 {
        1
    }
    pub fn min_crawl_delay_seconds() -> u64 {
        1
    }
    pub fn max_crawl_delay_seconds() -> u64 {
        60
    }
    pub fn robots_ttl_seconds() -> u64 {
        24 * 3600
    }
    pub fn robots_negative_ttl_seconds() -> u64 {
        3600
    }
    pub fn seeded_only() -> bool {
        false
    }
    pub fn stop_max_pages() -> u64 {
        0
    }
    pub fn stop_max_duration_seconds() -> u64 {
        0
    }
    pub fn metrics_interval_seconds() -> u64 {
        60
    }
    pub fn stale_claim_interval_seconds() -> u64 {
        300
    }
    pub fn heartbeat_interval_seconds() -> u64 {
        10
    }
    pub fn heartbeat_dead_after_seconds() -> u64 {
        60
    }
    pub fn shutdown_idle_grace_seconds() -> u64 {
        120
    }
    pub fn fetcher_shutdown_grace_seconds() -> u64 {
        30
    }
    pub fn max_fetcher_tasks() -> usize {
        500
    }
    pub fn content_root() -> String {
        "./data/content".to_string()
    }
    pub fn frontier_root() -> String {
        "./data/frontier".to_string()
    }
    pub fn save_extracted_text_only() -> bool {
        true
    }
    /// Frontier appends rely on the OS to flush dirty pages, with an
    /// explicit `fsync` forced at least this often per domain.
    pub fn frontier_fsync_interval_seconds() -> u64 {
        5
    }
    pub fn user_agent() -> String {
        "farcrawlbot/0.1 (+https://example.invalid/bot)".to_string()
    }
    pub fn redis_url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }
    pub fn log_filter() -> String {
        "farcrawl=info".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_deserializes_to_full_defaults() {
        let cfg: CrawlerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.shards, 1);
        assert_eq!(cfg.max_depth, 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let cfg: CrawlerConfig = toml::from_str("shards = 8\nseeded_only = true\n").unwrap();
        assert_eq!(cfg.shards, 8);
        assert!(cfg.seeded_only);
        assert_eq!(cfg.bloom_capacity, defaults::bloom_capacity());
    }

    #[test]
    fn rejects_zero_shards() {
        let cfg: CrawlerConfig = toml::from_str("shards = 0").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_crawl_delay_bounds() {
        let cfg: CrawlerConfig =
            toml::from_str("min_crawl_delay_seconds = 30\nmax_crawl_delay_seconds = 10").unwrap();
        assert!(cfg.validate().is_err());
    }
}
