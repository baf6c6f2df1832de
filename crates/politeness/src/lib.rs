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

//! The politeness engine (spec §4.4): robots.txt fetch/parse/cache and
//! per-domain crawl-delay computation.
//!
//! The teacher crate's `RobotsTxtManager` (`crates/core/src/crawler/robots_txt.rs`)
//! caches `Lookup<RobotsTxt>` in a plain `BTreeMap` behind a single mutex,
//! appropriate for its RPC-worker's single-task-at-a-time model. This engine
//! runs inside a process with hundreds of concurrent fetcher tasks, so the
//! cache is a [`dashmap::DashMap`] and concurrent cache misses for the same
//! domain coalesce behind a per-domain [`tokio::sync::Mutex`] rather than a
//! single global lock — only one robots.txt fetch per domain is ever in
//! flight, other callers await its result (§4.4's "coalescing" contract).

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use datastore::Datastore;
use robotstxt::RobotsTxt;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no robots.txt url could be constructed for domain {0}")]
    InvalidDomain(String),
}

#[derive(Debug, Clone)]
pub struct PolitenessConfig {
    pub user_agent: String,
    pub robots_fetch_deadline: Duration,
    pub robots_ttl: Duration,
    pub robots_negative_ttl: Duration,
    pub min_crawl_delay: Duration,
    pub max_crawl_delay: Duration,
    pub default_crawl_delay: Duration,
    pub seeded_only: bool,
    pub coalesce_wait: Duration,
    /// Deadline for the datastore round-trips this engine makes to read
    /// and persist the shared robots.txt cache (spec §3's `robots_txt`/
    /// `robots_expires` fields on the `domain:<d>` hash).
    pub datastore_op_deadline: Duration,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            user_agent: "farcrawlbot".to_string(),
            robots_fetch_deadline: Duration::from_secs(10),
            robots_ttl: Duration::from_secs(24 * 3600),
            robots_negative_ttl: Duration::from_secs(3600),
            min_crawl_delay: Duration::from_secs(1),
            max_crawl_delay: Duration::from_secs(60),
            default_crawl_delay: Duration::from_secs(1),
            seeded_only: false,
            coalesce_wait: Duration::from_secs(15),
            datastore_op_deadline: Duration::from_secs(2),
        }
    }
}

struct CacheEntry {
    robots: Arc<RobotsTxt>,
    expires_at: u64,
}

/// Per-domain decision flags that live in domain metadata (spec §3), owned
/// by the datastore rather than by this crate. Callers (the frontier
/// manager) look these up and pass them in rather than this engine reading
/// them itself, since they're read on every enqueue candidate and a
/// datastore round-trip there would be far too expensive; the robots.txt
/// cache below is the one place this engine does reach into the datastore,
/// since it's read/written only once per domain per TTL window.
#[derive(Debug, Clone, Copy)]
pub struct DomainFlags {
    pub is_excluded: bool,
    pub is_seeded: bool,
}

pub struct PolitenessEngine {
    config: PolitenessConfig,
    http: reqwest::Client,
    datastore: Arc<Datastore>,
    cache: DashMap<String, CacheEntry>,
    fetch_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl PolitenessEngine {
    pub fn new(config: PolitenessConfig, datastore: Arc<Datastore>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .expect("reqwest client config is always valid here");
        Self {
            config,
            http,
            datastore,
            cache: DashMap::new(),
            fetch_locks: DashMap::new(),
        }
    }

    /// spec §4.4 `is_url_allowed`.
    pub async fn is_url_allowed(&self, url: &Url, domain: &str, flags: DomainFlags) -> bool {
        if !self.is_domain_permitted_in_principle(flags) {
            return false;
        }

        let robots = self.robots_for(domain).await;
        robots.is_allowed(&self.config.user_agent, url.path())
    }

    /// spec §4.5 `enqueue` step 3: the cheap, non-network part of the
    /// allowability check (manual exclusion, seeded-only policy) without
    /// fetching robots.txt. Used at enqueue time, where a robots fetch per
    /// candidate link would be far too expensive; the full robots check
    /// happens once, at claim time, via [`Self::is_url_allowed`].
    pub fn is_domain_permitted_in_principle(&self, flags: DomainFlags) -> bool {
        if flags.is_excluded {
            return false;
        }
        if self.config.seeded_only && !flags.is_seeded {
            return false;
        }
        true
    }

    /// spec §4.4 `next_fetch_time`: bounded max of default and robots-specified delay.
    pub async fn next_fetch_time(&self, domain: &str, now: u64) -> u64 {
        now + self.crawl_delay(domain).await.as_secs()
    }

    pub async fn crawl_delay(&self, domain: &str) -> Duration {
        let robots = self.robots_for(domain).await;
        let mut delay = self.config.default_crawl_delay;
        if let Some(robots_delay) = robots.crawl_delay(&self.config.user_agent) {
            delay = delay.max(robots_delay);
        }
        delay.clamp(self.config.min_crawl_delay, self.config.max_crawl_delay)
    }

    /// Ensures the cached robots.txt for `domain` is fresh, fetching (with
    /// coalescing) if it has expired or was never fetched. Exposed
    /// separately from `is_url_allowed` so the fetcher pool's pseudocode
    /// step `politeness.ensure_robots_fresh(domain)` (spec §4.6) can be
    /// driven explicitly.
    pub async fn ensure_robots_fresh(&self, domain: &str) {
        let _ = self.robots_for(domain).await;
    }

    async fn robots_for(&self, domain: &str) -> Arc<RobotsTxt> {
        let now = unix_now();

        if let Some(entry) = self.cache.get(domain) {
            if entry.expires_at > now {
                return entry.robots.clone();
            }
        }

        let lock = self
            .fetch_locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let guard = match tokio::time::timeout(self.config.coalesce_wait, lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                // spec §5: coalescing wait timeout synthesizes "allow".
                tracing::warn!(domain, "robots.txt coalescing wait timed out; allowing");
                return Arc::new(RobotsTxt::default());
            }
        };

        // double-checked: another task may have refreshed it while we waited.
        if let Some(entry) = self.cache.get(domain) {
            if entry.expires_at > now {
                return entry.robots.clone();
            }
        }

        // The shared cache on `domain:<d>` (spec §3) survives restarts and
        // is visible to every process in the cluster, not just this one's
        // in-memory DashMap; check it before paying for a network fetch.
        // A datastore error here (unreachable Redis, deadline exceeded) is
        // treated the same as a cache miss — fall through and fetch fresh.
        match self
            .datastore
            .get_robots_cache(self.config.datastore_op_deadline, domain, now)
            .await
        {
            Ok(Some((body, expires_at))) => {
                let robots = Arc::new(RobotsTxt::parse(&body));
                self.cache.insert(
                    domain.to_string(),
                    CacheEntry {
                        robots: robots.clone(),
                        expires_at,
                    },
                );
                drop(guard);
                return robots;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(domain, error = %e, "robots cache read failed; fetching fresh"),
        }

        let (robots, ttl, body) = self.fetch_and_classify(domain).await;
        let expires_at = now + ttl.as_secs();
        if let Err(e) = self
            .datastore
            .set_robots_cache(self.config.datastore_op_deadline, domain, &body, expires_at)
            .await
        {
            tracing::warn!(domain, error = %e, "robots cache write failed");
        }

        let robots = Arc::new(robots);
        self.cache.insert(
            domain.to_string(),
            CacheEntry {
                robots: robots.clone(),
                expires_at,
            },
        );
        drop(guard);
        robots
    }

    /// Fetches `http(s)://<domain>/robots.txt` and classifies the outcome
    /// per spec §4.4's corrected failure semantics: network errors and
    /// 5xx/429 default to allow with a short negative TTL; 4xx (other than
    /// 429) means "no restrictions" with the normal TTL; success parses the
    /// body (the tolerant parser in `robotstxt` never fails outright, so
    /// "parse error" and "empty ruleset" collapse to the same normal-TTL
    /// allow-by-default case here). The raw body (empty for the
    /// allow-by-default outcomes) is returned alongside so the caller can
    /// persist exactly what was classified to the shared cache.
    async fn fetch_and_classify(&self, domain: &str) -> (RobotsTxt, Duration, String) {
        let url = match Url::parse(&format!("http://{domain}/robots.txt")) {
            Ok(u) => u,
            Err(_) => return (RobotsTxt::default(), self.config.robots_negative_ttl, String::new()),
        };

        let request = self
            .http
            .get(url)
            .timeout(self.config.robots_fetch_deadline)
            .build();
        let Ok(request) = request else {
            return (RobotsTxt::default(), self.config.robots_negative_ttl, String::new());
        };

        match self.http.execute(request).await {
            Err(_) => (RobotsTxt::default(), self.config.robots_negative_ttl, String::new()),
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    let robots = RobotsTxt::parse(&body);
                    (robots, self.config.robots_ttl, body)
                } else if status.as_u16() == 429 || status.is_server_error() {
                    (RobotsTxt::default(), self.config.robots_negative_ttl, String::new())
                } else {
                    (RobotsTxt::default(), self.config.robots_ttl, String::new())
                }
            }
        }
    }
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

    /// No real Redis is required for these tests: an unreachable address
    /// makes every datastore call fail fast, which `robots_for` treats the
    /// same as a cache miss and falls through to the (also unreachable, in
    /// these tests) network fetch.
    fn test_datastore() -> Arc<Datastore> {
        Arc::new(Datastore::connect("redis://127.0.0.1:1/0").expect("pool construction is lazy and infallible here"))
    }

    fn engine() -> PolitenessEngine {
        PolitenessEngine::new(
            PolitenessConfig {
                robots_fetch_deadline: Duration::from_millis(50),
                coalesce_wait: Duration::from_millis(200),
                datastore_op_deadline: Duration::from_millis(50),
                ..Default::default()
            },
            test_datastore(),
        )
    }

    #[tokio::test]
    async fn excluded_domain_is_always_denied() {
        let engine = engine();
        let url = Url::parse("http://example.invalid/page").unwrap();
        let allowed = engine
            .is_url_allowed(
                &url,
                "example.invalid",
                DomainFlags {
                    is_excluded: true,
                    is_seeded: true,
                },
            )
            .await;
        assert!(!allowed);
    }

    #[tokio::test]
    async fn seeded_only_denies_unseeded_domains() {
        let mut config = PolitenessConfig {
            robots_fetch_deadline: Duration::from_millis(50),
            datastore_op_deadline: Duration::from_millis(50),
            ..Default::default()
        };
        config.seeded_only = true;
        let engine = PolitenessEngine::new(config, test_datastore());
        let url = Url::parse("http://example.invalid/page").unwrap();
        let allowed = engine
            .is_url_allowed(
                &url,
                "example.invalid",
                DomainFlags {
                    is_excluded: false,
                    is_seeded: false,
                },
            )
            .await;
        assert!(!allowed);
    }

    #[tokio::test]
    async fn unreachable_robots_defaults_to_allow() {
        // "example.invalid" never resolves, so the robots.txt fetch fails
        // as a network error and the spec's fail-open default applies.
        let engine = engine();
        let url = Url::parse("http://example.invalid/page").unwrap();
        let allowed = engine
            .is_url_allowed(
                &url,
                "example.invalid",
                DomainFlags {
                    is_excluded: false,
                    is_seeded: false,
                },
            )
            .await;
        assert!(allowed);
    }

    #[tokio::test]
    async fn crawl_delay_is_bounded_by_configured_limits() {
        let engine = PolitenessEngine::new(
            PolitenessConfig {
                robots_fetch_deadline: Duration::from_millis(50),
                min_crawl_delay: Duration::from_secs(2),
                max_crawl_delay: Duration::from_secs(5),
                default_crawl_delay: Duration::from_millis(100),
                datastore_op_deadline: Duration::from_millis(50),
                ..Default::default()
            },
            test_datastore(),
        );
        let delay = engine.crawl_delay("example.invalid").await;
        assert!(delay >= Duration::from_secs(2));
        assert!(delay <= Duration::from_secs(5));
    }
}
