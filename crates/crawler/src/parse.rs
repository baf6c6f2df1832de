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

//! The parser worker pool (spec §4.7): decode, extract links/text, batch
//! links into `frontier.enqueue`, store content, record the visited entry.

use std::sync::Arc;

use datastore::{visited::VisitedRecord, Datastore};
use scraper::{Html, Selector};
use url::Url;

use crate::{
    content_store::ContentStore, frontier::FrontierManager, http::decode_body, metrics::Metrics, RawLink,
};

/// Links are batched to this cap before being handed to
/// `FrontierManager::enqueue` (spec §4.7 step 5).
pub const LINK_BATCH_CAP: usize = 1000;

pub struct ParseJob {
    pub url: Url,
    pub depth: u32,
    pub domain: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: u64,
}

pub struct ParsedPage {
    pub text: String,
    pub links: Vec<RawLink>,
}

/// Decodes and extracts text/links from an HTML body (spec §4.7 steps 2-4).
pub fn parse_html(body: &[u8], content_type: Option<&str>, base: &Url, max_depth_of_children: u32) -> ParsedPage {
    let decoded = decode_body(body, content_type);
    let document = Html::parse_document(&decoded);

    let text_selector = Selector::parse("body").unwrap();
    let text = document
        .select(&text_selector)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();

    let link_selector = Selector::parse("a[href]").unwrap();
    let links = document
        .select(&link_selector)
        .filter_map(|el| el.value().attr("href"))
        .take(LINK_BATCH_CAP)
        .map(|href| RawLink {
            href: href.to_string(),
            depth: max_depth_of_children,
        })
        .collect();

    ParsedPage { text, links }
}

pub struct ParserWorkerPool {
    frontier: Arc<FrontierManager>,
    content_store: Arc<ContentStore>,
    datastore: Arc<Datastore>,
    metrics: Arc<Metrics>,
    op_deadline: std::time::Duration,
}

impl ParserWorkerPool {
    pub fn new(
        frontier: Arc<FrontierManager>,
        content_store: Arc<ContentStore>,
        datastore: Arc<Datastore>,
        metrics: Arc<Metrics>,
        op_deadline: std::time::Duration,
    ) -> Self {
        Self {
            frontier,
            content_store,
            datastore,
            metrics,
            op_deadline,
        }
    }

    /// Spawns `workers` cooperative tasks sharing `rx` (spec §4.7
    /// concurrency: "P parser workers per process... share the parse
    /// queue"). `tokio::sync::mpsc::Receiver` has a single owner, so the
    /// workers take turns behind a mutex rather than each holding their own
    /// clone; contention is negligible since each `recv` hands a worker
    /// enough CPU-bound work to keep it busy well past the lock's hold time.
    pub fn spawn(
        self: Arc<Self>,
        workers: usize,
        rx: tokio::sync::mpsc::Receiver<ParseJob>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        (0..workers.max(1))
            .map(|_| {
                let pool = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move { pool.run(rx).await })
            })
            .collect()
    }

    async fn run(&self, rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<ParseJob>>>) {
        loop {
            let job = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            match job {
                Some(job) => self.process(job).await,
                None => return,
            }
        }
    }

    async fn process(&self, job: ParseJob) {
        let parsed = parse_html(&job.body, job.content_type.as_deref(), &job.url, job.depth + 1);

        let content_path = match self.content_store.store(&parsed.text).await {
            Ok(hash) => Some(self.content_store.path_for_hash(&hash).display().to_string()),
            Err(e) => {
                tracing::warn!(url = %job.url, error = %e, "content write failed after retry");
                None
            }
        };

        if !parsed.links.is_empty() {
            match self.frontier.enqueue(&parsed.links, &job.domain, Some(&job.url)).await {
                Ok(n) => self.metrics.record_enqueued(n as u64),
                Err(e) => tracing::warn!(url = %job.url, error = %e, "link enqueue failed"),
            }
        }

        let record = VisitedRecord {
            url: job.url.to_string(),
            status_code: Some(job.status),
            content_path,
            error: None,
            fetched_at: job.fetched_at,
        };
        if let Err(e) = self
            .datastore
            .record_visited(self.op_deadline, &common::url::hash16(&job.url), &record)
            .await
        {
            tracing::warn!(url = %job.url, error = %e, "failed to record visited entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_links_and_text() {
        let base = Url::parse("http://example.com/page").unwrap();
        let html = b"<html><body>hello <a href=\"/a\">A</a> <a href=\"http://other.example/b\">B</a></body></html>";
        let parsed = parse_html(html, Some("text/html; charset=utf-8"), &base, 1);
        assert!(parsed.text.contains("hello"));
        assert_eq!(parsed.links.len(), 2);
        assert_eq!(parsed.links[0].href, "/a");
        assert!(parsed.links.iter().all(|l| l.depth == 1));
    }

    #[test]
    fn caps_links_per_page() {
        let base = Url::parse("http://example.com/page").unwrap();
        let mut html = String::from("<html><body>");
        for i in 0..(LINK_BATCH_CAP + 50) {
            html.push_str(&format!("<a href=\"/p{i}\">x</a>"));
        }
        html.push_str("</body></html>");
        let parsed = parse_html(html.as_bytes(), None, &base, 0);
        assert_eq!(parsed.links.len(), LINK_BATCH_CAP);
    }
}
