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

//! The crawler engine: frontier manager, fetcher/parser worker pools,
//! orchestrator and resharder (spec §4.5-§4.9).

pub mod content_store;
pub mod fetch;
pub mod frontier;
pub mod http;
pub mod metrics;
pub mod orchestrator;
pub mod parse;
pub mod reshard;

pub use frontier_store::shard_for_domain;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Datastore(#[from] datastore::Error),
    #[error(transparent)]
    FrontierStore(#[from] frontier_store::Error),
    #[error(transparent)]
    Common(#[from] common::Error),
    #[error("content store io error: {0}")]
    ContentIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One outbound link discovered while parsing a page, not yet normalized.
#[derive(Debug, Clone)]
pub struct RawLink {
    pub href: String,
    pub depth: u32,
}

/// A normalized link ready to pass to [`frontier::FrontierManager::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueLink {
    pub url: url::Url,
    pub depth: u32,
}
