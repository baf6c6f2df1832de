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

//! `farcrawld`: the binary entrypoint (spec §6/§9). One binary plays both
//! coordinator and fetcher-process roles depending on the subcommand and
//! `--shard`/`--shards` flags, matching the teacher's single-binary,
//! multi-subcommand `main.rs`.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use common::config::CrawlerConfig;
use crawler::{
    content_store::ContentStore,
    frontier::FrontierManager,
    http::HttpFetcher,
    metrics::Metrics,
    orchestrator::{Orchestrator, OrchestratorConfig},
    reshard::Resharder,
};
use datastore::{bloom_ops::RemoteDedupBloom, Datastore};
use politeness::{PolitenessConfig, PolitenessEngine};
use tokio_util::sync::CancellationToken;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 64;
const EXIT_DATASTORE_FAILURE: u8 = 70;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "farcrawld", about = "Polite, high-throughput web crawler")]
struct Cli {
    #[arg(long, default_value = "farcrawl.toml")]
    config: PathBuf,

    /// Restricts this process to a single shard; omit to run every shard
    /// named by `shards` in-process (single-machine deployments).
    #[arg(long)]
    shard: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a seed file and start crawling.
    Start {
        #[arg(long)]
        seeds: PathBuf,
    },
    /// Resume crawling from durably recorded seeds, without a seed file.
    Resume,
    /// Rebalance domains across a new shard count.
    Reshard {
        #[arg(long = "to")]
        to: u32,
    },
    /// Signal a running process to shut down gracefully.
    Stop,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match CrawlerConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    common::logging::init(&config.log_filter);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(EXIT_DATASTORE_FAILURE);
        }
    };

    match runtime.block_on(run(cli, config)) {
        Ok(true) => ExitCode::from(EXIT_OK),
        Ok(false) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::from(EXIT_DATASTORE_FAILURE)
        }
    }
}

/// Returns `Ok(true)` for a normal exit and `Ok(false)` for one triggered by
/// an interrupt signal, so `main` can tell exit codes 0 and 130 apart.
async fn run(cli: Cli, config: CrawlerConfig) -> anyhow::Result<bool> {
    let datastore = Arc::new(Datastore::connect(&config.redis_url).context("connecting to datastore")?);

    let op_deadline = Duration::from_secs(5);

    match cli.command {
        Commands::Stop => {
            // This invocation has no in-process handle to a running
            // orchestrator's CancellationToken, so it signals over the
            // datastore instead: the running process's stop-condition loop
            // polls this flag on the same cadence as its other stop checks.
            datastore
                .request_shutdown(op_deadline)
                .await
                .context("requesting shutdown")?;
            tracing::info!("shutdown requested; a running process will stop within its poll interval");
            Ok(true)
        }
        Commands::Reshard { to } => {
            let resharder = Resharder::new(datastore, &config.frontier_root, config.shards, op_deadline);
            let report = resharder.reshard_to(to).await.context("resharding")?;
            tracing::info!(
                scanned = report.domains_scanned,
                moved = report.domains_moved,
                reconciled = report.domains_reconciled,
                "reshard complete"
            );
            Ok(true)
        }
        Commands::Start { ref seeds } => {
            let orchestrator = build_orchestrator(&cli, &config, datastore).await?;
            orchestrator.load_seed_file(&seeds).await.context("loading seed file")?;
            run_until_shutdown(orchestrator).await
        }
        Commands::Resume => {
            let orchestrator = build_orchestrator(&cli, &config, datastore).await?;
            orchestrator.resume_seeds().await.context("resuming seeds")?;
            run_until_shutdown(orchestrator).await
        }
    }
}

async fn build_orchestrator(cli: &Cli, config: &CrawlerConfig, datastore: Arc<Datastore>) -> anyhow::Result<Arc<Orchestrator>> {
    let op_deadline = Duration::from_secs(5);

    let politeness = Arc::new(PolitenessEngine::new(
        PolitenessConfig {
            user_agent: config.user_agent.clone(),
            robots_fetch_deadline: Duration::from_secs(config.robots_fetch_deadline_seconds),
            robots_ttl: Duration::from_secs(config.robots_ttl_seconds),
            robots_negative_ttl: Duration::from_secs(config.robots_negative_ttl_seconds),
            min_crawl_delay: Duration::from_secs(config.min_crawl_delay_seconds),
            max_crawl_delay: Duration::from_secs(config.max_crawl_delay_seconds),
            default_crawl_delay: Duration::from_secs(config.default_crawl_delay_seconds),
            seeded_only: config.seeded_only,
            coalesce_wait: Duration::from_secs(15),
            datastore_op_deadline: op_deadline,
        },
        datastore.clone(),
    ));

    let bloom = RemoteDedupBloom::new(config.bloom_capacity, config.bloom_fpr);
    let frontier = Arc::new(FrontierManager::new(
        datastore.clone(),
        &config.frontier_root,
        bloom,
        politeness.clone(),
        config.shards,
        config.max_url_len,
        config.max_depth,
        op_deadline,
        Duration::from_secs(config.frontier_fsync_interval_seconds),
    ));

    let http = Arc::new(HttpFetcher::new(&config.user_agent).context("building http client")?);
    let content_store = Arc::new(ContentStore::new(&config.content_root, config.save_extracted_text_only));
    let metrics = Arc::new(Metrics::default());

    let owned_shards = match cli.shard {
        Some(s) => vec![s],
        None => (0..config.shards).collect(),
    };

    let orchestrator_config = OrchestratorConfig {
        shards: config.shards,
        owned_shards,
        fetcher_tasks_per_shard: config.fetcher_tasks_per_shard.min(config.max_fetcher_tasks),
        parser_workers: config.parser_workers_per_shard,
        parser_queue_items: config.parser_queue_items,
        fetch_deadline: Duration::from_secs(config.fetch_deadline_seconds),
        op_deadline,
        fetcher_shutdown_grace: Duration::from_secs(config.fetcher_shutdown_grace_seconds),
        metrics_interval: Duration::from_secs(config.metrics_interval_seconds),
        stale_claim_interval: Duration::from_secs(config.stale_claim_interval_seconds),
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
        heartbeat_dead_after: Duration::from_secs(config.heartbeat_dead_after_seconds),
        stop_max_pages: config.stop_max_pages,
        stop_max_duration: if config.stop_max_duration_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(config.stop_max_duration_seconds))
        },
        shutdown_idle_grace: Duration::from_secs(config.shutdown_idle_grace_seconds),
    };

    Ok(Arc::new(Orchestrator::new(
        datastore,
        frontier,
        politeness,
        http,
        content_store,
        metrics,
        orchestrator_config,
    )))
}

async fn run_until_shutdown(orchestrator: Arc<Orchestrator>) -> anyhow::Result<bool> {
    let cancel = CancellationToken::new();
    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let signal_cancel = cancel.clone();
    let signal_interrupted = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt; beginning graceful shutdown");
            signal_interrupted.store(true, std::sync::atomic::Ordering::SeqCst);
            signal_cancel.cancel();
        }
    });

    orchestrator.run(cancel).await.context("orchestrator run loop")?;
    Ok(!interrupted.load(std::sync::atomic::Ordering::SeqCst))
}
