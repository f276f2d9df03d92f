//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::Url;
use resource_cache::{CacheConfig, ExpiresSelector, metrics};

use crate::config::Config;
use crate::logging;
use crate::watch::{self, Watch};

/// Watches expiring resources through a single-flight cache.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// `rescache` commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Repeatedly requests a JSON resource over HTTP through the cache.
    ///
    /// Each round issues `--concurrency` simultaneous requests, which are answered by at most
    /// one upstream fetch. The resource has to report its own expiration, in milliseconds
    /// since the Unix epoch or as RFC 3339 / RFC 2822 date.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// The URL of the JSON resource.
    url: Url,

    /// The field holding the expiration, or a JSON pointer if it starts with `/`.
    ///
    /// Defaults to the `expires` field.
    #[arg(long)]
    expires: Option<String>,

    /// A JSON pointer selecting the part of the resource to cache and print.
    #[arg(long, value_name = "POINTER")]
    select: Option<String>,

    /// Safety margin subtracted from the expiration, e.g. `500ms`.
    #[arg(long)]
    buffer: Option<humantime::Duration>,

    /// How long before the expiration to refresh in the background, e.g. `30s`.
    #[arg(long)]
    prefetch: Option<humantime::Duration>,

    /// How long to back off after a failed background refresh, e.g. `5s`.
    #[arg(long)]
    retry: Option<humantime::Duration>,

    /// The number of simultaneous requests in each round.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// The time between rounds.
    #[arg(long, default_value = "1s")]
    interval: humantime::Duration,

    /// Stop after this many rounds instead of running forever.
    #[arg(long)]
    rounds: Option<u64>,
}

impl WatchArgs {
    /// Applies the flags on top of the cache configuration from the config file.
    fn apply(&self, config: &mut CacheConfig) {
        if let Some(ref expires) = self.expires {
            config.expires = Some(ExpiresSelector::new(expires.as_str()));
        }
        if let Some(buffer) = self.buffer {
            config.buffer = buffer.into();
        }
        if let Some(prefetch) = self.prefetch {
            config.prefetch = prefetch.into();
        }
        if let Some(retry) = self.retry {
            config.retry = retry.into();
        }
    }

    fn watch(&self) -> Watch {
        Watch {
            concurrency: self.concurrency,
            interval: self.interval.into(),
            rounds: self.rounds,
        }
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;

    logging::init_logging(&config);

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("rescache")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    match cli.command {
        Command::Watch(args) => {
            args.apply(&mut config.cache);
            let watch = args.watch();
            runtime
                .block_on(watch::run(&config.cache, args.url, args.select, watch))
                .context("failed to watch the resource")?
        }
    }

    Ok(())
}
