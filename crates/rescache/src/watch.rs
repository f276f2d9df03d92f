use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future;
use reqwest::{Client, Url};
use resource_cache::{CacheBuilder, CacheConfig, CompletionSource, FutureStyle, ResourceCache};
use serde_json::Value;
use tokio::time::MissedTickBehavior;

/// How to poll the cache.
#[derive(Clone, Copy, Debug)]
pub struct Watch {
    /// The number of simultaneous requests in each round.
    pub concurrency: usize,
    /// The time between rounds.
    pub interval: Duration,
    /// The number of rounds, or `None` to run forever.
    pub rounds: Option<u64>,
}

/// Fetches `url` and parses the response as JSON.
async fn fetch_json(client: Client, url: Url) -> Result<Value> {
    tracing::debug!(%url, "Fetching resource");

    let response = client
        .get(url)
        .send()
        .await
        .context("failed to send request")?
        .error_for_status()
        .context("resource responded with an error")?;

    response
        .json()
        .await
        .context("resource is not valid JSON")
}

/// A source fetching `url` over HTTP.
fn http_source(url: Url) -> Result<impl CompletionSource<Value>> {
    let client = Client::builder()
        .user_agent(concat!("rescache/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to create HTTP client")?;

    Ok(FutureStyle(move || fetch_json(client.clone(), url.clone())))
}

/// Builds the cache around `source`, caching the part selected by the `select` pointer.
fn build_cache(
    source: impl CompletionSource<Value>,
    config: &CacheConfig,
    select: Option<String>,
) -> Result<ResourceCache<Value>> {
    let builder = CacheBuilder::new(source).with_config(config);

    let cache = match select {
        Some(pointer) => builder
            .transform(move |raw: &Value| {
                raw.pointer(&pointer)
                    .cloned()
                    .with_context(|| format!("`{pointer}` does not select anything"))
            })
            .build()?,
        None => builder.build()?,
    };

    Ok(cache)
}

/// Polls `cache` in rounds, printing every delivered value.
async fn poll(cache: &ResourceCache<Value>, watch: Watch, out: &mut impl Write) -> Result<()> {
    anyhow::ensure!(watch.concurrency > 0, "concurrency must be at least 1");
    anyhow::ensure!(!watch.interval.is_zero(), "interval must not be zero");

    let mut interval = tokio::time::interval(watch.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut round = 0;
    while watch.rounds.is_none_or(|rounds| round < rounds) {
        interval.tick().await;
        round += 1;

        let requests = (0..watch.concurrency).map(|_| cache.get());
        let results = future::join_all(requests).await;
        tracing::debug!(cache = cache.name(), round, "Round completed");

        for (caller, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => writeln!(out, "[round {round}] #{caller}: {value}")?,
                Err(err) => writeln!(out, "[round {round}] #{caller}: error: {err}")?,
            }
        }
    }

    Ok(())
}

/// Watches the JSON resource at `url`.
pub async fn run(config: &CacheConfig, url: Url, select: Option<String>, watch: Watch) -> Result<()> {
    tracing::info!(%url, cache = %config.name, "Watching resource");

    let cache = build_cache(http_source(url)?, config, select)?;
    poll(&cache, watch, &mut io::stdout().lock()).await
}
