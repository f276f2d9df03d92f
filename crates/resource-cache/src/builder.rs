use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;

use crate::cache::{Options, ResourceCache};
use crate::clock::{Clock, SystemClock};
use crate::completion::CompletionSource;
use crate::config::{CacheConfig, ConfigError, to_clock_units};
use crate::expiry::{ExpiresSelector, Expiry};
use crate::fetch::{CopyFn, Extractor, Pipeline, Transform};

/// Builds a [`ResourceCache`] around a fetch of raw results `R`, caching values `T`.
///
/// By default the raw result is cached as-is, the clock is the [`SystemClock`], and
/// `buffer`, `prefetch` and `retry` are all disabled. An expiry has to be configured,
/// either as field via [`expires_field`](Self::expires_field) or
/// [`with_config`](Self::with_config), or as function via
/// [`expires_with`](Self::expires_with).
pub struct CacheBuilder<R, T> {
    name: String,
    source: Arc<dyn CompletionSource<R>>,
    clock: Arc<dyn Clock>,
    handle: Option<Handle>,
    buffer: Duration,
    prefetch: Duration,
    retry: Duration,
    expires: Option<Extractor<R>>,
    transform: Transform<R, T>,
    copy: CopyFn<T>,
}

impl<R> CacheBuilder<R, R>
where
    R: Clone + Send + Sync + 'static,
{
    /// Creates a builder for a cache around `source`.
    pub fn new(source: impl CompletionSource<R>) -> Self {
        Self {
            name: CacheConfig::default().name,
            source: Arc::new(source),
            clock: Arc::new(SystemClock),
            handle: None,
            buffer: Duration::ZERO,
            prefetch: Duration::ZERO,
            retry: Duration::ZERO,
            expires: None,
            transform: Arc::new(|raw: &R| Ok(raw.clone())),
            copy: Arc::new(|value: &R| Ok(value.clone())),
        }
    }
}

impl<R, T> CacheBuilder<R, T>
where
    R: Send + 'static,
    T: Send + Sync + 'static,
{
    /// Sets the name used in logs and metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the clock, which has to agree with the instants reported as expiry.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets the runtime that fetches and deliveries are spawned on.
    ///
    /// Defaults to the runtime [`build`](Self::build) is called from.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Sets the safety margin subtracted from each expiration.
    pub fn buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    /// Sets how long before expiration to refresh in the background.
    pub fn prefetch(mut self, prefetch: Duration) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets how long to wait after a failed background refresh before trying again.
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Derives the expiration of each raw result with `expires`.
    pub fn expires_with<F, E>(mut self, expires: F) -> Self
    where
        F: Fn(&R) -> anyhow::Result<E> + Send + Sync + 'static,
        E: Into<Expiry>,
    {
        self.expires = Some(Arc::new(move |raw: &R| expires(raw).map(Into::into)));
        self
    }

    /// Derives the cached value from each raw result with `transform`.
    ///
    /// This resets the copy function to [`Clone`], so call [`copy_with`](Self::copy_with)
    /// afterwards if needed.
    pub fn transform<U, F>(self, transform: F) -> CacheBuilder<R, U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&R) -> anyhow::Result<U> + Send + Sync + 'static,
    {
        CacheBuilder {
            name: self.name,
            source: self.source,
            clock: self.clock,
            handle: self.handle,
            buffer: self.buffer,
            prefetch: self.prefetch,
            retry: self.retry,
            expires: self.expires,
            transform: Arc::new(transform),
            copy: Arc::new(|value: &U| Ok(value.clone())),
        }
    }

    /// Produces the copy of the cached value handed to each caller with `copy`.
    pub fn copy_with<F>(mut self, copy: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.copy = Arc::new(copy);
        self
    }

    /// Validates the configuration and creates the cache.
    pub fn build(self) -> Result<ResourceCache<T>, ConfigError> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ConfigError::NoRuntime)?,
        };
        let expires = self.expires.ok_or(ConfigError::MissingExpiry)?;

        let options = Options {
            name: self.name.into(),
            clock: self.clock,
            refresh: Box::new(Pipeline {
                source: self.source,
                transform: self.transform,
                expires,
            }),
            copy: self.copy,
            buffer: to_clock_units("buffer", self.buffer)?,
            prefetch: to_clock_units("prefetch", self.prefetch)?,
            retry: to_clock_units("retry", self.retry)?,
            handle,
        };
        Ok(ResourceCache::new(options))
    }
}

impl<R, T> CacheBuilder<R, T>
where
    R: Serialize + Send + 'static,
    T: Send + Sync + 'static,
{
    /// Reads the expiration out of a field of each raw result.
    ///
    /// A selector starting with `/` is treated as JSON pointer.
    pub fn expires_field(self, selector: impl Into<String>) -> Self {
        self.expires_selector(ExpiresSelector::new(selector))
    }

    /// Reads the expiration out of each raw result using `selector`.
    pub fn expires_selector(mut self, selector: ExpiresSelector) -> Self {
        self.expires = Some(Arc::new(move |raw: &R| {
            let value = serde_json::to_value(raw)?;
            Ok(selector.extract(&value)?)
        }));
        self
    }

    /// Applies the name, durations and expiry selector of `config`.
    ///
    /// Without a selector in `config`, an expiry configured earlier is kept, falling back
    /// to the `expires` field.
    pub fn with_config(self, config: &CacheConfig) -> Self {
        let mut builder = self
            .name(config.name.clone())
            .buffer(config.buffer)
            .prefetch(config.prefetch)
            .retry(config.retry);

        match &config.expires {
            Some(selector) => builder = builder.expires_selector(selector.clone()),
            None if builder.expires.is_none() => {
                builder = builder.expires_selector(ExpiresSelector::default())
            }
            None => {}
        }
        builder
    }
}
