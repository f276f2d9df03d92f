//! A single-flight cache for one expiring resource.
//!
//! The [`ResourceCache`] wraps an asynchronous producer of a value that carries its own
//! expiration, such as an access token, a JWKS document or a signed URL. It hands out the
//! cached value while it is fresh, and coalesces all callers into exactly one upstream fetch
//! once it went stale.
//!
//! ## Refreshing
//!
//! There are two kinds of refreshes, which share a single fetch slot:
//!
//! - A *foreground* refresh happens when the cached value is stale (or there is none yet).
//!   Callers are queued and all of them are answered by that one fetch, in the order they
//!   arrived.
//! - A *background* refresh happens when the value is still fresh, but within `prefetch` of
//!   its expiration. The caller is served the cached value right away, and the refreshed
//!   value is picked up by later callers. A failing background refresh is not surfaced to
//!   anyone. Instead, the next attempt is postponed by `retry`.
//!
//! A failing foreground refresh is delivered to every queued caller. The stale value is
//! *not* served as a fallback in that case.
//!
//! ## Timeouts
//!
//! The cache does not time out fetches. A fetch that never completes blocks all callers
//! that arrive while the value is stale. Wrap the fetch in [`tokio::time::timeout`] if the
//! upstream might hang.
//!
//! ## Metrics
//!
//! When a statsd client was configured via [`metrics::configure_statsd`], the following
//! metrics are emitted, each tagged with the `cache` name:
//!
//! - `resource.access`: All accesses.
//! - `resource.hit`: Accesses served from the cached value.
//! - `resource.miss`: Accesses that had to wait for a fetch.
//! - `resource.fetch`: Fetches started, tagged with `kind` (`foreground` or `background`).
//! - `resource.fetch.error`: Fetches that failed, including post-processing failures.
//! - `resource.fetch.duration`: A timer for each completed fetch.
//! - `resource.copy.error`: Failures to copy a value for a caller.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod builder;
mod cache;
mod clock;
mod completion;
mod config;
mod error;
mod expiry;
mod fetch;

#[cfg(test)]
mod test;

pub use builder::CacheBuilder;
pub use cache::ResourceCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{CallbackStyle, Completion, CompletionSource, FutureStyle};
pub use config::{CacheConfig, ConfigError};
pub use error::CacheError;
pub use expiry::{ExpiresSelector, Expiry, ExpiryError};
