use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::builder::CacheBuilder;
use crate::clock::Clock;
use crate::completion::CompletionSource;
use crate::error::CacheError;
use crate::fetch::{CopyFn, Refresh, Refreshed};


type Waiter<T> = Box<dyn FnOnce(Result<T, CacheError>) + Send>;

/// Whether callers are blocked on a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FetchKind {
    /// The cached value is stale, callers are waiting for this fetch.
    Foreground,
    /// The cached value is still fresh and being served while this fetch runs.
    Background,
}

impl FetchKind {
    fn as_str(self) -> &'static str {
        match self {
            FetchKind::Foreground => "foreground",
            FetchKind::Background => "background",
        }
    }
}

/// Everything a [`ResourceCache`] is configured with.
pub(crate) struct Options<T> {
    pub name: Arc<str>,
    pub clock: Arc<dyn Clock>,
    pub refresh: Box<dyn Refresh<T>>,
    pub copy: CopyFn<T>,
    /// All durations are in clock units.
    pub buffer: i64,
    pub prefetch: i64,
    pub retry: i64,
    pub handle: Handle,
}

/// The mutable state of a [`ResourceCache`], only ever touched under its lock.
struct State<T> {
    value: Option<Arc<T>>,
    /// The buffered expiration of `value`, `i64::MIN` while there is none.
    expires_at: i64,
    /// When to start a background refresh, unset until the first successful fetch.
    next_prefetch_at: Option<i64>,
    in_flight: bool,
    waiters: Vec<Waiter<T>>,
}

impl<T> State<T> {
    fn new() -> Self {
        Self {
            value: None,
            expires_at: i64::MIN,
            next_prefetch_at: None,
            in_flight: false,
            waiters: Vec::new(),
        }
    }

    /// Returns the cached value if it is still fresh at `now`.
    fn fresh_value(&self, now: i64) -> Option<Arc<T>> {
        if now < self.expires_at {
            self.value.clone()
        } else {
            None
        }
    }

    /// Marks a fetch as in flight, returning `false` if there already is one.
    fn begin_fetch(&mut self) -> bool {
        !mem::replace(&mut self.in_flight, true)
    }
}

struct Inner<T> {
    options: Options<T>,
    state: Mutex<State<T>>,
}

/// A cache for a single resource that expires.
///
/// All clones share the same cached value and fetch slot. See the [crate docs](crate) for
/// how values are refreshed.
pub struct ResourceCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ResourceCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ResourceCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ResourceCache");
        debug.field("name", &self.inner.options.name);
        if let Ok(state) = self.inner.state.try_lock() {
            debug
                .field("cached", &state.value.is_some())
                .field("expires_at", &state.expires_at)
                .field("next_prefetch_at", &state.next_prefetch_at)
                .field("in_flight", &state.in_flight)
                .field("waiters", &state.waiters.len());
        }
        debug.finish_non_exhaustive()
    }
}

impl<T> ResourceCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts building a cache around `source`, caching its results as-is.
    pub fn builder(source: impl CompletionSource<T>) -> CacheBuilder<T, T> {
        CacheBuilder::new(source)
    }
}

impl<T> ResourceCache<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(options: Options<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// The name of this cache, as used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    /// Requests the resource, invoking `callback` with the result.
    ///
    /// The callback is invoked exactly once, and never from within this call, even if the
    /// value is already cached. It is spawned onto the cache's runtime instead.
    pub fn request<F>(&self, callback: F)
    where
        F: FnOnce(Result<T, CacheError>) + Send + 'static,
    {
        self.inner.request(Box::new(callback));
    }

    /// Returns the resource, waiting for a fetch if the cached value is stale.
    pub async fn get(&self) -> Result<T, CacheError> {
        let (sender, receiver) = oneshot::channel();
        self.request(move |result| {
            // The receiver is gone when the caller stopped waiting.
            let _ = sender.send(result);
        });
        receiver.await.unwrap_or(Err(CacheError::Canceled))
    }
}

impl<T> Inner<T>
where
    T: Send + Sync + 'static,
{
    fn request(self: &Arc<Self>, waiter: Waiter<T>) {
        let name = &*self.options.name;
        metric!(counter("resource.access") += 1, "cache" => name);

        let now = self.options.clock.now();
        let mut state = self.state.lock().unwrap();

        if let Some(value) = state.fresh_value(now) {
            let prefetch =
                state.next_prefetch_at.is_some_and(|at| now >= at) && state.begin_fetch();
            drop(state);

            metric!(counter("resource.hit") += 1, "cache" => name);
            tracing::trace!(cache = name, now, "Serving cached value");
            self.deliver(vec![waiter], Ok(value));

            if prefetch {
                self.fetch(FetchKind::Background);
            }
        } else {
            state.waiters.push(waiter);
            let waiting = state.waiters.len();
            let start = state.begin_fetch();
            drop(state);

            metric!(counter("resource.miss") += 1, "cache" => name);
            tracing::trace!(cache = name, now, waiting, "Waiting for a fresh value");

            if start {
                self.fetch(FetchKind::Foreground);
            }
        }
    }

    /// Starts a fetch. The in-flight flag has to be set already.
    fn fetch(self: &Arc<Self>, kind: FetchKind) {
        let name = &*self.options.name;
        metric!(counter("resource.fetch") += 1, "cache" => name, "kind" => kind.as_str());
        tracing::debug!(cache = name, kind = kind.as_str(), "Starting fetch");

        // Created before starting the fetch, so that even a panicking fetch releases the
        // in-flight flag.
        let guard = FetchGuard {
            inner: Some(Arc::clone(self)),
            kind,
        };
        let fetch: BoxFuture<'static, _> = self.options.refresh.start(&self.options.handle);

        let started = Instant::now();
        self.options.handle.spawn(async move {
            let outcome = fetch.await;
            guard.finish(outcome, started);
        });
    }

    /// Applies the outcome of a fetch and flushes the waiters.
    fn complete(&self, kind: FetchKind, outcome: Result<Refreshed<T>, CacheError>) {
        let name = &*self.options.name;
        let now = self.options.clock.now();
        let mut state = self.state.lock().unwrap();
        state.in_flight = false;

        match outcome {
            Ok(Refreshed { value, expires_at }) => {
                let value = Arc::new(value);
                let expires_at = expires_at.saturating_sub(self.options.buffer);
                let next_prefetch_at = expires_at.saturating_sub(self.options.prefetch);

                state.value = Some(Arc::clone(&value));
                state.expires_at = expires_at;
                state.next_prefetch_at = Some(next_prefetch_at);
                let waiters = mem::take(&mut state.waiters);
                drop(state);

                tracing::debug!(
                    cache = name,
                    kind = kind.as_str(),
                    expires_at,
                    next_prefetch_at,
                    waiters = waiters.len(),
                    "Fetch completed"
                );
                self.deliver(waiters, Ok(value));
            }
            Err(error) => {
                metric!(counter("resource.fetch.error") += 1, "cache" => name, "kind" => kind.as_str());

                if let Some(value) = state.fresh_value(now) {
                    if let Some(at) = state.next_prefetch_at.as_mut() {
                        *at = at.saturating_add(self.options.retry);
                    }
                    let next_prefetch_at = state.next_prefetch_at;
                    // Callers only queue up while the value is fresh if the clock went back.
                    let waiters = mem::take(&mut state.waiters);
                    drop(state);

                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        cache = name,
                        kind = kind.as_str(),
                        next_prefetch_at,
                        "Refresh failed, keeping the cached value"
                    );
                    self.deliver(waiters, Ok(value));
                } else {
                    let waiters = mem::take(&mut state.waiters);
                    drop(state);

                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        cache = name,
                        kind = kind.as_str(),
                        waiters = waiters.len(),
                        "Fetch failed"
                    );
                    self.deliver(waiters, Err(error));
                }
            }
        }
    }

    /// Hands a copy of `result` to each waiter, in order, on a separate task.
    fn deliver(&self, waiters: Vec<Waiter<T>>, result: Result<Arc<T>, CacheError>) {
        if waiters.is_empty() {
            return;
        }

        let name = Arc::clone(&self.options.name);
        let copy = Arc::clone(&self.options.copy);
        self.options.handle.spawn(async move {
            for waiter in waiters {
                let result = match &result {
                    Ok(value) => copy_value(&name, &copy, value),
                    Err(err) => Err(err.clone()),
                };

                // A panicking callback must not keep the rest of the batch from being called.
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| waiter(result))) {
                    tracing::error!(
                        cache = &*name,
                        panic = panic_message(&*panic),
                        "Callback panicked"
                    );
                }
            }
        });
    }
}

/// Produces one caller's copy of `value`, turning a panicking `copy` into an error.
fn copy_value<T>(name: &str, copy: &CopyFn<T>, value: &T) -> Result<T, CacheError> {
    panic::catch_unwind(AssertUnwindSafe(|| copy(value)))
        .unwrap_or_else(|panic| Err(anyhow!("copy panicked: {}", panic_message(&*panic))))
        .map_err(|err| {
            metric!(counter("resource.copy.error") += 1, "cache" => name);
            tracing::warn!(cache = name, "Failed to copy cached value: {err:#}");
            CacheError::copy(err)
        })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Completes a fetch as [`Abandoned`](CacheError::Abandoned) unless it finished normally.
struct FetchGuard<T: Send + Sync + 'static> {
    inner: Option<Arc<Inner<T>>>,
    kind: FetchKind,
}

impl<T: Send + Sync + 'static> FetchGuard<T> {
    fn finish(mut self, outcome: Result<Refreshed<T>, CacheError>, started: Instant) {
        if let Some(inner) = self.inner.take() {
            metric!(
                timer("resource.fetch.duration") = started.elapsed(),
                "cache" => &*inner.options.name,
                "kind" => self.kind.as_str(),
            );
            inner.complete(self.kind, outcome);
        }
    }
}

impl<T: Send + Sync + 'static> Drop for FetchGuard<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tracing::error!(
                cache = &*inner.options.name,
                kind = self.kind.as_str(),
                "Fetch was dropped before completing"
            );
            inner.complete(self.kind, Err(CacheError::Abandoned));
        }
    }
}
