use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

type Slot<R> = Arc<Mutex<Option<oneshot::Sender<anyhow::Result<R>>>>>;

/// The continuation of a single fetch.
///
/// Each fetch gets a fresh `Completion`. Only the first call to [`complete`](Self::complete)
/// (or the first future registered via [`complete_with`](Self::complete_with) to resolve)
/// is honored, all later completions are ignored. Clones refer to the same fetch.
///
/// Dropping every clone without completing reports the fetch as
/// [`Abandoned`](crate::CacheError::Abandoned).
pub struct Completion<R> {
    slot: Slot<R>,
    handle: Handle,
}

impl<R> Clone for Completion<R> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            handle: self.handle.clone(),
        }
    }
}

impl<R> fmt::Debug for Completion<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<R: Send + 'static> Completion<R> {
    pub(crate) fn new(handle: Handle) -> (Self, oneshot::Receiver<anyhow::Result<R>>) {
        let (sender, receiver) = oneshot::channel();
        let completion = Self {
            slot: Arc::new(Mutex::new(Some(sender))),
            handle,
        };
        (completion, receiver)
    }

    /// Completes the fetch with `result`.
    ///
    /// Returns `false` if the fetch was already completed, in which case `result` is dropped.
    pub fn complete(&self, result: anyhow::Result<R>) -> bool {
        let sender = self.slot.lock().unwrap().take();
        match sender {
            Some(sender) => {
                // The receiver is only gone when the fetch was torn down, nobody is
                // interested in the result anymore in that case.
                let _ = sender.send(result);
                true
            }
            None => {
                tracing::warn!("Ignoring repeated completion of a fetch");
                false
            }
        }
    }

    /// Completes the fetch with the output of `future`, once it resolves.
    ///
    /// The future is spawned onto the runtime driving the cache.
    pub fn complete_with<F>(&self, future: F)
    where
        F: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let this = self.clone();
        self.handle.spawn(async move {
            let result = future.await;
            this.complete(result);
        });
    }
}

impl<R> Completion<R> {
    /// Whether the fetch was completed already.
    pub fn is_completed(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }
}

/// Something that can start a fetch and report its outcome to a [`Completion`].
///
/// This is implemented by [`CallbackStyle`], handing the [`Completion`] to a function, and
/// [`FutureStyle`], which registers the returned future as continuation. The cache only
/// depends on this capability, not on the style.
pub trait CompletionSource<R>: Send + Sync + 'static {
    /// Starts a single fetch that eventually reports to `completion`.
    fn start(&self, completion: Completion<R>);
}

/// A fetch that is handed its [`Completion`] and completes it once done.
///
/// ```
/// # use resource_cache::{CallbackStyle, Completion};
/// let source = CallbackStyle(|done: Completion<u64>| {
///     std::thread::spawn(move || done.complete(Ok(42)));
/// });
/// ```
#[derive(Clone, Copy, Debug)]
pub struct CallbackStyle<F>(pub F);

impl<R, F> CompletionSource<R> for CallbackStyle<F>
where
    R: Send + 'static,
    F: Fn(Completion<R>) + Send + Sync + 'static,
{
    fn start(&self, completion: Completion<R>) {
        (self.0)(completion)
    }
}

/// A fetch that returns a future resolving to its result.
///
/// ```
/// # use resource_cache::FutureStyle;
/// let source = FutureStyle(|| async { anyhow::Ok(42u64) });
/// ```
#[derive(Clone, Copy, Debug)]
pub struct FutureStyle<F>(pub F);

impl<R, F, Fut> CompletionSource<R> for FutureStyle<F>
where
    R: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn start(&self, completion: Completion<R>) {
        completion.complete_with((self.0)())
    }
}
