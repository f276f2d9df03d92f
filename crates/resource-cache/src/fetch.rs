use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::completion::{Completion, CompletionSource};
use crate::error::CacheError;
use crate::expiry::Expiry;

pub(crate) type Transform<R, T> = Arc<dyn Fn(&R) -> anyhow::Result<T> + Send + Sync>;
pub(crate) type Extractor<R> = Arc<dyn Fn(&R) -> anyhow::Result<Expiry> + Send + Sync>;
pub(crate) type CopyFn<T> = Arc<dyn Fn(&T) -> anyhow::Result<T> + Send + Sync>;

/// The outcome of a successful fetch, after post-processing.
#[derive(Debug)]
pub(crate) struct Refreshed<T> {
    pub value: T,
    /// The expiration as reported by the resource, before applying the `buffer`.
    pub expires_at: i64,
}

/// A type-erased fetch, including transformation and expiry extraction.
pub(crate) trait Refresh<T>: Send + Sync {
    /// Starts a fetch right away, and returns a future resolving once it is done.
    fn start(&self, handle: &Handle) -> BoxFuture<'static, Result<Refreshed<T>, CacheError>>;
}

pub(crate) struct Pipeline<R, T> {
    pub source: Arc<dyn CompletionSource<R>>,
    pub transform: Transform<R, T>,
    pub expires: Extractor<R>,
}

impl<R, T> Refresh<T> for Pipeline<R, T>
where
    R: Send + 'static,
    T: Send + 'static,
{
    fn start(&self, handle: &Handle) -> BoxFuture<'static, Result<Refreshed<T>, CacheError>> {
        let (completion, receiver) = Completion::new(handle.clone());
        self.source.start(completion);

        let transform = Arc::clone(&self.transform);
        let expires = Arc::clone(&self.expires);
        Box::pin(async move {
            let raw = receiver
                .await
                .map_err(|_| CacheError::Abandoned)?
                .map_err(CacheError::fetch)?;

            let expires_at = expires(&raw)
                .and_then(|expiry| Ok(expiry.to_millis()?))
                .map_err(CacheError::expiry)?;
            let value = transform(&raw).map_err(CacheError::transform)?;

            Ok(Refreshed { value, expires_at })
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use crate::completion::{CallbackStyle, FutureStyle};

    use super::*;

    fn pipeline<S: CompletionSource<(u32, i64)>>(source: S) -> Pipeline<(u32, i64), String> {
        Pipeline {
            source: Arc::new(source),
            transform: Arc::new(|(value, _)| Ok(value.to_string())),
            expires: Arc::new(|(_, expires)| Ok(Expiry::Instant(*expires))),
        }
    }

    #[tokio::test]
    async fn test_pipeline_success() {
        let pipeline = pipeline(FutureStyle(|| async { Ok((7, 1000)) }));

        let refreshed = pipeline.start(&Handle::current()).await.unwrap();
        assert_eq!(refreshed.value, "7");
        assert_eq!(refreshed.expires_at, 1000);
    }

    #[tokio::test]
    async fn test_pipeline_failures() {
        let failing = pipeline(FutureStyle(|| async { Err(anyhow!("boom")) }));
        let result = failing.start(&Handle::current()).await;
        assert!(matches!(result, Err(CacheError::Fetch(_))));

        let abandoned = pipeline(CallbackStyle(|done: Completion<(u32, i64)>| drop(done)));
        let result = abandoned.start(&Handle::current()).await;
        assert!(matches!(result, Err(CacheError::Abandoned)));

        let mut bad_transform = pipeline(FutureStyle(|| async { Ok((7, 1000)) }));
        bad_transform.transform = Arc::new(|_| Err(anyhow!("not a token")));
        let result = bad_transform.start(&Handle::current()).await;
        assert!(matches!(result, Err(CacheError::Transform(_))));

        let mut bad_expiry = pipeline(FutureStyle(|| async { Ok((7, 1000)) }));
        bad_expiry.expires = Arc::new(|_| Ok(Expiry::from("someday")));
        let result = bad_expiry.start(&Handle::current()).await;
        assert!(matches!(result, Err(CacheError::Expiry(_))));
    }

    #[tokio::test]
    async fn test_pipeline_starts_eagerly() {
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let pipeline = pipeline(CallbackStyle(move |done: Completion<(u32, i64)>| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            done.complete(Ok((1, 2)));
        }));

        let future = pipeline.start(&Handle::current());
        assert!(started.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(future.await.unwrap().expires_at, 2);
    }
}
