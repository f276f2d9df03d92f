use std::sync::Arc;

use thiserror::Error;

/// An error delivered to a caller of [`ResourceCache::request`](crate::ResourceCache::request).
///
/// The same failure is handed to every caller waiting on a fetch, which is why this is
/// [`Clone`] and wraps the underlying errors in an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The fetch operation failed.
    #[error("fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),
    /// The fetch succeeded, but transforming its result failed.
    #[error("transform failed: {0:#}")]
    Transform(Arc<anyhow::Error>),
    /// The fetch succeeded, but no valid expiration could be derived from its result.
    #[error("invalid expiration: {0:#}")]
    Expiry(Arc<anyhow::Error>),
    /// The cached value could not be copied for this caller.
    #[error("copy failed: {0:#}")]
    Copy(Arc<anyhow::Error>),
    /// The fetch went away without ever completing.
    ///
    /// This happens when a callback-style fetch drops its [`Completion`](crate::Completion)
    /// handle, or when the task driving the fetch is torn down.
    #[error("fetch was abandoned without completing")]
    Abandoned,
    /// The result was never delivered, typically because the runtime shut down.
    #[error("delivery was canceled")]
    Canceled,
}

impl CacheError {
    pub(crate) fn fetch(err: anyhow::Error) -> Self {
        Self::Fetch(Arc::new(err))
    }

    pub(crate) fn transform(err: anyhow::Error) -> Self {
        Self::Transform(Arc::new(err))
    }

    pub(crate) fn expiry(err: anyhow::Error) -> Self {
        Self::Expiry(Arc::new(err))
    }

    pub(crate) fn copy(err: anyhow::Error) -> Self {
        Self::Copy(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, anyhow};

    use super::*;

    #[test]
    fn test_display_includes_causes() {
        let err = Err::<(), _>(anyhow!("connection reset"))
            .context("token endpoint unavailable")
            .unwrap_err();

        insta::assert_snapshot!(
            CacheError::fetch(err).to_string(),
            @"fetch failed: token endpoint unavailable: connection reset"
        );
    }

    #[test]
    fn test_clones_share_the_source() {
        let err = CacheError::copy(anyhow!("nope"));
        let CacheError::Copy(inner) = err.clone() else {
            panic!("unexpected variant");
        };
        let CacheError::Copy(shared) = err else {
            panic!("unexpected variant");
        };
        assert!(Arc::ptr_eq(&inner, &shared));
    }
}
