//! Helpers for testing the cache.
//!
//! Tests run on a current-thread runtime with a [`ManualClock`](crate::ManualClock), and
//! complete fetches by hand through [`Fetches`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::completion::{CallbackStyle, Completion, CompletionSource};
use crate::error::CacheError;

/// Setup the test environment.
///
/// Initializes logs, capturing everything the `resource_cache` crate logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resource_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Lets all spawned fetches and deliveries run to completion.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// A raw resource, as an upstream might return it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Token {
    pub value: String,
    pub expires: i64,
}

pub fn token(value: &str, expires: i64) -> Token {
    Token {
        value: value.to_owned(),
        expires,
    }
}

/// Fetches that are completed by the test.
#[derive(Clone, Default)]
pub struct Fetches {
    pending: Arc<Mutex<VecDeque<Completion<Token>>>>,
    started: Arc<AtomicUsize>,
}

impl Fetches {
    /// A source queueing up each fetch it is asked to start.
    pub fn source(&self) -> impl CompletionSource<Token> + use<> {
        let pending = Arc::clone(&self.pending);
        let started = Arc::clone(&self.started);
        CallbackStyle(move |completion: Completion<Token>| {
            started.fetch_add(1, Ordering::SeqCst);
            pending.lock().unwrap().push_back(completion);
        })
    }

    /// The number of fetches started so far.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Takes the oldest pending fetch.
    pub fn next(&self) -> Completion<Token> {
        self.pending
            .lock()
            .unwrap()
            .pop_front()
            .expect("no fetch is pending")
    }

    /// Completes the oldest pending fetch.
    pub fn complete(&self, result: anyhow::Result<Token>) {
        assert!(self.next().complete(result));
    }
}

/// Records the results delivered to callbacks, in delivery order.
pub struct Recorder<T> {
    results: Arc<Mutex<Vec<(usize, Result<T, CacheError>)>>>,
}

impl<T: Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            results: Default::default(),
        }
    }

    /// A callback recording its result under `id`.
    pub fn callback(&self, id: usize) -> impl FnOnce(Result<T, CacheError>) + Send + use<T> {
        let results = Arc::clone(&self.results);
        move |result| results.lock().unwrap().push((id, result))
    }

    /// Takes all results recorded so far.
    pub fn take(&self) -> Vec<(usize, Result<T, CacheError>)> {
        std::mem::take(&mut *self.results.lock().unwrap())
    }
}

impl Recorder<Token> {
    /// Takes all results recorded so far, which must all be successful.
    pub fn values(&self) -> Vec<(usize, String)> {
        self.take()
            .into_iter()
            .map(|(id, result)| (id, result.expect("unexpected error").value))
            .collect()
    }
}
