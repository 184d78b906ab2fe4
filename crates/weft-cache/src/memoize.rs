use crate::cache::Cache;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use weft_core::WeftResult;

/// A unit of work wrapped so that calls with equal keys run it only once per
/// TTL window.
///
/// Built with [`memoize`].
pub struct Memoized<F, K> {
    cache: Arc<Cache>,
    work: F,
    key_fn: K,
    ttl: Option<Duration>,
}

/// Wrap `work` so repeated calls whose `key_fn(args)` match are served from
/// `cache`. Failed calls are not cached.
pub fn memoize<F, K>(cache: Arc<Cache>, work: F, key_fn: K, ttl: Option<Duration>) -> Memoized<F, K> {
    Memoized {
        cache,
        work,
        key_fn,
        ttl,
    }
}

impl<F, K> Memoized<F, K> {
    pub async fn call<A, Fut>(&self, args: A) -> WeftResult<Value>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = WeftResult<Value>>,
        K: Fn(&A) -> String,
    {
        let key = (self.key_fn)(&args);
        self.cache
            .get_or_compute(&key, self.ttl, || (self.work)(args))
            .await
    }
}
