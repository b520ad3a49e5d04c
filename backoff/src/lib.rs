//! Backoff functionality.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::info;
use rand::prelude::*;
use std::ops::ControlFlow;
use std::time::Duration;

/// Exponential backoff with bounded jitter.
///
/// The i-th delay is `min(max_backoff, init_backoff * 2^i)` scaled by a
/// uniform factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Relative jitter applied to each delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(120),
            jitter: 0.25,
        }
    }
}

/// Error after giving up retrying.
#[derive(Debug)]
pub struct RetriesExhausted<E> {
    /// How many attempts were made before giving up.
    pub attempts: usize,
    /// The error returned by the final attempt.
    pub source: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetriesExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "retries exhausted after {} attempts: {}",
            self.attempts, self.source
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetriesExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Backoff result.
pub type BackoffResult<T, E> = Result<T, RetriesExhausted<E>>;

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff
/// interval.
pub struct Backoff {
    init_backoff_secs: f64,
    max_backoff_secs: f64,
    jitter: f64,
    attempt: u32,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff_secs", &self.init_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("jitter", &self.jitter)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`
    ///
    /// Uses [`rand::thread_rng()`] if no rng provided
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        Self {
            init_backoff_secs: config.init_backoff.as_secs_f64(),
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            jitter: config.jitter,
            attempt: 0,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for
    fn next(&mut self) -> Duration {
        let exp = self.init_backoff_secs * 2_f64.powi(self.attempt as i32);
        let capped = self.max_backoff_secs.min(exp);
        self.attempt = self.attempt.saturating_add(1);

        let range = (1. - self.jitter)..(1. + self.jitter);
        let factor = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        Duration::from_secs_f64(capped * factor)
    }

    /// Perform an async operation that retries with a backoff, giving up
    /// after `max_attempts` attempts.
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        task_name: &str,
        max_attempts: usize,
        mut do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = ControlFlow<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        for attempt in 1.. {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            let e = match do_stuff.await {
                ControlFlow::Break(r) => return Ok(r),
                ControlFlow::Continue(e) => e,
            };

            if attempt >= max_attempts {
                return Err(RetriesExhausted {
                    attempts: attempt,
                    source: e,
                });
            }

            let backoff = self.next();
            info!(
                e=%e,
                task_name,
                attempt,
                backoff_millis = backoff.as_millis() as u64,
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
        unreachable!("the retry loop returns from within");
    }

    /// Retry all errors.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        max_attempts: usize,
        mut do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::fmt::Display + Send,
    {
        self.retry_with_backoff(task_name, max_attempts, move || {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();

            async {
                match do_stuff.await {
                    Ok(b) => ControlFlow::Break(b),
                    Err(e) => ControlFlow::Continue(e),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_backoff_schedule() {
        let init_backoff_secs = 1.;
        let max_backoff_secs = 100.;
        let jitter = 0.25;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            jitter,
        };

        let assert_fuzzy_eq = |a: f64, b: f64| assert!((b - a).abs() < 0.0001, "{} != {}", a, b);

        // Create a static rng that takes the minimum of the jitter range
        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for i in 0..10 {
            let expected = (2_f64.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), expected * (1. - jitter));
        }

        // Create a static rng that takes the maximum of the jitter range
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for i in 0..10 {
            let expected = (2_f64.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), expected * (1. + jitter));
        }
    }

    #[test]
    fn test_schedule_is_capped() {
        let config = BackoffConfig {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            jitter: 0.,
        };

        let rng = Box::new(StepRng::new(0, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        let delays: Vec<_> = (0..6).map(|_| backoff.next().as_secs_f64()).collect();
        assert_eq!(delays, vec![1., 2., 4., 8., 8., 8.]);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter: 0.,
        };

        let mut calls = 0;
        let got = Backoff::new(&config)
            .retry_all_errors("test", 5, || {
                calls += 1;
                let calls = calls;
                async move {
                    if calls < 3 {
                        Err("boom")
                    } else {
                        Ok(calls)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(got, 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter: 0.,
        };

        let mut calls = 0;
        let err = Backoff::new(&config)
            .retry_all_errors::<_, _, (), _>("test", 3, || {
                calls += 1;
                async move { Err("boom") }
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.source, "boom");
    }
}
