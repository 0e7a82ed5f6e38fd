//! Ordered fallback strategies

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::errors::DeployError;
use crate::report::Reporter;

type Attempt<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, DeployError>> + Send + 'a>;

/// Which strategy succeeded and what it returned
#[derive(Debug)]
pub struct ChainSuccess<T> {
    pub strategy: String,
    pub value: T,
    pub failures: usize,
}

/// Tries strategies in order and stops at the first success.
///
/// Each failure is reported at `warn` before the next strategy starts. When all
/// fail, the last error is returned.
pub struct FallbackChain<'a, T> {
    attempts: Vec<(String, Attempt<'a, T>)>,
}

impl<'a, T: Send + 'a> FallbackChain<'a, T> {
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    pub fn then<F, Fut>(mut self, label: impl Into<String>, attempt: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, DeployError>> + Send + 'a,
    {
        self.attempts
            .push((label.into(), Box::new(move || attempt().boxed())));
        self
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub async fn run(self, reporter: &dyn Reporter) -> Result<ChainSuccess<T>, DeployError> {
        let mut last_error = None;
        let mut failures = 0;
        let total = self.attempts.len();

        for (index, (label, attempt)) in self.attempts.into_iter().enumerate() {
            debug!("Trying strategy {} ({}/{})", label, index + 1, total);
            match attempt().await {
                Ok(value) => {
                    return Ok(ChainSuccess {
                        strategy: label,
                        value,
                        failures,
                    })
                }
                Err(e) => {
                    failures += 1;
                    if index + 1 < total {
                        reporter.warn(&format!("{} failed: {}. Falling back.", label, e));
                    } else {
                        reporter.warn(&format!("{} failed: {}", label, e));
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DeployError::Internal("fallback chain has no strategies".to_string())))
    }
}

impl<'a, T: Send + 'a> Default for FallbackChain<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}
