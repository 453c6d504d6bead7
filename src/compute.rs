//! The external compute step a worker runs for each claimed task.
//!
//! The bridge treats compute as a black box: a [`Payload`] goes in, a
//! [`Payload`] or a [`ComputeError`] comes out. The worker loop enforces the
//! time bound, so implementations do not need their own timeout.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::domain::{Payload, PayloadSchema};

/// Why a compute step produced no result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// The collaborator ran and reported a failure.
    #[error("compute failed: {0}")]
    Failed(String),

    /// The collaborator did not answer in time.
    #[error("compute timed out after {0:?}")]
    TimedOut(Duration),

    /// The payload's schema is not one this worker understands.
    #[error("unsupported payload schema {found}, expected {expected}")]
    UnsupportedSchema {
        /// Schema the payload carried.
        found: PayloadSchema,
        /// Schema the worker accepts.
        expected: PayloadSchema,
    },
}

/// An external compute collaborator.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Produces the result for one task input.
    async fn compute(&self, payload: &Payload) -> Result<Payload, ComputeError>;
}

type ComputeFn = dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, ComputeError>> + Send + Sync;

/// Adapts an async closure into a [`Compute`].
///
/// # Examples
///
/// ```
/// use taskbridge::compute::{Compute, FnCompute};
/// use taskbridge::Payload;
///
/// let upper = FnCompute::new(|payload: Payload| {
///     Box::pin(async move { Ok(Payload::text(payload.body.to_uppercase())) })
/// });
/// # let _ = upper;
/// ```
pub struct FnCompute {
    handler: Box<ComputeFn>,
}

impl fmt::Debug for FnCompute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCompute").finish_non_exhaustive()
    }
}

impl FnCompute {
    /// Wraps `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Payload) -> BoxFuture<'static, Result<Payload, ComputeError>> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Compute for FnCompute {
    async fn compute(&self, payload: &Payload) -> Result<Payload, ComputeError> {
        (self.handler)(payload.clone()).await
    }
}

/// Returns the input unchanged. Useful for wiring checks and local runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCompute;

#[async_trait]
impl Compute for EchoCompute {
    async fn compute(&self, payload: &Payload) -> Result<Payload, ComputeError> {
        Ok(payload.clone())
    }
}

#[cfg(feature = "http-compute")]
pub use http::HttpCompute;

#[cfg(feature = "http-compute")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{Compute, ComputeError};
    use crate::domain::Payload;

    /// POSTs the payload as JSON to an endpoint and reads a payload back.
    ///
    /// Non-success statuses, transport errors and undecodable responses all
    /// surface as [`ComputeError::Failed`].
    #[derive(Debug, Clone)]
    pub struct HttpCompute {
        client: reqwest::Client,
        endpoint: String,
    }

    impl HttpCompute {
        /// Creates a collaborator for `endpoint` whose requests give up after
        /// `request_timeout`.
        pub fn new(
            endpoint: impl Into<String>,
            request_timeout: Duration,
        ) -> Result<Self, ComputeError> {
            let client = reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .map_err(|e| ComputeError::Failed(format!("failed to build HTTP client: {e}")))?;
            Ok(Self {
                client,
                endpoint: endpoint.into(),
            })
        }

        /// The configured endpoint.
        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    #[async_trait]
    impl Compute for HttpCompute {
        async fn compute(&self, payload: &Payload) -> Result<Payload, ComputeError> {
            let response = self
                .client
                .post(&self.endpoint)
                .json(payload)
                .send()
                .await
                .map_err(|e| ComputeError::Failed(format!("request to compute endpoint failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ComputeError::Failed(format!(
                    "compute endpoint returned {status}: {body}"
                )));
            }
            response
                .json::<Payload>()
                .await
                .map_err(|e| ComputeError::Failed(format!("invalid compute response: {e}")))
        }
    }
}
