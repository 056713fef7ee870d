use log::warn;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

use crate::error::Error;

/// How many times a request is retried and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    /// Delay before the first retry. Retry `n` waits `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base_delay` is zero.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Result<Self, Error> {
        if base_delay.is_zero() {
            return Err(Error::Config(
                "retry base delay must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            base_delay,
        })
    }

    /// Delay to wait after the given 0-indexed attempt failed.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Saturates instead of overflowing for absurd attempt counts.
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
    }
}

/// Outcome of a single attempt, as seen by [`retry_with_backoff`].
pub enum Attempt<T> {
    /// Final value, returned to the caller as-is.
    Done(T),
    /// The remote side asked us to slow down.
    RateLimited,
    /// Network level failure worth retrying (connect, timeout, reset).
    Transient(String),
    /// Failure that retrying cannot fix.
    Fail(Error),
}

/// Runs `operation` until it yields a final value, sleeping with exponential
/// backoff between rate-limited or transient attempts.
///
/// The closure receives the 0-indexed attempt number.
///
/// # Errors
///
/// Returns the error of a failed attempt, or [`Error::RetriesExhausted`]
/// once every retry was rate limited or transient.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut attempt = 0;
    loop {
        let reason = match operation(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(err) => return Err(err),
            Attempt::RateLimited => "rate limited".to_string(),
            Attempt::Transient(reason) => reason,
        };

        if attempt >= policy.max_attempts {
            return Err(Error::RetriesExhausted {
                attempts: attempt + 1,
                reason,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            "Retry {}/{} in {}ms ({reason})",
            attempt + 1,
            policy.max_attempts,
            delay.as_millis()
        );
        sleep(delay).await;
        attempt += 1;
    }
}

/// Retryable: connect, timeout, request and body errors.
fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request() || err.is_body()
}

/// Shared HTTP client used for every outbound call.
///
/// Cloning is cheap, the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct FetchClient {
    http: Client,
    policy: RetryPolicy,
}

impl FetchClient {
    /// Builds a client whose requests all time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self, Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, policy })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Sends `request`, retrying on 429 and transient network errors.
    ///
    /// Any other response, including non-2xx statuses, is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetriesExhausted`] once retries are used up, or the
    /// request error when it is not worth retrying.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, Error> {
        retry_with_backoff(&self.policy, |_| {
            let request = request.try_clone();
            async move {
                let Some(request) = request else {
                    return Attempt::Fail(Error::RequestNotReplayable);
                };
                match request.send().await {
                    Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                        Attempt::RateLimited
                    }
                    Ok(response) => Attempt::Done(response),
                    Err(err) if is_transient(&err) => Attempt::Transient(err.to_string()),
                    Err(err) => Attempt::Fail(err.into()),
                }
            }
        })
        .await
    }

    /// GETs `url` and decodes a successful JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the status is not 2xx, or the
    /// body does not decode as `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        let response = self.send(self.http.get(url)).await?;
        let response = ensure_success(response)?;
        Ok(response.json::<T>().await?)
    }
}

/// Turns a non-2xx response into [`Error::UnexpectedStatus`].
///
/// # Errors
///
/// Returns [`Error::UnexpectedStatus`] for any non-2xx status.
pub fn ensure_success(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::UnexpectedStatus {
            status,
            url: response.url().to_string(),
        })
    }
}
