//! Service task runner.
//!
//! Wraps any single remote call with a uniform recovery policy: exponential
//! backoff on rate limiting, exactly one reauthentication per task instance
//! on token expiry, and immediate failure on cancellation. The policy is an
//! explicit little state machine (current delay, one-shot reauth flag), not
//! recursive callbacks.

use crate::config::RetryPolicy;
use crate::progress::Progress;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tandem_model::{
    Account, AuthenticationError, DeauthenticationError, FetchError, ServiceError,
};
use tracing::debug;

/// How a failed call can be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Retry the same call after a backoff delay.
    RateLimited,
    /// Reauthenticate once, then retry the same call.
    TokenExpired,
    /// Surface the error as-is.
    Fatal,
}

/// Error types the task runner can drive recovery for.
pub trait TaskError: Sized {
    /// Classifies the error for the recovery policy.
    fn recovery(&self) -> Recovery;

    /// The error to surface when the task is cancelled.
    fn cancelled() -> Self;

    /// The error to surface when a required pre-call authentication fails.
    fn authentication(error: AuthenticationError) -> Self;
}

impl TaskError for ServiceError {
    fn recovery(&self) -> Recovery {
        match self {
            ServiceError::RateLimitExceeded => Recovery::RateLimited,
            ServiceError::TokenExpired => Recovery::TokenExpired,
            _ => Recovery::Fatal,
        }
    }

    fn cancelled() -> Self {
        ServiceError::Cancelled
    }

    fn authentication(error: AuthenticationError) -> Self {
        ServiceError::Other(error.to_string())
    }
}

impl TaskError for FetchError {
    fn recovery(&self) -> Recovery {
        match self {
            FetchError::Service(inner) => inner.recovery(),
            _ => Recovery::Fatal,
        }
    }

    fn cancelled() -> Self {
        FetchError::Service(ServiceError::Cancelled)
    }

    fn authentication(error: AuthenticationError) -> Self {
        FetchError::Other(error.to_string())
    }
}

impl TaskError for AuthenticationError {
    fn recovery(&self) -> Recovery {
        match self {
            AuthenticationError::TokenExpired => Recovery::TokenExpired,
            AuthenticationError::Service(inner) => inner.recovery(),
            _ => Recovery::Fatal,
        }
    }

    fn cancelled() -> Self {
        AuthenticationError::Service(ServiceError::Cancelled)
    }

    fn authentication(error: AuthenticationError) -> Self {
        error
    }
}

impl TaskError for DeauthenticationError {
    fn recovery(&self) -> Recovery {
        Recovery::Fatal
    }

    fn cancelled() -> Self {
        DeauthenticationError::other("the request was cancelled")
    }

    fn authentication(error: AuthenticationError) -> Self {
        DeauthenticationError::other(error.to_string())
    }
}

/// Reauthentication hook injected into tasks.
///
/// Implemented by the coordinator; a task asks it to refresh the session
/// when a call fails with token expiry.
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    /// Whether a session is currently authenticated.
    fn is_authenticated(&self) -> bool;

    /// Attempts to (re)authenticate silently.
    async fn reauthenticate(&self) -> Result<Account, AuthenticationError>;
}

/// Runs one remote call under the uniform recovery policy.
///
/// Each instance retries rate-limited calls with exponential backoff until
/// the policy's ceiling, attempts at most one reauthentication, and checks
/// its [`Progress`] for cancellation at every suspension point.
pub struct ServiceTask {
    auth: Option<Arc<dyn Reauthenticator>>,
    policy: RetryPolicy,
    progress: Progress,
    requires_authentication: bool,
}

impl ServiceTask {
    /// Creates a task that requires authentication.
    pub fn new(auth: Arc<dyn Reauthenticator>, policy: RetryPolicy, progress: Progress) -> Self {
        Self {
            auth: Some(auth),
            policy,
            progress,
            requires_authentication: true,
        }
    }

    /// Creates a task exempt from authentication. Used for authentication
    /// itself, which must never wait on an authenticated session.
    pub fn unauthenticated(policy: RetryPolicy, progress: Progress) -> Self {
        Self {
            auth: None,
            policy,
            progress,
            requires_authentication: false,
        }
    }

    /// Runs the call to completion under the recovery policy.
    pub async fn run<T, E, F, Fut>(self, mut call: F) -> Result<T, E>
    where
        E: TaskError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delay = self.policy.initial_delay;
        let mut attempted_reauthentication = false;

        if self.progress.is_cancelled() {
            self.progress.complete();
            return Err(E::cancelled());
        }

        if self.requires_authentication {
            if let Some(auth) = &self.auth {
                if !auth.is_authenticated() {
                    if let Err(error) = auth.reauthenticate().await {
                        self.progress.complete();
                        return Err(E::authentication(error));
                    }
                }
            }
        }

        loop {
            if self.progress.is_cancelled() {
                self.progress.complete();
                return Err(E::cancelled());
            }

            let result = call().await;

            if self.progress.is_cancelled() {
                self.progress.complete();
                return Err(E::cancelled());
            }

            let error = match result {
                Ok(value) => {
                    self.progress.complete();
                    return Ok(value);
                }
                Err(error) => error,
            };

            match error.recovery() {
                Recovery::RateLimited => {
                    if self.policy.should_give_up(delay) {
                        self.progress.complete();
                        return Err(error);
                    }

                    debug!(delay_secs = delay.as_secs_f64(), "rate limited, retrying after delay");
                    tokio::time::sleep(delay).await;
                    delay = self.policy.next_delay(delay);
                }
                Recovery::TokenExpired
                    if self.requires_authentication && !attempted_reauthentication =>
                {
                    attempted_reauthentication = true;

                    let Some(auth) = &self.auth else {
                        self.progress.complete();
                        return Err(error);
                    };

                    debug!("token expired, attempting reauthentication");
                    if auth.reauthenticate().await.is_err() {
                        // Surface the original expiry, not the
                        // reauthentication failure.
                        self.progress.complete();
                        return Err(error);
                    }
                }
                _ => {
                    self.progress.complete();
                    return Err(error);
                }
            }
        }
    }
}
