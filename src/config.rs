//! Pipe configuration.
//!
//! This type intentionally contains no bus-client types. Bus adapters
//! interpret `servers` and `credentials` into concrete connection settings.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the credentials file looked up in the home directory.
pub const DEFAULT_CREDENTIALS_FILE: &str = ".piper.creds";

/// Overall notify timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Overall notify timeout for durable pipes when none is configured.
pub const DEFAULT_DURABLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry timing of a notify call.
///
/// # Example
///
/// ```
/// use piper::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     attempt_timeout: Duration::from_secs(2),
///     backoff: Duration::from_secs(1),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline of a single request attempt.
    pub attempt_timeout: Duration,

    /// Pause after a transport error before the next attempt.
    ///
    /// Attempts that merely time out are repeated without a pause.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    /// - `attempt_timeout`: 2s
    /// - `backoff`: 1s
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(2),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Connection parameters and protocol timing.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    // ---
    /// Comma separated bus server URLs. Empty means the adapter default.
    pub servers: String,

    /// Credentials file handed to the bus client.
    pub credentials: Option<PathBuf>,

    /// Identifier for this bus connection, used for logging.
    pub bus_id: String,

    /// Overall deadline of a notify call. `None` picks [`DEFAULT_TIMEOUT`],
    /// or [`DEFAULT_DURABLE_TIMEOUT`] for durable pipes.
    pub timeout: Option<Duration>,

    /// Data send retry timing.
    pub retry: RetryPolicy,

    /// Deadline of a single discovery request.
    ///
    /// Discovery requests are repeated without backoff until a listener
    /// answers or the overall [`timeout`](Self::timeout) runs out. A bus that
    /// reports "no responders" immediately (NATS does) sees requests in a
    /// tight loop while no listener is up, so bound the overall timeout when
    /// that matters.
    ///
    /// Default: 2 seconds
    pub discovery_timeout: Duration,

    /// Deadline of a single durable fetch.
    ///
    /// Default: 60 seconds
    pub fetch_timeout: Duration,

    /// Deadline for provisioning requests (stream and consumer lookups).
    ///
    /// Default: 10 seconds
    pub provision_timeout: Duration,
}

impl PipeConfig {
    /// Create a config for the given bus servers.
    pub fn with_servers(servers: impl Into<String>, bus_id: impl Into<String>) -> Self {
        Self {
            servers: servers.into(),
            credentials: None,
            bus_id: bus_id.into(),
            timeout: None,
            retry: RetryPolicy::default(),
            discovery_timeout: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(60),
            provision_timeout: Duration::from_secs(10),
        }
    }

    /// Create a config for the in-memory bus.
    pub fn memory(bus_id: impl Into<String>) -> Self {
        Self::with_servers(String::new(), bus_id)
    }

    /// Set an explicit credentials file.
    pub fn with_credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = Some(path.into());
        self
    }

    /// Use `~/.piper.creds` when no credentials were given and the file exists.
    pub fn with_default_credentials(mut self) -> Self {
        // ---
        if self.credentials.is_none() {
            self.credentials = default_credentials_in(std::env::var_os("HOME").map(PathBuf::from));
        }
        self
    }

    /// Set the overall notify timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the data send retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-request discovery deadline.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the per-fetch deadline of the durable pull loop.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Set the provisioning request deadline.
    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// Overall notify timeout for a pipe, applying the mode default.
    pub fn notify_timeout(&self, durable: bool) -> Duration {
        // ---
        match self.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ if durable => DEFAULT_DURABLE_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

fn default_credentials_in(home: Option<PathBuf>) -> Option<PathBuf> {
    // ---
    let path = home?.join(DEFAULT_CREDENTIALS_FILE);
    path.is_file().then_some(path)
}
