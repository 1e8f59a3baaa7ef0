use std::time::Duration;

/// Reconnection policy for the shared realtime connection.
///
/// Mirrors the Socket.IO client defaults: the first retry waits
/// `initial_delay_ms`, each further attempt doubles it up to `max_delay_ms`,
/// and a random fraction (`jitter`) is added or removed.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: u32,
    /// Randomization factor in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            factor: 2,
            jitter: 0.5,
        }
    }
}

/// Polling intervals for each page, in milliseconds.
#[derive(Debug, Clone)]
pub struct PollIntervals {
    pub dashboard_ms: u64,
    pub jobs_ms: u64,
    pub resources_ms: u64,
    pub job_details_ms: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            dashboard_ms: 60_000,
            jobs_ms: 180_000,
            resources_ms: 60_000,
            job_details_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the dashboard server (http, https, ws or wss).
    pub url: String,
    /// Socket.IO namespace, `/` for the default one.
    pub namespace: String,
    pub reconnect: ReconnectConfig,
    /// How long one-shot requests wait for their response event.
    pub request_timeout_ms: u64,
    pub poll: PollIntervals,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000".to_string(),
            namespace: "/".to_string(),
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: 30_000,
            poll: PollIntervals::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
