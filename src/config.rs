//! Tunables for the event core.

use std::time::Duration;

use crate::thread_state::DEFAULT_REAPED_RETENTION;

/// Event core configuration.
///
/// Plain data with public fields; sentinel values (`0`, `Duration::ZERO`)
/// mean "no limit".
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vigil::config::EventConfig;
///
/// let config = EventConfig {
///     deferred_capacity: 64,
///     drain_timeout: Duration::from_millis(250),
///     ..EventConfig::default()
/// };
/// assert_eq!(config.deferred_bound(), Some(64));
/// assert_eq!(config.drain_deadline(), Some(Duration::from_millis(250)));
/// ```
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Bound of the deferred queue; 0 = unbounded
    pub deferred_capacity: usize,
    /// Thread name of the background delivery worker
    pub worker_name: String,
    /// How long `drain()` waits for the worker; ZERO = indefinitely
    pub drain_timeout: Duration,
    /// Emit a trace record for every triggered and sent event
    pub trace_events: bool,
    /// Initial buffer capacity of an accumulating collector
    pub collector_initial_capacity: usize,
    /// Ended threads remembered so late posts on them are dropped
    pub reaped_retention: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            deferred_capacity: 0,
            worker_name: "vigil-service".to_string(),
            drain_timeout: Duration::ZERO,
            trace_events: false,
            collector_initial_capacity: 16,
            reaped_retention: DEFAULT_REAPED_RETENTION,
        }
    }
}

impl EventConfig {
    pub const ENV_DEFERRED_CAPACITY: &'static str = "VIGIL_DEFERRED_CAPACITY";
    pub const ENV_WORKER_NAME: &'static str = "VIGIL_WORKER_NAME";
    pub const ENV_DRAIN_TIMEOUT_MS: &'static str = "VIGIL_DRAIN_TIMEOUT_MS";
    pub const ENV_TRACE_EVENTS: &'static str = "VIGIL_TRACE_EVENTS";
    pub const ENV_REAPED_RETENTION: &'static str = "VIGIL_REAPED_RETENTION";

    /// Defaults overlaid with `VIGIL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Malformed values are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(Self::ENV_DEFERRED_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) => config.deferred_capacity = capacity,
                Err(_) => warn_ignored(Self::ENV_DEFERRED_CAPACITY, &raw),
            }
        }
        if let Some(raw) = lookup(Self::ENV_WORKER_NAME) {
            let name = raw.trim();
            if name.is_empty() {
                warn_ignored(Self::ENV_WORKER_NAME, &raw);
            } else {
                config.worker_name = name.to_string();
            }
        }
        if let Some(raw) = lookup(Self::ENV_DRAIN_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.drain_timeout = Duration::from_millis(ms),
                Err(_) => warn_ignored(Self::ENV_DRAIN_TIMEOUT_MS, &raw),
            }
        }
        if let Some(raw) = lookup(Self::ENV_REAPED_RETENTION) {
            match raw.trim().parse::<usize>() {
                Ok(retention) if retention > 0 => config.reaped_retention = retention,
                _ => warn_ignored(Self::ENV_REAPED_RETENTION, &raw),
            }
        }
        if let Some(raw) = lookup(Self::ENV_TRACE_EVENTS) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.trace_events = true,
                "0" | "false" | "no" | "off" => config.trace_events = false,
                _ => warn_ignored(Self::ENV_TRACE_EVENTS, &raw),
            }
        }

        config
    }

    pub fn deferred_bound(&self) -> Option<usize> {
        (self.deferred_capacity > 0).then_some(self.deferred_capacity)
    }

    pub fn drain_deadline(&self) -> Option<Duration> {
        (!self.drain_timeout.is_zero()).then_some(self.drain_timeout)
    }
}

fn warn_ignored(key: &str, raw: &str) {
    tracing::warn!(key, value = raw, "ignoring malformed configuration value");
}
