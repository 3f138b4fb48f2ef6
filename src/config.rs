use ::config::Config;
use std::time::Duration;
use tracing::warn;

pub(crate) const DEFAULT_BUFFER_SIZE: usize = 4096;
pub(crate) const DEFAULT_PROCESS_LOOP_DELAY_MS: u64 = 5;
pub(crate) const DEFAULT_POLL_TIMEOUT_MS: u64 = 5;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
pub(crate) const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 5;
pub(crate) const DEFAULT_POLL_CAPACITY: usize = 16;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

// Missing keys silently use the default, unparsable ones are reported.
fn usize_or(config: &Config, name: &str, key: &str, default: usize) -> usize {
    match get_namespaced_usize(config, name, key) {
        Ok(value) => value,
        Err(config::ConfigError::NotFound(_)) => default,
        Err(err) => {
            warn!(key, %err, default, "Invalid configuration value, using default");
            default
        }
    }
}

fn u64_or(config: &Config, name: &str, key: &str, default: u64) -> u64 {
    match get_namespaced_u64(config, name, key) {
        Ok(value) => value,
        Err(config::ConfigError::NotFound(_)) => default,
        Err(err) => {
            warn!(key, %err, default, "Invalid configuration value, using default");
            default
        }
    }
}

/// Tunables shared by clients, servers and their connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
    pub(crate) process_loop_delay: Duration,
    pub(crate) poll_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) accept_timeout: Duration,
    pub(crate) poll_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            process_loop_delay: Duration::from_millis(DEFAULT_PROCESS_LOOP_DELAY_MS),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            accept_timeout: Duration::from_millis(DEFAULT_ACCEPT_TIMEOUT_MS),
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

impl Settings {
    /// Reads all settings, with `{name}.{key}` taking priority over `{key}`.
    pub(crate) fn from_config(config: &Config, name: &str) -> Self {
        let read_buffer_size = usize_or(config, name, "read_buffer_size", DEFAULT_BUFFER_SIZE);
        let write_buffer_size = usize_or(config, name, "write_buffer_size", DEFAULT_BUFFER_SIZE);
        Self {
            read_buffer_size: read_buffer_size.max(1),
            write_buffer_size: write_buffer_size.max(1),
            process_loop_delay: Duration::from_millis(u64_or(
                config,
                name,
                "process_loop_delay_ms",
                DEFAULT_PROCESS_LOOP_DELAY_MS,
            )),
            poll_timeout: Duration::from_millis(u64_or(
                config,
                name,
                "poll_timeout_ms",
                DEFAULT_POLL_TIMEOUT_MS,
            )),
            connect_timeout: Duration::from_millis(u64_or(
                config,
                name,
                "connect_timeout_ms",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            accept_timeout: Duration::from_millis(u64_or(
                config,
                name,
                "accept_timeout_ms",
                DEFAULT_ACCEPT_TIMEOUT_MS,
            )),
            poll_capacity: usize_or(config, name, "poll_capacity", DEFAULT_POLL_CAPACITY).max(1),
        }
    }
}
