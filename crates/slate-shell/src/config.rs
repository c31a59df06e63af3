use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Upper bound on how long the resolver blocks waiting for a promise.
    pub async_timeout: Duration,
    /// Memory cap for the Lua state in bytes. `None` leaves it unlimited.
    pub memory_limit: Option<usize>,
    /// Chunk name reported in script error messages.
    pub chunk_name: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            async_timeout: Duration::from_secs(1),
            memory_limit: None,
            chunk_name: "shell".into(),
        }
    }
}

impl ShellConfig {
    /// Build a config from `SLATE_SHELL_*` environment variables.
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let async_timeout = std::env::var("SLATE_SHELL_ASYNC_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.async_timeout);
        let memory_limit = std::env::var("SLATE_SHELL_MEMORY_LIMIT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .or(defaults.memory_limit);
        Self {
            async_timeout,
            memory_limit,
            ..defaults
        }
    }

    pub fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_a_one_second_bound() {
        let config = ShellConfig::default();
        assert_eq!(config.async_timeout, Duration::from_secs(1));
        assert_eq!(config.memory_limit, None);
        assert_eq!(config.chunk_name, "shell");
    }

    #[test]
    fn timeout_can_be_overridden() {
        let config = ShellConfig::default().with_async_timeout(Duration::from_millis(250));
        assert_eq!(config.async_timeout, Duration::from_millis(250));
    }
}
