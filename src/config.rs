//! Configuration: `GOMAXPROCS` env parsing plus a programmatic builder, so
//! tests never depend on process-global environment state.

use crate::word::MAX_MCPUMAX;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    gomaxprocs: u32,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reads `GOMAXPROCS` from the environment. An absent, non-numeric, or
    /// non-positive value falls back to
    /// [`std::thread::available_parallelism`], itself clamped to
    /// [`crate::word::MAX_MCPUMAX`].
    pub fn from_env() -> Self {
        let requested = std::env::var("GOMAXPROCS")
            .ok()
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|&n| n > 0)
            .map(|n| n as u32);

        let fallback = || {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        };

        let requested = requested.unwrap_or_else(fallback);
        Self::builder().gomaxprocs(requested).build()
    }

    pub fn gomaxprocs(&self) -> u32 {
        self.gomaxprocs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigBuilder {
    gomaxprocs: u32,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder { gomaxprocs: 1 }
    }
}

impl ConfigBuilder {
    /// Clamps silently to `[1, MAX_MCPUMAX]`: an oversized parallelism
    /// ceiling is a configuration error that gets clamped, not rejected.
    pub fn gomaxprocs(mut self, n: u32) -> Self {
        let clamped = n.clamp(1, MAX_MCPUMAX);
        if clamped != n {
            log::warn!("GOMAXPROCS {n} out of range, clamped to {clamped}");
        }
        self.gomaxprocs = clamped;
        self
    }

    pub fn build(self) -> Config {
        Config {
            gomaxprocs: self.gomaxprocs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_oversized_gomaxprocs() {
        let config = Config::builder().gomaxprocs(u32::MAX).build();
        assert_eq!(config.gomaxprocs(), MAX_MCPUMAX);
    }

    #[test]
    fn builder_clamps_zero_to_one() {
        let config = Config::builder().gomaxprocs(0).build();
        assert_eq!(config.gomaxprocs(), 1);
    }
}
