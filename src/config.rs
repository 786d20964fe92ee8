use std::time::Duration;

use crate::error::CometError;

/// Default idle timeout, matching the `comet` extension's documented default.
const DEFAULT_TIMEOUT_SECS: f64 = 20.0;

/// Runtime configuration for the comet endpoint.
///
/// In the hosted extension this was a config element with `timeout` and
/// `max_virtual_channels` attributes; here both knobs are read from the
/// environment at startup, the same way the process reads `PORT`.
#[derive(Debug, Clone)]
pub struct CometConfig {
    pub timeout: Duration,
    pub max_virtual_channels: Option<usize>,
}

impl Default for CometConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            max_virtual_channels: None,
        }
    }
}

impl CometConfig {
    /// Reads `COMET_TIMEOUT_SECS` and `COMET_MAX_VIRTUAL_CHANNELS` from the
    /// environment. Either variable may be absent; an empty
    /// `COMET_MAX_VIRTUAL_CHANNELS` means unbounded, matching the hosted
    /// extension's empty-string attribute convention.
    pub fn from_env() -> Result<Self, CometError> {
        let mut config = CometConfig::default();

        if let Ok(raw) = std::env::var("COMET_TIMEOUT_SECS") {
            let seconds: f64 = raw
                .parse()
                .map_err(|_| CometError::Config(format!("invalid COMET_TIMEOUT_SECS: {raw}")))?;
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(CometError::Config(format!(
                    "COMET_TIMEOUT_SECS must be a non-negative number, got {raw}"
                )));
            }
            config.timeout = Duration::from_secs_f64(seconds);
        }

        if let Ok(raw) = std::env::var("COMET_MAX_VIRTUAL_CHANNELS") {
            if raw.trim().is_empty() {
                config.max_virtual_channels = None;
            } else {
                let cap: usize = raw.parse().map_err(|_| {
                    CometError::Config(format!("invalid COMET_MAX_VIRTUAL_CHANNELS: {raw}"))
                })?;
                config.max_virtual_channels = Some(cap);
            }
        }

        Ok(config)
    }
}
