//! Tunables for code generation
use std::ops::RangeInclusive;
use tracing::warn;

pub const MAX_ATTEMPTS_ENV: &str = "DELIVERY_CODE_MAX_ATTEMPTS";
pub const MIN_CODE: u32 = 100_000;
pub const MAX_CODE: u32 = 999_999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Draws tried before generation gives up with `CodeSpaceExhausted`.
    pub max_generation_attempts: u32,
    pub code_range: RangeInclusive<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_generation_attempts: 100,
            code_range: MIN_CODE..=MAX_CODE,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overlaid with `DELIVERY_CODE_MAX_ATTEMPTS` when it parses.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(MAX_ATTEMPTS_ENV) {
            Ok(raw) => match raw.trim().parse::<u32>() {
                Ok(attempts) if attempts > 0 => config.set_max_generation_attempts(attempts),
                _ => {
                    warn!(value = %raw, "ignoring invalid {}", MAX_ATTEMPTS_ENV);
                    config
                }
            },
            Err(_) => config,
        }
    }

    pub fn set_max_generation_attempts(mut self, attempts: u32) -> Self {
        self.max_generation_attempts = attempts;
        self
    }

    /// Narrows the range codes are drawn from. Both bounds are clamped into
    /// `MIN_CODE..=MAX_CODE`.
    pub fn set_code_range(mut self, low: u32, high: u32) -> Self {
        let low = low.clamp(MIN_CODE, MAX_CODE);
        let high = high.clamp(low, MAX_CODE);
        self.code_range = low..=high;
        self
    }
}
