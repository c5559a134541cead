//! Loop configuration.
//!
//! Values set through the builder methods win over environment overrides applied by
//! [`Config::from_env`], which win over the defaults.
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `COOPLOOP_SLOW_STEP_MS` | `u64` | `slow_step_threshold` |

use crate::error::Error;
use std::{env, time};

/// Environment variable for the slow step threshold, in milliseconds
pub const ENV_SLOW_STEP_MS: &str = "COOPLOOP_SLOW_STEP_MS";

/// Tunables of an [`EventLoop`](crate::rt::EventLoop)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
	/// Resume steps that take longer than this, in loop time, are logged as warnings
	pub slow_step_threshold: Option<time::Duration>,
}

impl Config {
	/// Defaults with environment overrides applied
	pub fn from_env() -> Result<Self, Error> {
		let mut config = Self::default();
		config.apply_env()?;
		Ok(config)
	}

	/// Applies the environment variables that are set
	pub fn apply_env(&mut self) -> Result<(), Error> {
		if let Ok(raw) = env::var(ENV_SLOW_STEP_MS) {
			self.slow_step_threshold = Some(parse_millis(ENV_SLOW_STEP_MS, &raw)?);
		}

		Ok(())
	}

	/// Warn about resume steps slower than `threshold`
	pub fn slow_step_threshold(mut self, threshold: time::Duration) -> Self {
		self.slow_step_threshold = Some(threshold);
		self
	}
}

fn parse_millis(var: &'static str, raw: &str) -> Result<time::Duration, Error> {
	raw.trim()
		.parse::<u64>()
		.map(time::Duration::from_millis)
		.map_err(|_| Error::InvalidConfig { var, value: raw.to_string() })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builder_sets_threshold() {
		let config = Config::default().slow_step_threshold(time::Duration::from_millis(100));
		assert_eq!(config.slow_step_threshold, Some(time::Duration::from_millis(100)));
	}

	#[test]
	fn parses_milliseconds() {
		assert_eq!(parse_millis(ENV_SLOW_STEP_MS, " 250 ").unwrap(), time::Duration::from_millis(250));
	}

	#[test]
	fn from_env_applies_overrides() {
		// the only test touching this variable
		unsafe { env::set_var(ENV_SLOW_STEP_MS, "40") };
		assert_eq!(Config::from_env().unwrap().slow_step_threshold, Some(time::Duration::from_millis(40)));

		unsafe { env::set_var(ENV_SLOW_STEP_MS, "later") };
		let err = Config::from_env().unwrap_err();
		assert!(matches!(err, Error::InvalidConfig { var: ENV_SLOW_STEP_MS, ref value } if value == "later"));

		unsafe { env::remove_var(ENV_SLOW_STEP_MS) };
		assert_eq!(Config::from_env().unwrap(), Config::default());
	}

	#[test]
	fn rejects_garbage() {
		let err = parse_millis(ENV_SLOW_STEP_MS, "soon").unwrap_err();
		assert!(matches!(err, Error::InvalidConfig { var: ENV_SLOW_STEP_MS, .. }));
		assert_eq!(err.to_string(), "invalid value \"soon\" for COOPLOOP_SLOW_STEP_MS");
	}
}
