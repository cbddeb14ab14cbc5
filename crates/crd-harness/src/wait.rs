//! Bounded waits for eventually-consistent server state.
//!
//! CRD registration reaches storage and discovery asynchronously. Instead of
//! sleeping for a fixed time, callers state what they wait for and how long:
//!
//! - [`eventually`] polls until a check produces a value or the deadline passes.
//! - [`consistently`] requires a check to hold for a whole window.

use std::{fmt, future::Future, time::Duration};

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Deadline and backoff of a wait.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
	/// Give up after this long
	pub timeout: Duration,
	/// Delay before the second attempt
	pub initial_delay: Duration,
	/// Upper bound of the delay between attempts
	pub max_delay: Duration,
	/// Multiplier for exponential backoff
	pub backoff_multiplier: f64,
}

impl Default for WaitConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(30),
			initial_delay: Duration::from_millis(50),
			max_delay: Duration::from_secs(1),
			backoff_multiplier: 2.0,
		}
	}
}

impl WaitConfig {
	/// Create a config with the given deadline and default backoff.
	pub fn with_timeout(timeout: Duration) -> Self {
		Self {
			timeout,
			..Self::default()
		}
	}

	fn next_delay(&self, delay: Duration) -> Duration {
		Duration::from_secs_f64(
			(delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
		)
	}
}

/// Why a wait ended without success.
#[derive(Debug, Error)]
pub enum WaitError<E> {
	#[error("timed out after {elapsed:?} waiting for {operation} ({attempts} attempts)")]
	Timeout {
		operation: String,
		attempts: u32,
		elapsed: Duration,
	},

	#[error("{operation} stopped holding after {elapsed:?}")]
	Violated { operation: String, elapsed: Duration },

	#[error(transparent)]
	Failed(E),
}

/// Poll `check` until it returns `Ok(Some(_))`.
///
/// `Ok(None)` means "not yet" and schedules another attempt with exponential
/// backoff. `Err(_)` is permanent and ends the wait immediately. The check is
/// always attempted at least once, and once more at the deadline.
pub async fn eventually<F, Fut, T, E>(
	config: &WaitConfig,
	operation: &str,
	mut check: F,
) -> Result<T, WaitError<E>>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<Option<T>, E>>,
	E: fmt::Display,
{
	let start = Instant::now();
	let deadline = start + config.timeout;
	let mut delay = config.initial_delay;
	let mut attempts = 0u32;

	loop {
		attempts += 1;
		match check().await {
			Ok(Some(value)) => {
				debug!(operation, attempts, elapsed_ms = start.elapsed().as_millis(), "Wait satisfied");
				return Ok(value);
			}
			Ok(None) => {}
			Err(e) => {
				debug!(operation, attempts, error = %e, "Wait aborted");
				return Err(WaitError::Failed(e));
			}
		}

		let now = Instant::now();
		if now >= deadline {
			return Err(WaitError::Timeout {
				operation: operation.to_string(),
				attempts,
				elapsed: start.elapsed(),
			});
		}

		let pause = delay.min(deadline - now);
		trace!(operation, attempts, delay_ms = pause.as_millis(), "Not ready, retrying");
		sleep(pause).await;
		delay = config.next_delay(delay);
	}
}

/// Require `check` to return `Ok(true)` on every check during `window`.
///
/// Checks run every `interval`, plus a final one at the end of the window.
pub async fn consistently<F, Fut, E>(
	window: Duration,
	interval: Duration,
	operation: &str,
	mut check: F,
) -> Result<(), WaitError<E>>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<bool, E>>,
{
	let start = Instant::now();
	let end = start + window;

	loop {
		if !check().await.map_err(WaitError::Failed)? {
			return Err(WaitError::Violated {
				operation: operation.to_string(),
				elapsed: start.elapsed(),
			});
		}

		let now = Instant::now();
		if now >= end {
			debug!(operation, window_ms = window.as_millis(), "Condition held");
			return Ok(());
		}
		sleep(interval.min(end - now)).await;
	}
}
