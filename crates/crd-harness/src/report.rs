//! Non-fatal result collection for scenarios.

use std::fmt;

use tracing::{error, info};

use crate::error::AssertionError;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
	/// The step that was running
	pub step: String,
	/// What went wrong, including the error chain
	pub message: String,
}

/// Outcome of one scenario.
///
/// Checks are recorded rather than raised, so a failed assertion does not
/// hide the ones after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
	name: String,
	steps: Vec<String>,
	failures: Vec<Failure>,
	aborted: bool,
}

impl ScenarioReport {
	pub fn new(name: &str) -> Self {
		Self {
			name: name.to_string(),
			steps: Vec::new(),
			failures: Vec::new(),
			aborted: false,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Announce the next step.
	pub fn step(&mut self, description: &str) {
		info!(scenario = %self.name, "{description}");
		self.steps.push(description.to_string());
	}

	/// Record `result`, returning the value on success.
	pub fn check<T>(&mut self, result: Result<T, AssertionError>) -> Option<T> {
		match result {
			Ok(value) => Some(value),
			Err(e) => {
				self.fail(format_chain(&e));
				None
			}
		}
	}

	/// Record a failure of the current step.
	pub fn fail(&mut self, message: String) {
		let step = self.steps.last().cloned().unwrap_or_default();
		error!(scenario = %self.name, step = %step, "{message}");
		self.failures.push(Failure { step, message });
	}

	/// Record `result`; on failure, mark the scenario as aborted so later steps
	/// are skipped by the caller.
	pub fn require<T>(&mut self, result: Result<T, AssertionError>) -> Option<T> {
		let value = self.check(result);
		if value.is_none() {
			self.aborted = true;
		}
		value
	}

	pub fn failures(&self) -> &[Failure] {
		&self.failures
	}

	pub fn steps(&self) -> &[String] {
		&self.steps
	}

	pub fn aborted(&self) -> bool {
		self.aborted
	}

	pub fn passed(&self) -> bool {
		self.failures.is_empty()
	}

	/// Panic with every recorded failure unless the scenario passed.
	#[track_caller]
	pub fn assert_passed(&self) {
		assert!(self.passed(), "{self}");
	}
}

impl fmt::Display for ScenarioReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let verdict = match (self.passed(), self.aborted) {
			(true, _) => "PASS",
			(false, false) => "FAIL",
			(false, true) => "FAIL (aborted)",
		};
		writeln!(f, "{verdict} {}", self.name)?;
		for failure in &self.failures {
			writeln!(f, "  - {}: {}", failure.step, failure.message)?;
		}
		Ok(())
	}
}

/// Render an error with its sources, `outer: inner: innermost`.
fn format_chain(err: &dyn std::error::Error) -> String {
	let mut message = err.to_string();
	let mut source = err.source();
	while let Some(cause) = source {
		message.push_str(": ");
		message.push_str(&cause.to_string());
		source = cause.source();
	}
	message
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_passing_report() {
		let mut report = ScenarioReport::new("crd");
		report.step("Creating CRD");
		assert_eq!(report.check::<u8>(Ok(1)), Some(1));

		assert!(report.passed());
		assert!(!report.aborted());
		assert_eq!(report.steps(), ["Creating CRD".to_string()]);
		assert_eq!(report.to_string(), "PASS crd\n");
		report.assert_passed();
	}

	#[test]
	fn test_failures_are_collected() {
		let mut report = ScenarioReport::new("shadow");
		report.step("first");
		report.check::<()>(Err(AssertionError::AlreadyExists {
			name: "foos.cr.bar.com".into(),
		}));
		report.step("second");
		report.check::<()>(Err(AssertionError::PresentInDiscovery {
			crd: "foos.networking.k8s.io".into(),
			group_version: "networking.k8s.io/v1".into(),
			resource: "foos".into(),
		}));

		assert!(!report.passed());
		assert!(!report.aborted());
		assert_eq!(report.failures().len(), 2);
		assert_eq!(report.failures()[0].step, "first");
		assert_eq!(report.failures()[1].step, "second");
		assert_eq!(
			report.to_string(),
			"FAIL shadow\n  - first: CRD foos.cr.bar.com already exists\n  - second: resource foos of CRD foos.networking.k8s.io shows up in discovery for networking.k8s.io/v1\n"
		);
	}

	#[test]
	fn test_require_aborts() {
		let mut report = ScenarioReport::new("setup");
		report.step("create");
		let value = report.require::<()>(Err(AssertionError::Count {
			what: "items".into(),
			expected: 0,
			found: 1,
		}));

		assert!(value.is_none());
		assert!(report.aborted());
		assert!(report.to_string().starts_with("FAIL (aborted) setup"));
	}

	#[test]
	#[should_panic(expected = "expected 0 items, found 2")]
	fn test_assert_passed_panics_with_failures() {
		let mut report = ScenarioReport::new("list");
		report.check::<()>(Err(AssertionError::Count {
			what: "items".into(),
			expected: 0,
			found: 2,
		}));
		report.assert_passed();
	}
}
