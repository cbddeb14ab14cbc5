//! Error types of the harness.
//!
//! [`HarnessError`] is fatal: the server or client could not be set up and
//! nothing else can run. [`AssertionError`] describes one failed check; a
//! scenario records it and keeps going.

use std::time::Duration;

use kube::config::KubeconfigError;
use thiserror::Error;

use crate::{config::ConfigError, discovery::DiscoveryError, wait::WaitError};

/// Setup failures.
#[derive(Debug, Error)]
pub enum HarnessError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error("failed to build Kubernetes client")]
	Client(#[source] kube::Error),

	#[error("API server at {server} is unreachable")]
	Unreachable {
		server: String,
		#[source]
		source: kube::Error,
	},
}

/// A check that did not hold, with enough context to diagnose it from the
/// client side alone.
#[derive(Debug, Error)]
pub enum AssertionError {
	#[error("failed to {operation} {object}")]
	Request {
		operation: &'static str,
		object: String,
		#[source]
		source: kube::Error,
	},

	#[error("failed to encode {object}")]
	Encode {
		object: String,
		#[source]
		source: serde_json::Error,
	},

	#[error("CRD {name} already exists")]
	AlreadyExists { name: String },

	#[error("CRD {name} was rejected ({code}): {message}")]
	Rejected {
		name: String,
		code: u16,
		message: String,
	},

	#[error("CRD {name} names were not accepted: {message}")]
	NamesNotAccepted { name: String, message: String },

	#[error("{object} is no longer retrievable")]
	NotVisible {
		object: String,
		#[source]
		source: kube::Error,
	},

	#[error("resource {resource} of CRD {crd} shows up in discovery for {group_version}")]
	PresentInDiscovery {
		crd: String,
		group_version: String,
		resource: String,
	},

	#[error("discovery for group {group} changed: {before:?} became {after:?}")]
	GroupChanged {
		group: String,
		before: Vec<String>,
		after: Vec<String>,
	},

	#[error("expected {expected} {what}, found {found}")]
	Count {
		what: String,
		expected: usize,
		found: usize,
	},

	#[error("timed out after {elapsed:?} waiting for {operation}")]
	Timeout { operation: String, elapsed: Duration },

	#[error("{operation} stopped holding after {elapsed:?}")]
	NotConsistent { operation: String, elapsed: Duration },

	#[error(transparent)]
	Discovery(#[from] DiscoveryError),
}

impl AssertionError {
	pub(crate) fn request(operation: &'static str, object: impl Into<String>, source: kube::Error) -> Self {
		Self::Request {
			operation,
			object: object.into(),
			source,
		}
	}
}

impl From<WaitError<AssertionError>> for AssertionError {
	fn from(e: WaitError<AssertionError>) -> Self {
		match e {
			WaitError::Failed(inner) => inner,
			WaitError::Timeout {
				operation, elapsed, ..
			} => Self::Timeout { operation, elapsed },
			WaitError::Violated { operation, elapsed } => Self::NotConsistent { operation, elapsed },
		}
	}
}

/// Whether a kube error is an API response with the given HTTP status code.
pub fn is_status(err: &kube::Error, code: u16) -> bool {
	matches!(err, kube::Error::Api(resp) if resp.code == code)
}
