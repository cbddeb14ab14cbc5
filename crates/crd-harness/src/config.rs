//! Harness configuration.
//!
//! Loaded from a YAML file (camelCase keys) or built in code. Every field has
//! a default, so an empty file targets a fresh in-process mock server.
//!
//! ```yaml
//! target:
//!   kind: kubeconfig
//!   path: /tmp/envtest.kubeconfig
//!   context: envtest
//! establishTimeoutMs: 60000
//! settleWindowMs: 2000
//! aliasingCrdAnnotations:
//!   api-approved.kubernetes.io: "unapproved, conformance testing"
//! ```

use std::{
	collections::BTreeMap,
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use apiserver_mock::BuiltinGroupCrds;
use serde::Deserialize;
use thiserror::Error;

use crate::wait::WaitConfig;

/// Errors that can occur while loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_yaml::Error,
	},
}

/// Root of the harness configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HarnessConfig {
	/// Which API server to run against
	pub target: TargetConfig,
	/// Namespace for namespaced scenario objects
	pub namespace: String,
	/// How long to wait for a CRD to become established or routable
	pub establish_timeout_ms: u64,
	/// How long a CRD must stay absent from a foreign group's discovery
	pub settle_window_ms: u64,
	/// Initial delay between polls
	pub poll_interval_ms: u64,
	/// Read timeout of individual API requests
	pub api_timeout_ms: u64,
	/// Annotations put on the CRD that claims a built-in group. Servers
	/// reject such a CRD unless it is approved; approving it checks isolation
	/// instead of rejection.
	pub aliasing_crd_annotations: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
	fn default() -> Self {
		Self {
			target: TargetConfig::default(),
			namespace: "default".to_string(),
			establish_timeout_ms: 30_000,
			settle_window_ms: 2_000,
			poll_interval_ms: 50,
			api_timeout_ms: 30_000,
			aliasing_crd_annotations: BTreeMap::new(),
		}
	}
}

/// The API server under test.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TargetConfig {
	/// A fresh in-process mock server per handle
	Mock(MockTarget),
	/// An existing cluster reached through a kubeconfig
	Kubeconfig(KubeconfigTarget),
}

impl Default for TargetConfig {
	fn default() -> Self {
		Self::Mock(MockTarget::default())
	}
}

/// Settings of the in-process mock server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MockTarget {
	/// Serve only legacy discovery
	pub legacy_discovery: bool,
	/// Time from CRD creation to `Established=True`
	pub establish_delay_ms: u64,
	/// Additional time before an established CRD appears in discovery
	pub discovery_delay_ms: u64,
	/// Treatment of CRDs claiming a built-in group
	pub builtin_group_crds: BuiltinGroupCrds,
}

impl Default for MockTarget {
	fn default() -> Self {
		Self {
			legacy_discovery: false,
			establish_delay_ms: 100,
			discovery_delay_ms: 150,
			builtin_group_crds: BuiltinGroupCrds::Isolate,
		}
	}
}

/// Connection to an existing cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeconfigTarget {
	/// Kubeconfig file; `$KUBECONFIG` or `~/.kube/config` when unset
	pub path: Option<PathBuf>,
	/// Context name; the current context when unset
	pub context: Option<String>,
}

impl HarnessConfig {
	/// Load a config file.
	pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
		let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Parse YAML config text. An empty document yields the defaults.
	pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
		if contents.trim().is_empty() {
			return Ok(Self::default());
		}
		serde_yaml::from_str(contents)
	}

	pub fn establish_timeout(&self) -> Duration {
		Duration::from_millis(self.establish_timeout_ms)
	}

	pub fn settle_window(&self) -> Duration {
		Duration::from_millis(self.settle_window_ms)
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn api_timeout(&self) -> Duration {
		Duration::from_millis(self.api_timeout_ms)
	}

	/// Backoff used when waiting for CRD propagation.
	pub fn wait_config(&self) -> WaitConfig {
		WaitConfig {
			timeout: self.establish_timeout(),
			initial_delay: self.poll_interval(),
			max_delay: (self.poll_interval() * 16).max(Duration::from_millis(500)),
			backoff_multiplier: 2.0,
		}
	}
}
