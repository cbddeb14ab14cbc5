//! Snapshots of the server's discovery document.
//!
//! Built from the Aggregated Discovery API when the server supports it,
//! falling back to per-group legacy discovery otherwise.

use std::collections::BTreeMap;

use kube::{discovery::Scope, Client, Discovery};
use thiserror::Error;
use tracing::instrument;

use crate::descriptor::{Gvr, ResourceScope};

/// Errors that can occur during API resource discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),
}

/// Which group/version/resource triples a server currently serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryView {
	resources: BTreeMap<Gvr, DiscoveredResource>,
}

/// One served resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
	pub kind: String,
	pub scope: ResourceScope,
}

impl DiscoveryView {
	/// Query the server's discovery endpoints.
	#[instrument(skip(client))]
	pub async fn fetch(client: &Client) -> Result<Self, DiscoveryError> {
		// Try aggregated discovery first (2 API calls, K8s 1.26+)
		match Discovery::new(client.clone()).run_aggregated().await {
			Ok(discovery) => {
				tracing::debug!("using aggregated discovery");
				Ok(Self::from_discovery(&discovery))
			}
			Err(e) => {
				tracing::debug!(error = %e, "aggregated discovery not available, using full discovery");
				let discovery = Discovery::new(client.clone())
					.run()
					.await
					.map_err(DiscoveryError::FullDiscovery)?;
				Ok(Self::from_discovery(&discovery))
			}
		}
	}

	fn from_discovery(discovery: &Discovery) -> Self {
		let mut resources = BTreeMap::new();

		for group in discovery.groups() {
			// Every served version, not just the preferred one
			for ver in group.versions() {
				for (ar, caps) in group.versioned_resources(ver) {
					let scope = match caps.scope {
						Scope::Namespaced => ResourceScope::Namespaced,
						Scope::Cluster => ResourceScope::ClusterWide,
					};
					resources.insert(
						Gvr::new(&ar.group, &ar.version, &ar.plural),
						DiscoveredResource {
							kind: ar.kind,
							scope,
						},
					);
				}
			}
		}

		Self { resources }
	}

	/// Whether `gvr` is listed.
	pub fn contains(&self, gvr: &Gvr) -> bool {
		self.resources.contains_key(gvr)
	}

	pub fn get(&self, gvr: &Gvr) -> Option<&DiscoveredResource> {
		self.resources.get(gvr)
	}

	/// All listed resources of one API group, across versions, sorted.
	pub fn group_resources(&self, group: &str) -> Vec<&Gvr> {
		self.resources.keys().filter(|gvr| gvr.group == group).collect()
	}

	/// Iterate over all listed resources.
	pub fn iter(&self) -> impl Iterator<Item = (&Gvr, &DiscoveredResource)> {
		self.resources.iter()
	}
}

#[cfg(test)]
impl DiscoveryView {
	pub(crate) fn from_entries(entries: impl IntoIterator<Item = (Gvr, DiscoveredResource)>) -> Self {
		Self {
			resources: entries.into_iter().collect(),
		}
	}
}
