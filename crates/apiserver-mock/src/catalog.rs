//! Built-in API groups served by the mock server.
//!
//! The catalog is fixed for the lifetime of a server. Custom resources
//! registered at runtime only extend a group that appears here when the
//! server runs with [`BuiltinGroupCrds::Merge`].

use std::collections::BTreeMap;

use serde::Deserialize;

/// Discovery mode for the mock server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

/// How the server treats a CRD whose group is a built-in API group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuiltinGroupCrds {
	/// Accept and establish the CRD, but never list or route it.
	#[default]
	Isolate,
	/// Reject the CRD with 422 unless it carries the API approval
	/// annotation, as real servers do for protected groups. Approved CRDs are
	/// isolated.
	Reject,
	/// Serve the CRD alongside the built-in resources. No conforming server
	/// does this; it exists to exercise failure reporting.
	Merge,
}

/// Annotation a CRD in a protected group must carry to be admitted.
pub const API_APPROVAL_ANNOTATION: &str = "api-approved.kubernetes.io";

/// Group name of the CustomResourceDefinition API.
pub const APIEXTENSIONS_GROUP: &str = "apiextensions.k8s.io";
/// Plural resource name of CustomResourceDefinitions.
pub const CRD_RESOURCE: &str = "customresourcedefinitions";

/// Resources compiled into the server, keyed by `group/version`.
///
/// The core group is kept apart because it is served under `/api` rather
/// than `/apis`.
#[derive(Debug, Clone)]
pub struct BuiltinCatalog {
	pub core_resources: Vec<ApiResourceDef>,
	pub group_resources: BTreeMap<String, Vec<ApiResourceDef>>,
}

impl Default for BuiltinCatalog {
	fn default() -> Self {
		Self {
			core_resources: vec![
				ApiResourceDef::namespaced("configmaps", "ConfigMap"),
				ApiResourceDef::namespaced("secrets", "Secret"),
				ApiResourceDef::namespaced("services", "Service"),
				ApiResourceDef::namespaced("pods", "Pod"),
				ApiResourceDef::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: BTreeMap::from([
				(
					"apps/v1".to_string(),
					vec![
						ApiResourceDef::namespaced("deployments", "Deployment"),
						ApiResourceDef::namespaced("statefulsets", "StatefulSet"),
						ApiResourceDef::namespaced("daemonsets", "DaemonSet"),
					],
				),
				(
					"networking.k8s.io/v1".to_string(),
					vec![
						ApiResourceDef::namespaced("networkpolicies", "NetworkPolicy"),
						ApiResourceDef::namespaced("ingresses", "Ingress"),
					],
				),
				(
					format!("{APIEXTENSIONS_GROUP}/v1"),
					vec![ApiResourceDef::cluster_scoped(
						CRD_RESOURCE,
						"CustomResourceDefinition",
					)],
				),
			]),
		}
	}
}

impl BuiltinCatalog {
	/// Whether `group` is owned by the server itself.
	///
	/// The core group (`""`) always counts as built-in.
	pub fn owns_group(&self, group: &str) -> bool {
		group.is_empty()
			|| self
				.group_resources
				.keys()
				.any(|gv| split_group_version(gv).0 == group)
	}

	/// Look up a built-in resource by group, version and plural name.
	pub fn resource(&self, group: &str, version: &str, plural: &str) -> Option<&ApiResourceDef> {
		self.resources_for(group, version)?
			.iter()
			.find(|r| r.name == plural)
	}

	/// Look up a built-in resource by apiVersion and kind.
	pub fn resource_for_kind(&self, api_version: &str, kind: &str) -> Option<&ApiResourceDef> {
		let (group, version) = split_group_version(api_version);
		self.resources_for(group, version)?
			.iter()
			.find(|r| r.kind == kind)
	}

	/// All built-in resources of one group version.
	pub fn resources_for(&self, group: &str, version: &str) -> Option<&[ApiResourceDef]> {
		if group.is_empty() {
			return (version == "v1").then_some(self.core_resources.as_slice());
		}
		self.group_resources
			.get(&format!("{group}/{version}"))
			.map(Vec::as_slice)
	}
}

/// Split `apps/v1` into (`apps`, `v1`) and `v1` into (``, `v1`).
pub fn split_group_version(gv: &str) -> (&str, &str) {
	gv.split_once('/').unwrap_or(("", gv))
}

/// Join a group and version into an apiVersion string.
pub fn join_group_version(group: &str, version: &str) -> String {
	if group.is_empty() {
		version.to_string()
	} else {
		format!("{group}/{version}")
	}
}

/// A resource type as it appears in discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResourceDef {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

impl ApiResourceDef {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self::new(name, kind, true)
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self::new(name, kind, false)
	}

	fn new(name: &str, kind: &str, namespaced: bool) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced,
			verbs: ["create", "delete", "get", "list"]
				.into_iter()
				.map(String::from)
				.collect(),
		}
	}

	pub(crate) fn scope(&self) -> &'static str {
		if self.namespaced {
			"Namespaced"
		} else {
			"Cluster"
		}
	}
}
