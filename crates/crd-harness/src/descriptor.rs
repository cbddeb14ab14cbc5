//! Identifiers for the resources a scenario works with.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
	CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
	CustomResourceDefinitionVersion, CustomResourceValidation, JSONSchemaProps,
};
use kube::{api::ApiResource, core::GroupVersionKind, core::ObjectMeta};

/// Label marking CRDs created by the harness.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`] on harness-created CRDs.
pub const MANAGED_BY: &str = "crd-conformance";

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., NetworkPolicy, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, CustomResourceDefinition).
	ClusterWide,
}

impl ResourceScope {
	/// The value used in `CustomResourceDefinition.spec.scope`.
	pub fn as_crd_scope(self) -> &'static str {
		match self {
			Self::Namespaced => "Namespaced",
			Self::ClusterWide => "Cluster",
		}
	}
}

/// A group-version-resource triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvr {
	pub group: String,
	pub version: String,
	pub resource: String,
}

impl Gvr {
	pub fn new(group: &str, version: &str, resource: &str) -> Self {
		Self {
			group: group.to_string(),
			version: version.to_string(),
			resource: resource.to_string(),
		}
	}

	/// `group/version`, or just `version` for the core group.
	pub fn api_version(&self) -> String {
		if self.group.is_empty() {
			self.version.clone()
		} else {
			format!("{}/{}", self.group, self.version)
		}
	}

	/// An [`ApiResource`] for the dynamic client. `kind` only matters when
	/// creating objects.
	pub fn api_resource(&self, kind: &str) -> ApiResource {
		ApiResource::from_gvk_with_plural(
			&GroupVersionKind::gvk(&self.group, &self.version, kind),
			&self.resource,
		)
	}
}

impl fmt::Display for Gvr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.group.is_empty() {
			write!(f, "{}/{}", self.version, self.resource)
		} else {
			write!(f, "{}/{}/{}", self.group, self.version, self.resource)
		}
	}
}

/// A namespaced object to re-fetch later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
	pub namespace: String,
	pub name: String,
}

impl ResourceRef {
	pub fn new(namespace: &str, name: &str) -> Self {
		Self {
			namespace: namespace.to_string(),
			name: name.to_string(),
		}
	}
}

impl fmt::Display for ResourceRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.namespace, self.name)
	}
}

/// Everything needed to register one custom resource type.
///
/// The CRD name is always `<plural>.<group>`, so a descriptor whose group is a
/// built-in API group produces a CRD that tries to shadow that group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdDescriptor {
	pub group: String,
	pub version: String,
	pub scope: ResourceScope,
	pub plural: String,
	pub kind: String,
	/// Extra annotations on the CRD object, e.g. `api-approved.kubernetes.io`
	/// for protected groups
	pub annotations: BTreeMap<String, String>,
}

impl CrdDescriptor {
	pub fn new(group: &str, version: &str, scope: ResourceScope, plural: &str, kind: &str) -> Self {
		Self {
			group: group.to_string(),
			version: version.to_string(),
			scope,
			plural: plural.to_string(),
			kind: kind.to_string(),
			annotations: BTreeMap::new(),
		}
	}

	#[must_use]
	pub fn with_annotations(mut self, annotations: impl IntoIterator<Item = (String, String)>) -> Self {
		self.annotations.extend(annotations);
		self
	}

	pub fn name(&self) -> String {
		format!("{}.{}", self.plural, self.group)
	}

	pub fn gvr(&self) -> Gvr {
		Gvr::new(&self.group, &self.version, &self.plural)
	}

	pub fn api_resource(&self) -> ApiResource {
		self.gvr().api_resource(&self.kind)
	}

	/// Build the `apiextensions.k8s.io/v1` object for this descriptor.
	///
	/// The single version is served and stored, with a schema that accepts any
	/// fields. The object is labelled as managed by the harness.
	pub fn to_crd(&self) -> CustomResourceDefinition {
		CustomResourceDefinition {
			metadata: ObjectMeta {
				name: Some(self.name()),
				labels: Some(BTreeMap::from([(
					MANAGED_BY_LABEL.to_string(),
					MANAGED_BY.to_string(),
				)])),
				annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
				..Default::default()
			},
			spec: CustomResourceDefinitionSpec {
				group: self.group.clone(),
				names: CustomResourceDefinitionNames {
					plural: self.plural.clone(),
					kind: self.kind.clone(),
					..Default::default()
				},
				scope: self.scope.as_crd_scope().to_string(),
				versions: vec![CustomResourceDefinitionVersion {
					name: self.version.clone(),
					served: true,
					storage: true,
					schema: Some(CustomResourceValidation {
						open_api_v3_schema: Some(JSONSchemaProps {
							type_: Some("object".to_string()),
							x_kubernetes_preserve_unknown_fields: Some(true),
							..Default::default()
						}),
					}),
					..Default::default()
				}],
				..Default::default()
			},
			status: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_crd_name_and_gvr() {
		let foo = CrdDescriptor::new("cr.bar.com", "v1", ResourceScope::Namespaced, "foos", "Foo");
		assert_eq!(foo.name(), "foos.cr.bar.com");
		assert_eq!(foo.gvr(), Gvr::new("cr.bar.com", "v1", "foos"));
		assert_eq!(foo.gvr().to_string(), "cr.bar.com/v1/foos");
		assert_eq!(foo.gvr().api_version(), "cr.bar.com/v1");
	}

	#[test]
	fn test_to_crd() {
		let foo = CrdDescriptor::new(
			"networking.k8s.io",
			"v1",
			ResourceScope::ClusterWide,
			"foos",
			"Foo",
		);
		let crd = foo.to_crd();

		assert_eq!(crd.metadata.name.as_deref(), Some("foos.networking.k8s.io"));
		assert_eq!(crd.spec.group, "networking.k8s.io");
		assert_eq!(crd.spec.scope, "Cluster");
		assert_eq!(crd.spec.names.plural, "foos");
		assert_eq!(crd.spec.names.kind, "Foo");
		assert_eq!(crd.spec.versions.len(), 1);
		assert!(crd.spec.versions[0].served);
		assert!(crd.spec.versions[0].storage);
		assert_eq!(
			crd.metadata.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str),
			Some(MANAGED_BY)
		);
		assert_eq!(crd.metadata.annotations, None);
	}

	#[test]
	fn test_to_crd_with_annotations() {
		let foo = CrdDescriptor::new("networking.k8s.io", "v1", ResourceScope::ClusterWide, "foos", "Foo")
			.with_annotations([(
				"api-approved.kubernetes.io".to_string(),
				"unapproved, conformance testing".to_string(),
			)]);
		let annotations = foo.to_crd().metadata.annotations.unwrap();

		assert_eq!(
			annotations["api-approved.kubernetes.io"],
			"unapproved, conformance testing"
		);
	}

	#[test]
	fn test_crd_serializes_with_schema() {
		let foo = CrdDescriptor::new("cr.bar.com", "v1", ResourceScope::Namespaced, "foos", "Foo");
		let value = serde_json::to_value(foo.to_crd()).unwrap();

		assert_eq!(value["spec"]["scope"], "Namespaced");
		assert_eq!(
			value["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["x-kubernetes-preserve-unknown-fields"],
			true
		);
	}

	#[test]
	fn test_core_gvr_display() {
		let pods = Gvr::new("", "v1", "pods");
		assert_eq!(pods.api_version(), "v1");
		assert_eq!(pods.to_string(), "v1/pods");
	}

	#[test]
	fn test_api_resource() {
		let ar = Gvr::new("cr.bar.com", "v1", "foos").api_resource("Foo");
		assert_eq!(ar.api_version, "cr.bar.com/v1");
		assert_eq!(ar.plural, "foos");
		assert_eq!(ar.kind, "Foo");
	}
}
