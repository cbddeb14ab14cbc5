//! Parsing of Kubernetes REST paths.

/// A request path broken into its resource coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
	pub group: String,
	pub version: String,
	pub namespace: Option<String>,
	pub resource: String,
	pub name: Option<String>,
}

/// Parse a Kubernetes API path.
///
/// Examples:
/// - `/api/v1/namespaces/default/configmaps/my-config`
/// - `/apis/apps/v1/namespaces/default/deployments`
/// - `/apis/apiextensions.k8s.io/v1/customresourcedefinitions/foos.cr.bar.com`
/// - `/api/v1/namespaces/my-ns` (the namespace object itself)
///
/// Returns `None` for discovery paths and subresources.
pub fn parse_resource_path(path: &str) -> Option<ResourcePath> {
	let segments: Vec<&str> = path
		.trim_end_matches('/')
		.split('/')
		.filter(|s| !s.is_empty())
		.collect();

	let (group, version, rest) = match segments.as_slice() {
		["api", version, rest @ ..] => ("", *version, rest),
		["apis", group, version, rest @ ..] => (*group, *version, rest),
		_ => return None,
	};

	let (namespace, resource, name) = match rest {
		["namespaces", ns, resource] => (Some(*ns), *resource, None),
		["namespaces", ns, resource, name] => (Some(*ns), *resource, Some(*name)),
		[resource] => (None, *resource, None),
		[resource, name] => (None, *resource, Some(*name)),
		_ => return None,
	};

	Some(ResourcePath {
		group: group.to_string(),
		version: version.to_string(),
		namespace: namespace.map(str::to_string),
		resource: resource.to_string(),
		name: name.map(str::to_string),
	})
}

/// Parse a group-version discovery path such as `/apis/apps/v1`.
pub fn parse_group_version_path(path: &str) -> Option<(String, String)> {
	let rest = path.trim_end_matches('/').strip_prefix("/apis/")?;
	let (group, version) = rest.split_once('/')?;
	if group.is_empty() || version.is_empty() || version.contains('/') {
		return None;
	}
	Some((group.to_string(), version.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_namespaced_item() {
		let parsed =
			parse_resource_path("/apis/networking.k8s.io/v1/namespaces/default/networkpolicies/abc")
				.unwrap();
		assert_eq!(
			parsed,
			ResourcePath {
				group: "networking.k8s.io".into(),
				version: "v1".into(),
				namespace: Some("default".into()),
				resource: "networkpolicies".into(),
				name: Some("abc".into()),
			}
		);
	}

	#[test]
	fn test_parse_namespaced_collection() {
		let parsed = parse_resource_path("/apis/cr.bar.com/v1/namespaces/default/foos").unwrap();
		assert_eq!(parsed.namespace.as_deref(), Some("default"));
		assert_eq!(parsed.resource, "foos");
		assert_eq!(parsed.name, None);
	}

	#[test]
	fn test_parse_core_namespace_object() {
		// Two segments after the version: the namespace object, not a collection
		let parsed = parse_resource_path("/api/v1/namespaces/default").unwrap();
		assert_eq!(parsed.group, "");
		assert_eq!(parsed.namespace, None);
		assert_eq!(parsed.resource, "namespaces");
		assert_eq!(parsed.name.as_deref(), Some("default"));
	}

	#[test]
	fn test_parse_cluster_scoped() {
		let parsed = parse_resource_path(
			"/apis/apiextensions.k8s.io/v1/customresourcedefinitions/foos.cr.bar.com/",
		)
		.unwrap();
		assert_eq!(parsed.group, "apiextensions.k8s.io");
		assert_eq!(parsed.namespace, None);
		assert_eq!(parsed.name.as_deref(), Some("foos.cr.bar.com"));
	}

	#[test]
	fn test_parse_rejects_discovery_and_subresources() {
		assert_eq!(parse_resource_path("/api"), None);
		assert_eq!(parse_resource_path("/api/v1"), None);
		assert_eq!(parse_resource_path("/apis/apps/v1"), None);
		assert_eq!(
			parse_resource_path("/apis/apps/v1/namespaces/default/deployments/web/status"),
			None
		);
	}

	#[test]
	fn test_parse_group_version_path() {
		assert_eq!(
			parse_group_version_path("/apis/networking.k8s.io/v1"),
			Some(("networking.k8s.io".into(), "v1".into()))
		);
		assert_eq!(parse_group_version_path("/apis/apps"), None);
		assert_eq!(parse_group_version_path("/apis/apps/v1/deployments"), None);
		assert_eq!(parse_group_version_path("/api/v1"), None);
	}
}
