//! In-memory cluster state behind the HTTP handlers.
//!
//! Holds stored objects and registered CustomResourceDefinitions, and decides
//! which resources are routable and which are listed in discovery at a given
//! instant. CRD registration propagates in two steps measured from creation:
//! after `establish_delay` the CRD is established and its resource routable,
//! after a further `discovery_delay` the resource appears in discovery.
//!
//! A CRD whose group is owned by a built-in API group is handled according to
//! [`BuiltinGroupCrds`]. By default it is accepted and established, but never
//! routed and never listed: the built-in group wins.

use std::{
	collections::BTreeMap,
	time::{Duration, Instant},
};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::{
	catalog::{
		join_group_version, split_group_version, ApiResourceDef, BuiltinCatalog,
		BuiltinGroupCrds, APIEXTENSIONS_GROUP, API_APPROVAL_ANNOTATION, CRD_RESOURCE,
	},
	route::ResourcePath,
	status::ApiError,
};

/// Delays applied to CRD registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Propagation {
	pub establish_delay: Duration,
	pub discovery_delay: Duration,
}

/// Served groups: group -> version -> resources.
pub type GroupIndex = BTreeMap<String, BTreeMap<String, Vec<ApiResourceDef>>>;

/// Storage key of an object. Version-independent, like etcd keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
	group: String,
	resource: String,
	namespace: Option<String>,
	name: String,
}

#[derive(Debug)]
struct CrdRecord {
	manifest: Value,
	group: String,
	versions: Vec<String>,
	resource: ApiResourceDef,
	created_at: Instant,
	sequence: u64,
}

/// What a request path resolves to.
enum Target {
	Crds,
	Resource(ApiResourceDef),
}

/// All mutable state of one mock server.
#[derive(Debug)]
pub struct ClusterState {
	catalog: BuiltinCatalog,
	propagation: Propagation,
	builtin_group_crds: BuiltinGroupCrds,
	crds: BTreeMap<String, CrdRecord>,
	objects: BTreeMap<ObjectKey, Value>,
	resource_version: u64,
}

impl ClusterState {
	pub fn new(catalog: BuiltinCatalog, propagation: Propagation) -> Self {
		Self {
			catalog,
			propagation,
			builtin_group_crds: BuiltinGroupCrds::default(),
			crds: BTreeMap::new(),
			objects: BTreeMap::new(),
			resource_version: 0,
		}
	}

	#[must_use]
	pub fn with_builtin_group_crds(mut self, policy: BuiltinGroupCrds) -> Self {
		self.builtin_group_crds = policy;
		self
	}

	pub fn catalog(&self) -> &BuiltinCatalog {
		&self.catalog
	}

	/// Names of all registered CRDs, established or not.
	pub fn crd_names(&self) -> Vec<String> {
		self.crds.keys().cloned().collect()
	}

	/// Insert a manifest as pre-existing cluster state.
	///
	/// Built-in kinds are stored directly. CRDs are registered as if their
	/// propagation had already completed. Unknown kinds are skipped.
	pub fn seed(&mut self, manifest: Value, now: Instant) -> bool {
		let Some(api_version) = manifest.get("apiVersion").and_then(Value::as_str) else {
			return false;
		};
		let Some(kind) = manifest.get("kind").and_then(Value::as_str) else {
			return false;
		};

		if api_version == format!("{APIEXTENSIONS_GROUP}/v1") && kind == "CustomResourceDefinition" {
			let settled = self.propagation.establish_delay + self.propagation.discovery_delay;
			let created_at = now.checked_sub(settled).unwrap_or(now);
			return match self.create_crd(manifest, created_at) {
				Ok(_) => true,
				Err(e) => {
					warn!(error = %e.message(), "Skipping seeded CRD");
					false
				}
			};
		}

		let Some(def) = self.catalog.resource_for_kind(api_version, kind).cloned() else {
			debug!(api_version, kind, "Skipping manifest of unknown kind");
			return false;
		};
		let (group, version) = split_group_version(api_version);
		let namespace = manifest
			.pointer("/metadata/namespace")
			.and_then(Value::as_str)
			.unwrap_or("default")
			.to_string();
		let path = ResourcePath {
			group: group.to_string(),
			version: version.to_string(),
			namespace: def.namespaced.then_some(namespace),
			resource: def.name.clone(),
			name: None,
		};
		self.create_object(&def, &path, manifest).is_ok()
	}

	/// Handle GET on an item or a collection.
	pub fn get(&self, path: &ResourcePath, now: Instant) -> Result<(u16, Value), ApiError> {
		match (self.resolve(path, now)?, &path.name) {
			(Target::Crds, Some(name)) => {
				let record = self.crds.get(name).ok_or_else(|| crd_not_found(name))?;
				Ok((200, self.render_crd(record, now)))
			}
			(Target::Crds, None) => {
				let items = self
					.crds
					.values()
					.map(|record| self.render_crd(record, now))
					.collect();
				Ok((200, self.list_body("CustomResourceDefinitionList", &crd_api_version(), items)))
			}
			(Target::Resource(def), Some(name)) => {
				let key = object_key(path, name);
				let object = self
					.objects
					.get(&key)
					.ok_or_else(|| object_not_found(path, &def, name))?;
				Ok((200, object.clone()))
			}
			(Target::Resource(def), None) => {
				let items = self
					.objects
					.iter()
					.filter(|(key, _)| {
						key.group == path.group
							&& key.resource == def.name
							&& (path.namespace.is_none() || key.namespace == path.namespace)
					})
					.map(|(_, object)| object.clone())
					.collect();
				let api_version = join_group_version(&path.group, &path.version);
				Ok((200, self.list_body(&format!("{}List", def.kind), &api_version, items)))
			}
		}
	}

	/// Handle POST on a collection.
	pub fn create(
		&mut self,
		path: &ResourcePath,
		body: Value,
		now: Instant,
	) -> Result<(u16, Value), ApiError> {
		if path.name.is_some() {
			return Err(ApiError::BadRequest(
				"create is only allowed on collections".to_string(),
			));
		}
		match self.resolve(path, now)? {
			Target::Crds => self.create_crd(body, now).map(|created| (201, created)),
			Target::Resource(def) => self.create_object(&def, path, body).map(|created| (201, created)),
		}
	}

	/// Handle DELETE on an item.
	pub fn delete(&mut self, path: &ResourcePath, now: Instant) -> Result<(u16, Value), ApiError> {
		let Some(name) = &path.name else {
			return Err(ApiError::BadRequest(
				"collection deletion is not supported".to_string(),
			));
		};
		match self.resolve(path, now)? {
			Target::Crds => self.delete_crd(name, now).map(|deleted| (200, deleted)),
			Target::Resource(def) => {
				let key = object_key(path, name);
				let deleted = self
					.objects
					.remove(&key)
					.ok_or_else(|| object_not_found(path, &def, name))?;
				self.bump_resource_version();
				Ok((200, deleted))
			}
		}
	}

	/// Non-core groups with their served versions and resources, as listed in
	/// discovery at `now`.
	pub fn discovery_groups(&self, now: Instant) -> GroupIndex {
		let mut groups = GroupIndex::new();

		for (gv, resources) in &self.catalog.group_resources {
			let (group, version) = split_group_version(gv);
			groups
				.entry(group.to_string())
				.or_default()
				.entry(version.to_string())
				.or_default()
				.extend(resources.iter().cloned());
		}

		for record in self.crds.values().filter(|r| self.is_discoverable(r, now)) {
			let versions = groups.entry(record.group.clone()).or_default();
			for version in &record.versions {
				versions
					.entry(version.clone())
					.or_default()
					.push(record.resource.clone());
			}
		}

		groups
	}

	/// Resources listed in discovery for one group version, if it is served.
	pub fn discovery_resources(
		&self,
		group: &str,
		version: &str,
		now: Instant,
	) -> Option<Vec<ApiResourceDef>> {
		if group.is_empty() {
			return self.catalog.resources_for(group, version).map(<[_]>::to_vec);
		}
		self.discovery_groups(now).remove(group)?.remove(version)
	}

	fn resolve(&self, path: &ResourcePath, now: Instant) -> Result<Target, ApiError> {
		if path.group == APIEXTENSIONS_GROUP && path.resource == CRD_RESOURCE {
			if path.version != "v1" || path.namespace.is_some() {
				return Err(ApiError::unserved());
			}
			return Ok(Target::Crds);
		}

		let builtin = self
			.catalog
			.resource(&path.group, &path.version, &path.resource)
			.cloned();
		let def = match builtin {
			Some(def) => def,
			None if self.serves_crds_in(&path.group) => self
				.crds
				.values()
				.find(|r| {
					r.group == path.group
						&& r.resource.name == path.resource
						&& r.versions.contains(&path.version)
						&& self.is_established(r, now)
				})
				.map(|r| r.resource.clone())
				.ok_or_else(ApiError::unserved)?,
			None => return Err(ApiError::unserved()),
		};

		// Item requests must match the resource scope; namespaced collections
		// may also be listed across all namespaces.
		let scope_matches = match (def.namespaced, &path.namespace, &path.name) {
			(true, None, Some(_)) => false,
			(false, Some(_), _) => false,
			_ => true,
		};
		if !scope_matches {
			return Err(ApiError::unserved());
		}
		Ok(Target::Resource(def))
	}

	fn create_crd(&mut self, mut body: Value, now: Instant) -> Result<Value, ApiError> {
		let parsed = parse_crd(&body)?;

		if self.crds.contains_key(&parsed.name) {
			return Err(ApiError::AlreadyExists(format!(
				"{CRD_RESOURCE}.{APIEXTENSIONS_GROUP} \"{}\" already exists",
				parsed.name
			)));
		}

		if self.catalog.owns_group(&parsed.group) {
			let approved = body
				.pointer("/metadata/annotations")
				.and_then(Value::as_object)
				.is_some_and(|a| a.contains_key(API_APPROVAL_ANNOTATION));
			match self.builtin_group_crds {
				BuiltinGroupCrds::Reject if !approved => {
					return Err(ApiError::Invalid(format!(
						"{CRD_RESOURCE}.{APIEXTENSIONS_GROUP} \"{}\" is invalid: \
						 metadata.annotations[{API_APPROVAL_ANNOTATION}]: Required value: \
						 protected groups must have approval annotation \"{API_APPROVAL_ANNOTATION}\"",
						parsed.name
					)));
				}
				BuiltinGroupCrds::Merge => warn!(
					crd = %parsed.name,
					group = %parsed.group,
					"CRD targets a built-in group, merging it into the group"
				),
				_ => warn!(
					crd = %parsed.name,
					group = %parsed.group,
					"CRD targets a built-in group, it will not be served"
				),
			}
		}

		let resource_version = self.bump_resource_version();
		stamp_metadata(&mut body, resource_version, None)?;
		strip_status(&mut body);

		info!(crd = %parsed.name, group = %parsed.group, "Registered CRD");
		let record = CrdRecord {
			manifest: body,
			group: parsed.group,
			versions: parsed.versions,
			resource: parsed.resource,
			created_at: now,
			sequence: resource_version,
		};
		let rendered = self.render_crd(&record, now);
		self.crds.insert(parsed.name, record);
		Ok(rendered)
	}

	fn delete_crd(&mut self, name: &str, now: Instant) -> Result<Value, ApiError> {
		let record = self.crds.remove(name).ok_or_else(|| crd_not_found(name))?;
		let rendered = self.render_crd(&record, now);

		// Objects of a shadowed CRD never existed; the built-in group's own
		// objects must survive.
		let builtin_resource = record
			.versions
			.iter()
			.any(|v| self.catalog.resource(&record.group, v, &record.resource.name).is_some());
		if self.serves_crds_in(&record.group) && !builtin_resource {
			let before = self.objects.len();
			self.objects
				.retain(|key, _| !(key.group == record.group && key.resource == record.resource.name));
			debug!(crd = %name, removed = before - self.objects.len(), "Removed custom objects");
		}

		self.bump_resource_version();
		info!(crd = %name, "Deleted CRD");
		Ok(rendered)
	}

	fn create_object(
		&mut self,
		def: &ApiResourceDef,
		path: &ResourcePath,
		mut body: Value,
	) -> Result<Value, ApiError> {
		let name = body
			.pointer("/metadata/name")
			.and_then(Value::as_str)
			.filter(|n| !n.is_empty())
			.ok_or_else(|| {
				ApiError::Invalid(format!(
					"{} is invalid: metadata.name: Required value: name is required",
					def.kind
				))
			})?
			.to_string();

		let namespace = if def.namespaced {
			let request_ns = path.namespace.clone().ok_or_else(ApiError::unserved)?;
			match body.pointer("/metadata/namespace").and_then(Value::as_str) {
				Some(body_ns) if body_ns != request_ns => {
					return Err(ApiError::BadRequest(
						"the namespace of the provided object does not match the namespace sent on the request"
							.to_string(),
					));
				}
				_ => Some(request_ns),
			}
		} else {
			None
		};

		let key = ObjectKey {
			group: path.group.clone(),
			resource: def.name.clone(),
			namespace: namespace.clone(),
			name: name.clone(),
		};
		if self.objects.contains_key(&key) {
			return Err(ApiError::AlreadyExists(format!(
				"{} \"{}\" already exists",
				qualified_resource(&path.group, &def.name),
				name
			)));
		}

		let resource_version = self.bump_resource_version();
		stamp_metadata(&mut body, resource_version, namespace.as_deref())?;
		if let Some(object) = body.as_object_mut() {
			object
				.entry("apiVersion")
				.or_insert_with(|| json!(join_group_version(&path.group, &path.version)));
			object.entry("kind").or_insert_with(|| json!(def.kind));
		}

		debug!(resource = %def.name, name = %name, namespace = ?namespace, "Created object");
		self.objects.insert(key, body.clone());
		Ok(body)
	}

	fn is_established(&self, record: &CrdRecord, now: Instant) -> bool {
		self.names_accepted(record) && now >= record.created_at + self.propagation.establish_delay
	}

	fn is_discoverable(&self, record: &CrdRecord, now: Instant) -> bool {
		self.is_established(record, now)
			&& self.serves_crds_in(&record.group)
			&& now
				>= record.created_at
					+ self.propagation.establish_delay
					+ self.propagation.discovery_delay
	}

	/// Whether CRDs of `group` are routed and listed.
	fn serves_crds_in(&self, group: &str) -> bool {
		!self.catalog.owns_group(group) || self.builtin_group_crds == BuiltinGroupCrds::Merge
	}

	/// A kind may only be claimed by the oldest CRD of a group.
	fn names_accepted(&self, record: &CrdRecord) -> bool {
		!self.crds.values().any(|other| {
			other.sequence < record.sequence
				&& other.group == record.group
				&& other.resource.kind == record.resource.kind
		})
	}

	fn render_crd(&self, record: &CrdRecord, now: Instant) -> Value {
		let accepted = self.names_accepted(record);
		let established = self.is_established(record, now);

		let names_condition = if accepted {
			condition("NamesAccepted", true, "NoConflicts", "no conflicts found")
		} else {
			condition(
				"NamesAccepted",
				false,
				"KindConflict",
				&format!("\"{}\" is already in use", record.resource.kind),
			)
		};
		let established_condition = match (accepted, established) {
			(_, true) => condition(
				"Established",
				true,
				"InitialNamesAccepted",
				"the initial names have been accepted",
			),
			(true, false) => condition("Established", false, "Installing", "the initial names have been accepted"),
			(false, false) => condition("Established", false, "NotAccepted", "not all names are accepted"),
		};

		let accepted_names = if accepted {
			json!({"plural": record.resource.name, "kind": record.resource.kind})
		} else {
			json!({"plural": "", "kind": ""})
		};

		let mut rendered = record.manifest.clone();
		if let Some(object) = rendered.as_object_mut() {
			object.insert(
				"status".to_string(),
				json!({
					"conditions": [names_condition, established_condition],
					"acceptedNames": accepted_names,
					"storedVersions": record.versions,
				}),
			);
		}
		rendered
	}

	fn list_body(&self, kind: &str, api_version: &str, items: Vec<Value>) -> Value {
		json!({
			"kind": kind,
			"apiVersion": api_version,
			"metadata": {"resourceVersion": self.resource_version.to_string()},
			"items": items,
		})
	}

	fn bump_resource_version(&mut self) -> u64 {
		self.resource_version += 1;
		self.resource_version
	}
}

struct ParsedCrd {
	name: String,
	group: String,
	versions: Vec<String>,
	resource: ApiResourceDef,
}

fn parse_crd(body: &Value) -> Result<ParsedCrd, ApiError> {
	let field = |pointer: &str| {
		body.pointer(pointer)
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
	};
	let invalid = |name: &str, detail: &str| {
		ApiError::Invalid(format!(
			"CustomResourceDefinition.{APIEXTENSIONS_GROUP} \"{name}\" is invalid: {detail}"
		))
	};

	let name = field("/metadata/name")
		.ok_or_else(|| invalid("", "metadata.name: Required value: name is required"))?;
	let group = field("/spec/group")
		.ok_or_else(|| invalid(&name, "spec.group: Required value"))?;
	let plural = field("/spec/names/plural")
		.ok_or_else(|| invalid(&name, "spec.names.plural: Required value"))?;
	let kind = field("/spec/names/kind")
		.ok_or_else(|| invalid(&name, "spec.names.kind: Required value"))?;

	if name != format!("{plural}.{group}") {
		return Err(invalid(
			&name,
			&format!(
				"metadata.name: Invalid value: \"{name}\": must be spec.names.plural+\".\"+spec.group"
			),
		));
	}

	let namespaced = match field("/spec/scope").as_deref() {
		Some("Namespaced") => true,
		Some("Cluster") => false,
		other => {
			return Err(invalid(
				&name,
				&format!(
					"spec.scope: Unsupported value: \"{}\": supported values: \"Cluster\", \"Namespaced\"",
					other.unwrap_or_default()
				),
			));
		}
	};

	let versions: Vec<String> = body
		.pointer("/spec/versions")
		.and_then(Value::as_array)
		.into_iter()
		.flatten()
		.filter(|v| v.get("served").and_then(Value::as_bool).unwrap_or(true))
		.filter_map(|v| v.get("name").and_then(Value::as_str))
		.map(str::to_string)
		.collect();
	if versions.is_empty() {
		return Err(invalid(
			&name,
			"spec.versions: Invalid value: must have at least one served version",
		));
	}

	let resource = if namespaced {
		ApiResourceDef::namespaced(&plural, &kind)
	} else {
		ApiResourceDef::cluster_scoped(&plural, &kind)
	};

	Ok(ParsedCrd {
		name,
		group,
		versions,
		resource,
	})
}

fn stamp_metadata(
	body: &mut Value,
	resource_version: u64,
	namespace: Option<&str>,
) -> Result<(), ApiError> {
	let metadata = body
		.get_mut("metadata")
		.and_then(Value::as_object_mut)
		.ok_or_else(|| ApiError::BadRequest("object has no metadata".to_string()))?;
	metadata.insert("resourceVersion".to_string(), json!(resource_version.to_string()));
	metadata
		.entry("uid")
		.or_insert_with(|| json!(format!("00000000-0000-4000-8000-{resource_version:012x}")));
	if let Some(ns) = namespace {
		metadata.insert("namespace".to_string(), json!(ns));
	}
	Ok(())
}

fn strip_status(body: &mut Value) {
	if let Some(object) = body.as_object_mut() {
		object.remove("status");
	}
}

fn condition(type_: &str, status: bool, reason: &str, message: &str) -> Value {
	let mut c = Map::new();
	c.insert("type".into(), json!(type_));
	c.insert("status".into(), json!(if status { "True" } else { "False" }));
	c.insert("reason".into(), json!(reason));
	c.insert("message".into(), json!(message));
	Value::Object(c)
}

fn object_key(path: &ResourcePath, name: &str) -> ObjectKey {
	ObjectKey {
		group: path.group.clone(),
		resource: path.resource.clone(),
		namespace: path.namespace.clone(),
		name: name.to_string(),
	}
}

fn qualified_resource(group: &str, resource: &str) -> String {
	if group.is_empty() {
		resource.to_string()
	} else {
		format!("{resource}.{group}")
	}
}

fn object_not_found(path: &ResourcePath, def: &ApiResourceDef, name: &str) -> ApiError {
	ApiError::NotFound(format!(
		"{} \"{}\" not found",
		qualified_resource(&path.group, &def.name),
		name
	))
}

fn crd_not_found(name: &str) -> ApiError {
	ApiError::NotFound(format!(
		"{CRD_RESOURCE}.{APIEXTENSIONS_GROUP} \"{name}\" not found"
	))
}

fn crd_api_version() -> String {
	format!("{APIEXTENSIONS_GROUP}/v1")
}
