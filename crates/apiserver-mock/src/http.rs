//! HTTP front end of the mock API server, built on wiremock.
//!
//! Every test gets its own server on an ephemeral port with a clean store.
//! The listener is shut down when the [`RunningHttpMockApiServer`] is dropped.

use std::{
	sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
	time::{Duration, Instant},
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use crate::{
	catalog::{ApiResourceDef, BuiltinCatalog, BuiltinGroupCrds, DiscoveryMode},
	route::{parse_group_version_path, parse_resource_path},
	status::{respond, ApiError},
	store::{ClusterState, Propagation},
};

/// Default time between CRD creation and `Established=True`.
pub const DEFAULT_ESTABLISH_DELAY: Duration = Duration::from_millis(100);
/// Default additional time before an established CRD shows up in discovery.
pub const DEFAULT_DISCOVERY_DELAY: Duration = Duration::from_millis(150);

const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
	"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

// Aggregated discovery must win over legacy discovery, and discovery over
// the catch-all resource routes.
const PRIORITY_AGGREGATED: u8 = 1;
const PRIORITY_DISCOVERY: u8 = 2;
const PRIORITY_RESOURCES: u8 = 3;

/// Shared mutable cluster state.
pub type SharedState = Arc<RwLock<ClusterState>>;

/// A mock Kubernetes API server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockApiServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	/// Manifests to load as pre-existing cluster state. Built-in kinds and
	/// CustomResourceDefinitions are accepted.
	#[builder(default)]
	resources: Vec<Value>,
	#[builder(default = DEFAULT_ESTABLISH_DELAY)]
	establish_delay: Duration,
	#[builder(default = DEFAULT_DISCOVERY_DELAY)]
	discovery_delay: Duration,
	/// Treatment of CRDs that claim a built-in API group.
	#[builder(default)]
	builtin_group_crds: BuiltinGroupCrds,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockApiServer {
	server: MockServer,
	state: SharedState,
}

impl HttpMockApiServer {
	/// Start the mock server with a fresh store.
	pub async fn start(self) -> RunningHttpMockApiServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), mode = ?self.discovery_mode, "Started mock API server");

		let mut state = ClusterState::new(
			BuiltinCatalog::default(),
			Propagation {
				establish_delay: self.establish_delay,
				discovery_delay: self.discovery_delay,
			},
		)
		.with_builtin_group_crds(self.builtin_group_crds);

		let now = Instant::now();
		state.seed(
			json!({
				"apiVersion": "v1",
				"kind": "Namespace",
				"metadata": {"name": "default"}
			}),
			now,
		);
		for manifest in self.resources {
			if state.seed(manifest, now) {
				trace!("Seeded manifest");
			}
		}

		let state = Arc::new(RwLock::new(state));

		mount_version(&server).await;
		mount_discovery(&server, &state, self.discovery_mode).await;
		mount_resources(&server, &state).await;

		RunningHttpMockApiServer { server, state }
	}
}

impl RunningHttpMockApiServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Names of the CRDs currently registered.
	pub fn registered_crds(&self) -> Vec<String> {
		read_state(&self.state).crd_names()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}
}

fn read_state(state: &SharedState) -> RwLockReadGuard<'_, ClusterState> {
	state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(state: &SharedState) -> RwLockWriteGuard<'_, ClusterState> {
	state.write().unwrap_or_else(PoisonError::into_inner)
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-08-13T00:00:00Z",
			"goVersion": "go1.22.5",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.with_priority(PRIORITY_DISCOVERY)
		.mount(server)
		.await;
}

async fn mount_discovery(server: &MockServer, state: &SharedState, mode: DiscoveryMode) {
	let core_resources = read_state(state).catalog().core_resources.clone();

	match mode {
		DiscoveryMode::Aggregated => {
			let core_body = serde_json::to_vec(&json!({
				"kind": "APIGroupDiscoveryList",
				"apiVersion": "apidiscovery.k8s.io/v2",
				"items": [aggregated_group("", [("v1", core_resources.as_slice())])]
			}))
			.expect("serializing discovery JSON should never fail");

			Mock::given(method("GET"))
				.and(path("/api"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(
					ResponseTemplate::new(200)
						.set_body_raw(core_body, AGGREGATED_DISCOVERY_CONTENT_TYPE),
				)
				.with_priority(PRIORITY_AGGREGATED)
				.mount(server)
				.await;

			// Group discovery changes as CRDs propagate, so it is rendered per request
			let apis_state = Arc::clone(state);
			Mock::given(method("GET"))
				.and(path("/apis"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(move |_: &Request| {
					let groups = read_state(&apis_state).discovery_groups(Instant::now());
					let items: Vec<_> = groups
						.iter()
						.map(|(group, versions)| {
							aggregated_group(
								group,
								versions.iter().map(|(v, rs)| (v.as_str(), rs.as_slice())),
							)
						})
						.collect();
					let body = serde_json::to_vec(&json!({
						"kind": "APIGroupDiscoveryList",
						"apiVersion": "apidiscovery.k8s.io/v2",
						"items": items
					}))
					.expect("serializing discovery JSON should never fail");
					ResponseTemplate::new(200).set_body_raw(body, AGGREGATED_DISCOVERY_CONTENT_TYPE)
				})
				.with_priority(PRIORITY_AGGREGATED)
				.mount(server)
				.await;
		}
		DiscoveryMode::Legacy => {
			// Return 406 Not Acceptable for aggregated discovery requests
			for p in ["/api", "/apis"] {
				Mock::given(method("GET"))
					.and(path(p))
					.and(header_regex("accept", "apidiscovery"))
					.respond_with(ResponseTemplate::new(406))
					.with_priority(PRIORITY_AGGREGATED)
					.mount(server)
					.await;
			}
		}
	}

	// Legacy discovery endpoints (fallback)
	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.with_priority(PRIORITY_DISCOVERY)
		.mount(server)
		.await;

	let groups_state = Arc::clone(state);
	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(move |_: &Request| {
			let groups = read_state(&groups_state).discovery_groups(Instant::now());
			let groups: Vec<_> = groups
				.iter()
				.map(|(group, versions)| {
					let versions: Vec<_> = versions
						.keys()
						.map(|v| json!({"groupVersion": format!("{group}/{v}"), "version": v}))
						.collect();
					json!({
						"name": group,
						"preferredVersion": versions.first().cloned().unwrap_or(Value::Null),
						"versions": versions,
					})
				})
				.collect();
			ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIGroupList",
				"apiVersion": "v1",
				"groups": groups
			}))
		})
		.with_priority(PRIORITY_DISCOVERY)
		.mount(server)
		.await;

	Mock::given(method("GET"))
		.and(path("/api/v1"))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(resource_list("v1", &core_resources)),
		)
		.with_priority(PRIORITY_DISCOVERY)
		.mount(server)
		.await;

	// Group version resources (e.g., /apis/apps/v1)
	let gv_state = Arc::clone(state);
	Mock::given(method("GET"))
		.and(path_regex(r"^/apis/[^/]+/[^/]+/?$"))
		.respond_with(move |req: &Request| {
			let Some((group, version)) = parse_group_version_path(req.url.path()) else {
				return respond(Err(ApiError::unserved()));
			};
			let resources =
				read_state(&gv_state).discovery_resources(&group, &version, Instant::now());
			respond(
				resources
					.map(|rs| (200, resource_list(&format!("{group}/{version}"), &rs)))
					.ok_or_else(ApiError::unserved),
			)
		})
		.with_priority(PRIORITY_DISCOVERY)
		.mount(server)
		.await;
}

async fn mount_resources(server: &MockServer, state: &SharedState) {
	let get_state = Arc::clone(state);
	let post_state = Arc::clone(state);
	let delete_state = Arc::clone(state);

	// GET - a single resource or a LIST, depending on whether a name is present
	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			trace!(path = %req.url.path(), "GET");
			respond(
				parse_resource_path(req.url.path())
					.ok_or_else(ApiError::unserved)
					.and_then(|p| read_state(&get_state).get(&p, Instant::now())),
			)
		})
		.with_priority(PRIORITY_RESOURCES)
		.mount(server)
		.await;

	// POST - create into a collection
	Mock::given(method("POST"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			trace!(path = %req.url.path(), "POST");
			let result = parse_resource_path(req.url.path())
				.ok_or_else(ApiError::unserved)
				.and_then(|p| {
					let body: Value = serde_json::from_slice(&req.body)
						.map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;
					write_state(&post_state).create(&p, body, Instant::now())
				});
			respond(result)
		})
		.with_priority(PRIORITY_RESOURCES)
		.mount(server)
		.await;

	// DELETE - remove a single resource
	Mock::given(method("DELETE"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			trace!(path = %req.url.path(), "DELETE");
			respond(
				parse_resource_path(req.url.path())
					.ok_or_else(ApiError::unserved)
					.and_then(|p| write_state(&delete_state).delete(&p, Instant::now())),
			)
		})
		.with_priority(PRIORITY_RESOURCES)
		.mount(server)
		.await;
}

/// One `APIGroupDiscovery` entry of an aggregated discovery document.
fn aggregated_group<'a>(
	group: &str,
	versions: impl IntoIterator<Item = (&'a str, &'a [ApiResourceDef])>,
) -> Value {
	let versions: Vec<_> = versions
		.into_iter()
		.map(|(version, resources)| {
			let resources: Vec<_> = resources
				.iter()
				.map(|r| {
					json!({
						"resource": r.name,
						"responseKind": {
							"group": group,
							"version": version,
							"kind": r.kind
						},
						"scope": r.scope(),
						"verbs": r.verbs,
					})
				})
				.collect();
			json!({
				"version": version,
				"resources": resources,
				"freshness": "Current"
			})
		})
		.collect();

	json!({
		"metadata": {"name": group},
		"versions": versions
	})
}

/// A legacy `APIResourceList` for one group version.
fn resource_list(group_version: &str, resources: &[ApiResourceDef]) -> Value {
	let resources: Vec<_> = resources
		.iter()
		.map(|r| {
			json!({
				"name": r.name,
				"singularName": "",
				"namespaced": r.namespaced,
				"kind": r.kind,
				"verbs": r.verbs,
			})
		})
		.collect();

	json!({
		"kind": "APIResourceList",
		"apiVersion": "v1",
		"groupVersion": group_version,
		"resources": resources
	})
}
