//! The test server handle and the client operations scenarios are made of.

use std::{collections::BTreeMap, fmt::Debug, sync::Mutex};

use apiserver_mock::{DiscoveryMode, HttpMockApiServer, RunningHttpMockApiServer};
use k8s_openapi::{
	api::networking::v1::NetworkPolicy,
	apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
	NamespaceResourceScope,
};
use kube::{
	api::{DeleteParams, DynamicObject, ListParams, ObjectList, PostParams},
	config::{KubeConfigOptions, Kubeconfig},
	runtime::wait::{conditions, Condition},
	Api, Client, Config, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{
	config::{HarnessConfig, TargetConfig},
	descriptor::{CrdDescriptor, Gvr, ResourceRef, ResourceScope, MANAGED_BY, MANAGED_BY_LABEL},
	discovery::DiscoveryView,
	error::{is_status, AssertionError, HarnessError},
	wait::{consistently, eventually, WaitError},
};

enum Backend {
	/// In-process server, shut down when dropped
	Mock(RunningHttpMockApiServer),
	/// Existing cluster, only the CRDs we registered are cleaned up
	Cluster,
}

/// Handle to an isolated API server.
///
/// A mock backend is shut down when the handle is dropped, on every exit
/// path including panics. CRDs registered through the handle are deleted by
/// [`TestServer::teardown`].
pub struct TestServer {
	backend: Backend,
	client: Client,
	config: HarnessConfig,
	/// Human-readable identifier for the server (API server URL).
	server_identifier: String,
	registered: Mutex<Vec<String>>,
}

impl Debug for TestServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TestServer")
			.field("server_identifier", &self.server_identifier)
			.field("registered", &self.registered_crds())
			.finish_non_exhaustive()
	}
}

impl TestServer {
	/// Start a fresh server (or connect to the configured cluster) and verify
	/// that it answers.
	#[instrument(skip_all)]
	pub async fn start(config: HarnessConfig) -> Result<Self, HarnessError> {
		let (backend, kubeconfig, context) = match &config.target {
			TargetConfig::Mock(mock) => {
				let discovery_mode = if mock.legacy_discovery {
					DiscoveryMode::Legacy
				} else {
					DiscoveryMode::Aggregated
				};
				let server = HttpMockApiServer::builder()
					.discovery_mode(discovery_mode)
					.establish_delay(std::time::Duration::from_millis(mock.establish_delay_ms))
					.discovery_delay(std::time::Duration::from_millis(mock.discovery_delay_ms))
					.builtin_group_crds(mock.builtin_group_crds)
					.build()
					.start()
					.await;
				let kubeconfig = server.kubeconfig();
				(Backend::Mock(server), kubeconfig, None)
			}
			TargetConfig::Kubeconfig(target) => {
				let kubeconfig = match &target.path {
					Some(path) => Kubeconfig::read_from(path)?,
					None => Kubeconfig::read()?,
				};
				(Backend::Cluster, kubeconfig, target.context.clone())
			}
		};

		let mut client_config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context,
				..Default::default()
			},
		)
		.await?;
		client_config.read_timeout = Some(config.api_timeout());
		let server_identifier = client_config.cluster_url.to_string();

		let client = Client::try_from(client_config).map_err(HarnessError::Client)?;
		let version = client
			.apiserver_version()
			.await
			.map_err(|source| HarnessError::Unreachable {
				server: server_identifier.clone(),
				source,
			})?;
		info!(
			server = %server_identifier,
			version = %version.git_version,
			"Connected to API server"
		);

		Ok(Self {
			backend,
			client,
			config,
			server_identifier,
			registered: Mutex::new(Vec::new()),
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	pub fn config(&self) -> &HarnessConfig {
		&self.config
	}

	/// Get the server identifier (API server URL).
	pub fn server_identifier(&self) -> &str {
		&self.server_identifier
	}

	/// The in-process server, when running against the mock.
	pub fn mock(&self) -> Option<&RunningHttpMockApiServer> {
		match &self.backend {
			Backend::Mock(server) => Some(server),
			Backend::Cluster => None,
		}
	}

	/// CRDs created through this handle and not yet deleted.
	pub fn registered_crds(&self) -> Vec<String> {
		self.registered
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.clone()
	}

	/// Create a namespaced built-in object through a typed client.
	#[instrument(skip(self, object), fields(name = ?object.meta().name))]
	pub async fn create_builtin<K>(&self, namespace: &str, object: &K) -> Result<K, AssertionError>
	where
		K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
		K::DynamicType: Default,
	{
		let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
		let object_name = describe::<K>(namespace, object.meta().name.as_deref().unwrap_or_default());
		let created = api
			.create(&PostParams::default(), object)
			.await
			.map_err(|source| AssertionError::request("create", object_name.clone(), source))?;
		debug!(object = %object_name, "Created built-in object");
		Ok(created)
	}

	/// Create a NetworkPolicy selecting pods by `match_labels`, with no
	/// ingress rules.
	pub async fn create_network_policy(
		&self,
		namespace: &str,
		name: &str,
		match_labels: &BTreeMap<String, String>,
	) -> Result<NetworkPolicy, AssertionError> {
		let policy: NetworkPolicy = serde_json::from_value(json!({
			"apiVersion": "networking.k8s.io/v1",
			"kind": "NetworkPolicy",
			"metadata": {"name": name, "namespace": namespace},
			"spec": {
				"podSelector": {"matchLabels": match_labels},
				"ingress": []
			}
		}))
		.map_err(|source| AssertionError::Encode {
			object: describe::<NetworkPolicy>(namespace, name),
			source,
		})?;
		self.create_builtin(namespace, &policy).await
	}

	/// Re-fetch a built-in object; fails if it can no longer be retrieved.
	#[instrument(skip(self))]
	pub async fn assert_visible<K>(&self, reference: &ResourceRef) -> Result<K, AssertionError>
	where
		K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
		K::DynamicType: Default,
	{
		let api: Api<K> = Api::namespaced(self.client.clone(), &reference.namespace);
		api.get(&reference.name)
			.await
			.map_err(|source| AssertionError::NotVisible {
				object: describe::<K>(&reference.namespace, &reference.name),
				source,
			})
	}

	pub async fn assert_network_policy_visible(
		&self,
		reference: &ResourceRef,
	) -> Result<NetworkPolicy, AssertionError> {
		self.assert_visible(reference).await
	}

	/// Submit a CRD and wait until it is established.
	///
	/// An `AlreadyExists` answer is accepted only with `expect_name_conflict`;
	/// the existing CRD is then waited on like a new one. It is deleted at
	/// teardown only if the harness created it. Without the flag, a CRD left
	/// behind by an interrupted harness run is deleted and created again.
	///
	/// A 403 or 422 answer is reported as [`AssertionError::Rejected`].
	#[instrument(skip(self, descriptor), fields(crd = %descriptor.name()))]
	pub async fn register_crd(
		&self,
		descriptor: &CrdDescriptor,
		expect_name_conflict: bool,
	) -> Result<CustomResourceDefinition, AssertionError> {
		let name = descriptor.name();
		let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
		let crd = descriptor.to_crd();

		let mut created = api.create(&PostParams::default(), &crd).await;
		if matches!(&created, Err(e) if is_status(e, 409))
			&& !expect_name_conflict
			&& self.reclaim_stale_crd(&name).await?
		{
			created = api.create(&PostParams::default(), &crd).await;
		}

		match created {
			Ok(_) => {
				info!(crd = %name, "Created CRD");
				self.track(&name);
			}
			Err(e) if is_status(&e, 409) && expect_name_conflict => {
				debug!(crd = %name, "CRD already exists, continuing");
				if self.fetch_crd(&name).await?.is_some_and(|crd| is_managed(&crd)) {
					self.track(&name);
				}
			}
			Err(e) if is_status(&e, 409) => {
				return Err(AssertionError::AlreadyExists { name });
			}
			Err(kube::Error::Api(resp)) if matches!(resp.code, 403 | 422) => {
				info!(crd = %name, code = resp.code, "CRD rejected");
				return Err(AssertionError::Rejected {
					name,
					code: resp.code,
					message: resp.message.clone(),
				});
			}
			Err(source) => {
				return Err(AssertionError::request("create", format!("CRD {name}"), source));
			}
		}

		self.wait_established(&name).await
	}

	/// Delete `name` if it carries the harness label and wait until it is
	/// gone. Returns whether it was deleted.
	async fn reclaim_stale_crd(&self, name: &str) -> Result<bool, AssertionError> {
		if !self.fetch_crd(name).await?.is_some_and(|crd| is_managed(&crd)) {
			return Ok(false);
		}
		warn!(crd = %name, "Deleting CRD left behind by an earlier run");

		let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
		match api.delete(name, &DeleteParams::default()).await {
			Ok(_) => {}
			Err(e) if is_status(&e, 404) => {}
			Err(source) => {
				return Err(AssertionError::request("delete", format!("CRD {name}"), source));
			}
		}

		let operation = format!("stale CRD {name} to be deleted");
		eventually(&self.config.wait_config(), &operation, || async {
			Ok::<_, AssertionError>(self.fetch_crd(name).await?.is_none().then_some(()))
		})
		.await?;
		Ok(true)
	}

	/// Get a CRD, `None` if it does not exist.
	async fn fetch_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>, AssertionError> {
		let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
		api.get_opt(name)
			.await
			.map_err(|source| AssertionError::request("get", format!("CRD {name}"), source))
	}

	/// Poll a CRD until `Established=True`. Rejected names fail immediately.
	pub async fn wait_established(&self, name: &str) -> Result<CustomResourceDefinition, AssertionError> {
		let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
		let operation = format!("CRD {name} to become established");

		let crd = eventually(&self.config.wait_config(), &operation, || async {
			let crd = api
				.get(name)
				.await
				.map_err(|source| AssertionError::request("get", format!("CRD {name}"), source))?;
			if let Some(message) = names_rejection(&crd) {
				return Err(AssertionError::NamesNotAccepted {
					name: name.to_string(),
					message,
				});
			}
			Ok(conditions::is_crd_established()
				.matches_object(Some(&crd))
				.then_some(crd))
		})
		.await?;

		info!(crd = %name, "CRD established");
		Ok(crd)
	}

	/// Delete a CRD by name.
	#[instrument(skip(self))]
	pub async fn delete_crd(&self, name: &str) -> Result<(), AssertionError> {
		let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
		api.delete(name, &DeleteParams::default())
			.await
			.map_err(|source| AssertionError::request("delete", format!("CRD {name}"), source))?;
		self.registered
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.retain(|n| n != name);
		info!(crd = %name, "Deleted CRD");
		Ok(())
	}

	/// Single lookup: is the CRD's resource listed under its group version?
	///
	/// A group version that is not served at all counts as "not listed".
	pub async fn crd_exists_in_discovery(&self, descriptor: &CrdDescriptor) -> Result<bool, AssertionError> {
		let group_version = descriptor.gvr().api_version();
		match self.client.list_api_group_resources(&group_version).await {
			Ok(list) => Ok(list.resources.iter().any(|r| r.name == descriptor.plural)),
			Err(e) if is_status(&e, 404) => Ok(false),
			Err(source) => Err(AssertionError::request(
				"discover",
				format!("group version {group_version}"),
				source,
			)),
		}
	}

	/// Require the CRD's resource to stay out of its group's discovery for the
	/// whole settle window.
	#[instrument(skip(self, descriptor), fields(crd = %descriptor.name()))]
	pub async fn assert_crd_absent_from_discovery(
		&self,
		descriptor: &CrdDescriptor,
	) -> Result<(), AssertionError> {
		let operation = format!("{} to stay out of discovery", descriptor.name());
		let result = consistently(
			self.config.settle_window(),
			self.config.poll_interval(),
			&operation,
			|| async { Ok::<_, AssertionError>(!self.crd_exists_in_discovery(descriptor).await?) },
		)
		.await;

		match result {
			Ok(()) => Ok(()),
			Err(WaitError::Violated { .. }) => Err(AssertionError::PresentInDiscovery {
				crd: descriptor.name(),
				group_version: descriptor.gvr().api_version(),
				resource: descriptor.plural.clone(),
			}),
			Err(e) => Err(e.into()),
		}
	}

	/// Wait until the CRD's resource is listed in discovery.
	pub async fn wait_for_discovery(&self, descriptor: &CrdDescriptor) -> Result<(), AssertionError> {
		let operation = format!("{} to appear in discovery", descriptor.name());
		eventually(&self.config.wait_config(), &operation, || async {
			Ok::<_, AssertionError>(self.crd_exists_in_discovery(descriptor).await?.then_some(()))
		})
		.await?;
		Ok(())
	}

	/// Snapshot the full discovery document.
	pub async fn discovery(&self) -> Result<DiscoveryView, AssertionError> {
		Ok(DiscoveryView::fetch(&self.client).await?)
	}

	/// List objects of `gvr` in `namespace` with the schema-less client.
	///
	/// A 404 while the resource is still being installed is retried until the
	/// establish timeout.
	#[instrument(skip(self))]
	pub async fn list_via_generic_client(
		&self,
		gvr: &Gvr,
		namespace: &str,
	) -> Result<ObjectList<DynamicObject>, AssertionError> {
		let ar = gvr.api_resource("");
		let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
		let operation = format!("{gvr} to be listable in {namespace}");

		let list = eventually(&self.config.wait_config(), &operation, || async {
			match api.list(&ListParams::default()).await {
				Ok(list) => Ok(Some(list)),
				Err(e) if is_status(&e, 404) => Ok(None),
				Err(source) => Err(AssertionError::request(
					"list",
					format!("{gvr} in namespace {namespace}"),
					source,
				)),
			}
		})
		.await?;

		debug!(gvr = %gvr, count = list.items.len(), "Listed objects");
		Ok(list)
	}

	/// Create a custom object through the schema-less client.
	///
	/// `namespace` is ignored for cluster-scoped resources.
	#[instrument(skip(self, descriptor, data), fields(crd = %descriptor.name()))]
	pub async fn create_custom_object(
		&self,
		descriptor: &CrdDescriptor,
		namespace: &str,
		name: &str,
		data: serde_json::Value,
	) -> Result<DynamicObject, AssertionError> {
		let ar = descriptor.api_resource();
		let (api, object) = match descriptor.scope {
			ResourceScope::Namespaced => (
				Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, &ar),
				DynamicObject::new(name, &ar).within(namespace).data(data),
			),
			ResourceScope::ClusterWide => (
				Api::<DynamicObject>::all_with(self.client.clone(), &ar),
				DynamicObject::new(name, &ar).data(data),
			),
		};
		api.create(&PostParams::default(), &object)
			.await
			.map_err(|source| {
				AssertionError::request("create", format!("{} {name}", descriptor.kind), source)
			})
	}

	/// Delete every CRD this handle registered, then release the server.
	///
	/// Deletion errors are logged, not returned: teardown must not mask the
	/// outcome of the test.
	pub async fn teardown(self) {
		for name in self.registered_crds().into_iter().rev() {
			if let Err(e) = self.delete_crd(&name).await {
				warn!(crd = %name, error = %e, "Failed to delete CRD during teardown");
			}
		}
		debug!(server = %self.server_identifier, "Torn down");
	}

	fn track(&self, name: &str) {
		let mut registered = self
			.registered
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner);
		if !registered.iter().any(|n| n == name) {
			registered.push(name.to_string());
		}
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		if matches!(self.backend, Backend::Cluster) {
			let leaked = self.registered_crds();
			if !leaked.is_empty() {
				warn!(crds = ?leaked, "TestServer dropped without teardown, CRDs left on cluster until the next run");
			}
		}
	}
}

fn is_managed(crd: &CustomResourceDefinition) -> bool {
	crd.metadata
		.labels
		.as_ref()
		.and_then(|labels| labels.get(MANAGED_BY_LABEL))
		.is_some_and(|value| value == MANAGED_BY)
}

/// The message of a `NamesAccepted=False` condition, if present.
fn names_rejection(crd: &CustomResourceDefinition) -> Option<String> {
	crd.status
		.as_ref()?
		.conditions
		.as_ref()?
		.iter()
		.find(|c| c.type_ == "NamesAccepted" && c.status == "False")
		.map(|c| c.message.clone().unwrap_or_default())
}

fn describe<K: Resource>(namespace: &str, name: &str) -> String
where
	K::DynamicType: Default,
{
	format!("{} {namespace}/{name}", K::kind(&K::DynamicType::default()))
}
