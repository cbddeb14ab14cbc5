//! Integration tests for the mock API server through a real kube client.

use std::time::Duration;

use apiserver_mock::{DiscoveryMode, HttpMockApiServer, RunningHttpMockApiServer};
use k8s_openapi::{
	api::{core::v1::ConfigMap, networking::v1::NetworkPolicy},
	apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
	api::{ApiResource, DeleteParams, DynamicObject, ListParams, PostParams},
	config::KubeConfigOptions,
	core::GroupVersionKind,
	Api, Client, Config, Discovery,
};
use rstest::rstest;
use serde_json::json;

async fn client_for(server: &RunningHttpMockApiServer) -> Client {
	let config = Config::from_custom_kubeconfig(server.kubeconfig(), &KubeConfigOptions::default())
		.await
		.expect("kubeconfig should be valid");
	Client::try_from(config).expect("client should build")
}

fn crd_manifest(group: &str, plural: &str, kind: &str, scope: &str) -> CustomResourceDefinition {
	serde_json::from_value(json!({
		"apiVersion": "apiextensions.k8s.io/v1",
		"kind": "CustomResourceDefinition",
		"metadata": {"name": format!("{plural}.{group}")},
		"spec": {
			"group": group,
			"scope": scope,
			"names": {"plural": plural, "kind": kind},
			"versions": [{
				"name": "v1",
				"served": true,
				"storage": true,
				"schema": {"openAPIV3Schema": {"type": "object", "x-kubernetes-preserve-unknown-fields": true}}
			}]
		}
	}))
	.expect("CRD manifest should deserialize")
}

fn instant_server(mode: DiscoveryMode) -> HttpMockApiServer {
	HttpMockApiServer::builder()
		.discovery_mode(mode)
		.establish_delay(Duration::ZERO)
		.discovery_delay(Duration::ZERO)
		.build()
}

#[tokio::test]
async fn test_server_version() {
	let server = instant_server(DiscoveryMode::Aggregated).start().await;
	let client = client_for(&server).await;

	let info = client.apiserver_version().await.unwrap();
	assert_eq!(info.major, "1");
	assert_eq!(info.minor, "31");
}

#[rstest]
#[case::aggregated(DiscoveryMode::Aggregated)]
#[case::legacy(DiscoveryMode::Legacy)]
#[tokio::test]
async fn test_discovery_lists_registered_crd(#[case] mode: DiscoveryMode) {
	let server = instant_server(mode).start().await;
	let client = client_for(&server).await;

	let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
	crds.create(
		&PostParams::default(),
		&crd_manifest("cr.bar.com", "foos", "Foo", "Namespaced"),
	)
	.await
	.unwrap();

	let discovery = match mode {
		DiscoveryMode::Aggregated => Discovery::new(client.clone()).run_aggregated().await,
		DiscoveryMode::Legacy => Discovery::new(client.clone()).run().await,
	}
	.expect("discovery should succeed");

	let group = discovery
		.get("cr.bar.com")
		.expect("custom group should be discovered");
	let resources: Vec<_> = group
		.versioned_resources("v1")
		.into_iter()
		.map(|(ar, _)| ar.plural)
		.collect();
	assert_eq!(resources, vec!["foos".to_string()]);

	let networking = discovery.get("networking.k8s.io").unwrap();
	assert!(networking
		.versioned_resources("v1")
		.iter()
		.any(|(ar, _)| ar.plural == "networkpolicies"));
}

#[tokio::test]
async fn test_aggregated_discovery_rejected_in_legacy_mode() {
	let server = instant_server(DiscoveryMode::Legacy).start().await;
	let client = client_for(&server).await;

	assert!(Discovery::new(client).run_aggregated().await.is_err());
}

#[tokio::test]
async fn test_shadowing_crd_absent_from_group_resources() {
	let server = instant_server(DiscoveryMode::Aggregated).start().await;
	let client = client_for(&server).await;

	let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
	crds.create(
		&PostParams::default(),
		&crd_manifest("networking.k8s.io", "foos", "Foo", "Cluster"),
	)
	.await
	.unwrap();

	let list = client
		.list_api_group_resources("networking.k8s.io/v1")
		.await
		.unwrap();
	let names: Vec<_> = list.resources.iter().map(|r| r.name.as_str()).collect();
	assert_eq!(names, vec!["networkpolicies", "ingresses"]);

	let crd = crds.get("foos.networking.k8s.io").await.unwrap();
	let established = crd
		.status
		.and_then(|s| s.conditions)
		.unwrap_or_default()
		.into_iter()
		.any(|c| c.type_ == "Established" && c.status == "True");
	assert!(established);
}

#[tokio::test]
async fn test_typed_create_get_and_conflict() {
	let server = instant_server(DiscoveryMode::Aggregated).start().await;
	let client = client_for(&server).await;

	let policies: Api<NetworkPolicy> = Api::namespaced(client, "default");
	let policy: NetworkPolicy = serde_json::from_value(json!({
		"metadata": {"name": "abc"},
		"spec": {"podSelector": {"matchLabels": {"foo": "bar"}}, "ingress": []}
	}))
	.unwrap();

	let created = policies.create(&PostParams::default(), &policy).await.unwrap();
	assert_eq!(created.metadata.namespace.as_deref(), Some("default"));
	assert!(created.metadata.resource_version.is_some());

	let fetched = policies.get("abc").await.unwrap();
	assert_eq!(fetched.metadata.uid, created.metadata.uid);

	let err = policies
		.create(&PostParams::default(), &policy)
		.await
		.unwrap_err();
	assert!(matches!(err, kube::Error::Api(resp) if resp.code == 409));
}

#[tokio::test]
async fn test_seeded_resources_are_served() {
	let server = HttpMockApiServer::builder()
		.resources(vec![json!({
			"apiVersion": "v1",
			"kind": "ConfigMap",
			"metadata": {"name": "settings", "namespace": "kube-system"},
			"data": {"key": "value"}
		})])
		.build()
		.start()
		.await;
	let client = client_for(&server).await;

	let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), "kube-system");
	let cm = configmaps.get("settings").await.unwrap();
	assert_eq!(cm.data.unwrap()["key"], "value");

	let all: Api<ConfigMap> = Api::all(client);
	assert_eq!(all.list(&ListParams::default()).await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn test_custom_resource_unroutable_until_established() {
	let server = HttpMockApiServer::builder()
		.establish_delay(Duration::from_secs(60))
		.build()
		.start()
		.await;
	let client = client_for(&server).await;

	let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
	crds.create(
		&PostParams::default(),
		&crd_manifest("cr.bar.com", "foos", "Foo", "Namespaced"),
	)
	.await
	.unwrap();

	let ar = ApiResource::from_gvk_with_plural(
		&GroupVersionKind::gvk("cr.bar.com", "v1", "Foo"),
		"foos",
	);
	let foos: Api<DynamicObject> = Api::namespaced_with(client, "default", &ar);
	let err = foos.list(&ListParams::default()).await.unwrap_err();
	assert!(matches!(err, kube::Error::Api(resp) if resp.code == 404));
	assert_eq!(server.registered_crds(), vec!["foos.cr.bar.com".to_string()]);
}

#[tokio::test]
async fn test_delete_crd() {
	let server = instant_server(DiscoveryMode::Aggregated).start().await;
	let client = client_for(&server).await;

	let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
	crds.create(
		&PostParams::default(),
		&crd_manifest("cr.bar.com", "foos", "Foo", "Namespaced"),
	)
	.await
	.unwrap();
	crds.delete("foos.cr.bar.com", &DeleteParams::default())
		.await
		.unwrap();

	assert!(server.registered_crds().is_empty());
	let err = client
		.list_api_group_resources("cr.bar.com/v1")
		.await
		.unwrap_err();
	assert!(matches!(err, kube::Error::Api(resp) if resp.code == 404));
}
