//! The conformance scenarios against the in-process mock server.

mod common;

use std::collections::BTreeMap;

use apiserver_mock::{BuiltinGroupCrds, API_APPROVAL_ANNOTATION};
use assert_matches::assert_matches;
use crd_harness::{
	scenarios::{self, Scenario},
	AssertionError, HarnessConfig, ResourceRef, TestServer,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::{api::DeleteParams, Api};
use rstest::rstest;

#[rstest]
#[case::aggregated(false)]
#[case::legacy(true)]
#[tokio::test]
async fn test_crd_without_conflict(#[case] legacy_discovery: bool) {
	let server = common::start_mock(legacy_discovery).await;

	let report = scenarios::crd_without_conflict(&server).await;
	report.assert_passed();
	assert_eq!(report.steps().len(), 2);
	assert_eq!(server.registered_crds(), vec!["foos.cr.bar.com".to_string()]);

	server.teardown().await;
}

#[rstest]
#[case::aggregated(false)]
#[case::legacy(true)]
#[tokio::test]
async fn test_crd_shadow_group(#[case] legacy_discovery: bool) {
	let server = common::start_mock(legacy_discovery).await;

	let report = scenarios::crd_shadow_group(&server).await;
	report.assert_passed();
	assert!(!report.aborted());

	// The shadowing CRD is stored and established even though it is hidden
	let mock = server.mock().expect("mock backend");
	assert!(mock
		.registered_crds()
		.contains(&"foos.networking.k8s.io".to_string()));

	server.teardown().await;
}

#[tokio::test]
async fn test_run_all() {
	common::init_tracing();
	let config = common::mock_config(
		false,
		std::time::Duration::from_millis(20),
		std::time::Duration::from_millis(20),
	);

	let reports = scenarios::run_all(&config).await.unwrap();

	let names: Vec<_> = reports.iter().map(|r| r.name()).collect();
	assert_eq!(names, vec!["crd-without-conflict", "crd-shadow-group"]);
	for report in &reports {
		report.assert_passed();
	}
}

#[tokio::test]
async fn test_default_config_targets_mock() {
	common::init_tracing();
	let server = TestServer::start(HarnessConfig::default()).await.unwrap();

	assert!(server.mock().is_some());
	assert!(server.server_identifier().starts_with("http://127.0.0.1"));
	assert!(server.registered_crds().is_empty());
}

#[tokio::test]
async fn test_run_selected_runs_in_order() {
	common::init_tracing();
	let config = common::mock_config(
		true,
		std::time::Duration::ZERO,
		std::time::Duration::ZERO,
	);

	let reports = scenarios::run_selected(&config, &[Scenario::ShadowGroup])
		.await
		.unwrap();

	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0].name(), "crd-shadow-group");
	reports[0].assert_passed();
}

#[tokio::test]
async fn test_shadow_group_passes_when_crd_is_rejected() {
	common::init_tracing();
	let server = TestServer::start(common::mock_config_with_policy(BuiltinGroupCrds::Reject))
		.await
		.unwrap();

	let report = scenarios::crd_shadow_group(&server).await;

	report.assert_passed();
	assert!(report
		.steps()
		.iter()
		.any(|step| step.starts_with("CRD foos.networking.k8s.io rejected (422)")));
	// The built-in group checks still ran
	assert!(report.steps().iter().any(|step| step.starts_with("Re-fetching NetworkPolicy")));
	assert!(report.steps().iter().any(|step| step.starts_with("Comparing discovery")));
	assert!(server.mock().unwrap().registered_crds().is_empty());
}

#[tokio::test]
async fn test_shadow_group_with_approval_annotation_checks_isolation() {
	common::init_tracing();
	let mut config = common::mock_config_with_policy(BuiltinGroupCrds::Reject);
	config.aliasing_crd_annotations = BTreeMap::from([(
		API_APPROVAL_ANNOTATION.to_string(),
		"unapproved, conformance testing".to_string(),
	)]);
	let server = TestServer::start(config).await.unwrap();

	let report = scenarios::crd_shadow_group(&server).await;

	report.assert_passed();
	assert!(!report.steps().iter().any(|step| step.contains("rejected")));
	assert_eq!(server.registered_crds(), vec!["foos.networking.k8s.io".to_string()]);
}

#[tokio::test]
async fn test_shadow_group_reports_every_leak() {
	common::init_tracing();
	let server = TestServer::start(common::mock_config_with_policy(BuiltinGroupCrds::Merge))
		.await
		.unwrap();

	let report = scenarios::crd_shadow_group(&server).await;

	assert!(!report.passed());
	assert!(!report.aborted());
	let failures = report.failures();
	assert_eq!(failures.len(), 2, "{report}");
	assert!(failures[0].step.starts_with("Checking foos stays out of"));
	assert!(failures[0].message.contains("shows up in discovery for networking.k8s.io/v1"));
	assert!(failures[1].step.starts_with("Comparing discovery"));
	assert!(failures[1].message.contains("networking.k8s.io/v1/foos"));
}

#[tokio::test]
async fn test_shadow_group_reports_missing_network_policy() {
	let server = common::start_mock(false).await;
	let policy = ResourceRef::new("default", "abc");
	server
		.create_network_policy("default", "abc", &BTreeMap::new())
		.await
		.unwrap();
	let api: Api<NetworkPolicy> = Api::namespaced(server.client().clone(), "default");
	api.delete("abc", &DeleteParams::default()).await.unwrap();

	let err = server.assert_network_policy_visible(&policy).await.unwrap_err();

	assert_matches!(err, AssertionError::NotVisible { object, .. } if object == "NetworkPolicy default/abc");
}
