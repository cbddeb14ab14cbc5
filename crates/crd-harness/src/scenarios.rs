//! The conformance scenarios.
//!
//! Each scenario runs against its own fresh server and returns a report
//! instead of failing on the first broken check.

use std::collections::BTreeMap;

use tracing::{info, instrument};

use crate::{
	config::HarnessConfig,
	descriptor::{CrdDescriptor, ResourceRef, ResourceScope},
	discovery::DiscoveryView,
	error::{AssertionError, HarnessError},
	report::ScenarioReport,
	server::TestServer,
};

/// A CRD in a group of its own; instances must be listable.
pub fn unaliased_crd() -> CrdDescriptor {
	CrdDescriptor::new("cr.bar.com", "v1", ResourceScope::Namespaced, "foos", "Foo")
}

/// A CRD claiming the built-in `networking.k8s.io` group.
pub fn aliasing_crd() -> CrdDescriptor {
	CrdDescriptor::new(
		"networking.k8s.io",
		"v1",
		ResourceScope::ClusterWide,
		"foos",
		"Foo",
	)
}

/// Register a CRD in a new group and list its (zero) instances through the
/// schema-less client.
#[instrument(skip_all)]
pub async fn crd_without_conflict(server: &TestServer) -> ScenarioReport {
	let mut report = ScenarioReport::new("crd-without-conflict");
	let crd = unaliased_crd();
	let namespace = server.config().namespace.clone();

	report.step(&format!("Registering CRD {}", crd.name()));
	if report.require(server.register_crd(&crd, false).await).is_none() {
		return report;
	}

	report.step(&format!("Listing {} in namespace {namespace}", crd.gvr()));
	if let Some(list) = report.check(server.list_via_generic_client(&crd.gvr(), &namespace).await) {
		if !list.items.is_empty() {
			report.check::<()>(Err(AssertionError::Count {
				what: format!("{} objects", crd.kind),
				expected: 0,
				found: list.items.len(),
			}));
		}
	}

	report
}

/// Register a CRD whose group collides with `networking.k8s.io` and check
/// that the built-in group is unaffected.
///
/// The server may reject the CRD or accept and isolate it; both pass. The
/// built-in group checks run in either case.
#[instrument(skip_all)]
pub async fn crd_shadow_group(server: &TestServer) -> ScenarioReport {
	let mut report = ScenarioReport::new("crd-shadow-group");
	let crd = aliasing_crd().with_annotations(server.config().aliasing_crd_annotations.clone());
	let policy = ResourceRef::new(&server.config().namespace, "abc");

	report.step(&format!("Creating NetworkPolicy {policy}"));
	let labels = BTreeMap::from([("foo".to_string(), "bar".to_string())]);
	let created = server
		.create_network_policy(&policy.namespace, &policy.name, &labels)
		.await;
	if report.require(created).is_none() {
		return report;
	}

	report.step(&format!("Recording discovery for {}", crd.group));
	let Some(before) = report.require(server.discovery().await) else {
		return report;
	};

	report.step(&format!("Registering CRD {}", crd.name()));
	match server.register_crd(&crd, true).await {
		Ok(_) => {}
		Err(AssertionError::Rejected { code, message, .. }) => {
			report.step(&format!("CRD {} rejected ({code}): {message}", crd.name()));
		}
		Err(e) => {
			report.require::<()>(Err(e));
			return report;
		}
	}

	report.step(&format!("Re-fetching NetworkPolicy {policy}"));
	report.check(server.assert_network_policy_visible(&policy).await);

	report.step(&format!("Checking {} stays out of {} discovery", crd.plural, crd.gvr().api_version()));
	report.check(server.assert_crd_absent_from_discovery(&crd).await);

	report.step(&format!("Comparing discovery for {}", crd.group));
	if let Some(after) = report.check(server.discovery().await) {
		let resources = |view: &DiscoveryView| -> Vec<String> {
			view.group_resources(&crd.group)
				.into_iter()
				.map(ToString::to_string)
				.collect()
		};
		let (before, after) = (resources(&before), resources(&after));
		if before != after {
			report.check::<()>(Err(AssertionError::GroupChanged {
				group: crd.group.clone(),
				before,
				after,
			}));
		}
	}

	report
}

/// A runnable scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
	WithoutConflict,
	ShadowGroup,
}

impl Scenario {
	pub const ALL: [Self; 2] = [Self::WithoutConflict, Self::ShadowGroup];

	pub async fn run(self, server: &TestServer) -> ScenarioReport {
		match self {
			Self::WithoutConflict => crd_without_conflict(server).await,
			Self::ShadowGroup => crd_shadow_group(server).await,
		}
	}
}

/// Run every scenario, each on a fresh server.
pub async fn run_all(config: &HarnessConfig) -> Result<Vec<ScenarioReport>, HarnessError> {
	run_selected(config, &Scenario::ALL).await
}

/// Run the given scenarios in order, each on a fresh server.
///
/// Only a server that cannot be started is an error; failed checks end up in
/// the reports.
pub async fn run_selected(
	config: &HarnessConfig,
	selected: &[Scenario],
) -> Result<Vec<ScenarioReport>, HarnessError> {
	let mut reports = Vec::with_capacity(selected.len());

	for scenario in selected {
		let server = TestServer::start(config.clone()).await?;
		reports.push(scenario.run(&server).await);
		server.teardown().await;
	}

	let passed = reports.iter().filter(|r| r.passed()).count();
	info!(passed, total = reports.len(), "Scenarios finished");
	Ok(reports)
}
