#![allow(dead_code)]

use std::time::Duration;

use apiserver_mock::BuiltinGroupCrds;
use crd_harness::{HarnessConfig, MockTarget, TargetConfig, TestServer};

/// Route harness logs to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Harness settings with short waits, against a mock with the given delays.
pub fn mock_config(legacy_discovery: bool, establish_delay: Duration, discovery_delay: Duration) -> HarnessConfig {
	HarnessConfig {
		target: TargetConfig::Mock(MockTarget {
			legacy_discovery,
			establish_delay_ms: millis(establish_delay),
			discovery_delay_ms: millis(discovery_delay),
			..MockTarget::default()
		}),
		establish_timeout_ms: 5_000,
		settle_window_ms: 400,
		poll_interval_ms: 10,
		..Default::default()
	}
}

pub async fn start_mock(legacy_discovery: bool) -> TestServer {
	init_tracing();
	TestServer::start(mock_config(
		legacy_discovery,
		Duration::from_millis(50),
		Duration::from_millis(50),
	))
	.await
	.expect("mock server should start")
}

/// A fast mock that treats CRDs in built-in groups per `policy`.
pub fn mock_config_with_policy(policy: BuiltinGroupCrds) -> HarnessConfig {
	let mut config = mock_config(false, Duration::from_millis(20), Duration::from_millis(20));
	if let TargetConfig::Mock(mock) = &mut config.target {
		mock.builtin_group_crds = policy;
	}
	config
}

fn millis(d: Duration) -> u64 {
	u64::try_from(d.as_millis()).expect("delay fits in u64")
}
