//! The `run` subcommand.

use std::{path::PathBuf, process::ExitCode};

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use crd_harness::{
	scenarios::{self, Scenario},
	HarnessConfig, KubeconfigTarget, TargetConfig,
};
use tracing::info;

#[derive(Args)]
pub struct RunArgs {
	/// Harness config file (YAML)
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Run against the cluster in this kubeconfig instead of a mock server
	#[arg(long)]
	kubeconfig: Option<PathBuf>,

	/// Kubeconfig context to use
	#[arg(long)]
	context: Option<String>,

	/// Serve only legacy discovery from the mock server
	#[arg(long)]
	legacy_discovery: bool,

	/// Namespace for namespaced scenario objects
	#[arg(short, long)]
	namespace: Option<String>,

	/// Scenarios to run (default: all)
	#[arg(short, long, value_enum)]
	scenario: Vec<ScenarioArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScenarioArg {
	WithoutConflict,
	ShadowGroup,
}

impl From<ScenarioArg> for Scenario {
	fn from(arg: ScenarioArg) -> Self {
		match arg {
			ScenarioArg::WithoutConflict => Self::WithoutConflict,
			ScenarioArg::ShadowGroup => Self::ShadowGroup,
		}
	}
}

pub async fn run(args: RunArgs) -> Result<ExitCode> {
	let config = resolve_config(&args)?;
	let selected: Vec<Scenario> = if args.scenario.is_empty() {
		Scenario::ALL.to_vec()
	} else {
		args.scenario.iter().copied().map(Scenario::from).collect()
	};

	info!(server_target = ?config.target, scenarios = selected.len(), "Running conformance scenarios");
	let reports = scenarios::run_selected(&config, &selected)
		.await
		.context("failed to set up API server")?;

	for report in &reports {
		print!("{report}");
	}

	if reports.iter().all(|r| r.passed()) {
		Ok(ExitCode::SUCCESS)
	} else {
		Ok(ExitCode::FAILURE)
	}
}

/// Load the config file, if any, and apply command line overrides.
fn resolve_config(args: &RunArgs) -> Result<HarnessConfig> {
	let mut config = match &args.config {
		Some(path) => HarnessConfig::load_from_file(path)?,
		None => HarnessConfig::default(),
	};

	if args.kubeconfig.is_some() || args.context.is_some() {
		let mut target = match config.target {
			TargetConfig::Kubeconfig(target) => target,
			TargetConfig::Mock(_) => KubeconfigTarget::default(),
		};
		if let Some(path) = &args.kubeconfig {
			target.path = Some(path.clone());
		}
		if let Some(context) = &args.context {
			target.context = Some(context.clone());
		}
		config.target = TargetConfig::Kubeconfig(target);
	}

	if args.legacy_discovery {
		match &mut config.target {
			TargetConfig::Mock(mock) => mock.legacy_discovery = true,
			TargetConfig::Kubeconfig(_) => {
				bail!("--legacy-discovery only applies to the mock server target")
			}
		}
	}

	if let Some(namespace) = &args.namespace {
		config.namespace.clone_from(namespace);
	}

	Ok(config)
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use clap::Parser;
	use crd_harness::MockTarget;
	use indoc::indoc;

	use super::*;

	#[derive(Parser)]
	struct TestCli {
		#[command(flatten)]
		args: RunArgs,
	}

	fn parse(argv: &[&str]) -> RunArgs {
		TestCli::parse_from(std::iter::once("run").chain(argv.iter().copied())).args
	}

	#[test]
	fn test_defaults_to_mock() {
		let config = resolve_config(&parse(&[])).unwrap();
		assert_eq!(config, HarnessConfig::default());
	}

	#[test]
	fn test_kubeconfig_flags() {
		let config = resolve_config(&parse(&["--kubeconfig", "/tmp/kc", "--context", "kind"])).unwrap();
		assert_eq!(
			config.target,
			TargetConfig::Kubeconfig(KubeconfigTarget {
				path: Some(PathBuf::from("/tmp/kc")),
				context: Some("kind".to_string()),
			})
		);
	}

	#[test]
	fn test_flags_override_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			indoc! {"
				namespace: from-file
				target:
				  kind: mock
				  establishDelayMs: 5
			"}
		)
		.unwrap();
		let path = file.path().to_str().unwrap();

		let config = resolve_config(&parse(&["-c", path, "--legacy-discovery", "-n", "cli"])).unwrap();

		assert_eq!(config.namespace, "cli");
		assert_eq!(
			config.target,
			TargetConfig::Mock(MockTarget {
				legacy_discovery: true,
				establish_delay_ms: 5,
				..MockTarget::default()
			})
		);
	}

	#[test]
	fn test_legacy_discovery_needs_mock() {
		let args = parse(&["--kubeconfig", "/tmp/kc", "--legacy-discovery"]);
		assert!(resolve_config(&args).is_err());
	}

	#[test]
	fn test_scenario_selection() {
		let args = parse(&["-s", "shadow-group"]);
		let selected: Vec<Scenario> = args.scenario.iter().copied().map(Scenario::from).collect();
		assert_eq!(selected, vec![Scenario::ShadowGroup]);
	}
}
