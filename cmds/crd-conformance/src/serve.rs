//! The `serve` subcommand: a standalone mock API server.

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{Context, Result};
use apiserver_mock::{BuiltinGroupCrds, DiscoveryMode, HttpMockApiServer};
use clap::Args;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Args)]
pub struct ServeArgs {
	/// Directory containing YAML manifests (built-in objects and CRDs) to
	/// preload
	#[arg(short = 'd', long)]
	data_dir: Option<PathBuf>,

	/// Path to write kubeconfig file
	#[arg(short = 'k', long)]
	kubeconfig: PathBuf,

	/// Path to write PID file
	#[arg(short = 'p', long)]
	pidfile: Option<PathBuf>,

	/// Context name to use in generated kubeconfig
	#[arg(long, default_value = "mock-context")]
	context_name: String,

	/// Serve only legacy discovery
	#[arg(long)]
	legacy_discovery: bool,

	/// Milliseconds from CRD creation to Established=True
	#[arg(long, default_value_t = 100)]
	establish_delay_ms: u64,

	/// Additional milliseconds before an established CRD is listed in discovery
	#[arg(long, default_value_t = 150)]
	discovery_delay_ms: u64,

	/// Reject CRDs in built-in groups unless they carry the
	/// api-approved.kubernetes.io annotation
	#[arg(long)]
	reject_unapproved_crds: bool,
}

pub async fn serve(args: ServeArgs) -> Result<()> {
	let manifests = match &args.data_dir {
		Some(dir) => load_manifests_from_dir(dir)?,
		None => Vec::new(),
	};
	info!(count = manifests.len(), "Loaded manifests");

	let discovery_mode = if args.legacy_discovery {
		DiscoveryMode::Legacy
	} else {
		DiscoveryMode::Aggregated
	};

	let builtin_group_crds = if args.reject_unapproved_crds {
		BuiltinGroupCrds::Reject
	} else {
		BuiltinGroupCrds::Isolate
	};

	let server = HttpMockApiServer::builder()
		.discovery_mode(discovery_mode)
		.resources(manifests)
		.establish_delay(Duration::from_millis(args.establish_delay_ms))
		.discovery_delay(Duration::from_millis(args.discovery_delay_ms))
		.builtin_group_crds(builtin_group_crds)
		.build()
		.start()
		.await;
	info!(uri = %server.uri(), "Mock API server started");

	let kubeconfig = server.kubeconfig_with_context(&args.context_name);
	let kubeconfig_yaml =
		serde_yaml::to_string(&kubeconfig).context("failed to serialize kubeconfig")?;
	fs::write(&args.kubeconfig, kubeconfig_yaml)
		.with_context(|| format!("failed to write kubeconfig to {}", args.kubeconfig.display()))?;
	info!(path = %args.kubeconfig.display(), "Wrote kubeconfig");

	if let Some(pidfile) = &args.pidfile {
		fs::write(pidfile, format!("{}\n", std::process::id()))
			.with_context(|| format!("failed to write pidfile to {}", pidfile.display()))?;
		debug!(path = %pidfile.display(), "Wrote PID file");
	}

	wait_for_shutdown().await?;

	let crds = server.registered_crds();
	info!(crds = ?crds, "Shutting down");

	if let Some(pidfile) = &args.pidfile {
		let _ = fs::remove_file(pidfile);
	}

	Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
	let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
		.context("failed to register SIGTERM handler")?;

	tokio::select! {
		_ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
		_ = sigterm.recv() => info!("Received SIGTERM"),
	}
	Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for ctrl-c")?;
	info!("Received ctrl-c");
	Ok(())
}

/// Load YAML manifests (`*.yaml`, `*.yml`, multi-document) from a directory,
/// in file name order.
fn load_manifests_from_dir(dir: &Path) -> Result<Vec<serde_json::Value>> {
	let mut paths: Vec<_> = fs::read_dir(dir)
		.with_context(|| format!("failed to read directory {}", dir.display()))?
		.filter_map(|e| e.ok().map(|e| e.path()))
		.filter(|p| p.extension().is_some_and(|ext| ext == "yaml" || ext == "yml"))
		.collect();
	paths.sort();

	let mut manifests = Vec::new();
	for path in paths {
		let content = fs::read_to_string(&path)
			.with_context(|| format!("failed to read {}", path.display()))?;

		for doc in serde_yaml::Deserializer::from_str(&content) {
			let value = serde_json::Value::deserialize(doc)
				.with_context(|| format!("failed to parse YAML in {}", path.display()))?;
			if value.is_null() {
				continue;
			}
			debug!(path = %path.display(), kind = ?value.get("kind"), "Loaded manifest");
			manifests.push(value);
		}
	}

	Ok(manifests)
}
