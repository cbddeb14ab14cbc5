//! Command line front end for the CRD conformance harness.
//!
//! `run` executes the conformance scenarios against a fresh mock server or a
//! cluster from a kubeconfig. `serve` starts a standalone mock API server and
//! writes a kubeconfig pointing at it.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

mod run;
mod serve;
mod telemetry;

#[derive(Parser)]
#[command(name = "crd-conformance")]
#[command(about = "CustomResourceDefinition conformance checks", long_about = None)]
#[command(version)]
struct Cli {
	/// Log level (trace, debug, info, warn, error); defaults to RUST_LOG, then info
	#[arg(long, global = true)]
	log_level: Option<Level>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the conformance scenarios and print a report
	///
	/// CRDs the harness creates carry the label
	/// app.kubernetes.io/managed-by=crd-conformance and are deleted at the
	/// end of each scenario. An interrupted run leaves them on the cluster
	/// until the next run, which deletes and recreates any labelled CRD it
	/// needs. Delete them by hand with
	/// `kubectl delete crd -l app.kubernetes.io/managed-by=crd-conformance`.
	Run(run::RunArgs),

	/// Serve a standalone mock API server until interrupted
	Serve(serve::ServeArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
	let cli = Cli::parse();
	telemetry::init(cli.log_level)?;

	match cli.command {
		Commands::Run(args) => run::run(args).await,
		Commands::Serve(args) => serve::serve(args).await.map(|()| ExitCode::SUCCESS),
	}
}
