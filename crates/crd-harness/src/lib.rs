//! Conformance harness for CustomResourceDefinition registration.
//!
//! Drives an isolated Kubernetes API server (an in-process mock or a cluster
//! reached through a kubeconfig) through kube-rs clients, and checks that
//! registering CRDs never disturbs the built-in API groups.
//!
//! ```no_run
//! # async fn example() -> Result<(), crd_harness::HarnessError> {
//! use crd_harness::{scenarios, HarnessConfig, TestServer};
//!
//! let server = TestServer::start(HarnessConfig::default()).await?;
//! let report = scenarios::crd_shadow_group(&server).await;
//! server.teardown().await;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod report;
pub mod scenarios;
pub mod server;
pub mod wait;

pub use config::{HarnessConfig, KubeconfigTarget, MockTarget, TargetConfig};
pub use descriptor::{CrdDescriptor, Gvr, ResourceRef, ResourceScope};
pub use discovery::DiscoveryView;
pub use error::{AssertionError, HarnessError};
pub use report::ScenarioReport;
pub use server::TestServer;
