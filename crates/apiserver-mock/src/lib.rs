//! Mock Kubernetes API server for CRD conformance testing.
//!
//! Serves a fixed catalog of built-in resources plus CustomResourceDefinitions
//! registered at runtime, over real HTTP so that ordinary kubeconfig-based
//! clients can talk to it.

pub mod catalog;
pub mod http;
mod route;
mod status;
mod store;

pub use catalog::{ApiResourceDef, BuiltinCatalog, BuiltinGroupCrds, DiscoveryMode, API_APPROVAL_ANNOTATION};
pub use http::{HttpMockApiServer, RunningHttpMockApiServer};
