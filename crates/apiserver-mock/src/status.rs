//! Kubernetes `Status` error responses.

use serde_json::{json, Value};
use wiremock::ResponseTemplate;

/// An error returned to API clients as a `Status` object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
	NotFound(String),
	AlreadyExists(String),
	Invalid(String),
	BadRequest(String),
}

impl ApiError {
	/// The generic 404 the API server returns for unserved paths.
	pub fn unserved() -> Self {
		Self::NotFound("the server could not find the requested resource".to_string())
	}

	pub fn code(&self) -> u16 {
		match self {
			Self::NotFound(_) => 404,
			Self::AlreadyExists(_) => 409,
			Self::Invalid(_) => 422,
			Self::BadRequest(_) => 400,
		}
	}

	pub fn reason(&self) -> &'static str {
		match self {
			Self::NotFound(_) => "NotFound",
			Self::AlreadyExists(_) => "AlreadyExists",
			Self::Invalid(_) => "Invalid",
			Self::BadRequest(_) => "BadRequest",
		}
	}

	pub fn message(&self) -> &str {
		match self {
			Self::NotFound(m) | Self::AlreadyExists(m) | Self::Invalid(m) | Self::BadRequest(m) => m,
		}
	}

	/// Render as a `Status` body.
	pub fn to_status(&self) -> Value {
		json!({
			"kind": "Status",
			"apiVersion": "v1",
			"metadata": {},
			"status": "Failure",
			"message": self.message(),
			"reason": self.reason(),
			"code": self.code(),
		})
	}
}

/// Turn a handler result into an HTTP response.
pub fn respond(result: Result<(u16, Value), ApiError>) -> ResponseTemplate {
	match result {
		Ok((code, body)) => ResponseTemplate::new(code).set_body_json(body),
		Err(e) => ResponseTemplate::new(e.code()).set_body_json(e.to_status()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_body() {
		let err = ApiError::AlreadyExists(
			"customresourcedefinitions.apiextensions.k8s.io \"foos.cr.bar.com\" already exists"
				.to_string(),
		);
		let status = err.to_status();
		assert_eq!(status["code"], 409);
		assert_eq!(status["reason"], "AlreadyExists");
		assert_eq!(status["status"], "Failure");
	}

	#[test]
	fn test_unserved_is_not_found() {
		let err = ApiError::unserved();
		assert_eq!(err.code(), 404);
		assert_eq!(err.reason(), "NotFound");
	}
}
