#![forbid(unsafe_code)]

use parley_protocol::ServerEvent;
use thiserror::Error;

use crate::server::store::StoreError;

/// Error taxonomy for event handling. Only `Auth` terminates a connection;
/// everything else is reported as a user-visible error event and the
/// connection stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
	#[error("authentication failed: {0}")]
	Auth(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("invalid request: {0}")]
	Validation(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("service unavailable: {0}")]
	Collaborator(String),
}

impl EventError {
	/// Stable error code surfaced to clients.
	pub fn code(&self) -> &'static str {
		match self {
			EventError::Auth(_) => "auth_failed",
			EventError::PermissionDenied(_) => "permission_denied",
			EventError::Validation(_) => "validation",
			EventError::NotFound(_) => "not_found",
			EventError::Conflict(_) => "conflict",
			EventError::Collaborator(_) => "server_error",
		}
	}

	/// Whether the connection must be terminated.
	pub fn is_fatal(&self) -> bool {
		matches!(self, EventError::Auth(_))
	}

	/// The user-visible error event for this failure.
	pub fn to_event(&self) -> ServerEvent {
		let message = match self {
			// Collaborator details stay in the logs; clients get a generic error.
			EventError::Collaborator(_) => "internal server error".to_string(),
			other => other.to_string(),
		};
		ServerEvent::Error {
			code: self.code().to_string(),
			message,
		}
	}
}

impl From<StoreError> for EventError {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::NotFound => EventError::NotFound("record not found".to_string()),
			StoreError::Conflict(detail) => EventError::Conflict(detail),
			StoreError::Backend(detail) => EventError::Collaborator(detail),
		}
	}
}
