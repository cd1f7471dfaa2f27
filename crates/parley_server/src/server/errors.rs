#![forbid(unsafe_code)]

use parley_protocol::{ErrorEvent, ServerEvent};
use thiserror::Error;

/// Failures surfaced by the messaging core.
///
/// All variants are recovered at the connection handler boundary and
/// translated into a scoped `error` event for the acting connection; none of
/// them terminates the connection or the service.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("authentication required")]
	AuthenticationRequired,

	#[error("not a participant of conversation {0}")]
	AuthorizationDenied(String),

	#[error("message {0} is not owned by the acting user")]
	NotOwner(String),

	#[error("message {0} not found")]
	NotFound(String),

	#[error("persistence failure: {0}")]
	Persistence(#[source] anyhow::Error),

	#[error("malformed request: {0}")]
	Malformed(String),
}

impl ChatError {
	/// Stable wire-level error code.
	pub fn code(&self) -> &'static str {
		match self {
			ChatError::AuthenticationRequired => "AUTH_REQUIRED",
			ChatError::AuthorizationDenied(_) => "NOT_PARTICIPANT",
			ChatError::NotOwner(_) => "NOT_OWNER",
			ChatError::NotFound(_) => "NOT_FOUND",
			ChatError::Persistence(_) => "PERSISTENCE",
			ChatError::Malformed(_) => "MALFORMED",
		}
	}

	/// Translate into the `error` event sent to the acting connection.
	pub fn to_event(&self) -> ServerEvent {
		ServerEvent::Error(ErrorEvent::new(self.code(), self.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_are_stable() {
		assert_eq!(ChatError::AuthenticationRequired.code(), "AUTH_REQUIRED");
		assert_eq!(ChatError::AuthorizationDenied("c1".into()).code(), "NOT_PARTICIPANT");
		assert_eq!(ChatError::NotOwner("m1".into()).code(), "NOT_OWNER");
		assert_eq!(ChatError::NotFound("m1".into()).code(), "NOT_FOUND");
		assert_eq!(ChatError::Malformed("x".into()).code(), "MALFORMED");
	}

	#[test]
	fn to_event_carries_code_and_message() {
		let ev = ChatError::NotOwner("m1".into()).to_event();
		match ev {
			ServerEvent::Error(e) => {
				assert_eq!(e.code, "NOT_OWNER");
				assert!(e.message.contains("m1"));
			}
			other => panic!("unexpected event: {other:?}"),
		}
	}
}
