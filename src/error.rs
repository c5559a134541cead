use std::sync;

/// Boxed error a task body may fail with
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the loop and by finished tasks
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// The task body returned an error
	#[error("task failed: {0}")]
	TaskFailed(#[source] sync::Arc<dyn std::error::Error + Send + Sync + 'static>),

	/// The task observed a cancellation request and unwound
	#[error("task was cancelled")]
	Cancelled,

	/// The loop was closed before the operation
	#[error("event loop is closed")]
	LoopClosed,

	/// Operation not allowed in the current state
	#[error("invalid state: {0}")]
	InvalidState(&'static str),

	/// An environment override could not be parsed
	#[error("invalid value {value:?} for {var}")]
	InvalidConfig {
		/// Environment variable name
		var: &'static str,
		/// Raw value found in the environment
		value: String,
	},
}

impl Error {
	/// Converts a body error, keeping loop errors as they are
	pub(crate) fn from_body<E: Into<BoxError>>(err: E) -> Self {
		match err.into().downcast::<Error>() {
			Ok(err) => *err,
			Err(other) => Error::TaskFailed(sync::Arc::from(other)),
		}
	}

	/// True for [`Error::Cancelled`]
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Error::Cancelled)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::error::Error as _;

	#[derive(Debug, thiserror::Error)]
	#[error("sensor offline")]
	struct Offline;

	#[test]
	fn foreign_errors_are_wrapped() {
		let err = Error::from_body(Offline);
		assert!(matches!(err, Error::TaskFailed(_)));
		assert_eq!(err.to_string(), "task failed: sensor offline");
		assert_eq!(err.source().map(|s| s.to_string()), Some("sensor offline".to_string()));
	}

	#[test]
	fn loop_errors_pass_through() {
		assert!(Error::from_body(Error::Cancelled).is_cancelled());
		assert!(matches!(Error::from_body(Error::LoopClosed), Error::LoopClosed));
	}

	#[test]
	fn string_errors_are_wrapped() {
		let err = Error::from_body("boom");
		assert_eq!(err.to_string(), "task failed: boom");
	}
}
