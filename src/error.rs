//! Error codes

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// Errors that can occur when connecting to a directory server
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The request or the connector configuration is malformed or
	/// contradictory.
	#[error("Invalid connection configuration: {0}")]
	Configuration(String),
	/// Locally supplied CA or key material could not be loaded.
	#[error("Failed to load trust material: {reason}")]
	TrustInitialization {
		/// What was being loaded.
		reason: String,
		/// The underlying parse or I/O failure, if any.
		#[source]
		source: Option<Box<dyn std::error::Error + Send + Sync>>,
	},
	/// The attempt did not complete within its time budget.
	#[error("Timed out after {budget:?} while {phase}")]
	Timeout {
		/// The phase that was in progress when the budget ran out.
		phase: Phase,
		/// The total budget of the attempt.
		budget: Duration,
	},
	/// The server's certificate was rejected by the local trust evaluator.
	#[error("Failed to initialize the SSL context")]
	SslContextInitialization {
		/// The certificate validation failure.
		#[source]
		source: rustls::Error,
	},
	/// The server refused the negotiated security mode or operation.
	#[error("{message}")]
	Protocol {
		/// The diagnostic as reported by the server.
		message: String,
		/// The underlying failure, if there is one besides the diagnostic.
		#[source]
		source: Option<ldap3::LdapError>,
	},
	/// The bind credentials were rejected.
	#[error("Bind as {bind_dn} rejected ({code}): {message}")]
	Authentication {
		/// The identity that was rejected.
		bind_dn: String,
		/// The LDAP result code.
		code: u32,
		/// The diagnostic text returned by the server.
		message: String,
	},
	/// The server could not be reached.
	#[error("Failed to reach directory server: {0}")]
	Transport(#[source] ldap3::LdapError),
	/// The attempt was cancelled by the caller.
	#[error("Connection attempt cancelled")]
	Cancelled,
}

impl Error {
	/// Creates a [`Error::TrustInitialization`] without an underlying cause.
	pub(crate) fn trust(reason: impl Into<String>) -> Self {
		Self::TrustInitialization { reason: reason.into(), source: None }
	}

	/// Creates a [`Error::TrustInitialization`] with the given cause.
	pub(crate) fn trust_with_source(
		reason: impl Into<String>,
		source: impl std::error::Error + Send + Sync + 'static,
	) -> Self {
		Self::TrustInitialization { reason: reason.into(), source: Some(Box::new(source)) }
	}

	/// The kind of failure, without its payload.
	#[must_use]
	pub const fn kind(&self) -> ErrorKind {
		match self {
			Self::Configuration(_) => ErrorKind::Configuration,
			Self::TrustInitialization { .. } => ErrorKind::TrustInitialization,
			Self::Timeout { .. } => ErrorKind::Timeout,
			Self::SslContextInitialization { .. } => ErrorKind::SslContextInitialization,
			Self::Protocol { .. } => ErrorKind::Protocol,
			Self::Authentication { .. } => ErrorKind::Authentication,
			Self::Transport(_) => ErrorKind::Transport,
			Self::Cancelled => ErrorKind::Cancelled,
		}
	}

	/// Renders the error together with its chain of causes, e.g.
	/// `Failed to initialize the SSL context: invalid peer certificate:
	/// UnknownIssuer`.
	#[must_use]
	pub fn report(&self) -> String {
		let mut report = self.to_string();
		let mut source = std::error::Error::source(self);
		while let Some(cause) = source {
			let cause_text = cause.to_string();
			if !report.ends_with(&cause_text) {
				report.push_str(": ");
				report.push_str(&cause_text);
			}
			source = cause.source();
		}
		report
	}
}

/// Distinguishable failure categories, each with its own remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	/// Fix the request or connector configuration.
	Configuration,
	/// Fix the supplied CA or key material.
	TrustInitialization,
	/// The server was too slow; may be retried with backoff.
	Timeout,
	/// Fix the local trust configuration.
	SslContextInitialization,
	/// Fix TLS or protocol support on the server.
	Protocol,
	/// Fix the bind credentials.
	Authentication,
	/// The server was unreachable; may be retried with backoff.
	Transport,
	/// The caller gave up on the attempt.
	Cancelled,
}

impl ErrorKind {
	/// Whether a caller may sensibly retry an attempt that failed this way.
	/// The connector itself never retries.
	#[must_use]
	pub const fn is_retryable(self) -> bool {
		matches!(self, Self::Timeout | Self::Transport)
	}
}

/// The phases of a connection attempt, in the order they are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// Opening the TCP connection.
	Connecting,
	/// The StartTLS extended operation and the TLS handshake.
	Negotiating,
	/// Performing the simple bind.
	Binding,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Connecting => f.write_str("connecting"),
			Self::Negotiating => f.write_str("negotiating TLS"),
			Self::Binding => f.write_str("binding"),
		}
	}
}
