//! An established, authenticated directory connection
use std::time::Duration;

use ldap3::{Ldap, LdapConnAsync};
use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};
use url::Url;

use crate::{
	error::{Error, ErrorKind},
	relay::Relay,
};

/// How long [`Connection::release`] waits for the server to acknowledge the
/// unbind before tearing the transport down.
const RELEASE_GRACE: Duration = Duration::from_secs(1);

/// What a connection attempt achieved, captured when it ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
	/// The transport is open, including TLS when requested.
	pub connected: bool,
	/// A TLS session protects the transport.
	pub secured: bool,
	/// The simple bind succeeded.
	pub authenticated: bool,
}

/// Owns the task running the `ldap3` connection and the relay to the server,
/// and stops both when dropped, which closes the socket.
#[derive(Debug)]
pub(crate) struct Driver {
	/// The spawned `LdapConnAsync::drive` task
	handle: JoinHandle<()>,
	/// Forwards between `ldap3` and the server
	relay: Relay,
}

impl Driver {
	/// Spawns the task processing the connection's traffic.
	pub(crate) fn spawn(conn: LdapConnAsync, relay: Relay) -> Self {
		let handle = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});
		Self { handle, relay }
	}

	/// Whether either task has ended.
	fn is_finished(&self) -> bool {
		self.handle.is_finished() || self.relay.is_finished()
	}

	/// Waits up to `grace` for both tasks to end on their own.
	async fn finish(mut self, grace: Duration) {
		let Self { handle, relay } = &mut self;
		let closed = async {
			let _ = handle.await;
			relay.closed().await;
		};
		if tokio::time::timeout(grace, closed).await.is_err() {
			debug!("Connection did not close within {grace:?}, aborting");
		}
	}
}

impl Drop for Driver {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

/// Closes a [`Connection`] from another task.
///
/// Operations pending on the connection fail once it is closed.
#[derive(Debug, Clone)]
pub struct ConnectionCloser {
	/// Aborts the driver task
	driver: AbortHandle,
	/// Aborts the relay, closing the server's socket
	relay: AbortHandle,
}

impl ConnectionCloser {
	/// Tears the transport down without unbinding.
	pub fn close(&self) {
		self.relay.abort();
		self.driver.abort();
	}
}

/// A connection that completed every requested step: transport, TLS if
/// requested, and bind.
#[derive(Debug)]
pub struct Connection {
	/// Handle for issuing operations
	ldap: Ldap,
	/// The task owning the socket
	driver: Driver,
	/// Snapshot taken when the attempt completed
	state: ConnectionState,
	/// The server this connection talks to
	url: Url,
}

impl Connection {
	/// Assembles a connection from its parts.
	pub(crate) fn new(ldap: Ldap, driver: Driver, state: ConnectionState, url: Url) -> Self {
		Self { ldap, driver, state, url }
	}

	/// The state reached by the attempt that produced this connection.
	#[must_use]
	pub const fn state(&self) -> ConnectionState {
		self.state
	}

	/// The server this connection talks to.
	#[must_use]
	pub const fn url(&self) -> &Url {
		&self.url
	}

	/// The `ldap3` handle, for issuing directory operations.
	pub fn ldap(&mut self) -> &mut Ldap {
		&mut self.ldap
	}

	/// Whether the transport has gone away, either closed by the server or
	/// through a [`ConnectionCloser`].
	pub fn is_closed(&mut self) -> bool {
		self.driver.is_finished() || self.ldap.is_closed()
	}

	/// Returns a handle that can close this connection from another task.
	#[must_use]
	pub fn closer(&self) -> ConnectionCloser {
		ConnectionCloser {
			driver: self.driver.handle.abort_handle(),
			relay: self.driver.relay.abort_handle(),
		}
	}

	/// Unbinds and closes the transport.
	///
	/// The transport is closed even if the unbind fails, in which case the
	/// unbind error is returned.
	pub async fn release(self) -> Result<(), Error> {
		let Self { mut ldap, driver, url, .. } = self;
		let unbind = ldap.unbind().await;
		drop(ldap);
		driver.finish(RELEASE_GRACE).await;
		debug!(%url, "Connection released");
		unbind.map_err(Error::Transport)
	}
}

/// The outcome of [`Connector::test_connection`](crate::Connector::test_connection),
/// suitable for returning from an API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTestReport {
	/// The transport was opened.
	pub connected: bool,
	/// TLS was negotiated.
	pub secured: bool,
	/// The bind succeeded.
	pub authenticated: bool,
	/// Why the attempt failed, if it did.
	pub error: Option<ReportedError>,
}

impl ConnectionTestReport {
	/// Builds a report from the state an attempt reached and its failure.
	pub(crate) fn new(state: ConnectionState, error: Option<&Error>) -> Self {
		Self {
			connected: state.connected,
			secured: state.secured,
			authenticated: state.authenticated,
			error: error.map(|err| ReportedError { kind: err.kind(), message: err.report() }),
		}
	}

	/// Whether every requested step succeeded.
	#[must_use]
	pub const fn is_success(&self) -> bool {
		self.error.is_none()
	}
}

/// A failure as shown to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
	/// The failure category
	pub kind: ErrorKind,
	/// The error and its causes
	pub message: String,
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{ConnectionState, ConnectionTestReport};
	use crate::error::Error;

	#[test]
	fn report_serialization() {
		let state = ConnectionState { connected: true, secured: true, authenticated: false };
		let err = Error::Authentication {
			bind_dn: "cn=admin,dc=example,dc=org".to_owned(),
			code: 49,
			message: "Invalid credentials".to_owned(),
		};
		let report = ConnectionTestReport::new(state, Some(&err));
		assert!(!report.is_success());

		let json = serde_json::to_value(&report).unwrap();
		assert_eq!(
			json,
			serde_json::json!({
				"connected": true,
				"secured": true,
				"authenticated": false,
				"error": {
					"kind": "authentication",
					"message": concat!(
						"Bind as cn=admin,dc=example,dc=org rejected (49): ",
						"Invalid credentials",
					),
				},
			})
		);

		let report = ConnectionTestReport::new(
			ConnectionState { connected: true, secured: false, authenticated: true },
			None,
		);
		assert!(report.is_success());
		assert_eq!(serde_json::to_value(&report).unwrap()["error"], serde_json::Value::Null);
	}
}
