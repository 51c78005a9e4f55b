//! Description of a single connection attempt
use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Default LDAP port
const LDAP_PORT: u16 = 389;
/// Default LDAPS port
const LDAPS_PORT: u16 = 636;

/// A bind password. Never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindCredential(String);

impl BindCredential {
	/// Wraps a secret.
	#[must_use]
	pub const fn new(secret: String) -> Self {
		Self(secret)
	}

	/// The secret itself, to be handed to the bind operation.
	#[must_use]
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for BindCredential {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("BindCredential(<redacted>)")
	}
}

impl From<String> for BindCredential {
	fn from(secret: String) -> Self {
		Self(secret)
	}
}

impl From<&str> for BindCredential {
	fn from(secret: &str) -> Self {
		Self(secret.to_owned())
	}
}

/// Optional TLS material for an attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsParameters {
	/// PEM bundle of CA certificates. When set, the server certificate is
	/// validated against this bundle instead of the connector's trust
	/// provider.
	pub root_certificates_path: Option<PathBuf>,
	/// PEM file holding the client certificate chain
	pub client_certificate_path: Option<PathBuf>,
	/// PEM file holding the client private key
	pub client_key_path: Option<PathBuf>,
}

/// How the transport is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
	/// No TLS at all
	Plain,
	/// Plain connection upgraded with the StartTLS extended operation
	StartTls,
	/// TLS from the first byte (`ldaps://`)
	Ldaps,
}

impl SecurityMode {
	/// Whether a TLS handshake takes place
	#[must_use]
	pub const fn is_secure(self) -> bool {
		!matches!(self, Self::Plain)
	}
}

impl fmt::Display for SecurityMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Plain => f.write_str("plain"),
			Self::StartTls => f.write_str("starttls"),
			Self::Ldaps => f.write_str("ldaps"),
		}
	}
}

/// An immutable description of one connection attempt.
///
/// ```
/// use ldap_connector::ConnectionRequest;
///
/// let request = ConnectionRequest::new(
/// 	"ldap://localhost:389".parse().unwrap(),
/// 	"cn=admin,dc=example,dc=org",
/// 	"admin",
/// )
/// .with_start_tls(true);
/// assert_eq!(request.host().unwrap(), "localhost");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
	/// The server to connect to
	url: Url,
	/// The DN to bind as
	bind_dn: String,
	/// The bind password
	bind_credential: BindCredential,
	/// Upgrade a plain connection with StartTLS
	use_start_tls: bool,
	/// Skip certificate validation
	trust_all_certificates: bool,
	/// Optional TLS material
	tls: TlsParameters,
	/// Overrides the connector's default timeout
	timeout: Option<Duration>,
}

impl ConnectionRequest {
	/// Creates a request for a plain or `ldaps://` connection, depending on
	/// the URL scheme, with certificate validation enabled.
	pub fn new(
		url: Url,
		bind_dn: impl Into<String>,
		bind_credential: impl Into<BindCredential>,
	) -> Self {
		Self {
			url,
			bind_dn: bind_dn.into(),
			bind_credential: bind_credential.into(),
			use_start_tls: false,
			trust_all_certificates: false,
			tls: TlsParameters::default(),
			timeout: None,
		}
	}

	/// Upgrade the connection with StartTLS before binding.
	#[must_use]
	pub fn with_start_tls(mut self, use_start_tls: bool) -> Self {
		self.use_start_tls = use_start_tls;
		self
	}

	/// Accept any server certificate. Meant for connectivity tests only.
	#[must_use]
	pub fn with_trust_all_certificates(mut self, trust_all: bool) -> Self {
		self.trust_all_certificates = trust_all;
		self
	}

	/// Use the given TLS material.
	#[must_use]
	pub fn with_tls(mut self, tls: TlsParameters) -> Self {
		self.tls = tls;
		self
	}

	/// Bound the whole attempt by `timeout` instead of the connector's default.
	#[must_use]
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	/// The server to connect to
	#[must_use]
	pub const fn url(&self) -> &Url {
		&self.url
	}

	/// The DN to bind as
	#[must_use]
	pub fn bind_dn(&self) -> &str {
		&self.bind_dn
	}

	/// The bind password
	#[must_use]
	pub const fn bind_credential(&self) -> &BindCredential {
		&self.bind_credential
	}

	/// Whether StartTLS was requested
	#[must_use]
	pub const fn use_start_tls(&self) -> bool {
		self.use_start_tls
	}

	/// Whether certificate validation is skipped
	#[must_use]
	pub const fn trust_all_certificates(&self) -> bool {
		self.trust_all_certificates
	}

	/// Optional TLS material
	#[must_use]
	pub const fn tls(&self) -> &TlsParameters {
		&self.tls
	}

	/// The timeout override, if any
	#[must_use]
	pub const fn timeout(&self) -> Option<Duration> {
		self.timeout
	}

	/// The security mode implied by the URL scheme and the StartTLS flag.
	pub fn security_mode(&self) -> Result<SecurityMode, Error> {
		match (self.url.scheme(), self.use_start_tls) {
			("ldap", false) => Ok(SecurityMode::Plain),
			("ldap", true) => Ok(SecurityMode::StartTls),
			("ldaps", false) => Ok(SecurityMode::Ldaps),
			("ldaps", true) => Err(Error::Configuration(
				"StartTLS cannot be used on an ldaps:// connection".to_owned(),
			)),
			(scheme, _) => Err(Error::Configuration(format!(
				"Unsupported URL scheme {scheme:?}, expected ldap or ldaps"
			))),
		}
	}

	/// The host to connect to, also used as the TLS server name.
	pub fn host(&self) -> Result<&str, Error> {
		match self.url.host_str() {
			Some(host) if !host.is_empty() => {
				Ok(host.trim_start_matches('[').trim_end_matches(']'))
			}
			_ => Err(Error::Configuration(format!("URL {} has no host", self.url))),
		}
	}

	/// The port to connect to, defaulting per scheme.
	#[must_use]
	pub fn port(&self) -> u16 {
		self.url.port().unwrap_or(if self.url.scheme() == "ldaps" { LDAPS_PORT } else { LDAP_PORT })
	}

	/// Checks the request for contradictions, returning its security mode.
	pub fn validate(&self) -> Result<SecurityMode, Error> {
		let mode = self.security_mode()?;
		self.host()?;
		if self.bind_dn.is_empty() {
			return Err(Error::Configuration("The bind DN must not be empty".to_owned()));
		}
		if mode == SecurityMode::Plain
			&& (self.tls.client_certificate_path.is_some() || self.tls.client_key_path.is_some())
		{
			return Err(Error::Configuration(
				"A client certificate requires StartTLS or ldaps://".to_owned(),
			));
		}
		Ok(mode)
	}
}
