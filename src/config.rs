//! Config for the connector and for named connection settings.
use std::{
	collections::{BTreeSet, HashMap},
	fmt,
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
	error::Error,
	request::{BindCredential, ConnectionRequest, TlsParameters},
	tls::TlsProtocol,
	trust::{CustomCaTrustProvider, StrictTrustProvider, TrustProvider},
};

/// Timeout used when neither the configuration nor the request names one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector configuration.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnectorConfig {
	/// Budget for a whole connection attempt, transport through bind
	#[serde(default = "default_timeout")]
	pub timeout: Duration,
	/// TLS versions that may be negotiated
	#[serde(default = "default_protocols")]
	pub enabled_tls_protocols: BTreeSet<TlsProtocol>,
	/// How server certificates are validated
	#[serde(default)]
	pub trust: TrustConfig,
}

impl Default for ConnectorConfig {
	fn default() -> Self {
		Self {
			timeout: default_timeout(),
			enabled_tls_protocols: default_protocols(),
			trust: TrustConfig::default(),
		}
	}
}

/// Default for [`ConnectorConfig::timeout`]
const fn default_timeout() -> Duration {
	DEFAULT_TIMEOUT
}

/// Default for [`ConnectorConfig::enabled_tls_protocols`]
fn default_protocols() -> BTreeSet<TlsProtocol> {
	BTreeSet::from([TlsProtocol::Tls12])
}

/// Certificate trust configuration
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum TrustConfig {
	/// Validate against the bundled webpki root store
	#[default]
	Strict,
	/// Validate against the CAs in a PEM bundle
	CustomCa {
		/// TLS root certificates path
		root_certificates_path: PathBuf,
	},
}

impl TrustConfig {
	/// Builds the trust provider described by this configuration.
	pub async fn provider(&self) -> Result<Arc<dyn TrustProvider>, Error> {
		Ok(match self {
			Self::Strict => Arc::new(StrictTrustProvider::new()),
			Self::CustomCa { root_certificates_path } => {
				Arc::new(CustomCaTrustProvider::from_pem_file(root_certificates_path).await?)
			}
		})
	}
}

/// Stored settings for reaching one directory server.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
	/// The URL to connect to the server with. Supports the ldap and ldaps
	/// schemes
	pub url: Url,
	/// The DN to bind as
	pub bind_dn: String,
	/// The password to bind with
	pub bind_password: BindCredential,
	/// TLS config
	#[serde(default)]
	pub tls: TlsConfig,
	/// Overrides the connector's timeout
	#[serde(default)]
	pub timeout: Option<Duration>,
}

impl ConnectionSettings {
	/// Creates a [`ConnectionRequest`] based on these settings.
	#[must_use]
	pub fn to_request(&self) -> ConnectionRequest {
		let request =
			ConnectionRequest::new(
				self.url.clone(),
				self.bind_dn.clone(),
				self.bind_password.clone(),
			)
				.with_start_tls(self.tls.starttls)
				.with_trust_all_certificates(self.tls.no_tls_verify)
				.with_tls(TlsParameters {
					root_certificates_path: self.tls.root_certificates_path.clone(),
					client_certificate_path: self.tls.client_certificate_path.clone(),
					client_key_path: self.tls.client_key_path.clone(),
				});
		match self.timeout {
			Some(timeout) => request.with_timeout(timeout),
			None => request,
		}
	}
}

/// TLS Configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

/// Read-only access to stored connection settings, by name.
pub trait SettingsLookup: Send + Sync + fmt::Debug {
	/// Returns the settings stored under `name`, if any.
	fn connection_settings(&self, name: &str) -> Option<ConnectionSettings>;
}

impl<S: std::hash::BuildHasher + Send + Sync> SettingsLookup
	for HashMap<String, ConnectionSettings, S>
{
	fn connection_settings(&self, name: &str) -> Option<ConnectionSettings> {
		self.get(name).cloned()
	}
}
