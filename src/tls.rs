//! TLS protocol versions and construction of the client-side TLS context.
use std::{collections::BTreeSet, fmt, io::BufReader, path::Path, str::FromStr, sync::Arc};

use rustls::{
	client::ServerCertVerifier, Certificate, ClientConfig, PrivateKey, SupportedProtocolVersion,
};
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};

use crate::{error::Error, request::TlsParameters};

/// A TLS protocol version that may be negotiated with the directory server.
///
/// Identifiers follow the JSSE naming (`TLSv1.2`, `TLSv1.3`), which is what
/// directory administrators usually have in their configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TlsProtocol {
	/// TLS 1.2
	Tls12,
	/// TLS 1.3
	Tls13,
}

impl TlsProtocol {
	/// The identifier of this version, e.g. `TLSv1.2`.
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Tls12 => "TLSv1.2",
			Self::Tls13 => "TLSv1.3",
		}
	}

	/// The rustls protocol version
	const fn version(self) -> &'static SupportedProtocolVersion {
		match self {
			Self::Tls12 => &rustls::version::TLS12,
			Self::Tls13 => &rustls::version::TLS13,
		}
	}
}

impl fmt::Display for TlsProtocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for TlsProtocol {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"TLSv1.2" => Ok(Self::Tls12),
			"TLSv1.3" => Ok(Self::Tls13),
			"SSLv2" | "SSLv3" | "TLSv1" | "TLSv1.1" => Err(Error::Configuration(format!(
				"TLS protocol {s} is not supported, use TLSv1.2 or TLSv1.3"
			))),
			_ => Err(Error::Configuration(format!("Unknown TLS protocol {s:?}"))),
		}
	}
}

impl TryFrom<String> for TlsProtocol {
	type Error = Error;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<TlsProtocol> for String {
	fn from(protocol: TlsProtocol) -> Self {
		protocol.as_str().to_owned()
	}
}

/// Parses a set of protocol identifiers such as `["TLSv1.2"]`.
pub fn parse_protocols<I, S>(identifiers: I) -> Result<BTreeSet<TlsProtocol>, Error>
where
	I: IntoIterator<Item = S>,
	S: AsRef<str>,
{
	identifiers.into_iter().map(|id| id.as_ref().parse()).collect()
}

/// A client certificate chain and its private key.
pub(crate) struct ClientIdentity {
	/// Leaf certificate first.
	chain: Vec<Certificate>,
	/// The key matching the leaf certificate.
	key: PrivateKey,
}

impl fmt::Debug for ClientIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientIdentity")
			.field("chain", &self.chain.len())
			.field("key", &"<redacted>")
			.finish()
	}
}

impl ClientIdentity {
	/// Loads the client identity configured in `params`, if any.
	pub(crate) async fn from_parameters(params: &TlsParameters) -> Result<Option<Self>, Error> {
		match (&params.client_certificate_path, &params.client_key_path) {
			(Some(cert_path), Some(key_path)) => {
				let chain = read_certificates(cert_path).await?;
				let key = read_private_key(key_path).await?;
				Ok(Some(Self { chain, key }))
			}
			(None, None) => Ok(None),
			_ => Err(Error::Configuration(
				"Both a client certificate and a client key must be specified".to_owned(),
			)),
		}
	}
}

/// Builds the client configuration for one connection attempt: restricted to
/// exactly `protocols`, with `verifier` making every trust decision.
pub(crate) fn client_config(
	protocols: &BTreeSet<TlsProtocol>,
	verifier: Arc<dyn ServerCertVerifier>,
	identity: Option<ClientIdentity>,
) -> Result<Arc<ClientConfig>, Error> {
	let versions: Vec<&'static SupportedProtocolVersion> =
		protocols.iter().map(|protocol| protocol.version()).collect();

	let builder = ClientConfig::builder()
		.with_safe_default_cipher_suites()
		.with_safe_default_kx_groups()
		.with_protocol_versions(&versions)
		.map_err(|err| Error::Configuration(format!("Unusable TLS protocol set: {err}")))?
		.with_custom_certificate_verifier(verifier);

	let config = match identity {
		Some(ClientIdentity { chain, key }) => builder
			.with_client_auth_cert(chain, key)
			.map_err(|err| Error::trust_with_source("Client certificate rejected", err))?,
		None => builder.with_no_client_auth(),
	};
	Ok(Arc::new(config))
}

/// Reads a PEM file, mapping I/O failures to trust initialization errors.
async fn read_pem(path: &Path) -> Result<Vec<Item>, Error> {
	let pem = tokio::fs::read(path).await.map_err(|err| {
		Error::trust_with_source(format!("Could not read {}", path.display()), err)
	})?;
	rustls_pemfile::read_all(&mut BufReader::new(pem.as_slice())).map_err(|err| {
		Error::trust_with_source(format!("Malformed PEM in {}", path.display()), err)
	})
}

/// Reads every certificate in a PEM file. At least one must be present.
pub(crate) async fn read_certificates(path: &Path) -> Result<Vec<Certificate>, Error> {
	let certificates: Vec<Certificate> = read_pem(path)
		.await?
		.into_iter()
		.filter_map(|item| match item {
			Item::X509Certificate(der) => Some(Certificate(der)),
			_ => None,
		})
		.collect();
	if certificates.is_empty() {
		return Err(Error::trust(format!("No certificate found in {}", path.display())));
	}
	Ok(certificates)
}

/// Reads the first private key in a PEM file.
async fn read_private_key(path: &Path) -> Result<PrivateKey, Error> {
	read_pem(path)
		.await?
		.into_iter()
		.find_map(|item| match item {
			Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
			_ => None,
		})
		.ok_or_else(|| Error::trust(format!("No private key found in {}", path.display())))
}
