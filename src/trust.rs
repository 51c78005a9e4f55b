//! Certificate trust decisions.
//!
//! A [`TrustProvider`] hands out a [`TrustEvaluator`] for each host the
//! connector talks to. The evaluator is consulted by rustls during the
//! handshake and either accepts the presented chain or rejects it with a
//! [`rustls::Error`] describing why.
use std::{
	fmt,
	io::BufReader,
	path::Path,
	sync::{Arc, Mutex},
	time::SystemTime,
};

use rustls::{
	client::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier, WebPkiVerifier},
	Certificate, DigitallySignedStruct, OwnedTrustAnchor, RootCertStore, ServerName,
	SignatureScheme,
};
use tracing::{debug, warn};

use crate::{error::Error, tls};

/// Decides whether a certificate chain presented during a handshake is
/// acceptable.
pub type TrustEvaluator = Arc<dyn ServerCertVerifier>;

/// Produces trust evaluators, keyed by the host being connected to.
pub trait TrustProvider: Send + Sync + fmt::Debug {
	/// Returns the evaluator to use for a handshake with `host`.
	fn trust_manager_for(&self, host: &str) -> Result<TrustEvaluator, Error>;
}

/// Validates the chain against the bundled Mozilla root store and checks
/// that the certificate is valid for the host.
#[derive(Debug, Clone)]
pub struct StrictTrustProvider {
	/// Trust anchors
	roots: Arc<RootCertStore>,
}

impl StrictTrustProvider {
	/// Creates a provider trusting the webpki root store.
	#[must_use]
	pub fn new() -> Self {
		let mut roots = RootCertStore::empty();
		roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
			OwnedTrustAnchor::from_subject_spki_name_constraints(
				anchor.subject,
				anchor.spki,
				anchor.name_constraints,
			)
		}));
		Self { roots: Arc::new(roots) }
	}

	/// Creates a provider trusting exactly the given root store.
	#[must_use]
	pub fn with_roots(roots: RootCertStore) -> Self {
		Self { roots: Arc::new(roots) }
	}
}

impl Default for StrictTrustProvider {
	fn default() -> Self {
		Self::new()
	}
}

impl TrustProvider for StrictTrustProvider {
	fn trust_manager_for(&self, host: &str) -> Result<TrustEvaluator, Error> {
		Ok(Arc::new(HostVerifier::new(host, self.roots.clone())))
	}
}

/// Validates the chain against an explicitly supplied CA bundle, checking the
/// host name as well.
#[derive(Debug, Clone)]
pub struct CustomCaTrustProvider {
	/// Trust anchors loaded from the bundle
	roots: Arc<RootCertStore>,
}

impl CustomCaTrustProvider {
	/// Parses a PEM bundle holding one or more CA certificates.
	pub fn from_pem(pem: &[u8]) -> Result<Self, Error> {
		let ders = rustls_pemfile::certs(&mut BufReader::new(pem))
			.map_err(|err| Error::trust_with_source("Malformed CA bundle", err))?;
		Self::from_der(ders.into_iter().map(Certificate))
	}

	/// Reads and parses a PEM bundle from disk.
	pub async fn from_pem_file(path: &Path) -> Result<Self, Error> {
		Self::from_der(tls::read_certificates(path).await?)
	}

	/// Builds the root store, failing on the first certificate webpki cannot
	/// use as a trust anchor.
	fn from_der(certificates: impl IntoIterator<Item = Certificate>) -> Result<Self, Error> {
		let mut roots = RootCertStore::empty();
		for certificate in certificates {
			roots
				.add(&certificate)
				.map_err(|err| Error::trust_with_source("Unusable CA certificate", err))?;
		}
		if roots.is_empty() {
			return Err(Error::trust("CA bundle contains no certificates"));
		}
		Ok(Self { roots: Arc::new(roots) })
	}
}

impl TrustProvider for CustomCaTrustProvider {
	fn trust_manager_for(&self, host: &str) -> Result<TrustEvaluator, Error> {
		Ok(Arc::new(HostVerifier::new(host, self.roots.clone())))
	}
}

/// Accepts every certificate without any check. Only meant for testing the
/// reachability of a server from a configuration dialog.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustAllProvider;

impl TrustProvider for TrustAllProvider {
	fn trust_manager_for(&self, host: &str) -> Result<TrustEvaluator, Error> {
		debug!(host, "Certificate validation disabled");
		Ok(Arc::new(AcceptAnyCertificate))
	}
}

/// Chain and host name validation through webpki.
#[derive(Debug)]
struct HostVerifier {
	/// The host the evaluator was handed out for, used for diagnostics.
	host: String,
	/// Trust anchors
	roots: Arc<RootCertStore>,
}

impl HostVerifier {
	/// Creates a verifier for `host`.
	fn new(host: &str, roots: Arc<RootCertStore>) -> Self {
		Self { host: host.to_owned(), roots }
	}
}

impl ServerCertVerifier for HostVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &Certificate,
		intermediates: &[Certificate],
		server_name: &ServerName,
		scts: &mut dyn Iterator<Item = &[u8]>,
		ocsp_response: &[u8],
		now: SystemTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		WebPkiVerifier::new(self.roots.clone(), None)
			.verify_server_cert(end_entity, intermediates, server_name, scts, ocsp_response, now)
			.map_err(|err| {
				warn!(host = %self.host, "Server certificate rejected: {err}");
				err
			})
	}
}

/// The verifier behind [`TrustAllProvider`].
#[derive(Debug)]
pub(crate) struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
	fn verify_server_cert(
		&self,
		_end_entity: &Certificate,
		_intermediates: &[Certificate],
		_server_name: &ServerName,
		_scts: &mut dyn Iterator<Item = &[u8]>,
		_ocsp_response: &[u8],
		_now: SystemTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}
}

/// Remembers the first rejection made by the wrapped evaluator, so a failed
/// handshake can be attributed to the local side after the fact.
pub(crate) struct RecordingVerifier {
	/// The evaluator making the actual decisions
	inner: TrustEvaluator,
	/// Where the rejection is stored
	rejection: TrustRejection,
}

impl RecordingVerifier {
	/// Wraps `inner`, returning the wrapper and a handle to its record.
	pub(crate) fn wrap(inner: TrustEvaluator) -> (Arc<Self>, TrustRejection) {
		let rejection = TrustRejection::default();
		(Arc::new(Self { inner, rejection: rejection.clone() }), rejection)
	}

	/// Stores `err` if it is the first rejection and passes it through.
	fn record<T>(&self, result: Result<T, rustls::Error>) -> Result<T, rustls::Error> {
		if let Err(err) = &result {
			self.rejection.set(err);
		}
		result
	}
}

impl ServerCertVerifier for RecordingVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &Certificate,
		intermediates: &[Certificate],
		server_name: &ServerName,
		scts: &mut dyn Iterator<Item = &[u8]>,
		ocsp_response: &[u8],
		now: SystemTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		self.record(self.inner.verify_server_cert(
			end_entity,
			intermediates,
			server_name,
			scts,
			ocsp_response,
			now,
		))
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &Certificate,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.record(self.inner.verify_tls12_signature(message, cert, dss))
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &Certificate,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		self.record(self.inner.verify_tls13_signature(message, cert, dss))
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.inner.supported_verify_schemes()
	}

	fn request_scts(&self) -> bool {
		self.inner.request_scts()
	}
}

/// Shared slot holding the first local trust rejection of a handshake.
#[derive(Clone, Default)]
pub(crate) struct TrustRejection(Arc<Mutex<Option<rustls::Error>>>);

impl TrustRejection {
	/// Stores `err` unless a rejection was recorded already.
	fn set(&self, err: &rustls::Error) {
		if let Ok(mut slot) = self.0.lock() {
			slot.get_or_insert_with(|| err.clone());
		}
	}

	/// Takes the recorded rejection, if any.
	pub(crate) fn take(&self) -> Option<rustls::Error> {
		self.0.lock().ok().and_then(|mut slot| slot.take())
	}
}

impl fmt::Debug for TrustRejection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let recorded = self.0.lock().map(|slot| slot.clone()).ok().flatten();
		f.debug_tuple("TrustRejection").field(&recorded).finish()
	}
}
