//! Connecting and binding to a directory server

use std::{collections::BTreeSet, future::Future, sync::Arc, time::Duration};

use ldap3::LdapConnAsync;
use rustls::{ClientConfig, ServerName};
use tokio::{net::TcpStream, time::Instant};
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::{
	classify,
	config::{ConnectorConfig, SettingsLookup},
	connection::{Connection, ConnectionState, ConnectionTestReport, Driver},
	error::{Error, Phase},
	relay::Relay,
	request::{ConnectionRequest, SecurityMode},
	tls::{self, ClientIdentity, TlsProtocol},
	transport::{self, Upstream},
	trust::{
		CustomCaTrustProvider, RecordingVerifier, TrustAllProvider, TrustProvider, TrustRejection,
	},
};

/// Establishes authenticated connections to directory servers.
///
/// A connector holds no per-attempt state and can be cloned and shared
/// between tasks freely. It never retries; use
/// [`ErrorKind::is_retryable`](crate::ErrorKind::is_retryable) to decide
/// whether another attempt makes sense.
#[derive(Debug, Clone)]
pub struct Connector {
	/// Budget of an attempt whose request names none
	default_timeout: Duration,
	/// TLS versions that may be negotiated
	protocols: BTreeSet<TlsProtocol>,
	/// Where named settings are resolved
	settings: Arc<dyn SettingsLookup>,
	/// Decides on server certificates unless a request overrides it
	trust: Arc<dyn TrustProvider>,
}

/// How far an attempt got
#[derive(Debug, Clone, Copy)]
struct Progress {
	/// The phase in progress
	phase: Phase,
	/// What has been achieved so far
	state: ConnectionState,
}

/// TLS material prepared for a single attempt
struct TlsContext {
	/// The client configuration for the handshake
	config: Arc<ClientConfig>,
	/// Where the trust evaluator records its rejection
	rejection: TrustRejection,
	/// The name the server certificate is checked against
	server_name: ServerName,
	/// Upgrade a plain connection instead of starting with TLS
	start_tls: bool,
}

impl Connector {
	/// Creates a new [`Connector`].
	#[must_use]
	pub fn new(
		default_timeout: Duration,
		protocols: BTreeSet<TlsProtocol>,
		settings: Arc<dyn SettingsLookup>,
		trust: Arc<dyn TrustProvider>,
	) -> Self {
		Self { default_timeout, protocols, settings, trust }
	}

	/// Creates a [`Connector`] from its configuration, loading the trust
	/// material it names.
	pub async fn from_config(
		config: &ConnectorConfig,
		settings: Arc<dyn SettingsLookup>,
	) -> Result<Self, Error> {
		let trust = config.trust.provider().await?;
		Ok(Self::new(config.timeout, config.enabled_tls_protocols.clone(), settings, trust))
	}

	/// Connects to the server described by `request` and binds.
	///
	/// Every failure closes the transport before returning. Dropping the
	/// returned future does the same.
	pub async fn connect(&self, request: &ConnectionRequest) -> Result<Connection, Error> {
		self.attempt(request).await.0
	}

	/// Like [`Connector::connect`], but gives up with [`Error::Cancelled`] as
	/// soon as `cancel` completes.
	pub async fn connect_until<F>(
		&self,
		request: &ConnectionRequest,
		cancel: F,
	) -> Result<Connection, Error>
	where
		F: Future<Output = ()> + Send,
	{
		tokio::select! {
			result = self.connect(request) => result,
			() = cancel => {
				info!(url = %request.url(), "Connection attempt cancelled");
				Err(Error::Cancelled)
			}
		}
	}

	/// Connects using the settings stored under `name`.
	pub async fn connect_named(&self, name: &str) -> Result<Connection, Error> {
		let settings = self.settings.connection_settings(name).ok_or_else(|| {
			Error::Configuration(format!("No connection settings named {name:?}"))
		})?;
		self.connect(&settings.to_request()).await
	}

	/// Connects, reports how far the attempt got and releases the connection
	/// again.
	pub async fn test_connection(&self, request: &ConnectionRequest) -> ConnectionTestReport {
		let (result, state) = self.attempt(request).await;
		match result {
			Ok(connection) => {
				if let Err(err) = connection.release().await {
					warn!(url = %request.url(), "Failed to release test connection: {err}");
				}
				ConnectionTestReport::new(state, None)
			}
			Err(err) => ConnectionTestReport::new(state, Some(&err)),
		}
	}

	/// Runs one attempt, returning its outcome along with the state it
	/// reached.
	async fn attempt(
		&self,
		request: &ConnectionRequest,
	) -> (Result<Connection, Error>, ConnectionState) {
		let mut progress =
			Progress { phase: Phase::Connecting, state: ConnectionState::default() };
		let result = self.run(request, &mut progress).await;
		match &result {
			Ok(_) => info!(url = %request.url(), "Connected to directory server"),
			Err(err) => warn!(
				url = %request.url(),
				kind = ?err.kind(),
				phase = %progress.phase,
				"Connection attempt failed: {}",
				err.report()
			),
		}
		(result, progress.state)
	}

	/// Validates the request, prepares TLS and runs the network steps under
	/// the attempt's deadline.
	async fn run(
		&self,
		request: &ConnectionRequest,
		progress: &mut Progress,
	) -> Result<Connection, Error> {
		let mode = request.validate()?;
		let host = request.host()?;
		let budget = request.timeout().unwrap_or(self.default_timeout);
		let deadline = Instant::now() + budget;
		debug!(url = %request.url(), %mode, ?budget, "Connecting");

		let tls = match mode {
			SecurityMode::Plain => None,
			SecurityMode::StartTls | SecurityMode::Ldaps => {
				Some(self.tls_context(request, mode, host).await?)
			}
		};

		let outcome =
			tokio::time::timeout_at(deadline, Self::establish(request, host, tls, &mut *progress))
				.await;
		outcome.unwrap_or(Err(Error::Timeout { phase: progress.phase, budget }))
	}

	/// Opens the transport, negotiates TLS and binds.
	async fn establish(
		request: &ConnectionRequest,
		host: &str,
		tls: Option<TlsContext>,
		progress: &mut Progress,
	) -> Result<Connection, Error> {
		let stream = transport::open(host, request.port())
			.await
			.map_err(|err| Error::Transport(err.into()))?;
		let secured = tls.is_some();
		let upstream: Upstream = match tls {
			Some(tls) => {
				progress.phase = Phase::Negotiating;
				Box::new(Self::negotiate(stream, tls).await?)
			}
			None => Box::new(stream),
		};
		progress.state.connected = true;
		progress.state.secured = secured;
		debug!(url = %request.url(), secured = progress.state.secured, "Transport established");

		progress.phase = Phase::Binding;
		let relay = Relay::start(upstream).await.map_err(|err| Error::Transport(err.into()))?;
		let notice = relay.notice();
		let (conn, mut ldap) =
			LdapConnAsync::from_url(relay.url()).await.map_err(Error::Transport)?;
		let driver = Driver::spawn(conn, relay);

		let outcome = ldap.simple_bind(request.bind_dn(), request.bind_credential().expose()).await;
		classify::bind_outcome(outcome, notice.take(), request.bind_dn())?;
		progress.state.authenticated = true;
		debug!(bind_dn = request.bind_dn(), "Bind succeeded");

		Ok(Connection::new(ldap, driver, progress.state, request.url().clone()))
	}

	/// Upgrades the plain socket: StartTLS if requested, then the handshake.
	async fn negotiate(
		mut stream: TcpStream,
		tls: TlsContext,
	) -> Result<TlsStream<TcpStream>, Error> {
		if tls.start_tls {
			classify::start_tls_outcome(transport::start_tls(&mut stream).await)?;
			debug!("StartTLS accepted");
		}
		let TlsContext { config, rejection, server_name, .. } = tls;
		transport::handshake(stream, config, server_name)
			.await
			.map_err(|err| classify::handshake_failure(err, rejection.take()))
	}

	/// Builds the TLS client configuration for one attempt, choosing the trust
	/// evaluator the request asks for.
	async fn tls_context(
		&self,
		request: &ConnectionRequest,
		mode: SecurityMode,
		host: &str,
	) -> Result<TlsContext, Error> {
		if self.protocols.is_empty() {
			return Err(Error::Configuration(format!(
				"No TLS protocol is enabled, but {mode} was requested"
			)));
		}
		let server_name = ServerName::try_from(host).map_err(|_| {
			Error::Configuration(format!("{host} cannot be used as a TLS server name"))
		})?;

		let evaluator = if request.trust_all_certificates() {
			TrustAllProvider.trust_manager_for(host)?
		} else if let Some(path) = &request.tls().root_certificates_path {
			CustomCaTrustProvider::from_pem_file(path).await?.trust_manager_for(host)?
		} else {
			self.trust.trust_manager_for(host)?
		};
		let (verifier, rejection) = RecordingVerifier::wrap(evaluator);
		let identity = ClientIdentity::from_parameters(request.tls()).await?;
		let config = tls::client_config(&self.protocols, verifier, identity)?;
		Ok(TlsContext { config, rejection, server_name, start_tls: mode == SecurityMode::StartTls })
	}
}
