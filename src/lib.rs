//! Establish authenticated connections to LDAP directory servers.
//!
//! A [`Connector`] turns a [`ConnectionRequest`] into a bound [`Connection`]
//! in one deterministic attempt: open the transport, negotiate TLS when the
//! request asks for it (StartTLS or `ldaps://`), then perform a simple bind.
//! Certificate trust is delegated to a [`TrustProvider`], and only the TLS
//! versions enabled on the connector are ever offered.
//!
//! When an attempt fails, the [`Error`] says which side is at fault. A
//! certificate rejected by the local trust provider is
//! [`Error::SslContextInitialization`], a server refusing the handshake or the
//! StartTLS operation is [`Error::Protocol`] carrying the server's own text,
//! and rejected credentials are [`Error::Authentication`]. The transport is
//! always closed before an error is returned.
//!
//! The directory operations themselves are left to the [`ldap3`] crate, whose
//! handle is available through [`Connection::ldap`]. The connector opens the
//! socket, StartTLS and TLS itself and hands the result to `ldap3` through a
//! relay on an ephemeral loopback port, which lets it catch a notice of
//! disconnection: such a notice fails the attempt with [`Error::Protocol`]
//! carrying the server's text.
//!
//! # Getting started
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::{collections::HashMap, sync::Arc};
//!
//! use ldap_connector::{
//! 	config::{ConnectionSettings, ConnectorConfig},
//! 	ConnectionRequest, Connector,
//! };
//!
//! // Configuration can also be deserialized with serde. It's hand-constructed
//! // here for demonstration purposes.
//! let config = ConnectorConfig::default();
//! let named: HashMap<String, ConnectionSettings> = HashMap::new();
//! let connector = Connector::from_config(&config, Arc::new(named)).await?;
//!
//! let request = ConnectionRequest::new(
//! 	"ldap://localhost:389".parse()?,
//! 	"cn=admin,dc=example,dc=org",
//! 	"admin",
//! )
//! .with_start_tls(true);
//!
//! let mut connection = connector.connect(&request).await?;
//! let whoami = connection.ldap().extended(ldap3::exop::WhoAmI).await?.success()?;
//! println!("Bound, server says: {whoami:?}");
//! connection.release().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! Only simple binds are supported.

mod classify;
pub mod config;
mod connection;
mod connector;
pub mod error;
mod message;
mod relay;
mod request;
pub mod tls;
mod transport;
pub mod trust;

pub use config::{ConnectionSettings, ConnectorConfig, SettingsLookup};
pub use connection::{
	Connection, ConnectionCloser, ConnectionState, ConnectionTestReport, ReportedError,
};
pub use connector::Connector;
pub use error::{Error, ErrorKind, Phase};
pub use request::{BindCredential, ConnectionRequest, SecurityMode, TlsParameters};
pub use tls::TlsProtocol;
pub use trust::{
	CustomCaTrustProvider, StrictTrustProvider, TrustAllProvider, TrustEvaluator, TrustProvider,
};
