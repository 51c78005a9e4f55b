//! Mapping of transport, `ldap3` and `rustls` failures onto [`Error`].
//!
//! The same symptom means different things depending on where it happened: an
//! `UnexpectedEof` while opening a plain socket is a transport problem, the
//! same EOF in the middle of a TLS handshake is the server refusing to
//! negotiate. The functions here take the attempt's context into account.
use std::io;

use ldap3::{LdapError, LdapResult};

use crate::{error::Error, transport::StartTlsReply};

/// `protocolError`
const RC_PROTOCOL_ERROR: u32 = 2;
/// `confidentialityRequired`
const RC_CONFIDENTIALITY_REQUIRED: u32 = 13;

/// Classifies the server's answer to StartTLS.
pub(crate) fn start_tls_outcome(outcome: io::Result<StartTlsReply>) -> Result<(), Error> {
	match outcome {
		Ok(StartTlsReply::Response(result)) if result.rc == 0 => Ok(()),
		Ok(StartTlsReply::Response(result) | StartTlsReply::Disconnect(result)) => {
			Err(server_result(result))
		}
		Err(err) if is_disconnect(&err) => Err(Error::Protocol {
			message: "Server closed the connection in response to StartTLS".to_owned(),
			source: Some(err.into()),
		}),
		Err(err) if err.kind() == io::ErrorKind::InvalidData => {
			Err(Error::Protocol { message: err.to_string(), source: Some(err.into()) })
		}
		Err(err) => Err(Error::Transport(err.into())),
	}
}

/// Classifies a failed TLS handshake.
///
/// `rejection` is the verdict recorded by the local trust evaluator, if it
/// rejected the server. It takes precedence over whatever the transport
/// reported afterwards.
pub(crate) fn handshake_failure(err: io::Error, rejection: Option<rustls::Error>) -> Error {
	if let Some(source) = rejection {
		return Error::SslContextInitialization { source };
	}

	if let Some(tls) = rustls_cause(&err) {
		return match tls {
			rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
				Error::SslContextInitialization { source: tls }
			}
			tls => Error::Protocol { message: tls.to_string(), source: Some(err.into()) },
		};
	}

	if is_disconnect(&err) {
		return Error::Protocol {
			message: "Server closed the connection during the TLS handshake".to_owned(),
			source: Some(err.into()),
		};
	}
	Error::Transport(err.into())
}

/// Classifies the outcome of the simple bind.
///
/// A notice of disconnection received meanwhile explains the failure better
/// than anything `ldap3` reports, so it takes precedence.
pub(crate) fn bind_outcome(
	outcome: Result<LdapResult, LdapError>,
	notice: Option<LdapResult>,
	bind_dn: &str,
) -> Result<(), Error> {
	if let Some(notice) = notice {
		return Err(server_result(notice));
	}

	let result = match outcome {
		Ok(result) => result,
		Err(
			err @ (LdapError::ResultRecv { .. }
			| LdapError::OpSend { .. }
			| LdapError::EndOfStream
			| LdapError::Io { .. }),
		) => {
			return Err(Error::Protocol {
				message: "Server closed the connection while binding".to_owned(),
				source: Some(err),
			})
		}
		Err(err) => return Err(Error::Transport(err)),
	};

	match result.rc {
		0 => Ok(()),
		RC_PROTOCOL_ERROR | RC_CONFIDENTIALITY_REQUIRED => Err(server_result(result)),
		code => Err(Error::Authentication {
			bind_dn: bind_dn.to_owned(),
			code,
			message: diagnostic(&result),
		}),
	}
}

/// A result the server refused the operation with.
fn server_result(result: LdapResult) -> Error {
	Error::Protocol { message: diagnostic(&result), source: Some(result.into()) }
}

/// The server's diagnostic text, or the result code if the server sent none.
fn diagnostic(result: &LdapResult) -> String {
	if result.text.is_empty() {
		result.to_string()
	} else {
		result.text.clone()
	}
}

/// The rustls error behind an I/O failure, if there is one.
fn rustls_cause(err: &io::Error) -> Option<rustls::Error> {
	err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()).cloned()
}

/// Whether the peer went away mid-exchange.
fn is_disconnect(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::UnexpectedEof
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::BrokenPipe
	)
}
