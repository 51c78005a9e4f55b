//! The socket to the directory server: TCP, StartTLS and the TLS handshake.
use std::{io, sync::Arc};

use ldap3::LdapResult;
use rustls::{ClientConfig, ServerName};
use tokio::{
	io::{AsyncRead, AsyncWrite, AsyncWriteExt},
	net::TcpStream,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

use crate::message::{self, MessageReader};

/// Message ID of the StartTLS request, the first one on a connection
const START_TLS_ID: u8 = 1;

/// A byte stream to the directory server
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// The established transport, plain or TLS
pub(crate) type Upstream = Box<dyn Stream>;

/// Opens the TCP connection.
pub(crate) async fn open(host: &str, port: u16) -> io::Result<TcpStream> {
	let stream = TcpStream::connect((host, port)).await?;
	stream.set_nodelay(true)?;
	Ok(stream)
}

/// How the server answered StartTLS
#[derive(Debug)]
pub(crate) enum StartTlsReply {
	/// The `ExtendedResponse` to the request
	Response(LdapResult),
	/// A notice of disconnection sent instead
	Disconnect(LdapResult),
}

/// Sends the StartTLS extended operation and reads the server's answer.
pub(crate) async fn start_tls(stream: &mut TcpStream) -> io::Result<StartTlsReply> {
	let request = message::start_tls_request(i64::from(START_TLS_ID))?;
	stream.write_all(&request).await?;
	stream.flush().await?;

	let mut reader = MessageReader::default();
	loop {
		let Some(frame) = reader.next(&mut *stream).await? else {
			return Err(io::ErrorKind::UnexpectedEof.into());
		};
		let Some(message) = frame.message else {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				"Malformed response to StartTLS",
			));
		};
		if message.id == u64::from(START_TLS_ID) {
			return message.result.map(StartTlsReply::Response).ok_or_else(|| {
				io::Error::new(io::ErrorKind::InvalidData, "StartTLS answered with a non-result")
			});
		}
		if let Some(result) = message.into_notice_of_disconnection() {
			return Ok(StartTlsReply::Disconnect(result));
		}
		debug!("Ignoring unsolicited message while waiting for StartTLS");
	}
}

/// Performs the TLS handshake on `stream`.
pub(crate) async fn handshake(
	stream: TcpStream,
	config: Arc<ClientConfig>,
	server_name: ServerName,
) -> io::Result<TlsStream<TcpStream>> {
	TlsConnector::from(config).connect(server_name, stream).await
}
