//! Hands an established transport over to `ldap3`.
//!
//! `ldap3` opens its own socket, so it is pointed at a loopback listener that
//! accepts a single connection and forwards it to the transport set up by the
//! connector. On the way back the server's messages are inspected: `ldap3`
//! drops unsolicited notifications, so a notice of disconnection is recorded
//! here before the client side is closed.
use std::{
	fmt, io,
	net::Ipv4Addr,
	sync::{Arc, Mutex},
};

use ldap3::LdapResult;
use tokio::{
	io::{AsyncWriteExt, ReadHalf, WriteHalf},
	net::{
		tcp::{OwnedReadHalf, OwnedWriteHalf},
		TcpListener,
	},
	task::{AbortHandle, JoinHandle},
};
use tracing::{debug, warn};
use url::Url;

use crate::{
	message::{Message, MessageReader},
	transport::Upstream,
};

/// Forwards one `ldap3` connection to the directory server. Dropping the
/// relay closes both sides.
#[derive(Debug)]
pub(crate) struct Relay {
	/// Where `ldap3` connects to
	url: Url,
	/// The notice of disconnection, once the server sent one
	notice: DisconnectNotice,
	/// The forwarding task
	task: JoinHandle<()>,
}

impl Relay {
	/// Starts listening on an ephemeral loopback port and forwards the first
	/// connection accepted there to `upstream`.
	pub(crate) async fn start(upstream: Upstream) -> io::Result<Self> {
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
		let url = Url::parse(&format!("ldap://{}", listener.local_addr()?))
			.map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
		let notice = DisconnectNotice::default();
		let task = tokio::spawn(relay(listener, upstream, notice.clone()));
		Ok(Self { url, notice, task })
	}

	/// The URL `ldap3` has to connect to.
	pub(crate) const fn url(&self) -> &Url {
		&self.url
	}

	/// A handle to the notice of disconnection.
	pub(crate) fn notice(&self) -> DisconnectNotice {
		self.notice.clone()
	}

	/// Whether forwarding has stopped.
	pub(crate) fn is_finished(&self) -> bool {
		self.task.is_finished()
	}

	/// Stops forwarding from elsewhere.
	pub(crate) fn abort_handle(&self) -> AbortHandle {
		self.task.abort_handle()
	}

	/// Waits until both sides are closed.
	pub(crate) async fn closed(&mut self) {
		if let Err(err) = (&mut self.task).await {
			debug!("Relay task ended abnormally: {err}");
		}
	}
}

impl Drop for Relay {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Accepts `ldap3`'s connection and forwards in both directions until both
/// are closed.
async fn relay(listener: TcpListener, upstream: Upstream, notice: DisconnectNotice) {
	let client = match listener.accept().await {
		Ok((client, _)) => client,
		Err(err) => {
			warn!("Relay could not accept the client connection: {err}");
			return;
		}
	};
	drop(listener);

	let (client_read, client_write) = client.into_split();
	let (server_read, server_write) = tokio::io::split(upstream);
	let (requests, responses) = tokio::join!(
		forward_requests(client_read, server_write),
		forward_responses(server_read, client_write, &notice),
	);
	if let Err(err) = requests.and(responses) {
		debug!("Relay stopped: {err}");
	}
}

/// Copies the client's requests to the server, closing the server's side once
/// the client is done.
async fn forward_requests(
	mut client: OwnedReadHalf,
	mut server: WriteHalf<Upstream>,
) -> io::Result<()> {
	tokio::io::copy(&mut client, &mut server).await?;
	server.shutdown().await
}

/// Copies the server's messages to the client. A notice of disconnection is
/// recorded instead of forwarded and ends the session.
async fn forward_responses(
	mut server: ReadHalf<Upstream>,
	mut client: OwnedWriteHalf,
	notice: &DisconnectNotice,
) -> io::Result<()> {
	let mut reader = MessageReader::default();
	while let Some(frame) = reader.next(&mut server).await? {
		if let Some(result) = frame.message.and_then(Message::into_notice_of_disconnection) {
			warn!(rc = result.rc, "Server announced it will disconnect: {}", result.text);
			notice.set(result);
			break;
		}
		client.write_all(&frame.raw).await?;
	}
	client.shutdown().await
}

/// Shared slot holding the notice of disconnection received on a connection.
#[derive(Clone, Default)]
pub(crate) struct DisconnectNotice(Arc<Mutex<Option<LdapResult>>>);

impl DisconnectNotice {
	/// Stores `result` unless a notice was recorded already.
	fn set(&self, result: LdapResult) {
		if let Ok(mut slot) = self.0.lock() {
			slot.get_or_insert(result);
		}
	}

	/// Takes the recorded notice, if any.
	pub(crate) fn take(&self) -> Option<LdapResult> {
		self.0.lock().ok().and_then(|mut slot| slot.take())
	}
}

impl fmt::Debug for DisconnectNotice {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let recorded = self.0.lock().map(|slot| slot.clone()).ok().flatten();
		f.debug_tuple("DisconnectNotice").field(&recorded).finish()
	}
}
