//! An in-process directory server speaking just enough LDAP to exercise the
//! connector: bind, StartTLS and unbind.
use std::{
	collections::HashMap,
	error::Error,
	fs, io,
	io::BufReader,
	net::{IpAddr, Ipv4Addr, SocketAddr},
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use ldap_connector::{
	ConnectionSettings, Connector, StrictTrustProvider, TlsProtocol, TrustProvider,
};
use rustls::{Certificate, PrivateKey, ServerConfig, SupportedProtocolVersion};
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	sync::mpsc,
	task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// `BindRequest`
const BIND_REQUEST: u8 = 0x60;
/// `BindResponse`
const BIND_RESPONSE: u8 = 0x61;
/// `UnbindRequest`
const UNBIND_REQUEST: u8 = 0x42;
/// `ExtendedRequest`
const EXTENDED_REQUEST: u8 = 0x77;
/// `ExtendedResponse`
const EXTENDED_RESPONSE: u8 = 0x78;
/// OID of the StartTLS extended operation
const STARTTLS_OID: &[u8] = b"1.3.6.1.4.1.1466.20037";
/// OID of the notice of disconnection
const NOTICE_OF_DISCONNECTION_OID: &[u8] = b"1.3.6.1.4.1.1466.20036";
/// `protocolError`
const RC_PROTOCOL_ERROR: u8 = 2;

/// How long tests wait for the server to observe something
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
	let tracing_filter = EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
	let _ =
		tracing_subscriber::fmt().with_env_filter(tracing_filter).with_test_writer().try_init();
}

pub fn cert_path(name: &str) -> PathBuf {
	PathBuf::from("tests/certs").join(name)
}

/// A connector validating against the webpki roots, with the given protocols
/// and named settings.
pub fn connector(
	protocols: &[TlsProtocol],
	settings: HashMap<String, ConnectionSettings>,
) -> Connector {
	connector_with_trust(protocols, settings, Arc::new(StrictTrustProvider::new()))
}

pub fn connector_with_trust(
	protocols: &[TlsProtocol],
	settings: HashMap<String, ConnectionSettings>,
	trust: Arc<dyn TrustProvider>,
) -> Connector {
	Connector::new(
		Duration::from_secs(5),
		protocols.iter().copied().collect(),
		Arc::new(settings),
		trust,
	)
}

/// A TLS acceptor presenting `tests/certs/{name}.pem`.
pub fn acceptor(name: &str, versions: &[&'static SupportedProtocolVersion]) -> TlsAcceptor {
	let pem = fs::read(cert_path(&format!("{name}.pem"))).unwrap();
	let chain = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
		.unwrap()
		.into_iter()
		.map(Certificate)
		.collect();
	let pem = fs::read(cert_path(&format!("{name}.key"))).unwrap();
	let key = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(pem.as_slice()))
		.unwrap()
		.remove(0);

	let config = ServerConfig::builder()
		.with_safe_default_cipher_suites()
		.with_safe_default_kx_groups()
		.with_protocol_versions(versions)
		.unwrap()
		.with_no_client_auth()
		.with_single_cert(chain, PrivateKey(key))
		.unwrap();
	TlsAcceptor::from(Arc::new(config))
}

/// How the server handles the transport
#[derive(Clone)]
pub enum Transport {
	/// Plain LDAP, StartTLS is refused
	Plain,
	/// TLS from the first byte
	Ldaps(TlsAcceptor),
	/// Plain LDAP, upgraded on request
	StartTls(TlsAcceptor),
	/// Accepts the connection and never sends anything
	Silent,
}

/// How the server answers a bind
#[derive(Clone, Debug)]
pub enum BindReply {
	Accept,
	Reject { rc: u8, text: String, disconnect: bool },
	/// Sends a notice of disconnection instead of a `BindResponse`, then
	/// closes the connection
	Disconnect { text: String },
	Silent,
}

/// How the server answers a StartTLS request
#[derive(Clone, Debug)]
pub enum StartTlsReply {
	Accept,
	Refuse { rc: u8, text: String },
	/// Sends a notice of disconnection, then closes the connection
	Disconnect { text: String },
}

#[derive(Clone, Debug)]
pub struct Behaviour {
	pub bind: BindReply,
	pub start_tls: StartTlsReply,
}

impl Default for Behaviour {
	fn default() -> Self {
		Self { bind: BindReply::Accept, start_tls: StartTlsReply::Accept }
	}
}

impl Behaviour {
	pub fn bind(bind: BindReply) -> Self {
		Self { bind, ..Self::default() }
	}
}

/// What the server observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
	Bind { dn: String },
	StartTls,
	Unbind,
	HandshakeFailed(String),
	Closed,
}

impl Event {
	/// Whether the session is over after this event
	fn is_final(&self) -> bool {
		matches!(self, Self::Closed | Self::HandshakeFailed(_))
	}
}

pub struct FakeServer {
	addr: SocketAddr,
	events: mpsc::UnboundedReceiver<Event>,
	task: JoinHandle<()>,
}

impl FakeServer {
	pub async fn start(transport: Transport, behaviour: Behaviour) -> Self {
		Self::start_on(Ipv4Addr::LOCALHOST.into(), transport, behaviour).await.unwrap()
	}

	/// Listens on `ip` instead of the IPv4 loopback address.
	pub async fn start_on(
		ip: IpAddr,
		transport: Transport,
		behaviour: Behaviour,
	) -> io::Result<Self> {
		let listener = TcpListener::bind((ip, 0)).await?;
		let addr = listener.local_addr()?;
		let (tx, events) = mpsc::unbounded_channel();
		let task = tokio::spawn(async move {
			while let Ok((stream, _)) = listener.accept().await {
				tokio::spawn(session(stream, transport.clone(), behaviour.clone(), tx.clone()));
			}
		});
		Ok(Self { addr, events, task })
	}

	/// The URL of this server with the given scheme, naming IPv4 servers
	/// `localhost` and IPv6 ones by address.
	pub fn url(&self, scheme: &str) -> url::Url {
		let port = self.addr.port();
		match self.addr.ip() {
			IpAddr::V4(_) => format!("{scheme}://localhost:{port}"),
			IpAddr::V6(ip) => format!("{scheme}://[{ip}]:{port}"),
		}
		.parse()
		.unwrap()
	}

	/// The next event, waiting at most [`EVENT_TIMEOUT`]
	pub async fn next_event(&mut self) -> Option<Event> {
		tokio::time::timeout(EVENT_TIMEOUT, self.events.recv()).await.ok().flatten()
	}

	/// All events of one session, up to and including the one ending it.
	/// Panics if the session does not end in time.
	pub async fn session_events(&mut self) -> Vec<Event> {
		let mut events = Vec::new();
		loop {
			let event = self.next_event().await.expect("Session did not end in time");
			let last = event.is_final();
			events.push(event);
			if last {
				return events;
			}
		}
	}
}

impl Drop for FakeServer {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// An address nothing listens on
pub async fn closed_port() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	listener.local_addr().unwrap().port()
}

async fn session(
	stream: TcpStream,
	transport: Transport,
	behaviour: Behaviour,
	events: mpsc::UnboundedSender<Event>,
) {
	match transport {
		Transport::Plain => {
			serve(stream, &behaviour, &events, false).await;
		}
		Transport::Ldaps(acceptor) => {
			if let Some(stream) = handshake(&acceptor, stream, &events).await {
				serve(stream, &behaviour, &events, false).await;
			}
		}
		Transport::StartTls(acceptor) => {
			if let Some(stream) = serve(stream, &behaviour, &events, true).await {
				if let Some(stream) = handshake(&acceptor, stream, &events).await {
					serve(stream, &behaviour, &events, false).await;
				}
			}
		}
		Transport::Silent => {
			let mut stream = stream;
			let mut buf = [0; 1024];
			while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
			let _ = events.send(Event::Closed);
		}
	}
}

async fn handshake(
	acceptor: &TlsAcceptor,
	stream: TcpStream,
	events: &mpsc::UnboundedSender<Event>,
) -> Option<tokio_rustls::server::TlsStream<TcpStream>> {
	match acceptor.accept(stream).await {
		Ok(stream) => Some(stream),
		Err(err) => {
			let _ = events.send(Event::HandshakeFailed(err.to_string()));
			None
		}
	}
}

/// Answers requests until the client goes away. Returns the stream when the
/// client asked for StartTLS and it was accepted.
async fn serve<S>(
	mut stream: S,
	behaviour: &Behaviour,
	events: &mpsc::UnboundedSender<Event>,
	allow_start_tls: bool,
) -> Option<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	loop {
		let Ok(Some(body)) = read_message(&mut stream).await else {
			let _ = events.send(Event::Closed);
			return None;
		};
		let Some(request) = Request::parse(&body) else {
			let _ = events.send(Event::Closed);
			return None;
		};

		match request.op {
			BIND_REQUEST => {
				let dn = request.bind_dn().unwrap_or_default();
				let dn = String::from_utf8_lossy(dn).into_owned();
				let _ = events.send(Event::Bind { dn });
				match &behaviour.bind {
					BindReply::Accept => {
						reply(&mut stream, request.id, BIND_RESPONSE, 0, "").await;
					}
					BindReply::Reject { rc, text, disconnect } => {
						reply(&mut stream, request.id, BIND_RESPONSE, *rc, text).await;
						if *disconnect {
							let _ = stream.shutdown().await;
							let _ = events.send(Event::Closed);
							return None;
						}
					}
					BindReply::Disconnect { text } => {
						disconnect(&mut stream, text, events).await;
						return None;
					}
					BindReply::Silent => {}
				}
			}
			EXTENDED_REQUEST if request.extended_oid() == Some(STARTTLS_OID) => {
				let _ = events.send(Event::StartTls);
				match &behaviour.start_tls {
					StartTlsReply::Accept if allow_start_tls => {
						reply(&mut stream, request.id, EXTENDED_RESPONSE, 0, "").await;
						return Some(stream);
					}
					StartTlsReply::Accept => {
						let text = "StartTLS not available";
						reply(&mut stream, request.id, EXTENDED_RESPONSE, RC_PROTOCOL_ERROR, text)
							.await;
					}
					StartTlsReply::Refuse { rc, text } => {
						reply(&mut stream, request.id, EXTENDED_RESPONSE, *rc, text).await;
					}
					StartTlsReply::Disconnect { text } => {
						disconnect(&mut stream, text, events).await;
						return None;
					}
				}
			}
			UNBIND_REQUEST => {
				let _ = events.send(Event::Unbind);
			}
			// Anything else stays unanswered
			_ => {}
		}
	}
}

async fn reply<S: AsyncWrite + Unpin>(stream: &mut S, id: u32, op: u8, rc: u8, text: &str) {
	let message = response(id, op, rc, text);
	let _ = stream.write_all(&message).await;
	let _ = stream.flush().await;
}

/// Sends a notice of disconnection with `protocolError` and closes the
/// connection.
async fn disconnect<S: AsyncWrite + Unpin>(
	stream: &mut S,
	text: &str,
	events: &mpsc::UnboundedSender<Event>,
) {
	let _ = stream.write_all(&notice_of_disconnection(RC_PROTOCOL_ERROR, text)).await;
	let _ = stream.shutdown().await;
	let _ = events.send(Event::Closed);
}

/// Reads one `LDAPMessage`, returning the contents of its outer SEQUENCE.
async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<Vec<u8>>> {
	let tag = match stream.read_u8().await {
		Ok(tag) => tag,
		Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(err) => return Err(err),
	};
	if tag != 0x30 {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "not an LDAPMessage"));
	}
	let first = stream.read_u8().await?;
	let len = if first < 0x80 {
		usize::from(first)
	} else {
		let mut len = 0;
		for _ in 0..(first & 0x7f) {
			len = (len << 8) | usize::from(stream.read_u8().await?);
		}
		len
	};
	let mut body = vec![0; len];
	stream.read_exact(&mut body).await?;
	Ok(Some(body))
}

/// Splits the first BER element off `data`: tag, contents, remainder.
fn element(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
	let (&tag, rest) = data.split_first()?;
	let (&first, mut rest) = rest.split_first()?;
	let len = if first < 0x80 {
		usize::from(first)
	} else {
		let count = usize::from(first & 0x7f);
		let (bytes, remainder) = (rest.get(..count)?, rest.get(count..)?);
		rest = remainder;
		bytes.iter().fold(0, |len, &byte| (len << 8) | usize::from(byte))
	};
	Some((tag, rest.get(..len)?, rest.get(len..)?))
}

struct Request<'a> {
	id: u32,
	op: u8,
	contents: &'a [u8],
}

impl<'a> Request<'a> {
	fn parse(body: &'a [u8]) -> Option<Self> {
		let (tag, id, rest) = element(body)?;
		if tag != 0x02 {
			return None;
		}
		let id = id.iter().fold(0, |id, &byte| (id << 8) | u32::from(byte));
		let (op, contents, _) = element(rest)?;
		Some(Self { id, op, contents })
	}

	/// The `name` of a `BindRequest`
	fn bind_dn(&self) -> Option<&'a [u8]> {
		let (_version, _, rest) = element(self.contents)?;
		let (_, name, _) = element(rest)?;
		Some(name)
	}

	/// The `requestName` of an `ExtendedRequest`
	fn extended_oid(&self) -> Option<&'a [u8]> {
		let (tag, oid, _) = element(self.contents)?;
		(tag == 0x80).then_some(oid)
	}
}

fn tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
	let mut out = vec![tag];
	let len = contents.len();
	if len < 0x80 {
		out.push(len as u8);
	} else {
		let bytes: Vec<u8> =
			len.to_be_bytes().into_iter().skip_while(|&byte| byte == 0).collect();
		out.push(0x80 | bytes.len() as u8);
		out.extend(bytes);
	}
	out.extend_from_slice(contents);
	out
}

fn integer(value: u32) -> Vec<u8> {
	let mut bytes: Vec<u8> =
		value.to_be_bytes().into_iter().skip_while(|&byte| byte == 0).collect();
	if bytes.first().map_or(true, |&byte| byte & 0x80 != 0) {
		bytes.insert(0, 0);
	}
	bytes
}

/// An `LDAPResult` carrying response for message `id`
fn response(id: u32, op: u8, rc: u8, text: &str) -> Vec<u8> {
	let result = [tlv(0x0a, &[rc]), tlv(0x04, b""), tlv(0x04, text.as_bytes())].concat();
	tlv(0x30, &[tlv(0x02, &integer(id)), tlv(op, &result)].concat())
}

/// An unsolicited `ExtendedResponse` with message ID 0, named by the notice
/// of disconnection OID
fn notice_of_disconnection(rc: u8, text: &str) -> Vec<u8> {
	let result = [
		tlv(0x0a, &[rc]),
		tlv(0x04, b""),
		tlv(0x04, text.as_bytes()),
		tlv(0x8a, NOTICE_OF_DISCONNECTION_OID),
	]
	.concat();
	tlv(0x30, &[tlv(0x02, &integer(0)), tlv(EXTENDED_RESPONSE, &result)].concat())
}

/// Runs a future to completion, failing the test if it hangs.
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
	tokio::time::timeout(EVENT_TIMEOUT * 2, future).await.expect("Operation hung")
}

pub type TestResult = Result<(), Box<dyn Error>>;
