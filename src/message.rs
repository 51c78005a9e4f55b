//! Framing of `LDAPMessage`s on a byte stream.
//!
//! The connector speaks LDAP itself only while setting a connection up: it
//! sends the StartTLS request and watches the server's replies for a notice of
//! disconnection. Everything else is left to `ldap3`.
use std::io;

use bytes::{Bytes, BytesMut};
use ldap3::{
	asn1::{
		parse_tag, parse_uint, write, ASNTag, Integer, OctetString, Sequence, StructureTag, Tag,
		TagClass, Types,
	},
	LdapResult,
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// OID of the StartTLS extended operation
pub(crate) const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// OID of the notice of disconnection
pub(crate) const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Application tag of `ExtendedRequest`
const EXTENDED_REQUEST: u64 = 23;
/// Application tag of `ExtendedResponse`
const EXTENDED_RESPONSE: u64 = 24;
/// Context tag of `requestName`
const REQUEST_NAME: u64 = 0;
/// Context tag of `responseName`
const RESPONSE_NAME: u64 = 10;

/// The parts of an `LDAPMessage` the connector looks at
#[derive(Debug, Clone)]
pub(crate) struct Message {
	/// The message ID, 0 for unsolicited notifications
	pub(crate) id: u64,
	/// Application tag of the protocol operation
	pub(crate) op: u64,
	/// The result of an `ExtendedResponse`
	pub(crate) result: Option<LdapResult>,
	/// `responseName` of an `ExtendedResponse`
	pub(crate) response_name: Option<String>,
}

impl Message {
	/// Decodes the outer `LDAPMessage` SEQUENCE.
	fn decode(tag: StructureTag) -> Option<Self> {
		let mut elements = tag
			.match_class(TagClass::Universal)?
			.match_id(Types::Sequence as u64)?
			.expect_constructed()?
			.into_iter();
		let id = elements
			.next()?
			.match_class(TagClass::Universal)?
			.match_id(Types::Integer as u64)?
			.expect_primitive()?;
		let (_, id) = parse_uint(&id).ok()?;
		let op = elements.next()?.match_class(TagClass::Application)?;

		let mut message = Self { id, op: op.id, result: None, response_name: None };
		if op.id == EXTENDED_RESPONSE {
			let mut components = op.expect_constructed()?.into_iter();
			message.result = Some(ldap_result(&mut components)?);
			// Active Directory puts the name after the operation, where the
			// controls belong
			message.response_name = components.chain(elements).find_map(response_name);
		}
		Some(message)
	}

	/// The result of a notice of disconnection, if this is one.
	pub(crate) fn into_notice_of_disconnection(self) -> Option<LdapResult> {
		let named_notice = self
			.response_name
			.as_deref()
			.map_or(true, |name| name == NOTICE_OF_DISCONNECTION_OID);
		if self.id == 0 && self.op == EXTENDED_RESPONSE && named_notice {
			self.result
		} else {
			None
		}
	}
}

/// Decodes the leading `LDAPResult` components of a response.
fn ldap_result(components: &mut impl Iterator<Item = StructureTag>) -> Option<LdapResult> {
	let rc = universal(components.next()?, Types::Enumerated)?;
	let (_, rc) = parse_uint(&rc).ok()?;
	let matched = universal(components.next()?, Types::OctetString)?;
	let text = universal(components.next()?, Types::OctetString)?;
	Some(LdapResult {
		rc: u32::try_from(rc).ok()?,
		matched: String::from_utf8_lossy(&matched).into_owned(),
		text: String::from_utf8_lossy(&text).into_owned(),
		refs: vec![],
		ctrls: vec![],
	})
}

/// The contents of a primitive universal element of the given type.
fn universal(tag: StructureTag, kind: Types) -> Option<Vec<u8>> {
	tag.match_class(TagClass::Universal)?.match_id(kind as u64)?.expect_primitive()
}

/// The OID carried by a `responseName` element.
fn response_name(tag: StructureTag) -> Option<String> {
	let name = tag.match_class(TagClass::Context)?.match_id(RESPONSE_NAME)?.expect_primitive()?;
	Some(String::from_utf8_lossy(&name).into_owned())
}

/// Encodes the StartTLS `ExtendedRequest` with message ID `id`.
pub(crate) fn start_tls_request(id: i64) -> io::Result<Bytes> {
	let op = Tag::Sequence(Sequence {
		id: EXTENDED_REQUEST,
		class: TagClass::Application,
		inner: vec![Tag::OctetString(OctetString {
			id: REQUEST_NAME,
			class: TagClass::Context,
			inner: STARTTLS_OID.as_bytes().to_vec(),
		})],
	});
	let message = Tag::Sequence(Sequence {
		inner: vec![Tag::Integer(Integer { inner: id, ..Integer::default() }), op],
		..Sequence::default()
	});
	let mut buf = BytesMut::new();
	write::encode_into(&mut buf, message.into_structure())?;
	Ok(buf.freeze())
}

/// One complete `LDAPMessage` as read off the wire
#[derive(Debug)]
pub(crate) struct Frame {
	/// The encoded message
	pub(crate) raw: Bytes,
	/// The decoded message, `None` if it is not a well-formed `LDAPMessage`
	pub(crate) message: Option<Message>,
}

/// Splits a byte stream into `LDAPMessage`s.
#[derive(Debug, Default)]
pub(crate) struct MessageReader {
	/// Bytes read but not yet returned
	buf: BytesMut,
}

impl MessageReader {
	/// Reads the next message, or `None` once the stream ends between two
	/// messages.
	pub(crate) async fn next<R>(&mut self, stream: &mut R) -> io::Result<Option<Frame>>
	where
		R: AsyncRead + Unpin,
	{
		loop {
			if let Some(frame) = self.split_frame()? {
				return Ok(Some(frame));
			}
			if stream.read_buf(&mut self.buf).await? == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(io::Error::new(
					io::ErrorKind::UnexpectedEof,
					"Stream ended inside an LDAP message",
				));
			}
		}
	}

	/// Takes the first complete message off the buffer.
	fn split_frame(&mut self) -> io::Result<Option<Frame>> {
		if self.buf.is_empty() {
			return Ok(None);
		}
		let (consumed, tag) = match parse_tag(&self.buf) {
			Ok((rest, tag)) => (self.buf.len() - rest.len(), tag),
			Err(err) if err.is_incomplete() => return Ok(None),
			Err(_) => {
				return Err(io::Error::new(io::ErrorKind::InvalidData, "Malformed LDAP message"))
			}
		};
		let raw = self.buf.split_to(consumed).freeze();
		Ok(Some(Frame { raw, message: Message::decode(tag) }))
	}
}
