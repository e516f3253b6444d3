//! Message framing for protocol 1.0.
//!
//! Every message starts with a fixed 14-byte header:
//! magic `IceP`, protocol version, protocol encoding version, message type,
//! compression status and the total message size (header included).
//! Request and reply bodies are always written with encoding 1.0; operation
//! parameters travel in an encapsulation with their own encoding.

use bytes::Bytes;

use crate::codec::{Context, Decode, Encapsulation, InputStream, OutputStream};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::version::{EncodingVersion, ProtocolVersion, ENCODING_1_0, PROTOCOL_1_0};

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 14;

/// Magic bytes opening every message.
pub const MAGIC: [u8; 4] = *b"IceP";

/// Offset of the request id in request and reply messages.
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

/// Offset of the request count in batch request messages.
pub const BATCH_COUNT_OFFSET: usize = HEADER_SIZE;

/// Default upper bound on an incoming message (1 MiB).
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024;

/// Kinds of messages exchanged on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A single request, twoway or oneway.
    Request = 0,
    /// Several oneway requests sent in one message.
    BatchRequest = 1,
    /// The reply to a twoway request.
    Reply = 2,
    /// Sent by the server on accept; later also used as a heartbeat.
    ValidateConnection = 3,
    /// Graceful connection shutdown.
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::BatchRequest),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// Compression byte: 0 not compressed, 1 compressed, 2 not compressed but the
/// sender accepts compressed replies. Only 0 and 2 are accepted.
pub const COMPRESSION_NONE: u8 = 0;

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub message_type: MessageType,
    /// Compression status byte
    pub compression: u8,
    /// Total message size, header included
    pub size: usize,
}

impl MessageHeader {
    /// Validates and decodes a header. `max_size` bounds the announced size.
    pub fn decode(bytes: &[u8; HEADER_SIZE], max_size: usize) -> Result<Self> {
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != MAGIC {
            return Err(Error::BadMagic { got: magic });
        }
        let protocol = ProtocolVersion::new(bytes[4], bytes[5]);
        if !protocol.is_supported() {
            return Err(Error::UnsupportedProtocol { version: protocol });
        }
        let encoding = EncodingVersion::new(bytes[6], bytes[7]);
        if encoding != ENCODING_1_0 {
            return Err(Error::UnsupportedEncoding { encoding });
        }
        let message_type = MessageType::try_from(bytes[8])?;
        let compression = bytes[9];
        match compression {
            0 | 2 => {}
            1 => return Err(Error::CompressionNotSupported),
            other => {
                return Err(Error::protocol(format!("invalid compression status {other}")))
            }
        }
        let size = i32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        if size < HEADER_SIZE as i32 {
            return Err(Error::protocol(format!("message size {size} is smaller than the header")));
        }
        let size = size as usize;
        if size > max_size {
            return Err(Error::MessageTooLarge {
                size,
                max: max_size,
            });
        }
        Ok(MessageHeader {
            message_type,
            compression,
            size,
        })
    }
}

/// Starts a message: header with a size placeholder.
fn start_message(message_type: MessageType) -> OutputStream {
    let mut out = OutputStream::new(ENCODING_1_0);
    out.write_blob(&MAGIC);
    out.write_byte(PROTOCOL_1_0.major);
    out.write_byte(PROTOCOL_1_0.minor);
    out.write_byte(ENCODING_1_0.major);
    out.write_byte(ENCODING_1_0.minor);
    out.write_byte(message_type as u8);
    out.write_byte(COMPRESSION_NONE);
    out.write_int(0);
    out
}

/// Patches the size field and returns the finished message.
fn finish_message(mut out: OutputStream) -> Result<Bytes> {
    let size = out.len() as i32;
    out.rewrite_int(10, size);
    out.finished()
}

/// Builds a message of `message_type` whose body is written by `body`.
pub fn build_message<F>(message_type: MessageType, body: F) -> Result<Bytes>
where
    F: FnOnce(&mut OutputStream),
{
    let mut out = start_message(message_type);
    body(&mut out);
    finish_message(out)
}

/// The header-only validate-connection message.
pub fn validate_connection_message() -> Bytes {
    header_only(MessageType::ValidateConnection)
}

/// The header-only close-connection message.
pub fn close_connection_message() -> Bytes {
    header_only(MessageType::CloseConnection)
}

fn header_only(message_type: MessageType) -> Bytes {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[..4].copy_from_slice(&MAGIC);
    bytes[4] = PROTOCOL_1_0.major;
    bytes[5] = PROTOCOL_1_0.minor;
    bytes[6] = ENCODING_1_0.major;
    bytes[7] = ENCODING_1_0.minor;
    bytes[8] = message_type as u8;
    bytes[10..14].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
    Bytes::copy_from_slice(&bytes)
}

crate::floe_enum! {
    /// Whether an operation may be re-executed safely.
    pub enum OperationMode {
        Normal = 0,
        Nonmutating = 1,
        Idempotent = 2,
    }
}

impl OperationMode {
    /// Idempotent and nonmutating operations can be retried after a send.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

crate::floe_enum! {
    /// Outcome carried by a reply message.
    pub enum ReplyStatus {
        Ok = 0,
        UserException = 1,
        ObjectNotExist = 2,
        FacetNotExist = 3,
        OperationNotExist = 4,
        UnknownLocalException = 5,
        UnknownUserException = 6,
        UnknownException = 7,
    }
}

fn write_facet(out: &mut OutputStream, facet: &str) {
    if facet.is_empty() {
        out.write_size(0);
    } else {
        out.write_size(1);
        out.write_string(facet);
    }
}

fn read_facet(input: &mut InputStream) -> Result<String> {
    match input.read_size()? {
        0 => Ok(String::new()),
        1 => input.read_string(),
        n => Err(Error::marshal(format!("facet sequence with {n} elements"))),
    }
}

/// Request fields preceding the parameter encapsulation.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    /// Request id; 0 for oneway and batched requests
    pub request_id: i32,
    /// Target object.
    pub identity: Identity,
    /// Facet name; empty for the default facet
    pub facet: String,
    /// Operation name.
    pub operation: String,
    /// Operation mode; decides whether a sent request may be retried.
    pub mode: OperationMode,
    /// Request context sent with the call.
    pub context: Context,
}

/// A decoded request: header plus still-encoded parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Everything but the parameters.
    pub header: RequestHeader,
    /// Encoded in-parameters.
    pub params: Encapsulation,
}

impl Request {
    /// Writes the request body; batched requests omit the request id.
    pub fn encode_body(&self, out: &mut OutputStream, with_id: bool) {
        if with_id {
            out.write_int(self.header.request_id);
        }
        out.write(&self.header.identity);
        write_facet(out, &self.header.facet);
        out.write_string(&self.header.operation);
        out.write_enum(Some(self.header.mode));
        out.write(&self.header.context);
        out.write_encapsulation(&self.params);
    }

    /// Reads a request body; batched requests carry no request id.
    pub fn decode_body(input: &mut InputStream, with_id: bool) -> Result<Self> {
        let request_id = if with_id { input.read_int()? } else { 0 };
        let identity = Identity::decode(input)?;
        let facet = read_facet(input)?;
        let operation = input.read_string()?;
        let mode = input.read_enum::<OperationMode>()?;
        let context = Context::decode(input)?;
        let params = input.read_encapsulation()?;
        Ok(Request {
            header: RequestHeader {
                request_id,
                identity,
                facet,
                operation,
                mode,
                context,
            },
            params,
        })
    }

    /// A complete request message.
    pub fn to_message(&self) -> Result<Bytes> {
        build_message(MessageType::Request, |out| self.encode_body(out, true))
    }

    /// Whether the sender expects a reply.
    pub fn is_twoway(&self) -> bool {
        self.header.request_id != 0
    }
}

/// Builds one batch request message from already encoded request bodies.
pub fn batch_message(count: usize, bodies: &[u8]) -> Result<Bytes> {
    build_message(MessageType::BatchRequest, |out| {
        out.write_int(count as i32);
        out.write_blob(bodies);
    })
}

/// Reply payload by status.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// Return value and out parameters
    Ok(Encapsulation),
    /// Encoded user exception
    UserException(Encapsulation),
    /// No servant for the identity.
    ObjectNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },
    /// The identity exists without the facet.
    FacetNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },
    /// The servant does not implement the operation.
    OperationNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },
    /// A local error raised while dispatching, by description.
    UnknownLocalException(String),
    /// A user exception the operation does not declare, by type id.
    UnknownUserException(String),
    /// Any other failure, including a servant panic.
    UnknownException(String),
}

impl ReplyBody {
    /// The status byte this body is sent with.
    pub fn status(&self) -> ReplyStatus {
        match self {
            ReplyBody::Ok(_) => ReplyStatus::Ok,
            ReplyBody::UserException(_) => ReplyStatus::UserException,
            ReplyBody::ObjectNotExist { .. } => ReplyStatus::ObjectNotExist,
            ReplyBody::FacetNotExist { .. } => ReplyStatus::FacetNotExist,
            ReplyBody::OperationNotExist { .. } => ReplyStatus::OperationNotExist,
            ReplyBody::UnknownLocalException(_) => ReplyStatus::UnknownLocalException,
            ReplyBody::UnknownUserException(_) => ReplyStatus::UnknownUserException,
            ReplyBody::UnknownException(_) => ReplyStatus::UnknownException,
        }
    }

    /// Maps a dispatch error to the reply the client should receive.
    pub fn from_error(error: &Error) -> ReplyBody {
        match error {
            Error::ObjectNotExist {
                identity,
                facet,
                operation,
            } => ReplyBody::ObjectNotExist {
                identity: identity.clone(),
                facet: facet.clone(),
                operation: operation.clone(),
            },
            Error::FacetNotExist {
                identity,
                facet,
                operation,
            } => ReplyBody::FacetNotExist {
                identity: identity.clone(),
                facet: facet.clone(),
                operation: operation.clone(),
            },
            Error::OperationNotExist {
                identity,
                facet,
                operation,
            } => ReplyBody::OperationNotExist {
                identity: identity.clone(),
                facet: facet.clone(),
                operation: operation.clone(),
            },
            Error::UnknownUser { reason } => ReplyBody::UnknownUserException(reason.clone()),
            Error::Unknown { reason } => ReplyBody::UnknownException(reason.clone()),
            Error::UnknownLocal { reason } => ReplyBody::UnknownLocalException(reason.clone()),
            Error::User(e) => ReplyBody::UnknownUserException(e.ice_id().to_string()),
            other => ReplyBody::UnknownLocalException(other.to_string()),
        }
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Id of the request being answered.
    pub request_id: i32,
    /// Outcome of the dispatch.
    pub body: ReplyBody,
}

impl Reply {
    /// Writes the reply without the message header.
    pub fn encode_body(&self, out: &mut OutputStream) {
        out.write_int(self.request_id);
        out.write_enum(Some(self.body.status()));
        match &self.body {
            ReplyBody::Ok(encaps) | ReplyBody::UserException(encaps) => {
                out.write_encapsulation(encaps)
            }
            ReplyBody::ObjectNotExist {
                identity,
                facet,
                operation,
            }
            | ReplyBody::FacetNotExist {
                identity,
                facet,
                operation,
            }
            | ReplyBody::OperationNotExist {
                identity,
                facet,
                operation,
            } => {
                out.write(identity);
                write_facet(out, facet);
                out.write_string(operation);
            }
            ReplyBody::UnknownLocalException(reason)
            | ReplyBody::UnknownUserException(reason)
            | ReplyBody::UnknownException(reason) => out.write_string(reason),
        }
    }

    /// Reads a reply positioned after the message header.
    pub fn decode_body(input: &mut InputStream) -> Result<Self> {
        let request_id = input.read_int()?;
        let status = input.read_enum::<ReplyStatus>()?;
        let body = match status {
            ReplyStatus::Ok => ReplyBody::Ok(input.read_encapsulation()?),
            ReplyStatus::UserException => ReplyBody::UserException(input.read_encapsulation()?),
            ReplyStatus::ObjectNotExist
            | ReplyStatus::FacetNotExist
            | ReplyStatus::OperationNotExist => {
                let identity = Identity::decode(input)?;
                let facet = read_facet(input)?;
                let operation = input.read_string()?;
                match status {
                    ReplyStatus::ObjectNotExist => ReplyBody::ObjectNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    ReplyStatus::FacetNotExist => ReplyBody::FacetNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    _ => ReplyBody::OperationNotExist {
                        identity,
                        facet,
                        operation,
                    },
                }
            }
            ReplyStatus::UnknownLocalException => {
                ReplyBody::UnknownLocalException(input.read_string()?)
            }
            ReplyStatus::UnknownUserException => {
                ReplyBody::UnknownUserException(input.read_string()?)
            }
            ReplyStatus::UnknownException => ReplyBody::UnknownException(input.read_string()?),
        };
        Ok(Reply { request_id, body })
    }

    /// The complete reply message.
    pub fn to_message(&self) -> Result<Bytes> {
        build_message(MessageType::Reply, |out| self.encode_body(out))
    }
}

/// Reads a whole message body after its header has been validated.
pub fn body_reader(message: Bytes) -> InputStream {
    let mut input = InputStream::new(message, ENCODING_1_0);
    input.set_pos(HEADER_SIZE);
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ENCODING_1_1;

    fn header_bytes(message: &Bytes) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        h.copy_from_slice(&message[..HEADER_SIZE]);
        h
    }

    fn sample_request() -> Request {
        let mut context = Context::new();
        context.insert("trace".into(), "1".into());
        Request {
            header: RequestHeader {
                request_id: 5,
                identity: Identity::new("initial"),
                facet: String::new(),
                operation: "ice_ping".into(),
                mode: OperationMode::Nonmutating,
                context,
            },
            params: Encapsulation::empty(ENCODING_1_1),
        }
    }

    #[test]
    fn test_validate_connection_bytes() {
        let msg = validate_connection_message();
        assert_eq!(
            &msg[..],
            &[b'I', b'c', b'e', b'P', 1, 0, 1, 0, 3, 0, 14, 0, 0, 0]
        );
        let header = MessageHeader::decode(&header_bytes(&msg), DEFAULT_MESSAGE_SIZE_MAX).unwrap();
        assert_eq!(header.message_type, MessageType::ValidateConnection);
        assert_eq!(header.size, HEADER_SIZE);
    }

    #[test]
    fn test_request_roundtrip() {
        let request = sample_request();
        let msg = request.to_message().unwrap();
        let header = MessageHeader::decode(&header_bytes(&msg), DEFAULT_MESSAGE_SIZE_MAX).unwrap();
        assert_eq!(header.message_type, MessageType::Request);
        assert_eq!(header.size, msg.len());
        assert_eq!(&msg[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 4], &[5, 0, 0, 0]);
        let mut input = body_reader(msg);
        let decoded = Request::decode_body(&mut input, true).unwrap();
        assert_eq!(decoded, request);
        assert!(input.is_at_end());
    }

    #[test]
    fn test_request_mode_is_one_byte() {
        let mut out = OutputStream::new(ENCODING_1_0);
        sample_request().encode_body(&mut out, false);
        let bytes = out.finished().unwrap();
        // identity (8 + 1) + facet (1) + operation (9) then the mode byte.
        assert_eq!(bytes[19], 1);
    }

    #[test]
    fn test_reply_roundtrip_all_statuses() {
        let bodies = vec![
            ReplyBody::Ok(Encapsulation::new(ENCODING_1_1, Bytes::from_static(&[1, 2]))),
            ReplyBody::UserException(Encapsulation::empty(ENCODING_1_1)),
            ReplyBody::ObjectNotExist {
                identity: Identity::new("x"),
                facet: String::new(),
                operation: "op".into(),
            },
            ReplyBody::FacetNotExist {
                identity: Identity::new("x"),
                facet: "f".into(),
                operation: "op".into(),
            },
            ReplyBody::OperationNotExist {
                identity: Identity::with_category("x", "c"),
                facet: String::new(),
                operation: "nope".into(),
            },
            ReplyBody::UnknownLocalException("local".into()),
            ReplyBody::UnknownUserException("user".into()),
            ReplyBody::UnknownException("boom".into()),
        ];
        for body in bodies {
            let reply = Reply {
                request_id: 42,
                body,
            };
            let mut input = body_reader(reply.to_message().unwrap());
            assert_eq!(Reply::decode_body(&mut input).unwrap(), reply);
        }
    }

    #[test]
    fn test_header_rejections() {
        let good = header_bytes(&validate_connection_message());

        let mut bad_magic = good;
        bad_magic[0] = b'X';
        assert!(matches!(
            MessageHeader::decode(&bad_magic, DEFAULT_MESSAGE_SIZE_MAX),
            Err(Error::BadMagic { .. })
        ));

        let mut bad_protocol = good;
        bad_protocol[4] = 2;
        assert!(matches!(
            MessageHeader::decode(&bad_protocol, DEFAULT_MESSAGE_SIZE_MAX),
            Err(Error::UnsupportedProtocol { .. })
        ));

        let mut bad_type = good;
        bad_type[8] = 9;
        assert!(matches!(
            MessageHeader::decode(&bad_type, DEFAULT_MESSAGE_SIZE_MAX),
            Err(Error::UnknownMessageType(9))
        ));

        let mut compressed = good;
        compressed[9] = 1;
        assert!(matches!(
            MessageHeader::decode(&compressed, DEFAULT_MESSAGE_SIZE_MAX),
            Err(Error::CompressionNotSupported)
        ));

        let mut accepts_compression = good;
        accepts_compression[9] = 2;
        assert!(MessageHeader::decode(&accepts_compression, DEFAULT_MESSAGE_SIZE_MAX).is_ok());

        let mut too_small = good;
        too_small[10] = 3;
        assert!(MessageHeader::decode(&too_small, DEFAULT_MESSAGE_SIZE_MAX).is_err());

        let mut too_big = good;
        too_big[10..14].copy_from_slice(&100i32.to_le_bytes());
        assert!(matches!(
            MessageHeader::decode(&too_big, 50),
            Err(Error::MessageTooLarge { size: 100, max: 50 })
        ));
    }

    #[test]
    fn test_batch_message_layout() {
        let msg = batch_message(2, &[0xAA, 0xBB]).unwrap();
        assert_eq!(msg[8], MessageType::BatchRequest as u8);
        assert_eq!(&msg[BATCH_COUNT_OFFSET..BATCH_COUNT_OFFSET + 4], &[2, 0, 0, 0]);
        assert_eq!(&msg[18..], &[0xAA, 0xBB]);
        assert_eq!(msg.len(), 20);
    }

    #[test]
    fn test_operation_mode_idempotence() {
        assert!(!OperationMode::Normal.is_idempotent());
        assert!(OperationMode::Nonmutating.is_idempotent());
        assert!(OperationMode::Idempotent.is_idempotent());
    }

    #[test]
    fn test_facet_sequence_too_long() {
        let mut out = OutputStream::new(ENCODING_1_0);
        out.write_size(2);
        out.write_string("a");
        out.write_string("b");
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_0);
        assert!(read_facet(&mut input).is_err());
    }
}
