//! Wire model of the IPC protocol.
//!
//! Every message starts with the 12-byte generic header
//! `{protocol_version, message_type, total_length}` followed by a
//! type-specific header and an opaque payload. Identifier fields, the
//! protocol version and the message type are network byte order; the total
//! length is little-endian.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use chassis::ident::{ClientId, EventId, InstanceId, MajorVersion, MethodId, ServiceId, SessionId};
use std::io::{Cursor, Read, Write};

use crate::net::packet::{Packet, PacketShared};
use crate::shared::ErrorKind;

/// Version 3: current protocol revision (added the service-not-available
/// return code).
pub const PROTOCOL_VERSION: u32 = 0x0000_0003;

pub const GENERIC_HEADER_LENGTH: usize = 12;
pub const REQUEST_HEADER_LENGTH: usize = 12;
pub const ERROR_RESPONSE_HEADER_LENGTH: usize = 16;
pub const NOTIFICATION_HEADER_LENGTH: usize = 8;
pub const SUBSCRIBE_HEADER_LENGTH: usize = 10;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    Request,
    RequestNoReturn,
    Response,
    ErrorResponse,
    ApplicationError,
    Notification,
    SubscribeEvent,
    SubscribeEventAck,
    SubscribeEventNAck,
    UnsubscribeEvent,
    UnsubscribeEventAck,
    UnsubscribeEventNAck,
}

impl MessageType {
    pub fn from_wire(value: u32) -> Option<MessageType> {
        match value {
            0x0000_0000 => Some(MessageType::Request),
            0x0000_0001 => Some(MessageType::RequestNoReturn),
            0x0000_0002 => Some(MessageType::Response),
            0x0000_0003 => Some(MessageType::ErrorResponse),
            0x0000_0004 => Some(MessageType::ApplicationError),
            0x0000_0005 => Some(MessageType::Notification),
            0x8000_0003 => Some(MessageType::SubscribeEvent),
            0x8000_0004 => Some(MessageType::SubscribeEventAck),
            0x8000_0005 => Some(MessageType::SubscribeEventNAck),
            0x8000_0006 => Some(MessageType::UnsubscribeEvent),
            0x8000_0007 => Some(MessageType::UnsubscribeEventAck),
            0x8000_0008 => Some(MessageType::UnsubscribeEventNAck),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            MessageType::Request => 0x0000_0000,
            MessageType::RequestNoReturn => 0x0000_0001,
            MessageType::Response => 0x0000_0002,
            MessageType::ErrorResponse => 0x0000_0003,
            MessageType::ApplicationError => 0x0000_0004,
            MessageType::Notification => 0x0000_0005,
            MessageType::SubscribeEvent => 0x8000_0003,
            MessageType::SubscribeEventAck => 0x8000_0004,
            MessageType::SubscribeEventNAck => 0x8000_0005,
            MessageType::UnsubscribeEvent => 0x8000_0006,
            MessageType::UnsubscribeEventAck => 0x8000_0007,
            MessageType::UnsubscribeEventNAck => 0x8000_0008,
        }
    }

    /// Length of the type-specific header following the generic one.
    pub fn specific_header_length(self) -> usize {
        match self {
            MessageType::Request
            | MessageType::RequestNoReturn
            | MessageType::Response
            | MessageType::ApplicationError => REQUEST_HEADER_LENGTH,
            MessageType::ErrorResponse => ERROR_RESPONSE_HEADER_LENGTH,
            MessageType::Notification => NOTIFICATION_HEADER_LENGTH,
            MessageType::SubscribeEvent
            | MessageType::SubscribeEventAck
            | MessageType::SubscribeEventNAck
            | MessageType::UnsubscribeEvent
            | MessageType::UnsubscribeEventAck
            | MessageType::UnsubscribeEventNAck => SUBSCRIBE_HEADER_LENGTH,
        }
    }
}

/// Return codes carried by error response messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReturnCode {
    UnknownServiceId,
    UnknownInstanceId,
    UnknownMethodId,
    MalformedMessage,
    ServiceNotAvailable,
    MethodRequestSchedulingFailed,
}

impl ReturnCode {
    pub fn from_wire(value: u32) -> Option<ReturnCode> {
        match value {
            0 => Some(ReturnCode::UnknownServiceId),
            1 => Some(ReturnCode::UnknownInstanceId),
            2 => Some(ReturnCode::UnknownMethodId),
            3 => Some(ReturnCode::MalformedMessage),
            4 => Some(ReturnCode::ServiceNotAvailable),
            5 => Some(ReturnCode::MethodRequestSchedulingFailed),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            ReturnCode::UnknownServiceId => 0,
            ReturnCode::UnknownInstanceId => 1,
            ReturnCode::UnknownMethodId => 2,
            ReturnCode::MalformedMessage => 3,
            ReturnCode::ServiceNotAvailable => 4,
            ReturnCode::MethodRequestSchedulingFailed => 5,
        }
    }

    /// The error kind a method future is completed with.
    pub fn as_error_kind(self) -> ErrorKind {
        match self {
            ReturnCode::UnknownServiceId => ErrorKind::UnknownServiceId,
            ReturnCode::UnknownInstanceId => ErrorKind::UnknownInstanceId,
            ReturnCode::UnknownMethodId => ErrorKind::UnknownMethodId,
            ReturnCode::MalformedMessage => ErrorKind::MalformedMessage,
            ReturnCode::ServiceNotAvailable => ErrorKind::ServiceNotAvailable,
            ReturnCode::MethodRequestSchedulingFailed => ErrorKind::ResourceExhausted,
        }
    }
}

/// Generic header every message starts with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProtocolHeader {
    pub message_type: MessageType,
    /// Number of bytes following the generic header (type-specific header
    /// plus payload).
    pub total_length: u32,
}

impl ProtocolHeader {
    pub fn write(&self, out: &mut [u8]) {
        let mut cursor = Cursor::new(out);

        cursor
            .write_u32::<BigEndian>(PROTOCOL_VERSION)
            .expect("Generic header buffer too small");
        cursor
            .write_u32::<BigEndian>(self.message_type.to_wire())
            .expect("Generic header buffer too small");
        cursor
            .write_u32::<LittleEndian>(self.total_length)
            .expect("Generic header buffer too small");
    }

    /// Parses and validates the generic header. An unsupported protocol
    /// version or an unknown message type is a malformed message; an
    /// oversized length is not checked here, that policy belongs to the
    /// connection.
    pub fn read(buffer: &[u8]) -> Result<ProtocolHeader, ErrorKind> {
        if buffer.len() < GENERIC_HEADER_LENGTH {
            return Err(ErrorKind::MalformedMessage);
        }

        let mut cursor = Cursor::new(buffer);
        let version = cursor.read_u32::<BigEndian>().expect("Length checked");
        let raw_type = cursor.read_u32::<BigEndian>().expect("Length checked");
        let total_length = cursor.read_u32::<LittleEndian>().expect("Length checked");

        if version != PROTOCOL_VERSION {
            return Err(ErrorKind::MalformedMessage);
        }

        let message_type = MessageType::from_wire(raw_type).ok_or(ErrorKind::MalformedMessage)?;

        Ok(ProtocolHeader {
            message_type,
            total_length,
        })
    }
}

/// Specific header of Request, RequestNoReturn, Response and
/// ApplicationError messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RequestHeader {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub method: MethodId,
    pub client: ClientId,
    pub session: SessionId,
}

impl RequestHeader {
    fn write<W: Write>(&self, cursor: &mut W) {
        cursor
            .write_u16::<BigEndian>(self.service)
            .and_then(|_| cursor.write_u16::<BigEndian>(self.instance))
            .and_then(|_| cursor.write_u8(self.major))
            .and_then(|_| cursor.write_u16::<BigEndian>(self.method))
            .and_then(|_| cursor.write_u16::<BigEndian>(self.client))
            .and_then(|_| cursor.write_u16::<BigEndian>(self.session))
            .and_then(|_| cursor.write_u8(0))
            .expect("Request header buffer too small");
    }

    fn read<R: Read>(cursor: &mut R) -> Result<RequestHeader, ErrorKind> {
        let service = read_u16(cursor)?;
        let instance = read_u16(cursor)?;
        let major = read_u8(cursor)?;
        let method = read_u16(cursor)?;
        let client = read_u16(cursor)?;
        let session = read_u16(cursor)?;
        let _pad = read_u8(cursor)?;

        Ok(RequestHeader {
            service,
            instance,
            major,
            method,
            client,
            session,
        })
    }
}

/// Specific header of ErrorResponse messages: a request header with the
/// return code appended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ErrorResponseHeader {
    pub request: RequestHeader,
    pub return_code: ReturnCode,
}

impl ErrorResponseHeader {
    fn write<W: Write>(&self, cursor: &mut W) {
        self.request.write(cursor);
        cursor
            .write_u32::<BigEndian>(self.return_code.to_wire())
            .expect("Error response header buffer too small");
    }

    fn read<R: Read>(cursor: &mut R) -> Result<ErrorResponseHeader, ErrorKind> {
        let request = RequestHeader::read(cursor)?;
        let return_code = ReturnCode::from_wire(read_u32(cursor)?).ok_or(ErrorKind::MalformedMessage)?;

        Ok(ErrorResponseHeader {
            request,
            return_code,
        })
    }
}

/// Specific header of Notification messages. Client and session ids are
/// omitted on the wire for notifications.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NotificationHeader {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub event: EventId,
}

impl NotificationHeader {
    fn write<W: Write>(&self, cursor: &mut W) {
        cursor
            .write_u16::<BigEndian>(self.service)
            .and_then(|_| cursor.write_u16::<BigEndian>(self.instance))
            .and_then(|_| cursor.write_u8(self.major))
            .and_then(|_| cursor.write_u16::<BigEndian>(self.event))
            .and_then(|_| cursor.write_u8(0))
            .expect("Notification header buffer too small");
    }

    fn read<R: Read>(cursor: &mut R) -> Result<NotificationHeader, ErrorKind> {
        let service = read_u16(cursor)?;
        let instance = read_u16(cursor)?;
        let major = read_u8(cursor)?;
        let event = read_u16(cursor)?;
        let _pad = read_u8(cursor)?;

        Ok(NotificationHeader {
            service,
            instance,
            major,
            event,
        })
    }
}

/// Specific header shared by the whole subscribe message family.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubscribeHeader {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub event: EventId,
    pub client: ClientId,
}

impl SubscribeHeader {
    fn write<W: Write>(&self, cursor: &mut W) {
        cursor
            .write_u16::<BigEndian>(self.service)
            .and_then(|_| cursor.write_u16::<BigEndian>(self.instance))
            .and_then(|_| cursor.write_u8(self.major))
            .and_then(|_| cursor.write_u16::<BigEndian>(self.event))
            .and_then(|_| cursor.write_u16::<BigEndian>(self.client))
            .and_then(|_| cursor.write_u8(0))
            .expect("Subscribe header buffer too small");
    }

    fn read<R: Read>(cursor: &mut R) -> Result<SubscribeHeader, ErrorKind> {
        let service = read_u16(cursor)?;
        let instance = read_u16(cursor)?;
        let major = read_u8(cursor)?;
        let event = read_u16(cursor)?;
        let client = read_u16(cursor)?;
        let _pad = read_u8(cursor)?;

        Ok(SubscribeHeader {
            service,
            instance,
            major,
            event,
            client,
        })
    }
}

/// Fully decoded message envelope.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtocolMessage {
    Request(RequestHeader),
    RequestNoReturn(RequestHeader),
    Response(RequestHeader),
    ErrorResponse(ErrorResponseHeader),
    ApplicationError(RequestHeader),
    Notification(NotificationHeader),
    SubscribeEvent(SubscribeHeader),
    SubscribeEventAck(SubscribeHeader),
    SubscribeEventNAck(SubscribeHeader),
    UnsubscribeEvent(SubscribeHeader),
    UnsubscribeEventAck(SubscribeHeader),
    UnsubscribeEventNAck(SubscribeHeader),
}

/// Offset of the opaque payload within a complete packet of this type.
pub fn payload_offset(message_type: MessageType) -> usize {
    GENERIC_HEADER_LENGTH + message_type.specific_header_length()
}

/// Decodes the generic and the type-specific header of a complete packet.
pub fn decode_message(bytes: &[u8]) -> Result<ProtocolMessage, ErrorKind> {
    let generic = ProtocolHeader::read(bytes)?;

    if bytes.len() < GENERIC_HEADER_LENGTH + generic.message_type.specific_header_length() {
        return Err(ErrorKind::MalformedMessage);
    }

    let mut cursor = Cursor::new(&bytes[GENERIC_HEADER_LENGTH..]);

    let message = match generic.message_type {
        MessageType::Request => ProtocolMessage::Request(RequestHeader::read(&mut cursor)?),
        MessageType::RequestNoReturn => {
            ProtocolMessage::RequestNoReturn(RequestHeader::read(&mut cursor)?)
        }
        MessageType::Response => ProtocolMessage::Response(RequestHeader::read(&mut cursor)?),
        MessageType::ErrorResponse => {
            ProtocolMessage::ErrorResponse(ErrorResponseHeader::read(&mut cursor)?)
        }
        MessageType::ApplicationError => {
            ProtocolMessage::ApplicationError(RequestHeader::read(&mut cursor)?)
        }
        MessageType::Notification => {
            ProtocolMessage::Notification(NotificationHeader::read(&mut cursor)?)
        }
        MessageType::SubscribeEvent => {
            ProtocolMessage::SubscribeEvent(SubscribeHeader::read(&mut cursor)?)
        }
        MessageType::SubscribeEventAck => {
            ProtocolMessage::SubscribeEventAck(SubscribeHeader::read(&mut cursor)?)
        }
        MessageType::SubscribeEventNAck => {
            ProtocolMessage::SubscribeEventNAck(SubscribeHeader::read(&mut cursor)?)
        }
        MessageType::UnsubscribeEvent => {
            ProtocolMessage::UnsubscribeEvent(SubscribeHeader::read(&mut cursor)?)
        }
        MessageType::UnsubscribeEventAck => {
            ProtocolMessage::UnsubscribeEventAck(SubscribeHeader::read(&mut cursor)?)
        }
        MessageType::UnsubscribeEventNAck => {
            ProtocolMessage::UnsubscribeEventNAck(SubscribeHeader::read(&mut cursor)?)
        }
    };

    Ok(message)
}

fn build_packet<F: FnOnce(&mut Cursor<&mut [u8]>)>(
    message_type: MessageType,
    payload: &[u8],
    write_specific: F,
) -> PacketShared {
    let specific_length = message_type.specific_header_length();
    let total_length = (specific_length + payload.len()) as u32;

    let mut packet = Packet::uninit(GENERIC_HEADER_LENGTH + specific_length + payload.len());

    ProtocolHeader {
        message_type,
        total_length,
    }
    .write(&mut packet.bytes_mut()[..GENERIC_HEADER_LENGTH]);

    {
        let mut cursor = Cursor::new(&mut packet.bytes_mut()[GENERIC_HEADER_LENGTH..]);
        write_specific(&mut cursor);
        debug_assert_eq!(cursor.position() as usize, specific_length);
    }

    let payload_start = GENERIC_HEADER_LENGTH + specific_length;
    packet.bytes_mut()[payload_start..].copy_from_slice(payload);

    packet.share()
}

pub fn encode_request(message_type: MessageType, header: &RequestHeader, payload: &[u8]) -> PacketShared {
    debug_assert!(matches!(
        message_type,
        MessageType::Request
            | MessageType::RequestNoReturn
            | MessageType::Response
            | MessageType::ApplicationError
    ));

    build_packet(message_type, payload, |cursor| header.write(cursor))
}

pub fn encode_error_response(header: &ErrorResponseHeader, payload: &[u8]) -> PacketShared {
    build_packet(MessageType::ErrorResponse, payload, |cursor| header.write(cursor))
}

pub fn encode_notification(header: &NotificationHeader, payload: &[u8]) -> PacketShared {
    build_packet(MessageType::Notification, payload, |cursor| header.write(cursor))
}

pub fn encode_subscribe(message_type: MessageType, header: &SubscribeHeader) -> PacketShared {
    debug_assert!(matches!(
        message_type,
        MessageType::SubscribeEvent
            | MessageType::SubscribeEventAck
            | MessageType::SubscribeEventNAck
            | MessageType::UnsubscribeEvent
            | MessageType::UnsubscribeEventAck
            | MessageType::UnsubscribeEventNAck
    ));

    build_packet(message_type, &[], |cursor| header.write(cursor))
}

#[inline]
fn read_u8<R: Read>(cursor: &mut R) -> Result<u8, ErrorKind> {
    cursor.read_u8().map_err(|_| ErrorKind::MalformedMessage)
}

#[inline]
fn read_u16<R: Read>(cursor: &mut R) -> Result<u16, ErrorKind> {
    cursor
        .read_u16::<BigEndian>()
        .map_err(|_| ErrorKind::MalformedMessage)
}

#[inline]
fn read_u32<R: Read>(cursor: &mut R) -> Result<u32, ErrorKind> {
    cursor
        .read_u32::<BigEndian>()
        .map_err(|_| ErrorKind::MalformedMessage)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST_HEADER: RequestHeader = RequestHeader {
        service: 0x1234,
        instance: 0x0002,
        major: 1,
        method: 0x0003,
        client: 0x0009,
        session: 0x0005,
    };

    #[test]
    fn test_generic_header_roundtrip() {
        let mut buffer = [0u8; GENERIC_HEADER_LENGTH];

        let header = ProtocolHeader {
            message_type: MessageType::Notification,
            total_length: 0x0102_0304,
        };
        header.write(&mut buffer);

        assert_eq!(ProtocolHeader::read(&buffer).unwrap(), header);

        // Version is serialized network byte order at offset 0
        assert_eq!(&buffer[..4], &[0, 0, 0, 3]);
        // total_length is little-endian at offset 8
        assert_eq!(&buffer[8..12], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_generic_header_rejects_unknown_type() {
        let mut buffer = [0u8; GENERIC_HEADER_LENGTH];
        ProtocolHeader {
            message_type: MessageType::Request,
            total_length: 0,
        }
        .write(&mut buffer);

        buffer[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);

        assert_eq!(
            ProtocolHeader::read(&buffer).unwrap_err(),
            ErrorKind::MalformedMessage
        );
    }

    #[test]
    fn test_generic_header_rejects_wrong_version() {
        let mut buffer = [0u8; GENERIC_HEADER_LENGTH];
        ProtocolHeader {
            message_type: MessageType::Request,
            total_length: 0,
        }
        .write(&mut buffer);

        buffer[3] = 2;

        assert_eq!(
            ProtocolHeader::read(&buffer).unwrap_err(),
            ErrorKind::MalformedMessage
        );
    }

    #[test]
    fn test_request_roundtrip() {
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let packet = encode_request(MessageType::Request, &REQUEST_HEADER, &payload);

        assert_eq!(
            packet.len(),
            GENERIC_HEADER_LENGTH + REQUEST_HEADER_LENGTH + payload.len()
        );

        let generic = ProtocolHeader::read(packet.bytes()).unwrap();
        assert_eq!(
            generic.total_length as usize,
            packet.len() - GENERIC_HEADER_LENGTH
        );

        match decode_message(packet.bytes()).unwrap() {
            ProtocolMessage::Request(header) => assert_eq!(header, REQUEST_HEADER),
            message => panic!("Unexpected message {:?}", message),
        }

        assert_eq!(&packet.bytes()[payload_offset(MessageType::Request)..], &payload);
    }

    #[test]
    fn test_response_roundtrip() {
        let packet = encode_request(MessageType::Response, &REQUEST_HEADER, &[1, 2]);

        match decode_message(packet.bytes()).unwrap() {
            ProtocolMessage::Response(header) => assert_eq!(header, REQUEST_HEADER),
            message => panic!("Unexpected message {:?}", message),
        }
    }

    #[test]
    fn test_application_error_roundtrip() {
        let packet = encode_request(MessageType::ApplicationError, &REQUEST_HEADER, &[]);

        match decode_message(packet.bytes()).unwrap() {
            ProtocolMessage::ApplicationError(header) => assert_eq!(header, REQUEST_HEADER),
            message => panic!("Unexpected message {:?}", message),
        }
    }

    #[test]
    fn test_error_response_roundtrip() {
        let header = ErrorResponseHeader {
            request: REQUEST_HEADER,
            return_code: ReturnCode::ServiceNotAvailable,
        };
        let packet = encode_error_response(&header, &[]);

        assert_eq!(
            packet.len(),
            GENERIC_HEADER_LENGTH + ERROR_RESPONSE_HEADER_LENGTH
        );

        match decode_message(packet.bytes()).unwrap() {
            ProtocolMessage::ErrorResponse(decoded) => assert_eq!(decoded, header),
            message => panic!("Unexpected message {:?}", message),
        }
    }

    #[test]
    fn test_notification_roundtrip() {
        let header = NotificationHeader {
            service: 7,
            instance: 8,
            major: 9,
            event: 0x4321,
        };
        let payload = [5u8; 32];
        let packet = encode_notification(&header, &payload);

        assert_eq!(
            packet.len(),
            GENERIC_HEADER_LENGTH + NOTIFICATION_HEADER_LENGTH + payload.len()
        );

        match decode_message(packet.bytes()).unwrap() {
            ProtocolMessage::Notification(decoded) => assert_eq!(decoded, header),
            message => panic!("Unexpected message {:?}", message),
        }
    }

    #[test]
    fn test_subscribe_family_roundtrip() {
        let header = SubscribeHeader {
            service: 1,
            instance: 2,
            major: 3,
            event: 0x1234,
            client: 0x0001,
        };

        let kinds = [
            MessageType::SubscribeEvent,
            MessageType::SubscribeEventAck,
            MessageType::SubscribeEventNAck,
            MessageType::UnsubscribeEvent,
            MessageType::UnsubscribeEventAck,
            MessageType::UnsubscribeEventNAck,
        ];

        for &kind in &kinds {
            let packet = encode_subscribe(kind, &header);

            assert_eq!(packet.len(), GENERIC_HEADER_LENGTH + SUBSCRIBE_HEADER_LENGTH);

            let decoded = decode_message(packet.bytes()).unwrap();
            let decoded_header = match decoded {
                ProtocolMessage::SubscribeEvent(h)
                | ProtocolMessage::SubscribeEventAck(h)
                | ProtocolMessage::SubscribeEventNAck(h)
                | ProtocolMessage::UnsubscribeEvent(h)
                | ProtocolMessage::UnsubscribeEventAck(h)
                | ProtocolMessage::UnsubscribeEventNAck(h) => h,
                message => panic!("Unexpected message {:?}", message),
            };

            assert_eq!(decoded_header, header);
        }
    }

    #[test]
    fn test_zero_length_body_is_valid() {
        let packet = encode_subscribe(
            MessageType::SubscribeEvent,
            &SubscribeHeader {
                service: 1,
                instance: 1,
                major: 1,
                event: 1,
                client: 1,
            },
        );

        let generic = ProtocolHeader::read(packet.bytes()).unwrap();
        assert_eq!(generic.total_length as usize, SUBSCRIBE_HEADER_LENGTH);
    }

    #[test]
    fn test_truncated_specific_header_is_malformed() {
        let packet = encode_request(MessageType::Request, &REQUEST_HEADER, &[]);
        let truncated = &packet.bytes()[..GENERIC_HEADER_LENGTH + 4];

        assert_eq!(
            decode_message(truncated).unwrap_err(),
            ErrorKind::MalformedMessage
        );
    }
}
