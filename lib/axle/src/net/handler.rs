//! Message framing over a non-blocking byte stream.
//!
//! Turns readable/writable readiness into a duplex stream of complete
//! packets. Reception runs a three-state machine: the 12-byte generic header
//! is staged in a fixed buffer, the body is read straight into the tail of a
//! freshly allocated packet, and declared-but-oversized bodies are discarded
//! through a junk buffer without allocation. Transmission keeps a FIFO of
//! shared packet handles plus the byte offset already written for the head
//! entry.

use chassis::logging::{self, Logger};
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::net::message::{ProtocolHeader, GENERIC_HEADER_LENGTH};
use crate::net::packet::{Packet, PacketShared};
use crate::net::transport::StreamTransport;
use crate::shared::{ErrorKind, NetError, NetResult};

const JUNK_BUFFER_LENGTH: usize = 1024;

/// Result of a send attempt that did not fail.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// The packet left through the socket synchronously.
    Transmitted,
    /// The packet (or its unsent remainder) waits for the next writable
    /// event.
    Enqueued,
}

enum RecvPhase {
    Header,
    Body { packet: Packet, filled: usize },
    Skip { remaining: usize },
}

struct RecvState {
    phase: RecvPhase,
    staging: [u8; GENERIC_HEADER_LENGTH],
    staged: usize,
    junk: [u8; JUNK_BUFFER_LENGTH],
}

struct SendState {
    queue: VecDeque<PacketShared>,
    /// Bytes of the queue head already on the wire.
    head_sent: usize,
    limit: usize,
}

pub struct MessageHandler {
    log: Logger,
    transport: Arc<dyn StreamTransport>,
    max_message_length: u32,
    recv: RecvState,
    send: SendState,
}

impl MessageHandler {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        config: &RuntimeConfig,
        log: &Logger,
    ) -> MessageHandler {
        MessageHandler {
            log: log.new(logging::o!("component" => "message_handler")),
            transport,
            max_message_length: config.max_message_length,
            recv: RecvState {
                phase: RecvPhase::Header,
                staging: [0; GENERIC_HEADER_LENGTH],
                staged: 0,
                junk: [0; JUNK_BUFFER_LENGTH],
            },
            send: SendState {
                queue: VecDeque::new(),
                head_sent: 0,
                limit: config.send_queue_limit,
            },
        }
    }

    /// Discards all in-flight partial message state. Used after reconnect.
    pub fn reset(&mut self) {
        self.recv.phase = RecvPhase::Header;
        self.recv.staged = 0;
        self.send.queue.clear();
        self.send.head_sent = 0;
    }

    /// Number of packets waiting for transmission.
    pub fn queued(&self) -> usize {
        self.send.queue.len()
    }

    /// Transmits the packet immediately when nothing else is in flight,
    /// otherwise appends it to the send queue. Never blocks beyond a single
    /// vectored write syscall.
    pub fn send(&mut self, packet: PacketShared) -> Result<SendOutcome, ErrorKind> {
        if !self.send.queue.is_empty() {
            self.enqueue(packet)?;
            return Ok(SendOutcome::Enqueued);
        }

        let mut sent = 0;

        loop {
            let bytes = &packet.bytes()[sent..];

            match self.transport.write_vectored(&[IoSlice::new(bytes)]) {
                Ok(0) => return Err(ErrorKind::CommunicationFailure),
                Ok(count) => {
                    sent += count;

                    if sent == packet.len() {
                        logging::trace!(self.log, "packet transmitted"; "size" => packet.len());
                        return Ok(SendOutcome::Transmitted);
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.send.queue.push_back(packet);
                    self.send.head_sent = sent;
                    return Ok(SendOutcome::Enqueued);
                }
                Err(err) => {
                    logging::debug!(self.log, "send failed"; "error" => %err);
                    return Err(ErrorKind::Io(err.kind()).as_disconnect_reason());
                }
            }
        }
    }

    /// Appends a packet to the FIFO without initiating transmission.
    pub fn enqueue(&mut self, packet: PacketShared) -> Result<(), ErrorKind> {
        if self.send.queue.len() >= self.send.limit {
            logging::debug!(self.log, "send queue at ceiling, dropping packet";
                            "limit" => self.send.limit);
            return Err(ErrorKind::QueueFull);
        }

        self.send.queue.push_back(packet);
        Ok(())
    }

    /// Initiates transmission of whatever is enqueued, resuming the head
    /// entry from the saved offset.
    pub fn send_queued(&mut self) -> NetResult<()> {
        while let Some(head) = self.send.queue.front() {
            let bytes = &head.bytes()[self.send.head_sent..];

            match self.transport.write_vectored(&[IoSlice::new(bytes)]) {
                Ok(0) => return Err(NetError::Fatal(ErrorKind::CommunicationFailure)),
                Ok(count) => {
                    self.send.head_sent += count;

                    if self.send.head_sent == head.len() {
                        self.send.queue.pop_front();
                        self.send.head_sent = 0;
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Resumes transmission after a writable event.
    pub fn on_writable(&mut self) -> NetResult<()> {
        self.send_queued()
    }

    /// Arms reception from a clean state and drains anything the transport
    /// already buffered.
    pub fn start_reception(&mut self, completed: &mut Vec<PacketShared>) -> NetResult<()> {
        self.recv.phase = RecvPhase::Header;
        self.recv.staged = 0;
        self.on_readable(completed)
    }

    /// Reads until the transport would block, appending every completed
    /// packet to `completed` in arrival order.
    pub fn on_readable(&mut self, completed: &mut Vec<PacketShared>) -> NetResult<()> {
        loop {
            match self.drive_reception(completed) {
                Ok(()) => continue,
                Err(NetError::Wait) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn drive_reception(&mut self, completed: &mut Vec<PacketShared>) -> NetResult<()> {
        match self.recv.phase {
            RecvPhase::Header => {
                let staged = self.recv.staged;
                let count = self.read_header_bytes(staged)?;
                self.recv.staged += count;

                if self.recv.staged == GENERIC_HEADER_LENGTH {
                    self.finish_header()?;
                }

                Ok(())
            }
            RecvPhase::Body { ref packet, filled } => {
                if filled == packet.len() {
                    self.complete_body(completed);
                    return Ok(());
                }

                let count = self.read_body(filled)?;

                if let RecvPhase::Body { ref mut filled, .. } = self.recv.phase {
                    *filled += count;
                }

                if let RecvPhase::Body { ref packet, filled } = self.recv.phase {
                    if filled == packet.len() {
                        self.complete_body(completed);
                    }
                }

                Ok(())
            }
            RecvPhase::Skip { remaining } => {
                let chunk = remaining.min(JUNK_BUFFER_LENGTH);
                let count = self
                    .transport
                    .read_vectored(&mut [IoSliceMut::new(&mut self.recv.junk[..chunk])])
                    .map_err(NetError::from)?;

                if count == 0 {
                    return Err(NetError::Fatal(ErrorKind::CommunicationFailure));
                }

                let remaining = remaining - count;

                if remaining == 0 {
                    logging::debug!(self.log, "oversized message discarded");
                    self.recv.phase = RecvPhase::Header;
                    self.recv.staged = 0;
                } else {
                    self.recv.phase = RecvPhase::Skip { remaining };
                }

                Ok(())
            }
        }
    }

    /// Reads header bytes into the staging buffer.
    fn read_header_bytes(&mut self, staged: usize) -> NetResult<usize> {
        let buffer = &mut self.recv.staging[staged..];

        let count = self
            .transport
            .read_vectored(&mut [IoSliceMut::new(buffer)])
            .map_err(NetError::from)?;

        if count == 0 {
            return Err(NetError::Fatal(ErrorKind::CommunicationFailure));
        }

        Ok(count)
    }

    /// Reads body bytes straight into the packet tail.
    fn read_body(&mut self, filled: usize) -> NetResult<usize> {
        let packet = match self.recv.phase {
            RecvPhase::Body { ref mut packet, .. } => packet,
            _ => unreachable!("read_body outside body phase"),
        };

        let buffer = &mut packet.bytes_mut()[filled..];

        let count = self
            .transport
            .read_vectored(&mut [IoSliceMut::new(buffer)])
            .map_err(NetError::from)?;

        if count == 0 {
            return Err(NetError::Fatal(ErrorKind::CommunicationFailure));
        }

        Ok(count)
    }

    fn finish_header(&mut self) -> NetResult<()> {
        let header = match ProtocolHeader::read(&self.recv.staging) {
            Ok(header) => header,
            Err(kind) => {
                logging::debug!(self.log, "malformed generic header, closing connection");
                return Err(NetError::Fatal(kind));
            }
        };

        if header.total_length > self.max_message_length {
            logging::debug!(self.log, "message exceeds the connection limit, skipping body";
                            "total_length" => header.total_length,
                            "limit" => self.max_message_length);

            self.recv.staged = 0;
            self.recv.phase = RecvPhase::Skip {
                remaining: header.total_length as usize,
            };
            return Ok(());
        }

        let mut packet = Packet::uninit(GENERIC_HEADER_LENGTH + header.total_length as usize);
        packet.bytes_mut()[..GENERIC_HEADER_LENGTH].copy_from_slice(&self.recv.staging);

        self.recv.staged = 0;
        self.recv.phase = RecvPhase::Body {
            packet,
            filled: GENERIC_HEADER_LENGTH,
        };

        Ok(())
    }

    fn complete_body(&mut self, completed: &mut Vec<PacketShared>) {
        let phase = mem::replace(&mut self.recv.phase, RecvPhase::Header);

        if let RecvPhase::Body { packet, .. } = phase {
            logging::trace!(self.log, "packet received"; "size" => packet.len());
            completed.push(packet.share());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{self, MessageType, RequestHeader, SubscribeHeader};
    use crate::testing::{MockTransport, WRITE_UNLIMITED};
    use chassis::integrity::IntegrityLevel;

    fn request_header() -> RequestHeader {
        RequestHeader {
            service: 1,
            instance: 2,
            major: 1,
            method: 3,
            client: 9,
            session: 5,
        }
    }

    fn handler_with_limit(write_limit: usize) -> (MessageHandler, Arc<MockTransport>) {
        let transport = MockTransport::disconnected(IntegrityLevel::AsilD, write_limit);
        let handler = MessageHandler::new(
            transport.clone() as Arc<dyn StreamTransport>,
            &RuntimeConfig::default(),
            &logging::discard(),
        );

        (handler, transport)
    }

    fn drain(handler: &mut MessageHandler) -> Vec<PacketShared> {
        let mut completed = Vec::new();
        handler.on_readable(&mut completed).unwrap();
        completed
    }

    #[test]
    fn test_whole_message_in_one_read() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);
        let packet = message::encode_request(MessageType::Request, &request_header(), &[1, 2, 3]);

        transport.push_readable(packet.bytes());
        let completed = drain(&mut handler);

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes(), packet.bytes());
    }

    #[test]
    fn test_byte_at_a_time_reassembly() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);

        let payload: Vec<u8> = (0..20).map(|_| rand::random::<u8>()).collect();
        let packet = message::encode_request(MessageType::Request, &request_header(), &payload);

        // One byte per syscall; arbitrary split points must still assemble a
        // correct message.
        transport.set_read_chunk(1);
        transport.push_readable(packet.bytes());

        let completed = drain(&mut handler);

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes(), packet.bytes());
    }

    #[test]
    fn test_two_messages_back_to_back_preserve_order() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);

        let first = message::encode_request(MessageType::Request, &request_header(), &[1]);
        let second = message::encode_subscribe(
            MessageType::SubscribeEventAck,
            &SubscribeHeader {
                service: 1,
                instance: 2,
                major: 1,
                event: 0x1234,
                client: 1,
            },
        );

        let mut wire = Vec::new();
        wire.extend_from_slice(first.bytes());
        wire.extend_from_slice(second.bytes());
        transport.push_readable(&wire);

        let completed = drain(&mut handler);

        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].bytes(), first.bytes());
        assert_eq!(completed[1].bytes(), second.bytes());
    }

    #[test]
    fn test_zero_length_body_message() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);

        // A header declaring total_length == 0 is a valid zero-body message.
        let mut wire = [0u8; GENERIC_HEADER_LENGTH];
        crate::net::message::ProtocolHeader {
            message_type: MessageType::Request,
            total_length: 0,
        }
        .write(&mut wire);

        transport.push_readable(&wire);
        let completed = drain(&mut handler);

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].len(), GENERIC_HEADER_LENGTH);
    }

    #[test]
    fn test_invalid_message_type_is_fatal() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);

        let mut wire = [0u8; GENERIC_HEADER_LENGTH];
        wire[..4].copy_from_slice(&[0, 0, 0, 3]);
        wire[4..8].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        // total_length = 1_000_000 little-endian
        wire[8..12].copy_from_slice(&1_000_000u32.to_le_bytes());

        transport.push_readable(&wire);

        let mut completed = Vec::new();
        let result = handler.on_readable(&mut completed);

        assert_eq!(
            result.unwrap_err(),
            NetError::Fatal(ErrorKind::MalformedMessage)
        );
        assert!(completed.is_empty());
    }

    #[test]
    fn test_oversized_body_is_skipped_then_reception_resumes() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);

        let oversize = RuntimeConfig::default().max_message_length as usize + 4096;

        let mut wire = [0u8; GENERIC_HEADER_LENGTH];
        crate::net::message::ProtocolHeader {
            message_type: MessageType::Request,
            total_length: oversize as u32,
        }
        .write(&mut wire);

        transport.push_readable(&wire);
        transport.push_readable(&vec![0xAAu8; oversize]);

        let follow_up = message::encode_request(MessageType::Request, &request_header(), &[42]);
        transport.push_readable(follow_up.bytes());

        let completed = drain(&mut handler);

        // Exactly total_length junk bytes consumed, then the next message is
        // delivered normally.
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes(), follow_up.bytes());
    }

    #[test]
    fn test_eof_is_communication_failure() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);

        transport.push_eof();

        let mut completed = Vec::new();
        assert_eq!(
            handler.on_readable(&mut completed).unwrap_err(),
            NetError::Fatal(ErrorKind::CommunicationFailure)
        );
    }

    #[test]
    fn test_send_completes_synchronously() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);
        let packet = message::encode_request(MessageType::Request, &request_header(), &[1, 2]);

        assert_eq!(handler.send(packet.clone()).unwrap(), SendOutcome::Transmitted);
        assert_eq!(transport.written(), packet.bytes().to_vec());
        assert_eq!(handler.queued(), 0);
    }

    #[test]
    fn test_partial_send_resumes_on_writable() {
        let (mut handler, transport) = handler_with_limit(10);
        let packet = message::encode_request(MessageType::Request, &request_header(), &[3; 30]);

        assert_eq!(handler.send(packet.clone()).unwrap(), SendOutcome::Enqueued);
        assert_eq!(transport.written().len(), 10);

        transport.raise_write_limit(WRITE_UNLIMITED);
        handler.on_writable().unwrap();

        assert_eq!(transport.written(), packet.bytes().to_vec());
        assert_eq!(handler.queued(), 0);
    }

    #[test]
    fn test_queue_ceiling_returns_queue_full() {
        let (mut handler, transport) = handler_with_limit(0);
        let packet = message::encode_request(MessageType::Request, &request_header(), &[]);

        // First packet blocks on the zero-capacity socket and occupies the
        // single queue slot.
        assert_eq!(handler.send(packet.clone()).unwrap(), SendOutcome::Enqueued);
        assert_eq!(
            handler.send(packet.clone()).unwrap_err(),
            ErrorKind::QueueFull
        );

        // The dropped packet must not have corrupted the queue.
        transport.raise_write_limit(WRITE_UNLIMITED);
        handler.on_writable().unwrap();
        assert_eq!(transport.written(), packet.bytes().to_vec());
    }

    #[test]
    fn test_enqueue_and_send_queued() {
        let transport = MockTransport::disconnected(IntegrityLevel::AsilD, WRITE_UNLIMITED);
        let config = RuntimeConfig {
            send_queue_limit: 2,
            ..RuntimeConfig::default()
        };
        let mut handler = MessageHandler::new(
            transport.clone() as Arc<dyn StreamTransport>,
            &config,
            &logging::discard(),
        );

        let first = message::encode_request(MessageType::Request, &request_header(), &[1]);
        let second = message::encode_request(MessageType::Request, &request_header(), &[2]);

        handler.enqueue(first.clone()).unwrap();
        handler.enqueue(second.clone()).unwrap();
        assert!(transport.written().is_empty());

        handler.send_queued().unwrap();

        let mut expected = first.bytes().to_vec();
        expected.extend_from_slice(second.bytes());
        assert_eq!(transport.written(), expected);
    }

    #[test]
    fn test_reset_discards_partial_state() {
        let (mut handler, transport) = handler_with_limit(WRITE_UNLIMITED);
        let packet = message::encode_request(MessageType::Request, &request_header(), &[7; 8]);

        // Feed half a message, then reset and feed a complete one.
        transport.push_readable(&packet.bytes()[..5]);
        drain(&mut handler);

        handler.reset();
        transport.drop_pending_readable();

        transport.push_readable(packet.bytes());
        let completed = drain(&mut handler);

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes(), packet.bytes());
    }
}
