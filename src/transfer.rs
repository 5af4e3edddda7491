// The protocol core of one transfer, kept free of I/O.
//
// A Transfer is fed Events by the session (the request went out, a packet arrived, the wait
// expired, the source produced a chunk) and answers each one with the Action the session should
// take next. Every transition goes through `Transfer::step`.
//
//   Init --Start--> AwaitPeer --DATA #1 / ACK #0--> StreamingDown | StreamingUp --last--> Done
//
// Any waiting state can move to Failed, and so can Done if the terminal block can't be delivered.

use crate::retry::{Retrier, RetryDecision, RetryPolicy};
use crate::tftp::{self, ErrorCode, Packet, PacketError};
use std::error;
use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    AwaitPeer,
    StreamingUp,
    StreamingDown,
    Done,
    Failed,
}

/// Something that happened to the session.
#[derive(Debug)]
pub enum Event {
    /// The initial request has been sent.
    Start,
    /// The byte source produced the next chunk of at most 512 bytes.
    Chunk(Vec<u8>),
    /// A packet arrived from the peer.
    Received(Packet),
    /// The payload from the last `Deliver` was written and its ACK sent.
    Delivered,
    /// No packet arrived within the timeout.
    TimedOut,
    /// The session hit an error outside the machine, e.g. an undecodable datagram.
    Fault(TransferError),
}

/// Represents an action that the session should take in response to an event.
#[derive(Debug)]
pub enum Action {
    /// Wait for the peer without sending anything.
    Await,

    /// Read the next chunk from the byte source and report it as `Event::Chunk`.
    ReadChunk,

    /// Send the packet and await a response.
    Send(Packet),

    /// Write `data` to the byte sink, then send `ack` and report `Event::Delivered`.
    /// `last` marks the terminal block.
    Deliver { data: Vec<u8>, ack: Packet, last: bool },

    /// Send the last packet again and await a response.
    Resend { attempt: u32 },

    /// The transfer finished.
    Complete(TransferSummary),

    /// The transfer failed.
    Abort(TransferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub direction: Direction,
    /// DATA packets exchanged, including an empty terminal one.
    pub blocks: u64,
    pub bytes: u64,
}

///////////////////////////////////////////////////////////////
// Error-handling objects

#[derive(Debug)]
pub enum TransferError {
    /// An inbound datagram could not be decoded, or an outbound packet could not be encoded.
    Packet(PacketError),
    /// The peer sent the wrong kind of packet or the wrong block.
    UnexpectedPacket { direction: Direction, expected_block: u16, received: Packet },
    /// The peer sent an ERROR packet.
    ServerError { code: ErrorCode, message: String },
    Timeout,
    /// The byte source, sink or socket failed.
    Io(io::Error),
    /// The session fed the machine an event that makes no sense in its current state.
    Internal(String),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Packet(e) => write!(f, "Invalid packet: {}", e),
            Self::UnexpectedPacket { direction, expected_block, received } => write!(
                f,
                "Unexpected packet during {}: expected block {}, received {}",
                direction, expected_block, received
            ),
            Self::ServerError { code, message } => {
                write!(f, "Server error {} ({:?}): '{}'", u16::from(*code), code, message)
            }
            Self::Timeout => write!(f, "Timed out waiting for the server"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> TransferError {
        TransferError::Io(e)
    }
}

impl From<PacketError> for TransferError {
    fn from(e: PacketError) -> TransferError {
        TransferError::Packet(e)
    }
}

impl From<tftp::SocketError> for TransferError {
    fn from(e: tftp::SocketError) -> TransferError {
        match e {
            tftp::SocketError::IO(e) => TransferError::Io(e),
            tftp::SocketError::Packet(e) | tftp::SocketError::Malformed(e, _) => TransferError::Packet(e),
            tftp::SocketError::Timeout(_) => TransferError::Timeout,
        }
    }
}

impl TransferError {
    /// The ERROR packet to send the peer before giving up, if one is owed.
    ///
    /// Nothing is sent when the peer already reported an error or stopped answering.
    pub fn courtesy_packet(&self) -> Option<Packet> {
        match self {
            Self::Packet(e) => Some(Packet::Error {
                code: ErrorCode::Illegal,
                message: format!("Error parsing incoming packet: {}", e),
            }),
            Self::UnexpectedPacket { received, expected_block, .. } => Some(Packet::Error {
                code: ErrorCode::Illegal,
                message: format!("Expected block {}, but got {}", expected_block, received),
            }),
            Self::Io(e) => Some(Packet::Error {
                code: e.kind().into(),
                message: format!("Local I/O error: {}", e),
            }),
            Self::Internal(_) => Some(Packet::Error {
                code: ErrorCode::Undefined,
                message: "Internal error".to_string(),
            }),
            Self::ServerError { .. } | Self::Timeout => None,
        }
    }
}

///////////////////////////////////////////////////////////////

/// State of one upload or download.
#[derive(Debug)]
pub struct Transfer {
    direction: Direction,
    state: State,
    /// Last block sent (upload) or received (download).
    block: u16,
    /// Upload only: a chunk has been requested from the source and not yet delivered.
    reading: bool,
    /// Upload only: the DATA packet in flight is the terminal one.
    final_sent: bool,
    blocks: u64,
    bytes: u64,
    retrier: Retrier,
}

impl Transfer {
    pub fn new(direction: Direction, policy: RetryPolicy) -> Transfer {
        Transfer {
            direction,
            state: State::Init,
            block: 0,
            reading: false,
            final_sent: false,
            blocks: 0,
            bytes: 0,
            retrier: Retrier::new(policy),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary { direction: self.direction, blocks: self.blocks, bytes: self.bytes }
    }

    /// Advances the machine by one event.
    pub fn step(&mut self, event: Event) -> Action {
        match self.state {
            State::Init => match event {
                Event::Start => {
                    self.state = State::AwaitPeer;
                    Action::Await
                }
                Event::Fault(e) => self.fail(e),
                other => self.internal(&other),
            },
            State::AwaitPeer => match event {
                Event::Received(Packet::Ack { block: 0 }) if self.direction == Direction::Upload => {
                    self.retrier.on_progress();
                    self.state = State::StreamingUp;
                    self.reading = true;
                    Action::ReadChunk
                }
                Event::Received(Packet::Data { block, data }) if self.direction == Direction::Download => {
                    self.accept_data(block, data)
                }
                other => self.common(other),
            },
            State::StreamingDown => match event {
                Event::Received(Packet::Data { block, data }) => self.accept_data(block, data),
                Event::Delivered => Action::Await,
                other => self.common(other),
            },
            State::StreamingUp => match event {
                Event::Chunk(data) if self.reading => {
                    self.reading = false;
                    self.block = self.block.wrapping_add(1);
                    self.final_sent = data.len() < tftp::DATA_BUFFER_SIZE;
                    self.blocks += 1;
                    self.bytes += data.len() as u64;
                    Action::Send(Packet::Data { block: self.block, data })
                }
                Event::Received(Packet::Ack { block }) if !self.reading && block == self.block => {
                    self.retrier.on_progress();
                    if self.final_sent {
                        self.state = State::Done;
                        Action::Complete(self.summary())
                    } else {
                        self.reading = true;
                        Action::ReadChunk
                    }
                }
                // A failed read or send, reported by the session.
                Event::Fault(e) => self.fail(e),
                // A late duplicate of the previous ACK, answering a retransmitted DATA packet.
                Event::Received(Packet::Ack { block })
                    if !self.reading
                        && self.retrier.retransmits()
                        && block == self.block.wrapping_sub(1) =>
                {
                    log::debug!("Ignoring duplicate ACK #{}", block);
                    Action::Await
                }
                other if self.reading => self.internal(&other),
                other => self.common(other),
            },
            // Writing or acknowledging the terminal block can still fail locally.
            State::Done => match event {
                Event::Fault(e) => self.fail(e),
                _ => Action::Complete(self.summary()),
            },
            State::Failed => Action::Abort(TransferError::Internal(format!(
                "{} already failed",
                self.direction
            ))),
        }
    }

    /// Events handled the same way in every waiting state.
    fn common(&mut self, event: Event) -> Action {
        match event {
            Event::TimedOut => match self.retrier.on_timeout() {
                RetryDecision::Retransmit { attempt } => Action::Resend { attempt },
                RetryDecision::GiveUp => self.fail(TransferError::Timeout),
            },
            Event::Fault(e) => self.fail(e),
            Event::Received(Packet::Error { code, message }) => {
                self.fail(TransferError::ServerError { code, message })
            }
            Event::Received(received) => {
                let expected_block = match self.direction {
                    Direction::Upload => self.block,
                    Direction::Download => self.block.wrapping_add(1),
                };
                self.fail(TransferError::UnexpectedPacket {
                    direction: self.direction,
                    expected_block,
                    received,
                })
            }
            other => self.internal(&other),
        }
    }

    fn accept_data(&mut self, block: u16, data: Vec<u8>) -> Action {
        let expected_block = self.block.wrapping_add(1);
        if block != expected_block {
            return self.fail(TransferError::UnexpectedPacket {
                direction: self.direction,
                expected_block,
                received: Packet::Data { block, data },
            });
        }

        self.retrier.on_progress();
        self.block = block;
        self.blocks += 1;
        self.bytes += data.len() as u64;

        let last = data.len() < tftp::DATA_BUFFER_SIZE;
        self.state = if last { State::Done } else { State::StreamingDown };
        Action::Deliver { data, ack: Packet::Ack { block }, last }
    }

    fn internal(&mut self, event: &Event) -> Action {
        let msg = format!("{:?} is not valid in state {:?}", event, self.state);
        self.fail(TransferError::Internal(msg))
    }

    fn fail(&mut self, e: TransferError) -> Action {
        self.state = State::Failed;
        Action::Abort(e)
    }
}
