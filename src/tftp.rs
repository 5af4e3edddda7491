use async_io::Async;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant};

/// Largest payload a single DATA packet may carry. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode and block number of a DATA packet plus a full payload.
pub const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

/// Well-known port servers listen on for initial requests.
pub const DEFAULT_PORT: u16 = 69;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a buffer that could not be encoded into or decoded from a TFTP packet.
#[derive(Debug, PartialEq)]
pub enum PacketError {
    /// A field holds a value the wire format cannot carry.
    MalformedField(String),
    /// The buffer ended before a fixed-size header was complete.
    Truncated { needed: usize, actual: usize },
    /// The first two bytes don't name one of the five TFTP opcodes.
    UnknownOpcode(u16),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::MalformedField(msg) => write!(f, "Malformed field: {}", msg),
            PacketError::Truncated { needed, actual } => write!(
                f,
                "Truncated packet: needed at least {} bytes, got {}",
                needed, actual
            ),
            PacketError::UnknownOpcode(code) => write!(f, "Unknown opcode: {}", code),
        }
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    /// An outbound packet could not be encoded.
    Packet(PacketError),
    /// A datagram arrived from the given source but could not be decoded.
    Malformed(PacketError, SocketAddr),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::Packet(e) => write!(f, "Packet error: {}", e),
            SocketError::Malformed(e, src) => write!(f, "Malformed packet from {}: {}", src, e),
            SocketError::Timeout(_) => write!(f, "Socket IO timeout"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<PacketError> for SocketError {
    fn from(e: PacketError) -> Self {
        SocketError::Packet(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
// Packets

/// The transfer mode named in a read or write request.
///
/// Only the name travels on the wire; no newline translation happens for `NetAscii`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileMode {
    NetAscii,
    #[default]
    Octet,
    Mail,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

impl FromStr for FileMode {
    type Err = String;

    /// Mode names are case-insensitive.
    fn from_str(s: &str) -> Result<FileMode, String> {
        match s.to_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            _ => Err(format!("Unknown file mode: '{s}'")),
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    /// A code outside the RFC 1350 table, kept as received.
    Other(u16),
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            n => ErrorCode::Other(n),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Other(n) => n,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// The five TFTP opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl TryFrom<u16> for OpCode {
    type Error = PacketError;

    fn try_from(raw: u16) -> Result<Self, PacketError> {
        match raw {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            _ => Err(PacketError::UnknownOpcode(raw)),
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The mode string, passed through as-is.
        mode: String,
    },

    /// A write request packet
    WriteReq { path: String, mode: String },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { path, mode } => write!(f, "RRQ '{}' ({})", path, mode),
            Packet::WriteReq { path, mode } => write!(f, "WRQ '{}' ({})", path, mode),
            Packet::Data { block, data } => write!(f, "DATA #{} ({} bytes)", block, data.len()),
            Packet::Ack { block } => write!(f, "ACK #{}", block),
            Packet::Error { code, message } => write!(f, "ERROR {:?}: '{}'", code, message),
        }
    }
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (buf[..end].iter().map(|&c| char::from(c)).collect(), end)
}

fn check_string_field(name: &str, value: &str) -> Result<(), PacketError> {
    if value.contains('\0') {
        return Err(PacketError::MalformedField(format!(
            "{name} must not contain a NUL byte"
        )));
    }
    if !value.is_ascii() {
        return Err(PacketError::MalformedField(format!(
            "{name} must be ASCII, got '{value}'"
        )));
    }
    Ok(())
}

/// Builds an RRQ or WRQ packet: `opcode | filename | 0 | mode | 0`.
pub fn encode_request(opcode: OpCode, filename: &str, mode: &str) -> Result<Vec<u8>, PacketError> {
    if opcode != OpCode::Rrq && opcode != OpCode::Wrq {
        return Err(PacketError::MalformedField(format!(
            "{:?} is not a request opcode",
            opcode
        )));
    }
    if filename.is_empty() {
        return Err(PacketError::MalformedField("filename must not be empty".to_string()));
    }
    check_string_field("filename", filename)?;
    check_string_field("mode", mode)?;

    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.extend_from_slice(&(opcode as u16).to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0x00);
    Ok(buf)
}

/// Builds a DATA packet: `3 | block | payload`.
pub fn encode_data(block: u16, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > DATA_BUFFER_SIZE {
        return Err(PacketError::MalformedField(format!(
            "data payload of {} bytes exceeds {DATA_BUFFER_SIZE}",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(OpCode::Data as u16).to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Builds an ACK packet: `4 | block`.
pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.extend_from_slice(&(OpCode::Ack as u16).to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf
}

/// Builds an ERROR packet: `5 | code | message | 0`.
pub fn encode_error(code: ErrorCode, message: &str) -> Result<Vec<u8>, PacketError> {
    check_string_field("error message", message)?;
    let mut buf = Vec::with_capacity(5 + message.len());
    buf.extend_from_slice(&(OpCode::Error as u16).to_be_bytes());
    buf.extend_from_slice(&u16::from(code).to_be_bytes());
    buf.extend_from_slice(message.as_bytes());
    buf.push(0x00);
    Ok(buf)
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, String), PacketError> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(PacketError::MalformedField(
            "Request filename is not terminated with a null byte".to_string(),
        ));
    }
    if path.is_empty() {
        return Err(PacketError::MalformedField("Request filename is empty".to_string()));
    }

    let rest = &buf[path_end + 1..];
    let (mode, mode_end) = string_from_buffer(rest);

    if mode_end == rest.len() {
        return Err(PacketError::MalformedField(
            "Mode must be terminated with a null byte!".to_string(),
        ));
    }

    Ok((path, mode))
}

fn require_header(buf: &[u8]) -> Result<(), PacketError> {
    if buf.len() < 4 {
        return Err(PacketError::Truncated { needed: 4, actual: buf.len() });
    }
    Ok(())
}

fn parse_data(buf: &[u8]) -> Result<Packet, PacketError> {
    require_header(buf)?;
    if buf.len() > MAX_PACKET_SIZE {
        return Err(PacketError::MalformedField(format!(
            "data payload of {} bytes exceeds {DATA_BUFFER_SIZE}",
            buf.len() - 4
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, PacketError> {
    require_header(buf)?;
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> Result<Packet, PacketError> {
    require_header(buf)?;
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    // Some servers drop the trailing NUL; take whatever text is there.
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    /// Decodes one datagram.
    pub fn decode(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::Truncated { needed: 2, actual: buf.len() });
        }

        match OpCode::try_from(u16_from_buffer(&buf[..2]))? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Encodes the packet into its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, mode),
            Packet::Data { block, data } => encode_data(*block, data),
            Packet::Ack { block } => Ok(encode_ack(*block)),
            Packet::Error { code, message } => encode_error(*code, message),
        }
    }
}

///////////////////////////////////////////////////////////////
// Datagram channels

/// An unreliable datagram transport. Dropping the channel closes it.
#[allow(async_fn_in_trait)]
pub trait DatagramChannel {
    async fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<()>;

    /// Waits for the next datagram, returning its length and source.
    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// A UDP socket registered with the async-io reactor.
#[derive(Debug)]
pub struct UdpChannel {
    sock: Async<UdpSocket>,
}

const BIND_ATTEMPTS: usize = 16;

impl UdpChannel {
    pub fn bind(addr: SocketAddr) -> io::Result<UdpChannel> {
        Ok(UdpChannel { sock: Async::<UdpSocket>::bind(addr)? })
    }

    /// Binds to a random unprivileged port on the wildcard address of the same family as
    /// `peer`, falling back to an OS-assigned port if every random pick is taken.
    pub fn bind_ephemeral(peer: SocketAddr) -> io::Result<UdpChannel> {
        let ip: IpAddr = match peer {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let mut rng = rand::thread_rng();
        for _ in 0..BIND_ATTEMPTS {
            let port: u16 = rng.gen_range(1024..65535);
            match UdpChannel::bind(SocketAddr::new(ip, port)) {
                Ok(chan) => return Ok(chan),
                Err(e) => log::warn!("Couldn't bind socket: {}", e),
            }
        }
        UdpChannel::bind(SocketAddr::new(ip, 0))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }
}

impl DatagramChannel for UdpChannel {
    async fn send_to(&mut self, buf: &[u8], dst: SocketAddr) -> io::Result<()> {
        self.sock.send_to(buf, dst).await.map(|_| ())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.sock.recv_from(buf).await
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a datagram channel that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket<C> {
    chan: C,
}

impl<C: DatagramChannel> TftpSocket<C> {
    pub fn new(chan: C) -> TftpSocket<C> {
        TftpSocket { chan }
    }

    pub async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let bytes = packet.encode()?;
        self.send_raw(&bytes, dst).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.chan.send_to(bytes, dst).await?;
        Ok(())
    }

    /// Receives and decodes one datagram, giving up at `deadline`.
    pub async fn recv_until(&mut self, deadline: Instant) -> TftpResult<(Packet, SocketAddr)> {
        // One byte more than the largest legal packet so oversized DATA is caught by decode.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = timeout_at(deadline, self.chan.recv_from(&mut buf)).await??;

        match Packet::decode(&buf[..total_written]) {
            Ok(packet) => Ok((packet, src)),
            Err(e) => Err(SocketError::Malformed(e, src)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket as TokioUdpSocket;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let packet = Packet::decode(&buf);
        assert_eq!(
            packet,
            Ok(Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: "octet".to_string() })
        );
    }

    #[test]
    fn test_encode_request_layout() {
        let bytes = encode_request(OpCode::Wrq, "a.bin", "octet").unwrap();
        assert_eq!(
            bytes,
            vec![0x00, 0x02, b'a', b'.', b'b', b'i', b'n', 0x00, b'o', b'c', b't', b'e', b't', 0x00]
        );
    }

    #[test]
    fn test_request_round_trip() {
        for (op, name, mode) in [
            (OpCode::Rrq, "boot/pxelinux.0", "octet"),
            (OpCode::Wrq, "notes.txt", "netascii"),
            (OpCode::Rrq, "x", "MAIL"),
            (OpCode::Wrq, "dir with spaces/file", ""),
        ] {
            let bytes = encode_request(op, name, mode).unwrap();
            let expected = match op {
                OpCode::Rrq => Packet::ReadReq { path: name.to_string(), mode: mode.to_string() },
                _ => Packet::WriteReq { path: name.to_string(), mode: mode.to_string() },
            };
            assert_eq!(Packet::decode(&bytes), Ok(expected));
        }
    }

    #[test]
    fn test_encode_request_rejects_bad_fields() {
        assert!(matches!(
            encode_request(OpCode::Rrq, "bad\0name", "octet"),
            Err(PacketError::MalformedField(_))
        ));
        assert!(matches!(
            encode_request(OpCode::Rrq, "name", "oc\0tet"),
            Err(PacketError::MalformedField(_))
        ));
        assert!(matches!(
            encode_request(OpCode::Wrq, "", "octet"),
            Err(PacketError::MalformedField(_))
        ));
        assert!(matches!(
            encode_request(OpCode::Data, "name", "octet"),
            Err(PacketError::MalformedField(_))
        ));
        assert!(matches!(
            encode_request(OpCode::Rrq, "naïve.txt", "octet"),
            Err(PacketError::MalformedField(_))
        ));
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = Packet::decode(&buf);
        assert_eq!(packet, Ok(Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] }));
    }

    #[test]
    fn test_data_round_trip_at_boundaries() {
        for block in [0u16, 1, 255, 256, 65534, 65535] {
            for len in [0usize, 1, 511, 512] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let bytes = encode_data(block, &payload).unwrap();
                assert_eq!(bytes.len(), 4 + len);
                assert_eq!(Packet::decode(&bytes), Ok(Packet::Data { block, data: payload }));
            }
        }
    }

    #[test]
    fn test_wrapped_block_is_encoded_modulo() {
        let block = 65535u16.wrapping_add(1);
        assert_eq!(encode_ack(block), vec![0x00, 0x04, 0x00, 0x00]);
        assert_eq!(encode_data(65535, &[]).unwrap(), vec![0x00, 0x03, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_data_rejects_oversized_payload() {
        assert!(matches!(
            encode_data(1, &[0u8; 513]),
            Err(PacketError::MalformedField(_))
        ));
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        assert_eq!(Packet::decode(&buf), Ok(Packet::Ack { block: 0x102f }));
        assert_eq!(encode_ack(0x102f), buf);
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal!
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21];

        let packet = Packet::decode(&buf);
        assert_eq!(packet, Ok(Packet::Error { code: ErrorCode::Illegal, message: "Illegal!".to_string() }));
    }

    #[test]
    fn test_error_round_trip_keeps_unknown_code() {
        let bytes = encode_error(ErrorCode::Other(42), "custom failure").unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x00, 0x2A]);
        assert_eq!(*bytes.last().unwrap(), 0x00);
        assert_eq!(
            Packet::decode(&bytes),
            Ok(Packet::Error { code: ErrorCode::Other(42), message: "custom failure".to_string() })
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        assert_eq!(
            Packet::decode(&[]),
            Err(PacketError::Truncated { needed: 2, actual: 0 })
        );
        assert_eq!(
            Packet::decode(&[0x10]),
            Err(PacketError::Truncated { needed: 2, actual: 1 })
        );
        assert_eq!(Packet::decode(&[0x10, 0x00]), Err(PacketError::UnknownOpcode(0x1000)));
        assert_eq!(Packet::decode(&[0x00, 0x09]), Err(PacketError::UnknownOpcode(9)));
        assert_eq!(Packet::decode(&[0x00, 0x00, 0x00, 0x01]), Err(PacketError::UnknownOpcode(0)));
        // Short DATA and ACK headers
        assert_eq!(
            Packet::decode(&[0x00, 0x03, 0x00]),
            Err(PacketError::Truncated { needed: 4, actual: 3 })
        );
        assert_eq!(
            Packet::decode(&[0x00, 0x04]),
            Err(PacketError::Truncated { needed: 4, actual: 2 })
        );
        // Unterminated read path
        assert!(matches!(
            Packet::decode(&[0x00, 0x01, 0x68, 0x69]),
            Err(PacketError::MalformedField(_))
        ));
        // Missing mode string
        assert!(matches!(
            Packet::decode(&[0x00, 0x01, 0x68, 0x69, 0x00]),
            Err(PacketError::MalformedField(_))
        ));
        // Oversized DATA payload
        let mut big = vec![0x00, 0x03, 0x00, 0x01];
        big.extend_from_slice(&[0u8; 513]);
        assert!(matches!(Packet::decode(&big), Err(PacketError::MalformedField(_))));
    }

    #[test]
    fn test_file_mode_parses_any_case() {
        assert_eq!("OCTET".parse::<FileMode>(), Ok(FileMode::Octet));
        assert_eq!("NetAscii".parse::<FileMode>(), Ok(FileMode::NetAscii));
        assert_eq!("mail".parse::<FileMode>(), Ok(FileMode::Mail));
        assert!("binary".parse::<FileMode>().is_err());
        assert_eq!(FileMode::default().to_string(), "octet");
    }

    #[test]
    fn test_error_code_from_io_kind() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::PermissionDenied), ErrorCode::AccessViolation);
        assert_eq!(ErrorCode::from(io::ErrorKind::Interrupted), ErrorCode::Undefined);
    }

    #[tokio::test]
    async fn test_udp_channel_exchanges_packets() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let chan = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client_addr = chan.local_addr().unwrap();
        let mut sock = TftpSocket::new(chan);

        sock.send(&Packet::Ack { block: 7 }, server_addr).await.unwrap();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (n, src) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x00, 0x04, 0x00, 0x07]);
        assert_eq!(src, client_addr);

        server
            .send_to(&encode_data(1, b"hello").unwrap(), client_addr)
            .await
            .unwrap();
        let (packet, src) = sock.recv_until(Instant::now() + Duration::from_secs(5)).await.unwrap();
        assert_eq!(packet, Packet::Data { block: 1, data: b"hello".to_vec() });
        assert_eq!(src, server_addr);

        server.send_to(&[0x00, 0x09], client_addr).await.unwrap();
        match sock.recv_until(Instant::now() + Duration::from_secs(5)).await {
            Err(SocketError::Malformed(e, src)) => {
                assert_eq!(e, PacketError::UnknownOpcode(9));
                assert_eq!(src, server_addr);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_udp_channel_times_out() {
        let chan = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut sock = TftpSocket::new(chan);
        let result = sock.recv_until(Instant::now() + Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SocketError::Timeout(_))));
    }

    #[test]
    fn test_bind_ephemeral_matches_family() {
        let chan = UdpChannel::bind_ephemeral("127.0.0.1:69".parse().unwrap()).unwrap();
        assert!(chan.local_addr().unwrap().is_ipv4());
        assert_ne!(chan.local_addr().unwrap().port(), 0);
    }
}
