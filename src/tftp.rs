// Packet model and wire codec for TFTP (RFC 1350) with the option extension (RFC 2347).
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
// 6        Option ACK (OACK)
//
// RRQ/WRQ: opcode | Filename | 0x00 | Mode | 0x00 | (OptName | 0x00 | OptValue | 0x00)*
// DATA:    opcode | Block # (2 bytes) | Data (0..=blksize bytes)
// ACK:     opcode | Block # (2 bytes)
// ERROR:   opcode | ErrorCode (2 bytes) | ErrMsg | 0x00
// OACK:    opcode | (OptName | 0x00 | OptValue | 0x00)*
//
// Option names are case-insensitive. They are kept lower-cased in memory, so a
// lookup for "blksize" finds an option the server spelled "BLKSIZE".

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::str::FromStr;

/// Well-known port a server listens on for requests.
pub const DEFAULT_PORT: u16 = 69;

/// Block size used when no `blksize` option was granted.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Smallest block size accepted by RFC 2348.
pub const MIN_BLOCK_SIZE: u16 = 8;

/// Largest block size accepted by RFC 2348.
pub const MAX_BLOCK_SIZE: u16 = 65464;

pub const OPT_BLKSIZE: &str = "blksize";
pub const OPT_TSIZE: &str = "tsize";
pub const OPT_TIMEOUT: &str = "timeout";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Returned when a datagram does not hold a well-formed TFTP packet.
///
/// Receivers treat this as noise: the datagram is dropped and the wait goes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPacketError(pub String);

impl error::Error for InvalidPacketError {}

impl fmt::Display for InvalidPacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid TFTP packet: {}", self.0)
    }
}

type TftpResult<T> = Result<T, InvalidPacketError>;

fn invalid<T>(reason: impl Into<String>) -> TftpResult<T> {
    Err(InvalidPacketError(reason.into()))
}

///////////////////////////////////////////////////////////////
// Packet fields

/// Represents the mode a file is transferred in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferMode {
    NetAscii,
    #[default]
    Octet,
    Mail,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::NetAscii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_lowercase().as_str() {
            "netascii" => Ok(TransferMode::NetAscii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(format!("Unknown transfer mode: '{raw}'")),
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFullOrAllocationExceeded = 3,
    IllegalTftpOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Codes outside the RFC 1350 table (e.g. the RFC 2347 code 8) map to `Undefined`.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFullOrAllocationExceeded,
            4 => ErrorCode::IllegalTftpOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ErrorCode::Undefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFullOrAllocationExceeded => "disk full or allocation exceeded",
            ErrorCode::IllegalTftpOperation => "illegal TFTP operation",
            ErrorCode::UnknownTransferId => "unknown transfer ID",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
        };
        write!(f, "{} ({})", text, self.as_u16())
    }
}

/// Option name/value pairs carried by requests and OACKs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    pub fn new() -> Options {
        Options(BTreeMap::new())
    }

    /// Inserts an option, replacing any value stored under the same name in any casing.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Options {
        let mut options = Options::new();
        for (name, value) in iter {
            options.insert(name.as_ref(), value);
        }
        options
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file the client wants to read.
        filename: String,

        /// The file mode.
        mode: TransferMode,

        /// Options the client asks the server to honor.
        options: Options,
    },

    /// A write request packet
    WriteReq {
        filename: String,
        mode: TransferMode,
        options: Options,
    },

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
    Error {
        code: ErrorCode,
        message: String,
    },

    /// An option acknowledgment: the subset of requested options the server accepted.
    OptionAck {
        options: Options,
    },
}

/// TFTP opcodes, one per packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode { Rrq = 1, Wrq = 2, Data = 3, Ack = 4, Error = 5, Oack = 6 }

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the string along with the number of bytes consumed, terminator included. A string
/// without a terminator or with invalid UTF-8 is an error.
fn string_from_buffer(buf: &[u8]) -> TftpResult<(String, usize)> {
    let Some(end) = buf.iter().position(|&c| c == 0x00) else {
        return invalid("string is missing its null terminator");
    };

    match String::from_utf8(buf[..end].to_vec()) {
        Ok(s) => Ok((s, end + 1)),
        Err(_) => invalid("string is not valid UTF-8"),
    }
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    if buf[0] != 0x00 {
        return invalid(format!("opcode high byte must be zero, got {:#04x}", buf[0]));
    }

    match buf[1] {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::Oack),
        raw => invalid(format!("unknown opcode: {raw}")),
    }
}

/// Parses alternating name/value strings until the buffer is exhausted.
fn parse_options(mut buf: &[u8]) -> TftpResult<Options> {
    let mut options = Options::new();
    while !buf.is_empty() {
        let (name, used) = string_from_buffer(buf)?;
        buf = &buf[used..];
        if name.is_empty() {
            return invalid("option name is empty");
        }
        if buf.is_empty() {
            return invalid(format!("option '{name}' has no value"));
        }
        let (value, used) = string_from_buffer(buf)?;
        buf = &buf[used..];
        options.insert(&name, value);
    }

    Ok(options)
}

fn parse_request(buf: &[u8]) -> TftpResult<(String, TransferMode, Options)> {
    let (filename, used) = string_from_buffer(buf)?;
    let rest = &buf[used..];
    if rest.is_empty() {
        return invalid("request does not contain a mode");
    }

    let (raw_mode, used) = string_from_buffer(rest)?;
    let mode = raw_mode.parse::<TransferMode>().map_err(InvalidPacketError)?;
    let options = parse_options(&rest[used..])?;

    Ok((filename, mode, options))
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return invalid("DATA is shorter than 4 bytes");
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != 4 {
        return invalid(format!("ACK must be exactly 4 bytes, got {}", buf.len()));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return invalid("ERROR is shorter than 4 bytes");
    }
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..])?;
    Ok(Packet::Error { code, message })
}

/// Whether `s` fits in a null-terminated field without being cut short.
pub fn is_wire_string(s: &str) -> bool {
    !s.contains('\0')
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    // A NUL inside the text would end the field early and shift every field after it, so only the
    // part a receiver can read is written.
    let text = s.split('\0').next().unwrap_or("");
    buf.extend_from_slice(text.as_bytes());
    buf.push(0x00);
}

fn push_options(buf: &mut Vec<u8>, options: &Options) {
    for (name, value) in options.iter() {
        push_string(buf, name);
        push_string(buf, value);
    }
}

impl Packet {
    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::Oack,
        }
    }

    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return invalid("packet too short to hold an opcode");
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => {
                let (filename, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::ReadReq { filename, mode, options })
            }
            OpCode::Wrq => {
                let (filename, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::WriteReq { filename, mode, options })
            }
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
            OpCode::Oack => Ok(Packet::OptionAck { options: parse_options(&buf[2..])? }),
        }
    }

    /// Serializes the packet into its wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&(self.op_code() as u16).to_be_bytes());

        match self {
            Packet::ReadReq { filename, mode, options }
            | Packet::WriteReq { filename, mode, options } => {
                push_string(&mut buf, filename);
                push_string(&mut buf, mode.as_str());
                push_options(&mut buf, options);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                push_string(&mut buf, message);
            }
            Packet::OptionAck { options } => push_options(&mut buf, options),
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::ReadReq {
                filename: "/path/to/data.txt".to_string(),
                mode: TransferMode::Octet,
                options: Options::new(),
            }
        );
    }

    #[test]
    fn test_packet_write_req_with_options() {
        let mut buf = vec![0x00, 0x02];
        buf.extend_from_slice(b"a.bin\0NetASCII\0BLKSIZE\x001024\0tsize\x00300\0");

        let packet = Packet::parse_from_buf(&buf).unwrap();
        let Packet::WriteReq { filename, mode, options } = packet else {
            panic!("expected a write request");
        };
        assert_eq!(filename, "a.bin");
        assert_eq!(mode, TransferMode::NetAscii);
        assert_eq!(options.get("blksize"), Some("1024"));
        assert_eq!(options.get("TSize"), Some("300"));
        assert_eq!(options.len(), 2);
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

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] });
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let packet = Packet::parse_from_buf(&[0x00, 0x03, 0x00, 0x02]);
        assert_eq!(packet.unwrap(), Packet::Data { block: 2, data: vec![] });
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f } );
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal! with terminating nullchar
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Error { code: ErrorCode::IllegalTftpOperation, message: "Illegal!".to_string() }
        );
    }

    #[test]
    fn test_unknown_error_code_is_undefined() {
        let packet = Packet::parse_from_buf(&[0x00, 0x05, 0x00, 0x08, b'n', b'o', 0x00]).unwrap();
        assert_eq!(packet, Packet::Error { code: ErrorCode::Undefined, message: "no".to_string() });
    }

    #[test]
    fn test_packet_parses_oack() {
        let mut buf = vec![0x00, 0x06];
        buf.extend_from_slice(b"BlkSize\x00512\x00");

        let packet = Packet::parse_from_buf(&buf).unwrap();
        let expected: Options = [("blksize", "512")].into_iter().collect();
        assert_eq!(packet, Packet::OptionAck { options: expected });

        assert_eq!(
            Packet::parse_from_buf(&[0x00, 0x06]).unwrap(),
            Packet::OptionAck { options: Options::new() }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short, bad high byte, unknown opcodes
        assert!(Packet::parse_from_buf(&[]).is_err());
        assert!(Packet::parse_from_buf(&[0x00]).is_err());
        assert!(Packet::parse_from_buf(&[0x10, 0x00]).is_err());
        assert!(Packet::parse_from_buf(&[0x01, 0x04, 0x00, 0x01]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x07]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x00]).is_err());
        // ACK must be exactly 4 bytes
        assert!(Packet::parse_from_buf(&[0x00, 0x04, 0x00]).is_err());
        assert!(Packet::parse_from_buf(&[0x00, 0x04, 0x00, 0x01, 0x00]).is_err());
        // DATA without a full block number
        assert!(Packet::parse_from_buf(&[0x00, 0x03, 0x01]).is_err());
        // ERROR message without terminator
        assert!(Packet::parse_from_buf(&[0x00, 0x05, 0x00, 0x01, 0x68, 0x69]).is_err());
        // Unterminated read path
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Invalid mode string
        assert!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]).is_err());
        // OACK with a dangling option name, and with an unterminated value
        assert!(Packet::parse_from_buf(b"\x00\x06blksize\x00").is_err());
        assert!(Packet::parse_from_buf(b"\x00\x06blksize\x00512").is_err());
    }

    #[test]
    fn test_encoding_layout() {
        let options: Options = [("blksize", "1024")].into_iter().collect();
        let rrq = Packet::ReadReq { filename: "f".to_string(), mode: TransferMode::Octet, options };
        assert_eq!(rrq.to_bytes(), b"\x00\x01f\x00octet\x00blksize\x001024\x00".to_vec());

        assert_eq!(Packet::Ack { block: 258 }.to_bytes(), vec![0x00, 0x04, 0x01, 0x02]);
        assert_eq!(
            Packet::Error { code: ErrorCode::FileNotFound, message: "x".to_string() }.to_bytes(),
            vec![0x00, 0x05, 0x00, 0x01, b'x', 0x00]
        );
    }

    #[test]
    fn test_every_variant_survives_the_wire() {
        let options: Options = [("blksize", "1428"), ("tsize", "0"), ("timeout", "3")].into_iter().collect();
        let packets = vec![
            Packet::ReadReq { filename: "boot/pxelinux.0".to_string(), mode: TransferMode::Octet, options: options.clone() },
            Packet::WriteReq { filename: "up.txt".to_string(), mode: TransferMode::NetAscii, options: Options::new() },
            Packet::Data { block: u16::MAX, data: vec![0x00; 512] },
            Packet::Ack { block: 0 },
            Packet::Error { code: ErrorCode::NoSuchUser, message: "nobody here".to_string() },
            Packet::OptionAck { options },
        ];

        for packet in packets {
            assert_eq!(Packet::parse_from_buf(&packet.to_bytes()), Ok(packet));
        }
    }

    #[test]
    fn test_embedded_nul_cannot_break_framing() {
        assert!(is_wire_string("boot/pxelinux.0"));
        assert!(!is_wire_string("a\0b"));

        let rrq = Packet::ReadReq { filename: "a\0b".to_string(), mode: TransferMode::Octet, options: Options::new() };
        assert_eq!(rrq.to_bytes(), b"\x00\x01a\x00octet\x00".to_vec());
        assert_eq!(
            Packet::parse_from_buf(&rrq.to_bytes()),
            Ok(Packet::ReadReq { filename: "a".to_string(), mode: TransferMode::Octet, options: Options::new() })
        );

        let error = Packet::Error { code: ErrorCode::Undefined, message: "x\0y".to_string() };
        assert_eq!(error.to_bytes(), vec![0x00, 0x05, 0x00, 0x00, b'x', 0x00]);
    }
}
