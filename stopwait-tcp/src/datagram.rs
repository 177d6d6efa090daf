//! Wire-format definitions for datagrams.
//!
//! Every message exchanged between peers is a [`Datagram`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header, endpoints, payload).
//! - Serialising a [`Datagram`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Datagram`], returning errors
//!   for malformed or truncated input.
//! - Computing and re-deriving the integrity checksum.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flag      |             Sequence Number ...               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     ...       |          Acknowledgment Number ...            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     ...       |        Payload Length         |  Checksum ... |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     ...       |  Source endpoint (7 or 19 bytes) ...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Destination endpoint (7 or 19 bytes) ...  |  Payload ...     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Fixed header size: [`HEADER_LEN`] = 13 bytes.
//! flag(1) + seq(4) + ack(4) + payload_len(2) + checksum(2)
//!
//! An endpoint is `family(1) + address(4 | 16) + port(2)` where family is
//! `4` or `6`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 13;

/// Largest payload that still fits a single UDP datagram with two IPv6
/// endpoints in the header.
pub const MAX_PAYLOAD: usize = 65_507 - HEADER_LEN - 2 * ENDPOINT_V6_LEN;

const ENDPOINT_V4_LEN: usize = 1 + 4 + 2;
const ENDPOINT_V6_LEN: usize = 1 + 16 + 2;

// Byte offsets of each field within the fixed header.
const OFF_FLAG: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_ACK: usize = 5;
const OFF_PAYLOAD_LEN: usize = 9;
const OFF_CHECKSUM: usize = 11;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Control flag carried by every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Application data; the only flag whose payload is meaningful.
    None,
    /// Open request from the initiator.
    Syn,
    /// Acceptance of a SYN, sent from the freshly spawned connection.
    SynAck,
    /// Acknowledges the datagram whose `seq` is carried in `ack`.
    Ack,
    /// Sender has nothing more to send.
    Fin,
}

impl Flag {
    /// Wire code of this flag.
    pub fn code(self) -> u8 {
        match self {
            Flag::None => 0,
            Flag::Syn => 1,
            Flag::SynAck => 2,
            Flag::Ack => 3,
            Flag::Fin => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Flag::None,
            1 => Flag::Syn,
            2 => Flag::SynAck,
            3 => Flag::Ack,
            4 => Flag::Fin,
            _ => return None,
        })
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flag::None => "DATA",
            Flag::Syn => "SYN",
            Flag::SynAck => "SYN_ACK",
            Flag::Ack => "ACK",
            Flag::Fin => "FIN",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram.
///
/// Immutable once constructed: the checksum is computed by the constructors
/// and can be re-derived with [`Datagram::calculate_checksum`] to detect
/// corruption in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    flag: Flag,
    seq: u32,
    ack: u32,
    src: SocketAddr,
    dst: SocketAddr,
    payload: Vec<u8>,
    checksum: u16,
}

impl Datagram {
    /// Build a datagram and stamp it with a freshly computed checksum.
    ///
    /// Payloads longer than [`MAX_PAYLOAD`] cannot be represented on the wire;
    /// callers are expected to have checked the length.
    pub fn new(
        flag: Flag,
        seq: u32,
        ack: u32,
        src: SocketAddr,
        dst: SocketAddr,
        payload: Vec<u8>,
    ) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD, "payload exceeds MAX_PAYLOAD");
        let mut datagram = Self {
            flag,
            seq,
            ack,
            src,
            dst,
            payload,
            checksum: 0,
        };
        datagram.checksum = datagram.calculate_checksum();
        datagram
    }

    /// A payload-less control datagram (SYN, SYN_ACK, FIN, ...).
    pub fn control(flag: Flag, seq: u32, ack: u32, src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(flag, seq, ack, src, dst, Vec::new())
    }

    /// An application data datagram (flag NONE).
    pub fn data(seq: u32, src: SocketAddr, dst: SocketAddr, payload: Vec<u8>) -> Self {
        Self::new(Flag::None, seq, 0, src, dst, payload)
    }

    /// The ACK answering this datagram: addressed back to its sender and
    /// carrying its sequence number in `ack`.
    pub fn ack_for(&self, seq: u32) -> Self {
        Self::control(Flag::Ack, seq, self.seq, self.dst, self.src)
    }

    pub fn flag(&self) -> Flag {
        self.flag
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn src(&self) -> SocketAddr {
        self.src
    }

    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The checksum carried by this datagram (possibly stale if it was
    /// corrupted on the way).
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Recompute the Internet checksum over this datagram's contents.
    pub fn calculate_checksum(&self) -> u16 {
        internet_checksum(&self.encode_with(0))
    }

    /// `true` when the carried checksum matches the contents.
    pub fn is_valid(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// `true` when `self` is a resend of `other`: same sender, flag and
    /// sequence number.
    pub fn is_retransmission_of(&self, other: &Datagram) -> bool {
        self.flag == other.flag && self.seq == other.seq && self.src == other.src
    }

    /// A copy with `mask` XORed into one content byte while the checksum is
    /// left untouched, i.e. what a bit error in transit looks like.
    ///
    /// `position` indexes the eight `seq`/`ack` bytes followed by the
    /// payload bytes, modulo their total count.
    pub fn with_flipped_bits(&self, position: usize, mask: u8) -> Self {
        let mut damaged = self.clone();
        let span = 8 + self.payload.len();
        let position = position % span;
        if position < 4 {
            damaged.seq ^= u32::from(mask) << (8 * position);
        } else if position < 8 {
            damaged.ack ^= u32::from(mask) << (8 * (position - 4));
        } else {
            damaged.payload[position - 8] ^= mask;
        }
        damaged
    }

    /// Serialise this datagram, carrying its stored checksum.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(self.checksum)
    }

    /// Parse a [`Datagram`] from a raw byte slice.
    ///
    /// The checksum is read but **not** verified; use [`Datagram::is_valid`].
    /// Returns [`Err`] if:
    /// - `buf` is shorter than the header or an endpoint,
    /// - the flag or an address family is unknown, or
    /// - the `payload_len` field disagrees with the remaining bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, DatagramError> {
        if buf.len() < HEADER_LEN {
            return Err(DatagramError::BufferTooShort);
        }

        let flag = Flag::from_code(buf[OFF_FLAG]).ok_or(DatagramError::UnknownFlag(buf[OFF_FLAG]))?;
        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN) as usize;
        let checksum = read_u16(buf, OFF_CHECKSUM);

        let (src, offset) = read_endpoint(buf, HEADER_LEN)?;
        let (dst, offset) = read_endpoint(buf, offset)?;

        if buf.len() != offset + payload_len {
            return Err(DatagramError::LengthMismatch);
        }

        Ok(Self {
            flag,
            seq,
            ack,
            src,
            dst,
            payload: buf[offset..].to_vec(),
            checksum,
        })
    }

    fn encode_with(&self, checksum: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 2 * ENDPOINT_V6_LEN + self.payload.len());
        buf.push(self.flag.code());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&checksum.to_be_bytes());
        write_endpoint(&mut buf, self.src);
        write_endpoint(&mut buf, self.dst);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl fmt::Display for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seq={} ack={} {} -> {} len={}",
            self.flag,
            self.seq,
            self.ack,
            self.src,
            self.dst,
            self.payload.len()
        )
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatagramError {
    #[error("buffer too short to contain a datagram")]
    BufferTooShort,
    #[error("unknown flag code {0}")]
    UnknownFlag(u8),
    #[error("unknown address family {0}")]
    UnknownFamily(u8),
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn write_endpoint(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(FAMILY_V4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(FAMILY_V6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Read one endpoint starting at `off`; returns it with the offset just past it.
fn read_endpoint(buf: &[u8], off: usize) -> Result<(SocketAddr, usize), DatagramError> {
    let family = *buf.get(off).ok_or(DatagramError::BufferTooShort)?;
    let len = match family {
        FAMILY_V4 => ENDPOINT_V4_LEN,
        FAMILY_V6 => ENDPOINT_V6_LEN,
        other => return Err(DatagramError::UnknownFamily(other)),
    };
    let bytes = buf.get(off..off + len).ok_or(DatagramError::BufferTooShort)?;

    let ip = if family == FAMILY_V4 {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&bytes[1..5]);
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[1..17]);
        IpAddr::V6(Ipv6Addr::from(octets))
    };
    let port = read_u16(bytes, len - 2);

    Ok((SocketAddr::new(ip, port), off + len))
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte, padded with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
