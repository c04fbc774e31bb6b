//! Netlink framing
//!
//! Walks `nlmsghdr` frames and `nlattr` attributes in a receive buffer and
//! encodes the small dump requests the daemons send. All header fields are
//! host byte order.

use crate::error::{Result, SyncError};

pub const NLMSG_HDRLEN: usize = 16;
pub const NLA_HDRLEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_DUMP: u16 = 0x300;

pub const NLA_F_NESTED: u16 = 0x8000;
pub const NLA_F_NET_BYTEORDER: u16 = 0x4000;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Round `len` up to the 4-byte netlink alignment.
pub fn align(len: usize) -> usize {
    (len + 3) & !3
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_ne_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

/// Parsed `nlmsghdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub message_type: u16,
    pub flags: u16,
    pub sequence: u32,
    pub port: u32,
}

/// One netlink message inside a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    /// Header and payload.
    pub bytes: &'a [u8],
    /// Payload following the header.
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// errno carried by an `NLMSG_ERROR` frame (0 is an ACK).
    pub fn error_code(&self) -> Option<i32> {
        if self.header.message_type != NLMSG_ERROR {
            return None;
        }
        read_u32(self.payload, 0).map(|v| v as i32)
    }

    /// Sequence number of the dump an `NLMSG_DONE` frame closes.
    pub fn done_sequence(&self) -> Option<u32> {
        (self.header.message_type == NLMSG_DONE).then_some(self.header.sequence)
    }

    /// True for control frames carrying no event.
    pub fn is_control(&self) -> bool {
        matches!(
            self.header.message_type,
            NLMSG_NOOP | NLMSG_ERROR | NLMSG_DONE | NLMSG_OVERRUN
        )
    }
}

/// Iterator over the frames of a receive buffer.
///
/// A frame whose length field is inconsistent ends the iteration with an
/// error; the rest of that buffer cannot be delimited.
pub struct Frames<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Frames<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buf.get(self.offset..)?;
        if rest.len() < NLMSG_HDRLEN {
            if !rest.is_empty() {
                self.offset = self.buf.len();
                return Some(Err(SyncError::decode(
                    "netlink frame",
                    format!("{} trailing bytes", rest.len()),
                )));
            }
            return None;
        }

        let header = FrameHeader {
            length: read_u32(rest, 0)?,
            message_type: read_u16(rest, 4)?,
            flags: read_u16(rest, 6)?,
            sequence: read_u32(rest, 8)?,
            port: read_u32(rest, 12)?,
        };
        let length = header.length as usize;
        if length < NLMSG_HDRLEN || length > rest.len() {
            self.offset = self.buf.len();
            return Some(Err(SyncError::decode(
                "netlink frame",
                format!("length {} with {} bytes left", length, rest.len()),
            )));
        }

        self.offset += align(length);
        Some(Ok(Frame {
            header,
            bytes: &rest[..length],
            payload: &rest[NLMSG_HDRLEN..length],
        }))
    }
}

/// One `nlattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr<'a> {
    /// Attribute type with the nested/byte-order flags masked off.
    pub kind: u16,
    pub nested: bool,
    pub value: &'a [u8],
}

impl Attr<'_> {
    pub fn u8(&self) -> Result<u8> {
        self.value
            .first()
            .copied()
            .ok_or_else(|| SyncError::decode("netlink attribute", "empty u8"))
    }

    /// Big-endian u16 (ports).
    pub fn be_u16(&self) -> Result<u16> {
        match self.value {
            [a, b, ..] => Ok(u16::from_be_bytes([*a, *b])),
            _ => Err(SyncError::decode("netlink attribute", "short u16")),
        }
    }

    /// Big-endian u32 (conntrack status and id).
    pub fn be_u32(&self) -> Result<u32> {
        match self.value {
            [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => Err(SyncError::decode("netlink attribute", "short u32")),
        }
    }

    pub fn attrs(&self) -> Attrs<'_> {
        Attrs::new(self.value)
    }
}

/// Iterator over a run of attributes.
pub struct Attrs<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Attrs<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = Result<Attr<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buf.get(self.offset..)?;
        if rest.len() < NLA_HDRLEN {
            return None;
        }

        let length = read_u16(rest, 0)? as usize;
        let raw_kind = read_u16(rest, 2)?;
        if length < NLA_HDRLEN || length > rest.len() {
            self.offset = self.buf.len();
            return Some(Err(SyncError::decode(
                "netlink attribute",
                format!("length {} with {} bytes left", length, rest.len()),
            )));
        }

        self.offset += align(length);
        Some(Ok(Attr {
            kind: raw_kind & NLA_TYPE_MASK,
            nested: raw_kind & NLA_F_NESTED != 0,
            value: &rest[NLA_HDRLEN..length],
        }))
    }
}

/// Encode a request frame around `payload`.
pub fn encode_request(message_type: u16, flags: u16, sequence: u32, payload: &[u8]) -> Vec<u8> {
    let length = NLMSG_HDRLEN + payload.len();
    let mut buf = Vec::with_capacity(align(length));
    buf.extend_from_slice(&(length as u32).to_ne_bytes());
    buf.extend_from_slice(&message_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&sequence.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align(length), 0);
    buf
}
