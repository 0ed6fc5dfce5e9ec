//! Netlink attribute codec
//!
//! Netlink attributes are type-length-value records: a native-endian `u16`
//! length (header included), a native-endian `u16` type whose top two bits
//! are the nested and network-byte-order flags, then the payload padded to
//! a 4-byte boundary.
//!
//! [`conntrack_id`] reads the kernel's connection id out of the conntrack
//! blob the queue attaches to each packet; [`put_attr`] and [`put_nested`]
//! build attributes for queue configuration and verdict messages.

use thiserror::Error;

/// Size of the attribute header
pub const NLA_HDRLEN: usize = 4;

/// Attribute contains nested attributes
pub const NLA_F_NESTED: u16 = 1 << 15;

/// Attribute payload is in network byte order
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;

const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Conntrack attribute: connection mark (be32)
pub const CTA_MARK: u16 = 8;

/// Conntrack attribute: kernel connection id (be32)
pub const CTA_ID: u16 = 12;

/// Rounds a length up to the 4-byte netlink alignment.
pub const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Malformed attribute stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttrError {
    #[error("attribute header truncated at offset {0}")]
    Truncated(usize),

    #[error("attribute at offset {offset} has invalid length {len}")]
    BadLength { offset: usize, len: usize },
}

/// A borrowed attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub kind: u16,
    pub nested: bool,
    pub data: &'a [u8],
}

impl Attribute<'_> {
    /// Payload as a big-endian `u32`, if it is at least 4 bytes long.
    pub fn be_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Parses a complete attribute stream.
///
/// Fails on the first malformed attribute; a missing final pad is tolerated.
pub fn parse(buf: &[u8]) -> Result<Vec<Attribute<'_>>, AttrError> {
    let mut attrs = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let Some(header) = buf.get(pos..pos + NLA_HDRLEN) else {
            return Err(AttrError::Truncated(pos));
        };
        let len = usize::from(u16::from_ne_bytes([header[0], header[1]]));
        let raw_kind = u16::from_ne_bytes([header[2], header[3]]);

        if len < NLA_HDRLEN || pos + len > buf.len() {
            return Err(AttrError::BadLength { offset: pos, len });
        }

        attrs.push(Attribute {
            kind: raw_kind & NLA_TYPE_MASK,
            nested: raw_kind & NLA_F_NESTED != 0,
            data: &buf[pos + NLA_HDRLEN..pos + len],
        });

        pos = (pos + align(len)).min(buf.len());
    }

    Ok(attrs)
}

/// Extracts the kernel connection id from a conntrack attribute blob.
///
/// Returns `None` when the blob is malformed, has no `CTA_ID`, or the id is
/// shorter than 4 bytes. Callers treat `None` as "no stream identity".
pub fn conntrack_id(ct: &[u8]) -> Option<u32> {
    parse(ct)
        .ok()?
        .iter()
        .find(|attr| attr.kind == CTA_ID)
        .and_then(Attribute::be_u32)
}

/// Appends one attribute with padding.
pub fn put_attr(buf: &mut Vec<u8>, kind: u16, data: &[u8]) {
    let len = NLA_HDRLEN + data.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(buf.len() + align(len) - len, 0);
}

/// Appends a nested attribute wrapping already-encoded attributes.
pub fn put_nested(buf: &mut Vec<u8>, kind: u16, inner: &[u8]) {
    put_attr(buf, kind | NLA_F_NESTED, inner);
}
