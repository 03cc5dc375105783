use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;

use crate::{ConnectionId, EcnCodepoint, QuicVersion, MAX_CID_SIZE};

/// The long header form bit, common to IETF and transitional versions
const LONG_HEADER_FORM: u8 = 0x80;

/// gQUIC public flags
const GQUIC_FLAG_VERSION: u8 = 0x01;
const GQUIC_FLAG_RST: u8 = 0x02;
const GQUIC_FLAG_CID: u8 = 0x08;

/// IETF long header packet types (bits 4-5 of the first byte)
const LONG_TYPE_INITIAL: u8 = 0x0;
const LONG_TYPE_RETRY: u8 = 0x3;

/// One incoming packet, cut out of a (possibly coalesced) datagram
///
/// `data` is a cheap slice of the caller's datagram buffer; handing the
/// record to a connection clones the handle, not the bytes.
#[derive(Debug, Clone)]
pub struct PacketIn {
    /// Exactly this packet's bytes
    pub data: Bytes,
    /// Destination CID parsed from the header, when the header carries one
    pub dcid: Option<ConnectionId>,
    /// When the datagram was received
    pub received: Instant,
    /// ECN codepoint observed on the datagram
    pub ecn: Option<EcnCodepoint>,
    /// Whether the packet had a long header
    pub long_header: bool,
    /// Whether the packet uses the legacy gQUIC header layout
    pub gquic: bool,
    /// Whether this is a legacy gQUIC public reset
    pub gquic_prst: bool,
    /// Version field, for long headers that carry one
    pub version: Option<u32>,
}

/// Result of parsing one packet header out of a datagram
#[derive(Debug, Clone)]
pub(crate) struct ParsedHeader {
    /// Total size of this packet within the datagram
    pub(crate) len: usize,
    pub(crate) dcid: Option<ConnectionId>,
    pub(crate) long_header: bool,
    pub(crate) gquic: bool,
    pub(crate) gquic_prst: bool,
    pub(crate) version: Option<u32>,
}

/// Error parsing a packet header
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum ParseError {
    /// The buffer ends before the header (or the length it declares) does
    #[error("packet truncated mid-header")]
    Truncated,
    /// A header field holds a value the parser cannot accept
    #[error("malformed packet header")]
    Malformed,
}

/// Header parser, selected per QUIC version
///
/// `Generic` sniffs the version family from the first byte and is used
/// whenever the engine cannot know the version in advance. The others are
/// selected from a connection's negotiated version when the engine routes
/// by address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParserKind {
    Generic,
    Ietf,
    LegacyQ044,
    LegacyGquic,
}

impl ParserKind {
    /// Parser matching a connection's negotiated version
    pub fn for_version(version: QuicVersion) -> Self {
        match version {
            QuicVersion::Q043 => Self::LegacyGquic,
            QuicVersion::Q044 | QuicVersion::Q046 => Self::LegacyQ044,
            QuicVersion::V1 => Self::Ietf,
        }
    }

    /// Parse the first packet header in `data`
    ///
    /// Returns the header fields plus the packet's total length within the
    /// datagram, so the caller can step over it to the next coalesced
    /// packet.
    pub(crate) fn parse_begin(
        self,
        data: &[u8],
        is_server: bool,
        scid_len: u8,
    ) -> Result<ParsedHeader, ParseError> {
        let first = *data.first().ok_or(ParseError::Truncated)?;
        match self {
            Self::Ietf => parse_ietf(data, scid_len),
            Self::LegacyQ044 => parse_q044(data),
            Self::LegacyGquic => parse_gquic(data, is_server),
            Self::Generic => {
                if first & LONG_HEADER_FORM != 0 {
                    parse_ietf(data, scid_len)
                } else if first & 0x40 != 0 {
                    // IETF short headers keep the fixed bit set
                    parse_ietf(data, scid_len)
                } else {
                    parse_gquic(data, is_server)
                }
            }
        }
    }
}

fn parse_ietf(data: &[u8], scid_len: u8) -> Result<ParsedHeader, ParseError> {
    let first = *data.first().ok_or(ParseError::Truncated)?;
    if first & LONG_HEADER_FORM == 0 {
        // Short header: fixed-length DCID of the locally configured size,
        // never coalesced with a following packet
        let dcid_len = scid_len as usize;
        if data.len() < 1 + dcid_len {
            return Err(ParseError::Truncated);
        }
        let dcid = (dcid_len > 0).then(|| ConnectionId::new(&data[1..1 + dcid_len]));
        return Ok(ParsedHeader {
            len: data.len(),
            dcid,
            long_header: false,
            gquic: false,
            gquic_prst: false,
            version: None,
        });
    }

    if data.len() < 7 {
        return Err(ParseError::Truncated);
    }
    let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let dcid_len = data[5] as usize;
    if dcid_len > MAX_CID_SIZE {
        return Err(ParseError::Malformed);
    }
    let mut off = 6;
    if data.len() < off + dcid_len + 1 {
        return Err(ParseError::Truncated);
    }
    let dcid = (dcid_len > 0).then(|| ConnectionId::new(&data[off..off + dcid_len]));
    off += dcid_len;
    let scil = data[off] as usize;
    if scil > MAX_CID_SIZE {
        return Err(ParseError::Malformed);
    }
    off += 1 + scil;
    if data.len() < off {
        return Err(ParseError::Truncated);
    }

    let len = if version == 0 {
        // Version negotiation consumes the rest of the datagram
        data.len()
    } else {
        let long_type = (first >> 4) & 0x3;
        if long_type == LONG_TYPE_RETRY {
            data.len()
        } else {
            if long_type == LONG_TYPE_INITIAL {
                let (token_len, n) = varint(&data[off..])?;
                off += n;
                off = off
                    .checked_add(token_len as usize)
                    .ok_or(ParseError::Malformed)?;
                if data.len() < off {
                    return Err(ParseError::Truncated);
                }
            }
            let (length, n) = varint(&data[off..])?;
            off += n;
            let total = off
                .checked_add(length as usize)
                .ok_or(ParseError::Malformed)?;
            if total > data.len() {
                return Err(ParseError::Truncated);
            }
            total
        }
    };

    Ok(ParsedHeader {
        len,
        dcid,
        long_header: true,
        gquic: false,
        gquic_prst: false,
        version: Some(version),
    })
}

/// Transitional header layout: IETF shape but nibble-encoded CID lengths,
/// and no length field (packets are never coalesced)
fn parse_q044(data: &[u8]) -> Result<ParsedHeader, ParseError> {
    let first = *data.first().ok_or(ParseError::Truncated)?;
    if first & LONG_HEADER_FORM != 0 {
        if data.len() < 6 {
            return Err(ParseError::Truncated);
        }
        let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let mut dcid_len = (data[5] >> 4) as usize;
        if dcid_len > 0 {
            dcid_len += 3;
        }
        if data.len() < 6 + dcid_len {
            return Err(ParseError::Truncated);
        }
        let dcid = (dcid_len > 0).then(|| ConnectionId::new(&data[6..6 + dcid_len]));
        Ok(ParsedHeader {
            len: data.len(),
            dcid,
            long_header: true,
            gquic: false,
            gquic_prst: false,
            version: Some(version),
        })
    } else {
        // Short header: fixed 8-byte CID
        if data.len() < 9 {
            return Err(ParseError::Truncated);
        }
        Ok(ParsedHeader {
            len: data.len(),
            dcid: Some(ConnectionId::new(&data[1..9])),
            long_header: false,
            gquic: false,
            gquic_prst: false,
            version: None,
        })
    }
}

fn parse_gquic(data: &[u8], is_server: bool) -> Result<ParsedHeader, ParseError> {
    let flags = *data.first().ok_or(ParseError::Truncated)?;
    if flags & LONG_HEADER_FORM != 0 {
        return Err(ParseError::Malformed);
    }
    let mut off = 1;
    let dcid = if flags & GQUIC_FLAG_CID != 0 {
        if data.len() < off + 8 {
            return Err(ParseError::Truncated);
        }
        let cid = ConnectionId::new(&data[off..off + 8]);
        off += 8;
        Some(cid)
    } else {
        None
    };
    let version = if flags & GQUIC_FLAG_VERSION != 0 && is_server {
        // Clients echo the version after the CID
        if data.len() < off + 4 {
            return Err(ParseError::Truncated);
        }
        Some(u32::from_be_bytes([
            data[off],
            data[off + 1],
            data[off + 2],
            data[off + 3],
        ]))
    } else {
        None
    };
    Ok(ParsedHeader {
        len: data.len(),
        dcid,
        long_header: false,
        gquic: true,
        gquic_prst: flags & GQUIC_FLAG_RST != 0,
        version,
    })
}

/// Decode a QUIC variable-length integer, returning (value, encoded size)
pub(crate) fn varint(data: &[u8]) -> Result<(u64, usize), ParseError> {
    let first = *data.first().ok_or(ParseError::Truncated)?;
    let size = 1usize << (first >> 6);
    if data.len() < size {
        return Err(ParseError::Truncated);
    }
    let mut value = u64::from(first & 0x3f);
    for byte in &data[1..size] {
        value = value << 8 | u64::from(*byte);
    }
    Ok((value, size))
}
